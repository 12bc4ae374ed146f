use std::process::ExitCode;

/// Errors that cause foreman to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("daemon already running (state dir {0} is locked)")]
    AlreadyRunning(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::AlreadyRunning(_) => ExitCode::from(6),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_variant() {
        let codes = [
            ExitError::Config("x".into()).exit_code(),
            ExitError::ToolNotFound { tool: "gh".into() }.exit_code(),
            ExitError::ToolFailed {
                tool: "gh".into(),
                code: 1,
                message: String::new(),
            }
            .exit_code(),
            ExitError::Timeout {
                tool: "botty".into(),
                timeout_secs: 30,
            }
            .exit_code(),
            ExitError::AlreadyRunning(".foreman".into()).exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn timeout_message_names_tool() {
        let err = ExitError::Timeout {
            tool: "gh".into(),
            timeout_secs: 30,
        };
        assert_eq!(err.to_string(), "gh timed out after 30s");
    }
}

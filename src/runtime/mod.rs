//! Worker runtime adapter: spawning and observing opaque worker sessions.
//!
//! The supervisor only needs [`WorkerObservable`]; everything that changes a
//! session lives on [`WorkerRuntime`].

pub mod botty;
pub mod scripted;

use std::path::PathBuf;
use std::time::Duration;

use crate::model::Phase;

pub use botty::BottyRuntime;
pub use scripted::ScriptedRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("spawning {session} failed: {detail}")]
    SpawnFailed { session: String, detail: String },

    #[error("runtime call failed: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for RuntimeError {
    fn from(e: anyhow::Error) -> Self {
        RuntimeError::Backend(format!("{e:#}"))
    }
}

/// What the supervisor can see of a running session.
pub trait WorkerObservable: Send + Sync {
    /// Current visible output of the session (scrollback tail).
    fn latest_output(&self, session: &str) -> Result<String, RuntimeError>;

    fn is_alive(&self, session: &str) -> Result<bool, RuntimeError>;
}

pub trait WorkerRuntime: WorkerObservable {
    fn spawn(&self, spec: &SpawnSpec) -> Result<(), RuntimeError>;

    fn send_input(&self, session: &str, text: &str) -> Result<(), RuntimeError>;

    /// Kill a session. Killing one that already exited is not an error.
    fn kill(&self, session: &str) -> Result<(), RuntimeError>;

    /// Sessions the runtime currently reports as running.
    fn live_sessions(&self) -> Result<Vec<LiveSession>, RuntimeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub name: String,
    pub phase: Phase,
    pub item: u64,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSession {
    pub name: String,
    /// Item the session works on, when its name follows [`session_name`].
    pub item: Option<u64>,
}

/// Session name for one item in one phase: `<prefix>/<phase>-<item>`.
pub fn session_name(prefix: &str, phase: Phase, item: u64) -> String {
    format!("{prefix}/{phase}-{item}")
}

/// Inverse of [`session_name`]. Names outside `prefix` yield `None`.
pub fn parse_session_name(prefix: &str, name: &str) -> Option<(Phase, u64)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('/')?;
    let (phase, item) = rest.rsplit_once('-')?;
    Some((Phase::parse(phase)?, item.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_roundtrip() {
        let name = session_name("foreman", Phase::Build, 42);
        assert_eq!(name, "foreman/build-42");
        assert_eq!(parse_session_name("foreman", &name), Some((Phase::Build, 42)));
    }

    #[test]
    fn foreign_sessions_are_not_bound() {
        assert_eq!(parse_session_name("foreman", "other/build-42"), None);
        assert_eq!(parse_session_name("foreman", "foreman/deploy-1"), None);
        assert_eq!(parse_session_name("foreman", "foreman/build-x"), None);
        assert_eq!(parse_session_name("foreman", "foremanx/build-1"), None);
    }
}

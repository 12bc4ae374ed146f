use std::time::Duration;

use serde::Deserialize;

use crate::subprocess::Tool;

use super::{LiveSession, RuntimeError, SpawnSpec, WorkerObservable, WorkerRuntime, parse_session_name};

/// Worker sessions hosted by `botty` (PTY session manager).
pub struct BottyRuntime {
    prefix: String,
    tail_lines: u32,
    env_inherit: Option<String>,
    timeout: Duration,
}

impl BottyRuntime {
    pub fn new(prefix: &str, tail_lines: u32, env_inherit: Option<String>, timeout: Duration) -> Self {
        Self {
            prefix: prefix.to_string(),
            tail_lines,
            env_inherit,
            timeout,
        }
    }

    fn botty(&self) -> Tool {
        Tool::new("botty").timeout(self.timeout)
    }

    fn list(&self) -> Result<Vec<AgentJson>, RuntimeError> {
        let output = self.botty().args(&["list", "--format", "json"]).run_ok()?;
        Ok(parse_list(&output.stdout)?.agents)
    }

    /// Build the `botty spawn` invocation for a session.
    pub fn spawn_tool(&self, spec: &SpawnSpec) -> Tool {
        let mut tool = self.botty().arg("spawn");
        if let Some(vars) = &self.env_inherit {
            tool = tool.args(&["--env-inherit", vars.as_str()]);
        }
        tool = tool.args(&["--name", spec.name.as_str()]);
        let cwd = spec.cwd.as_ref().map(|p| p.to_string_lossy().into_owned());
        if let Some(cwd) = &cwd {
            tool = tool.args(&["--cwd", cwd.as_str()]);
        }
        let timeout = spec.timeout.as_secs().to_string();
        tool.args(&["--timeout", timeout.as_str(), "--"])
            .args_owned(spec.command.iter().cloned())
    }
}

impl WorkerObservable for BottyRuntime {
    fn latest_output(&self, session: &str) -> Result<String, RuntimeError> {
        let lines = self.tail_lines.to_string();
        let output = self
            .botty()
            .args(&["tail", session, "--lines", lines.as_str()])
            .run()?;
        if output.success() {
            Ok(output.stdout)
        } else if output.stderr.contains("not found") {
            Err(RuntimeError::NotFound(session.to_string()))
        } else {
            Err(RuntimeError::Backend(output.stderr.trim().to_string()))
        }
    }

    fn is_alive(&self, session: &str) -> Result<bool, RuntimeError> {
        Ok(self
            .list()?
            .iter()
            .any(|a| a.id() == Some(session) && a.is_running()))
    }
}

impl WorkerRuntime for BottyRuntime {
    fn spawn(&self, spec: &SpawnSpec) -> Result<(), RuntimeError> {
        let output = self.spawn_tool(spec).run()?;
        if output.success() {
            Ok(())
        } else {
            Err(RuntimeError::SpawnFailed {
                session: spec.name.clone(),
                detail: output.stderr.trim().to_string(),
            })
        }
    }

    fn send_input(&self, session: &str, text: &str) -> Result<(), RuntimeError> {
        self.botty().args(&["send", session, text]).run_ok()?;
        Ok(())
    }

    fn kill(&self, session: &str) -> Result<(), RuntimeError> {
        let output = self.botty().args(&["kill", session]).run()?;
        if output.success() || output.stderr.contains("not found") {
            Ok(())
        } else {
            Err(RuntimeError::Backend(output.stderr.trim().to_string()))
        }
    }

    fn live_sessions(&self) -> Result<Vec<LiveSession>, RuntimeError> {
        Ok(self
            .list()?
            .iter()
            .filter(|a| a.is_running())
            .filter_map(|a| a.id())
            .filter(|id| id.starts_with(&format!("{}/", self.prefix)))
            .map(|id| LiveSession {
                name: id.to_string(),
                item: parse_session_name(&self.prefix, id).map(|(_, item)| item),
            })
            .collect())
    }
}

// --- `botty list --format json` ---

#[derive(Debug, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub agents: Vec<AgentJson>,
}

#[derive(Debug, Deserialize)]
pub struct AgentJson {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl AgentJson {
    fn id(&self) -> Option<&str> {
        self.id.as_deref().or(self.name.as_deref())
    }

    /// Older botty builds omit `status`; listed means running there.
    fn is_running(&self) -> bool {
        self.status.as_deref().is_none_or(|s| s == "running")
    }
}

pub fn parse_list(json: &str) -> Result<ListResponse, RuntimeError> {
    serde_json::from_str(json)
        .map_err(|e| RuntimeError::Backend(format!("failed to parse botty list output: {e}")))
}

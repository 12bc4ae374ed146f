use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::model::Phase;
use crate::supervisor::stall::StallAction;

/// Config file name.
pub const CONFIG_TOML: &str = ".foreman.toml";

/// Find the config file in `dir`, if any.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let path = dir.join(CONFIG_TOML);
    path.exists().then_some(path)
}

/// Find config in the standard locations.
///
/// Priority order (highest first):
/// 1. An explicit `--config` path, which must exist
/// 2. Root `.foreman.toml`
/// 3. `ws/default/.foreman.toml` (maw bare repo layout)
///
/// Returns `None` when nothing is found; callers fall back to defaults.
pub fn find_config_in_project(explicit: Option<&Path>, root: &Path) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ExitError::Config(format!("config file {} does not exist", path.display())).into());
        }
        return Ok(Some(path.to_path_buf()));
    }
    Ok(find_config(root).or_else(|| find_config(&root.join("ws/default"))))
}

/// Top-level `.foreman.toml` config. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub runtime: RuntimeConfig,
    pub workspace: WorkspaceConfig,
    pub phases: PhasesConfig,
    pub supervisor: SupervisorConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub recovery: RecoveryConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TrackerConfig {
    /// `owner/repo`; defaults to the repository `gh` infers from the cwd.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub timeout_secs: u64,
    pub list_limit: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            repo: None,
            timeout_secs: 30,
            list_limit: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Prefix for session names (`<prefix>/<phase>-<item>`).
    pub session_prefix: String,
    /// Lines of output fetched per snapshot.
    pub tail_lines: u32,
    /// Comma-separated environment variables passed through to workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_inherit: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_prefix: "foreman".into(),
            tail_lines: 200,
            env_inherit: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceProvider {
    /// Workspaces managed by `maw ws`.
    #[default]
    Maw,
    /// Plain directories under the root.
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub provider: WorkspaceProvider,
    pub root: PathBuf,
    pub prefix: String,
    pub timeout_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            provider: WorkspaceProvider::Maw,
            root: PathBuf::from("."),
            prefix: "foreman".into(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PhaseConfig {
    pub enabled: bool,
    /// Worker command. Arguments are templates over `item`, `phase`,
    /// `role`, `workspace` and `session`.
    pub command: Vec<String>,
    /// Session timeout; each phase has its own default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_command(),
            timeout_secs: None,
        }
    }
}

fn default_command() -> Vec<String> {
    vec![
        "claude".into(),
        "--dangerously-skip-permissions".into(),
        "/foreman-{{ phase }} {{ item }}".into(),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PhasesConfig {
    pub intake: PhaseConfig,
    pub build: PhaseConfig,
    pub review: PhaseConfig,
    pub fix: PhaseConfig,
}

impl PhasesConfig {
    pub const fn get(&self, phase: Phase) -> &PhaseConfig {
        match phase {
            Phase::Intake => &self.intake,
            Phase::Build => &self.build,
            Phase::Review => &self.review,
            Phase::Fix => &self.fix,
        }
    }

    pub fn timeout(&self, phase: Phase) -> Duration {
        let default = match phase {
            Phase::Intake => 900,
            Phase::Build => 3600,
            Phase::Review => 1800,
            Phase::Fix => 2700,
        };
        Duration::from_secs(self.get(phase).timeout_secs.unwrap_or(default))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_secs: u64,
    /// Silence longer than this logs `stuck_warn`.
    pub stall_warning_secs: u64,
    /// Silence longer than this triggers `stall_action`.
    pub stall_critical_secs: u64,
    pub stall_action: StallAction,
    /// Text a worker prints when it believes its phase is done.
    pub completion_marker: String,
    /// How long a completion claim may stay unverified.
    pub claimed_done_grace_secs: u64,
    /// Silence that triggers one read-only contract check.
    pub idle_timeout_secs: u64,
    pub prompt: PromptConfig,
    pub contract: ContractCheckConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            stall_warning_secs: 600,
            stall_critical_secs: 1200,
            stall_action: StallAction::Restart,
            completion_marker: "<promise>COMPLETE</promise>".into(),
            claimed_done_grace_secs: 120,
            idle_timeout_secs: 300,
            prompt: PromptConfig::default(),
            contract: ContractCheckConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub const fn stall_warning(&self) -> Duration {
        Duration::from_secs(self.stall_warning_secs)
    }

    pub const fn stall_critical(&self) -> Duration {
        Duration::from_secs(self.stall_critical_secs)
    }

    pub const fn claimed_done_grace(&self) -> Duration {
        Duration::from_secs(self.claimed_done_grace_secs)
    }

    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PromptConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
    /// Continuous detection needed before the first recovery attempt.
    pub min_age_secs: u64,
    /// Minimum gap between recovery attempts.
    pub recovery_cooldown_secs: u64,
    /// Regex matched against the last non-empty output line.
    pub prompt_pattern: String,
    /// Regex that marks the worker as still busy.
    pub busy_pattern: String,
    /// First recovery attempt.
    pub nudge: String,
    /// Later recovery attempts.
    pub resend: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 10,
            min_age_secs: 30,
            recovery_cooldown_secs: 120,
            prompt_pattern: r"^\s*[>❯›]\s*$".into(),
            busy_pattern: r"(?i)esc to interrupt|thinking|running…".into(),
            nudge: "\n".into(),
            resend: "Continue with the task. Print <promise>COMPLETE</promise> when the phase is done.\n".into(),
        }
    }
}

impl PromptConfig {
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub const fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }

    pub const fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs)
    }
}

/// Timing of proactive contract checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ContractCheckConfig {
    pub initial_delay_secs: u64,
    pub long_interval_secs: u64,
    pub short_interval_secs: u64,
}

impl Default for ContractCheckConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 120,
            long_interval_secs: 300,
            short_interval_secs: 60,
        }
    }
}

impl ContractCheckConfig {
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub const fn long_interval(&self) -> Duration {
        Duration::from_secs(self.long_interval_secs)
    }

    pub const fn short_interval(&self) -> Duration {
        Duration::from_secs(self.short_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetryConfig {
    pub base_secs: u64,
    pub multiplier: f64,
    pub max_cooldown_secs: u64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: 60,
            multiplier: 2.0,
            max_cooldown_secs: 3600,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive same-class failures that trip the breaker.
    pub threshold: usize,
    /// Failure events kept in the ring buffer.
    pub window: usize,
    pub base_cooldown_secs: u64,
    /// Probe count past which each failed probe logs a warning.
    pub max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: 20,
            base_cooldown_secs: 600,
            max_probes: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Items updated more recently than this are never reclassified.
    pub grace_secs: u64,
    /// Work product idle longer than this is flagged for manual review.
    pub stale_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            grace_secs: 600,
            stale_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DaemonConfig {
    pub state_dir: PathBuf,
    pub max_concurrency: usize,
    pub iteration_interval_secs: u64,
    /// Run the orphan sweep every N iterations (in addition to startup).
    pub sweep_every: u64,
    pub max_archives: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".foreman"),
            max_concurrency: 3,
            iteration_interval_secs: 30,
            sweep_every: 10,
            max_archives: 10,
            max_iterations: None,
        }
    }
}

impl DaemonConfig {
    pub const fn iteration_interval(&self) -> Duration {
        Duration::from_secs(self.iteration_interval_secs)
    }
}

impl Config {
    /// Load config from a file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse_toml(&contents)
    }

    /// Load from the standard locations, or defaults when none exists.
    pub fn discover(explicit: Option<&Path>, root: &Path) -> anyhow::Result<Self> {
        let config = match find_config_in_project(explicit, root)? {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load(&path)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.supervisor;
        if s.stall_warning_secs >= s.stall_critical_secs {
            return Err(ExitError::Config(format!(
                "supervisor.stall_warning_secs ({}) must be below stall_critical_secs ({})",
                s.stall_warning_secs, s.stall_critical_secs
            ))
            .into());
        }
        for (key, pattern) in [
            ("prompt_pattern", &s.prompt.prompt_pattern),
            ("busy_pattern", &s.prompt.busy_pattern),
        ] {
            regex::Regex::new(pattern)
                .map_err(|e| ExitError::Config(format!("supervisor.prompt.{key} is not a valid regex: {e}")))?;
        }
        if s.poll_interval_secs == 0 {
            return Err(ExitError::Config("supervisor.poll_interval_secs must be positive".into()).into());
        }
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(ExitError::Config("retry.multiplier must be a finite number >= 1".into()).into());
        }
        if self.breaker.threshold == 0 || self.breaker.window < self.breaker.threshold {
            return Err(ExitError::Config("breaker.window must be at least breaker.threshold, which must be positive".into()).into());
        }
        if self.daemon.max_concurrency == 0 {
            return Err(ExitError::Config("daemon.max_concurrency must be positive".into()).into());
        }
        for phase in Phase::ALL {
            let pc = self.phases.get(phase);
            if pc.enabled && pc.command.is_empty() {
                return Err(ExitError::Config(format!("phases.{phase}.command is empty")).into());
            }
        }
        Ok(())
    }

    /// Serialize config to a TOML string with section comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(toml_edit::Item::as_table_mut) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;
        let mut doc: toml_edit::DocumentMut = raw.parse().context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# foreman configuration\n# Run `foreman schema` for the full JSON Schema.\n\n");

        set_table_comment(&mut doc, "tracker", "\n# Issue tracker (GitHub via gh)\n");
        set_table_comment(&mut doc, "runtime", "\n# Worker sessions (botty)\n");
        set_table_comment(&mut doc, "workspace", "\n# Per-item workspaces for build and fix\n");
        set_table_comment(
            &mut doc,
            "phases",
            "\n# Worker command per phase; arguments are minijinja templates\n",
        );
        set_table_comment(&mut doc, "supervisor", "\n# Stall, completion and prompt detection\n");
        set_table_comment(&mut doc, "retry", "\n# Per-item exponential backoff\n");
        set_table_comment(&mut doc, "breaker", "\n# Fleet-wide circuit breaker\n");
        set_table_comment(&mut doc, "recovery", "\n# Orphaned in-progress items\n");
        set_table_comment(&mut doc, "daemon", "\n# Control loop\n");

        Ok(doc.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[tracker]
repo = "acme/widgets"

[phases.build]
command = ["worker", "{{ item }}"]
timeout_secs = 600

[supervisor]
stall_action = "pause"

[supervisor.prompt]
enabled = false

[retry]
max_retries = 5
"#;
        let config = Config::parse_toml(toml_str).unwrap();
        assert_eq!(config.tracker.repo.as_deref(), Some("acme/widgets"));
        assert_eq!(config.tracker.timeout_secs, 30);
        assert_eq!(config.phases.build.command, vec!["worker", "{{ item }}"]);
        assert_eq!(config.phases.timeout(Phase::Build), Duration::from_secs(600));
        assert_eq!(config.phases.timeout(Phase::Review), Duration::from_secs(1800));
        assert_eq!(config.supervisor.stall_action, StallAction::Pause);
        assert!(!config.supervisor.prompt.enabled);
        assert_eq!(config.supervisor.prompt.check_interval_secs, 10);
        assert_eq!(config.retry.max_retries, 5);
        assert!((config.retry.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_malformed_toml() {
        let err = Config::parse_toml("[daemon\nmax_concurrency = 2").unwrap_err();
        assert!(err.downcast_ref::<ExitError>().is_some());
    }

    #[test]
    fn unknown_stall_action_is_rejected() {
        assert!(Config::parse_toml("[supervisor]\nstall_action = \"explode\"").is_err());
    }

    #[test]
    fn validate_rejects_inverted_stall_thresholds() {
        let mut config = Config::default();
        config.supervisor.stall_warning_secs = 900;
        config.supervisor.stall_critical_secs = 600;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stall_warning_secs"));
    }

    #[test]
    fn validate_rejects_bad_prompt_regex() {
        let mut config = Config::default();
        config.supervisor.prompt.busy_pattern = "(unclosed".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_prompt_pattern_matches_common_prompts() {
        let re = regex::Regex::new(&PromptConfig::default().prompt_pattern).unwrap();
        assert!(re.is_match("> "));
        assert!(re.is_match("❯"));
        assert!(!re.is_match("> some text"));
    }

    #[test]
    fn roundtrip_toml_keeps_values_and_comments() {
        let mut config = Config::default();
        config.tracker.repo = Some("acme/widgets".into());
        config.daemon.max_concurrency = 7;
        let output = config.to_toml().unwrap();
        assert!(output.starts_with("# foreman configuration"));
        assert!(output.contains("# Fleet-wide circuit breaker"));
        let config2 = Config::parse_toml(&output).unwrap();
        assert_eq!(config, config2);
    }

    #[test]
    fn find_config_prefers_root_over_ws_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ws/default")).unwrap();
        std::fs::write(dir.path().join("ws/default").join(CONFIG_TOML), "").unwrap();
        let found = find_config_in_project(None, dir.path()).unwrap().unwrap();
        assert!(found.starts_with(dir.path().join("ws/default")));

        std::fs::write(dir.path().join(CONFIG_TOML), "").unwrap();
        let found = find_config_in_project(None, dir.path()).unwrap().unwrap();
        assert_eq!(found, dir.path().join(CONFIG_TOML));
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(find_config_in_project(Some(&missing), dir.path()).is_err());
        assert!(find_config_in_project(None, dir.path()).unwrap().is_none());
    }
}

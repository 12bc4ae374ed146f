//! Per-session supervision loop.
//!
//! One [`Supervisor::supervise`] call owns one worker session from spawn to
//! a single terminal [`SupervisionResult`]. It never touches daemon state:
//! the control loop reads the result and decides what happens to the item.

pub mod cadence;
pub mod prompt;
pub mod stall;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::{Clock, elapsed_between, to_chrono};
use crate::config::SupervisorConfig;
use crate::contract::{ContractOutcome, ContractValidator, ValidationMode};
use crate::failure::ErrorClass;
use crate::model::{Phase, PhaseRefs};
use crate::runtime::{RuntimeError, WorkerRuntime};
use crate::signals::SignalStore;

use self::cadence::AdaptiveCadence;
use self::prompt::{PromptDetector, PromptGate, PromptStep, PromptWatch};
use self::stall::{StallAction, StallLevel, StallThresholds};

/// Characters of output kept for completion-marker search and reporting.
pub const OUTPUT_TAIL_CHARS: usize = 1000;

/// Longest single sleep, so stop and abort are noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Spawning,
    Running,
    StuckWarn,
    StuckCritical,
    Completed,
    TimedOut,
    Errored,
    SignaledStop,
}

/// One item's session, as handed to a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub session: String,
    pub phase: Phase,
    pub item: u64,
    pub refs: PhaseRefs,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionResult {
    pub session: String,
    pub phase: Phase,
    pub item: u64,
    pub status: SessionStatus,
    pub reason: String,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class_hint: Option<ErrorClass>,
    /// Stall action taken, for `StuckCritical` results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall_action: Option<StallAction>,
    /// Silence crossed the warning threshold at some point.
    #[serde(default)]
    pub stall_warned: bool,
    #[serde(default)]
    pub output_tail: String,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Shared collaborators for every supervisor in the daemon.
#[derive(Clone)]
pub struct Supervisor {
    runtime: Arc<dyn WorkerRuntime>,
    validator: ContractValidator,
    signals: SignalStore,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
    detector: Arc<PromptDetector>,
}

/// Last `max` characters of `s`, respecting char boundaries.
pub fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    s.char_indices().nth(skip).map_or("", |(i, _)| &s[i..])
}

fn hash_output(output: &str) -> [u8; 32] {
    Sha256::digest(output.as_bytes()).into()
}

/// Mutable bookkeeping for one supervised session.
struct Tracking {
    started_at: DateTime<Utc>,
    last_hash: Option<[u8; 32]>,
    last_progress_at: DateTime<Utc>,
    last_output: String,
    status: SessionStatus,
    critical_logged: bool,
    stall_warned: bool,
    claimed_at: Option<DateTime<Utc>>,
    idle_check_armed: bool,
    next_poll: DateTime<Utc>,
    next_prompt_check: DateTime<Utc>,
    next_contract_check: Duration,
    prompt: PromptWatch,
}

enum Tick {
    Continue,
    Done(SupervisionResult),
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        validator: ContractValidator,
        signals: SignalStore,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
        detector: Arc<PromptDetector>,
    ) -> Self {
        Self {
            runtime,
            validator,
            signals,
            clock,
            config,
            detector,
        }
    }

    fn cadence(&self) -> AdaptiveCadence {
        AdaptiveCadence {
            initial_delay: self.config.contract.initial_delay(),
            long_interval: self.config.contract.long_interval(),
            short_interval: self.config.contract.short_interval(),
        }
    }

    /// Supervise one session until it reaches a terminal condition.
    pub fn supervise(&self, a: &Assignment) -> SupervisionResult {
        let span = tracing::info_span!("supervise", item = a.item, phase = %a.phase, session = %a.session);
        let _guard = span.enter();

        let now = self.clock.now();
        let mut t = Tracking {
            started_at: now,
            last_hash: None,
            last_progress_at: now,
            last_output: String::new(),
            status: SessionStatus::Running,
            critical_logged: false,
            stall_warned: false,
            claimed_at: None,
            idle_check_armed: true,
            next_poll: now,
            next_prompt_check: now + to_chrono(self.config.prompt.check_interval()),
            next_contract_check: self.cadence().first_check(),
            prompt: PromptWatch::default(),
        };
        tracing::info!(timeout = ?a.timeout, "supervising worker session");

        loop {
            if self.signals.stop_requested() {
                tracing::info!("stop requested, leaving session running");
                return self.finish(a, &t, SessionStatus::SignaledStop, "daemon stopping", None, false);
            }
            if self.signals.aborted(a.item) {
                tracing::warn!("item aborted by operator");
                return self.finish(a, &t, SessionStatus::SignaledStop, "aborted by operator", None, true);
            }

            let now = self.clock.now();
            let poll_due = now >= t.next_poll;
            let prompt_due = self.config.prompt.enabled && now >= t.next_prompt_check;

            if poll_due || prompt_due {
                let alive = match self.observe(a, &mut t, now) {
                    Ok(alive) => alive,
                    Err(e) => {
                        tracing::warn!(error = %e, "could not read session output");
                        true
                    }
                };
                if !alive {
                    return self.on_exit(a, &t);
                }
            }

            if poll_due {
                t.next_poll = now + to_chrono(self.config.poll_interval());
                if let Tick::Done(result) = self.poll(a, &mut t, now) {
                    return result;
                }
            }

            if prompt_due {
                t.next_prompt_check = now + to_chrono(self.config.prompt.check_interval());
                self.prompt_check(a, &mut t, now);
            }

            let elapsed = elapsed_between(t.started_at, now);
            if elapsed >= a.timeout {
                tracing::warn!(elapsed = ?elapsed, "session timed out");
                let class = ErrorClass::stuck(a.phase);
                return self.finish(a, &t, SessionStatus::TimedOut, "timed out", Some(class), true);
            }

            let mut wake = t.next_poll.min(t.started_at + to_chrono(a.timeout));
            if self.config.prompt.enabled {
                wake = wake.min(t.next_prompt_check);
            }
            let wait = elapsed_between(self.clock.now(), wake).clamp(Duration::from_millis(1), SLEEP_SLICE);
            self.clock.sleep(wait);
        }
    }

    /// Snapshot output, track progress. Returns whether the session is alive.
    fn observe(&self, a: &Assignment, t: &mut Tracking, now: DateTime<Utc>) -> Result<bool, RuntimeError> {
        let output = match self.runtime.latest_output(&a.session) {
            Ok(output) => output,
            Err(RuntimeError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let hash = hash_output(&output);
        if t.last_hash != Some(hash) {
            if t.last_hash.is_some() {
                t.idle_check_armed = true;
                if t.status != SessionStatus::Running {
                    tracing::info!("session making progress again");
                }
                t.status = SessionStatus::Running;
                t.critical_logged = false;
            }
            t.last_hash = Some(hash);
            t.last_progress_at = now;
        }
        t.last_output = output;
        self.runtime.is_alive(&a.session)
    }

    fn poll(&self, a: &Assignment, t: &mut Tracking, now: DateTime<Utc>) -> Tick {
        let elapsed = elapsed_between(t.started_at, now);
        let tail = tail_chars(&t.last_output, OUTPUT_TAIL_CHARS);

        // (a) Completion marker, reconciled with one authoritative check.
        if t.claimed_at.is_none() && tail.contains(&self.config.completion_marker) {
            tracing::info!("worker claims completion");
            match self.validate(a, ValidationMode::Normal) {
                Some(outcome) if outcome.is_satisfied() => {
                    return Tick::Done(self.completed(a, t, &outcome, "completion marker"));
                }
                Some(outcome) => {
                    tracing::warn!(%outcome, "completion claimed but contract not satisfied");
                    t.claimed_at = Some(now);
                }
                None => t.claimed_at = Some(now),
            }
            return Tick::Continue;
        }

        if let Some(claimed) = t.claimed_at {
            if elapsed_between(claimed, now) >= self.config.claimed_done_grace() {
                let outcome = self.validate(a, ValidationMode::Normal);
                if let Some(outcome) = outcome.filter(ContractOutcome::is_satisfied) {
                    return Tick::Done(self.completed(a, t, &outcome, "completion marker"));
                }
                tracing::warn!("completion claim not honoured within grace period");
                return Tick::Done(self.finish(
                    a,
                    t,
                    SessionStatus::Errored,
                    "claimed completion but contract unsatisfied",
                    Some(ErrorClass::ContractUnsatisfied),
                    true,
                ));
            }
            if let Some(outcome) = self.validate(a, ValidationMode::CheckOnly).filter(ContractOutcome::is_satisfied) {
                return Tick::Done(self.completed(a, t, &outcome, "completion marker"));
            }
        }

        // (b) Proactive checks on the adaptive cadence.
        let cadence = self.cadence();
        if elapsed >= t.next_contract_check {
            let outcome = self.validate(a, ValidationMode::CheckOnly);
            t.next_contract_check = elapsed + cadence.interval_at(elapsed, a.timeout).unwrap_or(cadence.long_interval);
            if let Some(outcome) = outcome.filter(ContractOutcome::is_satisfied) {
                return Tick::Done(self.completed(a, t, &outcome, "proactive contract check"));
            }
        }

        // (c) One check per silent stretch.
        let idle = elapsed_between(t.last_progress_at, now);
        if t.idle_check_armed && idle >= self.config.idle_timeout() {
            t.idle_check_armed = false;
            if let Some(outcome) = self.validate(a, ValidationMode::CheckOnly).filter(ContractOutcome::is_satisfied) {
                return Tick::Done(self.completed(a, t, &outcome, "idle contract check"));
            }
        }

        self.stall(a, t, idle)
    }

    fn stall(&self, a: &Assignment, t: &mut Tracking, idle: Duration) -> Tick {
        let thresholds = StallThresholds {
            warning: self.config.stall_warning(),
            critical: self.config.stall_critical(),
        };
        match stall::classify(idle, &thresholds) {
            StallLevel::Active => {}
            StallLevel::Warn => {
                if t.status == SessionStatus::Running {
                    tracing::warn!(idle = ?idle, "worker stalled (stuck_warn)");
                    t.status = SessionStatus::StuckWarn;
                    t.stall_warned = true;
                }
            }
            StallLevel::Critical => {
                t.status = SessionStatus::StuckCritical;
                t.stall_warned = true;
                let action = self.config.stall_action;
                match action {
                    StallAction::Warn => {
                        if !t.critical_logged {
                            tracing::error!(idle = ?idle, "worker stalled past critical threshold (stuck_critical)");
                            t.critical_logged = true;
                        }
                    }
                    StallAction::Pause => {
                        tracing::error!(idle = ?idle, "worker stalled past critical threshold, pausing item");
                        let reason = format!("stalled for {}s", idle.as_secs());
                        if let Err(e) = self.signals.pause(a.item, &reason) {
                            tracing::warn!(error = %e, "could not write pause marker");
                        }
                        let mut result = self.finish(a, t, SessionStatus::StuckCritical, &reason, None, true);
                        result.stall_action = Some(action);
                        return Tick::Done(result);
                    }
                    StallAction::Restart | StallAction::Retry => {
                        tracing::error!(idle = ?idle, %action, "worker stalled past critical threshold, ending session");
                        let reason = format!("stalled for {}s", idle.as_secs());
                        let mut result = self.finish(
                            a,
                            t,
                            SessionStatus::StuckCritical,
                            &reason,
                            Some(ErrorClass::stuck(a.phase)),
                            true,
                        );
                        result.stall_action = Some(action);
                        return Tick::Done(result);
                    }
                }
            }
        }
        Tick::Continue
    }

    fn prompt_check(&self, a: &Assignment, t: &mut Tracking, now: DateTime<Utc>) {
        let idle_at_prompt = self.detector.is_idle_at_prompt(&t.last_output);
        let gate = PromptGate {
            min_age: self.config.prompt.min_age(),
            cooldown: self.config.prompt.recovery_cooldown(),
        };
        let hash = t.last_hash.unwrap_or_default();
        let text = match t.prompt.observe(idle_at_prompt, hash, now, &gate) {
            PromptStep::Wait => return,
            PromptStep::Recovered => {
                tracing::info!("worker resumed after prompt recovery");
                t.last_progress_at = now;
                t.status = SessionStatus::Running;
                t.critical_logged = false;
                return;
            }
            PromptStep::Nudge => &self.config.prompt.nudge,
            PromptStep::Resend => &self.config.prompt.resend,
        };
        tracing::info!(attempt = t.prompt.attempts(), "worker idle at prompt, sending input");
        if let Err(e) = self.runtime.send_input(&a.session, text) {
            tracing::warn!(error = %e, "prompt recovery input failed");
        }
    }

    /// Session is gone: one last authoritative check decides the outcome.
    fn on_exit(&self, a: &Assignment, t: &Tracking) -> SupervisionResult {
        tracing::info!("worker session exited");
        match self.validate(a, ValidationMode::Normal) {
            Some(outcome) if outcome.is_satisfied() => self.completed(a, t, &outcome, "session exit"),
            _ => {
                let class = if t.claimed_at.is_some() {
                    ErrorClass::ContractUnsatisfied
                } else {
                    ErrorClass::WorkerCrashed
                };
                self.finish(a, t, SessionStatus::Errored, "session exited without meeting contract", Some(class), false)
            }
        }
    }

    /// Run the validator; store errors are logged and read as "unknown".
    fn validate(&self, a: &Assignment, mode: ValidationMode) -> Option<ContractOutcome> {
        match self.validator.validate(a.phase, a.item, &a.refs, mode) {
            Ok(outcome) => {
                tracing::debug!(?mode, %outcome, "contract check");
                Some(outcome)
            }
            Err(e) => {
                tracing::warn!(?mode, error = %e, "contract check failed");
                None
            }
        }
    }

    fn completed(&self, a: &Assignment, t: &Tracking, outcome: &ContractOutcome, via: &str) -> SupervisionResult {
        tracing::info!(%outcome, via, "phase contract satisfied");
        self.finish(a, t, SessionStatus::Completed, &format!("{via}: {outcome}"), None, true)
    }

    fn finish(
        &self,
        a: &Assignment,
        t: &Tracking,
        status: SessionStatus,
        reason: &str,
        error_class_hint: Option<ErrorClass>,
        kill: bool,
    ) -> SupervisionResult {
        if kill && let Err(e) = self.runtime.kill(&a.session) {
            tracing::warn!(error = %e, "failed to kill session");
        }
        SupervisionResult {
            session: a.session.clone(),
            phase: a.phase,
            item: a.item,
            status,
            reason: reason.to_string(),
            elapsed: elapsed_between(t.started_at, self.clock.now()),
            error_class_hint,
            stall_action: None,
            stall_warned: t.stall_warned,
            output_tail: tail_chars(&t.last_output, OUTPUT_TAIL_CHARS).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::runtime::scripted::Script;
    use crate::runtime::{ScriptedRuntime, SpawnSpec};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    struct Harness {
        store: Arc<MemoryStore>,
        runtime: Arc<ScriptedRuntime>,
        signals: SignalStore,
        clock: Arc<ManualClock>,
        supervisor: Supervisor,
        _dir: tempfile::TempDir,
    }

    fn harness(configure: impl FnOnce(&mut SupervisorConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let runtime = Arc::new(ScriptedRuntime::new());
        let signals = SignalStore::new(dir.path());
        let mut config = Config::default().supervisor;
        configure(&mut config);
        let detector = Arc::new(
            PromptDetector::new(&config.prompt.prompt_pattern, &config.prompt.busy_pattern).unwrap(),
        );
        let supervisor = Supervisor::new(
            runtime.clone(),
            ContractValidator::new(store.clone()),
            signals.clone(),
            clock.clone(),
            config,
            detector,
        );
        Harness {
            store,
            runtime,
            signals,
            clock,
            supervisor,
            _dir: dir,
        }
    }

    fn start(h: &Harness, item: u64, script: Script, timeout: Duration) -> Assignment {
        h.store.add_issue(item, "task", &["building"]);
        h.runtime.script(item, script);
        let session = format!("foreman/build-{item}");
        h.runtime
            .spawn(&SpawnSpec {
                name: session.clone(),
                phase: Phase::Build,
                item,
                command: vec!["worker".into()],
                cwd: None,
                timeout,
            })
            .unwrap();
        Assignment {
            session,
            phase: Phase::Build,
            item,
            refs: PhaseRefs {
                issue: Some(item),
                ..PhaseRefs::default()
            },
            timeout,
        }
    }

    /// A script whose output changes on every poll for `n` polls.
    fn busy_frames(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("step {i}")).collect()
    }

    #[test]
    fn tail_chars_respects_boundaries() {
        assert_eq!(tail_chars("héllo", 3), "llo");
        assert_eq!(tail_chars("hé", 5), "hé");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }

    #[test]
    fn marker_with_satisfied_contract_completes() {
        let h = harness(|_| {});
        let store = h.store.clone();
        let script = Script::frames(["working", "done <promise>COMPLETE</promise>"]).on_spawn(move |spec| {
            store.add_pull_request(100, "pr", &["review-requested"], Some(spec.item), "abc");
        });
        let a = start(&h, 1, script, Duration::from_secs(3600));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::Completed, "{result:?}");
        assert!(result.reason.contains("completion marker"));
        assert!(h.runtime.killed().contains(&a.session));
    }

    #[test]
    fn unhonoured_claim_errors_after_grace() {
        let h = harness(|c| c.claimed_done_grace_secs = 60);
        let a = start(&h, 1, Script::frames(["<promise>COMPLETE</promise>"]), Duration::from_secs(3600));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::Errored);
        assert_eq!(result.error_class_hint, Some(ErrorClass::ContractUnsatisfied));
        assert!(result.elapsed >= Duration::from_secs(60));
        assert!(result.elapsed < Duration::from_secs(120));
    }

    #[test]
    fn stall_between_warning_and_critical_keeps_waiting() {
        let h = harness(|c| {
            c.stall_warning_secs = 60;
            c.stall_critical_secs = 600;
            c.stall_action = StallAction::Restart;
            c.prompt.enabled = false;
        });
        // Silent for the whole run; the session outlives the warning
        // threshold and the timeout ends it before critical.
        let a = start(&h, 1, Script::frames(["quiet"]), Duration::from_secs(300));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::TimedOut);
        assert!(result.stall_warned);
        assert_eq!(result.error_class_hint, Some(ErrorClass::BuilderStuck));
        assert!(result.elapsed >= Duration::from_secs(300));
        assert_eq!(h.runtime.killed(), vec![a.session.clone()]);
    }

    #[test]
    fn critical_stall_with_restart_kills_and_returns() {
        let h = harness(|c| {
            c.stall_warning_secs = 30;
            c.stall_critical_secs = 90;
            c.stall_action = StallAction::Restart;
            c.prompt.enabled = false;
        });
        let a = start(&h, 1, Script::frames(["quiet"]), Duration::from_secs(3600));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::StuckCritical);
        assert_eq!(result.stall_action, Some(StallAction::Restart));
        assert_eq!(result.error_class_hint, Some(ErrorClass::BuilderStuck));
        assert!(h.runtime.killed().contains(&a.session));
    }

    #[test]
    fn critical_stall_with_pause_writes_marker() {
        let h = harness(|c| {
            c.stall_warning_secs = 30;
            c.stall_critical_secs = 90;
            c.stall_action = StallAction::Pause;
            c.prompt.enabled = false;
        });
        let a = start(&h, 1, Script::frames(["quiet"]), Duration::from_secs(3600));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.stall_action, Some(StallAction::Pause));
        assert!(h.signals.paused(1));
    }

    #[test]
    fn progress_resets_stall_clock() {
        let h = harness(|c| {
            c.poll_interval_secs = 10;
            c.stall_warning_secs = 30;
            c.stall_critical_secs = 50;
            c.stall_action = StallAction::Restart;
            c.prompt.enabled = false;
        });
        let frames = busy_frames(20);
        let a = start(&h, 1, Script::frames(frames.iter().map(String::as_str)), Duration::from_secs(3600));

        let result = h.supervisor.supervise(&a);
        // 20 changing frames at 10s each keep it alive for ~190s before the
        // last frame repeats and the stall clock runs out.
        assert_eq!(result.status, SessionStatus::StuckCritical);
        assert!(result.elapsed >= Duration::from_secs(240), "{:?}", result.elapsed);
    }

    #[test]
    fn exit_without_contract_is_worker_crash() {
        let h = harness(|_| {});
        let a = start(&h, 1, Script::frames(["boom"]).exit_after(2), Duration::from_secs(3600));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::Errored);
        assert_eq!(result.error_class_hint, Some(ErrorClass::WorkerCrashed));
        assert!(!h.runtime.killed().contains(&a.session));
    }

    #[test]
    fn exit_with_contract_met_completes() {
        let h = harness(|_| {});
        let store = h.store.clone();
        let script = Script::frames(["pushed"]).exit_after(1).on_spawn(move |spec| {
            store.add_pull_request(100, "pr", &[], Some(spec.item), "abc");
            store.set_draft(100, true);
        });
        let a = start(&h, 1, script, Duration::from_secs(3600));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::Completed, "{result:?}");
        assert!(result.reason.contains("recovered"));
    }

    #[test]
    fn proactive_check_detects_silent_completion() {
        let h = harness(|c| {
            c.contract.initial_delay_secs = 120;
            c.idle_timeout_secs = 100_000;
            c.stall_warning_secs = 100_000;
            c.stall_critical_secs = 200_000;
            c.prompt.enabled = false;
        });
        let store = h.store.clone();
        let frames = busy_frames(500);
        let script = Script::frames(frames.iter().map(String::as_str)).on_spawn(move |spec| {
            store.add_pull_request(100, "pr", &["review-requested"], Some(spec.item), "abc");
        });
        let a = start(&h, 1, script, Duration::from_secs(3600));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::Completed);
        assert!(result.reason.contains("proactive"));
        assert!(result.elapsed >= Duration::from_secs(120));
    }

    #[test]
    fn idle_check_detects_completion_before_cadence() {
        let h = harness(|c| {
            c.contract.initial_delay_secs = 100_000;
            c.idle_timeout_secs = 60;
            c.prompt.enabled = false;
        });
        let store = h.store.clone();
        let script = Script::frames(["wrote the PR"]).on_spawn(move |spec| {
            store.add_pull_request(100, "pr", &["review-requested"], Some(spec.item), "abc");
        });
        let a = start(&h, 1, script, Duration::from_secs(3600));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::Completed);
        assert!(result.reason.contains("idle"));
    }

    #[test]
    fn global_stop_leaves_session_running() {
        let h = harness(|_| {});
        let a = start(&h, 1, Script::silent(), Duration::from_secs(3600));
        h.signals.request_stop();

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::SignaledStop);
        assert!(h.runtime.killed().is_empty());
        assert_eq!(h.store.write_count(), 0);
    }

    #[test]
    fn item_abort_kills_session() {
        let h = harness(|_| {});
        let a = start(&h, 1, Script::silent(), Duration::from_secs(3600));
        h.signals.abort(1).unwrap();

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::SignaledStop);
        assert_eq!(h.runtime.killed(), vec![a.session.clone()]);
    }

    #[test]
    fn idle_prompt_gets_nudged() {
        let h = harness(|c| {
            c.poll_interval_secs = 15;
            c.stall_warning_secs = 100_000;
            c.stall_critical_secs = 200_000;
            c.prompt.check_interval_secs = 10;
            c.prompt.min_age_secs = 30;
            c.prompt.recovery_cooldown_secs = 60;
        });
        let a = start(&h, 1, Script::frames(["did a thing\n> "]), Duration::from_secs(600));

        let result = h.supervisor.supervise(&a);
        assert_eq!(result.status, SessionStatus::TimedOut);
        let inputs = h.runtime.inputs(&a.session);
        assert!(inputs.len() >= 2, "{inputs:?}");
        assert_eq!(inputs[0], h.supervisor.config.prompt.nudge);
        assert_eq!(inputs[1], h.supervisor.config.prompt.resend);
        assert_eq!(h.clock.now(), Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 0).unwrap());
    }
}

//! The daemon control loop.
//!
//! One thread owns [`DaemonState`] and runs the iteration pipeline:
//! snapshot, reap finished sessions, check the breaker, recovery sweeps,
//! dispatch, persist. Each dispatched session gets its own supervisor
//! thread that reports a single [`SupervisionResult`] over a channel.

pub mod archive;
pub mod state;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::AuditNote;
use crate::breaker::{DispatchGate, FailureDetector, FailureEvent};
use crate::clock::{Clock, elapsed_between, to_chrono};
use crate::config::Config;
use crate::contract::ContractValidator;
use crate::error::ExitError;
use crate::failure::{self, ErrorClass, FailureKind, Verdict};
use crate::model::{ItemKind, LabelFilter, Lifecycle, Phase, PhaseRefs, PullRequestState};
use crate::recovery::{OrphanRecovery, SweepContext};
use crate::retry::{self, RetryManager, RetryPolicy};
use crate::runtime::{LiveSession, SpawnSpec, WorkerRuntime, session_name};
use crate::signals::SignalStore;
use crate::store::{self, StateStore, StoreError};
use crate::supervisor::prompt::PromptDetector;
use crate::supervisor::{Assignment, SessionStatus, SupervisionResult, Supervisor};
use crate::template::{CommandContext, render_command};
use crate::workspace::WorkspaceProvisioner;

use self::archive::Archiver;
use self::state::{DaemonState, InFlight, StateFile};

/// Present while a daemon runs against the state directory.
pub const LOCK_FILE: &str = "daemon.lock";

/// Longest single wait, so stop requests are noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// External systems the daemon drives.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn StateStore>,
    pub runtime: Arc<dyn WorkerRuntime>,
    pub workspaces: Arc<dyn WorkspaceProvisioner>,
    pub clock: Arc<dyn Clock>,
}

/// An item waiting in some phase's entry state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub phase: Phase,
    pub item: u64,
    pub title: String,
}

/// What the tracker and runtime looked like at the start of an iteration.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub candidates: Vec<Candidate>,
    pub live_sessions: Vec<LiveSession>,
    pub paused: Vec<u64>,
}

impl Snapshot {
    /// Put `first` ahead of every listed candidate.
    pub fn prepend(&mut self, first: Vec<Candidate>) {
        let rest = std::mem::replace(&mut self.candidates, first);
        self.candidates.extend(rest);
    }
}

/// Why a candidate was left out of a dispatch plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InFlight,
    Paused,
    Aborted,
    AwaitingRetry,
    SessionLive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub item: u64,
    pub phase: Phase,
    pub reason: SkipReason,
}

/// The dispatch decision for one iteration, before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchPlan {
    #[serde(serialize_with = "serialize_gate")]
    pub gate: DispatchGate,
    /// Sessions that may start this iteration.
    pub slots: usize,
    /// Eligible candidates in dispatch order; only the first `slots` start.
    pub eligible: Vec<Candidate>,
    pub skipped: Vec<Skipped>,
}

impl DispatchPlan {
    pub fn selected(&self) -> &[Candidate] {
        &self.eligible[..self.slots.min(self.eligible.len())]
    }
}

fn serialize_gate<S: serde::Serializer>(gate: &DispatchGate, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&gate_label(*gate))
}

pub fn gate_label(gate: DispatchGate) -> String {
    match gate {
        DispatchGate::Open => "open".into(),
        DispatchGate::Suppressed { until } => format!("suppressed until {}", until.to_rfc3339()),
        DispatchGate::Probe => "probe".into(),
        DispatchGate::ProbeInFlight => "probe in flight".into(),
    }
}

/// A failed attempt, from a finished session or a dispatch that never started.
#[derive(Debug, Clone)]
struct FailedAttempt {
    item: u64,
    phase: Phase,
    refs: PhaseRefs,
    class: ErrorClass,
    probe: bool,
}

enum DispatchOutcome {
    Started,
    /// Someone else moved the item first.
    Lost,
    Failed,
}

/// `daemon.lock` in the state directory, held for the life of `run`.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(state_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(state_dir).with_context(|| format!("creating {}", state_dir.display()))?;
        let path = state_dir.join(LOCK_FILE);
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                std::fs::write(&path, std::process::id().to_string())
                    .with_context(|| format!("writing {}", path.display()))?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ExitError::AlreadyRunning(state_dir.display().to_string()).into())
            }
            Err(e) => Err(e).with_context(|| format!("creating {}", path.display())),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

pub struct Daemon {
    config: Config,
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn WorkerRuntime>,
    workspaces: Arc<dyn WorkspaceProvisioner>,
    clock: Arc<dyn Clock>,
    signals: SignalStore,
    supervisor: Supervisor,
    retry: RetryManager,
    detector: FailureDetector,
    recovery: OrphanRecovery,
    state_file: StateFile,
    archiver: Archiver,
    tx: Sender<SupervisionResult>,
    rx: Receiver<SupervisionResult>,
    workers: HashMap<u64, JoinHandle<()>>,
}

impl Daemon {
    pub fn new(config: Config, backends: Backends, signals: SignalStore) -> anyhow::Result<Self> {
        let prompt = &config.supervisor.prompt;
        let detector = PromptDetector::new(&prompt.prompt_pattern, &prompt.busy_pattern)
            .map_err(|e| ExitError::Config(format!("invalid prompt pattern: {e}")))?;
        let supervisor = Supervisor::new(
            backends.runtime.clone(),
            ContractValidator::new(backends.store.clone()),
            signals.clone(),
            backends.clock.clone(),
            config.supervisor.clone(),
            Arc::new(detector),
        );
        let state_dir = config.daemon.state_dir.clone();
        let (tx, rx) = mpsc::channel();
        Ok(Self {
            retry: RetryManager::new(RetryPolicy::from_config(&config.retry), backends.store.clone()),
            detector: FailureDetector::new(&config.breaker),
            recovery: OrphanRecovery::new(backends.store.clone(), backends.workspaces.clone(), &config.recovery),
            state_file: StateFile::new(&state_dir),
            archiver: Archiver::new(&state_dir, config.daemon.max_archives),
            store: backends.store,
            runtime: backends.runtime,
            workspaces: backends.workspaces,
            clock: backends.clock,
            signals,
            supervisor,
            config,
            tx,
            rx,
            workers: HashMap::new(),
        })
    }

    /// Run until stopped, `max_iterations` is reached, or after one
    /// iteration when `once` is set. In-flight sessions are waited for,
    /// then the final state is persisted and archived.
    pub fn run(&mut self, once: bool) -> anyhow::Result<DaemonState> {
        let _lock = LockFile::acquire(&self.config.daemon.state_dir)?;
        let mut state = self.startup()?;
        loop {
            state = self.iterate(state)?;
            if once || self.signals.stop_requested() {
                break;
            }
            if let Some(max) = self.config.daemon.max_iterations
                && state.iteration >= max
            {
                tracing::info!(iterations = state.iteration, "iteration limit reached");
                break;
            }
            self.wait_for_next_iteration();
            if self.signals.stop_requested() {
                break;
            }
        }
        self.shutdown(state)
    }

    /// Archive the previous run, rebuild retry bookkeeping from the tracker,
    /// and sweep for orphans left by a crash.
    pub fn startup(&mut self) -> anyhow::Result<DaemonState> {
        let now = self.clock.now();
        if let Err(e) = self.archiver.rotate(now) {
            tracing::warn!(error = ?e, "could not archive previous daemon state");
        }
        let mut state = DaemonState::new(now);
        self.reconstruct_retries(&mut state);

        let snapshot = Snapshot {
            candidates: Vec::new(),
            live_sessions: self.live_sessions(),
            paused: self.signals.paused_items(),
        };
        self.sweep_orphans(&mut state, &snapshot, now);

        state.updated_at = Some(self.clock.now());
        self.state_file.save(&state)?;
        tracing::info!(
            retry_records = state.retries.len(),
            recovered = state.counters.recovered,
            "daemon started"
        );
        Ok(state)
    }

    /// One pass of the pipeline. The state goes in and comes back out so
    /// nothing else can hold on to it between iterations.
    pub fn iterate(&mut self, mut state: DaemonState) -> anyhow::Result<DaemonState> {
        state.iteration += 1;
        let span = tracing::info_span!("iteration", n = state.iteration);
        let _guard = span.enter();

        let mut snapshot = self.snapshot();
        self.reap(&mut state);

        let now = self.clock.now();
        match self.detector.gate(&state.breaker, now) {
            DispatchGate::Suppressed { until } => tracing::warn!(
                pattern = ?state.breaker.state.pattern,
                until = %until.to_rfc3339(),
                "dispatch suppressed by breaker"
            ),
            DispatchGate::ProbeInFlight => tracing::info!("waiting on breaker probe"),
            DispatchGate::Open | DispatchGate::Probe => {}
        }

        let sweep_every = self.config.daemon.sweep_every;
        if sweep_every > 0 && state.iteration % sweep_every == 0 {
            self.sweep_orphans(&mut state, &snapshot, now);
        }
        let retried = self.sweep_retries(&mut state, now);
        snapshot.prepend(retried);

        if self.signals.stop_requested() {
            tracing::info!("stop requested, skipping dispatch");
        } else {
            self.dispatch(&mut state, &snapshot);
        }

        state.updated_at = Some(self.clock.now());
        self.state_file.save(&state)?;
        tracing::debug!(
            in_flight = state.in_flight.len(),
            retry_records = state.retries.len(),
            "iteration done"
        );
        Ok(state)
    }

    /// Wait for every in-flight session to report.
    pub fn settle(&mut self, state: &mut DaemonState) {
        while !state.in_flight.is_empty() {
            match self.rx.recv_timeout(SLEEP_SLICE) {
                Ok(result) => self.settle_result(state, result),
                Err(RecvTimeoutError::Timeout) => self.reap(state),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn shutdown(&mut self, mut state: DaemonState) -> anyhow::Result<DaemonState> {
        if !state.in_flight.is_empty() {
            tracing::info!(in_flight = state.in_flight.len(), "waiting for supervised sessions");
        }
        self.settle(&mut state);
        state.updated_at = Some(self.clock.now());
        self.state_file.save(&state)?;
        self.archiver.rotate(self.clock.now())?;
        tracing::info!(
            iterations = state.iteration,
            dispatched = state.counters.dispatched,
            completed = state.counters.completed,
            failed = state.counters.failed,
            "daemon stopped"
        );
        Ok(state)
    }

    fn wait_for_next_iteration(&self) {
        let deadline = self.clock.now() + to_chrono(self.config.daemon.iteration_interval());
        loop {
            let now = self.clock.now();
            if now >= deadline || self.signals.stop_requested() {
                return;
            }
            self.clock.sleep(elapsed_between(now, deadline).min(SLEEP_SLICE));
        }
    }

    /// What would be dispatched right now, computed from the persisted state
    /// without writing anything.
    pub fn plan(&self) -> anyhow::Result<DispatchPlan> {
        let now = self.clock.now();
        let mut state = self.state_file.load()?.unwrap_or_else(|| DaemonState::new(now));
        let mut due = Vec::new();
        for item in self.retry.due(&state.retries, now) {
            if let Some(record) = state.retries.get_mut(&item) {
                record.awaiting_retry = false;
                due.push(Candidate {
                    phase: record.phase,
                    item,
                    title: String::new(),
                });
            }
        }
        let mut snapshot = self.snapshot();
        snapshot.prepend(due);
        Ok(self.plan_dispatch(&state, &snapshot, now))
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut candidates = Vec::new();
        for phase in Phase::DISPATCH_ORDER {
            if !self.config.phases.get(phase).enabled {
                continue;
            }
            let mut items = match self.store.list(phase.filter()) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(%phase, error = %e, "listing candidates failed");
                    continue;
                }
            };
            items.sort_by_key(|i| i.number);
            for item in items {
                if let Err(conflict) = item.lifecycle() {
                    tracing::error!(item = item.number, %conflict, "skipping item with conflicting lifecycle labels");
                    continue;
                }
                candidates.push(Candidate {
                    phase,
                    item: item.number,
                    title: item.title,
                });
            }
        }
        Snapshot {
            candidates,
            live_sessions: self.live_sessions(),
            paused: self.signals.paused_items(),
        }
    }

    fn live_sessions(&self) -> Vec<LiveSession> {
        self.runtime.live_sessions().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "listing live sessions failed");
            Vec::new()
        })
    }

    /// Order and filter candidates against concurrency, the breaker and
    /// everything that makes an item ineligible.
    pub fn plan_dispatch(&self, state: &DaemonState, snapshot: &Snapshot, now: DateTime<Utc>) -> DispatchPlan {
        let gate = self.detector.gate(&state.breaker, now);
        let free = self.config.daemon.max_concurrency.saturating_sub(state.in_flight.len());
        let slots = match gate {
            DispatchGate::Open => free,
            DispatchGate::Probe => free.min(1),
            DispatchGate::Suppressed { .. } | DispatchGate::ProbeInFlight => 0,
        };

        let live: HashSet<&str> = snapshot.live_sessions.iter().map(|s| s.name.as_str()).collect();
        let prefix = &self.config.runtime.session_prefix;
        let mut seen = HashSet::new();
        let mut eligible = Vec::new();
        let mut skipped = Vec::new();
        for c in &snapshot.candidates {
            if !seen.insert(c.item) {
                continue;
            }
            let reason = if state.in_flight.contains_key(&c.item) {
                Some(SkipReason::InFlight)
            } else if snapshot.paused.contains(&c.item) {
                Some(SkipReason::Paused)
            } else if self.signals.aborted(c.item) {
                Some(SkipReason::Aborted)
            } else if state.retries.get(&c.item).is_some_and(|r| r.awaiting_retry) {
                Some(SkipReason::AwaitingRetry)
            } else if live.contains(session_name(prefix, c.phase, c.item).as_str()) {
                Some(SkipReason::SessionLive)
            } else {
                None
            };
            match reason {
                Some(reason) => skipped.push(Skipped {
                    item: c.item,
                    phase: c.phase,
                    reason,
                }),
                None => eligible.push(c.clone()),
            }
        }
        DispatchPlan {
            gate,
            slots,
            eligible,
            skipped,
        }
    }

    fn dispatch(&mut self, state: &mut DaemonState, snapshot: &Snapshot) {
        let plan = self.plan_dispatch(state, snapshot, self.clock.now());
        if plan.slots == 0 {
            tracing::debug!(gate = %gate_label(plan.gate), eligible = plan.eligible.len(), "no dispatch slots");
            return;
        }
        for candidate in &plan.eligible {
            if self.signals.stop_requested() || state.in_flight.len() >= self.config.daemon.max_concurrency {
                break;
            }
            // A failure during this loop can trip the breaker.
            let now = self.clock.now();
            let probe = match self.detector.gate(&state.breaker, now) {
                DispatchGate::Open => false,
                DispatchGate::Probe => true,
                DispatchGate::Suppressed { .. } | DispatchGate::ProbeInFlight => break,
            };
            match self.try_dispatch(state, candidate, probe) {
                DispatchOutcome::Started | DispatchOutcome::Failed => {}
                DispatchOutcome::Lost => {
                    if probe {
                        tracing::debug!(item = candidate.item, "probe slot still open");
                    }
                }
            }
        }
    }

    fn try_dispatch(&mut self, state: &mut DaemonState, c: &Candidate, probe: bool) -> DispatchOutcome {
        let (phase, item) = (c.phase, c.item);
        let span = tracing::info_span!("dispatch", item, phase = %phase);
        let _guard = span.enter();

        let refs = match self.phase_refs(phase, item) {
            Ok(refs) => refs,
            Err(e) => {
                tracing::warn!(error = %e, "reading phase references failed");
                return DispatchOutcome::Lost;
            }
        };
        match self.claim(phase, item) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("item moved before it could be claimed");
                return DispatchOutcome::Lost;
            }
            Err(e) => {
                tracing::warn!(error = %e, "claim failed");
                return DispatchOutcome::Lost;
            }
        }
        // The probe starts once the claim holds.
        if probe {
            self.detector.begin_probe(&mut state.breaker, item, self.clock.now());
        }

        let attempt = FailedAttempt {
            item,
            phase,
            refs: refs.clone(),
            class: ErrorClass::SpawnFailed,
            probe,
        };
        let workspace = if phase.needs_workspace() {
            match self.workspaces.ensure(refs.issue.unwrap_or(item)) {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::error!(error = %e, "workspace provisioning failed");
                    self.handle_failure(state, &FailedAttempt {
                        class: ErrorClass::WorktreeFailed,
                        ..attempt
                    });
                    return DispatchOutcome::Failed;
                }
            }
        } else {
            None
        };

        let session = session_name(&self.config.runtime.session_prefix, phase, item);
        let ctx = CommandContext::new(phase, item, workspace.as_deref(), &session);
        let command = match render_command(&self.config.phases.get(phase).command, &ctx) {
            Ok(command) => command,
            Err(e) => {
                tracing::error!(error = ?e, "rendering worker command failed");
                self.handle_failure(state, &attempt);
                return DispatchOutcome::Failed;
            }
        };
        let timeout = self.config.phases.timeout(phase);
        let spec = SpawnSpec {
            name: session.clone(),
            phase,
            item,
            command,
            cwd: workspace,
            timeout,
        };
        if let Err(e) = self.runtime.spawn(&spec) {
            tracing::error!(error = %e, "spawning worker failed");
            self.handle_failure(state, &attempt);
            return DispatchOutcome::Failed;
        }

        let assignment = Assignment {
            session: session.clone(),
            phase,
            item,
            refs: refs.clone(),
            timeout,
        };
        let supervisor = self.supervisor.clone();
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("supervise-{item}"))
            .spawn(move || {
                let result = supervisor.supervise(&assignment);
                if tx.send(result).is_err() {
                    tracing::warn!("control loop gone, dropping supervision result");
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "starting supervisor thread failed");
                if let Err(e) = self.runtime.kill(&session) {
                    tracing::warn!(error = %e, "failed to kill unsupervised session");
                }
                self.handle_failure(state, &attempt);
                return DispatchOutcome::Failed;
            }
        };

        self.workers.insert(item, handle);
        state.in_flight.insert(
            item,
            InFlight {
                item,
                phase,
                session,
                started_at: self.clock.now(),
                refs,
                probe,
            },
        );
        state.counters.dispatched += 1;
        tracing::info!(probe, "dispatched");
        DispatchOutcome::Started
    }

    fn phase_refs(&self, phase: Phase, item: u64) -> Result<PhaseRefs, StoreError> {
        match phase {
            Phase::Intake | Phase::Build => Ok(PhaseRefs {
                issue: Some(item),
                ..PhaseRefs::default()
            }),
            Phase::Review | Phase::Fix => {
                let pr = self.store.get_review_state(item)?;
                Ok(PhaseRefs {
                    issue: pr.linked_issues.first().copied(),
                    pull_request: Some(item),
                    head_sha: Some(pr.head_sha),
                })
            }
        }
    }

    /// Take ownership of an item. Label writes are not conditional, so the
    /// labels are read back afterwards and the claim only counts if they
    /// show exactly the state we wrote.
    fn claim(&self, phase: Phase, item: u64) -> Result<bool, StoreError> {
        let kind = phase.item_kind();
        let current = Lifecycle::from_labels(kind, &self.store.get_labels(item)?);
        if current != Ok(phase.entry()) {
            return Ok(false);
        }
        let Some(in_progress) = phase.in_progress() else {
            return Ok(true);
        };
        store::transition(self.store.as_ref(), item, kind, Some(in_progress))?;
        let after = Lifecycle::from_labels(kind, &self.store.get_labels(item)?);
        Ok(after == Ok(Some(in_progress)))
    }

    /// Collect finished sessions, including supervisors that died without
    /// reporting.
    fn reap(&mut self, state: &mut DaemonState) {
        let finished: Vec<u64> = self
            .workers
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(item, _)| *item)
            .collect();
        while let Ok(result) = self.rx.try_recv() {
            self.settle_result(state, result);
        }
        for item in finished {
            let Some(handle) = self.workers.remove(&item) else {
                continue;
            };
            let panicked = handle.join().is_err();
            let Some(flight) = state.in_flight.get(&item) else {
                continue;
            };
            tracing::error!(item, panicked, "supervisor exited without reporting");
            if let Err(e) = self.runtime.kill(&flight.session) {
                tracing::warn!(item, error = %e, "failed to kill orphaned session");
            }
            let result = SupervisionResult {
                session: flight.session.clone(),
                phase: flight.phase,
                item,
                status: SessionStatus::Errored,
                reason: "supervisor exited without reporting".into(),
                elapsed: elapsed_between(flight.started_at, self.clock.now()),
                error_class_hint: Some(ErrorClass::WorkerCrashed),
                stall_action: None,
                stall_warned: false,
                output_tail: String::new(),
            };
            self.settle_result(state, result);
        }
    }

    fn settle_result(&mut self, state: &mut DaemonState, result: SupervisionResult) {
        let item = result.item;
        if let Some(handle) = self.workers.remove(&item)
            && handle.join().is_err()
        {
            tracing::warn!(item, "supervisor thread panicked after reporting");
        }
        let Some(flight) = state.in_flight.remove(&item) else {
            tracing::warn!(item, "result for a session that is not in flight");
            return;
        };

        if result.stall_warned {
            state.counters.stall_warnings += 1;
        }
        let verdict = failure::classify(&result);
        tracing::info!(
            item,
            phase = %flight.phase,
            status = ?result.status,
            verdict = ?verdict,
            elapsed = ?result.elapsed,
            reason = %result.reason,
            "session finished"
        );
        match verdict {
            Verdict::Success => {
                state.counters.completed += 1;
                if flight.probe {
                    self.detector.probe_finished(&mut state.breaker, item, true);
                }
                if let Some(record) = state.retries.get_mut(&item) {
                    record.awaiting_retry = false;
                }
            }
            Verdict::Stopped => {
                state.counters.stopped += 1;
                self.detector.abandon_probe(&mut state.breaker, item);
            }
            Verdict::Paused => {
                state.counters.paused += 1;
                self.detector.abandon_probe(&mut state.breaker, item);
            }
            Verdict::Failure(class) => self.handle_failure(state, &FailedAttempt {
                item,
                phase: flight.phase,
                refs: flight.refs,
                class,
                probe: flight.probe,
            }),
        }
    }

    fn handle_failure(&self, state: &mut DaemonState, f: &FailedAttempt) {
        let now = self.clock.now();
        if f.class.kind() == FailureKind::ExternalRejection {
            match self.route_rejection(f) {
                Ok(Some(pr)) => {
                    tracing::info!(item = f.item, pull_request = pr, error_class = %f.class, "routed to fix phase");
                    state.counters.rejected += 1;
                    if f.probe {
                        self.detector.abandon_probe(&mut state.breaker, f.item);
                    }
                    return;
                }
                Ok(None) => tracing::warn!(
                    item = f.item,
                    error_class = %f.class,
                    "no pull request to route the rejection to, treating as a failure"
                ),
                Err(e) => tracing::warn!(item = f.item, error = %e, "routing rejection failed, treating as a failure"),
            }
        }

        state.counters.failed += 1;
        self.detector.record(
            &mut state.breaker,
            FailureEvent {
                item: f.item,
                error_class: f.class,
                phase: f.phase,
                timestamp: now,
            },
            now,
        );
        if f.probe {
            self.detector.probe_finished(&mut state.breaker, f.item, false);
        }

        let (retry_count, exhausted) = {
            let record = self.retry.record_failure(&mut state.retries, f.item, f.phase, f.class, now);
            (record.retry_count, record.exhausted)
        };
        if let Some(blocked) = f.phase.blocked()
            && let Err(e) = store::transition(self.store.as_ref(), f.item, f.phase.item_kind(), Some(blocked))
        {
            tracing::warn!(item = f.item, error = %e, "failed to park item");
        }
        let note = if exhausted {
            state.counters.exhausted += 1;
            tracing::error!(item = f.item, phase = %f.phase, error_class = %f.class, "retries exhausted, needs manual review");
            AuditNote::Exhausted {
                phase: f.phase,
                class: f.class,
                attempts: retry_count,
            }
        } else {
            AuditNote::Failed {
                phase: f.phase,
                class: f.class,
                retry_count,
                cooldown: self.retry.policy().cooldown(retry_count),
            }
        };
        if let Err(e) = self.store.comment(f.item, &note.render()) {
            tracing::warn!(item = f.item, error = %e, "failed to post failure comment");
        }
    }

    /// Label the rejected pull request for the fix phase. `None` when there
    /// is no pull request to send it to.
    fn route_rejection(&self, f: &FailedAttempt) -> Result<Option<u64>, StoreError> {
        let pr = match f.phase {
            Phase::Review | Phase::Fix => Some(f.refs.pull_request.unwrap_or(f.item)),
            Phase::Build => self
                .store
                .linked_pull_requests(f.item)?
                .into_iter()
                .find(PullRequestState::is_open)
                .map(|pr| pr.number),
            Phase::Intake => None,
        };
        let Some(pr) = pr else {
            return Ok(None);
        };
        store::transition(self.store.as_ref(), pr, ItemKind::PullRequest, Some(Lifecycle::ChangesRequested))?;
        let note = AuditNote::Rejected {
            class: f.class,
            pull_request: pr,
        };
        self.store.comment(pr, &note.render())?;
        Ok(Some(pr))
    }

    /// Hand due items back to their phase. Returns them as candidates to be
    /// dispatched ahead of everything else.
    fn sweep_retries(&self, state: &mut DaemonState, now: DateTime<Utc>) -> Vec<Candidate> {
        let mut handed_back = Vec::new();
        for item in self.retry.due(&state.retries, now) {
            if state.in_flight.contains_key(&item) {
                continue;
            }
            let Some(record) = state.retries.get_mut(&item) else {
                continue;
            };
            match self.still_parked(record.phase, item) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(item, phase = %record.phase, "item moved on since it failed, dropping pending retry");
                    record.awaiting_retry = false;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(item, error = %e, "checking parked item failed");
                    continue;
                }
            }
            match self.retry.dispatch_retry(record, now) {
                Ok(()) => {
                    state.counters.retried += 1;
                    handed_back.push(Candidate {
                        phase: record.phase,
                        item,
                        title: String::new(),
                    });
                }
                Err(e) => tracing::warn!(item, error = %e, "handing item back for retry failed"),
            }
        }
        handed_back
    }

    fn still_parked(&self, phase: Phase, item: u64) -> Result<bool, StoreError> {
        let labels = self.store.get_labels(item)?;
        let parked = phase.blocked().or_else(|| phase.entry());
        Ok(Lifecycle::from_labels(phase.item_kind(), &labels) == Ok(parked))
    }

    fn sweep_orphans(&self, state: &mut DaemonState, snapshot: &Snapshot, now: DateTime<Utc>) {
        let in_flight: BTreeSet<u64> = state.in_flight_items();
        let mut ctx = SweepContext {
            in_flight: &in_flight,
            live_sessions: &snapshot.live_sessions,
            paused: &snapshot.paused,
            flagged_stale: &mut state.flagged_stale,
        };
        match self.recovery.sweep(&mut ctx, now) {
            Ok(actions) => {
                let applied = actions.iter().filter(|a| a.applied).count();
                state.counters.recovered += applied as u64;
                tracing::info!(checked = actions.len(), applied, "orphan sweep done");
            }
            Err(e) => tracing::warn!(error = %e, "orphan sweep failed"),
        }
    }

    /// Rebuild retry records from audit comments. Runs before the startup
    /// orphan sweep so an item caught mid-attempt keeps its count.
    fn reconstruct_retries(&self, state: &mut DaemonState) {
        for lifecycle in [
            Lifecycle::Ready,
            Lifecycle::Building,
            Lifecycle::Blocked,
            Lifecycle::ReviewRequested,
            Lifecycle::ChangesRequested,
        ] {
            let items = match self.store.list(LabelFilter::Lifecycle(lifecycle)) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(%lifecycle, error = %e, "listing items for retry reconstruction failed");
                    continue;
                }
            };
            for item in items {
                let comments = match self.store.comments(item.number) {
                    Ok(comments) => comments,
                    Err(e) => {
                        tracing::warn!(item = item.number, error = %e, "reading audit comments failed");
                        continue;
                    }
                };
                if let Some(record) = retry::reconstruct(item.number, &comments) {
                    tracing::debug!(
                        item = item.number,
                        retry_count = record.retry_count,
                        exhausted = record.exhausted,
                        "reconstructed retry record"
                    );
                    state.retries.insert(item.number, record);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::runtime::ScriptedRuntime;
    use crate::runtime::scripted::Script;
    use crate::store::MemoryStore;
    use crate::workspace::DirProvisioner;
    use chrono::TimeZone;

    struct Harness {
        store: Arc<MemoryStore>,
        runtime: Arc<ScriptedRuntime>,
        signals: SignalStore,
        clock: Arc<ManualClock>,
        daemon: Daemon,
        dir: tempfile::TempDir,
    }

    fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let runtime = Arc::new(ScriptedRuntime::new());
        let mut config = Config::default();
        config.daemon.state_dir = dir.path().join("state");
        configure(&mut config);
        let signals = SignalStore::new(&config.daemon.state_dir);
        let backends = Backends {
            store: store.clone(),
            runtime: runtime.clone(),
            workspaces: Arc::new(DirProvisioner::new(&dir.path().join("ws"), "foreman")),
            clock: clock.clone(),
        };
        let daemon = Daemon::new(config, backends, signals.clone()).unwrap();
        Harness {
            store,
            runtime,
            signals,
            clock,
            daemon,
            dir,
        }
    }

    fn fresh(h: &Harness) -> DaemonState {
        DaemonState::new(h.clock.now())
    }

    #[test]
    fn plan_orders_later_phases_first_and_respects_slots() {
        let h = harness(|c| c.daemon.max_concurrency = 2);
        h.store.add_issue(1, "new idea", &[]);
        h.store.add_issue(2, "ready work", &["ready"]);
        h.store.add_pull_request(10, "needs review", &["review-requested"], Some(3), "abc");

        let snapshot = h.daemon.snapshot();
        let plan = h.daemon.plan_dispatch(&fresh(&h), &snapshot, h.clock.now());
        let order: Vec<(Phase, u64)> = plan.eligible.iter().map(|c| (c.phase, c.item)).collect();
        assert_eq!(order, vec![(Phase::Review, 10), (Phase::Build, 2), (Phase::Intake, 1)]);
        assert_eq!(plan.slots, 2);
        assert_eq!(plan.selected().len(), 2);
    }

    #[test]
    fn plan_skips_ineligible_items() {
        let h = harness(|_| {});
        for n in 1..=5 {
            h.store.add_issue(n, "t", &["ready"]);
        }
        h.signals.pause(2, "stalled").unwrap();
        h.signals.abort(3).unwrap();
        h.runtime.add_external_session("foreman/build-4", Some(4));
        let mut state = fresh(&h);
        h.daemon.retry.record_failure(&mut state.retries, 5, Phase::Build, ErrorClass::SpawnFailed, h.clock.now());

        let plan = h.daemon.plan_dispatch(&state, &h.daemon.snapshot(), h.clock.now());
        let skipped: Vec<(u64, SkipReason)> = plan.skipped.iter().map(|s| (s.item, s.reason)).collect();
        assert_eq!(
            skipped,
            vec![
                (2, SkipReason::Paused),
                (3, SkipReason::Aborted),
                (4, SkipReason::SessionLive),
                (5, SkipReason::AwaitingRetry),
            ]
        );
        assert_eq!(plan.eligible.len(), 1);
    }

    #[test]
    fn conflicting_labels_are_skipped() {
        let h = harness(|_| {});
        h.store.add_issue(1, "t", &["ready", "blocked"]);
        assert!(h.daemon.snapshot().candidates.is_empty());
    }

    #[test]
    fn disabled_phase_is_not_listed() {
        let h = harness(|c| c.phases.intake.enabled = false);
        h.store.add_issue(1, "t", &[]);
        assert!(h.daemon.snapshot().candidates.is_empty());
    }

    #[test]
    fn dispatch_claims_and_supervises() {
        let mut h = harness(|_| {});
        h.store.add_issue(7, "t", &["ready"]);
        let store = h.store.clone();
        h.runtime.script(
            7,
            Script::frames(["working", "done <promise>COMPLETE</promise>"]).on_spawn(move |spec| {
                store.add_pull_request(70, "fix", &["review-requested"], Some(spec.item), "abc");
            }),
        );

        let mut state = h.daemon.iterate(fresh(&h)).unwrap();
        assert_eq!(state.counters.dispatched, 1);
        assert!(state.in_flight.contains_key(&7));
        assert_eq!(h.store.labels(7), vec!["building"]);
        let spawned = h.runtime.spawned();
        assert_eq!(spawned[0].name, "foreman/build-7");
        assert_eq!(spawned[0].cwd, Some(h.dir.path().join("ws").join("foreman-7")));

        h.daemon.settle(&mut state);
        assert_eq!(state.counters.completed, 1);
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn lost_claim_does_not_spawn() {
        let h = harness(|_| {});
        h.store.add_issue(7, "t", &["ready"]);
        h.store.set_labels(7, &["blocked"], &["ready"]).unwrap();
        assert!(!h.daemon.claim(Phase::Build, 7).unwrap());
        assert_eq!(h.runtime.spawn_count(7), 0);
    }

    #[test]
    fn spawn_failure_parks_item_with_comment() {
        let mut h = harness(|_| {});
        h.store.add_issue(7, "t", &["ready"]);
        h.runtime.fail_spawn(7);

        let state = h.daemon.iterate(fresh(&h)).unwrap();
        assert_eq!(state.counters.failed, 1);
        assert_eq!(h.store.labels(7), vec!["blocked"]);
        let record = &state.retries[&7];
        assert_eq!(record.error_class, ErrorClass::SpawnFailed);
        assert!(record.awaiting_retry);
        let comments = h.store.comment_bodies(7);
        assert!(comments[0].contains("CLASS:spawn_failed"));
    }

    #[test]
    fn due_retry_is_handed_back_and_dispatched_first() {
        let mut h = harness(|c| c.daemon.max_concurrency = 1);
        h.store.add_issue(1, "fresh", &["ready"]);
        h.store.add_issue(2, "failed before", &["blocked"]);
        h.runtime.default_script(Script::silent());
        let mut state = fresh(&h);
        h.daemon.retry.record_failure(&mut state.retries, 2, Phase::Build, ErrorClass::WorkerCrashed, h.clock.now());
        h.clock.advance(Duration::from_secs(61));

        let mut state = h.daemon.iterate(state).unwrap();
        assert_eq!(state.counters.retried, 1);
        assert!(state.in_flight.contains_key(&2));
        assert!(!state.in_flight.contains_key(&1));
        assert_eq!(state.retries[&2].retry_count, 1);

        h.signals.request_stop();
        h.daemon.settle(&mut state);
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn retry_is_dropped_when_item_moved_on() {
        let mut h = harness(|_| {});
        h.store.add_issue(2, "t", &["curated"]);
        let mut state = fresh(&h);
        h.daemon.retry.record_failure(&mut state.retries, 2, Phase::Build, ErrorClass::WorkerCrashed, h.clock.now());
        h.clock.advance(Duration::from_secs(3600));

        let state = h.daemon.iterate(state).unwrap();
        assert!(!state.retries[&2].awaiting_retry);
        assert_eq!(state.retries[&2].retry_count, 0);
        assert_eq!(h.store.labels(2), vec!["curated"]);
    }

    #[test]
    fn review_rejection_routes_to_fix_without_retry() {
        let h = harness(|_| {});
        h.store.add_pull_request(20, "pr", &["review-requested"], Some(2), "abc");
        let mut state = fresh(&h);
        h.daemon.handle_failure(&mut state, &FailedAttempt {
            item: 20,
            phase: Phase::Review,
            refs: PhaseRefs {
                issue: Some(2),
                pull_request: Some(20),
                head_sha: Some("abc".into()),
            },
            class: ErrorClass::ReviewRejected,
            probe: false,
        });
        assert_eq!(state.counters.rejected, 1);
        assert_eq!(state.counters.failed, 0);
        assert!(state.retries.is_empty());
        assert!(state.breaker.events.is_empty());
        assert_eq!(h.store.labels(20), vec!["changes-requested"]);
    }

    #[test]
    fn build_conflict_without_pull_request_is_a_failure() {
        let h = harness(|_| {});
        h.store.add_issue(3, "t", &["building"]);
        let mut state = fresh(&h);
        h.daemon.handle_failure(&mut state, &FailedAttempt {
            item: 3,
            phase: Phase::Build,
            refs: PhaseRefs::default(),
            class: ErrorClass::MergeConflict,
            probe: false,
        });
        assert_eq!(state.counters.failed, 1);
        assert_eq!(state.retries[&3].error_class, ErrorClass::MergeConflict);
        assert_eq!(h.store.labels(3), vec!["blocked"]);
    }

    #[test]
    fn stop_request_prevents_dispatch() {
        let mut h = harness(|_| {});
        h.store.add_issue(1, "t", &["ready"]);
        h.signals.request_stop();
        let state = h.daemon.iterate(fresh(&h)).unwrap();
        assert_eq!(state.counters.dispatched, 0);
        assert_eq!(h.store.labels(1), vec!["ready"]);
    }

    #[test]
    fn iterate_persists_state() {
        let mut h = harness(|_| {});
        let state = h.daemon.iterate(fresh(&h)).unwrap();
        let saved = StateFile::new(&h.dir.path().join("state")).load().unwrap().unwrap();
        assert_eq!(saved.iteration, state.iteration);
    }

    #[test]
    fn startup_rebuilds_retries_from_comments() {
        let mut h = harness(|_| {});
        h.store.add_issue(4, "t", &["blocked"]);
        let note = AuditNote::Retry {
            phase: Phase::Build,
            class: ErrorClass::BuilderStuck,
            attempt: 2,
            max: 3,
            next_cooldown: Duration::from_secs(240),
            exhausted: false,
        };
        h.store.comment(4, &note.render()).unwrap();
        let failed = AuditNote::Failed {
            phase: Phase::Build,
            class: ErrorClass::BuilderStuck,
            retry_count: 2,
            cooldown: Duration::from_secs(240),
        };
        h.store.comment(4, &failed.render()).unwrap();

        let state = h.daemon.startup().unwrap();
        let record = &state.retries[&4];
        assert_eq!(record.retry_count, 2);
        assert!(record.awaiting_retry);
        assert!(!record.exhausted);
    }

    #[test]
    fn exhausted_item_stays_exhausted_across_a_crash() {
        let mut h = harness(|_| {});
        h.store.add_issue(6, "t", &["building"]);
        let note = AuditNote::Retry {
            phase: Phase::Build,
            class: ErrorClass::WorkerCrashed,
            attempt: 3,
            max: 3,
            next_cooldown: Duration::from_secs(480),
            exhausted: true,
        };
        h.store.comment(6, &note.render()).unwrap();
        h.runtime.fail_spawn(6);
        h.clock.advance(Duration::from_secs(3600));

        let state = h.daemon.startup().unwrap();
        assert_eq!(h.store.labels(6), vec!["ready"]);
        let record = &state.retries[&6];
        assert_eq!(record.retry_count, 3);
        assert!(record.exhausted);

        // The interrupted last attempt runs once more and fails for good.
        let state = h.daemon.iterate(state).unwrap();
        assert_eq!(state.counters.failed, 1);
        assert_eq!(state.counters.exhausted, 1);
        assert_eq!(state.retries[&6].retry_count, 3);
        assert!(state.retries[&6].exhausted);
        assert_eq!(h.store.labels(6), vec!["blocked"]);
        assert!(h.store.comment_bodies(6).last().unwrap().contains("Blocked: manual review."));

        let comments = h.store.comment_bodies(6).len();
        h.clock.advance(Duration::from_secs(86_400));
        let state = h.daemon.iterate(state).unwrap();
        assert_eq!(state.counters.retried, 0);
        assert_eq!(state.counters.failed, 1);
        assert_eq!(h.store.comment_bodies(6).len(), comments);
        assert_eq!(h.store.labels(6), vec!["blocked"]);
    }

    #[test]
    fn lost_claim_leaves_breaker_probe_unspent() {
        let mut h = harness(|_| {});
        h.store.add_issue(7, "t", &["ready"]);
        let mut state = fresh(&h);
        let now = h.clock.now();
        for n in 1..=3 {
            let event = FailureEvent {
                item: n,
                error_class: ErrorClass::SpawnFailed,
                phase: Phase::Build,
                timestamp: now,
            };
            h.daemon.detector.record(&mut state.breaker, event, now);
        }
        h.clock.advance(Duration::from_secs(601));
        let snapshot = h.daemon.snapshot();
        h.store.set_labels(7, &["blocked"], &["ready"]).unwrap();
        assert_eq!(h.daemon.detector.gate(&state.breaker, h.clock.now()), DispatchGate::Probe);

        h.daemon.dispatch(&mut state, &snapshot);

        assert_eq!(h.runtime.spawn_count(7), 0);
        assert_eq!(state.breaker.state.probe_count, 0);
        assert_eq!(state.breaker.state.probe_item, None);
        assert_eq!(h.daemon.detector.gate(&state.breaker, h.clock.now()), DispatchGate::Probe);
    }

    #[test]
    fn second_run_in_same_state_dir_is_refused() {
        let h = harness(|_| {});
        let dir = h.dir.path().join("state");
        let _held = LockFile::acquire(&dir).unwrap();
        let err = LockFile::acquire(&dir).err().unwrap();
        assert!(matches!(err.downcast_ref::<ExitError>(), Some(ExitError::AlreadyRunning(_))));
    }

    #[test]
    fn run_once_archives_on_shutdown() {
        let mut h = harness(|_| {});
        let state = h.daemon.run(true).unwrap();
        assert_eq!(state.iteration, 1);
        let archiver = Archiver::new(&h.dir.path().join("state"), 10);
        assert_eq!(archiver.slots().unwrap(), vec![1]);
        assert!(!h.dir.path().join("state").join(LOCK_FILE).exists());
    }

    #[test]
    fn max_iterations_bounds_the_run() {
        let mut h = harness(|c| {
            c.daemon.max_iterations = Some(3);
            c.daemon.iteration_interval_secs = 5;
        });
        let start = h.clock.now();
        let state = h.daemon.run(false).unwrap();
        assert_eq!(state.iteration, 3);
        assert_eq!(h.clock.now(), start + chrono::TimeDelta::seconds(10));
    }
}

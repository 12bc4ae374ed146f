//! End-to-end control loop scenarios against in-process fakes.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};

use foreman::breaker::Breaker;
use foreman::clock::{Clock, ManualClock};
use foreman::config::Config;
use foreman::daemon::state::DaemonState;
use foreman::daemon::{Backends, Daemon};
use foreman::failure::ErrorClass;
use foreman::model::Phase;
use foreman::retry::RetryRecord;
use foreman::runtime::LiveSession;
use foreman::runtime::ScriptedRuntime;
use foreman::runtime::scripted::Script;
use foreman::signals::SignalStore;
use foreman::store::MemoryStore;
use foreman::workspace::{DirProvisioner, WorkspaceError, WorkspaceProvisioner};

/// Directory workspaces that can be told to fail provisioning.
struct FlakyProvisioner {
    inner: DirProvisioner,
    failing: AtomicBool,
}

impl WorkspaceProvisioner for FlakyProvisioner {
    fn path(&self, item: u64) -> PathBuf {
        self.inner.path(item)
    }

    fn exists(&self, item: u64) -> Result<bool, WorkspaceError> {
        self.inner.exists(item)
    }

    fn ensure(&self, item: u64) -> Result<PathBuf, WorkspaceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WorkspaceError::Failed("maw ws create: disk full".into()));
        }
        self.inner.ensure(item)
    }

    fn remove(&self, item: u64, live: &[LiveSession]) -> Result<(), WorkspaceError> {
        self.inner.remove(item, live)
    }
}

struct World {
    store: Arc<MemoryStore>,
    runtime: Arc<ScriptedRuntime>,
    clock: Arc<ManualClock>,
    workspaces: Arc<FlakyProvisioner>,
    daemon: Daemon,
    _dir: tempfile::TempDir,
}

impl World {
    fn new(configure: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.default_script(Script::silent());
        let workspaces = Arc::new(FlakyProvisioner {
            inner: DirProvisioner::new(&dir.path().join("ws"), "foreman"),
            failing: AtomicBool::new(false),
        });

        let mut config = Config::default();
        config.daemon.state_dir = dir.path().join("state");
        configure(&mut config);
        config.validate().unwrap();

        let backends = Backends {
            store: store.clone(),
            runtime: runtime.clone(),
            workspaces: workspaces.clone(),
            clock: clock.clone(),
        };
        let daemon = Daemon::new(config, backends, SignalStore::new(&dir.path().join("state"))).unwrap();
        Self {
            store,
            runtime,
            clock,
            workspaces,
            daemon,
            _dir: dir,
        }
    }

    fn state(&self) -> DaemonState {
        DaemonState::new(self.clock.now())
    }

    /// A builder session that opens a ready pull request when spawned.
    fn opens_pull_request(&self, issue: u64, script: Script) -> Script {
        let store = self.store.clone();
        script.on_spawn(move |_| {
            store.add_pull_request(100 + issue, "implement", &["review-requested"], Some(issue), "c0ffee");
        })
    }
}

#[test]
fn silent_worker_that_finishes_is_not_killed_for_silence() {
    let mut w = World::new(|c| {
        c.supervisor.prompt.enabled = false;
        c.supervisor.idle_timeout_secs = 100_000;
        c.supervisor.contract.initial_delay_secs = 100_000;
    });
    w.store.add_issue(1, "quiet task", &["ready"]);
    w.runtime.script(1, w.opens_pull_request(1, Script::silent().exit_after(50)));
    let start = w.clock.now();

    let mut state = w.daemon.iterate(w.state()).unwrap();
    w.daemon.settle(&mut state);

    assert!(w.clock.now() - start >= chrono::TimeDelta::seconds(600), "silence passed the warning threshold");
    assert_eq!(state.counters.stall_warnings, 1, "stuck_warn was reached");
    assert_eq!(state.counters.completed, 1);
    assert_eq!(state.counters.failed, 0);
    assert_eq!(w.runtime.spawn_count(1), 1);
    assert!(state.retries.is_empty());
    assert_eq!(w.store.labels(1), vec!["building"]);
}

#[test]
fn timed_out_build_is_blocked_as_builder_stuck() {
    let mut w = World::new(|c| c.phases.build.timeout_secs = Some(300));
    w.store.add_issue(1, "never finishes", &["ready"]);

    let mut state = w.daemon.iterate(w.state()).unwrap();
    w.daemon.settle(&mut state);

    assert_eq!(state.counters.failed, 1);
    assert_eq!(w.store.labels(1), vec!["blocked"]);
    let record = &state.retries[&1];
    assert_eq!(record.error_class, ErrorClass::BuilderStuck);
    assert_eq!(record.retry_count, 0);
    assert!(record.awaiting_retry);
    assert!(w.runtime.killed().contains(&"foreman/build-1".to_string()));
    let comments = w.store.comment_bodies(1);
    assert!(comments.last().unwrap().contains("CLASS:builder_stuck"));
}

#[test]
fn breaker_trips_then_single_probe_clears_it() {
    let mut w = World::new(|c| c.daemon.max_concurrency = 5);
    for n in 1..=4 {
        w.store.add_issue(n, "task", &["ready"]);
    }
    w.workspaces.failing.store(true, Ordering::SeqCst);

    // Three identical provisioning failures trip the breaker mid-dispatch.
    let state = w.daemon.iterate(w.state()).unwrap();
    assert!(state.breaker.state.active);
    assert_eq!(state.breaker.state.pattern, Some(ErrorClass::WorktreeFailed));
    assert_eq!(state.counters.failed, 3);
    assert_eq!(w.store.labels(4), vec!["ready"]);
    let cooldown_until = state.breaker.state.cooldown_until.unwrap();

    // Still inside the cooldown: nothing goes out even though retries fall due.
    w.clock.advance(Duration::from_secs(300));
    let state = w.daemon.iterate(state).unwrap();
    assert!(w.clock.now() < cooldown_until);
    assert!(w.runtime.spawned().is_empty());
    assert_eq!(state.counters.dispatched, 0);

    // Fixed and past the cooldown: exactly one probe.
    w.workspaces.failing.store(false, Ordering::SeqCst);
    w.runtime.script(
        1,
        w.opens_pull_request(1, Script::frames(["building", "all done <promise>COMPLETE</promise>"])),
    );
    w.clock.set(cooldown_until + chrono::TimeDelta::seconds(1));
    let mut state = w.daemon.iterate(state).unwrap();
    assert_eq!(w.runtime.spawned().len(), 1);
    assert_eq!(state.breaker.state.probe_item, Some(1));
    assert_eq!(state.counters.dispatched, 1);

    w.daemon.settle(&mut state);
    assert_eq!(state.counters.completed, 1);
    assert_eq!(state.breaker, Breaker::default());
}

#[test]
fn final_retry_exhausts_and_blocks_for_manual_review() {
    let mut w = World::new(|c| c.retry.max_retries = 3);
    w.store.add_issue(5, "keeps crashing", &["blocked"]);
    w.runtime.fail_spawn(5);
    let mut state = w.state();
    state.retries.insert(
        5,
        RetryRecord {
            item: 5,
            phase: Phase::Build,
            retry_count: 2,
            last_retry_at: w.clock.now() - chrono::TimeDelta::hours(1),
            error_class: ErrorClass::WorkerCrashed,
            exhausted: false,
            awaiting_retry: true,
        },
    );

    let state = w.daemon.iterate(state).unwrap();
    let record = &state.retries[&5];
    assert_eq!(record.retry_count, 3);
    assert!(record.exhausted);
    assert_eq!(state.counters.exhausted, 1);
    assert_eq!(w.store.labels(5), vec!["blocked"]);

    let comments = w.store.comment_bodies(5);
    assert_eq!(comments.len(), 2);
    assert!(comments[0].contains("RETRY:3/3"));
    assert!(comments[0].contains("EXHAUSTED"));
    assert!(comments[1].contains("Blocked: manual review."));

    // Exhausted items are never handed back again.
    w.clock.advance(Duration::from_secs(86_400));
    let state = w.daemon.iterate(state).unwrap();
    assert_eq!(state.retries[&5].retry_count, 3);
    assert_eq!(w.store.comment_bodies(5).len(), 2);
    assert_eq!(w.store.labels(5), vec!["blocked"]);
}

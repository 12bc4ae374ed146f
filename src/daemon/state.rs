//! Persisted control-loop state.
//!
//! `DaemonState` is a cache over the tracker: losing it costs history, not
//! correctness, because retry records can be replayed from audit comments.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::breaker::Breaker;
use crate::model::{Phase, PhaseRefs};
use crate::retry::RetryMap;

pub const STATE_VERSION: u32 = 1;
pub const STATE_FILE: &str = "daemon-state.json";

/// One supervised session the daemon is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub item: u64,
    pub phase: Phase,
    pub session: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub refs: PhaseRefs,
    /// Dispatched as the breaker probe.
    #[serde(default)]
    pub probe: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub stopped: u64,
    pub paused: u64,
    pub recovered: u64,
    /// Sessions that went quiet past the warning threshold.
    pub stall_warnings: u64,
}

/// Attached when a state file is archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub archived_at: DateTime<Utc>,
    pub iterations: u64,
    pub counters: Counters,
    pub retry_records: usize,
    pub exhausted_items: Vec<u64>,
    pub breaker_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub version: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub iteration: u64,
    #[serde(default)]
    pub in_flight: BTreeMap<u64, InFlight>,
    #[serde(default)]
    pub breaker: Breaker,
    #[serde(default)]
    pub retries: RetryMap,
    #[serde(default)]
    pub counters: Counters,
    /// Items already flagged stale, so each is flagged once.
    #[serde(default)]
    pub flagged_stale: BTreeSet<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<StateSummary>,
}

impl DaemonState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            started_at: now,
            updated_at: None,
            iteration: 0,
            in_flight: BTreeMap::new(),
            breaker: Breaker::default(),
            retries: RetryMap::new(),
            counters: Counters::default(),
            flagged_stale: BTreeSet::new(),
            summary: None,
        }
    }

    /// Nothing worth keeping: the run never iterated and finished nothing.
    pub const fn is_trivial(&self) -> bool {
        self.iteration == 0 && self.counters.completed == 0
    }

    pub fn summarize(&self, now: DateTime<Utc>) -> StateSummary {
        StateSummary {
            archived_at: now,
            iterations: self.iteration,
            counters: self.counters,
            retry_records: self.retries.len(),
            exhausted_items: self.retries.values().filter(|r| r.exhausted).map(|r| r.item).collect(),
            breaker_active: self.breaker.state.active,
        }
    }

    pub fn in_flight_items(&self) -> BTreeSet<u64> {
        self.in_flight.keys().copied().collect()
    }
}

/// `<state_dir>/daemon-state.json`, written atomically.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Option<DaemonState>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let state = serde_json::from_str(&contents).with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &DaemonState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(state).context("serializing daemon state")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

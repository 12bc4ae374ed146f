//! Orphan recovery for in-progress items nobody is working on.
//!
//! Runs at startup and periodically. Classification is read-only; the only
//! writes are the relabel and comment paired with `Abandoned` and
//! `BlockedByRejection`, plus a one-time comment for `StaleButActive`.
//! An abandoned item's leftover workspace is removed when nothing uses it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::audit::AuditNote;
use crate::clock::elapsed_between;
use crate::config::RecoveryConfig;
use crate::model::{ItemKind, LabelFilter, Lifecycle, PullRequestState, ReviewDecision, WorkItem};
use crate::runtime::LiveSession;
use crate::store::{self, StateStore, StoreError};
use crate::workspace::WorkspaceProvisioner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanClass {
    /// A supervisor in this process tracks it.
    Live,
    /// Touched too recently to judge.
    WithinGrace,
    /// A linked PR has changes requested.
    BlockedByRejection { pull_request: u64 },
    /// Linked PR exists but has been idle past the stale threshold.
    StaleButActive { idle: Duration },
    /// A linked PR is open; the next phase owns it.
    WaitingOnNextPhase { pull_request: u64 },
    /// An outside session is bound to the item, or it is paused.
    Held { reason: String },
    Abandoned,
}

/// What the sweep did for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAction {
    pub item: u64,
    pub class: OrphanClass,
    /// Whether anything was written to the tracker.
    pub applied: bool,
}

/// Facts about this process the classification needs.
pub struct SweepContext<'a> {
    pub in_flight: &'a BTreeSet<u64>,
    pub live_sessions: &'a [LiveSession],
    pub paused: &'a [u64],
    /// Items already flagged stale; updated by the sweep.
    pub flagged_stale: &'a mut BTreeSet<u64>,
}

pub struct OrphanRecovery {
    store: Arc<dyn StateStore>,
    workspaces: Arc<dyn WorkspaceProvisioner>,
    grace: Duration,
    stale: Duration,
}

impl OrphanRecovery {
    pub fn new(store: Arc<dyn StateStore>, workspaces: Arc<dyn WorkspaceProvisioner>, config: &RecoveryConfig) -> Self {
        Self {
            store,
            workspaces,
            grace: Duration::from_secs(config.grace_secs),
            stale: Duration::from_secs(config.stale_secs),
        }
    }

    pub fn classify(&self, item: &WorkItem, ctx: &SweepContext<'_>, now: DateTime<Utc>) -> Result<OrphanClass, StoreError> {
        let n = item.number;
        if ctx.in_flight.contains(&n) {
            return Ok(OrphanClass::Live);
        }
        if elapsed_between(item.updated_at, now) < self.grace {
            return Ok(OrphanClass::WithinGrace);
        }

        let prs: Vec<PullRequestState> = self
            .store
            .linked_pull_requests(n)?
            .into_iter()
            .filter(PullRequestState::is_open)
            .collect();
        if let Some(pr) = prs
            .iter()
            .find(|pr| pr.decision == ReviewDecision::ChangesRequested || pr.has_label(Lifecycle::ChangesRequested))
        {
            return Ok(OrphanClass::BlockedByRejection { pull_request: pr.number });
        }

        if let Some(idle) = prs.iter().map(|pr| elapsed_between(pr.updated_at, now)).min()
            && idle > self.stale
        {
            return Ok(OrphanClass::StaleButActive { idle });
        }
        if let Some(pr) = prs.first() {
            return Ok(OrphanClass::WaitingOnNextPhase { pull_request: pr.number });
        }

        if let Some(s) = ctx.live_sessions.iter().find(|s| s.item == Some(n)) {
            return Ok(OrphanClass::Held {
                reason: format!("session {} is bound to it", s.name),
            });
        }
        if ctx.paused.contains(&n) {
            return Ok(OrphanClass::Held {
                reason: "paused".into(),
            });
        }
        Ok(OrphanClass::Abandoned)
    }

    /// Classify every in-progress item and apply the matching action.
    /// Per-item failures are logged and skipped.
    pub fn sweep(&self, ctx: &mut SweepContext<'_>, now: DateTime<Utc>) -> Result<Vec<RecoveryAction>, StoreError> {
        let items = self.store.list(LabelFilter::Lifecycle(Lifecycle::Building))?;
        let mut actions = Vec::with_capacity(items.len());
        for item in &items {
            let class = match self.classify(item, ctx, now) {
                Ok(class) => class,
                Err(e) => {
                    tracing::warn!(item = item.number, error = %e, "orphan classification failed");
                    continue;
                }
            };
            let applied = match self.apply(item.number, &class, ctx) {
                Ok(applied) => applied,
                Err(e) => {
                    tracing::warn!(item = item.number, error = %e, "orphan recovery action failed");
                    false
                }
            };
            actions.push(RecoveryAction {
                item: item.number,
                class,
                applied,
            });
        }
        Ok(actions)
    }

    fn apply(&self, n: u64, class: &OrphanClass, ctx: &mut SweepContext<'_>) -> Result<bool, StoreError> {
        let (to, note) = match class {
            OrphanClass::Abandoned => (
                Lifecycle::Ready,
                AuditNote::Abandoned {
                    from: Lifecycle::Building,
                    to: Lifecycle::Ready,
                },
            ),
            OrphanClass::BlockedByRejection { pull_request } => (
                Lifecycle::Blocked,
                AuditNote::BlockedByRejection {
                    pull_request: *pull_request,
                },
            ),
            OrphanClass::StaleButActive { idle } => {
                if !ctx.flagged_stale.insert(n) {
                    return Ok(false);
                }
                tracing::warn!(item = n, idle = ?idle, "in-progress item is stale, flagging for manual review");
                self.store.comment(n, &AuditNote::Stale { idle: *idle }.render())?;
                return Ok(true);
            }
            OrphanClass::Live
            | OrphanClass::WithinGrace
            | OrphanClass::WaitingOnNextPhase { .. }
            | OrphanClass::Held { .. } => {
                tracing::debug!(item = n, class = ?class, "orphan sweep: no action");
                return Ok(false);
            }
        };

        // Labels may have moved since the listing.
        let labels = self.store.get_labels(n)?;
        if !labels.iter().any(|l| l == Lifecycle::Building.label()) {
            tracing::debug!(item = n, "no longer in progress, skipping");
            return Ok(false);
        }
        tracing::info!(item = n, class = ?class, to = %to, "recovering orphaned item");
        store::transition(self.store.as_ref(), n, ItemKind::Issue, Some(to))?;
        self.store.comment(n, &note.render())?;

        if *class == OrphanClass::Abandoned {
            self.discard_workspace(n, ctx.live_sessions);
        }
        Ok(true)
    }

    /// Best effort: a leftover checkout of an abandoned item is removed
    /// unless something is still using it.
    fn discard_workspace(&self, n: u64, live: &[LiveSession]) {
        match self.workspaces.exists(n) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(item = n, error = %e, "could not check workspace");
                return;
            }
        }
        match self.workspaces.remove(n, live) {
            Ok(()) => tracing::info!(item = n, "removed abandoned workspace"),
            Err(e) => tracing::warn!(item = n, error = %e, "left abandoned workspace in place"),
        }
    }
}

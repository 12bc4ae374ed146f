//! Failure classification.
//!
//! Every finished session maps to exactly one [`Verdict`]. Failures carry an
//! [`ErrorClass`], and each class belongs to one [`FailureKind`] that decides
//! which recovery path the control loop takes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::Phase;
use crate::supervisor::stall::StallAction;
use crate::supervisor::{SessionStatus, SupervisionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    IntakeStuck,
    BuilderStuck,
    ReviewerStuck,
    FixerStuck,
    WorkerCrashed,
    SpawnFailed,
    WorktreeFailed,
    ContractUnsatisfied,
    MergeConflict,
    ReviewRejected,
}

/// Recovery path for a class of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry with backoff and count toward the breaker.
    TransientWorker,
    /// Same path as transient; kept distinct for reporting.
    ContractValidation,
    /// Hand the item to the fix phase. Never retried, never tripped on.
    ExternalRejection,
}

impl ErrorClass {
    pub const ALL: [Self; 10] = [
        Self::IntakeStuck,
        Self::BuilderStuck,
        Self::ReviewerStuck,
        Self::FixerStuck,
        Self::WorkerCrashed,
        Self::SpawnFailed,
        Self::WorktreeFailed,
        Self::ContractUnsatisfied,
        Self::MergeConflict,
        Self::ReviewRejected,
    ];

    /// The `<role>_stuck` class for a phase.
    pub const fn stuck(phase: Phase) -> Self {
        match phase {
            Phase::Intake => Self::IntakeStuck,
            Phase::Build => Self::BuilderStuck,
            Phase::Review => Self::ReviewerStuck,
            Phase::Fix => Self::FixerStuck,
        }
    }

    pub const fn kind(self) -> FailureKind {
        match self {
            Self::ContractUnsatisfied => FailureKind::ContractValidation,
            Self::MergeConflict | Self::ReviewRejected => FailureKind::ExternalRejection,
            _ => FailureKind::TransientWorker,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IntakeStuck => "intake_stuck",
            Self::BuilderStuck => "builder_stuck",
            Self::ReviewerStuck => "reviewer_stuck",
            Self::FixerStuck => "fixer_stuck",
            Self::WorkerCrashed => "worker_crashed",
            Self::SpawnFailed => "spawn_failed",
            Self::WorktreeFailed => "worktree_failed",
            Self::ContractUnsatisfied => "contract_unsatisfied",
            Self::MergeConflict => "merge_conflict",
            Self::ReviewRejected => "review_rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure(ErrorClass),
    /// Parked by the stall policy; no retry until an operator resumes it.
    Paused,
    /// Daemon shutdown or operator abort; not a failure.
    Stopped,
}

const MERGE_CONFLICT_MARKERS: &[&str] = &[
    "merge conflict",
    "conflict (content)",
    "automatic merge failed",
    "not mergeable",
];

const REVIEW_REJECTED_MARKERS: &[&str] = &[
    "review rejected",
    "changes requested",
    "requested changes",
];

fn mentions_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Map one supervision result to its verdict.
pub fn classify(result: &SupervisionResult) -> Verdict {
    match result.status {
        SessionStatus::Completed => return Verdict::Success,
        SessionStatus::SignaledStop => return Verdict::Stopped,
        SessionStatus::StuckCritical if result.stall_action == Some(StallAction::Pause) => {
            return Verdict::Paused;
        }
        _ => {}
    }

    let tail = result.output_tail.to_lowercase();
    if mentions_any(&tail, MERGE_CONFLICT_MARKERS) {
        return Verdict::Failure(ErrorClass::MergeConflict);
    }
    if matches!(result.phase, Phase::Review | Phase::Fix) && mentions_any(&tail, REVIEW_REJECTED_MARKERS) {
        return Verdict::Failure(ErrorClass::ReviewRejected);
    }

    let class = match result.status {
        SessionStatus::TimedOut => ErrorClass::stuck(result.phase),
        SessionStatus::StuckCritical if result.stall_action.is_some_and(StallAction::redispatches) => {
            ErrorClass::stuck(result.phase)
        }
        _ => result.error_class_hint.unwrap_or(ErrorClass::WorkerCrashed),
    };
    Verdict::Failure(class)
}

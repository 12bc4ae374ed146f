//! Tracker-facing data model: work items, lifecycle labels and pipeline phases.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a tracker entry is an issue or a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Issue,
    PullRequest,
}

/// Mutually exclusive lifecycle labels. Issues and pull requests each draw
/// from their own subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    Curated,
    Ready,
    Building,
    Blocked,
    ReviewRequested,
    ChangesRequested,
    Approved,
}

impl Lifecycle {
    pub const ISSUE: [Lifecycle; 4] = [
        Lifecycle::Curated,
        Lifecycle::Ready,
        Lifecycle::Building,
        Lifecycle::Blocked,
    ];

    pub const PULL_REQUEST: [Lifecycle; 3] = [
        Lifecycle::ReviewRequested,
        Lifecycle::ChangesRequested,
        Lifecycle::Approved,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Lifecycle::Curated => "curated",
            Lifecycle::Ready => "ready",
            Lifecycle::Building => "building",
            Lifecycle::Blocked => "blocked",
            Lifecycle::ReviewRequested => "review-requested",
            Lifecycle::ChangesRequested => "changes-requested",
            Lifecycle::Approved => "approved",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ISSUE
            .iter()
            .chain(Self::PULL_REQUEST.iter())
            .copied()
            .find(|l| l.label() == label)
    }

    pub const fn kind(self) -> ItemKind {
        match self {
            Lifecycle::Curated | Lifecycle::Ready | Lifecycle::Building | Lifecycle::Blocked => {
                ItemKind::Issue
            }
            Lifecycle::ReviewRequested | Lifecycle::ChangesRequested | Lifecycle::Approved => {
                ItemKind::PullRequest
            }
        }
    }

    /// Resolve the single active lifecycle of an item from its raw labels.
    ///
    /// Two lifecycle labels of the item's kind at once is a bug in whoever
    /// wrote them, not a transient state, so it is reported as an error.
    pub fn from_labels(kind: ItemKind, labels: &[String]) -> Result<Option<Self>, LifecycleConflict> {
        let found: Vec<Lifecycle> = labels
            .iter()
            .filter_map(|l| Lifecycle::from_label(l))
            .filter(|l| l.kind() == kind)
            .collect();
        match found.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            _ => Err(LifecycleConflict {
                labels: found.iter().map(|l| l.label().to_string()).collect(),
            }),
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("conflicting lifecycle labels: {}", labels.join(", "))]
pub struct LifecycleConflict {
    pub labels: Vec<String>,
}

/// An issue or pull request as seen in one tracker snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub number: u64,
    pub kind: ItemKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn lifecycle(&self) -> Result<Option<Lifecycle>, LifecycleConflict> {
        Lifecycle::from_labels(self.kind, &self.labels)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Which items a `StateStore::list` call should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelFilter {
    /// Open items of `kind` carrying the lifecycle label.
    Lifecycle(Lifecycle),
    /// Open issues without any issue lifecycle label (intake candidates).
    UntriagedIssues,
}

/// One stage of the fixed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Build,
    Review,
    Fix,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Intake, Phase::Build, Phase::Review, Phase::Fix];

    /// Dispatch order: drain the later stages first so finished work lands
    /// before new work starts.
    pub const DISPATCH_ORDER: [Phase; 4] = [Phase::Fix, Phase::Review, Phase::Build, Phase::Intake];

    pub const fn name(self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Build => "build",
            Phase::Review => "review",
            Phase::Fix => "fix",
        }
    }

    /// Worker role name, used in error classes (`builder_stuck`).
    pub const fn role(self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Build => "builder",
            Phase::Review => "reviewer",
            Phase::Fix => "fixer",
        }
    }

    pub const fn item_kind(self) -> ItemKind {
        match self {
            Phase::Intake | Phase::Build => ItemKind::Issue,
            Phase::Review | Phase::Fix => ItemKind::PullRequest,
        }
    }

    /// Lifecycle an item must carry to be picked up by this phase.
    /// `None` means "no lifecycle label yet".
    pub const fn entry(self) -> Option<Lifecycle> {
        match self {
            Phase::Intake => None,
            Phase::Build => Some(Lifecycle::Ready),
            Phase::Review => Some(Lifecycle::ReviewRequested),
            Phase::Fix => Some(Lifecycle::ChangesRequested),
        }
    }

    /// Label written when the phase claims an item.
    pub const fn in_progress(self) -> Option<Lifecycle> {
        match self {
            Phase::Build => Some(Lifecycle::Building),
            Phase::Intake | Phase::Review | Phase::Fix => None,
        }
    }

    /// Label a failed item is parked under until its retry is due.
    pub const fn blocked(self) -> Option<Lifecycle> {
        match self {
            Phase::Intake | Phase::Build => Some(Lifecycle::Blocked),
            Phase::Review | Phase::Fix => None,
        }
    }

    pub const fn needs_workspace(self) -> bool {
        matches!(self, Phase::Build | Phase::Fix)
    }

    pub const fn filter(self) -> LabelFilter {
        match self.entry() {
            Some(l) => LabelFilter::Lifecycle(l),
            None => LabelFilter::UntriagedIssues,
        }
    }

    /// Phase whose entry state an item is in, if any.
    pub fn for_entry(kind: ItemKind, lifecycle: Option<Lifecycle>) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|p| p.item_kind() == kind && p.entry() == lifecycle)
    }

    pub fn parse(s: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.name() == s)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracker references captured at dispatch and handed to the contract check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<u64>,
    /// PR head at dispatch; the fix contract requires it to move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<String>,
}

/// Open/closed state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestStatus {
    Open,
    Closed,
    Merged,
}

/// Aggregate review verdict as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    None,
    ReviewRequired,
    Approved,
    ChangesRequested,
}

/// Review/merge state of one pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestState {
    pub number: u64,
    pub status: PullRequestStatus,
    pub draft: bool,
    pub labels: Vec<String>,
    pub decision: ReviewDecision,
    pub head_sha: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub linked_issues: Vec<u64>,
}

impl PullRequestState {
    pub fn has_label(&self, lifecycle: Lifecycle) -> bool {
        self.labels.iter().any(|l| l == lifecycle.label())
    }

    pub fn is_open(&self) -> bool {
        self.status == PullRequestStatus::Open
    }

    pub fn lifecycle(&self) -> Result<Option<Lifecycle>, LifecycleConflict> {
        Lifecycle::from_labels(ItemKind::PullRequest, &self.labels)
    }
}

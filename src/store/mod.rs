//! State store adapter: the remote, label-based issue tracker.
//!
//! Every read is a snapshot that may already be stale by the time the caller
//! acts on it. Writes are label rewrites and comments; none of them are
//! conditional, so callers re-read after a claim instead of trusting it.

pub mod github;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ItemKind, LabelFilter, Lifecycle, PullRequestState, WorkItem};

pub use github::GhStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("item #{0} not found")]
    NotFound(u64),

    #[error("tracker call failed: {0}")]
    Backend(String),

    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Backend(format!("{e:#}"))
    }
}

/// A comment on an issue or pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub body: String,
    pub created_at: DateTime<Utc>,
}

pub trait StateStore: Send + Sync {
    /// Open items matching `filter`.
    fn list(&self, filter: LabelFilter) -> Result<Vec<WorkItem>, StoreError>;

    fn get_labels(&self, number: u64) -> Result<Vec<String>, StoreError>;

    /// Add and remove labels in one logical step. Not atomic on the tracker.
    fn set_labels(&self, number: u64, add: &[&str], remove: &[&str]) -> Result<(), StoreError>;

    fn comment(&self, number: u64, body: &str) -> Result<(), StoreError>;

    /// All comments on an item, oldest first.
    fn comments(&self, number: u64) -> Result<Vec<Comment>, StoreError>;

    fn get_review_state(&self, pr: u64) -> Result<PullRequestState, StoreError>;

    /// Open pull requests that declare they close `issue`.
    fn linked_pull_requests(&self, issue: u64) -> Result<Vec<PullRequestState>, StoreError>;

    fn mark_ready_for_review(&self, pr: u64) -> Result<(), StoreError>;
}

/// Move an item to lifecycle `to`, dropping every other lifecycle label of its
/// kind. Reads first and writes only the difference, so a repeated call is a
/// no-op. Returns whether anything was written.
pub fn transition(
    store: &dyn StateStore,
    number: u64,
    kind: ItemKind,
    to: Option<Lifecycle>,
) -> Result<bool, StoreError> {
    let current = store.get_labels(number)?;
    let lifecycle_set: &[Lifecycle] = match kind {
        ItemKind::Issue => &Lifecycle::ISSUE,
        ItemKind::PullRequest => &Lifecycle::PULL_REQUEST,
    };

    let remove: Vec<&str> = lifecycle_set
        .iter()
        .filter(|l| Some(**l) != to)
        .map(|l| l.label())
        .filter(|l| current.iter().any(|c| c == l))
        .collect();
    let add: Vec<&str> = to
        .map(Lifecycle::label)
        .filter(|l| !current.iter().any(|c| c == l))
        .into_iter()
        .collect();

    if add.is_empty() && remove.is_empty() {
        return Ok(false);
    }
    store.set_labels(number, &add, &remove)?;
    Ok(true)
}

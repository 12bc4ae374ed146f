//! In-process tracker. Backs the unit and scenario tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{Clock, SystemClock};
use crate::model::{
    ItemKind, LabelFilter, PullRequestState, PullRequestStatus, ReviewDecision, WorkItem,
};

use super::{Comment, StateStore, StoreError};

#[derive(Debug, Clone)]
struct PullRequestExtra {
    status: PullRequestStatus,
    draft: bool,
    decision: ReviewDecision,
    head_sha: String,
    linked_issues: Vec<u64>,
}

#[derive(Debug, Clone)]
struct Entry {
    item: WorkItem,
    open: bool,
    pr: Option<PullRequestExtra>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<u64, Entry>,
    comments: BTreeMap<u64, Vec<Comment>>,
    writes: usize,
    unavailable: bool,
}

/// Tracker held in memory.
///
/// The `add_*`, `set_*` and `push_commit` helpers model other actors touching
/// the tracker: they do not count as writes by this process.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn guard(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(StoreError::Backend("tracker unavailable".into()));
        }
        Ok(inner)
    }

    pub fn add_issue(&self, number: u64, title: &str, labels: &[&str]) {
        self.insert(number, ItemKind::Issue, title, labels, None);
    }

    /// Add an open, non-draft pull request that closes `linked_issue`.
    pub fn add_pull_request(
        &self,
        number: u64,
        title: &str,
        labels: &[&str],
        linked_issue: Option<u64>,
        head_sha: &str,
    ) {
        let extra = PullRequestExtra {
            status: PullRequestStatus::Open,
            draft: false,
            decision: ReviewDecision::None,
            head_sha: head_sha.to_string(),
            linked_issues: linked_issue.into_iter().collect(),
        };
        self.insert(number, ItemKind::PullRequest, title, labels, Some(extra));
    }

    fn insert(
        &self,
        number: u64,
        kind: ItemKind,
        title: &str,
        labels: &[&str],
        pr: Option<PullRequestExtra>,
    ) {
        let now = self.clock.now();
        let item = WorkItem {
            number,
            kind,
            title: title.to_string(),
            labels: labels.iter().map(|s| (*s).to_string()).collect(),
            created_at: now,
            updated_at: now,
        };
        self.lock().entries.insert(
            number,
            Entry {
                item,
                open: true,
                pr,
            },
        );
    }

    fn touch_pr(&self, number: u64, f: impl FnOnce(&mut PullRequestExtra)) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&number)
            && let Some(pr) = entry.pr.as_mut()
        {
            f(pr);
            entry.item.updated_at = now;
        }
    }

    pub fn set_draft(&self, number: u64, draft: bool) {
        self.touch_pr(number, |pr| pr.draft = draft);
    }

    pub fn set_review_decision(&self, number: u64, decision: ReviewDecision) {
        self.touch_pr(number, |pr| pr.decision = decision);
    }

    pub fn push_commit(&self, number: u64, sha: &str) {
        self.touch_pr(number, |pr| pr.head_sha = sha.to_string());
    }

    pub fn close(&self, number: u64) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&number) {
            entry.open = false;
            if let Some(pr) = entry.pr.as_mut() {
                pr.status = PullRequestStatus::Closed;
            }
        }
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Labels currently on an item, or empty if unknown.
    pub fn labels(&self, number: u64) -> Vec<String> {
        self.lock()
            .entries
            .get(&number)
            .map(|e| e.item.labels.clone())
            .unwrap_or_default()
    }

    pub fn comment_bodies(&self, number: u64) -> Vec<String> {
        self.lock()
            .comments
            .get(&number)
            .map(|cs| cs.iter().map(|c| c.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of writes issued through the `StateStore` interface.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn pr_state(entry: &Entry) -> Option<PullRequestState> {
        let pr = entry.pr.as_ref()?;
        Some(PullRequestState {
            number: entry.item.number,
            status: pr.status,
            draft: pr.draft,
            labels: entry.item.labels.clone(),
            decision: pr.decision,
            head_sha: pr.head_sha.clone(),
            updated_at: entry.item.updated_at,
            linked_issues: pr.linked_issues.clone(),
        })
    }
}

impl StateStore for MemoryStore {
    fn list(&self, filter: LabelFilter) -> Result<Vec<WorkItem>, StoreError> {
        let inner = self.guard()?;
        Ok(inner
            .entries
            .values()
            .filter(|e| e.open)
            .filter(|e| match filter {
                LabelFilter::Lifecycle(l) => {
                    e.item.kind == l.kind() && e.item.has_label(l.label())
                }
                LabelFilter::UntriagedIssues => {
                    e.item.kind == ItemKind::Issue && matches!(e.item.lifecycle(), Ok(None))
                }
            })
            .map(|e| e.item.clone())
            .collect())
    }

    fn get_labels(&self, number: u64) -> Result<Vec<String>, StoreError> {
        let inner = self.guard()?;
        inner
            .entries
            .get(&number)
            .map(|e| e.item.labels.clone())
            .ok_or(StoreError::NotFound(number))
    }

    fn set_labels(&self, number: u64, add: &[&str], remove: &[&str]) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.guard()?;
        let entry = inner
            .entries
            .get_mut(&number)
            .ok_or(StoreError::NotFound(number))?;
        entry.item.labels.retain(|l| !remove.contains(&l.as_str()));
        for label in add {
            if !entry.item.has_label(label) {
                entry.item.labels.push((*label).to_string());
            }
        }
        entry.item.updated_at = now;
        inner.writes += 1;
        Ok(())
    }

    fn comment(&self, number: u64, body: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.guard()?;
        if !inner.entries.contains_key(&number) {
            return Err(StoreError::NotFound(number));
        }
        inner.comments.entry(number).or_default().push(Comment {
            body: body.to_string(),
            created_at: now,
        });
        inner.writes += 1;
        Ok(())
    }

    fn comments(&self, number: u64) -> Result<Vec<Comment>, StoreError> {
        let inner = self.guard()?;
        if !inner.entries.contains_key(&number) {
            return Err(StoreError::NotFound(number));
        }
        Ok(inner.comments.get(&number).cloned().unwrap_or_default())
    }

    fn get_review_state(&self, pr: u64) -> Result<PullRequestState, StoreError> {
        let inner = self.guard()?;
        inner
            .entries
            .get(&pr)
            .and_then(Self::pr_state)
            .ok_or(StoreError::NotFound(pr))
    }

    fn linked_pull_requests(&self, issue: u64) -> Result<Vec<PullRequestState>, StoreError> {
        let inner = self.guard()?;
        Ok(inner
            .entries
            .values()
            .filter_map(Self::pr_state)
            .filter(|pr| pr.is_open() && pr.linked_issues.contains(&issue))
            .collect())
    }

    fn mark_ready_for_review(&self, pr: u64) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.guard()?;
        let entry = inner.entries.get_mut(&pr).ok_or(StoreError::NotFound(pr))?;
        let extra = entry.pr.as_mut().ok_or(StoreError::NotFound(pr))?;
        extra.draft = false;
        entry.item.updated_at = now;
        inner.writes += 1;
        Ok(())
    }
}

//! Phase exit contracts checked against the tracker.
//!
//! `CheckOnly` is a pure read and may be called as often as the caller likes.
//! `Normal` may run one bounded, idempotent repair and then re-checks the
//! whole contract from fresh reads; partial success is reported as
//! `NotSatisfied`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{ItemKind, Lifecycle, Phase, PhaseRefs, PullRequestState, PullRequestStatus, ReviewDecision};
use crate::store::{self, StateStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    CheckOnly,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ContractOutcome {
    Satisfied,
    /// Satisfied only because of the repair described in `action`.
    Recovered { action: String },
    NotSatisfied { missing: String },
}

impl ContractOutcome {
    pub const fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied | Self::Recovered { .. })
    }
}

impl fmt::Display for ContractOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satisfied => f.write_str("satisfied"),
            Self::Recovered { action } => write!(f, "recovered ({action})"),
            Self::NotSatisfied { missing } => write!(f, "not satisfied: {missing}"),
        }
    }
}

/// Repairs the validator is allowed to make in `Normal` mode.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Repair {
    /// Build produced a PR but left it as a draft and/or unlabelled.
    PublishPullRequest { pr: u64, draft: bool },
    /// The PR's lifecycle label disagrees with what already happened.
    Relabel { pr: u64, to: Lifecycle },
}

impl Repair {
    fn describe(&self) -> String {
        match self {
            Self::PublishPullRequest { pr, draft: true } => {
                format!("marked #{pr} ready for review and labelled {}", Lifecycle::ReviewRequested)
            }
            Self::PublishPullRequest { pr, draft: false } => {
                format!("labelled #{pr} {}", Lifecycle::ReviewRequested)
            }
            Self::Relabel { pr, to } => format!("relabelled #{pr} {to}"),
        }
    }
}

enum Check {
    Satisfied,
    Missing { what: String, repair: Option<Repair> },
}

impl Check {
    fn missing(what: impl Into<String>) -> Self {
        Self::Missing {
            what: what.into(),
            repair: None,
        }
    }
}

#[derive(Clone)]
pub struct ContractValidator {
    store: Arc<dyn StateStore>,
}

impl ContractValidator {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn validate(
        &self,
        phase: Phase,
        item: u64,
        refs: &PhaseRefs,
        mode: ValidationMode,
    ) -> Result<ContractOutcome, StoreError> {
        let (what, repair) = match self.check(phase, item, refs)? {
            Check::Satisfied => return Ok(ContractOutcome::Satisfied),
            Check::Missing { what, repair } => (what, repair),
        };
        let Some(repair) = repair.filter(|_| mode == ValidationMode::Normal) else {
            return Ok(ContractOutcome::NotSatisfied { missing: what });
        };

        tracing::info!(item, %phase, repair = ?repair, "repairing phase contract");
        self.apply(&repair)?;

        match self.check(phase, item, refs)? {
            Check::Satisfied => Ok(ContractOutcome::Recovered {
                action: repair.describe(),
            }),
            Check::Missing { what, .. } => Ok(ContractOutcome::NotSatisfied { missing: what }),
        }
    }

    fn apply(&self, repair: &Repair) -> Result<(), StoreError> {
        match *repair {
            Repair::PublishPullRequest { pr, draft } => {
                if draft {
                    self.store.mark_ready_for_review(pr)?;
                }
                store::transition(
                    self.store.as_ref(),
                    pr,
                    ItemKind::PullRequest,
                    Some(Lifecycle::ReviewRequested),
                )?;
            }
            Repair::Relabel { pr, to } => {
                store::transition(self.store.as_ref(), pr, ItemKind::PullRequest, Some(to))?;
            }
        }
        Ok(())
    }

    fn check(&self, phase: Phase, item: u64, refs: &PhaseRefs) -> Result<Check, StoreError> {
        match phase {
            Phase::Intake => self.check_intake(item),
            Phase::Build => self.check_build(refs.issue.unwrap_or(item)),
            Phase::Review => {
                let pr = self.store.get_review_state(refs.pull_request.unwrap_or(item))?;
                Ok(check_review(&pr))
            }
            Phase::Fix => {
                let pr = self.store.get_review_state(refs.pull_request.unwrap_or(item))?;
                Ok(check_fix(&pr, refs.head_sha.as_deref()))
            }
        }
    }

    fn check_intake(&self, issue: u64) -> Result<Check, StoreError> {
        let labels = self.store.get_labels(issue)?;
        if labels.iter().any(|l| l == Lifecycle::Curated.label()) {
            Ok(Check::Satisfied)
        } else {
            Ok(Check::missing(format!("#{issue} is not labelled {}", Lifecycle::Curated)))
        }
    }

    fn check_build(&self, issue: u64) -> Result<Check, StoreError> {
        let mut prs = self.store.linked_pull_requests(issue)?;
        prs.retain(PullRequestState::is_open);
        if prs
            .iter()
            .any(|pr| !pr.draft && pr.has_label(Lifecycle::ReviewRequested))
        {
            return Ok(Check::Satisfied);
        }

        // Newest first: the latest push is the one the builder meant.
        prs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let repair = prs.iter().find_map(|pr| {
            let unlabelled = matches!(
                pr.lifecycle(),
                Ok(None | Some(Lifecycle::ReviewRequested))
            );
            unlabelled.then_some(Repair::PublishPullRequest {
                pr: pr.number,
                draft: pr.draft,
            })
        });
        let what = if prs.is_empty() {
            format!("no open pull request linked to #{issue}")
        } else {
            format!("no linked pull request of #{issue} is ready and labelled {}", Lifecycle::ReviewRequested)
        };
        Ok(Check::Missing { what, repair })
    }
}

fn check_review(pr: &PullRequestState) -> Check {
    if pr.status == PullRequestStatus::Merged {
        return Check::Satisfied;
    }
    if !pr.is_open() {
        return Check::missing(format!("#{} was closed without merging", pr.number));
    }
    let expected = match pr.decision {
        ReviewDecision::Approved => Lifecycle::Approved,
        ReviewDecision::ChangesRequested => Lifecycle::ChangesRequested,
        ReviewDecision::None | ReviewDecision::ReviewRequired => {
            return Check::missing(format!("#{} has no review decision", pr.number));
        }
    };
    if pr.lifecycle() == Ok(Some(expected)) {
        return Check::Satisfied;
    }
    Check::Missing {
        what: format!("#{} is not labelled {expected}", pr.number),
        repair: Some(Repair::Relabel {
            pr: pr.number,
            to: expected,
        }),
    }
}

fn check_fix(pr: &PullRequestState, head_at_dispatch: Option<&str>) -> Check {
    if pr.status == PullRequestStatus::Merged {
        return Check::Satisfied;
    }
    if !pr.is_open() {
        return Check::missing(format!("#{} was closed without merging", pr.number));
    }
    if head_at_dispatch.is_some_and(|sha| sha == pr.head_sha) {
        return Check::missing(format!("#{} has no new commits", pr.number));
    }
    match pr.lifecycle() {
        Ok(Some(Lifecycle::ReviewRequested)) => Check::Satisfied,
        Ok(Some(Lifecycle::Approved)) => {
            Check::missing(format!("#{} is labelled {}", pr.number, Lifecycle::Approved))
        }
        _ => Check::Missing {
            what: format!("#{} is not labelled {}", pr.number, Lifecycle::ReviewRequested),
            repair: Some(Repair::Relabel {
                pr: pr.number,
                to: Lifecycle::ReviewRequested,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, ContractValidator) {
        let store = Arc::new(MemoryStore::new());
        let validator = ContractValidator::new(store.clone());
        (store, validator)
    }

    fn issue_refs(issue: u64) -> PhaseRefs {
        PhaseRefs {
            issue: Some(issue),
            ..PhaseRefs::default()
        }
    }

    #[test]
    fn intake_needs_curated() {
        let (store, v) = setup();
        store.add_issue(1, "t", &[]);
        let out = v.validate(Phase::Intake, 1, &issue_refs(1), ValidationMode::Normal).unwrap();
        assert!(matches!(out, ContractOutcome::NotSatisfied { .. }));
        assert_eq!(store.write_count(), 0);

        store.set_labels(1, &["curated"], &[]).unwrap();
        let out = v.validate(Phase::Intake, 1, &issue_refs(1), ValidationMode::Normal).unwrap();
        assert_eq!(out, ContractOutcome::Satisfied);
    }

    #[test]
    fn build_satisfied_by_labelled_ready_pr() {
        let (store, v) = setup();
        store.add_issue(1, "t", &["building"]);
        store.add_pull_request(10, "pr", &["review-requested"], Some(1), "a1");
        let out = v.validate(Phase::Build, 1, &issue_refs(1), ValidationMode::CheckOnly).unwrap();
        assert_eq!(out, ContractOutcome::Satisfied);
    }

    #[test]
    fn build_recovers_draft_pr() {
        let (store, v) = setup();
        store.add_issue(1, "t", &["building"]);
        store.add_pull_request(10, "pr", &[], Some(1), "a1");
        store.set_draft(10, true);

        let out = v.validate(Phase::Build, 1, &issue_refs(1), ValidationMode::Normal).unwrap();
        assert!(matches!(out, ContractOutcome::Recovered { .. }), "{out:?}");
        let pr = store.get_review_state(10).unwrap();
        assert!(!pr.draft);
        assert!(pr.has_label(Lifecycle::ReviewRequested));
    }

    #[test]
    fn check_only_is_idempotent_and_writes_nothing() {
        let (store, v) = setup();
        store.add_issue(1, "t", &["building"]);
        store.add_pull_request(10, "pr", &[], Some(1), "a1");
        store.set_draft(10, true);

        let first = v.validate(Phase::Build, 1, &issue_refs(1), ValidationMode::CheckOnly).unwrap();
        let second = v.validate(Phase::Build, 1, &issue_refs(1), ValidationMode::CheckOnly).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_satisfied());
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn build_without_pr_is_not_satisfied() {
        let (store, v) = setup();
        store.add_issue(1, "t", &["building"]);
        let out = v.validate(Phase::Build, 1, &issue_refs(1), ValidationMode::Normal).unwrap();
        match out {
            ContractOutcome::NotSatisfied { missing } => assert!(missing.contains("no open pull request")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn review_requires_label_matching_decision() {
        let (store, v) = setup();
        store.add_pull_request(10, "pr", &["review-requested"], Some(1), "a1");
        let refs = PhaseRefs {
            pull_request: Some(10),
            ..PhaseRefs::default()
        };

        let out = v.validate(Phase::Review, 10, &refs, ValidationMode::Normal).unwrap();
        assert!(!out.is_satisfied());

        store.set_review_decision(10, ReviewDecision::ChangesRequested);
        let out = v.validate(Phase::Review, 10, &refs, ValidationMode::CheckOnly).unwrap();
        assert!(!out.is_satisfied());

        let out = v.validate(Phase::Review, 10, &refs, ValidationMode::Normal).unwrap();
        assert!(matches!(out, ContractOutcome::Recovered { .. }));
        assert_eq!(store.labels(10), vec!["changes-requested"]);
    }

    #[test]
    fn fix_requires_new_head() {
        let (store, v) = setup();
        store.add_pull_request(10, "pr", &["changes-requested"], Some(1), "a1");
        let refs = PhaseRefs {
            pull_request: Some(10),
            head_sha: Some("a1".into()),
            ..PhaseRefs::default()
        };

        let out = v.validate(Phase::Fix, 10, &refs, ValidationMode::Normal).unwrap();
        assert!(!out.is_satisfied());
        assert_eq!(store.write_count(), 0);

        store.push_commit(10, "b2");
        let out = v.validate(Phase::Fix, 10, &refs, ValidationMode::Normal).unwrap();
        assert!(matches!(out, ContractOutcome::Recovered { .. }));
        assert_eq!(store.labels(10), vec!["review-requested"]);

        let out = v.validate(Phase::Fix, 10, &refs, ValidationMode::CheckOnly).unwrap();
        assert_eq!(out, ContractOutcome::Satisfied);
    }

    #[test]
    fn merged_pr_satisfies_review() {
        let (store, _) = setup();
        store.add_pull_request(10, "pr", &[], Some(1), "a1");
        let mut pr = store.get_review_state(10).unwrap();
        pr.status = PullRequestStatus::Merged;
        assert!(matches!(check_review(&pr), Check::Satisfied));
    }
}

//! GitHub tracker via the `gh` CLI.
//!
//! Reads use `gh issue list` / `gh pr list` / `gh pr view` with `--json`;
//! label and comment writes go through `gh api` so they work the same for
//! issues and pull requests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::model::{
    ItemKind, LabelFilter, PullRequestState, PullRequestStatus, ReviewDecision, WorkItem,
};
use crate::subprocess::Tool;

use super::{Comment, StateStore, StoreError};

const ITEM_FIELDS: &str = "number,title,labels,createdAt,updatedAt";
const PR_FIELDS: &str =
    "number,state,isDraft,labels,reviewDecision,headRefOid,updatedAt,closingIssuesReferences";

pub struct GhStore {
    /// `owner/name`; `None` lets `gh` resolve the repository from the cwd.
    repo: Option<String>,
    timeout: Duration,
    list_limit: u32,
}

impl GhStore {
    pub fn new(repo: Option<String>, timeout: Duration, list_limit: u32) -> Self {
        Self {
            repo,
            timeout,
            list_limit,
        }
    }

    fn gh(&self, args: &[&str]) -> Tool {
        let mut tool = Tool::new("gh").args(args).timeout(self.timeout);
        if let Some(repo) = &self.repo {
            tool = tool.args(&["--repo", repo.as_str()]);
        }
        tool
    }

    /// `gh api` does not take `--repo`; it substitutes `{owner}/{repo}` itself.
    fn api(&self, method: &str, path: &str) -> Tool {
        let base = self
            .repo
            .as_deref()
            .map_or_else(|| "repos/{owner}/{repo}".to_string(), |r| format!("repos/{r}"));
        let endpoint = format!("{base}/{path}");
        Tool::new("gh")
            .args(&["api", "-X", method, endpoint.as_str()])
            .timeout(self.timeout)
    }

    fn list_kind(&self, kind: ItemKind, label: Option<&str>) -> Result<Vec<WorkItem>, StoreError> {
        let sub = match kind {
            ItemKind::Issue => "issue",
            ItemKind::PullRequest => "pr",
        };
        let limit = self.list_limit.to_string();
        let mut args = vec![sub, "list", "--state", "open", "--limit", limit.as_str(), "--json", ITEM_FIELDS];
        if let Some(label) = label {
            args.extend(["--label", label]);
        }
        let output = self.gh(&args).run_ok()?;
        parse_item_list(&output.stdout, kind)
    }
}

impl StateStore for GhStore {
    fn list(&self, filter: LabelFilter) -> Result<Vec<WorkItem>, StoreError> {
        match filter {
            LabelFilter::Lifecycle(l) => self.list_kind(l.kind(), Some(l.label())),
            LabelFilter::UntriagedIssues => Ok(self
                .list_kind(ItemKind::Issue, None)?
                .into_iter()
                .filter(|i| matches!(i.lifecycle(), Ok(None)))
                .collect()),
        }
    }

    fn get_labels(&self, number: u64) -> Result<Vec<String>, StoreError> {
        let output = self
            .api("GET", &format!("issues/{number}/labels"))
            .run_ok()
            .map_err(|e| not_found_or(number, e))?;
        parse_labels(&output.stdout)
    }

    fn set_labels(&self, number: u64, add: &[&str], remove: &[&str]) -> Result<(), StoreError> {
        if !add.is_empty() {
            let fields: Vec<String> = add.iter().map(|l| format!("labels[]={l}")).collect();
            let mut tool = self.api("POST", &format!("issues/{number}/labels"));
            for field in &fields {
                tool = tool.args(&["-f", field.as_str()]);
            }
            tool.run_ok().map_err(|e| not_found_or(number, e))?;
        }
        for label in remove {
            let output = self
                .api("DELETE", &format!("issues/{number}/labels/{label}"))
                .run()?;
            // Already gone is fine: someone else got there first.
            if !output.success() && !is_not_found(&output.stderr) {
                return Err(StoreError::Backend(format!(
                    "removing label {label} from #{number}: {}",
                    output.stderr.trim()
                )));
            }
        }
        Ok(())
    }

    fn comment(&self, number: u64, body: &str) -> Result<(), StoreError> {
        self.api("POST", &format!("issues/{number}/comments"))
            .args(&["-F", "body=@-"])
            .stdin(body)
            .run_ok()
            .map_err(|e| not_found_or(number, e))?;
        Ok(())
    }

    fn comments(&self, number: u64) -> Result<Vec<Comment>, StoreError> {
        let output = self
            .api("GET", &format!("issues/{number}/comments?per_page=100"))
            .arg("--paginate")
            .run_ok()
            .map_err(|e| not_found_or(number, e))?;
        parse_comments(&output.stdout)
    }

    fn get_review_state(&self, pr: u64) -> Result<PullRequestState, StoreError> {
        let number = pr.to_string();
        let output = self
            .gh(&["pr", "view", number.as_str(), "--json", PR_FIELDS])
            .run_ok()
            .map_err(|e| not_found_or(pr, e))?;
        parse_pr_view(&output.stdout)
    }

    fn linked_pull_requests(&self, issue: u64) -> Result<Vec<PullRequestState>, StoreError> {
        let limit = self.list_limit.to_string();
        let output = self
            .gh(&["pr", "list", "--state", "open", "--limit", limit.as_str(), "--json", PR_FIELDS])
            .run_ok()?;
        Ok(parse_pr_list(&output.stdout)?
            .into_iter()
            .filter(|pr| pr.linked_issues.contains(&issue))
            .collect())
    }

    fn mark_ready_for_review(&self, pr: u64) -> Result<(), StoreError> {
        let number = pr.to_string();
        self.gh(&["pr", "ready", number.as_str()])
            .run_ok()
            .map_err(|e| not_found_or(pr, e))?;
        Ok(())
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("Not Found") || stderr.contains("HTTP 404") || stderr.contains("Could not resolve")
}

fn not_found_or(number: u64, e: anyhow::Error) -> StoreError {
    match e.downcast_ref::<crate::error::ExitError>() {
        Some(crate::error::ExitError::ToolFailed { message, .. }) if is_not_found(message) => {
            StoreError::NotFound(number)
        }
        _ => StoreError::from(e),
    }
}

// --- JSON adapters ---

#[derive(Debug, Deserialize)]
struct LabelJson {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemJson {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    labels: Vec<LabelJson>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct IssueRefJson {
    number: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestJson {
    number: u64,
    state: String,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    labels: Vec<LabelJson>,
    #[serde(default)]
    review_decision: Option<String>,
    #[serde(default)]
    head_ref_oid: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    closing_issues_references: Vec<IssueRefJson>,
}

impl From<PullRequestJson> for PullRequestState {
    fn from(j: PullRequestJson) -> Self {
        let status = match j.state.as_str() {
            "MERGED" => PullRequestStatus::Merged,
            "CLOSED" => PullRequestStatus::Closed,
            _ => PullRequestStatus::Open,
        };
        let decision = match j.review_decision.as_deref() {
            Some("APPROVED") => ReviewDecision::Approved,
            Some("CHANGES_REQUESTED") => ReviewDecision::ChangesRequested,
            Some("REVIEW_REQUIRED") => ReviewDecision::ReviewRequired,
            _ => ReviewDecision::None,
        };
        Self {
            number: j.number,
            status,
            draft: j.is_draft,
            labels: j.labels.into_iter().map(|l| l.name).collect(),
            decision,
            head_sha: j.head_ref_oid,
            updated_at: j.updated_at,
            linked_issues: j
                .closing_issues_references
                .into_iter()
                .map(|r| r.number)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommentJson {
    #[serde(default)]
    body: String,
    created_at: DateTime<Utc>,
}

fn parse<T: serde::de::DeserializeOwned>(what: &'static str, json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Parse {
        what,
        detail: e.to_string(),
    })
}

/// Parse `gh issue list --json` / `gh pr list --json` item output.
pub fn parse_item_list(json: &str, kind: ItemKind) -> Result<Vec<WorkItem>, StoreError> {
    let items: Vec<ItemJson> = parse("gh list", json)?;
    Ok(items
        .into_iter()
        .map(|i| WorkItem {
            number: i.number,
            kind,
            title: i.title,
            labels: i.labels.into_iter().map(|l| l.name).collect(),
            created_at: i.created_at,
            updated_at: i.updated_at,
        })
        .collect())
}

/// Parse `gh api .../labels`.
pub fn parse_labels(json: &str) -> Result<Vec<String>, StoreError> {
    let labels: Vec<LabelJson> = parse("labels", json)?;
    Ok(labels.into_iter().map(|l| l.name).collect())
}

/// Parse `gh api .../comments --paginate`.
///
/// `--paginate` concatenates one JSON array per page (`[...][...]`), so the
/// output is read as a stream of arrays.
pub fn parse_comments(json: &str) -> Result<Vec<Comment>, StoreError> {
    let mut out = Vec::new();
    for page in serde_json::Deserializer::from_str(json).into_iter::<Vec<CommentJson>>() {
        let page = page.map_err(|e| StoreError::Parse {
            what: "comments",
            detail: e.to_string(),
        })?;
        out.extend(page.into_iter().map(|c| Comment {
            body: c.body,
            created_at: c.created_at,
        }));
    }
    Ok(out)
}

/// Parse `gh pr view --json`.
pub fn parse_pr_view(json: &str) -> Result<PullRequestState, StoreError> {
    let pr: PullRequestJson = parse("gh pr view", json)?;
    Ok(pr.into())
}

/// Parse `gh pr list --json` with pull request fields.
pub fn parse_pr_list(json: &str) -> Result<Vec<PullRequestState>, StoreError> {
    let prs: Vec<PullRequestJson> = parse("gh pr list", json)?;
    Ok(prs.into_iter().map(Into::into).collect())
}

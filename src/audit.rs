//! Audit comments posted alongside every externally visible transition.
//!
//! Each comment carries a hidden marker plus machine-readable tokens
//! (`PHASE:<phase>`, `RETRY:n/max`, `CLASS:<class>`, `EXHAUSTED`) so retry bookkeeping can be
//! rebuilt from the tracker after the local state file is lost.

use std::time::Duration;

use crate::clock::format_duration;
use crate::failure::ErrorClass;
use crate::model::{Lifecycle, Phase};

/// Hidden first line identifying comments written by this tool.
pub const MARKER: &str = "<!-- foreman -->";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditNote {
    /// Phase failed; the item waits out its cooldown.
    Failed {
        phase: Phase,
        class: ErrorClass,
        retry_count: u32,
        cooldown: Duration,
    },
    /// Item handed back to its entry label for another attempt.
    Retry {
        phase: Phase,
        class: ErrorClass,
        attempt: u32,
        max: u32,
        next_cooldown: Duration,
        exhausted: bool,
    },
    /// No attempts left.
    Exhausted { phase: Phase, class: ErrorClass, attempts: u32 },
    /// Review rejection or merge conflict routed to the fix phase.
    Rejected { class: ErrorClass, pull_request: u64 },
    /// In-progress item with no session and no work product.
    Abandoned { from: Lifecycle, to: Lifecycle },
    /// Linked PR carries a negative review.
    BlockedByRejection { pull_request: u64 },
    /// Work product exists but has gone quiet.
    Stale { idle: Duration },
}

impl AuditNote {
    pub fn render(&self) -> String {
        let body = match self {
            Self::Failed {
                phase,
                class,
                retry_count,
                cooldown,
            } => format!(
                "{phase} failed: `{class}`. Next step: automatic retry in {} (retries so far: {retry_count}).\n\nPHASE:{phase} CLASS:{class}",
                format_duration(*cooldown)
            ),
            Self::Retry {
                phase,
                class,
                attempt,
                max,
                next_cooldown,
                exhausted,
            } => {
                let next = if *exhausted {
                    "This is the last automatic attempt; a further failure needs manual review.".to_string()
                } else {
                    format!("If this attempt fails the next cooldown is {}.", format_duration(*next_cooldown))
                };
                let tail = if *exhausted { " EXHAUSTED" } else { "" };
                format!(
                    "Retrying {phase} (attempt {attempt} of {max}) after `{class}`. {next}\n\nPHASE:{phase} RETRY:{attempt}/{max} CLASS:{class}{tail}"
                )
            }
            Self::Exhausted { phase, class, attempts } => format!(
                "{phase} failed again with `{class}` after {attempts} automatic retries. Blocked: manual review.\n\nPHASE:{phase} CLASS:{class} EXHAUSTED"
            ),
            Self::Rejected { class, pull_request } => format!(
                "`{class}` on #{pull_request}. Next step: labelled {} for the fix phase.",
                Lifecycle::ChangesRequested
            ),
            Self::Abandoned { from, to } => format!(
                "No live session or work product for this {from} item. Next step: relabelled {to} for a fresh attempt."
            ),
            Self::BlockedByRejection { pull_request } => format!(
                "Changes were requested on #{pull_request}. Next step: labelled {} until the fix lands.",
                Lifecycle::Blocked
            ),
            Self::Stale { idle } => format!(
                "Work in progress has been idle for {}. Flagged for manual review; labels left unchanged.",
                format_duration(*idle)
            ),
        };
        format!("{MARKER}\n{body}")
    }
}

/// Machine tokens found in one of our comments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokens {
    pub phase: Option<Phase>,
    pub retry: Option<(u32, u32)>,
    pub class: Option<ErrorClass>,
    pub exhausted: bool,
}

/// Parse the tokens of a comment; `None` if it was not written by us.
pub fn parse(body: &str) -> Option<Tokens> {
    if !body.trim_start().starts_with(MARKER) {
        return None;
    }
    let mut tokens = Tokens::default();
    for word in body.split_whitespace() {
        let word = word.trim_matches(|c: char| c == '`' || c == '.' || c == ',');
        if let Some(rest) = word.strip_prefix("RETRY:") {
            tokens.retry = rest
                .split_once('/')
                .and_then(|(n, max)| Some((n.parse().ok()?, max.parse().ok()?)));
        } else if let Some(rest) = word.strip_prefix("PHASE:") {
            tokens.phase = Phase::parse(rest).or(tokens.phase);
        } else if let Some(rest) = word.strip_prefix("CLASS:") {
            tokens.class = ErrorClass::parse(rest).or(tokens.class);
        } else if word == "EXHAUSTED" {
            tokens.exhausted = true;
        }
    }
    Some(tokens)
}

//! Stuck-at-prompt detection and recovery gating.
//!
//! A worker sometimes finishes a turn and sits at its input prompt with the
//! task unfinished. That looks like a stall to the slow path; this path spots
//! it early and pokes the session, first with a short nudge and then by
//! resending the full instruction.

use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::clock::elapsed_between;

/// Lines from the end of the output inspected for busy indicators.
const BUSY_TAIL_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct PromptDetector {
    prompt: Regex,
    busy: Regex,
}

impl PromptDetector {
    pub fn new(prompt_pattern: &str, busy_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            prompt: Regex::new(prompt_pattern)?,
            busy: Regex::new(busy_pattern)?,
        })
    }

    /// The prompt is on the last non-empty line and nothing in the tail
    /// says the worker is still processing.
    pub fn is_idle_at_prompt(&self, output: &str) -> bool {
        let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        let Some(last) = lines.last() else {
            return false;
        };
        if !self.prompt.is_match(last) {
            return false;
        }
        let tail_start = lines.len().saturating_sub(BUSY_TAIL_LINES);
        !lines[tail_start..].iter().any(|l| self.busy.is_match(l))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStep {
    Wait,
    /// Send the short nudge text.
    Nudge,
    /// Resend the full instruction.
    Resend,
    /// The previous attempt got the worker moving again.
    Recovered,
}

#[derive(Debug, Clone, Copy)]
pub struct PromptGate {
    pub min_age: Duration,
    pub cooldown: Duration,
}

#[derive(Debug, Default)]
pub struct PromptWatch {
    detected_since: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
    /// Output hash when the pending attempt was sent.
    pending: Option<[u8; 32]>,
    attempts: u32,
}

impl PromptWatch {
    /// Feed one prompt check. `hash` is the hash of the output just observed.
    pub fn observe(
        &mut self,
        idle_at_prompt: bool,
        hash: [u8; 32],
        now: DateTime<Utc>,
        gate: &PromptGate,
    ) -> PromptStep {
        if self.pending.is_some_and(|before| before != hash) {
            *self = Self::default();
            return PromptStep::Recovered;
        }

        if !idle_at_prompt {
            self.detected_since = None;
            return PromptStep::Wait;
        }

        let since = *self.detected_since.get_or_insert(now);
        if elapsed_between(since, now) < gate.min_age {
            return PromptStep::Wait;
        }
        if self
            .last_attempt
            .is_some_and(|at| elapsed_between(at, now) < gate.cooldown)
        {
            return PromptStep::Wait;
        }

        self.attempts += 1;
        self.last_attempt = Some(now);
        self.pending = Some(hash);
        if self.attempts == 1 {
            PromptStep::Nudge
        } else {
            PromptStep::Resend
        }
    }

    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn detector() -> PromptDetector {
        PromptDetector::new(r"^\s*[>❯]\s*$", r"(?i)esc to interrupt|thinking").unwrap()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::TimeDelta::seconds(secs)
    }

    const GATE: PromptGate = PromptGate {
        min_age: Duration::from_secs(30),
        cooldown: Duration::from_secs(120),
    };

    #[test]
    fn prompt_on_last_line_is_idle() {
        let d = detector();
        assert!(d.is_idle_at_prompt("did some work\n\n> \n"));
        assert!(!d.is_idle_at_prompt("> \nstill printing"));
        assert!(!d.is_idle_at_prompt(""));
    }

    #[test]
    fn busy_marker_in_tail_is_not_idle() {
        let d = detector();
        assert!(!d.is_idle_at_prompt("Thinking (esc to interrupt)\n>"));
    }

    #[test]
    fn recovery_waits_for_min_age() {
        let mut w = PromptWatch::default();
        let h = [0; 32];
        assert_eq!(w.observe(true, h, t(0), &GATE), PromptStep::Wait);
        assert_eq!(w.observe(true, h, t(20), &GATE), PromptStep::Wait);
        assert_eq!(w.observe(true, h, t(30), &GATE), PromptStep::Nudge);
    }

    #[test]
    fn detection_must_be_continuous() {
        let mut w = PromptWatch::default();
        let h = [0; 32];
        w.observe(true, h, t(0), &GATE);
        w.observe(false, h, t(20), &GATE);
        assert_eq!(w.observe(true, h, t(40), &GATE), PromptStep::Wait);
        assert_eq!(w.observe(true, h, t(70), &GATE), PromptStep::Nudge);
    }

    #[test]
    fn failed_attempt_respects_cooldown_then_escalates() {
        let mut w = PromptWatch::default();
        let h = [0; 32];
        w.observe(true, h, t(0), &GATE);
        assert_eq!(w.observe(true, h, t(30), &GATE), PromptStep::Nudge);
        // Unchanged output: the nudge failed.
        assert_eq!(w.observe(true, h, t(40), &GATE), PromptStep::Wait);
        assert_eq!(w.observe(true, h, t(149), &GATE), PromptStep::Wait);
        assert_eq!(w.observe(true, h, t(150), &GATE), PromptStep::Resend);
        assert_eq!(w.attempts(), 2);
    }

    #[test]
    fn changed_output_after_attempt_is_recovery() {
        let mut w = PromptWatch::default();
        w.observe(true, [0; 32], t(0), &GATE);
        assert_eq!(w.observe(true, [0; 32], t(30), &GATE), PromptStep::Nudge);
        assert_eq!(w.observe(false, [1; 32], t(40), &GATE), PromptStep::Recovered);
        assert_eq!(w.attempts(), 0);
    }
}

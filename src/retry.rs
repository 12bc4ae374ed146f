//! Per-item retry bookkeeping with exponential backoff.
//!
//! A record is created on an item's first failure and never deleted; once
//! `exhausted` is set it stays set. The retry clock is independent of the
//! fleet-wide breaker: cooldowns keep running while dispatch is suppressed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{self, AuditNote};
use crate::clock::to_chrono;
use crate::config::RetryConfig;
use crate::failure::ErrorClass;
use crate::model::Phase;
use crate::store::{self, Comment, StateStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_cooldown: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_secs),
            multiplier: config.multiplier,
            max_cooldown: Duration::from_secs(config.max_cooldown_secs),
            max_retries: config.max_retries,
        }
    }

    /// `min(base * multiplier^n, max_cooldown)`, saturating.
    pub fn cooldown(&self, retry_count: u32) -> Duration {
        let exp = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max_cooldown.as_secs_f64() {
            return self.max_cooldown;
        }
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub item: u64,
    pub phase: Phase,
    pub retry_count: u32,
    /// Start of the current cooldown: the last failure or retry dispatch.
    pub last_retry_at: DateTime<Utc>,
    pub error_class: ErrorClass,
    pub exhausted: bool,
    /// Failed and not yet handed back for another attempt.
    pub awaiting_retry: bool,
}

pub type RetryMap = BTreeMap<u64, RetryRecord>;

pub struct RetryManager {
    policy: RetryPolicy,
    store: Arc<dyn StateStore>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy, store: Arc<dyn StateStore>) -> Self {
        Self { policy, store }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn eligible(&self, record: &RetryRecord, now: DateTime<Utc>) -> bool {
        !record.exhausted && now >= record.last_retry_at + to_chrono(self.policy.cooldown(record.retry_count))
    }

    /// When a waiting record becomes eligible.
    pub fn due_at(&self, record: &RetryRecord) -> DateTime<Utc> {
        record.last_retry_at + to_chrono(self.policy.cooldown(record.retry_count))
    }

    /// Note a failed attempt. Does not touch the tracker.
    pub fn record_failure<'a>(
        &self,
        records: &'a mut RetryMap,
        item: u64,
        phase: Phase,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> &'a RetryRecord {
        let record = records.entry(item).or_insert(RetryRecord {
            item,
            phase,
            retry_count: 0,
            last_retry_at: now,
            error_class: class,
            exhausted: false,
            awaiting_retry: true,
        });
        record.phase = phase;
        record.error_class = class;
        record.last_retry_at = now;
        record.awaiting_retry = true;
        tracing::info!(
            item,
            %phase,
            error_class = %class,
            retry_count = record.retry_count,
            exhausted = record.exhausted,
            "recorded failure"
        );
        record
    }

    /// Hand an eligible item back to its phase entry label.
    ///
    /// Exhaustion is decided on the increment: the dispatch that reaches
    /// `max_retries` is the last one.
    pub fn dispatch_retry(&self, record: &mut RetryRecord, now: DateTime<Utc>) -> Result<(), StoreError> {
        let phase = record.phase;
        store::transition(self.store.as_ref(), record.item, phase.item_kind(), phase.entry())?;

        record.retry_count += 1;
        record.last_retry_at = now;
        record.awaiting_retry = false;
        if record.retry_count >= self.policy.max_retries {
            record.exhausted = true;
        }

        let note = AuditNote::Retry {
            phase,
            class: record.error_class,
            attempt: record.retry_count,
            max: self.policy.max_retries,
            next_cooldown: self.policy.cooldown(record.retry_count),
            exhausted: record.exhausted,
        };
        self.store.comment(record.item, &note.render())?;
        tracing::info!(
            item = record.item,
            %phase,
            attempt = record.retry_count,
            max = self.policy.max_retries,
            exhausted = record.exhausted,
            "dispatched retry"
        );
        Ok(())
    }

    /// Every waiting, non-exhausted record whose cooldown has elapsed.
    pub fn due(&self, records: &RetryMap, now: DateTime<Utc>) -> Vec<u64> {
        records
            .values()
            .filter(|r| r.awaiting_retry && self.eligible(r, now))
            .map(|r| r.item)
            .collect()
    }
}

/// Rebuild a retry record from the audit comments on an item.
pub fn reconstruct(item: u64, comments: &[Comment]) -> Option<RetryRecord> {
    let mut record: Option<RetryRecord> = None;
    for comment in comments {
        let Some(tokens) = audit::parse(&comment.body) else {
            continue;
        };
        let (Some(class), Some(phase)) = (tokens.class, tokens.phase) else {
            continue;
        };
        let r = record.get_or_insert(RetryRecord {
            item,
            phase,
            retry_count: 0,
            last_retry_at: comment.created_at,
            error_class: class,
            exhausted: false,
            awaiting_retry: false,
        });
        r.phase = phase;
        r.error_class = class;
        r.last_retry_at = comment.created_at;
        r.exhausted |= tokens.exhausted;
        match tokens.retry {
            Some((attempt, _)) => {
                r.retry_count = r.retry_count.max(attempt);
                r.awaiting_retry = false;
            }
            None => r.awaiting_retry = true,
        }
    }
    record
}

//! Fleet-wide circuit breaker.
//!
//! A run of `threshold` consecutive failures sharing one error class trips
//! the breaker. While tripped, all dispatch is suppressed until the cooldown
//! ends; then one probe dispatch is let through at a time. Each probe doubles
//! the cooldown. A successful probe clears everything.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::to_chrono;
use crate::config::BreakerConfig;
use crate::failure::ErrorClass;
use crate::model::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub item: u64,
    pub error_class: ErrorClass,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystematicFailureState {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub probe_count: u32,
    /// Item currently running as the probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_item: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchGate {
    Open,
    Suppressed { until: DateTime<Utc> },
    /// Cooldown over: exactly one dispatch may go out as the probe.
    Probe,
    ProbeInFlight,
}

/// Breaker state plus its ring buffer. Lives inside `DaemonState`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breaker {
    pub events: VecDeque<FailureEvent>,
    pub state: SystematicFailureState,
}

#[derive(Debug, Clone)]
pub struct FailureDetector {
    threshold: usize,
    window: usize,
    base_cooldown: Duration,
    max_probes: u32,
}

impl FailureDetector {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.threshold.max(1),
            window: config.window.max(config.threshold).max(1),
            base_cooldown: Duration::from_secs(config.base_cooldown_secs),
            max_probes: config.max_probes,
        }
    }

    /// Append an event and trip if the newest `threshold` events share a class.
    /// Returns whether this event tripped the breaker.
    pub fn record(&self, breaker: &mut Breaker, event: FailureEvent, now: DateTime<Utc>) -> bool {
        breaker.events.push_back(event);
        while breaker.events.len() > self.window {
            breaker.events.pop_front();
        }
        if breaker.state.active {
            return false;
        }

        let Some(class) = self.run_class(&breaker.events) else {
            return false;
        };
        breaker.state = SystematicFailureState {
            active: true,
            pattern: Some(class),
            detected_at: Some(now),
            cooldown_until: Some(now + to_chrono(self.base_cooldown)),
            probe_count: 0,
            probe_item: None,
        };
        tracing::error!(
            error_class = %class,
            threshold = self.threshold,
            cooldown = ?self.base_cooldown,
            "systematic failure detected, suspending all dispatch"
        );
        true
    }

    /// Class shared by the newest `threshold` events, if they all agree.
    fn run_class(&self, events: &VecDeque<FailureEvent>) -> Option<ErrorClass> {
        if events.len() < self.threshold {
            return None;
        }
        let mut recent = events.iter().rev().take(self.threshold);
        let first = recent.next()?.error_class;
        recent.all(|e| e.error_class == first).then_some(first)
    }

    pub fn gate(&self, breaker: &Breaker, now: DateTime<Utc>) -> DispatchGate {
        let state = &breaker.state;
        if !state.active {
            return DispatchGate::Open;
        }
        if state.probe_item.is_some() {
            return DispatchGate::ProbeInFlight;
        }
        match state.cooldown_until {
            Some(until) if now < until => DispatchGate::Suppressed { until },
            _ => DispatchGate::Probe,
        }
    }

    /// Mark `item` as the probe and push the cooldown out.
    pub fn begin_probe(&self, breaker: &mut Breaker, item: u64, now: DateTime<Utc>) {
        let state = &mut breaker.state;
        state.probe_count = state.probe_count.saturating_add(1);
        state.probe_item = Some(item);
        let factor = 2u32.saturating_pow(state.probe_count);
        let cooldown = self.base_cooldown.saturating_mul(factor);
        state.cooldown_until = Some(now + to_chrono(cooldown));
        if state.probe_count > self.max_probes {
            tracing::warn!(
                item,
                probe_count = state.probe_count,
                max_probes = self.max_probes,
                "breaker probe count past configured maximum"
            );
        } else {
            tracing::info!(item, probe_count = state.probe_count, "dispatching breaker probe");
        }
    }

    /// Settle the probe for `item`. Success resets the breaker and clears the
    /// ring buffer; failure keeps it tripped with the extended cooldown.
    pub fn probe_finished(&self, breaker: &mut Breaker, item: u64, success: bool) {
        if breaker.state.probe_item != Some(item) {
            return;
        }
        if success {
            tracing::info!(item, "breaker probe succeeded, resuming dispatch");
            breaker.state = SystematicFailureState::default();
            breaker.events.clear();
        } else {
            breaker.state.probe_item = None;
            tracing::warn!(
                item,
                probe_count = breaker.state.probe_count,
                cooldown_until = ?breaker.state.cooldown_until,
                "breaker probe failed"
            );
        }
    }

    /// Release the probe slot without a verdict (shutdown, operator abort).
    pub fn abandon_probe(&self, breaker: &mut Breaker, item: u64) {
        if breaker.state.probe_item == Some(item) {
            breaker.state.probe_item = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::TimeDelta::seconds(secs)
    }

    fn detector() -> FailureDetector {
        FailureDetector::new(&BreakerConfig {
            threshold: 3,
            window: 10,
            base_cooldown_secs: 600,
            max_probes: 2,
        })
    }

    fn event(item: u64, class: ErrorClass) -> FailureEvent {
        FailureEvent {
            item,
            error_class: class,
            phase: Phase::Build,
            timestamp: t(0),
        }
    }

    #[test]
    fn threshold_identical_failures_trip() {
        let d = detector();
        let mut b = Breaker::default();
        assert!(!d.record(&mut b, event(1, ErrorClass::WorktreeFailed), t(0)));
        assert!(!d.record(&mut b, event(2, ErrorClass::WorktreeFailed), t(1)));
        assert!(d.record(&mut b, event(3, ErrorClass::WorktreeFailed), t(2)));
        assert!(b.state.active);
        assert_eq!(b.state.pattern, Some(ErrorClass::WorktreeFailed));
        assert_eq!(b.state.cooldown_until, Some(t(602)));
    }

    #[test]
    fn differing_class_breaks_the_run() {
        let d = detector();
        let mut b = Breaker::default();
        d.record(&mut b, event(1, ErrorClass::WorktreeFailed), t(0));
        d.record(&mut b, event(2, ErrorClass::WorktreeFailed), t(0));
        d.record(&mut b, event(3, ErrorClass::WorkerCrashed), t(0));
        d.record(&mut b, event(4, ErrorClass::WorktreeFailed), t(0));
        d.record(&mut b, event(5, ErrorClass::WorktreeFailed), t(0));
        assert!(!b.state.active);
        assert!(d.record(&mut b, event(6, ErrorClass::WorktreeFailed), t(0)));
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let d = detector();
        let mut b = Breaker::default();
        for i in 0..25 {
            let class = if i % 2 == 0 { ErrorClass::WorkerCrashed } else { ErrorClass::SpawnFailed };
            d.record(&mut b, event(i, class), t(0));
        }
        assert_eq!(b.events.len(), 10);
        assert_eq!(b.events.front().map(|e| e.item), Some(15));
    }

    #[test]
    fn gate_suppresses_until_cooldown_then_probes() {
        let d = detector();
        let mut b = Breaker::default();
        for i in 0..3 {
            d.record(&mut b, event(i, ErrorClass::SpawnFailed), t(0));
        }
        assert_eq!(d.gate(&b, t(599)), DispatchGate::Suppressed { until: t(600) });
        assert_eq!(d.gate(&b, t(600)), DispatchGate::Probe);

        d.begin_probe(&mut b, 9, t(600));
        assert_eq!(b.state.probe_count, 1);
        assert_eq!(b.state.cooldown_until, Some(t(600 + 1200)));
        assert_eq!(d.gate(&b, t(5000)), DispatchGate::ProbeInFlight);
    }

    #[test]
    fn failed_probe_keeps_extended_cooldown() {
        let d = detector();
        let mut b = Breaker::default();
        for i in 0..3 {
            d.record(&mut b, event(i, ErrorClass::SpawnFailed), t(0));
        }
        d.begin_probe(&mut b, 9, t(600));
        d.probe_finished(&mut b, 9, false);
        assert!(b.state.active);
        assert_eq!(d.gate(&b, t(1799)), DispatchGate::Suppressed { until: t(1800) });

        d.begin_probe(&mut b, 10, t(1800));
        assert_eq!(b.state.cooldown_until, Some(t(1800 + 2400)));
        d.probe_finished(&mut b, 10, false);
        // Past max_probes the cooldown keeps growing.
        d.begin_probe(&mut b, 11, t(4200));
        assert_eq!(b.state.probe_count, 3);
        assert_eq!(b.state.cooldown_until, Some(t(4200 + 4800)));
    }

    #[test]
    fn successful_probe_clears_state_and_buffer() {
        let d = detector();
        let mut b = Breaker::default();
        for i in 0..3 {
            d.record(&mut b, event(i, ErrorClass::SpawnFailed), t(0));
        }
        d.begin_probe(&mut b, 9, t(600));
        d.probe_finished(&mut b, 8, true);
        assert!(b.state.active, "only the probe item settles the probe");

        d.probe_finished(&mut b, 9, true);
        assert_eq!(b, Breaker::default());
        assert_eq!(d.gate(&b, t(600)), DispatchGate::Open);
    }

    #[test]
    fn abandoned_probe_frees_slot_without_verdict() {
        let d = detector();
        let mut b = Breaker::default();
        for i in 0..3 {
            d.record(&mut b, event(i, ErrorClass::SpawnFailed), t(0));
        }
        d.begin_probe(&mut b, 9, t(600));
        d.abandon_probe(&mut b, 9);
        assert!(b.state.active);
        assert_eq!(b.state.probe_count, 1);
        assert_eq!(d.gate(&b, t(1800)), DispatchGate::Probe);
    }
}

use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use super::{OutputFormat, ProjectArgs};
use crate::clock::{elapsed_between, format_duration};
use crate::daemon::LOCK_FILE;
use crate::daemon::archive::Archiver;
use crate::daemon::state::{DaemonState, StateFile};
use crate::signals::SignalStore;

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state_file: PathBuf,
    /// A daemon holds the state directory lock.
    pub running: bool,
    pub stop_requested: bool,
    pub paused: Vec<u64>,
    pub archives: usize,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DaemonState>,
}

impl StatusArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let (_, config) = self.project.load()?;
        let state_dir = &config.daemon.state_dir;
        let file = StateFile::new(state_dir);
        let signals = SignalStore::new(state_dir);

        let report = StatusReport {
            state_file: file.path().to_path_buf(),
            running: state_dir.join(LOCK_FILE).exists(),
            stop_requested: signals.stop_requested(),
            paused: signals.paused_items(),
            archives: Archiver::new(state_dir, config.daemon.max_archives).slots()?.len(),
            max_retries: config.retry.max_retries,
            state: file.load()?,
        };

        match format {
            OutputFormat::Pretty => print_pretty(&report),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        Ok(())
    }
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

fn print_pretty(report: &StatusReport) {
    println!("=== Foreman Status ===\n");
    println!("State:    {}", report.state_file.display());
    println!("Running:  {}", yes_no(report.running));
    if report.stop_requested {
        println!("Stop:     requested");
    }
    println!("Archives: {}", report.archives);

    let Some(state) = &report.state else {
        println!("\nNo daemon state recorded yet.");
        return;
    };
    let updated = state.updated_at.unwrap_or(state.started_at);
    println!("Started:  {}", state.started_at.to_rfc3339());
    println!("Updated:  {}", updated.to_rfc3339());
    println!("Iteration: {}", state.iteration);

    let breaker = &state.breaker.state;
    if breaker.active {
        let pattern = breaker.pattern.map_or_else(|| "unknown".to_string(), |p| p.to_string());
        let until = breaker.cooldown_until.map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        println!("\nBreaker: TRIPPED on {pattern}, cooldown until {until}, probes {}", breaker.probe_count);
        if let Some(item) = breaker.probe_item {
            println!("  probe in flight: #{item}");
        }
    } else {
        println!("\nBreaker: closed ({} recent failures)", state.breaker.events.len());
    }

    println!("\nIn flight ({}):", state.in_flight.len());
    for f in state.in_flight.values() {
        let age = format_duration(elapsed_between(f.started_at, updated));
        let probe = if f.probe { "  [probe]" } else { "" };
        println!("  #{:<6} {:<7} {}  {age}{probe}", f.item, f.phase.name(), f.session);
    }

    if !state.retries.is_empty() {
        println!("\nRetries:");
        for r in state.retries.values() {
            let status = if r.exhausted {
                "exhausted"
            } else if r.awaiting_retry {
                "waiting"
            } else {
                "retrying"
            };
            println!(
                "  #{:<6} {:<7} {:<22} {}/{}  {status}",
                r.item,
                r.phase.name(),
                r.error_class.as_str(),
                r.retry_count,
                report.max_retries
            );
        }
    }

    if !report.paused.is_empty() {
        let paused: Vec<String> = report.paused.iter().map(|n| format!("#{n}")).collect();
        println!("\nPaused: {}", paused.join(", "));
    }

    let c = &state.counters;
    println!(
        "\nCounters: dispatched {}, completed {}, failed {}, rejected {}, retried {}, exhausted {}, stopped {}, paused {}, recovered {}, stall warnings {}",
        c.dispatched, c.completed, c.failed, c.rejected, c.retried, c.exhausted, c.stopped, c.paused, c.recovered, c.stall_warnings
    );
}

fn print_text(report: &StatusReport) {
    println!(
        "foreman-status  running={}  stop_requested={}  archives={}",
        report.running, report.stop_requested, report.archives
    );
    let Some(state) = &report.state else {
        println!("state  none");
        return;
    };
    let breaker = &state.breaker.state;
    println!(
        "state  iteration={}  in_flight={}  retries={}  breaker={}",
        state.iteration,
        state.in_flight.len(),
        state.retries.len(),
        if breaker.active { "tripped" } else { "closed" }
    );
    for f in state.in_flight.values() {
        println!("in_flight  item={}  phase={}  session={}  probe={}", f.item, f.phase, f.session, f.probe);
    }
    for r in state.retries.values() {
        println!(
            "retry  item={}  phase={}  class={}  count={}/{}  awaiting={}  exhausted={}",
            r.item, r.phase, r.error_class, r.retry_count, report.max_retries, r.awaiting_retry, r.exhausted
        );
    }
    for n in &report.paused {
        println!("paused  item={n}");
    }
    let c = &state.counters;
    println!(
        "counters  dispatched={}  completed={}  failed={}  rejected={}  retried={}  exhausted={}",
        c.dispatched, c.completed, c.failed, c.rejected, c.retried, c.exhausted
    );
}

use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use super::{OutputFormat, ProjectArgs};
use crate::clock::SystemClock;
use crate::config::{Config, WorkspaceProvider};
use crate::daemon::state::DaemonState;
use crate::daemon::{Backends, Daemon, DispatchPlan, SkipReason, gate_label};
use crate::runtime::BottyRuntime;
use crate::signals::SignalStore;
use crate::store::GhStore;
use crate::workspace::{DirProvisioner, MawProvisioner, WorkspaceProvisioner};

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    /// Run a single iteration, wait for its sessions, then exit
    #[arg(long)]
    pub once: bool,
    /// Print what would be dispatched without changing anything
    #[arg(long)]
    pub dry_run: bool,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl RunArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let (root, config) = self.project.load()?;
        tracing::debug!(root = %root.display(), state_dir = %config.daemon.state_dir.display(), "resolved project");

        let signals = SignalStore::new(&config.daemon.state_dir);
        let backends = backends(&config);
        let mut daemon = Daemon::new(config, backends, signals.clone())?;

        if self.dry_run {
            let plan = daemon.plan()?;
            return print_plan(&plan, format);
        }

        signals.clear_stop()?;
        let handler_signals = signals.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            eprintln!("Received interrupt, finishing current iteration...");
            handler_signals.request_stop();
        }) {
            tracing::warn!(error = %e, "could not install Ctrl-C handler");
        }

        let state = daemon.run(self.once)?;
        print_summary(&state, format)
    }
}

/// Production adapters for the configured tracker, runtime and workspaces.
fn backends(config: &Config) -> Backends {
    let tracker = &config.tracker;
    let rt = &config.runtime;
    let ws = &config.workspace;
    let workspaces: Arc<dyn WorkspaceProvisioner> = match ws.provider {
        WorkspaceProvider::Maw => Arc::new(MawProvisioner::new(
            &ws.root,
            &ws.prefix,
            Duration::from_secs(ws.timeout_secs),
        )),
        WorkspaceProvider::Dir => Arc::new(DirProvisioner::new(&ws.root, &ws.prefix)),
    };
    Backends {
        store: Arc::new(GhStore::new(
            tracker.repo.clone(),
            Duration::from_secs(tracker.timeout_secs),
            tracker.list_limit,
        )),
        runtime: Arc::new(BottyRuntime::new(
            &rt.session_prefix,
            rt.tail_lines,
            rt.env_inherit.clone(),
            Duration::from_secs(rt.timeout_secs),
        )),
        workspaces,
        clock: Arc::new(SystemClock),
    }
}

const fn skip_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::InFlight => "in flight",
        SkipReason::Paused => "paused",
        SkipReason::Aborted => "aborted",
        SkipReason::AwaitingRetry => "waiting for retry cooldown",
        SkipReason::SessionLive => "session already running",
    }
}

fn print_plan(plan: &DispatchPlan, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(plan)?),
        OutputFormat::Pretty => {
            println!("=== Dispatch plan (dry run) ===\n");
            println!("Breaker: {}", gate_label(plan.gate));
            println!("Slots:   {}\n", plan.slots);
            if plan.eligible.is_empty() {
                println!("Nothing to dispatch.");
            }
            for (i, c) in plan.eligible.iter().enumerate() {
                let mark = if i < plan.slots { "->" } else { "  " };
                let note = if i < plan.slots { "" } else { "  (no slot)" };
                println!("{mark} #{:<6} {:<7} {}{note}", c.item, c.phase.name(), c.title);
            }
            if !plan.skipped.is_empty() {
                println!("\nSkipped:");
                for s in &plan.skipped {
                    println!("   #{:<6} {:<7} {}", s.item, s.phase.name(), skip_label(s.reason));
                }
            }
        }
        OutputFormat::Text => {
            println!("plan  gate={}  slots={}", gate_label(plan.gate), plan.slots);
            for c in plan.selected() {
                println!("dispatch  item={}  phase={}", c.item, c.phase);
            }
            for c in plan.eligible.iter().skip(plan.slots) {
                println!("wait  item={}  phase={}", c.item, c.phase);
            }
            for s in &plan.skipped {
                println!("skip  item={}  phase={}  reason={}", s.item, s.phase, skip_label(s.reason));
            }
        }
    }
    Ok(())
}

fn print_summary(state: &DaemonState, format: OutputFormat) -> anyhow::Result<()> {
    let c = &state.counters;
    match format {
        OutputFormat::Json => {
            let summary = state.summarize(state.updated_at.unwrap_or(state.started_at));
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Pretty | OutputFormat::Text => println!(
            "foreman stopped after {} iterations: dispatched={} completed={} failed={} rejected={} retried={} exhausted={}",
            state.iteration, c.dispatched, c.completed, c.failed, c.rejected, c.retried, c.exhausted
        ),
    }
    Ok(())
}

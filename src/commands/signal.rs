//! Operator signals for a running daemon, delivered through the state
//! directory.

use anyhow::Context;
use clap::Args;

use super::ProjectArgs;
use crate::signals::SignalStore;

#[derive(Debug, Args)]
pub struct StopArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl StopArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let signals = signals(&self.project)?;
        signals.write_stop().context("writing stop marker")?;
        println!("Stop requested. The daemon finishes its current iteration and exits.");
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct AbortArgs {
    /// Issue or pull request number
    pub item: u64,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl AbortArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let signals = signals(&self.project)?;
        signals.abort(self.item).context("writing abort marker")?;
        tracing::info!(item = self.item, "abort requested");
        println!(
            "Abort requested for #{}. Its session is killed and it is not dispatched until `foreman resume {}`.",
            self.item, self.item
        );
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct ResumeArgs {
    /// Issue or pull request number
    pub item: u64,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl ResumeArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let signals = signals(&self.project)?;
        let was_held = signals.paused(self.item) || signals.aborted(self.item);
        signals.resume(self.item).context("clearing item markers")?;
        if was_held {
            println!("Resumed #{}.", self.item);
        } else {
            println!("#{} was not paused or aborted.", self.item);
        }
        Ok(())
    }
}

fn signals(project: &ProjectArgs) -> anyhow::Result<SignalStore> {
    let (_, config) = project.load()?;
    Ok(SignalStore::new(&config.daemon.state_dir))
}

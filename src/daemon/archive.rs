//! Rotation of the state file into numbered archive slots.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};

use super::state::StateFile;

const ARCHIVE_DIR: &str = "archive";
const PREFIX: &str = "daemon-state.";
const SUFFIX: &str = ".json";

pub struct Archiver {
    state: StateFile,
    dir: PathBuf,
    max_archives: usize,
}

impl Archiver {
    pub fn new(state_dir: &Path, max_archives: usize) -> Self {
        Self {
            state: StateFile::new(state_dir),
            dir: state_dir.join(ARCHIVE_DIR),
            max_archives,
        }
    }

    /// Move the current state file aside.
    ///
    /// Non-trivial state gets a summary and the next archive number; trivial
    /// state is deleted. Returns the archive path, if one was written.
    pub fn rotate(&self, now: DateTime<Utc>) -> anyhow::Result<Option<PathBuf>> {
        let state = match self.state.load() {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(e) => {
                // Unreadable state is kept for inspection under the next slot.
                tracing::warn!(error = ?e, "state file unreadable, archiving as-is");
                let target = self.next_slot()?;
                std::fs::rename(self.state.path(), &target)
                    .with_context(|| format!("archiving {}", self.state.path().display()))?;
                self.prune()?;
                return Ok(Some(target));
            }
        };

        if state.is_trivial() {
            tracing::debug!("discarding trivial daemon state");
            std::fs::remove_file(self.state.path())
                .with_context(|| format!("removing {}", self.state.path().display()))?;
            return Ok(None);
        }

        let mut state = state;
        state.summary = Some(state.summarize(now));
        let target = self.next_slot()?;
        let json = serde_json::to_string_pretty(&state).context("serializing archived state")?;
        std::fs::write(&target, json).with_context(|| format!("writing {}", target.display()))?;
        std::fs::remove_file(self.state.path())
            .with_context(|| format!("removing {}", self.state.path().display()))?;
        tracing::info!(path = %target.display(), iterations = state.iteration, "archived daemon state");
        self.prune()?;
        Ok(Some(target))
    }

    /// Archive numbers present on disk, ascending.
    pub fn slots(&self) -> anyhow::Result<Vec<u64>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.dir.display())),
        };
        let mut slots: Vec<u64> = entries
            .filter_map(Result::ok)
            .filter_map(|e| parse_slot(&e.file_name().to_string_lossy()))
            .collect();
        slots.sort_unstable();
        Ok(slots)
    }

    pub fn slot_path(&self, n: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{n}{SUFFIX}"))
    }

    fn next_slot(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir.display()))?;
        let next = self.slots()?.last().map_or(1, |n| n + 1);
        Ok(self.slot_path(next))
    }

    fn prune(&self) -> anyhow::Result<()> {
        let slots = self.slots()?;
        let excess = slots.len().saturating_sub(self.max_archives);
        for n in &slots[..excess] {
            let path = self.slot_path(*n);
            std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            tracing::debug!(path = %path.display(), "pruned old archive");
        }
        Ok(())
    }
}

fn parse_slot(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
}

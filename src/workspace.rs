//! Workspace provisioner: one isolated checkout per work item.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::runtime::LiveSession;
use crate::subprocess::Tool;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace for #{item} is in use by session {session}")]
    InUse { item: u64, session: String },

    #[error("workspace operation failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for WorkspaceError {
    fn from(e: anyhow::Error) -> Self {
        WorkspaceError::Failed(format!("{e:#}"))
    }
}

pub trait WorkspaceProvisioner: Send + Sync {
    /// Where the workspace for `item` lives (whether or not it exists).
    fn path(&self, item: u64) -> PathBuf;

    fn exists(&self, item: u64) -> Result<bool, WorkspaceError>;

    /// Create the workspace if missing and return its path.
    fn ensure(&self, item: u64) -> Result<PathBuf, WorkspaceError>;

    /// Delete the workspace. Refuses while any of `live` is bound to `item`.
    fn remove(&self, item: u64, live: &[LiveSession]) -> Result<(), WorkspaceError>;

    /// Most recent modification inside the workspace, if it exists.
    fn last_activity(&self, item: u64) -> Option<DateTime<Utc>> {
        latest_mtime(&self.path(item))
    }
}

fn refuse_if_bound(item: u64, live: &[LiveSession]) -> Result<(), WorkspaceError> {
    match live.iter().find(|s| s.item == Some(item)) {
        Some(s) => Err(WorkspaceError::InUse {
            item,
            session: s.name.clone(),
        }),
        None => Ok(()),
    }
}

/// Newest mtime among the directory itself and its direct children.
fn latest_mtime(dir: &Path) -> Option<DateTime<Utc>> {
    let own = std::fs::metadata(dir).ok()?.modified().ok()?;
    let children = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok()?.modified().ok());
    children.chain(std::iter::once(own)).max().map(DateTime::<Utc>::from)
}

/// Workspaces managed by `maw` under `<root>/ws/<name>`.
pub struct MawProvisioner {
    root: PathBuf,
    prefix: String,
    timeout: Duration,
}

impl MawProvisioner {
    pub fn new(root: &Path, prefix: &str, timeout: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            prefix: prefix.to_string(),
            timeout,
        }
    }

    fn name(&self, item: u64) -> String {
        format!("{}-{item}", self.prefix)
    }

    fn maw(&self) -> Tool {
        Tool::new("maw").current_dir(&self.root).timeout(self.timeout)
    }
}

#[derive(Debug, Deserialize)]
struct WorkspaceList {
    #[serde(default)]
    workspaces: Vec<WorkspaceJson>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceJson {
    name: String,
}

fn parse_workspace_names(json: &str) -> Result<Vec<String>, WorkspaceError> {
    let list: WorkspaceList = serde_json::from_str(json)
        .map_err(|e| WorkspaceError::Failed(format!("failed to parse maw ws list output: {e}")))?;
    Ok(list.workspaces.into_iter().map(|w| w.name).collect())
}

impl WorkspaceProvisioner for MawProvisioner {
    fn path(&self, item: u64) -> PathBuf {
        self.root.join("ws").join(self.name(item))
    }

    fn exists(&self, item: u64) -> Result<bool, WorkspaceError> {
        let output = self.maw().args(&["ws", "list", "--format", "json"]).run_ok()?;
        let name = self.name(item);
        Ok(parse_workspace_names(&output.stdout)?.contains(&name))
    }

    fn ensure(&self, item: u64) -> Result<PathBuf, WorkspaceError> {
        if !self.exists(item)? {
            let name = self.name(item);
            self.maw().args(&["ws", "create", name.as_str()]).run_ok()?;
        }
        Ok(self.path(item))
    }

    fn remove(&self, item: u64, live: &[LiveSession]) -> Result<(), WorkspaceError> {
        refuse_if_bound(item, live)?;
        if !self.exists(item)? {
            return Ok(());
        }
        let name = self.name(item);
        self.maw().args(&["ws", "destroy", name.as_str()]).run_ok()?;
        Ok(())
    }
}

/// Plain directories under a root; no VCS integration.
pub struct DirProvisioner {
    root: PathBuf,
    prefix: String,
}

impl DirProvisioner {
    pub fn new(root: &Path, prefix: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            prefix: prefix.to_string(),
        }
    }
}

impl WorkspaceProvisioner for DirProvisioner {
    fn path(&self, item: u64) -> PathBuf {
        self.root.join(format!("{}-{item}", self.prefix))
    }

    fn exists(&self, item: u64) -> Result<bool, WorkspaceError> {
        Ok(self.path(item).is_dir())
    }

    fn ensure(&self, item: u64) -> Result<PathBuf, WorkspaceError> {
        let path = self.path(item);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn remove(&self, item: u64, live: &[LiveSession]) -> Result<(), WorkspaceError> {
        refuse_if_bound(item, live)?;
        let path = self.path(item);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}

pub mod init;
pub mod run;
pub mod schema;
pub mod signal;
pub mod status;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Explicit choice, else pretty on a terminal and plain text when piped.
    pub fn resolve(format: Option<Self>) -> Self {
        format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                Self::Pretty
            } else {
                Self::Text
            }
        })
    }
}

/// Where the project lives and which config to use.
#[derive(Debug, Clone, Args)]
pub struct ProjectArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Config file (default: .foreman.toml in the project root)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ProjectArgs {
    pub fn root(&self) -> anyhow::Result<PathBuf> {
        match &self.project_root {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir().context("reading current directory"),
        }
    }

    /// Load and validate the config, with relative paths resolved against
    /// the project root.
    pub fn load(&self) -> anyhow::Result<(PathBuf, Config)> {
        let root = self.root()?;
        let mut config = Config::discover(self.config.as_deref(), &root)?;
        config.daemon.state_dir = resolve(&root, &config.daemon.state_dir);
        config.workspace.root = resolve(&root, &config.workspace.root);
        Ok((root, config))
    }
}

/// Resolve a configured path: `~/` is the home directory, anything else
/// relative hangs off the project root.
fn resolve(root: &Path, path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

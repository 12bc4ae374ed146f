use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::config::{self, Config};
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Session name prefix (default: foreman)
    #[arg(long)]
    pub session_prefix: Option<String>,
    /// `owner/repo` of the tracker (default: inferred by gh)
    #[arg(long)]
    pub repo: Option<String>,
    /// Force overwrite existing config
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn execute(&self) -> Result<()> {
        let project_dir = match &self.project_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().context("reading current directory")?,
        };
        let config_path = project_dir.join(config::CONFIG_TOML);
        if config_path.exists() && !self.force {
            return Err(ExitError::Config(format!(
                "{} already exists; use --force to overwrite",
                config_path.display()
            ))
            .into());
        }

        let mut config = Config::default();
        if let Some(prefix) = &self.session_prefix {
            config.runtime.session_prefix.clone_from(prefix);
            config.workspace.prefix.clone_from(prefix);
        }
        config.tracker.repo.clone_from(&self.repo);
        config.validate()?;

        let toml_str = config.to_toml()?;
        fs::write(&config_path, toml_str).with_context(|| format!("writing {}", config_path.display()))?;
        println!("Generated {}", config::CONFIG_TOML);

        let state_dir = project_dir.join(&config.daemon.state_dir);
        fs::create_dir_all(&state_dir).with_context(|| format!("creating {}", state_dir.display()))?;
        println!("Created {}/", config.daemon.state_dir.display());
        Ok(())
    }
}

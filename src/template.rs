//! Template rendering for worker commands.

use std::path::Path;

use anyhow::Context;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::model::Phase;

/// Context data passed to command templates
#[derive(Debug, Serialize)]
pub struct CommandContext<'a> {
    pub item: u64,
    pub phase: &'static str,
    pub role: &'static str,
    /// Workspace path, empty for phases that run without one
    pub workspace: String,
    pub session: &'a str,
}

impl<'a> CommandContext<'a> {
    pub fn new(phase: Phase, item: u64, workspace: Option<&Path>, session: &'a str) -> Self {
        Self {
            item,
            phase: phase.name(),
            role: phase.role(),
            workspace: workspace.map(|p| p.display().to_string()).unwrap_or_default(),
            session,
        }
    }
}

/// Render each argument of a command template. Undefined variables are errors.
pub fn render_command(args: &[String], ctx: &CommandContext<'_>) -> anyhow::Result<Vec<String>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    args.iter()
        .enumerate()
        .map(|(i, arg)| {
            env.render_str(arg, ctx)
                .with_context(|| format!("rendering command argument {i} ({arg:?})"))
        })
        .collect()
}

//! Foreman - control plane for LLM worker sessions on a label-driven pipeline

pub mod audit;
pub mod breaker;
pub mod clock;
pub mod commands;
pub mod config;
pub mod contract;
pub mod daemon;
pub mod error;
pub mod failure;
pub mod model;
pub mod recovery;
pub mod retry;
pub mod runtime;
pub mod signals;
pub mod store;
pub mod subprocess;
pub mod supervisor;
pub mod telemetry;
pub mod template;
pub mod workspace;

//! Atlas Codex CLI — drives the extraction decision pipeline over local files.

pub mod commands;
pub mod config;
pub mod error;

pub use commands::GlobalOptions;
pub use config::{load_config, resolve_config_path, resolve_learning_path, resolve_memory_path};

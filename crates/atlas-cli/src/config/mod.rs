//! Configuration loading and resolution.

use std::path::{Path, PathBuf};

use anyhow::Context;
use atlas_core::PipelineConfig;

pub const CONFIG_ENV: &str = "ATLAS_CONFIG";
pub const LEARNING_ENV: &str = "ATLAS_LEARNING_FILE";

const CWD_DIR: &str = ".atlas";
const HOME_DIR: &str = ".atlas";
const CONFIG_FILE: &str = "config.json";
const LEARNING_FILE: &str = "learning.jsonl";
const MEMORY_FILE: &str = "selectors.json";

/// Resolve the pipeline config path: flag → `ATLAS_CONFIG` → `./.atlas` →
/// `$HOME/.atlas`. `None` means no file exists and defaults apply.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(env_path));
    }

    let cwd_config = PathBuf::from(CWD_DIR).join(CONFIG_FILE);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    let home_config = home_dir().join(HOME_DIR).join(CONFIG_FILE);
    home_config.exists().then_some(home_config)
}

/// Resolve the learning log path. Always returns a path; the file is
/// created on first append.
pub fn resolve_learning_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = std::env::var(LEARNING_ENV) {
        return PathBuf::from(env_path);
    }

    let cwd_dir = PathBuf::from(CWD_DIR);
    if cwd_dir.is_dir() {
        return cwd_dir.join(LEARNING_FILE);
    }

    home_dir().join(HOME_DIR).join(LEARNING_FILE)
}

/// Selector memory lives next to the learning log.
pub fn resolve_memory_path(learning: &Path) -> PathBuf {
    learning.with_file_name(MEMORY_FILE)
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load the resolved config, or defaults when there is none.
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<PipelineConfig> {
    match resolve_config_path(explicit) {
        Some(path) => PipelineConfig::from_file(&path)
            .with_context(|| format!("failed to load config: {}", path.display())),
        None => {
            tracing::debug!("No config file found; using defaults");
            Ok(PipelineConfig::default())
        }
    }
}

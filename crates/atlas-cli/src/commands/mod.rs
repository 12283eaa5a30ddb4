//! Subcommand implementations. Each returns the JSON document printed to
//! stdout so the binary stays a thin dispatcher.

pub mod collect;
pub mod discover;
pub mod plan;
pub mod process;
pub mod run;
pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;

use atlas_core::{
    Entity, ExtractionPipeline, LearningLog, PipelineConfig, SchemaContract, SelectorMemory,
    TaskDescription,
};

use crate::config::{load_config, resolve_learning_path, resolve_memory_path};

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config: Option<String>,
    pub learning_file: Option<String>,
}

impl GlobalOptions {
    pub fn config(&self) -> anyhow::Result<PipelineConfig> {
        load_config(self.config.as_deref())
    }

    pub fn learning_path(&self) -> PathBuf {
        resolve_learning_path(self.learning_file.as_deref())
    }

    pub fn memory_path(&self) -> PathBuf {
        resolve_memory_path(&self.learning_path())
    }

    /// Selector memory saved by earlier runs.
    pub fn selector_memory(&self) -> anyhow::Result<Arc<SelectorMemory>> {
        let path = self.memory_path();
        let memory = SelectorMemory::load(&path)
            .with_context(|| format!("failed to load selector memory: {}", path.display()))?;
        Ok(Arc::new(memory))
    }

    pub fn save_selector_memory(&self, memory: &SelectorMemory) -> anyhow::Result<()> {
        let path = self.memory_path();
        memory
            .save(&path)
            .with_context(|| format!("failed to save selector memory: {}", path.display()))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {what}: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {what}: {}", path.display()))
}

pub fn read_contract(path: &Path) -> anyhow::Result<SchemaContract> {
    let contract: SchemaContract = read_json(path, "contract")?;
    contract.validate()?;
    Ok(contract)
}

pub fn read_task(path: &Path) -> anyhow::Result<TaskDescription> {
    read_json(path, "task")
}

pub fn read_entities(path: &Path) -> anyhow::Result<Vec<Entity>> {
    read_json(path, "entities")
}

pub fn read_html(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read HTML: {}", path.display()))
}

/// Build a pipeline whose learning aggregate is replayed from the log.
/// With `persist`, new records are appended to the same log.
async fn open_pipeline(
    opts: &GlobalOptions,
    config: PipelineConfig,
    contract: SchemaContract,
    persist: bool,
) -> anyhow::Result<ExtractionPipeline> {
    let path = opts.learning_path();
    let learning = LearningLog::replay(&path, config.learning.clone())
        .with_context(|| format!("failed to replay learning log: {}", path.display()))?;
    tracing::debug!(
        "Learning log {}: {} records",
        path.display(),
        learning.total_records()
    );

    let mut builder = ExtractionPipeline::builder(config)
        .learning(Arc::new(learning))
        .memory(opts.selector_memory()?);
    if persist {
        let log = LearningLog::open(&path)
            .with_context(|| format!("failed to open learning log: {}", path.display()))?;
        builder = builder.learning_log(log);
    }
    let pipeline = builder.build()?;
    pipeline.register_contract(contract).await?;
    Ok(pipeline)
}

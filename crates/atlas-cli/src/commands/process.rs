//! `atlas process`: apply strict or soft mode to a batch of entities.

use std::path::Path;

use serde_json::Value;

use atlas_core::{ModeDecisionEngine, ProcessingMode};

use super::{read_contract, read_entities, GlobalOptions};

pub fn execute(
    opts: &GlobalOptions,
    entities: &Path,
    contract: &Path,
    mode: Option<ProcessingMode>,
    threshold: Option<f64>,
) -> anyhow::Result<Value> {
    let config = opts.config()?;
    let contract = read_contract(contract)?;
    let entities = read_entities(entities)?;

    let engine = ModeDecisionEngine::new(mode.unwrap_or(config.mode))
        .with_threshold(threshold.unwrap_or(config.soft_threshold))?;
    let result = engine.process_entities(entities, &contract)?;
    Ok(serde_json::to_value(result)?)
}

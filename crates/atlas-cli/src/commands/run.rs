//! `atlas run`: one full attempt, appended to the learning log. Selector
//! memory is saved even when the attempt fails.

use std::path::Path;

use serde_json::Value;

use atlas_core::ProcessingMode;

use super::{open_pipeline, read_contract, read_html, read_task, GlobalOptions};

pub async fn execute(
    opts: &GlobalOptions,
    task: &Path,
    html: &Path,
    contract: &Path,
    mode: Option<ProcessingMode>,
) -> anyhow::Result<Value> {
    let mut config = opts.config()?;
    if let Some(mode) = mode {
        config.mode = mode;
    }
    let task = read_task(task)?;
    let html = read_html(html)?;
    let contract = read_contract(contract)?;
    let contract_id = contract.id.clone();

    let pipeline = open_pipeline(opts, config, contract, true).await?;
    let outcome = pipeline.run(&task, &html, &contract_id).await;
    opts.save_selector_memory(pipeline.memory())?;
    Ok(serde_json::to_value(outcome?)?)
}

//! `atlas plan`: plan a task and run preflight without executing it.

use std::path::Path;

use serde_json::{json, Value};

use super::{open_pipeline, read_contract, read_task, GlobalOptions};

pub async fn execute(opts: &GlobalOptions, task: &Path, contract: &Path) -> anyhow::Result<Value> {
    let config = opts.config()?;
    let task = read_task(task)?;
    let contract = read_contract(contract)?;
    let contract_id = contract.id.clone();

    let pipeline = open_pipeline(opts, config, contract, false).await?;
    let (plan, preflight) = pipeline.plan(&task, &contract_id).await?;
    Ok(json!({ "plan": plan, "preflight": preflight }))
}

//! `atlas stats`: aggregate the learning log.

use serde_json::Value;

use atlas_core::LearningLog;

use super::GlobalOptions;

pub fn execute(opts: &GlobalOptions) -> anyhow::Result<Value> {
    let config = opts.config()?;
    let recorder = LearningLog::replay(opts.learning_path(), config.learning)?;
    Ok(serde_json::to_value(recorder.report())?)
}

//! Machine-readable error reports and exit codes.

use serde_json::{json, Value};

use atlas_core::PipelineError;

/// Exit codes, stable for scripts.
pub mod exit_codes {
    pub const FAILURE: i32 = 1;
    pub const STRICT_MODE: i32 = 2;
    pub const PLAN_INFEASIBLE: i32 = 3;
    pub const INVALID_INPUT: i32 = 4;
}

pub fn exit_code(err: &anyhow::Error) -> i32 {
    use exit_codes::*;
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::StrictMode { .. }) => STRICT_MODE,
        Some(PipelineError::PlanInfeasible { .. }) => PLAN_INFEASIBLE,
        Some(PipelineError::InvalidInput(_) | PipelineError::Contract(_) | PipelineError::Json(_)) => {
            INVALID_INPUT
        }
        _ => FAILURE,
    }
}

/// JSON body printed to stdout when a command fails.
pub fn error_report(err: &anyhow::Error) -> Value {
    let Some(pipeline_err) = err.downcast_ref::<PipelineError>() else {
        return json!({
            "success": false,
            "error": "failure",
            "message": format!("{err:#}"),
        });
    };

    let mut report = json!({
        "success": false,
        "error": pipeline_err.code(),
        "message": pipeline_err.to_string(),
    });
    match pipeline_err {
        PipelineError::StrictMode {
            dropped_count,
            original_count,
            required_fields,
        } => {
            report["dropped_count"] = json!(dropped_count);
            report["original_count"] = json!(original_count);
            report["required_fields"] = json!(required_fields);
        }
        PipelineError::PlanInfeasible {
            plan_id,
            recommendations,
        } => {
            report["plan_id"] = json!(plan_id);
            report["recommendations"] = json!(recommendations);
        }
        _ => {}
    }
    report
}

//! Preflight: feasibility check on a plan before any extraction runs.
//!
//! Blocking issues (contradictory constraints, a required field nothing can
//! locate, a plan built for another contract) abort the attempt before the
//! evidence pass or any external call. Everything else is advisory.

use serde::{Deserialize, Serialize};

use crate::contract::{FieldKind, SchemaContract};
use crate::learning::LearningHandle;
use crate::plan::{ExecutionPlan, OrderingRule};
use crate::types::{PipelineError, PipelineResult};

/// Assumed success rate for a required field only the AI step can supply.
pub const DEFAULT_AI_COVERAGE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ContradictoryConstraint,
    NoViableDetector,
    ContractMismatch,
    EmptyPlan,
    WeakDetector,
    PoorHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightIssue {
    pub kind: IssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    pub blocking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub plan_id: String,
    pub can_execute: bool,
    pub estimated_success_rate: f64,
    pub recommendations: Vec<String>,
    pub issues: Vec<PreflightIssue>,
}

impl PreflightReport {
    pub fn blocking(&self) -> impl Iterator<Item = &PreflightIssue> {
        self.issues.iter().filter(|i| i.blocking)
    }
}

#[derive(Clone, Default)]
pub struct PreflightEvaluator {
    learning: Option<LearningHandle>,
}

impl PreflightEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blend the signature's rolling score into the estimate.
    pub fn with_learning(mut self, learning: LearningHandle) -> Self {
        self.learning = Some(learning);
        self
    }

    pub fn check(&self, plan: &ExecutionPlan, contract: &SchemaContract) -> PreflightReport {
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();
        let mut block = |kind, field: Option<&str>, message: String, rec: String| {
            issues.push(PreflightIssue {
                kind,
                field: field.map(str::to_string),
                message,
                blocking: true,
            });
            recommendations.push(rec);
        };

        let c = &plan.constraints;
        if !(0.0..=1.0).contains(&plan.quality_threshold) {
            block(
                IssueKind::ContradictoryConstraint,
                None,
                format!("quality threshold {} is outside [0, 1]", plan.quality_threshold),
                "set quality_threshold between 0 and 1".into(),
            );
        }
        if c.max_items == Some(0) {
            block(
                IssueKind::ContradictoryConstraint,
                None,
                "max_items is 0, so no entity can ever be returned".into(),
                "raise max_items or remove the limit".into(),
            );
        }
        if c.max_time_ms == Some(0) {
            block(
                IssueKind::ContradictoryConstraint,
                None,
                "max_time_ms is 0, so no step can complete in time".into(),
                "raise max_time_ms or remove the limit".into(),
            );
        }
        if let OrderingRule::ByField { field, .. } = &c.ordering {
            if !contract.declares(field) {
                block(
                    IssueKind::ContradictoryConstraint,
                    Some(field.as_str()),
                    format!("ordering field `{field}` is not declared by {}", contract.id),
                    format!("declare `{field}` in the contract or order by document position"),
                );
            }
        }
        if plan.contract_id != contract.id {
            block(
                IssueKind::ContractMismatch,
                None,
                format!(
                    "plan targets contract {} but {} was supplied",
                    plan.contract_id, contract.id
                ),
                "re-plan against the supplied contract".into(),
            );
        }
        if plan.steps.is_empty() {
            block(
                IssueKind::EmptyPlan,
                None,
                "plan has no steps".into(),
                "re-plan the task".into(),
            );
        }

        let ai_step = plan.has_ai_step();
        let mut field_rates = Vec::new();
        for spec in contract.fields.iter().filter(|f| f.is_required()) {
            if spec.detector.is_viable() {
                field_rates.push(f64::from(spec.detector.confidence()));
            } else if ai_step {
                field_rates.push(DEFAULT_AI_COVERAGE);
            } else {
                field_rates.push(0.0);
                block(
                    IssueKind::NoViableDetector,
                    Some(spec.name.as_str()),
                    format!("required field `{}` has no viable detector", spec.name),
                    format!(
                        "add a CSS or label detector for `{}` or enable the AI-assisted capability",
                        spec.name
                    ),
                );
            }
        }

        for spec in contract
            .fields
            .iter()
            .filter(|f| f.kind == FieldKind::Expected && !f.detector.is_viable())
        {
            issues.push(PreflightIssue {
                kind: IssueKind::WeakDetector,
                field: Some(spec.name.clone()),
                message: format!("expected field `{}` has no viable detector", spec.name),
                blocking: false,
            });
        }

        let structural = if field_rates.is_empty() {
            1.0
        } else {
            field_rates.iter().sum::<f64>() / field_rates.len() as f64
        };
        let mut estimate = structural;
        if let Some(learning) = &self.learning {
            let attempts = learning.attempts(&plan.signature);
            if attempts >= learning.config().min_samples {
                if let Some(rolling) = learning.rolling_score(&plan.signature) {
                    estimate = (structural + rolling) / 2.0;
                }
            }
            if learning.should_retrain(&plan.signature) && !ai_step {
                issues.push(PreflightIssue {
                    kind: IssueKind::PoorHistory,
                    field: None,
                    message: format!("{} has a poor recent score", plan.signature),
                    blocking: false,
                });
                recommendations.push("consider an AI-assisted plan for this signature".into());
            }
        }

        let can_execute = !issues.iter().any(|i| i.blocking);
        let estimated_success_rate = if can_execute {
            estimate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if can_execute && estimated_success_rate < plan.quality_threshold {
            recommendations.push(format!(
                "estimated success {:.2} is below the quality threshold {:.2}",
                estimated_success_rate, plan.quality_threshold
            ));
        }

        tracing::debug!(
            "Preflight for plan {}: can_execute={can_execute}, estimate={estimated_success_rate:.2}",
            plan.id
        );
        PreflightReport {
            plan_id: plan.id.clone(),
            can_execute,
            estimated_success_rate,
            recommendations,
            issues,
        }
    }

    /// Like [`check`](Self::check), but an infeasible plan is an error.
    pub fn ensure_executable(
        &self,
        plan: &ExecutionPlan,
        contract: &SchemaContract,
    ) -> PipelineResult<PreflightReport> {
        let report = self.check(plan, contract);
        if !report.can_execute {
            tracing::warn!(
                "Plan {} aborted in preflight: {} blocking issue(s)",
                plan.id,
                report.blocking().count()
            );
            return Err(PipelineError::PlanInfeasible {
                plan_id: plan.id.clone(),
                recommendations: report.recommendations,
            });
        }
        Ok(report)
    }
}

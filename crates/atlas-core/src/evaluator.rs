//! Outcome evaluator: scores an executed plan against its declared targets.
//!
//! The score is a weighted blend of required-field coverage, item count and
//! ordering conformance, with a flat penalty when the attempt overran its
//! time budget. Coverage is measured against the required fields of the
//! contract the plan was built for, so fields demoted during the attempt
//! still count as missing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::plan::{ExecutionPlan, OrderingRule};
use crate::types::{has_value, Entity};

pub const COVERAGE_WEIGHT: f64 = 0.5;
pub const COUNT_WEIGHT: f64 = 0.3;
pub const ORDERING_WEIGHT: f64 = 0.2;

/// Multiplier applied when `max_time_ms` was exceeded.
pub const OVERTIME_FACTOR: f64 = 0.9;

/// What an attempt produced, as seen by the evaluator.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOutcome<'a> {
    pub entities: &'a [Entity],
    /// Required fields of the contract the plan targeted.
    pub required_fields: &'a [String],
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub plan_id: String,
    pub score: f64,
    pub coverage: f64,
    pub count_score: f64,
    pub ordering_score: f64,
    pub field_coverage: BTreeMap<String, f64>,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub meets_threshold: bool,
}

impl Evaluation {
    /// Zero-score evaluation for an attempt that produced nothing usable.
    pub fn failed(plan: &ExecutionPlan, issue: impl Into<String>) -> Self {
        Self {
            plan_id: plan.id.clone(),
            score: 0.0,
            coverage: 0.0,
            count_score: 0.0,
            ordering_score: 0.0,
            field_coverage: BTreeMap::new(),
            issues: vec![issue.into()],
            suggestions: Vec::new(),
            meets_threshold: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutcomeEvaluator;

impl OutcomeEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, plan: &ExecutionPlan, outcome: &ExecutionOutcome<'_>) -> Evaluation {
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();
        let entities = outcome.entities;
        let n = entities.len();

        let field_coverage: BTreeMap<String, f64> = outcome
            .required_fields
            .iter()
            .map(|f| {
                let rate = if n == 0 {
                    0.0
                } else {
                    entities.iter().filter(|e| has_value(e, f)).count() as f64 / n as f64
                };
                (f.clone(), rate)
            })
            .collect();
        let coverage = if n == 0 {
            0.0
        } else if field_coverage.is_empty() {
            1.0
        } else {
            field_coverage.values().sum::<f64>() / field_coverage.len() as f64
        };
        for (field, rate) in field_coverage.iter().filter(|(_, r)| **r < 1.0) {
            issues.push(format!(
                "required field `{field}` present in {:.0}% of entities",
                rate * 100.0
            ));
            suggestions.push(format!("add fallback selectors or a label detector for `{field}`"));
        }

        let count_score = match plan.constraints.max_items {
            _ if n == 0 => {
                issues.push("no entities were produced".into());
                suggestions.push("check the record selector and field detectors".into());
                0.0
            }
            Some(max) if n > max => {
                issues.push(format!("{n} entities exceed max_items {max}"));
                max as f64 / n as f64
            }
            _ => 1.0,
        };

        let ordering_score = if n == 0 {
            0.0
        } else {
            plan.constraints.ordering.conformance(entities)
        };
        if n > 0 && ordering_score < 1.0 {
            if let OrderingRule::ByField { field, .. } = &plan.constraints.ordering {
                issues.push(format!("entities are not fully ordered by `{field}`"));
                suggestions.push(format!("ensure `{field}` is extracted as a comparable value"));
            }
        }

        let mut score = COVERAGE_WEIGHT * coverage
            + COUNT_WEIGHT * count_score
            + ORDERING_WEIGHT * ordering_score;
        if let Some(budget) = plan.constraints.max_time_ms {
            if outcome.elapsed_ms > budget {
                issues.push(format!(
                    "attempt took {}ms, over the {budget}ms budget",
                    outcome.elapsed_ms
                ));
                score *= OVERTIME_FACTOR;
            }
        }
        let score = score.clamp(0.0, 1.0);
        let meets_threshold = score >= plan.quality_threshold;
        if !meets_threshold {
            suggestions.push(format!(
                "score {score:.2} is below {:.2}; consider an AI-assisted plan",
                plan.quality_threshold
            ));
        }

        tracing::debug!("Evaluated plan {}: score {score:.3}", plan.id);
        Evaluation {
            plan_id: plan.id.clone(),
            score,
            coverage,
            count_score,
            ordering_score,
            field_coverage,
            issues,
            suggestions,
            meets_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{FieldKind, FieldSpec, SchemaContract};
    use crate::plan::{PlanConstraints, RuleBasedPlanner, SortDirection, TaskDescription};
    use crate::strategy::Detector;
    use serde_json::json;

    fn plan(constraints: PlanConstraints) -> ExecutionPlan {
        let contract = SchemaContract::new(
            "c",
            vec![FieldSpec::new(
                "name",
                FieldKind::Required,
                Detector::Css {
                    selector: ".n".into(),
                    fallbacks: vec![],
                    confidence: 0.9,
                },
            )],
        )
        .unwrap();
        RuleBasedPlanner::new().build(
            &TaskDescription::new("a.com", "item").with_constraints(constraints),
            &contract,
        )
    }

    fn entities(values: &[serde_json::Value]) -> Vec<Entity> {
        values.iter().map(|v| v.as_object().cloned().unwrap()).collect()
    }

    #[test]
    fn test_perfect_outcome_scores_one() {
        let plan = plan(PlanConstraints::default());
        let rows = entities(&[json!({"name": "a"}), json!({"name": "b"})]);
        let required = vec!["name".to_string()];
        let eval = OutcomeEvaluator::new().evaluate(
            &plan,
            &ExecutionOutcome {
                entities: &rows,
                required_fields: &required,
                elapsed_ms: 5,
            },
        );
        assert!((eval.score - 1.0).abs() < 1e-9);
        assert!(eval.meets_threshold);
        assert!(eval.issues.is_empty());
    }

    #[test]
    fn test_partial_coverage_and_disorder() {
        let plan = plan(PlanConstraints {
            max_time_ms: Some(10),
            ordering: OrderingRule::ByField {
                field: "name".into(),
                direction: SortDirection::Ascending,
            },
            ..PlanConstraints::default()
        });
        let rows = entities(&[json!({"name": "b"}), json!({"name": "a"}), json!({})]);
        let required = vec!["name".to_string()];
        let eval = OutcomeEvaluator::new().evaluate(
            &plan,
            &ExecutionOutcome {
                entities: &rows,
                required_fields: &required,
                elapsed_ms: 50,
            },
        );
        let expected = (0.5 * (2.0 / 3.0) + 0.3 * 1.0 + 0.2 * 0.5) * OVERTIME_FACTOR;
        assert!((eval.score - expected).abs() < 1e-9);
        assert!(!eval.meets_threshold);
        assert_eq!(eval.issues.len(), 3);
    }

    #[test]
    fn test_empty_outcome_scores_zero() {
        let plan = plan(PlanConstraints::default());
        let required = vec!["name".to_string()];
        let eval = OutcomeEvaluator::new().evaluate(
            &plan,
            &ExecutionOutcome {
                entities: &[],
                required_fields: &required,
                elapsed_ms: 0,
            },
        );
        assert_eq!(eval.coverage, 0.0);
        assert_eq!(eval.count_score, 0.0);
        assert_eq!(eval.score, 0.0);
        assert!(!eval.suggestions.is_empty());
    }
}

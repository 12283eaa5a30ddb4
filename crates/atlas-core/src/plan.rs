//! Execution planning and strategy selection.
//!
//! Two planners implement one [`Planner`] capability. The rule-based planner
//! is deterministic and never leaves the process. The AI-assisted planner
//! asks the external capability for a plan, under a timeout, and falls back
//! to the rule-based plan on any failure. The [`StrategySelector`] picks
//! between them from what was available at construction, whether the
//! contract can be resolved deterministically, and what the learning
//! aggregate says about the task signature.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::{invoke_with_timeout, ExtractionCapability, PlanRequest};
use crate::contract::{FieldKind, SchemaContract};
use crate::learning::LearningHandle;
use crate::types::{is_present, CapabilityError, Entity, PipelineError, PipelineResult, TaskSignature};

/// Estimated cost of any attempt.
pub const BASE_ATTEMPT_COST: f64 = 0.0001;

/// Extra estimated cost when a plan calls the external capability.
pub const AI_STEP_COST: f64 = 0.0004;

fn default_quality_threshold() -> f64 {
    0.7
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Deterministic ordering rule the output must follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderingRule {
    #[default]
    DocumentOrder,
    ByField {
        field: String,
        direction: SortDirection,
    },
}

impl OrderingRule {
    /// Stable sort. Entities without a value for the field go last.
    pub fn apply(&self, entities: &mut [Entity]) {
        if let OrderingRule::ByField { field, direction } = self {
            entities.sort_by(|a, b| compare_by_field(a, b, field, *direction));
        }
    }

    /// Fraction of adjacent entity pairs already in order.
    pub fn conformance(&self, entities: &[Entity]) -> f64 {
        let OrderingRule::ByField { field, direction } = self else {
            return 1.0;
        };
        if entities.len() < 2 {
            return 1.0;
        }
        let in_order = entities
            .windows(2)
            .filter(|w| compare_by_field(&w[0], &w[1], field, *direction) != Ordering::Greater)
            .count();
        in_order as f64 / (entities.len() - 1) as f64
    }
}

fn compare_by_field(a: &Entity, b: &Entity, field: &str, direction: SortDirection) -> Ordering {
    let value = |e: &Entity| e.get(field).filter(|v| is_present(v)).cloned();
    match (value(a), value(b)) {
        (Some(x), Some(y)) => {
            let ord = compare_values(&x, &y);
            match direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Numeric when both sides parse as numbers, lexical otherwise.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn as_number(v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().replace(',', "").parse().ok(),
            _ => None,
        }
    }
    fn as_text(v: &Value) -> String {
        match v {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string(),
        }
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => as_text(a).cmp(&as_text(b)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConstraints {
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub max_time_ms: Option<u64>,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default)]
    pub ordering: OrderingRule,
}

impl Default for PlanConstraints {
    fn default() -> Self {
        Self {
            max_items: None,
            max_time_ms: None,
            quality_threshold: default_quality_threshold(),
            ordering: OrderingRule::DocumentOrder,
        }
    }
}

/// What the caller wants extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub domain: String,
    pub target_type: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub constraints: PlanConstraints,
}

impl TaskDescription {
    pub fn new(domain: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            target_type: target_type.into(),
            instructions: String::new(),
            constraints: PlanConstraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: PlanConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn signature(&self) -> TaskSignature {
        TaskSignature::new(&self.domain, &self.target_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RuleBased,
    AiAssisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    /// The contract's own detectors.
    ContractSelectors,
    /// Repeated label patterns not in the contract.
    StructuralDiscovery,
    /// The external AI-assisted capability.
    AiCapability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub order: usize,
    pub source: EvidenceSource,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub signature: TaskSignature,
    pub strategy: StrategyKind,
    pub steps: Vec<PlanStep>,
    pub quality_threshold: f64,
    pub constraints: PlanConstraints,
    pub contract_id: String,
    pub contract_version: u32,
    pub estimated_cost: f64,
    /// The AI planner failed and this plan came from the rule-based path.
    #[serde(default)]
    pub fell_back: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    fn new(
        task: &TaskDescription,
        contract: &SchemaContract,
        strategy: StrategyKind,
        steps: Vec<PlanStep>,
    ) -> Self {
        let mut plan = Self {
            id: uuid::Uuid::new_v4().to_string(),
            signature: task.signature(),
            strategy,
            steps: Vec::new(),
            quality_threshold: task.constraints.quality_threshold,
            constraints: task.constraints.clone(),
            contract_id: contract.id.clone(),
            contract_version: contract.version,
            estimated_cost: 0.0,
            fell_back: false,
            rationale: None,
            created_at: Utc::now(),
        };
        plan.set_steps(steps);
        plan
    }

    /// Replace the steps, renumbering them and recomputing cost.
    fn set_steps(&mut self, mut steps: Vec<PlanStep>) {
        for (i, step) in steps.iter_mut().enumerate() {
            step.order = i + 1;
        }
        self.steps = steps;
        self.estimated_cost = BASE_ATTEMPT_COST
            + if self.has_ai_step() {
                AI_STEP_COST
            } else {
                0.0
            };
    }

    pub fn has_ai_step(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.source == EvidenceSource::AiCapability)
    }
}

/// Produce a plan from a task.
#[async_trait]
pub trait Planner: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn plan(
        &self,
        task: &TaskDescription,
        contract: &SchemaContract,
    ) -> PipelineResult<ExecutionPlan>;
}

// ── Rule-based ───────────────────────────────────────────────────────────────

/// Which required fields the contract can locate without help.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved: Vec<String>,
    pub unresolved: Vec<String>,
}

impl Resolution {
    pub fn is_confident(&self) -> bool {
        self.unresolved.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleBasedPlanner;

impl RuleBasedPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn assess(&self, contract: &SchemaContract) -> Resolution {
        let mut resolution = Resolution::default();
        for spec in contract.fields.iter().filter(|f| f.is_required()) {
            if spec.detector.is_viable() {
                resolution.resolved.push(spec.name.clone());
            } else {
                resolution.unresolved.push(spec.name.clone());
            }
        }
        resolution
    }

    /// Deterministic plan: contract selectors first, then discovery.
    pub fn build(&self, task: &TaskDescription, contract: &SchemaContract) -> ExecutionPlan {
        let selector_fields: Vec<String> = contract
            .fields
            .iter()
            .filter(|f| f.kind != FieldKind::Discoverable && f.detector.is_viable())
            .map(|f| f.name.clone())
            .collect();
        let steps = vec![
            PlanStep {
                order: 1,
                source: EvidenceSource::ContractSelectors,
                fields: selector_fields,
                description: "run contract detectors, extractors and validators".into(),
            },
            PlanStep {
                order: 2,
                source: EvidenceSource::StructuralDiscovery,
                fields: Vec::new(),
                description: "group repeated label patterns not in the contract".into(),
            },
        ];
        let mut plan = ExecutionPlan::new(task, contract, StrategyKind::RuleBased, steps);
        let resolution = self.assess(contract);
        if !resolution.is_confident() {
            plan.rationale = Some(format!(
                "no viable detector for: {}",
                resolution.unresolved.join(", ")
            ));
        }
        plan
    }
}

#[async_trait]
impl Planner for RuleBasedPlanner {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RuleBased
    }

    async fn plan(
        &self,
        task: &TaskDescription,
        contract: &SchemaContract,
    ) -> PipelineResult<ExecutionPlan> {
        Ok(self.build(task, contract))
    }
}

// ── AI-assisted ──────────────────────────────────────────────────────────────

pub struct AiAssistedPlanner {
    capability: Arc<dyn ExtractionCapability>,
    timeout: Duration,
    fallback: RuleBasedPlanner,
}

impl AiAssistedPlanner {
    pub fn new(capability: Arc<dyn ExtractionCapability>, timeout: Duration) -> Self {
        Self {
            capability,
            timeout,
            fallback: RuleBasedPlanner,
        }
    }

    /// Plan without calling the capability: the deterministic steps plus one
    /// capability step for the required fields markup cannot supply. An
    /// attempt spends its single capability call on that step.
    pub fn draft(&self, task: &TaskDescription, contract: &SchemaContract) -> ExecutionPlan {
        let resolution = self.fallback.assess(contract);
        let mut steps = self.fallback.build(task, contract).steps;
        steps.push(PlanStep {
            order: 0,
            source: EvidenceSource::AiCapability,
            fields: resolution.unresolved,
            description: "ask the capability for schema and data".into(),
        });
        let mut plan = ExecutionPlan::new(task, contract, StrategyKind::AiAssisted, steps);
        plan.rationale = Some(format!("{} supplies schema and data", self.capability.name()));
        plan
    }
}

#[async_trait]
impl Planner for AiAssistedPlanner {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AiAssisted
    }

    async fn plan(
        &self,
        task: &TaskDescription,
        contract: &SchemaContract,
    ) -> PipelineResult<ExecutionPlan> {
        let resolution = self.fallback.assess(contract);
        let request = PlanRequest {
            instructions: task.instructions.clone(),
            domain: task.domain.clone(),
            target_type: task.target_type.clone(),
            required_fields: contract.required_fields(),
            unresolved_fields: resolution.unresolved.clone(),
            constraints: task.constraints.clone(),
        };

        match invoke_with_timeout(self.timeout, self.capability.generate_plan(&request)).await {
            Ok(proposal) => {
                let mut steps = proposal.steps;
                if !steps.iter().any(|s| s.source == EvidenceSource::AiCapability) {
                    steps.push(PlanStep {
                        order: 0,
                        source: EvidenceSource::AiCapability,
                        fields: resolution.unresolved.clone(),
                        description: "ask the capability for schema and data".into(),
                    });
                }
                let mut plan = ExecutionPlan::new(task, contract, StrategyKind::AiAssisted, steps);
                plan.rationale = proposal.rationale;
                tracing::info!(
                    "{} planned {} in {} steps",
                    self.capability.name(),
                    plan.signature,
                    plan.steps.len()
                );
                Ok(plan)
            }
            Err(e) => {
                tracing::warn!(
                    "{} planning failed for {}: {e}; using rule-based plan",
                    self.capability.name(),
                    task.signature()
                );
                let mut plan = self.fallback.build(task, contract);
                plan.fell_back = true;
                plan.rationale = Some(format!("capability planning failed: {e}"));
                Ok(plan)
            }
        }
    }
}

// ── Selector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyChoice {
    pub kind: StrategyKind,
    pub reason: String,
}

/// Chooses a planner per task and delegates to it.
pub struct StrategySelector {
    rule: RuleBasedPlanner,
    ai: Option<AiAssistedPlanner>,
    learning: LearningHandle,
}

impl StrategySelector {
    /// Rule-based only: nothing leaves the process.
    pub fn rule_based(learning: LearningHandle) -> Self {
        Self {
            rule: RuleBasedPlanner,
            ai: None,
            learning,
        }
    }

    pub fn with_ai(learning: LearningHandle, ai: AiAssistedPlanner) -> Self {
        Self {
            rule: RuleBasedPlanner,
            ai: Some(ai),
            learning,
        }
    }

    pub fn choose(&self, task: &TaskDescription, contract: &SchemaContract) -> StrategyChoice {
        if self.ai.is_none() {
            return StrategyChoice {
                kind: StrategyKind::RuleBased,
                reason: "no AI-assisted capability configured".into(),
            };
        }
        let resolution = self.rule.assess(contract);
        if !resolution.is_confident() {
            return StrategyChoice {
                kind: StrategyKind::AiAssisted,
                reason: format!(
                    "rule-based planner cannot resolve: {}",
                    resolution.unresolved.join(", ")
                ),
            };
        }
        let signature = task.signature();
        if self.learning.should_retrain(&signature) {
            return StrategyChoice {
                kind: StrategyKind::AiAssisted,
                reason: format!("rolling score for {signature} is below the retrain bound"),
            };
        }
        StrategyChoice {
            kind: StrategyKind::RuleBased,
            reason: "contract resolves deterministically".into(),
        }
    }

    pub fn planner(&self, kind: StrategyKind) -> PipelineResult<&dyn Planner> {
        match kind {
            StrategyKind::RuleBased => Ok(&self.rule as &dyn Planner),
            StrategyKind::AiAssisted => self
                .ai
                .as_ref()
                .map(|p| p as &dyn Planner)
                .ok_or(PipelineError::Capability(CapabilityError::Unavailable)),
        }
    }

    /// Choose a strategy and produce its plan.
    pub async fn plan(
        &self,
        task: &TaskDescription,
        contract: &SchemaContract,
    ) -> PipelineResult<ExecutionPlan> {
        let choice = self.choose(task, contract);
        tracing::info!("Strategy for {}: {:?} ({})", task.signature(), choice.kind, choice.reason);
        self.planner(choice.kind)?.plan(task, contract).await
    }

    /// Choose a strategy and draft its plan without any capability call.
    pub fn draft(
        &self,
        task: &TaskDescription,
        contract: &SchemaContract,
    ) -> PipelineResult<ExecutionPlan> {
        let choice = self.choose(task, contract);
        tracing::info!("Strategy for {}: {:?} ({})", task.signature(), choice.kind, choice.reason);
        match (choice.kind, &self.ai) {
            (StrategyKind::RuleBased, _) => Ok(self.rule.build(task, contract)),
            (StrategyKind::AiAssisted, Some(ai)) => Ok(ai.draft(task, contract)),
            (StrategyKind::AiAssisted, None) => {
                Err(PipelineError::Capability(CapabilityError::Unavailable))
            }
        }
    }
}

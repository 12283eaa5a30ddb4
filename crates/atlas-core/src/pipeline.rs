//! The extraction pipeline: one attempt from task to learning record.
//!
//! ```text
//! select strategy → plan → preflight → evidence pass → [AI step]
//!   → limit/order → mode decision → commit contract → evaluate → learn
//! ```
//!
//! An attempt calls the external capability at most once, for the AI step.
//! Its plan is drafted locally; capability planning is only used by
//! [`ExtractionPipeline::plan`].
//!
//! Document parsing and the evidence pass are synchronous and finish before
//! the first `.await` that could suspend, so the future stays `Send` even
//! though `scraper` documents are not.

use std::sync::Arc;
use std::time::Instant;

use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::capability::{invoke_with_timeout, ExtractionCapability, SchemaProposal, SchemaRequest};
use crate::config::PipelineConfig;
use crate::contract::{ContractArena, SchemaContract};
use crate::evaluator::{Evaluation, ExecutionOutcome, OutcomeEvaluator};
use crate::evidence::{CandidatePattern, EvidenceCollector, Findings, FindingsSummary};
use crate::learning::{LearningHandle, LearningLog, LearningRecord, LearningRecorder, RecordFlags};
use crate::memory::SelectorMemory;
use crate::mode::{ModeDecisionEngine, ModeProcessingResult};
use crate::plan::{AiAssistedPlanner, ExecutionPlan, StrategySelector, TaskDescription};
use crate::preflight::{PreflightEvaluator, PreflightReport};
use crate::types::{CapabilityError, Entity, PipelineError, PipelineResult};

/// Everything one attempt produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptReport {
    pub plan: ExecutionPlan,
    pub preflight: PreflightReport,
    pub findings: FindingsSummary,
    pub candidates: Vec<CandidatePattern>,
    pub result: ModeProcessingResult,
    pub evaluation: Evaluation,
    pub learning: LearningRecord,
    /// The capability was skipped, failed or timed out somewhere.
    pub fell_back: bool,
    pub ai_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_schema: Option<Value>,
    pub elapsed_ms: u64,
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    capability: Option<Arc<dyn ExtractionCapability>>,
    learning: Option<LearningHandle>,
    memory: Option<Arc<SelectorMemory>>,
    log: Option<LearningLog>,
}

impl PipelineBuilder {
    pub fn capability(mut self, capability: Arc<dyn ExtractionCapability>) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Share a learning aggregate with other pipelines.
    pub fn learning(mut self, learning: LearningHandle) -> Self {
        self.learning = Some(learning);
        self
    }

    pub fn memory(mut self, memory: Arc<SelectorMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Persist every learning record to this log.
    pub fn learning_log(mut self, log: LearningLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> PipelineResult<ExtractionPipeline> {
        self.config.validate()?;
        let learning = self
            .learning
            .unwrap_or_else(|| Arc::new(LearningRecorder::new(self.config.learning.clone())));
        let memory = self.memory.unwrap_or_default();
        let selector = match &self.capability {
            Some(capability) => StrategySelector::with_ai(
                learning.clone(),
                AiAssistedPlanner::new(capability.clone(), self.config.capability_timeout()),
            ),
            None => StrategySelector::rule_based(learning.clone()),
        };
        let collector = EvidenceCollector::new()
            .with_memory(memory.clone())
            .with_max_samples(self.config.max_samples)
            .with_min_confidence(self.config.min_hit_confidence);

        Ok(ExtractionPipeline {
            mode: self.config.mode_engine()?,
            contracts: RwLock::new(ContractArena::new()),
            collector,
            selector,
            preflight: PreflightEvaluator::new().with_learning(learning.clone()),
            evaluator: OutcomeEvaluator::new(),
            capability: self.capability,
            log: self.log.map(Mutex::new),
            config: self.config,
            learning,
            memory,
        })
    }
}

pub struct ExtractionPipeline {
    config: PipelineConfig,
    mode: ModeDecisionEngine,
    contracts: RwLock<ContractArena>,
    collector: EvidenceCollector,
    selector: StrategySelector,
    preflight: PreflightEvaluator,
    evaluator: OutcomeEvaluator,
    learning: LearningHandle,
    memory: Arc<SelectorMemory>,
    capability: Option<Arc<dyn ExtractionCapability>>,
    log: Option<Mutex<LearningLog>>,
}

impl ExtractionPipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            capability: None,
            learning: None,
            memory: None,
            log: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn learning(&self) -> &LearningHandle {
        &self.learning
    }

    pub fn memory(&self) -> &Arc<SelectorMemory> {
        &self.memory
    }

    pub async fn register_contract(&self, contract: SchemaContract) -> PipelineResult<Arc<SchemaContract>> {
        self.contracts.write().await.register(contract)
    }

    /// Store a contract version derived outside an attempt, e.g. a promotion.
    pub async fn commit_contract(&self, contract: SchemaContract) -> PipelineResult<Arc<SchemaContract>> {
        self.contracts.write().await.commit(contract)
    }

    pub async fn contract(&self, id: &str) -> Option<Arc<SchemaContract>> {
        self.contracts.read().await.latest(id)
    }

    pub async fn contract_history(&self, id: &str) -> Vec<Arc<SchemaContract>> {
        self.contracts.read().await.history(id).to_vec()
    }

    async fn latest(&self, id: &str) -> PipelineResult<Arc<SchemaContract>> {
        self.contract(id)
            .await
            .ok_or_else(|| PipelineError::Contract(format!("contract {id} is not registered")))
    }

    /// Plan a task and report on its feasibility without executing it. An
    /// AI-assisted plan here comes from the capability's planning call.
    pub async fn plan(
        &self,
        task: &TaskDescription,
        contract_id: &str,
    ) -> PipelineResult<(ExecutionPlan, PreflightReport)> {
        let contract = self.latest(contract_id).await?;
        let plan = self.selector.plan(task, &contract).await?;
        let report = self.preflight.check(&plan, &contract);
        Ok((plan, report))
    }

    /// Run the evidence pass alone.
    pub async fn collect(
        &self,
        html: &str,
        contract_id: &str,
        domain: Option<&str>,
    ) -> PipelineResult<(Findings, Vec<Entity>)> {
        let contract = self.latest(contract_id).await?;
        let document = Html::parse_document(html);
        self.collector.collect_entities(&document, &contract, domain)
    }

    /// Execute one attempt end to end.
    pub async fn run(
        &self,
        task: &TaskDescription,
        html: &str,
        contract_id: &str,
    ) -> PipelineResult<AttemptReport> {
        let started = Instant::now();
        let contract = self.latest(contract_id).await?;
        let plan = self.selector.draft(task, &contract)?;
        let preflight = self.preflight.ensure_executable(&plan, &contract)?;

        let (findings, mut entities) = {
            let document = Html::parse_document(html);
            self.collector
                .collect_entities(&document, &contract, Some(task.domain.as_str()))?
        };

        let mut fell_back = plan.fell_back;
        let mut ai_used = false;
        let mut ai_schema = None;
        if plan.has_ai_step() {
            match self.ai_extract(task, html, &contract, &findings).await {
                Ok(proposal) if !proposal.data.is_empty() => {
                    tracing::debug!("Capability returned {} entities", proposal.data.len());
                    entities = proposal.data;
                    ai_schema = Some(proposal.schema);
                    ai_used = true;
                }
                Ok(_) => {
                    tracing::debug!("Capability returned no data; keeping deterministic entities");
                    fell_back = true;
                }
                Err(e) => {
                    tracing::warn!("AI extraction failed for {}: {e}; using deterministic entities", plan.signature);
                    fell_back = true;
                }
            }
        }

        plan.constraints.ordering.apply(&mut entities);
        if let Some(max) = plan.constraints.max_items {
            entities.truncate(max);
        }

        let required = contract.required_fields();
        let mut result = match self.mode.process_entities(entities, &contract) {
            Ok(result) => result,
            Err(e @ PipelineError::StrictMode { .. }) => {
                let evaluation = Evaluation::failed(&plan, e.to_string());
                let flags = RecordFlags {
                    strategy: plan.strategy,
                    fell_back,
                    strict_failure: true,
                    met_threshold: false,
                    contract_changed: false,
                };
                self.record(&plan, &evaluation, flags).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if result.contract_changed() {
            // Another attempt may have committed first; report what was stored.
            let stored = self.contracts.write().await.commit(result.contract.clone())?;
            result.metadata.schema_change = stored.change.clone();
            result.contract = (*stored).clone();
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let evaluation = self.evaluator.evaluate(
            &plan,
            &ExecutionOutcome {
                entities: &result.entities,
                required_fields: &required,
                elapsed_ms,
            },
        );
        let flags = RecordFlags {
            strategy: plan.strategy,
            fell_back,
            strict_failure: false,
            met_threshold: evaluation.meets_threshold,
            contract_changed: result.contract_changed(),
        };
        let learning = self.record(&plan, &evaluation, flags).await;

        tracing::info!(
            "Attempt {} for {}: {} entities, score {:.2}",
            plan.id,
            plan.signature,
            result.entities.len(),
            evaluation.score
        );
        Ok(AttemptReport {
            findings: findings.summary(),
            candidates: findings.candidates,
            plan,
            preflight,
            result,
            evaluation,
            learning,
            fell_back,
            ai_used,
            ai_schema,
            elapsed_ms,
        })
    }

    async fn ai_extract(
        &self,
        task: &TaskDescription,
        html: &str,
        contract: &SchemaContract,
        findings: &Findings,
    ) -> Result<SchemaProposal, CapabilityError> {
        let capability = self.capability.as_ref().ok_or(CapabilityError::Unavailable)?;
        let request = SchemaRequest {
            instructions: task.instructions.clone(),
            content: html.to_string(),
            current_findings: Some(findings.summary()),
            contract_schema: contract.to_json_schema(),
        };
        invoke_with_timeout(
            self.config.capability_timeout(),
            capability.generate_schema(&request),
        )
        .await
    }

    /// Append to the aggregate and, when configured, to the log. Log
    /// failures are reported and swallowed.
    async fn record(&self, plan: &ExecutionPlan, evaluation: &Evaluation, flags: RecordFlags) -> LearningRecord {
        let record = LearningRecord::new(plan.signature.clone(), evaluation.score, flags);
        self.learning.record(&record);
        if let Some(log) = &self.log {
            if let Err(e) = log.lock().await.append(&record) {
                tracing::warn!("Failed to persist learning record: {e}");
            }
        }
        record
    }
}

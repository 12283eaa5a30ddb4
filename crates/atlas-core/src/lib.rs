//! Atlas Codex core — evidence-first extraction decisions: DOM evidence, versioned schema contracts, strict/soft modes, and a plan/evaluate/learn loop.

pub mod capability;
pub mod config;
pub mod contract;
pub mod evaluator;
pub mod evidence;
pub mod learning;
pub mod memory;
pub mod mode;
pub mod pipeline;
pub mod plan;
pub mod preflight;
pub mod promotion;
pub mod strategy;
pub mod types;

pub use capability::{ExtractionCapability, PlanProposal, PlanRequest, SchemaProposal, SchemaRequest};
pub use config::PipelineConfig;
pub use contract::{ContractArena, FieldKind, FieldSpec, SchemaChange, SchemaContract};
pub use evaluator::{Evaluation, ExecutionOutcome, OutcomeEvaluator};
pub use evidence::{CandidatePattern, EvidenceCollector, FieldHit, FieldMiss, Findings, MissReason};
pub use learning::{LearningConfig, LearningHandle, LearningLog, LearningRecord, LearningRecorder, LearningReport};
pub use memory::{AdaptedSelector, RememberedSelector, SelectorMemory};
pub use mode::{ModeDecisionEngine, ModeProcessingResult};
pub use pipeline::{AttemptReport, ExtractionPipeline};
pub use plan::{ExecutionPlan, PlanConstraints, StrategyKind, StrategySelector, TaskDescription};
pub use preflight::{PreflightEvaluator, PreflightReport};
pub use promotion::{ManualCuration, OccurrenceThreshold, PromotionPolicy};
pub use strategy::{Detector, Extractor, Validator};
pub use types::*;

//! Mode decision engine: strict vs soft handling of a batch of entities.
//!
//! Support rates are computed for every declared field regardless of mode.
//! Strict mode then drops every entity missing a required field and fails
//! loudly when nothing survives. Soft mode keeps every entity, demotes
//! required fields whose support falls below the threshold, and strips
//! their values so the emitted data matches the demoted contract.
//!
//! The engine never edits a contract in place: a demotion yields a new
//! version inside the returned [`ModeProcessingResult`], which the caller
//! commits to its [`ContractArena`](crate::contract::ContractArena).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::contract::{SchemaChange, SchemaContract};
use crate::types::{has_value, Entity, PipelineError, PipelineResult, ProcessingMode};

/// Default soft-mode demotion threshold.
pub const DEFAULT_SOFT_THRESHOLD: f64 = 0.6;

/// Fraction of a batch with a populated value for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSupportRate {
    pub field: String,
    pub populated: usize,
    pub total: usize,
    pub rate: f64,
    pub required: bool,
}

/// An entity carried keys the contract does not declare. Advisory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractWarning {
    pub field: String,
    pub entity_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeMetadata {
    pub mode: ProcessingMode,
    pub input_count: usize,
    pub output_count: usize,
    pub rows_dropped_count: usize,
    pub omitted_fields: Vec<String>,
    pub support_rates: Vec<FieldSupportRate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_change: Option<SchemaChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ContractWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeProcessingResult {
    pub success: bool,
    pub entities: Vec<Entity>,
    pub contract: SchemaContract,
    pub metadata: ModeMetadata,
}

impl ModeProcessingResult {
    /// Whether the decision derived a new contract version.
    pub fn contract_changed(&self) -> bool {
        self.metadata.schema_change.is_some()
    }
}

/// Strict/soft state machine. The mode is chosen at construction and can be
/// switched between batches; it is never inferred.
#[derive(Debug, Clone)]
pub struct ModeDecisionEngine {
    mode: ProcessingMode,
    soft_threshold: f64,
}

impl Default for ModeDecisionEngine {
    fn default() -> Self {
        Self::new(ProcessingMode::Soft)
    }
}

impl ModeDecisionEngine {
    pub fn new(mode: ProcessingMode) -> Self {
        Self {
            mode,
            soft_threshold: DEFAULT_SOFT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> PipelineResult<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::InvalidInput(format!(
                "soft threshold {threshold} is outside [0, 1]"
            )));
        }
        self.soft_threshold = threshold;
        Ok(self)
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ProcessingMode) {
        if mode != self.mode {
            tracing::debug!("Mode switched {} -> {}", self.mode, mode);
        }
        self.mode = mode;
    }

    pub fn threshold(&self) -> f64 {
        self.soft_threshold
    }

    /// Apply the current mode to a batch.
    pub fn process_entities(
        &self,
        entities: Vec<Entity>,
        contract: &SchemaContract,
    ) -> PipelineResult<ModeProcessingResult> {
        let input_count = entities.len();
        let support_rates = compute_support_rates(&entities, contract);
        let warnings = contract_warnings(&entities, contract);

        if entities.is_empty() {
            return Ok(ModeProcessingResult {
                success: true,
                entities,
                contract: contract.clone(),
                metadata: ModeMetadata {
                    mode: self.mode,
                    input_count,
                    output_count: 0,
                    rows_dropped_count: 0,
                    omitted_fields: Vec::new(),
                    support_rates,
                    schema_change: None,
                    warnings,
                    threshold: self.threshold_for_mode(),
                },
            });
        }

        match self.mode {
            ProcessingMode::Strict => self.apply_strict(entities, contract, support_rates, warnings),
            ProcessingMode::Soft => self.apply_soft(entities, contract, support_rates, warnings),
        }
    }

    fn threshold_for_mode(&self) -> Option<f64> {
        match self.mode {
            ProcessingMode::Soft => Some(self.soft_threshold),
            ProcessingMode::Strict => None,
        }
    }

    fn apply_strict(
        &self,
        entities: Vec<Entity>,
        contract: &SchemaContract,
        support_rates: Vec<FieldSupportRate>,
        warnings: Vec<ContractWarning>,
    ) -> PipelineResult<ModeProcessingResult> {
        let required = contract.required_fields();
        let original_count = entities.len();
        let kept: Vec<Entity> = entities
            .into_iter()
            .filter(|e| required.iter().all(|f| has_value(e, f)))
            .collect();
        let dropped_count = original_count - kept.len();

        if kept.is_empty() {
            tracing::warn!(
                "Strict mode dropped all {dropped_count} entities for {}@{}",
                contract.id,
                contract.version
            );
            return Err(PipelineError::StrictMode {
                dropped_count,
                original_count,
                required_fields: required,
            });
        }

        tracing::debug!("Strict mode kept {}/{original_count} entities", kept.len());
        Ok(ModeProcessingResult {
            success: true,
            metadata: ModeMetadata {
                mode: ProcessingMode::Strict,
                input_count: original_count,
                output_count: kept.len(),
                rows_dropped_count: dropped_count,
                omitted_fields: Vec::new(),
                support_rates,
                schema_change: None,
                warnings,
                threshold: None,
            },
            entities: kept,
            contract: contract.clone(),
        })
    }

    fn apply_soft(
        &self,
        mut entities: Vec<Entity>,
        contract: &SchemaContract,
        support_rates: Vec<FieldSupportRate>,
        warnings: Vec<ContractWarning>,
    ) -> PipelineResult<ModeProcessingResult> {
        let to_demote: Vec<String> = support_rates
            .iter()
            .filter(|r| r.required && r.rate < self.soft_threshold)
            .map(|r| r.field.clone())
            .collect();

        let input_count = entities.len();
        if to_demote.is_empty() {
            return Ok(ModeProcessingResult {
                success: true,
                entities,
                contract: contract.clone(),
                metadata: ModeMetadata {
                    mode: ProcessingMode::Soft,
                    input_count,
                    output_count: input_count,
                    rows_dropped_count: 0,
                    omitted_fields: Vec::new(),
                    support_rates,
                    schema_change: None,
                    warnings,
                    threshold: Some(self.soft_threshold),
                },
            });
        }

        for entity in entities.iter_mut() {
            for field in &to_demote {
                entity.remove(field);
            }
        }

        let demoted = contract.demote(
            &to_demote,
            Some(self.soft_threshold),
            &format!("support below {:.2} in a batch of {input_count}", self.soft_threshold),
        );
        tracing::info!(
            "Soft mode demoted [{}] in {} (v{} -> v{})",
            to_demote.join(", "),
            contract.id,
            contract.version,
            demoted.version
        );

        Ok(ModeProcessingResult {
            success: true,
            metadata: ModeMetadata {
                mode: ProcessingMode::Soft,
                input_count,
                output_count: entities.len(),
                rows_dropped_count: 0,
                omitted_fields: to_demote,
                support_rates,
                schema_change: demoted.change.clone(),
                warnings,
                threshold: Some(self.soft_threshold),
            },
            entities,
            contract: demoted,
        })
    }
}

/// Support rate for every declared field, highest first (ties by name).
pub fn compute_support_rates(entities: &[Entity], contract: &SchemaContract) -> Vec<FieldSupportRate> {
    let total = entities.len();
    let mut rates: Vec<FieldSupportRate> = contract
        .fields
        .iter()
        .map(|spec| {
            let populated = entities.iter().filter(|e| has_value(e, &spec.name)).count();
            FieldSupportRate {
                field: spec.name.clone(),
                populated,
                total,
                rate: if total == 0 {
                    0.0
                } else {
                    populated as f64 / total as f64
                },
                required: spec.is_required(),
            }
        })
        .collect();
    rates.sort_by(|a, b| {
        b.rate
            .partial_cmp(&a.rate)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.field.cmp(&b.field))
    });
    rates
}

fn contract_warnings(entities: &[Entity], contract: &SchemaContract) -> Vec<ContractWarning> {
    let undeclared: BTreeSet<&str> = entities
        .iter()
        .flat_map(|e| e.keys())
        .map(String::as_str)
        .filter(|k| !contract.declares(k))
        .collect();
    undeclared
        .into_iter()
        .map(|field| {
            let entity_count = entities.iter().filter(|e| e.contains_key(field)).count();
            ContractWarning {
                field: field.to_string(),
                entity_count,
                message: format!(
                    "`{field}` appears in {entity_count} entities but is not declared by {}",
                    contract.id
                ),
            }
        })
        .collect()
}

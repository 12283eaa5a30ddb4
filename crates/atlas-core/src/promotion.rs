//! Promotion of discovered label patterns into contract fields.
//!
//! Discovery only surfaces candidates. Whether a candidate becomes a
//! declared field is a policy decision, and the pipeline never applies a
//! promotion on its own: an authoring workflow calls [`promote`] with the
//! proposals it accepts.

use serde::{Deserialize, Serialize};

use crate::contract::{FieldKind, FieldSpec, SchemaContract};
use crate::evidence::CandidatePattern;
use crate::strategy::Detector;

/// A candidate turned into a field declaration, plus what backs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub spec: FieldSpec,
    pub occurrences: usize,
    pub sample_values: Vec<String>,
}

pub trait PromotionPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn propose(&self, candidates: &[CandidatePattern], contract: &SchemaContract) -> Vec<Promotion>;
}

/// Leaves every decision to a human curator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualCuration;

impl PromotionPolicy for ManualCuration {
    fn name(&self) -> &str {
        "manual"
    }

    fn propose(&self, _: &[CandidatePattern], _: &SchemaContract) -> Vec<Promotion> {
        Vec::new()
    }
}

/// Proposes every candidate seen at least `min_occurrences` times.
#[derive(Debug, Clone, Copy)]
pub struct OccurrenceThreshold {
    pub min_occurrences: usize,
}

impl Default for OccurrenceThreshold {
    fn default() -> Self {
        Self { min_occurrences: 3 }
    }
}

impl PromotionPolicy for OccurrenceThreshold {
    fn name(&self) -> &str {
        "occurrence_threshold"
    }

    fn propose(&self, candidates: &[CandidatePattern], contract: &SchemaContract) -> Vec<Promotion> {
        let mut out: Vec<Promotion> = Vec::new();
        for candidate in candidates
            .iter()
            .filter(|c| c.occurrences >= self.min_occurrences)
        {
            let name = field_name(&candidate.normalized);
            if name.is_empty()
                || contract.declares(&name)
                || out.iter().any(|p| p.spec.name == name)
            {
                continue;
            }
            let mut spec = FieldSpec::new(
                name,
                FieldKind::Discoverable,
                Detector::Label {
                    text: candidate.normalized.clone(),
                    confidence: 0.80,
                },
            );
            spec.description = Some(format!(
                "discovered label \"{}\" ({} occurrences)",
                candidate.label, candidate.occurrences
            ));
            out.push(Promotion {
                spec,
                occurrences: candidate.occurrences,
                sample_values: candidate
                    .samples
                    .iter()
                    .filter_map(|s| s.value.clone())
                    .collect(),
            });
        }
        out
    }
}

/// Derive a new contract version declaring the accepted promotions.
/// Returns `None` when nothing would change.
pub fn promote(contract: &SchemaContract, accepted: Vec<Promotion>, policy: &str) -> Option<SchemaContract> {
    let specs: Vec<FieldSpec> = accepted
        .into_iter()
        .map(|p| p.spec)
        .filter(|s| !contract.declares(&s.name))
        .collect();
    if specs.is_empty() {
        return None;
    }
    let next = contract.extend(specs, &format!("promoted by {policy}"));
    tracing::info!(
        "Promoted {} field(s) into {} v{}",
        next.change.as_ref().map(|c| c.fields.len()).unwrap_or(0),
        next.id,
        next.version
    );
    Some(next)
}

/// `"Unit price"` → `unit_price`.
fn field_name(label: &str) -> String {
    let mut name = String::new();
    for ch in label.chars() {
        if ch.is_alphanumeric() {
            name.extend(ch.to_lowercase());
        } else if !name.is_empty() && !name.ends_with('_') {
            name.push('_');
        }
    }
    name.trim_end_matches('_').to_string()
}

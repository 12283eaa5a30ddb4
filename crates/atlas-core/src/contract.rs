//! Schema contracts and the arena that keeps every version of them.
//!
//! A contract is immutable once built. Mutations (soft-mode demotion,
//! promotion of discovered patterns) derive a new version that points back
//! at its parent and carries a [`SchemaChange`] describing what happened.
//! The [`ContractArena`] stores all versions so earlier ones stay
//! addressable for audit.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::strategy::{Detector, Extractor, Validator};
use crate::types::{PipelineError, PipelineResult};

/// Field classification. The only allowed transition is `Required → Expected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Required,
    Expected,
    Discoverable,
}

/// Declaration of one field and the strategies used to find it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub detector: Detector,
    #[serde(default)]
    pub extractor: Extractor,
    #[serde(default)]
    pub validators: Vec<Validator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind, detector: Detector) -> Self {
        Self {
            name: name.into(),
            kind,
            detector,
            extractor: Extractor::Text,
            validators: Vec::new(),
            description: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn is_required(&self) -> bool {
        self.kind == FieldKind::Required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Demotion,
    Promotion,
}

/// Audit record attached to every derived contract version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub kind: ChangeKind,
    pub from_version: u32,
    pub to_version: u32,
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub reason: String,
    pub changed_at: DateTime<Utc>,
}

/// A versioned, immutable declaration of the fields an extraction targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaContract {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<u32>,
    /// Root element of each repeated record, when the page lists several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_selector: Option<String>,
    pub fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<SchemaChange>,
}

fn default_version() -> u32 {
    1
}

impl SchemaContract {
    /// Build version 1 of a contract. Field names must be unique.
    pub fn new(id: impl Into<String>, fields: Vec<FieldSpec>) -> PipelineResult<Self> {
        let contract = Self {
            id: id.into(),
            version: 1,
            parent_version: None,
            record_selector: None,
            fields,
            change: None,
        };
        contract.validate()?;
        Ok(contract)
    }

    pub fn with_record_selector(mut self, selector: impl Into<String>) -> Self {
        self.record_selector = Some(selector.into());
        self
    }

    /// Parse and validate a contract from JSON.
    pub fn from_json(json: &str) -> PipelineResult<Self> {
        let contract: Self = serde_json::from_str(json)?;
        contract.validate()?;
        Ok(contract)
    }

    /// Check the structural invariants a deserialized contract must hold.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::Contract("contract id is empty".into()));
        }
        if self.version == 0 {
            return Err(PipelineError::Contract("contract version starts at 1".into()));
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(PipelineError::Contract(format!(
                    "contract {} declares a field with an empty name",
                    self.id
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(PipelineError::Contract(format!(
                    "contract {} declares field `{}` twice",
                    self.id, field.name
                )));
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Names of the currently required fields, in declaration order.
    pub fn required_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.is_required())
            .map(|f| f.name.clone())
            .collect()
    }

    /// Derive a new version with the given fields moved from required to
    /// expected. Fields that are not currently required are left alone.
    /// Every declaration is kept so later batches can populate it again.
    pub fn demote(&self, fields: &[String], threshold: Option<f64>, reason: &str) -> Self {
        let mut next = self.derive();
        let mut demoted = Vec::new();
        for spec in next.fields.iter_mut() {
            if spec.is_required() && fields.contains(&spec.name) {
                spec.kind = FieldKind::Expected;
                demoted.push(spec.name.clone());
            }
        }
        next.change = Some(SchemaChange {
            kind: ChangeKind::Demotion,
            from_version: self.version,
            to_version: next.version,
            fields: demoted,
            threshold,
            reason: reason.to_string(),
            changed_at: Utc::now(),
        });
        next
    }

    /// Derive a new version with additional field declarations. Names that
    /// already exist are skipped.
    pub fn extend(&self, specs: Vec<FieldSpec>, reason: &str) -> Self {
        let mut next = self.derive();
        let mut added = Vec::new();
        for spec in specs {
            if next.declares(&spec.name) {
                continue;
            }
            added.push(spec.name.clone());
            next.fields.push(spec);
        }
        next.change = Some(SchemaChange {
            kind: ChangeKind::Promotion,
            from_version: self.version,
            to_version: next.version,
            fields: added,
            threshold: None,
            reason: reason.to_string(),
            changed_at: Utc::now(),
        });
        next
    }

    fn derive(&self) -> Self {
        Self {
            id: self.id.clone(),
            version: self.version + 1,
            parent_version: Some(self.version),
            record_selector: self.record_selector.clone(),
            fields: self.fields.clone(),
            change: None,
        }
    }

    /// Render as a JSON Schema object for downstream consumers.
    pub fn to_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|f| {
                let mut prop = json!({ "type": "string", "x-kind": f.kind });
                if matches!(f.extractor, Extractor::Number) {
                    prop["type"] = json!("number");
                }
                if let Some(desc) = &f.description {
                    prop["description"] = json!(desc);
                }
                (f.name.clone(), prop)
            })
            .collect();
        json!({
            "$id": format!("{}@{}", self.id, self.version),
            "type": "object",
            "properties": properties,
            "required": self.required_fields(),
        })
    }
}

/// Append-only store of every contract version, keyed by contract id.
#[derive(Debug, Default)]
pub struct ContractArena {
    versions: HashMap<String, Vec<Arc<SchemaContract>>>,
}

impl ContractArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the first version of a contract.
    pub fn register(&mut self, contract: SchemaContract) -> PipelineResult<Arc<SchemaContract>> {
        contract.validate()?;
        if self.versions.contains_key(&contract.id) {
            return Err(PipelineError::Contract(format!(
                "contract {} is already registered",
                contract.id
            )));
        }
        let id = contract.id.clone();
        let stored = Arc::new(contract);
        self.versions.insert(id, vec![stored.clone()]);
        Ok(stored)
    }

    /// Record a contract that came back from a decision.
    ///
    /// A contract already in the history is a pass-through and resolves to
    /// the latest version. A contract derived from the latest version is
    /// stored as the next one. A contract derived from an older version
    /// (another worker committed first) has its change replayed on top of
    /// the latest version so no mutation is lost.
    pub fn commit(&mut self, contract: SchemaContract) -> PipelineResult<Arc<SchemaContract>> {
        let history = self.versions.get_mut(&contract.id).ok_or_else(|| {
            PipelineError::Contract(format!("contract {} is not registered", contract.id))
        })?;
        let latest = history
            .last()
            .cloned()
            .ok_or_else(|| PipelineError::Contract(format!("contract {} has no versions", contract.id)))?;

        if history.iter().any(|stored| **stored == contract) {
            return Ok(latest);
        }

        let follows_latest = contract.change.is_some()
            && contract.parent_version == Some(latest.version)
            && contract.version == latest.version + 1;
        let next = if follows_latest {
            contract
        } else {
            match (&contract.change, contract.parent_version) {
                (Some(change), Some(parent)) if parent < latest.version => {
                    let Some(rebased) = rebase(&latest, &contract, change) else {
                        return Ok(latest);
                    };
                    tracing::info!(
                        "Contract {} change from version {} replayed onto version {}",
                        contract.id,
                        parent,
                        latest.version
                    );
                    rebased
                }
                _ => {
                    return Err(PipelineError::Contract(format!(
                        "contract {} version {} does not follow latest version {}",
                        contract.id, contract.version, latest.version
                    )))
                }
            }
        };

        tracing::info!(
            "Contract {} advanced to version {} ({:?})",
            next.id,
            next.version,
            next.change.as_ref().map(|c| c.kind)
        );
        let stored = Arc::new(next);
        history.push(stored.clone());
        Ok(stored)
    }

    pub fn latest(&self, id: &str) -> Option<Arc<SchemaContract>> {
        self.versions.get(id).and_then(|h| h.last().cloned())
    }

    pub fn get(&self, id: &str, version: u32) -> Option<Arc<SchemaContract>> {
        self.versions
            .get(id)
            .and_then(|h| h.iter().find(|c| c.version == version).cloned())
    }

    pub fn history(&self, id: &str) -> &[Arc<SchemaContract>] {
        self.versions.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Replay `contract`'s change on top of `latest`. `None` when the change
/// is already reflected there.
fn rebase(latest: &SchemaContract, contract: &SchemaContract, change: &SchemaChange) -> Option<SchemaContract> {
    let next = match change.kind {
        ChangeKind::Demotion => latest.demote(&change.fields, change.threshold, &change.reason),
        ChangeKind::Promotion => {
            let specs = contract
                .fields
                .iter()
                .filter(|f| change.fields.contains(&f.name))
                .cloned()
                .collect();
            latest.extend(specs, &change.reason)
        }
    };
    let applied = next.change.as_ref().is_some_and(|c| !c.fields.is_empty());
    applied.then_some(next)
}

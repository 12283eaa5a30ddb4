//! Adaptive selector memory.
//!
//! When a field's primary selector stops matching on a domain but one of its
//! fallbacks still works, the working selector is remembered for that
//! `(domain, field)` pair. On later documents from the same domain it is
//! tried right after the primary, ahead of the other fallbacks, and dropped
//! once the primary matches again. Workers share one memory; reads and
//! writes are per-entry and only approximately consistent with each other.

use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::PipelineResult;

/// Confidence recorded for a selector that replaced a failing primary.
pub const ADAPTED_CONFIDENCE: f32 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptedSelector {
    pub original: String,
    pub adapted: String,
    pub confidence: f32,
    pub last_updated: DateTime<Utc>,
}

/// One persisted entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RememberedSelector {
    pub domain: String,
    pub field: String,
    #[serde(flatten)]
    pub selector: AdaptedSelector,
}

#[derive(Debug, Default)]
pub struct SelectorMemory {
    entries: DashMap<(String, String), AdaptedSelector>,
}

impl SelectorMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(domain: &str, field: &str) -> (String, String) {
        (domain.to_ascii_lowercase(), field.to_string())
    }

    /// The remembered selector for a field on a domain, if any.
    pub fn remembered(&self, domain: &str, field: &str) -> Option<String> {
        self.entries
            .get(&Self::key(domain, field))
            .map(|e| e.adapted.clone())
    }

    pub fn remember(&self, domain: &str, field: &str, original: &str, adapted: &str) {
        tracing::debug!("Remembering selector `{adapted}` for {field} on {domain}");
        self.entries.insert(
            Self::key(domain, field),
            AdaptedSelector {
                original: original.to_string(),
                adapted: adapted.to_string(),
                confidence: ADAPTED_CONFIDENCE,
                last_updated: Utc::now(),
            },
        );
    }

    /// Drop a remembered selector, e.g. once the primary works again.
    pub fn forget(&self, domain: &str, field: &str) -> Option<AdaptedSelector> {
        self.entries.remove(&Self::key(domain, field)).map(|(_, v)| v)
    }

    /// Every remembered selector for a domain, sorted by field name.
    pub fn for_domain(&self, domain: &str) -> Vec<(String, AdaptedSelector)> {
        let domain = domain.to_ascii_lowercase();
        let mut out: Vec<(String, AdaptedSelector)> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == domain)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Load a memory saved with [`save`](Self::save). A missing file is an
    /// empty memory.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let memory = Self::new();
        if !path.exists() {
            return Ok(memory);
        }
        let entries: Vec<RememberedSelector> =
            serde_json::from_str(&std::fs::read_to_string(path)?)?;
        for entry in entries {
            memory
                .entries
                .insert(Self::key(&entry.domain, &entry.field), entry.selector);
        }
        tracing::debug!("Loaded {} remembered selectors from {}", memory.len(), path.display());
        Ok(memory)
    }

    /// Write every entry as a JSON array, sorted by domain then field.
    pub fn save(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut entries: Vec<RememberedSelector> = self
            .entries
            .iter()
            .map(|e| RememberedSelector {
                domain: e.key().0.clone(),
                field: e.key().1.clone(),
                selector: e.value().clone(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.domain, &a.field).cmp(&(&b.domain, &b.field)));
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

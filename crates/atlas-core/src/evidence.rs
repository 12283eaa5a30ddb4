//! Evidence collector: walks a document against a schema contract.
//!
//! For every required or expected field the collector runs detection, then
//! extraction and validation on each candidate, keeping only values that
//! pass every validator. A field that blows up (bad selector, bad regex, a
//! panicking strategy) becomes a miss with `processing_error`; the rest of
//! the pass carries on. Discoverable fields are skipped here. After the
//! per-field pass, structural discovery groups repeated label-like elements
//! that the contract does not declare yet.
//!
//! All entry points are synchronous because `scraper` types are `!Send`.
//! Async callers should parse and collect before their next `.await`.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::{FieldKind, FieldSpec, SchemaContract};
use crate::memory::SelectorMemory;
use crate::strategy::{element_text, is_label_tag, normalize_label, Detector};
use crate::types::{Entity, FieldFailure, PipelineError, PipelineResult};

/// Characters of element text kept as an evidence snippet.
const SNIPPET_LEN: usize = 120;

/// Longest text still treated as a label during discovery.
const MAX_LABEL_LEN: usize = 60;

// ── Findings ─────────────────────────────────────────────────────────────────

/// Where a value came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub selector: String,
    pub snippet: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldHit {
    pub field: String,
    pub value: Value,
    pub evidence: Evidence,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissReason {
    NoMatchesFound,
    ValidationFailed,
    ProcessingError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMiss {
    pub field: String,
    pub reason: MissReason,
    pub selectors_tried: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSample {
    pub path: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// A repeated label-like pattern the contract does not declare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePattern {
    pub label: String,
    pub normalized: String,
    pub tag: String,
    pub occurrences: usize,
    pub samples: Vec<PatternSample>,
}

/// Everything one evidence pass learned about a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Findings {
    pub hits: Vec<FieldHit>,
    pub misses: Vec<FieldMiss>,
    pub candidates: Vec<CandidatePattern>,
    /// Field → number of valid extractions in this document.
    pub support_map: BTreeMap<String, usize>,
}

/// Compact view handed to the external capability and to reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindingsSummary {
    pub hit_count: usize,
    pub miss_count: usize,
    pub candidate_count: usize,
    pub fields_hit: Vec<String>,
    pub fields_missed: Vec<String>,
}

impl Findings {
    pub fn hits_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a FieldHit> + 'a {
        self.hits.iter().filter(move |h| h.field == field)
    }

    pub fn support(&self, field: &str) -> usize {
        self.support_map.get(field).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> FindingsSummary {
        FindingsSummary {
            hit_count: self.hits.len(),
            miss_count: self.misses.len(),
            candidate_count: self.candidates.len(),
            fields_hit: self
                .support_map
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(f, _)| f.clone())
                .collect(),
            fields_missed: self.misses.iter().map(|m| m.field.clone()).collect(),
        }
    }

    /// Assemble entities by aligning the i-th hit of every field.
    pub fn assemble_entities(&self, contract: &SchemaContract) -> Vec<Entity> {
        let per_field: Vec<(&str, Vec<&FieldHit>)> = contract
            .fields
            .iter()
            .filter(|f| f.kind != FieldKind::Discoverable)
            .map(|f| (f.name.as_str(), self.hits_for(&f.name).collect()))
            .collect();
        let rows = per_field.iter().map(|(_, h)| h.len()).max().unwrap_or(0);
        (0..rows)
            .map(|i| {
                per_field
                    .iter()
                    .filter_map(|(name, hits)| hits.get(i).map(|h| (name.to_string(), h.value.clone())))
                    .collect()
            })
            .collect()
    }

    fn merge_miss(&mut self, miss: FieldMiss) {
        if !self.misses.iter().any(|m| m.field == miss.field) {
            self.misses.push(miss);
        }
    }
}

// ── Collector ────────────────────────────────────────────────────────────────

struct FieldOutcome {
    hits: Vec<FieldHit>,
    miss: Option<FieldMiss>,
    /// A non-primary selector that produced the hits.
    adapted: Option<String>,
}

/// Collects evidence for a contract. Cheap to clone; holds no per-document state.
#[derive(Debug, Clone)]
pub struct EvidenceCollector {
    memory: Option<Arc<SelectorMemory>>,
    max_samples: usize,
    min_confidence: f32,
}

impl Default for EvidenceCollector {
    fn default() -> Self {
        Self {
            memory: None,
            max_samples: 3,
            min_confidence: 0.0,
        }
    }
}

impl EvidenceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(mut self, memory: Arc<SelectorMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Run the full evidence pass over a document.
    pub fn process(&self, document: &Html, contract: &SchemaContract) -> Findings {
        self.process_for(document, contract, None)
    }

    /// Same as [`process`](Self::process), consulting and updating selector
    /// memory for `domain`.
    pub fn process_for(
        &self,
        document: &Html,
        contract: &SchemaContract,
        domain: Option<&str>,
    ) -> Findings {
        let mut findings = Findings::default();
        for spec in live_fields(contract) {
            let outcome = self.process_field(document.root_element(), spec, domain);
            findings.support_map.insert(spec.name.clone(), outcome.hits.len());
            findings.hits.extend(outcome.hits);
            if let Some(miss) = outcome.miss {
                findings.misses.push(miss);
            }
        }
        findings.candidates = self.discover(document, contract);
        tracing::debug!(
            "Evidence pass for {}@{}: {} hits, {} misses, {} candidates",
            contract.id,
            contract.version,
            findings.hits.len(),
            findings.misses.len(),
            findings.candidates.len()
        );
        findings
    }

    /// Collect findings and assemble entities.
    ///
    /// With a `record_selector`, each matched record is processed on its own
    /// and yields one entity built from the first valid hit per field.
    /// Otherwise entities are aligned from document-wide hits.
    pub fn collect_entities(
        &self,
        document: &Html,
        contract: &SchemaContract,
        domain: Option<&str>,
    ) -> PipelineResult<(Findings, Vec<Entity>)> {
        let Some(record_sel) = contract.record_selector.as_deref() else {
            let findings = self.process_for(document, contract, domain);
            let entities = findings.assemble_entities(contract);
            return Ok((findings, entities));
        };

        let selector = Selector::parse(record_sel).map_err(|e| {
            PipelineError::Contract(format!("invalid record selector `{record_sel}`: {e:?}"))
        })?;

        let mut findings = Findings::default();
        let mut entities = Vec::new();
        for spec in live_fields(contract) {
            findings.support_map.insert(spec.name.clone(), 0);
        }

        for record in document.select(&selector) {
            let mut entity = Entity::new();
            for spec in live_fields(contract) {
                let outcome = self.process_field(record, spec, domain);
                if let Some(first) = outcome.hits.first() {
                    entity.insert(spec.name.clone(), first.value.clone());
                }
                *findings.support_map.entry(spec.name.clone()).or_insert(0) += outcome.hits.len();
                findings.hits.extend(outcome.hits);
                if let Some(miss) = outcome.miss {
                    findings.merge_miss(miss);
                }
            }
            entities.push(entity);
        }

        findings.candidates = self.discover(document, contract);
        tracing::debug!(
            "Record pass for {}@{}: {} records via `{record_sel}`",
            contract.id,
            contract.version,
            entities.len()
        );
        Ok((findings, entities))
    }

    /// Run one field inside a failure boundary.
    fn process_field(&self, scope: ElementRef<'_>, spec: &FieldSpec, domain: Option<&str>) -> FieldOutcome {
        let preferred = match (&self.memory, domain) {
            (Some(memory), Some(domain)) => memory.remembered(domain, &spec.name),
            _ => None,
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.run_field(scope, spec, preferred.as_deref())
        }))
        .unwrap_or_else(|payload| Err(FieldFailure::Panicked(panic_message(payload))));

        match result {
            Ok(outcome) => {
                if let (Some(memory), Some(domain), Detector::Css { selector, .. }) =
                    (&self.memory, domain, &spec.detector)
                {
                    match &outcome.adapted {
                        Some(adapted) => memory.remember(domain, &spec.name, selector, adapted),
                        // The primary matched again.
                        None if preferred.is_some() && !outcome.hits.is_empty() => {
                            memory.forget(domain, &spec.name);
                        }
                        None => {}
                    }
                }
                outcome
            }
            Err(failure) => {
                tracing::debug!("Field {} failed: {failure}", spec.name);
                FieldOutcome {
                    hits: Vec::new(),
                    miss: Some(FieldMiss {
                        field: spec.name.clone(),
                        reason: MissReason::ProcessingError,
                        selectors_tried: spec.detector.selectors(),
                        detail: Some(failure.to_string()),
                    }),
                    adapted: None,
                }
            }
        }
    }

    fn run_field(
        &self,
        scope: ElementRef<'_>,
        spec: &FieldSpec,
        preferred: Option<&str>,
    ) -> Result<FieldOutcome, FieldFailure> {
        let extractor = spec.extractor.compile()?;
        let validators = spec
            .validators
            .iter()
            .map(|v| v.compile())
            .collect::<Result<Vec<_>, _>>()?;

        let detection = spec.detector.detect(scope, preferred)?;
        if detection.candidates.is_empty() {
            return Ok(FieldOutcome {
                hits: Vec::new(),
                miss: Some(FieldMiss {
                    field: spec.name.clone(),
                    reason: MissReason::NoMatchesFound,
                    selectors_tried: detection.selectors_tried,
                    detail: None,
                }),
                adapted: None,
            });
        }

        let mut hits = Vec::new();
        for candidate in &detection.candidates {
            if candidate.confidence < self.min_confidence {
                continue;
            }
            let Some(value) = extractor.extract(&candidate.element) else {
                continue;
            };
            if !validators.iter().all(|v| v.check(&value)) {
                continue;
            }
            hits.push(FieldHit {
                field: spec.name.clone(),
                value,
                evidence: Evidence {
                    selector: candidate.selector.clone(),
                    snippet: element_text(&candidate.element)
                        .chars()
                        .take(SNIPPET_LEN)
                        .collect(),
                    path: structural_path(candidate.element),
                },
                confidence: candidate.confidence,
            });
        }

        let adapted = match (&spec.detector, hits.first()) {
            (Detector::Css { selector, .. }, Some(hit)) if hit.evidence.selector != *selector => {
                Some(hit.evidence.selector.clone())
            }
            _ => None,
        };

        let miss = hits.is_empty().then(|| FieldMiss {
            field: spec.name.clone(),
            reason: MissReason::ValidationFailed,
            selectors_tried: detection.selectors_tried.clone(),
            detail: Some(format!(
                "{} candidate(s) found, none passed extraction and validation",
                detection.candidates.len()
            )),
        });

        Ok(FieldOutcome { hits, miss, adapted })
    }

    /// Group repeated label-like elements that the contract does not declare.
    fn discover(&self, document: &Html, contract: &SchemaContract) -> Vec<CandidatePattern> {
        let known: Vec<String> = contract
            .fields
            .iter()
            .flat_map(|f| {
                let mut names = vec![normalize_label(&f.name.replace('_', " "))];
                if let Detector::Label { text, .. } = &f.detector {
                    names.push(normalize_label(text));
                }
                names
            })
            .collect();

        let mut groups: BTreeMap<String, Vec<ElementRef<'_>>> = BTreeMap::new();
        for el in document.root_element().descendants().filter_map(ElementRef::wrap) {
            if !is_label_tag(el.value().name()) {
                continue;
            }
            let normalized = normalize_label(&element_text(&el));
            if normalized.is_empty() || normalized.chars().count() > MAX_LABEL_LEN {
                continue;
            }
            if known.contains(&normalized) {
                continue;
            }
            groups.entry(normalized).or_default().push(el);
        }

        let mut candidates: Vec<CandidatePattern> = groups
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .map(|(normalized, members)| {
                let first = members[0];
                CandidatePattern {
                    label: element_text(&first),
                    tag: first.value().name().to_string(),
                    occurrences: members.len(),
                    samples: members
                        .iter()
                        .take(self.max_samples)
                        .map(|el| PatternSample {
                            path: structural_path(*el),
                            text: element_text(el),
                            value: el
                                .next_siblings()
                                .find_map(ElementRef::wrap)
                                .map(|v| element_text(&v))
                                .filter(|v| !v.is_empty()),
                        })
                        .collect(),
                    normalized,
                }
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.normalized.cmp(&b.normalized))
        });
        candidates
    }
}

fn live_fields(contract: &SchemaContract) -> impl Iterator<Item = &FieldSpec> {
    contract
        .fields
        .iter()
        .filter(|f| f.kind != FieldKind::Discoverable)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Tag chain from the root to `el`. Siblings sharing a tag are told apart
/// by 1-based position, so the path depends only on markup shape.
pub fn structural_path(el: ElementRef<'_>) -> String {
    let mut segments = Vec::new();
    let mut current = Some(el);
    while let Some(node) = current {
        let tag = node.value().name();
        let parent = node.parent().and_then(ElementRef::wrap);
        let segment = match parent {
            Some(p) => {
                let same_tag: Vec<ElementRef<'_>> = p
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|c| c.value().name() == tag)
                    .collect();
                if same_tag.len() > 1 {
                    let position = same_tag
                        .iter()
                        .position(|c| c.id() == node.id())
                        .unwrap_or(0);
                    format!("{tag}:nth-of-type({})", position + 1)
                } else {
                    tag.to_string()
                }
            }
            None => tag.to_string(),
        };
        segments.push(segment);
        current = parent;
    }
    segments.reverse();
    segments.join(" > ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{Extractor, Validator};
    use serde_json::json;

    const LISTING: &str = r#"
        <html><body>
          <ul>
            <li class="person"><h3 class="name">Ann</h3><a class="mail">ann@x.com</a>
                <dl><dt>Role</dt><dd>Chair</dd></dl></li>
            <li class="person"><h3 class="name">Bob</h3><a class="mail">bob-at-x</a>
                <dl><dt>Role</dt><dd>Member</dd></dl></li>
            <li class="person"><h3 class="name">Cy</h3>
                <dl><dt>Role</dt><dd>Member</dd></dl></li>
          </ul>
        </body></html>"#;

    fn css(sel: &str) -> Detector {
        Detector::Css {
            selector: sel.into(),
            fallbacks: vec![],
            confidence: 0.95,
        }
    }

    fn people_contract() -> SchemaContract {
        SchemaContract::new(
            "people",
            vec![
                FieldSpec::new("name", FieldKind::Required, css(".name")),
                FieldSpec::new("email", FieldKind::Required, css(".mail"))
                    .with_validator(Validator::Email),
                FieldSpec::new("phone", FieldKind::Expected, css(".phone")),
                FieldSpec::new("notes", FieldKind::Discoverable, Detector::None),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_hits_misses_and_support() {
        let doc = Html::parse_document(LISTING);
        let findings = EvidenceCollector::new().process(&doc, &people_contract());

        assert_eq!(findings.support("name"), 3);
        // bob-at-x fails the email validator.
        assert_eq!(findings.support("email"), 1);
        assert_eq!(findings.support("phone"), 0);
        assert!(!findings.support_map.contains_key("notes"));

        let phone_miss = findings.misses.iter().find(|m| m.field == "phone").unwrap();
        assert_eq!(phone_miss.reason, MissReason::NoMatchesFound);
        assert_eq!(phone_miss.selectors_tried, vec![".phone"]);

        let ann = findings.hits_for("name").next().unwrap();
        assert_eq!(ann.value, json!("Ann"));
        assert!(ann.evidence.path.ends_with("li:nth-of-type(1) > h3"));
    }

    #[test]
    fn test_processing_error_does_not_abort_pass() {
        let contract = SchemaContract::new(
            "broken",
            vec![
                FieldSpec::new("bad", FieldKind::Required, css("li[[")),
                FieldSpec::new("bad_regex", FieldKind::Required, css(".name")).with_extractor(
                    Extractor::Regex {
                        pattern: "(".into(),
                        group: 0,
                    },
                ),
                FieldSpec::new("name", FieldKind::Required, css(".name")),
            ],
        )
        .unwrap();
        let doc = Html::parse_document(LISTING);
        let findings = EvidenceCollector::new().process(&doc, &contract);

        let errors: Vec<_> = findings
            .misses
            .iter()
            .filter(|m| m.reason == MissReason::ProcessingError)
            .map(|m| m.field.as_str())
            .collect();
        assert_eq!(errors, vec!["bad", "bad_regex"]);
        assert_eq!(findings.support("name"), 3);
    }

    #[test]
    fn test_record_scoped_entities() {
        let contract = people_contract().with_record_selector("li.person");
        let doc = Html::parse_document(LISTING);
        let (_, entities) = EvidenceCollector::new()
            .collect_entities(&doc, &contract, None)
            .unwrap();
        assert_eq!(entities.len(), 3);
        assert_eq!(entities[0]["email"], json!("ann@x.com"));
        assert!(!entities[1].contains_key("email"));
        assert_eq!(entities[2]["name"], json!("Cy"));
    }

    #[test]
    fn test_discovery_groups_repeated_labels() {
        let doc = Html::parse_document(LISTING);
        let findings = EvidenceCollector::new().process(&doc, &people_contract());
        let role = findings
            .candidates
            .iter()
            .find(|c| c.normalized == "role")
            .unwrap();
        assert_eq!(role.occurrences, 3);
        assert_eq!(role.samples.len(), 3);
        assert_eq!(role.samples[0].value.as_deref(), Some("Chair"));
        // Declared field names are not reported as candidates.
        assert!(findings.candidates.iter().all(|c| c.normalized != "name"));
    }

    #[test]
    fn test_path_depends_on_shape_not_text() {
        let a = Html::parse_document("<div><p>one</p><p>two</p><span>x</span></div>");
        let b = Html::parse_document("<div><p>uno</p><p>dos</p><span>y</span></div>");
        let sel = Selector::parse("p").unwrap();
        let pa: Vec<String> = a.select(&sel).map(structural_path).collect();
        let pb: Vec<String> = b.select(&sel).map(structural_path).collect();
        assert_eq!(pa, pb);
        assert_eq!(pa[1], "html > body > div > p:nth-of-type(2)");
    }

    #[test]
    fn test_selector_memory_learns_fallback() {
        let memory = Arc::new(SelectorMemory::new());
        let collector = EvidenceCollector::new().with_memory(memory.clone());
        let contract = SchemaContract::new(
            "c",
            vec![FieldSpec::new(
                "name",
                FieldKind::Required,
                Detector::Css {
                    selector: ".full-name".into(),
                    fallbacks: vec![".name".into()],
                    confidence: 0.95,
                },
            )],
        )
        .unwrap();
        let doc = Html::parse_document(LISTING);
        let findings = collector.process_for(&doc, &contract, Some("people.example"));
        assert_eq!(findings.support("name"), 3);
        assert_eq!(
            memory.remembered("people.example", "name").as_deref(),
            Some(".name")
        );
    }

    #[test]
    fn test_primary_selector_wins_over_remembered() {
        let memory = Arc::new(SelectorMemory::new());
        let collector = EvidenceCollector::new().with_memory(memory.clone());
        let contract = SchemaContract::new(
            "c",
            vec![FieldSpec::new(
                "price",
                FieldKind::Required,
                Detector::Css {
                    selector: ".price".into(),
                    fallbacks: vec![".cost".into()],
                    confidence: 0.95,
                },
            )],
        )
        .unwrap();

        let moved = Html::parse_document(r#"<div><span class="cost">$12</span></div>"#);
        collector.process_for(&moved, &contract, Some("shop.example"));
        assert_eq!(memory.remembered("shop.example", "price").as_deref(), Some(".cost"));

        let restored = Html::parse_document(
            r#"<div><span class="price">$99</span><span class="cost">$5 shipping</span></div>"#,
        );
        let findings = collector.process_for(&restored, &contract, Some("shop.example"));
        let hits: Vec<_> = findings.hits_for("price").collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, json!("$99"));
        assert_eq!(hits[0].evidence.selector, ".price");
        assert!(memory.remembered("shop.example", "price").is_none());
    }

    #[test]
    fn test_assemble_entities_aligns_hits() {
        let doc = Html::parse_document(LISTING);
        let contract = people_contract();
        let findings = EvidenceCollector::new().process(&doc, &contract);
        let entities = findings.assemble_entities(&contract);
        assert_eq!(entities.len(), 3);
        assert_eq!(entities[0]["name"], json!("Ann"));
        assert_eq!(entities[0]["email"], json!("ann@x.com"));
        assert!(!entities[2].contains_key("email"));
    }
}

//! Per-field detection, extraction and validation strategies.
//!
//! Strategies are plain data so contracts can be stored and shipped as JSON.
//! Each one is compiled once per evidence pass (selectors parsed, regexes
//! built) and then applied as a pure, synchronous function over a DOM node.
//! A strategy that cannot be compiled is a [`FieldFailure`]; the collector
//! records it as a miss rather than aborting the pass.
//!
//! # Confidence model
//!
//! A primary CSS selector carries the confidence declared on the detector.
//! Fallback and remembered selectors are discounted by [`FALLBACK_DISCOUNT`]
//! because they were not the author's first choice. Label detection defaults
//! to 0.80 since it relies on visible text rather than markup intent.

use regex::Regex;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::FieldFailure;

/// Multiplier applied to confidence when a non-primary selector matched.
pub const FALLBACK_DISCOUNT: f32 = 0.9;

/// Tags treated as labels by label detection and structural discovery.
pub const LABEL_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "dt", "th", "label", "strong", "b", "em",
];

fn default_css_confidence() -> f32 {
    0.95
}

fn default_label_confidence() -> f32 {
    0.80
}

// ── Detection ────────────────────────────────────────────────────────────────

/// How a field locates candidate elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Detector {
    /// CSS selector, with fallbacks tried in order when it finds nothing.
    Css {
        selector: String,
        #[serde(default)]
        fallbacks: Vec<String>,
        #[serde(default = "default_css_confidence")]
        confidence: f32,
    },
    /// A label-like element whose normalized text equals `text`; the value
    /// lives in its next sibling element.
    Label {
        text: String,
        #[serde(default = "default_label_confidence")]
        confidence: f32,
    },
    /// No deterministic way to find the field.
    #[default]
    None,
}

/// A located element plus the selector that found it.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub element: ElementRef<'a>,
    pub selector: String,
    pub confidence: f32,
}

/// Outcome of running a detector: candidates from the first selector that
/// matched, and every selector attempted along the way.
#[derive(Debug, Clone, Default)]
pub struct Detection<'a> {
    pub candidates: Vec<Candidate<'a>>,
    pub selectors_tried: Vec<String>,
}

impl Detector {
    /// Whether this detector can ever produce a candidate. Used by preflight.
    pub fn is_viable(&self) -> bool {
        match self {
            Detector::Css {
                selector,
                fallbacks,
                ..
            } => std::iter::once(selector)
                .chain(fallbacks.iter())
                .any(|s| Selector::parse(s).is_ok()),
            Detector::Label { text, .. } => !normalize_label(text).is_empty(),
            Detector::None => false,
        }
    }

    /// Every selector this detector would try, in order.
    pub fn selectors(&self) -> Vec<String> {
        match self {
            Detector::Css {
                selector,
                fallbacks,
                ..
            } => std::iter::once(selector.clone())
                .chain(fallbacks.iter().cloned())
                .collect(),
            Detector::Label { text, .. } => vec![label_selector(text)],
            Detector::None => Vec::new(),
        }
    }

    /// Declared confidence of the primary strategy; zero for `None`.
    pub fn confidence(&self) -> f32 {
        match self {
            Detector::Css { confidence, .. } | Detector::Label { confidence, .. } => *confidence,
            Detector::None => 0.0,
        }
    }

    /// Run detection inside `scope`.
    ///
    /// `preferred` is a remembered selector, tried right after the primary
    /// and before the declared fallbacks.
    pub fn detect<'a>(
        &self,
        scope: ElementRef<'a>,
        preferred: Option<&str>,
    ) -> Result<Detection<'a>, FieldFailure> {
        match self {
            Detector::Css {
                selector,
                fallbacks,
                confidence,
            } => {
                let mut ordered: Vec<(&str, f32)> = vec![(selector.as_str(), *confidence)];
                if let Some(pref) = preferred.filter(|p| *p != selector.as_str()) {
                    ordered.push((pref, confidence * FALLBACK_DISCOUNT));
                }
                for fb in fallbacks {
                    if Some(fb.as_str()) != preferred {
                        ordered.push((fb.as_str(), confidence * FALLBACK_DISCOUNT));
                    }
                }
                detect_css(scope, &ordered)
            }
            Detector::Label { text, confidence } => Ok(detect_label(scope, text, *confidence)),
            Detector::None => Ok(Detection::default()),
        }
    }
}

fn detect_css<'a>(
    scope: ElementRef<'a>,
    ordered: &[(&str, f32)],
) -> Result<Detection<'a>, FieldFailure> {
    let mut detection = Detection::default();
    for &(sel_str, confidence) in ordered {
        detection.selectors_tried.push(sel_str.to_string());
        let sel = Selector::parse(sel_str).map_err(|e| FieldFailure::InvalidSelector {
            selector: sel_str.to_string(),
            reason: format!("{e:?}"),
        })?;
        let found: Vec<Candidate<'a>> = scope
            .select(&sel)
            .map(|element| Candidate {
                element,
                selector: sel_str.to_string(),
                confidence,
            })
            .collect();
        if !found.is_empty() {
            detection.candidates = found;
            return Ok(detection);
        }
    }
    Ok(detection)
}

fn detect_label<'a>(scope: ElementRef<'a>, text: &str, confidence: f32) -> Detection<'a> {
    let wanted = normalize_label(text);
    let mut detection = Detection {
        candidates: Vec::new(),
        selectors_tried: vec![label_selector(text)],
    };
    for el in scope.descendants().filter_map(ElementRef::wrap) {
        if !is_label_tag(el.value().name()) || normalize_label(&element_text(&el)) != wanted {
            continue;
        }
        if let Some(value_el) = next_element_sibling(el) {
            detection.candidates.push(Candidate {
                element: value_el,
                selector: label_selector(text),
                confidence,
            });
        }
    }
    detection
}

fn label_selector(text: &str) -> String {
    format!("label:\"{}\"", normalize_label(text))
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// How a value is pulled out of a detected element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Extractor {
    /// All descendant text, whitespace-collapsed.
    #[default]
    Text,
    /// Only the element's direct text children.
    OwnText,
    /// An attribute value.
    Attr { name: String },
    /// A capture group of a regex applied to the element text.
    Regex {
        pattern: String,
        #[serde(default)]
        group: usize,
    },
    /// First decimal number in the text, as a JSON number.
    Number,
}

/// An extractor with its regex (if any) already built.
#[derive(Debug, Clone)]
pub enum CompiledExtractor {
    Text,
    OwnText,
    Attr(String),
    Regex(Regex, usize),
    Number(Regex),
}

impl Extractor {
    pub fn compile(&self) -> Result<CompiledExtractor, FieldFailure> {
        Ok(match self {
            Extractor::Text => CompiledExtractor::Text,
            Extractor::OwnText => CompiledExtractor::OwnText,
            Extractor::Attr { name } => CompiledExtractor::Attr(name.clone()),
            Extractor::Regex { pattern, group } => {
                CompiledExtractor::Regex(compile_pattern(pattern)?, *group)
            }
            Extractor::Number => CompiledExtractor::Number(compile_pattern(r"-?\d[\d,]*(?:\.\d+)?")?),
        })
    }
}

impl CompiledExtractor {
    /// Extract a value. `None` means the element carried nothing usable.
    pub fn extract(&self, el: &ElementRef<'_>) -> Option<Value> {
        match self {
            CompiledExtractor::Text => non_blank(element_text(el)),
            CompiledExtractor::OwnText => {
                let own: Vec<String> = el
                    .children()
                    .filter_map(|c| c.value().as_text().map(|t| t.text.to_string()))
                    .collect();
                non_blank(collapse_whitespace(&own.join(" ")))
            }
            CompiledExtractor::Attr(name) => el
                .value()
                .attr(name)
                .and_then(|v| non_blank(v.trim().to_string())),
            CompiledExtractor::Regex(re, group) => {
                let text = element_text(el);
                re.captures(&text)
                    .and_then(|caps| caps.get(*group))
                    .and_then(|m| non_blank(m.as_str().trim().to_string()))
            }
            CompiledExtractor::Number(re) => {
                let text = element_text(el);
                re.find(&text)
                    .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok())
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
            }
        }
    }
}

fn non_blank(s: String) -> Option<Value> {
    if s.trim().is_empty() {
        None
    } else {
        Some(Value::String(s))
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Shape check applied to every extracted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Validator {
    NonEmpty,
    MinLength { min: usize },
    MaxLength { max: usize },
    Pattern { pattern: String },
    Email,
    Url,
    Numeric,
    OneOf { values: Vec<String> },
}

#[derive(Debug, Clone)]
pub enum CompiledValidator {
    NonEmpty,
    MinLength(usize),
    MaxLength(usize),
    Pattern(Regex),
    Numeric,
    OneOf(Vec<String>),
}

impl Validator {
    pub fn compile(&self) -> Result<CompiledValidator, FieldFailure> {
        Ok(match self {
            Validator::NonEmpty => CompiledValidator::NonEmpty,
            Validator::MinLength { min } => CompiledValidator::MinLength(*min),
            Validator::MaxLength { max } => CompiledValidator::MaxLength(*max),
            Validator::Pattern { pattern } => CompiledValidator::Pattern(compile_pattern(pattern)?),
            Validator::Email => {
                CompiledValidator::Pattern(compile_pattern(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")?)
            }
            Validator::Url => CompiledValidator::Pattern(compile_pattern(r"^(?:https?://|/)\S+$")?),
            Validator::Numeric => CompiledValidator::Numeric,
            Validator::OneOf { values } => {
                CompiledValidator::OneOf(values.iter().map(|v| v.to_lowercase()).collect())
            }
        })
    }
}

impl CompiledValidator {
    pub fn check(&self, value: &Value) -> bool {
        let text = value_text(value);
        match self {
            CompiledValidator::NonEmpty => !text.trim().is_empty(),
            CompiledValidator::MinLength(min) => text.chars().count() >= *min,
            CompiledValidator::MaxLength(max) => text.chars().count() <= *max,
            CompiledValidator::Pattern(re) => re.is_match(&text),
            CompiledValidator::Numeric => {
                value.is_number() || text.trim().replace(',', "").parse::<f64>().is_ok()
            }
            CompiledValidator::OneOf(values) => values.contains(&text.trim().to_lowercase()),
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, FieldFailure> {
    Regex::new(pattern).map_err(|e| FieldFailure::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

// ── DOM helpers ──────────────────────────────────────────────────────────────

/// All descendant text of an element, whitespace-collapsed.
pub fn element_text(el: &ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased, whitespace-collapsed, trailing colon removed.
pub fn normalize_label(text: &str) -> String {
    collapse_whitespace(text)
        .trim_end_matches(|c: char| c == ':' || c.is_whitespace())
        .to_lowercase()
}

pub fn is_label_tag(tag: &str) -> bool {
    LABEL_TAGS.contains(&tag)
}

fn next_element_sibling(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.next_siblings().find_map(ElementRef::wrap)
}

//! `atlas discover`: surface repeated label patterns and promotion proposals.

use std::path::Path;

use scraper::Html;
use serde_json::{json, Value};

use atlas_core::promotion::promote;
use atlas_core::{EvidenceCollector, ManualCuration, OccurrenceThreshold, PromotionPolicy};

use super::{read_contract, read_html, GlobalOptions};

/// `min_occurrences: None` leaves promotion to a human curator.
pub fn execute(
    opts: &GlobalOptions,
    html: &Path,
    contract: &Path,
    min_occurrences: Option<usize>,
    apply: bool,
) -> anyhow::Result<Value> {
    let config = opts.config()?;
    let contract = read_contract(contract)?;
    let document = Html::parse_document(&read_html(html)?);

    let findings = EvidenceCollector::new()
        .with_max_samples(config.max_samples)
        .process(&document, &contract);

    let policy: Box<dyn PromotionPolicy> = match min_occurrences {
        Some(min_occurrences) => Box::new(OccurrenceThreshold { min_occurrences }),
        None => Box::new(ManualCuration),
    };
    let proposals = policy.propose(&findings.candidates, &contract);

    let promoted = if apply {
        promote(&contract, proposals.clone(), policy.name())
    } else {
        None
    };

    Ok(json!({
        "policy": policy.name(),
        "candidates": findings.candidates,
        "proposals": proposals,
        "contract": promoted,
    }))
}

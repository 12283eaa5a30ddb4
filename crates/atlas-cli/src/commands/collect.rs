//! `atlas collect`: run the evidence pass over one document. With a domain,
//! selector memory is consulted and saved back next to the learning log.

use std::path::Path;

use scraper::Html;
use serde_json::{json, Value};

use atlas_core::{EvidenceCollector, RememberedSelector};

use super::{read_contract, read_html, GlobalOptions};

pub fn execute(
    opts: &GlobalOptions,
    html: &Path,
    contract: &Path,
    domain: Option<&str>,
) -> anyhow::Result<Value> {
    let config = opts.config()?;
    let contract = read_contract(contract)?;
    let document = Html::parse_document(&read_html(html)?);

    let mut collector = EvidenceCollector::new()
        .with_max_samples(config.max_samples)
        .with_min_confidence(config.min_hit_confidence);
    let memory = match domain {
        Some(_) => {
            let memory = opts.selector_memory()?;
            collector = collector.with_memory(memory.clone());
            Some(memory)
        }
        None => None,
    };
    let (findings, entities) = collector.collect_entities(&document, &contract, domain)?;

    let remembered = match (&memory, domain) {
        (Some(memory), Some(domain)) => {
            opts.save_selector_memory(memory)?;
            let remembered: Vec<RememberedSelector> = memory
                .for_domain(domain)
                .into_iter()
                .map(|(field, selector)| RememberedSelector {
                    domain: domain.to_ascii_lowercase(),
                    field,
                    selector,
                })
                .collect();
            serde_json::to_value(remembered)?
        }
        _ => Value::Null,
    };

    Ok(json!({
        "contract": { "id": contract.id, "version": contract.version },
        "summary": findings.summary(),
        "findings": findings,
        "entities": entities,
        "remembered_selectors": remembered,
    }))
}

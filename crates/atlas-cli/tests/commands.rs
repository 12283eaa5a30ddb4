//! Subcommand integration tests over scratch files.

use std::path::PathBuf;

use serde_json::{json, Value};

use atlas_cli::commands;
use atlas_cli::error::{error_report, exit_code, exit_codes};
use atlas_cli::{resolve_config_path, resolve_learning_path, resolve_memory_path, GlobalOptions};
use atlas_core::ProcessingMode;

// ─────────────────────── helpers ───────────────────────

const LISTING: &str = r#"
<html><body><ul>
  <li class="item"><span class="name">Widget</span><span class="price">$30</span>
      <dl><dt>Color</dt><dd>Red</dd></dl></li>
  <li class="item"><span class="name">Gadget</span><span class="price">$10</span>
      <dl><dt>Color</dt><dd>Blue</dd></dl></li>
  <li class="item"><span class="name">Doohickey</span>
      <dl><dt>Color</dt><dd>Green</dd></dl></li>
</ul></body></html>"#;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let ws = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        ws.write("config.json", &json!({ "soft_threshold": 0.7 }).to_string());
        ws.write("page.html", LISTING);
        ws.write(
            "contract.json",
            &json!({
                "id": "products",
                "record_selector": "li.item",
                "fields": [
                    { "name": "name", "kind": "required",
                      "detector": { "type": "css", "selector": ".name" } },
                    { "name": "price", "kind": "required",
                      "detector": { "type": "css", "selector": ".price" },
                      "extractor": { "type": "number" } }
                ]
            })
            .to_string(),
        );
        ws.write(
            "task.json",
            &json!({ "domain": "shop.example", "target_type": "product" }).to_string(),
        );
        ws
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn opts(&self) -> GlobalOptions {
        GlobalOptions {
            config: Some(self.path("config.json").display().to_string()),
            learning_file: Some(self.path("learning.jsonl").display().to_string()),
        }
    }
}

// ─────────────────────── commands ───────────────────────

#[test]
fn test_collect_reports_entities_and_misses() {
    let ws = Workspace::new();
    let out = commands::collect::execute(
        &ws.opts(),
        &ws.path("page.html"),
        &ws.path("contract.json"),
        Some("shop.example"),
    )
    .unwrap();

    assert_eq!(out["entities"].as_array().unwrap().len(), 3);
    assert_eq!(out["entities"][0]["price"], json!(30.0));
    assert_eq!(out["findings"]["support_map"]["price"], json!(2));
    assert_eq!(out["findings"]["misses"][0]["field"], "price");
    assert_eq!(out["findings"]["misses"][0]["reason"], "no_matches_found");
}

#[test]
fn test_process_soft_uses_config_threshold() {
    let ws = Workspace::new();
    let entities = ws.write(
        "entities.json",
        &json!([
            { "name": "a", "price": 1 },
            { "name": "b", "price": 2 },
            { "name": "c" }
        ])
        .to_string(),
    );
    // price support is 2/3 ≈ 0.67, below the configured 0.7.
    let out = commands::process::execute(&ws.opts(), &entities, &ws.path("contract.json"), None, None)
        .unwrap();
    assert_eq!(out["metadata"]["omitted_fields"], json!(["price"]));
    assert_eq!(out["contract"]["version"], json!(2));

    let out = commands::process::execute(
        &ws.opts(),
        &entities,
        &ws.path("contract.json"),
        None,
        Some(0.5),
    )
    .unwrap();
    assert_eq!(out["metadata"]["omitted_fields"], json!([]));
}

#[test]
fn test_process_strict_failure_is_reported_as_json() {
    let ws = Workspace::new();
    let entities = ws.write("entities.json", &json!([{ "name": "a" }, { "price": 3 }]).to_string());
    let err = commands::process::execute(
        &ws.opts(),
        &entities,
        &ws.path("contract.json"),
        Some(ProcessingMode::Strict),
        None,
    )
    .unwrap_err();

    let report = error_report(&err);
    assert_eq!(report["error"], "strict_mode_failure");
    assert_eq!(report["dropped_count"], 2);
    assert_eq!(report["original_count"], 2);
    assert_eq!(report["required_fields"], json!(["name", "price"]));
    assert_eq!(exit_code(&err), exit_codes::STRICT_MODE);
}

#[tokio::test]
async fn test_run_appends_learning_and_stats_aggregates() {
    let ws = Workspace::new();
    let opts = ws.opts();
    for _ in 0..2 {
        let report = commands::run::execute(
            &opts,
            &ws.path("task.json"),
            &ws.path("page.html"),
            &ws.path("contract.json"),
            None,
        )
        .await
        .unwrap();
        assert_eq!(report["plan"]["strategy"], "rule_based");
    }

    let stats = commands::stats::execute(&opts).unwrap();
    assert_eq!(stats["total_records"], json!(2));
    assert_eq!(stats["signatures"][0]["signature"]["domain"], "shop.example");
    assert_eq!(stats["signatures"][0]["attempts"], json!(2));
}

#[tokio::test]
async fn test_plan_flags_unresolvable_contract() {
    let ws = Workspace::new();
    let contract = ws.write(
        "blind.json",
        &json!({
            "id": "blind",
            "fields": [{ "name": "summary", "kind": "required" }]
        })
        .to_string(),
    );
    let out = commands::plan::execute(&ws.opts(), &ws.path("task.json"), &contract)
        .await
        .unwrap();
    assert_eq!(out["preflight"]["can_execute"], json!(false));
    assert_eq!(out["preflight"]["issues"][0]["kind"], "no_viable_detector");
}

#[test]
fn test_discover_proposes_and_applies() {
    let ws = Workspace::new();
    let manual = commands::discover::execute(
        &ws.opts(),
        &ws.path("page.html"),
        &ws.path("contract.json"),
        None,
        true,
    )
    .unwrap();
    assert_eq!(manual["policy"], "manual");
    assert_eq!(manual["candidates"][0]["normalized"], "color");
    assert_eq!(manual["proposals"], json!([]));
    assert_eq!(manual["contract"], Value::Null);

    let auto = commands::discover::execute(
        &ws.opts(),
        &ws.path("page.html"),
        &ws.path("contract.json"),
        Some(3),
        true,
    )
    .unwrap();
    assert_eq!(auto["proposals"][0]["spec"]["name"], "color");
    assert_eq!(auto["proposals"][0]["sample_values"], json!(["Red", "Blue", "Green"]));
    assert_eq!(auto["contract"]["version"], json!(2));
    assert_eq!(auto["contract"]["fields"][2]["kind"], "discoverable");
}

#[test]
fn test_collect_with_domain_saves_selector_memory() {
    let ws = Workspace::new();
    let contract = ws.write(
        "moved.json",
        &json!({
            "id": "products",
            "record_selector": "li.item",
            "fields": [
                { "name": "name", "kind": "required",
                  "detector": { "type": "css", "selector": ".name" } },
                { "name": "price", "kind": "required",
                  "detector": { "type": "css", "selector": ".cost", "fallbacks": [".price"] } }
            ]
        })
        .to_string(),
    );

    let out = commands::collect::execute(&ws.opts(), &ws.path("page.html"), &contract, Some("Shop.Example"))
        .unwrap();
    assert_eq!(out["remembered_selectors"][0]["domain"], "shop.example");
    assert_eq!(out["remembered_selectors"][0]["field"], "price");
    assert_eq!(out["remembered_selectors"][0]["adapted"], ".price");
    assert!(ws.path("selectors.json").exists());

    let without_domain =
        commands::collect::execute(&ws.opts(), &ws.path("page.html"), &contract, None).unwrap();
    assert_eq!(without_domain["remembered_selectors"], Value::Null);
}

#[test]
fn test_missing_input_has_context() {
    let ws = Workspace::new();
    let err = commands::collect::execute(
        &ws.opts(),
        &ws.path("absent.html"),
        &ws.path("contract.json"),
        None,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("failed to read HTML"));
    assert_eq!(exit_code(&err), exit_codes::FAILURE);
}

// ─────────────────────── config resolution ───────────────────────

#[test]
fn test_explicit_paths_win() {
    assert_eq!(
        resolve_config_path(Some("/tmp/atlas.json")),
        Some(PathBuf::from("/tmp/atlas.json"))
    );
    assert_eq!(
        resolve_learning_path(Some("/tmp/learning.jsonl")),
        PathBuf::from("/tmp/learning.jsonl")
    );
    assert_eq!(
        resolve_memory_path(&PathBuf::from("/tmp/atlas/learning.jsonl")),
        PathBuf::from("/tmp/atlas/selectors.json")
    );
}

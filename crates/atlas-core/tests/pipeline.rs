//! End-to-end attempts through `ExtractionPipeline`: soft and strict modes,
//! AI-assisted planning with fallbacks, preflight aborts, and learning
//! persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use atlas_core::capability::{PlanProposal, PlanRequest, SchemaProposal, SchemaRequest};
use atlas_core::learning::RecordFlags;
use atlas_core::plan::{EvidenceSource, OrderingRule, PlanStep, SortDirection};
use atlas_core::*;

// ─────────────────────── helpers ───────────────────────

const LISTING: &str = r#"
<html><body>
  <ul>
    <li class="item"><span class="name">Widget</span><span class="price">$30</span><a class="mail">a@x.com</a></li>
    <li class="item"><span class="name">Gadget</span><span class="price">$10</span></li>
    <li class="item"><span class="name">Doohickey</span><span class="price">$20</span></li>
  </ul>
</body></html>"#;

fn css(sel: &str) -> Detector {
    Detector::Css {
        selector: sel.into(),
        fallbacks: vec![],
        confidence: 0.95,
    }
}

fn products() -> SchemaContract {
    SchemaContract::new(
        "products",
        vec![
            FieldSpec::new("name", FieldKind::Required, css(".name")),
            FieldSpec::new("price", FieldKind::Required, css(".price")).with_extractor(Extractor::Number),
            FieldSpec::new("email", FieldKind::Required, css(".mail")).with_validator(Validator::Email),
        ],
    )
    .unwrap()
    .with_record_selector("li.item")
}

/// `name` resolves through markup; `summary` needs the capability.
fn products_with_summary() -> SchemaContract {
    SchemaContract::new(
        "products",
        vec![
            FieldSpec::new("name", FieldKind::Required, css(".name")),
            FieldSpec::new("summary", FieldKind::Required, Detector::None),
        ],
    )
    .unwrap()
    .with_record_selector("li.item")
}

fn task() -> TaskDescription {
    TaskDescription::new("shop.example", "product").with_instructions("list every product")
}

fn entity(value: serde_json::Value) -> Entity {
    value.as_object().cloned().unwrap()
}

#[derive(Default)]
struct MockCapability {
    plan_delay: Option<Duration>,
    schema_delay: Option<Duration>,
    fail_schema: bool,
    plan_calls: AtomicUsize,
    schema_calls: AtomicUsize,
}

#[async_trait]
impl ExtractionCapability for MockCapability {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate_plan(&self, request: &PlanRequest) -> Result<PlanProposal, CapabilityError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.plan_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(PlanProposal {
            steps: vec![
                PlanStep {
                    order: 1,
                    source: EvidenceSource::ContractSelectors,
                    fields: request.required_fields.clone(),
                    description: "selectors first".into(),
                },
                PlanStep {
                    order: 2,
                    source: EvidenceSource::AiCapability,
                    fields: request.unresolved_fields.clone(),
                    description: "fill the rest".into(),
                },
            ],
            rationale: Some("mock plan".into()),
        })
    }

    async fn generate_schema(&self, request: &SchemaRequest) -> Result<SchemaProposal, CapabilityError> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        assert!(request.current_findings.is_some());
        if let Some(delay) = self.schema_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_schema {
            return Err(CapabilityError::Failed("mock refused".into()));
        }
        Ok(SchemaProposal {
            schema: request.contract_schema.clone(),
            data: vec![
                entity(json!({"name": "Widget", "summary": "a widget"})),
                entity(json!({"name": "Gadget", "summary": "a gadget"})),
            ],
        })
    }
}

async fn pipeline(config: PipelineConfig, contract: SchemaContract) -> ExtractionPipeline {
    let pipeline = ExtractionPipeline::builder(config).build().unwrap();
    pipeline.register_contract(contract).await.unwrap();
    pipeline
}

async fn ai_pipeline(capability: Arc<MockCapability>, contract: SchemaContract) -> ExtractionPipeline {
    let config = PipelineConfig {
        capability_timeout_ms: 50,
        ..PipelineConfig::default()
    };
    let pipeline = ExtractionPipeline::builder(config)
        .capability(capability)
        .build()
        .unwrap();
    pipeline.register_contract(contract).await.unwrap();
    pipeline
}

// ─────────────────────── soft / strict ───────────────────────

#[tokio::test]
async fn test_soft_run_demotes_and_commits_new_version() {
    let pipeline = pipeline(PipelineConfig::default(), products()).await;
    let report = pipeline.run(&task(), LISTING, "products").await.unwrap();

    assert_eq!(report.plan.strategy, StrategyKind::RuleBased);
    assert!(report.preflight.can_execute);
    assert_eq!(report.result.entities.len(), 3);
    assert_eq!(report.result.metadata.omitted_fields, vec!["email"]);
    assert!(report.result.entities.iter().all(|e| !e.contains_key("email")));

    let latest = pipeline.contract("products").await.unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.required_fields(), vec!["name", "price"]);
    assert_eq!(pipeline.contract_history("products").await.len(), 2);

    // email counts against coverage even though it was demoted.
    let expected = 0.5 * (2.0 / 3.0) + 0.3 + 0.2;
    assert!((report.evaluation.score - expected).abs() < 1e-9);
    assert!(report.learning.flags.contract_changed);
    assert_eq!(pipeline.learning().attempts(&task().signature()), 1);
}

#[tokio::test]
async fn test_second_soft_run_uses_demoted_contract() {
    let pipeline = pipeline(PipelineConfig::default(), products()).await;
    pipeline.run(&task(), LISTING, "products").await.unwrap();
    let second = pipeline.run(&task(), LISTING, "products").await.unwrap();

    assert_eq!(second.plan.contract_version, 2);
    assert!(!second.result.contract_changed());
    assert_eq!(pipeline.contract_history("products").await.len(), 2);
}

#[tokio::test]
async fn test_ordering_and_max_items_applied_before_mode() {
    let pipeline = pipeline(PipelineConfig::default(), products()).await;
    let task = task().with_constraints(PlanConstraints {
        max_items: Some(2),
        ordering: OrderingRule::ByField {
            field: "price".into(),
            direction: SortDirection::Ascending,
        },
        ..PlanConstraints::default()
    });
    let report = pipeline.run(&task, LISTING, "products").await.unwrap();

    let names: Vec<_> = report.result.entities.iter().map(|e| e["name"].clone()).collect();
    assert_eq!(names, vec![json!("Gadget"), json!("Doohickey")]);
    assert_eq!(report.evaluation.ordering_score, 1.0);
}

#[tokio::test]
async fn test_strict_failure_is_recorded_then_returned() {
    let contract = SchemaContract::new(
        "contacts",
        vec![
            FieldSpec::new("name", FieldKind::Required, css(".name")),
            FieldSpec::new("phone", FieldKind::Required, css(".phone")),
        ],
    )
    .unwrap()
    .with_record_selector("li.item");
    let config = PipelineConfig {
        mode: ProcessingMode::Strict,
        ..PipelineConfig::default()
    };
    let pipeline = pipeline(config, contract).await;

    let err = pipeline.run(&task(), LISTING, "contacts").await.unwrap_err();
    match &err {
        PipelineError::StrictMode {
            dropped_count,
            original_count,
            required_fields,
        } => {
            assert_eq!((*dropped_count, *original_count), (3, 3));
            assert_eq!(required_fields, &vec!["name".to_string(), "phone".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let stats = pipeline.learning().stats(&task().signature()).unwrap();
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.strict_failures, 1);
    assert_eq!(stats.rolling_score, 0.0);
    // Strict mode never derives a contract.
    assert_eq!(pipeline.contract("contacts").await.unwrap().version, 1);
}

#[tokio::test]
async fn test_unknown_contract_is_an_error() {
    let pipeline = pipeline(PipelineConfig::default(), products()).await;
    let err = pipeline.run(&task(), LISTING, "missing").await.unwrap_err();
    assert_eq!(err.code(), "contract_error");
}

// ─────────────────────── preflight ───────────────────────

#[tokio::test]
async fn test_preflight_aborts_without_capability() {
    let pipeline = pipeline(PipelineConfig::default(), products_with_summary()).await;
    let err = pipeline.run(&task(), LISTING, "products").await.unwrap_err();
    assert_eq!(err.code(), "plan_infeasible");
    // Nothing ran, so nothing was learned.
    assert_eq!(pipeline.learning().total_records(), 0);
}

#[tokio::test]
async fn test_plan_reports_without_executing() {
    let pipeline = pipeline(PipelineConfig::default(), products_with_summary()).await;
    let (plan, report) = pipeline.plan(&task(), "products").await.unwrap();
    assert_eq!(plan.strategy, StrategyKind::RuleBased);
    assert!(!report.can_execute);
    assert!(report.recommendations[0].contains("summary"));
}

// ─────────────────────── AI-assisted ───────────────────────

#[tokio::test]
async fn test_ai_plan_uses_capability_data() {
    let capability = Arc::new(MockCapability::default());
    let pipeline = ai_pipeline(capability.clone(), products_with_summary()).await;
    let report = pipeline.run(&task(), LISTING, "products").await.unwrap();

    assert_eq!(report.plan.strategy, StrategyKind::AiAssisted);
    assert!((report.plan.estimated_cost - 0.0005).abs() < 1e-12);
    assert!(report.ai_used);
    assert!(!report.fell_back);
    assert_eq!(report.result.entities.len(), 2);
    assert!(report.ai_schema.is_some());
    // One capability call per attempt, spent on schema and data.
    assert_eq!(capability.plan_calls.load(Ordering::SeqCst), 0);
    assert_eq!(capability.schema_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_schema_failure_falls_back_to_deterministic_entities() {
    let capability = Arc::new(MockCapability {
        fail_schema: true,
        ..MockCapability::default()
    });
    let pipeline = ai_pipeline(capability, products_with_summary()).await;
    let report = pipeline.run(&task(), LISTING, "products").await.unwrap();

    assert!(report.fell_back);
    assert!(!report.ai_used);
    assert_eq!(report.result.entities.len(), 3);
    assert_eq!(report.result.metadata.omitted_fields, vec!["summary"]);
    assert!(report.learning.flags.fell_back);
}

#[tokio::test]
async fn test_slow_schema_call_times_out_to_deterministic_entities() {
    let capability = Arc::new(MockCapability {
        schema_delay: Some(Duration::from_millis(500)),
        ..MockCapability::default()
    });
    let pipeline = ai_pipeline(capability.clone(), products_with_summary()).await;
    let report = pipeline.run(&task(), LISTING, "products").await.unwrap();

    assert!(report.fell_back);
    assert!(!report.ai_used);
    assert_eq!(report.result.entities.len(), 3);
    assert_eq!(capability.schema_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slow_planner_falls_back_in_plan_preview() {
    let capability = Arc::new(MockCapability {
        plan_delay: Some(Duration::from_millis(500)),
        ..MockCapability::default()
    });
    let pipeline = ai_pipeline(capability.clone(), products_with_summary()).await;
    let (plan, report) = pipeline.plan(&task(), "products").await.unwrap();

    assert_eq!(plan.strategy, StrategyKind::RuleBased);
    assert!(plan.fell_back);
    assert!(!report.can_execute);
    assert_eq!(capability.plan_calls.load(Ordering::SeqCst), 1);
    assert_eq!(capability.schema_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_poor_history_biases_toward_ai() {
    let capability = Arc::new(MockCapability::default());
    let pipeline = ai_pipeline(capability, products()).await;

    let (plan, _) = pipeline.plan(&task(), "products").await.unwrap();
    assert_eq!(plan.strategy, StrategyKind::RuleBased);

    for _ in 0..3 {
        pipeline.learning().record(&LearningRecord::new(
            task().signature(),
            0.1,
            RecordFlags::default(),
        ));
    }
    let (plan, _) = pipeline.plan(&task(), "products").await.unwrap();
    assert_eq!(plan.strategy, StrategyKind::AiAssisted);
}

// ─────────────────────── learning persistence ───────────────────────

#[tokio::test]
async fn test_learning_log_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learning.jsonl");

    let pipeline = ExtractionPipeline::builder(PipelineConfig::default())
        .learning_log(LearningLog::open(&path).unwrap())
        .build()
        .unwrap();
    pipeline.register_contract(products()).await.unwrap();
    pipeline.run(&task(), LISTING, "products").await.unwrap();
    pipeline.run(&task(), LISTING, "products").await.unwrap();
    drop(pipeline);

    let recorder = LearningLog::replay(&path, LearningConfig::default()).unwrap();
    assert_eq!(recorder.total_records(), 2);
    assert_eq!(recorder.attempts(&task().signature()), 2);
}

#[tokio::test]
async fn test_concurrent_attempts_share_learning() {
    let pipeline = Arc::new(pipeline(PipelineConfig::default(), products()).await);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let p = pipeline.clone();
            tokio::spawn(async move { p.run(&task(), LISTING, "products").await.map(|r| r.evaluation.score) })
        })
        .collect();
    for h in handles {
        assert!(h.await.unwrap().is_ok());
    }
    assert_eq!(pipeline.learning().attempts(&task().signature()), 4);
}

// ─────────────────────── contract versions ───────────────────────

const NO_MAIL: &str = r#"
<ul>
  <li class="item"><span class="name">Widget</span><span class="price">$30</span></li>
  <li class="item"><span class="name">Gadget</span><span class="price">$10</span></li>
</ul>"#;

const NO_PRICE: &str = r#"
<ul>
  <li class="item"><span class="name">Widget</span><a class="mail">w@x.com</a></li>
  <li class="item"><span class="name">Gadget</span><a class="mail">g@x.com</a></li>
</ul>"#;

#[tokio::test]
async fn test_demotions_from_the_same_version_are_both_kept() {
    let pipeline = pipeline(PipelineConfig::default(), products()).await;
    let v1 = pipeline.contract("products").await.unwrap();
    let first = v1.demote(&["email".into()], Some(0.6), "first batch");
    let second = v1.demote(&["price".into()], Some(0.6), "second batch");

    pipeline.commit_contract(first).await.unwrap();
    let stored = pipeline.commit_contract(second).await.unwrap();

    assert_eq!(stored.version, 3);
    assert_eq!(stored.required_fields(), vec!["name"]);
    let history = pipeline.contract_history("products").await;
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].change.as_ref().unwrap().fields, vec!["email"]);
    assert_eq!(history[2].change.as_ref().unwrap().fields, vec!["price"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_soft_runs_keep_every_demotion() {
    let pipeline = Arc::new(pipeline(PipelineConfig::default(), products()).await);
    let handles: Vec<_> = [NO_MAIL, NO_PRICE]
        .into_iter()
        .map(|html| {
            let p = pipeline.clone();
            tokio::spawn(async move { p.run(&task(), html, "products").await })
        })
        .collect();

    let mut reports = Vec::new();
    for h in handles {
        reports.push(h.await.unwrap().unwrap());
    }

    let latest = pipeline.contract("products").await.unwrap();
    assert_eq!(latest.version, 3);
    assert_eq!(latest.required_fields(), vec!["name"]);

    // Each report carries a contract the arena actually holds.
    let history = pipeline.contract_history("products").await;
    for report in &reports {
        assert!(report.result.contract_changed());
        assert!(history.iter().any(|c| **c == report.result.contract));
    }
}

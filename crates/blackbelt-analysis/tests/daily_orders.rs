//! End-to-end orchestration tests: workshop analysis and the daily
//! instruction round trip against a real in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};

use blackbelt_analysis::{
    AnalysisWorkflow, InstructionEngine, Orchestrator, RuleBasedDecisionEngine, Severity,
};
use blackbelt_core::{EngineError, ToolRegistry};
use blackbelt_store::models::*;
use blackbelt_store::{DataProvider, Dimension, SqliteStore};

fn seeded_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::in_memory().expect("open store"));
    store
        .upsert_node(&ProcessNode {
            code: "BLOCK_E".into(),
            name: "提取纯化车间".into(),
            node_type: NodeType::Block,
            parent_code: None,
        })
        .expect("block");
    for (code, name) in [("E01", "提取罐1"), ("E02", "提取罐2"), ("E04", "醇提罐")] {
        store
            .upsert_node(&ProcessNode {
                code: code.into(),
                name: name.into(),
                node_type: NodeType::Unit,
                parent_code: Some("BLOCK_E".into()),
            })
            .expect("unit");
        store
            .upsert_parameter(&ParameterDef {
                node_code: code.into(),
                code: "temp".into(),
                name: "提取温度".into(),
                unit: Some("℃".into()),
                role: ParamRole::Control,
                usl: Some(90.0),
                lsl: Some(80.0),
                target: Some(85.0),
                data_type: ParamDataType::Scalar,
            })
            .expect("param");
    }
    store
}

fn ingest(store: &SqliteStore, node: &str, batch: &str, values: &[f64]) {
    let base = Utc::now();
    for (i, value) in values.iter().enumerate() {
        store
            .insert_measurement(&NewMeasurement {
                batch_id: batch.into(),
                node_code: node.into(),
                param_code: "temp".into(),
                value: *value,
                timestamp: Some(base + Duration::seconds(i as i64)),
                source: MeasurementSource::Simulation,
            })
            .expect("insert measurement");
    }
}

/// 30 points, Cpk comfortably above 1.33 against 80..90 limits.
fn healthy_series() -> Vec<f64> {
    (0..30)
        .map(|i| 85.0 + 0.3 * (((i * 3) % 7) as f64 - 3.0) / 3.0)
        .collect()
}

/// 30 points, wide spread plus one out-of-specification value.
fn failing_series() -> Vec<f64> {
    let mut values: Vec<f64> = (0..29)
        .map(|i| 85.0 + 3.2 * (((i * 7) % 10) as f64 - 4.5) / 4.5)
        .collect();
    values.push(90.5);
    values
}

fn build_engine(store: Arc<SqliteStore>) -> (Arc<Orchestrator>, InstructionEngine) {
    let registry = Arc::new(ToolRegistry::with_builtin_tools());
    let decision = Arc::new(RuleBasedDecisionEngine::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        DataProvider::new(store.clone()),
        AnalysisWorkflow::new(registry),
        decision.clone(),
    ));
    let engine = InstructionEngine::new(store, orchestrator.clone(), decision);
    (orchestrator, engine)
}

#[tokio::test]
async fn workshop_analysis_surfaces_the_failing_unit() {
    let store = seeded_store();
    ingest(&store, "E01", "BATCH_001", &healthy_series());
    ingest(&store, "E02", "BATCH_001", &failing_series());

    let (orchestrator, _) = build_engine(store);
    let report = orchestrator
        .analyze_by_workshop("BLOCK_E")
        .await
        .expect("report");

    assert_eq!(report.status, Severity::Critical);
    assert_eq!(report.critical_issues.len(), 1);
    assert_eq!(report.critical_issues[0].node_code, "E02");
    assert!(report.warnings.is_empty());
    assert!(report.insights.iter().any(|i| i.contains("E02")));
}

#[tokio::test]
async fn analysis_is_idempotent_for_identical_data() {
    let store = seeded_store();
    ingest(&store, "E02", "BATCH_001", &failing_series());
    let (orchestrator, _) = build_engine(store);

    let first = orchestrator.analyze_by_workshop("BLOCK_E").await.expect("report");
    let second = orchestrator.analyze_by_workshop("BLOCK_E").await.expect("report");
    assert_eq!(
        serde_json::to_value(&first.critical_issues).unwrap(),
        serde_json::to_value(&second.critical_issues).unwrap()
    );
    assert_eq!(
        serde_json::to_value(&first.warnings).unwrap(),
        serde_json::to_value(&second.warnings).unwrap()
    );
    assert_eq!(first.status, second.status);
}

#[tokio::test]
async fn daily_orders_render_persist_and_follow_the_lifecycle() {
    let store = seeded_store();
    ingest(&store, "E04", "BATCH_001", &failing_series());
    store
        .upsert_action(&ActionDef {
            code: "ADJUST_VALVE".into(),
            name: "调整蒸汽阀开度".into(),
            risk_code: Some("R_E04_TEMP_HIGH".into()),
            target_role: TargetRole::Operator,
            instruction_template: "Adjust valve on {node_name} from {current_valve}% to {suggested_valve}%"
                .into(),
            priority: ActionPriority::High,
            category: Some("process".into()),
            estimated_impact: None,
            active: true,
        })
        .expect("action");

    let (_, engine) = build_engine(store.clone());

    let orders = engine
        .generate_daily_orders("2025-01-08", &[Dimension::Process])
        .await
        .expect("generate");

    let operator_orders = orders.get(&TargetRole::Operator).expect("operator orders");
    assert_eq!(operator_orders.len(), 1);
    let instruction = &operator_orders[0];
    // The failing series runs above target, so the valve steps down.
    assert_eq!(
        instruction.content,
        "Adjust valve on 醇提罐 from 50% to 45%"
    );
    assert!(!instruction.content.contains('{'));
    assert_eq!(instruction.status, InstructionStatus::Pending);
    assert_eq!(instruction.priority, ActionPriority::High);
    assert_eq!(instruction.evidence["batch_id"], serde_json::json!("BATCH_001"));
    assert!(instruction.evidence.contains_key("current_value"));
    assert_eq!(instruction.instruction_type, InstructionKind::Tactical);

    // Second generation run: nothing new.
    let rerun = engine
        .generate_daily_orders("2025-01-08", &[Dimension::Process])
        .await
        .expect("regenerate");
    assert!(rerun.values().all(|v| v.is_empty()));
    let listed = engine
        .get_instructions_by_role(TargetRole::Operator, "2025-01-08", None)
        .expect("list");
    assert_eq!(listed.len(), 1);

    // Pending → Read → Done, then no further transitions.
    let id = instruction.id;
    let read = engine.mark_read(id).expect("read");
    assert_eq!(read.status, InstructionStatus::Read);
    let done = engine
        .mark_done(id, Some("valve adjusted".into()))
        .expect("done");
    assert_eq!(done.status, InstructionStatus::Done);
    assert_eq!(done.feedback.as_deref(), Some("valve adjusted"));
    assert!(matches!(
        engine.mark_read(id),
        Err(EngineError::BadTransition(_))
    ));
}

#[tokio::test]
async fn quick_actions_accompany_critical_issues() {
    let store = seeded_store();
    ingest(&store, "E04", "BATCH_001", &failing_series());
    store
        .upsert_action(&ActionDef {
            code: "ADJUST_VALVE".into(),
            name: "调整蒸汽阀开度".into(),
            risk_code: Some("R_E04_TEMP_HIGH".into()),
            target_role: TargetRole::Operator,
            instruction_template: "调整{node_name}蒸汽阀".into(),
            priority: ActionPriority::High,
            category: None,
            estimated_impact: None,
            active: true,
        })
        .expect("action");

    let (orchestrator, _) = build_engine(store);
    let report = orchestrator
        .analyze_by_process("E04", Some("temp"), Some(7))
        .await
        .expect("report");
    assert_eq!(report.status, Severity::Critical);
    assert_eq!(report.quick_actions.len(), 1);
    assert_eq!(report.quick_actions[0].action_code, "ADJUST_VALVE");

    let recommended = orchestrator
        .recommended_actions("BATCH_001", 5)
        .await
        .expect("actions");
    assert_eq!(recommended.len(), 1);
    assert_eq!(recommended[0].node_code, "E04");
}

#[tokio::test]
async fn person_and_time_dimensions_are_rejected_for_daily_orders() {
    let (_, engine) = build_engine(seeded_store());
    assert!(matches!(
        engine
            .generate_daily_orders("2025-01-08", &[Dimension::Person])
            .await,
        Err(EngineError::BadRequest(_))
    ));
}

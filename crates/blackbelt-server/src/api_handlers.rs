//! Axum handlers and router for the analysis service boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{json, Value};

use blackbelt_analysis::{
    AnalysisWorkflow, InstructionEngine, MonitorService, Orchestrator, ReportFormatter,
    RuleBasedDecisionEngine,
};
use blackbelt_core::{EngineError, ToolInput, ToolRegistry};
use blackbelt_store::models::{
    InstructionStatus, MeasurementSource, NewMeasurement, NodeType, TargetRole,
};
use blackbelt_store::store::MeasurementFilter;
use blackbelt_store::{DataProvider, Dimension, SqliteStore};

use crate::api_errors::ApiError;
use crate::api_models::*;

const SPC_QUERY_LIMIT: usize = 50;
const HISTOGRAM_QUERY_LIMIT: usize = 100;
const BOXPLOT_SERIES_LIMIT: usize = 50;

/// Shared handler state. The registry is read-only after startup; all
/// mutable state lives in the store.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub registry: Arc<ToolRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub instructions: InstructionEngine,
    pub monitor: MonitorService,
    pub formatter: ReportFormatter,
}

impl AppState {
    /// Wire the default rule-based stack over one store.
    pub fn new(store: Arc<SqliteStore>) -> Self {
        let registry = Arc::new(ToolRegistry::with_builtin_tools());
        let decision = Arc::new(RuleBasedDecisionEngine::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            DataProvider::new(store.clone()),
            AnalysisWorkflow::new(registry.clone()),
            decision.clone(),
        ));
        let instructions = InstructionEngine::new(store.clone(), orchestrator.clone(), decision);
        let monitor = MonitorService::new(store.clone());
        Self {
            store,
            registry,
            orchestrator,
            instructions,
            monitor,
            formatter: ReportFormatter::new(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/graph/structure", get(graph_structure))
        .route("/api/graph/risks/tree", get(risk_tree))
        .route("/api/graph/nodes/:code/risks", get(node_risks))
        .route("/api/analysis/person", post(analyze_person))
        .route("/api/analysis/batch", post(analyze_batch))
        .route("/api/analysis/batch/:batch_id/actions", get(batch_actions))
        .route("/api/analysis/process", post(analyze_process))
        .route("/api/analysis/workshop", post(analyze_workshop))
        .route("/api/analysis/time", post(analyze_time))
        .route("/api/analysis/daily", post(analyze_daily))
        .route("/api/lss/tools", get(list_tools))
        .route("/api/lss/tools/:tool_key/run", post(run_tool))
        .route("/api/lss/spc/analyze", post(analyze_spc))
        .route("/api/lss/pareto/analyze", post(analyze_pareto))
        .route("/api/lss/histogram/analyze", post(analyze_histogram))
        .route("/api/lss/boxplot/analyze", post(analyze_boxplot))
        .route("/api/instructions", get(list_instructions))
        .route("/api/instructions/generate", post(generate_orders))
        .route("/api/instructions/:id/read", post(mark_instruction_read))
        .route("/api/instructions/:id/done", post(mark_instruction_done))
        .route("/api/monitor/node/:code", get(monitor_node))
        .route("/api/monitor/latest", get(monitor_latest))
        .route("/api/data/measurements", post(ingest_measurement))
        .with_state(state)
}

// ---------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------

const BLOCK_SPACING_X: i64 = 500;

async fn graph_structure(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let nodes = state.store.nodes()?;
    let edges = state.store.flow_edges()?;

    let blocks: Vec<_> = nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Block)
        .collect();
    let units: Vec<_> = nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Unit)
        .collect();
    let resources: Vec<_> = nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Resource)
        .collect();

    let block_index = |code: &Option<String>| -> i64 {
        code.as_deref()
            .and_then(|parent| blocks.iter().position(|b| b.code == parent))
            .unwrap_or(0) as i64
    };

    let mut flow_nodes = Vec::new();
    for (idx, block) in blocks.iter().enumerate() {
        let children: Vec<&str> = units
            .iter()
            .filter(|u| u.parent_code.as_deref() == Some(block.code.as_str()))
            .map(|u| u.code.as_str())
            .collect();
        flow_nodes.push(json!({
            "id": block.code,
            "data": {
                "label": format!("{}\n{}", block.code, block.name),
                "code": block.code,
                "name": block.name,
                "type": "Block",
                "children": children,
            },
            "position": {"x": 50 + idx as i64 * BLOCK_SPACING_X, "y": 50},
            "hidden": false,
        }));
    }
    for unit in &units {
        let params = state
            .store
            .parameters_for_node(&unit.code)?
            .into_iter()
            .map(|p| {
                json!({
                    "code": p.code,
                    "name": p.name,
                    "unit": p.unit,
                    "role": p.role.as_str(),
                    "usl": p.usl,
                    "lsl": p.lsl,
                    "target": p.target,
                })
            })
            .collect::<Vec<_>>();
        flow_nodes.push(json!({
            "id": unit.code,
            "data": {
                "label": format!("{}\n{}", unit.code, unit.name),
                "code": unit.code,
                "name": unit.name,
                "type": "Unit",
                "parentId": unit.parent_code,
                "params": params,
            },
            "position": {"x": 50 + block_index(&unit.parent_code) * BLOCK_SPACING_X, "y": 200},
            "hidden": true,
        }));
    }
    for resource in &resources {
        flow_nodes.push(json!({
            "id": resource.code,
            "data": {
                "label": format!("{}\n{}", resource.code, resource.name),
                "code": resource.code,
                "name": resource.name,
                "type": "Resource",
                "parentId": resource.parent_code,
            },
            "position": {"x": 60 + block_index(&resource.parent_code) * BLOCK_SPACING_X, "y": -100},
            "hidden": false,
        }));
    }

    let unit_codes: Vec<&str> = units.iter().map(|u| u.code.as_str()).collect();
    let mut flow_edges = Vec::new();
    for edge in &edges {
        // Only unit-to-unit flows are drawn inside the expanded view.
        if unit_codes.contains(&edge.source_code.as_str())
            && unit_codes.contains(&edge.target_code.as_str())
        {
            flow_edges.push(json!({
                "id": format!("e_{}_{}", edge.source_code, edge.target_code),
                "source": edge.source_code,
                "target": edge.target_code,
                "label": edge.name,
                "hidden": true,
            }));
        }
    }
    for pair in blocks.windows(2) {
        flow_edges.push(json!({
            "id": format!("block_edge_{}_{}", pair[0].code, pair[1].code),
            "source": pair[0].code,
            "target": pair[1].code,
            "label": "→",
            "hidden": false,
        }));
    }

    Ok(Json(json!({"nodes": flow_nodes, "edges": flow_edges})))
}

async fn risk_tree(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let risks = state.store.risks()?;
    let edges = state.store.risk_edges()?;
    Ok(Json(json!({
        "risks": risks.iter().map(|r| json!({
            "code": r.code,
            "name": r.name,
            "category": r.category.as_str(),
            "base_probability": r.base_probability,
        })).collect::<Vec<_>>(),
        "edges": edges.iter().enumerate().map(|(i, e)| json!({
            "id": format!("r{}", i),
            "source": e.source_code,
            "target": e.target_code,
            "weight": e.weight,
        })).collect::<Vec<_>>(),
    })))
}

/// Risks matched to a node by code prefix: extraction units (`E*`) map
/// to extraction/concentration/precipitation risks, preparation units
/// (`C*`) to granulation risks.
async fn node_risks(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let risks = state.store.risks()?;
    let related: Vec<_> = risks
        .iter()
        .filter(|risk| {
            if code.starts_with('E') {
                ["EXT_", "CONC_", "PREC_"]
                    .iter()
                    .any(|prefix| risk.code.starts_with(prefix))
            } else if code.starts_with('C') {
                risk.code.starts_with("GRAN_")
            } else {
                false
            }
        })
        .map(|r| {
            json!({
                "code": r.code,
                "name": r.name,
                "category": r.category.as_str(),
                "base_probability": r.base_probability,
            })
        })
        .collect();
    Ok(Json(json!({"risks": related})))
}

// ---------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------

fn parse_date(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("invalid date: {}", raw)))?;
    Ok(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).expect("midnight exists"),
        Utc,
    ))
}

async fn analyze_person(
    State(state): State<AppState>,
    Json(request): Json<PersonAnalysisRequest>,
) -> Result<Json<Value>, ApiError> {
    let range = match &request.date_range {
        Some(range) if range.len() == 2 => Some((
            parse_date(&range[0])?,
            parse_date(&range[1])? + Duration::days(1),
        )),
        Some(_) => {
            return Err(ApiError::bad_request(
                "date_range must hold exactly two dates",
            ))
        }
        None => None,
    };
    let report = state
        .orchestrator
        .analyze_by_person(&request.operator_id, range)
        .await?;
    Ok(Json(serde_json::to_value(report).map_err(internal)?))
}

async fn analyze_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchAnalysisRequest>,
) -> Result<Json<Value>, ApiError> {
    let report = state.orchestrator.analyze_by_batch(&request.batch_id).await?;
    Ok(Json(serde_json::to_value(report).map_err(internal)?))
}

async fn analyze_process(
    State(state): State<AppState>,
    Json(request): Json<ProcessAnalysisRequest>,
) -> Result<Json<Value>, ApiError> {
    let report = state
        .orchestrator
        .analyze_by_process(
            &request.node_code,
            request.param_code.as_deref(),
            request.time_window,
        )
        .await?;
    Ok(Json(serde_json::to_value(report).map_err(internal)?))
}

/// Top suggested actions for one batch, for quick front-end display.
async fn batch_actions(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Query(query): Query<BatchActionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let actions = state
        .orchestrator
        .recommended_actions(&batch_id, query.max_actions.unwrap_or(5))
        .await?;
    Ok(Json(json!({"success": true, "actions": actions})))
}

async fn analyze_workshop(
    State(state): State<AppState>,
    Json(request): Json<WorkshopAnalysisRequest>,
) -> Result<Json<Value>, ApiError> {
    let report = state
        .orchestrator
        .analyze_by_workshop(&request.block_code)
        .await?;
    Ok(Json(serde_json::to_value(report).map_err(internal)?))
}

async fn analyze_time(
    State(state): State<AppState>,
    Json(request): Json<TimeAnalysisRequest>,
) -> Result<Json<Value>, ApiError> {
    let start = parse_date(&request.start_date)?;
    let end = parse_date(&request.end_date)? + Duration::days(1);
    let report = state.orchestrator.analyze_by_time(start, end).await?;
    Ok(Json(serde_json::to_value(report).map_err(internal)?))
}

/// Cross-workshop merged report; a failing workshop degrades the merge,
/// it does not abort the others.
async fn analyze_daily(
    State(state): State<AppState>,
    Json(request): Json<DailyAnalysisRequest>,
) -> Result<Json<Value>, ApiError> {
    let block_codes = match request.block_codes {
        Some(codes) => codes,
        None => state
            .store
            .nodes_by_type(NodeType::Block)?
            .into_iter()
            .map(|n| n.code)
            .collect(),
    };
    let mut reports = Vec::new();
    for code in &block_codes {
        match state.orchestrator.analyze_by_workshop(code).await {
            Ok(report) => reports.push(report),
            Err(error) => {
                tracing::warn!(block = %code, %error, "workshop analysis failed, continuing");
            }
        }
    }
    Ok(Json(state.formatter.merge_reports(&reports)))
}

// ---------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------

async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"success": true, "tools": state.registry.list()}))
}

async fn run_tool(
    State(state): State<AppState>,
    Path(tool_key): Path<String>,
    Json(request): Json<ToolRunRequest>,
) -> Result<Json<Value>, ApiError> {
    let tool = state.registry.get(&tool_key)?;
    let input = ToolInput::from_value(&request.data).map_err(ApiError::bad_request)?;
    let config = if request.config.is_null() {
        json!({})
    } else {
        request.config
    };
    let outcome = tool.run(&input, &config);
    Ok(Json(serde_json::to_value(outcome).map_err(internal)?))
}

/// Fetch a series for one parameter, falling back to the stored
/// specification limits when the request leaves them unset.
fn fetch_series(
    state: &AppState,
    param_code: &str,
    node_code: Option<&str>,
    batch_id: Option<&str>,
    limit: usize,
) -> Result<(Vec<f64>, Value), ApiError> {
    let filter = MeasurementFilter {
        param_code: Some(param_code),
        node_code,
        batch_id,
        ..Default::default()
    };
    let measurements = state.store.measurements(&filter, limit)?;
    let values: Vec<f64> = measurements.iter().map(|m| m.value).collect();
    let metadata = json!({
        "param_code": param_code,
        "node_code": node_code,
        "batch_id": batch_id,
        "data_points": values.len(),
        "time_range": if measurements.is_empty() { Value::Null } else {
            json!({
                "start": measurements.first().unwrap().timestamp.to_rfc3339(),
                "end": measurements.last().unwrap().timestamp.to_rfc3339(),
            })
        },
    });
    Ok((values, metadata))
}

fn stored_limits(
    state: &AppState,
    param_code: &str,
    node_code: Option<&str>,
) -> Result<(Option<f64>, Option<f64>, Option<f64>), ApiError> {
    let param = match node_code {
        Some(node) => state.store.parameter(node, param_code)?,
        None => state.store.parameter_by_code(param_code)?,
    };
    Ok(match param {
        Some(p) => (p.usl, p.lsl, p.target),
        None => (None, None, None),
    })
}

async fn analyze_spc(
    State(state): State<AppState>,
    Json(request): Json<SpcAnalyzeRequest>,
) -> Result<Json<Value>, ApiError> {
    let (values, metadata) = fetch_series(
        &state,
        &request.param_code,
        request.node_code.as_deref(),
        request.batch_id.as_deref(),
        request.limit.unwrap_or(SPC_QUERY_LIMIT),
    )?;
    if values.is_empty() {
        return Ok(Json(json!({
            "success": false,
            "errors": [format!("未找到参数 {} 的测量数据", request.param_code)],
        })));
    }
    let (usl, lsl, target) =
        stored_limits(&state, &request.param_code, request.node_code.as_deref())?;
    let config = json!({
        "usl": request.usl.or(usl),
        "lsl": request.lsl.or(lsl),
        "target": request.target.or(target),
    });
    let tool = state.registry.get("spc")?;
    let outcome = tool.run(&ToolInput::TimeSeries(values), &config);
    let mut body = serde_json::to_value(outcome).map_err(internal)?;
    body["metadata"] = metadata;
    Ok(Json(body))
}

async fn analyze_pareto(
    State(state): State<AppState>,
    Json(request): Json<ParetoAnalyzeRequest>,
) -> Result<Json<Value>, ApiError> {
    let input = ToolInput::from_value(&request.categories).map_err(ApiError::bad_request)?;
    let config = json!({"threshold": request.threshold.unwrap_or(0.8)});
    let tool = state.registry.get("pareto")?;
    let outcome = tool.run(&input, &config);
    Ok(Json(serde_json::to_value(outcome).map_err(internal)?))
}

async fn analyze_histogram(
    State(state): State<AppState>,
    Json(request): Json<HistogramAnalyzeRequest>,
) -> Result<Json<Value>, ApiError> {
    let (values, metadata) = fetch_series(
        &state,
        &request.param_code,
        request.node_code.as_deref(),
        request.batch_id.as_deref(),
        request.limit.unwrap_or(HISTOGRAM_QUERY_LIMIT),
    )?;
    if values.is_empty() {
        return Ok(Json(json!({
            "success": false,
            "errors": [format!("未找到参数 {} 的测量数据", request.param_code)],
        })));
    }
    let (usl, lsl, _) = stored_limits(&state, &request.param_code, request.node_code.as_deref())?;
    let config = json!({
        "bins": request.bins.unwrap_or(10),
        "usl": request.usl.or(usl),
        "lsl": request.lsl.or(lsl),
    });
    let tool = state.registry.get("histogram")?;
    let outcome = tool.run(&ToolInput::TimeSeries(values), &config);
    let mut body = serde_json::to_value(outcome).map_err(internal)?;
    body["metadata"] = metadata;
    Ok(Json(body))
}

async fn analyze_boxplot(
    State(state): State<AppState>,
    Json(request): Json<BoxplotAnalyzeRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut series = BTreeMap::new();
    for (i, param_code) in request.param_codes.iter().enumerate() {
        let node_code = request
            .node_codes
            .as_ref()
            .and_then(|codes| codes.get(i))
            .map(String::as_str);
        let filter = MeasurementFilter {
            param_code: Some(param_code),
            node_code,
            batch_id: request.batch_id.as_deref(),
            ..Default::default()
        };
        let measurements = state
            .store
            .measurements(&filter, request.limit_per_series.unwrap_or(BOXPLOT_SERIES_LIMIT))?;
        if !measurements.is_empty() {
            let name = match node_code {
                Some(node) => format!("{}.{}", node, param_code),
                None => param_code.clone(),
            };
            series.insert(name, measurements.iter().map(|m| m.value).collect::<Vec<f64>>());
        }
    }
    if series.is_empty() {
        return Ok(Json(json!({
            "success": false,
            "errors": ["未找到任何测量数据"],
        })));
    }
    let series_count = series.len();
    let tool = state.registry.get("boxplot")?;
    let outcome = tool.run(&ToolInput::MultipleTimeSeries(series), &json!({}));
    let mut body = serde_json::to_value(outcome).map_err(internal)?;
    body["metadata"] = json!({
        "series_count": series_count,
        "param_codes": request.param_codes,
    });
    Ok(Json(body))
}

// ---------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------

fn parse_role(raw: &str) -> Result<TargetRole, ApiError> {
    TargetRole::from_str(raw).map_err(ApiError::from)
}

fn parse_statuses(raw: &str) -> Result<Vec<InstructionStatus>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| InstructionStatus::from_str(s).map_err(ApiError::from))
        .collect()
}

async fn list_instructions(
    State(state): State<AppState>,
    Query(query): Query<InstructionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let role = parse_role(&query.role)?;
    let statuses = query.status.as_deref().map(parse_statuses).transpose()?;
    let target_date = query
        .target_date
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
    let instructions =
        state
            .instructions
            .get_instructions_by_role(role, &target_date, statuses.as_deref())?;
    Ok(Json(json!({
        "success": true,
        "instructions": instructions,
    })))
}

async fn generate_orders(
    State(state): State<AppState>,
    Json(request): Json<GenerateOrdersRequest>,
) -> Result<Json<GenerateOrdersResponse>, ApiError> {
    let target_date = request
        .target_date
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
    let dimensions = match request.dimensions {
        Some(names) => names
            .iter()
            .map(|name| parse_dimension(name))
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![Dimension::Batch, Dimension::Process, Dimension::Workshop],
    };
    let orders = state
        .instructions
        .generate_daily_orders(&target_date, &dimensions)
        .await?;
    let created = orders.values().map(Vec::len).sum();
    let by_role: Value = orders
        .iter()
        .map(|(role, list)| (role.as_str().to_string(), json!(list.len())))
        .collect::<serde_json::Map<String, Value>>()
        .into();
    Ok(Json(GenerateOrdersResponse {
        success: true,
        target_date,
        created,
        by_role,
    }))
}

fn parse_dimension(name: &str) -> Result<Dimension, ApiError> {
    match name {
        "person" => Ok(Dimension::Person),
        "batch" => Ok(Dimension::Batch),
        "process" => Ok(Dimension::Process),
        "workshop" => Ok(Dimension::Workshop),
        "time" => Ok(Dimension::Time),
        other => Err(ApiError::bad_request(format!("unknown dimension: {}", other))),
    }
}

async fn mark_instruction_read(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let instruction = state.instructions.mark_read(id)?;
    Ok(Json(json!({"success": true, "instruction": instruction})))
}

async fn mark_instruction_done(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<DoneRequest>>,
) -> Result<Json<Value>, ApiError> {
    let feedback = body.and_then(|Json(request)| request.feedback);
    let instruction = state.instructions.mark_done(id, feedback)?;
    Ok(Json(json!({"success": true, "instruction": instruction})))
}

// ---------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------

async fn monitor_node(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let view = state.monitor.node_monitor(&code, None)?;
    Ok(Json(json!({"success": true, "monitor": view})))
}

async fn monitor_latest(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows = state.monitor.latest_status()?;
    Ok(Json(json!({"success": true, "nodes": rows})))
}

// ---------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------

async fn ingest_measurement(
    State(state): State<AppState>,
    Json(request): Json<IngestMeasurementRequest>,
) -> Result<Json<Value>, ApiError> {
    let timestamp = request
        .timestamp
        .as_deref()
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ApiError::bad_request(format!("invalid timestamp: {}", raw)))
        })
        .transpose()?;
    let source = request
        .source
        .as_deref()
        .map(MeasurementSource::from_str)
        .transpose()?
        .unwrap_or(MeasurementSource::Sensor);
    let measurement = state.store.insert_measurement(&NewMeasurement {
        batch_id: request.batch_id,
        node_code: request.node_code,
        param_code: request.param_code,
        value: request.value,
        timestamp,
        source,
    })?;
    Ok(Json(json!({"success": true, "measurement": measurement})))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    ApiError::from(EngineError::Internal(e.to_string()))
}

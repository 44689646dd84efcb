//! Request and response DTOs for the HTTP boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------
// Tool endpoints
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct ToolRunRequest {
    pub data: Value,
    #[serde(default)]
    pub config: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpcAnalyzeRequest {
    pub param_code: String,
    pub node_code: Option<String>,
    pub batch_id: Option<String>,
    pub limit: Option<usize>,
    pub usl: Option<f64>,
    pub lsl: Option<f64>,
    pub target: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ParetoAnalyzeRequest {
    pub categories: Value,
    pub threshold: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HistogramAnalyzeRequest {
    pub param_code: String,
    pub node_code: Option<String>,
    pub batch_id: Option<String>,
    pub limit: Option<usize>,
    pub bins: Option<usize>,
    pub usl: Option<f64>,
    pub lsl: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BoxplotAnalyzeRequest {
    pub param_codes: Vec<String>,
    pub node_codes: Option<Vec<String>>,
    pub batch_id: Option<String>,
    pub limit_per_series: Option<usize>,
}

// ---------------------------------------------------------------------
// Analysis endpoints
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct PersonAnalysisRequest {
    pub operator_id: String,
    /// `["YYYY-MM-DD", "YYYY-MM-DD"]`
    pub date_range: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BatchAnalysisRequest {
    pub batch_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProcessAnalysisRequest {
    pub node_code: String,
    pub param_code: Option<String>,
    /// Look-back window in days; full history window when unset.
    pub time_window: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BatchActionsQuery {
    pub max_actions: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkshopAnalysisRequest {
    pub block_code: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TimeAnalysisRequest {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DailyAnalysisRequest {
    /// Blocks to include; defaults to every Block node.
    pub block_codes: Option<Vec<String>>,
}

// ---------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct InstructionsQuery {
    pub role: String,
    /// Comma-separated status list, e.g. `Pending,Read`.
    pub status: Option<String>,
    pub target_date: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct DoneRequest {
    pub feedback: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GenerateOrdersRequest {
    pub target_date: Option<String>,
    /// Dimension names; defaults to batch, process, workshop.
    pub dimensions: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GenerateOrdersResponse {
    pub success: bool,
    pub target_date: String,
    pub created: usize,
    pub by_role: Value,
}

// ---------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct IngestMeasurementRequest {
    pub batch_id: String,
    pub node_code: String,
    pub param_code: String,
    pub value: f64,
    /// RFC 3339; defaults to now.
    pub timestamp: Option<String>,
    /// HISTORY / SIMULATION / SENSOR / INPUT; defaults to SENSOR.
    pub source: Option<String>,
}


//! Current-state monitoring views: latest measurements with rolling
//! capability per node.

use std::sync::Arc;

use serde::Serialize;

use blackbelt_core::spc::{self, SpcConfig};
use blackbelt_core::EngineError;
use blackbelt_store::models::NodeType;
use blackbelt_store::store::MeasurementFilter;
use blackbelt_store::SqliteStore;

/// Window used for the rolling Cpk when the caller does not bound it.
const DEFAULT_WINDOW: usize = 50;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum MonitorStatus {
    Normal,
    Warning,
    Error,
}

impl MonitorStatus {
    /// Map colouring thresholds on the last-window Cpk. Without a
    /// computable Cpk there is nothing to alarm on.
    fn from_cpk(cpk: Option<f64>) -> Self {
        match cpk {
            Some(cpk) if cpk >= 1.33 => Self::Normal,
            Some(cpk) if cpk >= 1.0 => Self::Warning,
            Some(_) => Self::Error,
            None => Self::Normal,
        }
    }
}

/// Chart-ready series for one parameter at one node.
#[derive(Clone, Debug, Serialize)]
pub struct ParamTrend {
    pub param_code: String,
    pub param_name: String,
    pub times: Vec<String>,
    pub values: Vec<f64>,
    pub latest: f64,
    pub cpk: Option<f64>,
    pub process_status: Option<String>,
    pub usl: Option<f64>,
    pub lsl: Option<f64>,
    pub target: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeMonitor {
    pub node_code: String,
    pub node_name: String,
    pub trends: Vec<ParamTrend>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatusRow {
    pub node_code: String,
    pub node_name: String,
    pub latest_timestamp: Option<String>,
    pub latest_value: Option<f64>,
    pub cpk: Option<f64>,
    pub status: MonitorStatus,
}

/// Read-only monitoring queries over the latest measurement window.
#[derive(Clone)]
pub struct MonitorService {
    store: Arc<SqliteStore>,
}

impl MonitorService {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Last `limit` measurements per parameter at a node, with rolling
    /// Cpk computed over the returned window.
    pub fn node_monitor(
        &self,
        node_code: &str,
        limit: Option<usize>,
    ) -> Result<NodeMonitor, EngineError> {
        let node = self
            .store
            .node(node_code)?
            .ok_or_else(|| EngineError::UnknownEntity(format!("node: {}", node_code)))?;
        let limit = limit.unwrap_or(DEFAULT_WINDOW);

        let mut trends = Vec::new();
        for param_code in self.store.measured_params_for_node(node_code)? {
            let filter = MeasurementFilter {
                node_code: Some(node_code),
                param_code: Some(&param_code),
                ..Default::default()
            };
            let window = self.store.measurements(&filter, limit)?;
            if window.is_empty() {
                continue;
            }
            let values: Vec<f64> = window.iter().map(|m| m.value).collect();
            let param = self.store.parameter(node_code, &param_code)?;
            let config = SpcConfig {
                usl: param.as_ref().and_then(|p| p.usl),
                lsl: param.as_ref().and_then(|p| p.lsl),
                target: param.as_ref().and_then(|p| p.target),
            };
            let summary = (values.len() >= 2).then(|| spc::analyze(&values, &config));
            trends.push(ParamTrend {
                param_name: param
                    .as_ref()
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| param_code.clone()),
                param_code,
                times: window
                    .iter()
                    .map(|m| m.timestamp.format("%H:%M").to_string())
                    .collect(),
                latest: *values.last().expect("non-empty window"),
                values,
                cpk: summary.as_ref().and_then(|s| s.cpk),
                process_status: summary.as_ref().map(|s| s.process_status.to_string()),
                usl: config.usl,
                lsl: config.lsl,
                target: config.target,
            });
        }

        Ok(NodeMonitor {
            node_code: node.code,
            node_name: node.name,
            trends,
        })
    }

    /// One row per Unit node with its last-window capability status, for
    /// quick map colouring. The worst parameter decides.
    pub fn latest_status(&self) -> Result<Vec<NodeStatusRow>, EngineError> {
        let mut rows = Vec::new();
        for unit in self.store.nodes_by_type(NodeType::Unit)? {
            let monitor = self.node_monitor(&unit.code, Some(DEFAULT_WINDOW))?;
            let worst_cpk = monitor
                .trends
                .iter()
                .filter_map(|t| t.cpk)
                .fold(None::<f64>, |acc, cpk| {
                    Some(acc.map_or(cpk, |best| best.min(cpk)))
                });
            let latest = monitor.trends.iter().max_by_key(|t| t.times.len());
            let latest_measurement = self
                .store
                .latest_measurement(&unit.code, latest.map(|t| t.param_code.as_str()).unwrap_or(""))?;
            rows.push(NodeStatusRow {
                node_code: unit.code,
                node_name: unit.name,
                latest_timestamp: latest_measurement
                    .as_ref()
                    .map(|m| m.timestamp.to_rfc3339()),
                latest_value: latest_measurement.as_ref().map(|m| m.value),
                cpk: worst_cpk,
                status: MonitorStatus::from_cpk(worst_cpk),
            });
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blackbelt_store::models::*;
    use chrono::{Duration, Utc};

    fn seeded() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::in_memory().expect("open store"));
        store
            .upsert_node(&ProcessNode {
                code: "BLOCK_E".into(),
                name: "提取纯化车间".into(),
                node_type: NodeType::Block,
                parent_code: None,
            })
            .expect("block");
        store
            .upsert_node(&ProcessNode {
                code: "E04".into(),
                name: "醇提罐".into(),
                node_type: NodeType::Unit,
                parent_code: Some("BLOCK_E".into()),
            })
            .expect("unit");
        store
            .upsert_parameter(&ParameterDef {
                node_code: "E04".into(),
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
        store
    }

    fn ingest(store: &SqliteStore, values: &[f64]) {
        let base = Utc::now();
        for (i, value) in values.iter().enumerate() {
            store
                .insert_measurement(&NewMeasurement {
                    batch_id: "B1".into(),
                    node_code: "E04".into(),
                    param_code: "temp".into(),
                    value: *value,
                    timestamp: Some(base + Duration::seconds(i as i64)),
                    source: MeasurementSource::Sensor,
                })
                .expect("insert");
        }
    }

    #[test]
    fn node_monitor_returns_rolling_cpk_and_latest() {
        let store = seeded();
        ingest(&store, &[85.0, 85.2, 85.1, 84.9, 85.3, 85.0]);
        let monitor = MonitorService::new(store);
        let view = monitor.node_monitor("E04", None).expect("monitor");
        assert_eq!(view.node_name, "醇提罐");
        assert_eq!(view.trends.len(), 1);
        let trend = &view.trends[0];
        assert_eq!(trend.latest, 85.0);
        assert_eq!(trend.values.len(), 6);
        assert!(trend.cpk.expect("cpk") > 1.33);
        assert_eq!(trend.process_status.as_deref(), Some("受控"));
    }

    #[test]
    fn node_monitor_unknown_node_is_an_error() {
        let monitor = MonitorService::new(seeded());
        assert!(matches!(
            monitor.node_monitor("E99", None),
            Err(EngineError::UnknownEntity(_))
        ));
    }

    #[test]
    fn latest_status_colours_by_cpk() {
        let store = seeded();
        // Tight series: Cpk far above 1.33.
        ingest(&store, &[85.0, 85.1, 84.9, 85.0, 85.05, 84.95]);
        let monitor = MonitorService::new(store.clone());
        let rows = monitor.latest_status().expect("status");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].node_code, "E04");
        assert_eq!(rows[0].status, MonitorStatus::Normal);
        assert!(rows[0].latest_timestamp.is_some());

        // A wide burst drags the rolling Cpk into the error band.
        ingest(&store, &[78.0, 92.0, 77.5, 93.0, 78.5, 91.5]);
        let rows = monitor.latest_status().expect("status");
        assert_eq!(rows[0].status, MonitorStatus::Error);
    }

    #[test]
    fn units_without_data_report_normal() {
        let monitor = MonitorService::new(seeded());
        let rows = monitor.latest_status().expect("status");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, MonitorStatus::Normal);
        assert!(rows[0].latest_timestamp.is_none());
        assert!(rows[0].cpk.is_none());
    }
}

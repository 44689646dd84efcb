//! Dimension-keyed read-only query surface over the store.
//!
//! Every provider returns a [`DataContext`]: measurements grouped by
//! `(node_code, param_code)` with the applicable parameter definition
//! attached, plus dimension-specific metadata. Unknown keys yield an
//! empty context rather than an error; malformed intervals are
//! `BadRequest`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use blackbelt_core::EngineError;

use crate::models::{Measurement, ParameterDef};
use crate::store::{MeasurementFilter, SqliteStore};

/// Reads are bounded: the most recent rows up to this many, re-ordered
/// ascending, unless the caller supplies its own limit.
pub const DEFAULT_LIMIT: usize = 100;
/// Per-series bound for multi-series (workshop / person / time) reads.
pub const DEFAULT_SERIES_LIMIT: usize = 50;

/// Analysis dimension.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Person,
    Batch,
    Process,
    Workshop,
    Time,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Batch => "batch",
            Self::Process => "process",
            Self::Workshop => "workshop",
            Self::Time => "time",
        }
    }
}

/// One `(node, param)` series inside a context, ordered by timestamp.
#[derive(Clone, Debug)]
pub struct ParamSeries {
    pub node_code: String,
    pub param_code: String,
    pub node_name: String,
    pub param: Option<ParameterDef>,
    pub values: Vec<f64>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub batch_ids: Vec<String>,
}

/// Provider-returned bundle for one dimension key.
#[derive(Clone, Debug)]
pub struct DataContext {
    pub dimension: Dimension,
    pub key: String,
    pub groups: Vec<ParamSeries>,
    pub batch_ids: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl DataContext {
    fn empty(dimension: Dimension, key: &str) -> Self {
        Self {
            dimension,
            key: key.to_string(),
            groups: Vec::new(),
            batch_ids: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Read-only data access keyed by analysis dimension.
#[derive(Clone)]
pub struct DataProvider {
    store: Arc<SqliteStore>,
}

impl DataProvider {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Measurements from batches attributed to one operator.
    pub fn by_person(
        &self,
        operator_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        limit: Option<usize>,
    ) -> Result<DataContext, EngineError> {
        if let Some((start, end)) = range {
            check_interval(start, end)?;
        }
        let batch_ids = self.store.batch_ids_for_operator(operator_id, range)?;
        if batch_ids.is_empty() {
            return Ok(DataContext::empty(Dimension::Person, operator_id));
        }
        let filter = MeasurementFilter {
            batch_ids: Some(&batch_ids),
            ..Default::default()
        };
        let measurements = self
            .store
            .measurements(&filter, limit.unwrap_or(DEFAULT_SERIES_LIMIT * batch_ids.len()))?;
        let mut context = self.build_context(Dimension::Person, operator_id, measurements)?;
        context.metadata.insert("operator_id".into(), json!(operator_id));
        context
            .metadata
            .insert("total_batches".into(), json!(batch_ids.len()));
        Ok(context)
    }

    /// All measurements within one batch.
    pub fn by_batch(&self, batch_id: &str, limit: Option<usize>) -> Result<DataContext, EngineError> {
        let Some(batch) = self.store.batch(batch_id)? else {
            return Ok(DataContext::empty(Dimension::Batch, batch_id));
        };
        let filter = MeasurementFilter {
            batch_id: Some(batch_id),
            ..Default::default()
        };
        let measurements = self.store.measurements(&filter, limit.unwrap_or(DEFAULT_LIMIT))?;
        let mut context = self.build_context(Dimension::Batch, batch_id, measurements)?;
        context.metadata.insert("batch_id".into(), json!(batch_id));
        context
            .metadata
            .insert("product_name".into(), json!(batch.product_name));
        context
            .metadata
            .insert("status".into(), json!(batch.status.as_str()));
        context
            .metadata
            .insert("start_time".into(), json!(batch.start_time.to_rfc3339()));
        Ok(context)
    }

    /// All measurements at one node, optionally scoped to one parameter
    /// and to everything recorded at or after `since`.
    pub fn by_process(
        &self,
        node_code: &str,
        param_code: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<DataContext, EngineError> {
        if self.store.node(node_code)?.is_none() {
            return Ok(DataContext::empty(Dimension::Process, node_code));
        }
        let filter = MeasurementFilter {
            node_code: Some(node_code),
            param_code,
            range: since.map(|start| (start, Utc::now() + chrono::Duration::days(1))),
            ..Default::default()
        };
        let measurements = self.store.measurements(&filter, limit.unwrap_or(DEFAULT_LIMIT))?;
        let mut context = self.build_context(Dimension::Process, node_code, measurements)?;
        context.metadata.insert("node_code".into(), json!(node_code));
        if let Some(param_code) = param_code {
            context.metadata.insert("param_code".into(), json!(param_code));
        }
        if let Some(since) = since {
            context
                .metadata
                .insert("since".into(), json!(since.to_rfc3339()));
        }
        Ok(context)
    }

    /// Union of measurements over every Unit under the given block.
    pub fn by_workshop(
        &self,
        block_code: &str,
        limit: Option<usize>,
    ) -> Result<DataContext, EngineError> {
        let units = self.store.child_units(block_code)?;
        if units.is_empty() {
            return Ok(DataContext::empty(Dimension::Workshop, block_code));
        }
        let unit_codes: Vec<&str> = units.iter().map(|u| u.code.as_str()).collect();
        let filter = MeasurementFilter {
            node_codes: Some(&unit_codes),
            ..Default::default()
        };
        let measurements = self
            .store
            .measurements(&filter, limit.unwrap_or(DEFAULT_SERIES_LIMIT * units.len()))?;
        let mut context = self.build_context(Dimension::Workshop, block_code, measurements)?;
        context.metadata.insert("block_code".into(), json!(block_code));
        context
            .metadata
            .insert("node_codes".into(), json!(&unit_codes));
        context
            .metadata
            .insert("total_nodes".into(), json!(unit_codes.len()));
        Ok(context)
    }

    /// All measurements in a half-open time interval.
    pub fn by_time(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<DataContext, EngineError> {
        check_interval(start, end)?;
        let filter = MeasurementFilter {
            range: Some((start, end)),
            ..Default::default()
        };
        let measurements = self.store.measurements(&filter, limit.unwrap_or(DEFAULT_LIMIT))?;
        let key = format!("{}..{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"));
        let mut context = self.build_context(Dimension::Time, &key, measurements)?;
        context
            .metadata
            .insert("start".into(), json!(start.to_rfc3339()));
        context.metadata.insert("end".into(), json!(end.to_rfc3339()));
        Ok(context)
    }

    fn build_context(
        &self,
        dimension: Dimension,
        key: &str,
        measurements: Vec<Measurement>,
    ) -> Result<DataContext, EngineError> {
        let mut grouped: BTreeMap<(String, String), Vec<Measurement>> = BTreeMap::new();
        for m in measurements {
            grouped
                .entry((m.node_code.clone(), m.param_code.clone()))
                .or_default()
                .push(m);
        }

        let mut batch_ids: Vec<String> = Vec::new();
        let mut groups = Vec::with_capacity(grouped.len());
        for ((node_code, param_code), series) in grouped {
            let param = self.store.parameter(&node_code, &param_code)?;
            let node_name = self
                .store
                .node(&node_code)?
                .map(|n| n.name)
                .unwrap_or_else(|| node_code.clone());
            for m in &series {
                if !batch_ids.contains(&m.batch_id) {
                    batch_ids.push(m.batch_id.clone());
                }
            }
            groups.push(ParamSeries {
                node_code,
                param_code,
                node_name,
                param,
                values: series.iter().map(|m| m.value).collect(),
                timestamps: series.iter().map(|m| m.timestamp).collect(),
                batch_ids: series.iter().map(|m| m.batch_id.clone()).collect(),
            });
        }
        batch_ids.sort();

        let mut metadata = Map::new();
        metadata.insert("dimension".into(), json!(dimension.as_str()));
        metadata.insert(
            "total_measurements".into(),
            json!(groups.iter().map(|g| g.values.len()).sum::<usize>()),
        );

        Ok(DataContext {
            dimension,
            key: key.to_string(),
            groups,
            batch_ids,
            metadata,
        })
    }
}

fn check_interval(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::BadRequest(format!(
            "interval start {} must be before end {}",
            start, end
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use chrono::Duration;

    fn seeded() -> (Arc<SqliteStore>, DataProvider) {
        let store = Arc::new(SqliteStore::in_memory().expect("open store"));
        store
            .upsert_node(&ProcessNode {
                code: "BLOCK_E".into(),
                name: "提取纯化车间".into(),
                node_type: NodeType::Block,
                parent_code: None,
            })
            .expect("block");
        for (code, name) in [("E01", "提取罐1"), ("E02", "提取罐2")] {
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
        let provider = DataProvider::new(store.clone());
        (store, provider)
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
                .expect("insert");
        }
    }

    #[test]
    fn by_batch_groups_by_node_and_param() {
        let (store, provider) = seeded();
        ingest(&store, "E01", "B1", &[85.0, 85.2, 85.1]);
        ingest(&store, "E02", "B1", &[84.0, 84.5]);

        let context = provider.by_batch("B1", None).expect("context");
        assert_eq!(context.dimension, Dimension::Batch);
        assert_eq!(context.groups.len(), 2);
        assert_eq!(context.groups[0].node_code, "E01");
        assert_eq!(context.groups[0].values, vec![85.0, 85.2, 85.1]);
        assert_eq!(context.groups[0].node_name, "提取罐1");
        assert!(context.groups[0].param.is_some());
        assert_eq!(context.batch_ids, vec!["B1".to_string()]);
    }

    #[test]
    fn unknown_keys_yield_empty_contexts() {
        let (_, provider) = seeded();
        assert!(provider.by_batch("NOPE", None).expect("context").is_empty());
        assert!(provider
            .by_process("E99", None, None, None)
            .expect("context")
            .is_empty());
        assert!(provider
            .by_workshop("BLOCK_X", None)
            .expect("context")
            .is_empty());
        assert!(provider
            .by_person("ghost", None, None)
            .expect("context")
            .is_empty());
    }

    #[test]
    fn by_workshop_unions_descendant_units() {
        let (store, provider) = seeded();
        ingest(&store, "E01", "B1", &[85.0, 85.1]);
        ingest(&store, "E02", "B2", &[84.0, 84.1]);

        let context = provider.by_workshop("BLOCK_E", None).expect("context");
        assert_eq!(context.groups.len(), 2);
        assert_eq!(context.batch_ids, vec!["B1".to_string(), "B2".to_string()]);
        assert_eq!(context.metadata["total_nodes"], json!(2));
    }

    #[test]
    fn malformed_interval_is_bad_request() {
        let (_, provider) = seeded();
        let now = Utc::now();
        assert!(matches!(
            provider.by_time(now, now - Duration::days(1), None),
            Err(EngineError::BadRequest(_))
        ));
        assert!(matches!(
            provider.by_person("USER_001", Some((now, now)), None),
            Err(EngineError::BadRequest(_))
        ));
    }

    #[test]
    fn by_process_scopes_to_one_parameter() {
        let (store, provider) = seeded();
        ingest(&store, "E01", "B1", &[85.0, 85.1, 85.2]);
        let context = provider
            .by_process("E01", Some("temp"), None, Some(2))
            .expect("context");
        assert_eq!(context.groups.len(), 1);
        // Bounded to the most recent two, ascending.
        assert_eq!(context.groups[0].values, vec![85.1, 85.2]);
    }

    #[test]
    fn by_process_honours_the_time_window() {
        let (store, provider) = seeded();
        let old = Utc::now() - Duration::days(30);
        store
            .insert_measurement(&NewMeasurement {
                batch_id: "B0".into(),
                node_code: "E01".into(),
                param_code: "temp".into(),
                value: 83.0,
                timestamp: Some(old),
                source: MeasurementSource::History,
            })
            .expect("insert");
        ingest(&store, "E01", "B1", &[85.0, 85.1]);

        let windowed = provider
            .by_process("E01", Some("temp"), Some(Utc::now() - Duration::days(7)), None)
            .expect("context");
        assert_eq!(windowed.groups[0].values, vec![85.0, 85.1]);

        let unbounded = provider
            .by_process("E01", Some("temp"), None, None)
            .expect("context");
        assert_eq!(unbounded.groups[0].values.len(), 3);
    }

    #[test]
    fn by_person_follows_operator_batches() {
        let (store, provider) = seeded();
        store
            .upsert_batch(&Batch {
                id: "B1".into(),
                product_name: DEFAULT_PRODUCT_NAME.into(),
                operator_id: Some("USER_001".into()),
                start_time: Utc::now(),
                end_time: None,
                status: BatchStatus::Running,
            })
            .expect("batch");
        ingest(&store, "E01", "B1", &[85.0, 85.3]);
        ingest(&store, "E02", "B9", &[80.0, 80.1]);

        let context = provider.by_person("USER_001", None, None).expect("context");
        assert_eq!(context.groups.len(), 1);
        assert_eq!(context.groups[0].node_code, "E01");
        assert_eq!(context.metadata["operator_id"], json!("USER_001"));
    }
}

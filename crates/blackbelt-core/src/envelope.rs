//! Uniform result envelope returned by every tool.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Uniform tool result.
///
/// `success` is false exactly when `errors` is non-empty. `result` and
/// `plot_data` are tool-specific JSON shapes; `metrics` surfaces the key
/// scalar metrics to callers that do not want to dig into `result`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Map<String, Value>,
    pub plot_data: Value,
    pub metrics: BTreeMap<String, f64>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub insights: Vec<String>,
}

impl ToolOutcome {
    /// Successful outcome with empty collections to fill in.
    pub fn ok() -> Self {
        Self {
            success: true,
            result: Map::new(),
            plot_data: Value::Null,
            metrics: BTreeMap::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            insights: Vec::new(),
        }
    }

    /// Failed outcome carrying validation or execution errors.
    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            success: false,
            result: Map::new(),
            plot_data: Value::Null,
            metrics: BTreeMap::new(),
            warnings: Vec::new(),
            errors,
            insights: Vec::new(),
        }
    }

    pub fn with_result_entry(mut self, key: &str, value: Value) -> Self {
        self.result.insert(key.to_string(), value);
        self
    }

    pub fn with_metric(mut self, key: &str, value: f64) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Scalar metric lookup, `None` when absent.
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    /// Nested lookup into `result`.
    pub fn result_value(&self, key: &str) -> Option<&Value> {
        self.result.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_outcome_is_not_success() {
        let outcome = ToolOutcome::failed(vec!["数据不能为空".to_string()]);
        assert!(!outcome.success);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn builder_entries_round_trip() {
        let outcome = ToolOutcome::ok()
            .with_result_entry("mean", json!(85.0))
            .with_metric("cpk", 1.5);
        assert_eq!(outcome.result_value("mean"), Some(&json!(85.0)));
        assert_eq!(outcome.metric("cpk"), Some(1.5));
    }
}

//! Tool contract: static metadata, pure validation, execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ToolOutcome;

/// Tool taxonomy layer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolCategory {
    Descriptive,
    Diagnostic,
    Predictive,
    Prescriptive,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Descriptive => "Descriptive",
            Self::Diagnostic => "Diagnostic",
            Self::Predictive => "Predictive",
            Self::Prescriptive => "Prescriptive",
        }
    }
}

/// Input shape a tool accepts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataShape {
    TimeSeries,
    CategoricalCounts,
    MultipleTimeSeries,
}

impl DataShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeSeries => "TimeSeries",
            Self::CategoricalCounts => "CategoricalCounts",
            Self::MultipleTimeSeries => "MultipleTimeSeries",
        }
    }
}

/// Static tool metadata used for registry listings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolMeta {
    pub key: &'static str,
    pub name: &'static str,
    pub category: ToolCategory,
    pub required_data_shape: DataShape,
}

/// One category with its occurrence count (Pareto input row).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CategoryCount {
    pub category: String,
    pub count: f64,
}

/// Tool input, tagged by shape.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolInput {
    TimeSeries(Vec<f64>),
    CategoricalCounts(Vec<CategoryCount>),
    MultipleTimeSeries(BTreeMap<String, Vec<f64>>),
}

impl ToolInput {
    pub fn shape(&self) -> DataShape {
        match self {
            Self::TimeSeries(_) => DataShape::TimeSeries,
            Self::CategoricalCounts(_) => DataShape::CategoricalCounts,
            Self::MultipleTimeSeries(_) => DataShape::MultipleTimeSeries,
        }
    }

    /// Parse the permissive JSON payload accepted by the generic run
    /// endpoint: an array of numbers, an array of `{category, count}`
    /// rows, or an object mapping series names to arrays of numbers.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Array(items) if items.is_empty() => Ok(Self::TimeSeries(Vec::new())),
            Value::Array(items) => {
                if items.iter().all(Value::is_number) {
                    let series = items
                        .iter()
                        .filter_map(Value::as_f64)
                        .collect::<Vec<f64>>();
                    return Ok(Self::TimeSeries(series));
                }
                let mut rows = Vec::with_capacity(items.len());
                for item in items {
                    let Some(obj) = item.as_object() else {
                        return Err("array items must be numbers or {category, count} objects"
                            .to_string());
                    };
                    let category = obj
                        .get("category")
                        .and_then(Value::as_str)
                        .ok_or_else(|| "category field is required".to_string())?
                        .to_string();
                    let count = obj
                        .get("count")
                        .or_else(|| obj.get("value"))
                        .and_then(Value::as_f64)
                        .unwrap_or(1.0);
                    rows.push(CategoryCount { category, count });
                }
                Ok(Self::CategoricalCounts(rows))
            }
            Value::Object(map) => {
                let mut series = BTreeMap::new();
                for (name, values) in map {
                    let Some(items) = values.as_array() else {
                        return Err(format!("series '{}' must be an array of numbers", name));
                    };
                    let parsed = items
                        .iter()
                        .filter_map(Value::as_f64)
                        .collect::<Vec<f64>>();
                    if parsed.len() != items.len() {
                        return Err(format!("series '{}' contains non-numeric values", name));
                    }
                    series.insert(name.clone(), parsed);
                }
                Ok(Self::MultipleTimeSeries(series))
            }
            _ => Err("unsupported data payload".to_string()),
        }
    }

    pub fn as_time_series(&self) -> Option<&[f64]> {
        match self {
            Self::TimeSeries(values) => Some(values),
            _ => None,
        }
    }
}

/// The analysis tool contract.
///
/// `validate` is pure and must not depend on state; `run` performs the
/// analysis and packages any failure into the outcome envelope — errors
/// never escape as panics or `Result::Err`.
pub trait Tool: Send + Sync + std::fmt::Debug {
    fn meta(&self) -> ToolMeta;

    /// Pure input validation: `(ok, errors)`.
    fn validate(&self, data: &ToolInput, config: &Value) -> (bool, Vec<String>);

    fn run(&self, data: &ToolInput, config: &Value) -> ToolOutcome;
}

/// Shared shape check used by every tool's `validate`.
pub(crate) fn expect_shape(data: &ToolInput, expected: DataShape) -> Option<String> {
    if data.shape() == expected {
        None
    } else {
        Some(format!(
            "expected {} data, got {}",
            expected.as_str(),
            data.shape().as_str()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_numeric_array_as_time_series() {
        let input = ToolInput::from_value(&json!([85.0, 86.5, 84.2])).expect("parse");
        assert_eq!(input, ToolInput::TimeSeries(vec![85.0, 86.5, 84.2]));
    }

    #[test]
    fn parses_category_rows() {
        let input = ToolInput::from_value(&json!([
            {"category": "温度异常", "count": 15},
            {"category": "压力异常", "count": 8}
        ]))
        .expect("parse");
        match input {
            ToolInput::CategoricalCounts(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].category, "温度异常");
                assert_eq!(rows[0].count, 15.0);
            }
            other => panic!("unexpected shape: {:?}", other.shape()),
        }
    }

    #[test]
    fn parses_series_map() {
        let input =
            ToolInput::from_value(&json!({"E01": [85.0, 85.2], "E02": [84.9, 85.1]})).expect("parse");
        match input {
            ToolInput::MultipleTimeSeries(series) => {
                assert_eq!(series.len(), 2);
                assert_eq!(series["E01"], vec![85.0, 85.2]);
            }
            other => panic!("unexpected shape: {:?}", other.shape()),
        }
    }

    #[test]
    fn rejects_mixed_array() {
        assert!(ToolInput::from_value(&json!([1.0, "x"])).is_err());
    }
}

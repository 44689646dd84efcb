//! Boxplot analysis: per-series five-number summaries, outlier fences and
//! cross-series comparison.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::envelope::ToolOutcome;
use crate::stats;
use crate::tool::{expect_shape, DataShape, Tool, ToolCategory, ToolInput, ToolMeta};

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct BoxplotConfig {
    #[serde(default = "default_outlier_factor")]
    pub outlier_factor: f64,
}

fn default_outlier_factor() -> f64 {
    1.5
}

impl Default for BoxplotConfig {
    fn default() -> Self {
        Self {
            outlier_factor: default_outlier_factor(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SeriesSummary {
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub iqr: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub n: usize,
    /// `(index, value, tag)` with tag `low` or `high`.
    pub outliers: Vec<(usize, f64, &'static str)>,
}

/// Five-number summary plus IQR-fence outliers for one series.
pub fn summarize_series(values: &[f64], outlier_factor: f64) -> SeriesSummary {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));

    let q1 = stats::quantile(&sorted, 0.25);
    let median = stats::quantile(&sorted, 0.5);
    let q3 = stats::quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lower_fence = q1 - outlier_factor * iqr;
    let upper_fence = q3 + outlier_factor * iqr;

    let outliers: Vec<(usize, f64, &'static str)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, &v)| {
            if v < lower_fence {
                Some((i, v, "low"))
            } else if v > upper_fence {
                Some((i, v, "high"))
            } else {
                None
            }
        })
        .collect();

    SeriesSummary {
        q1,
        median,
        q3,
        iqr,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean: stats::mean(values),
        std: stats::sample_std(values),
        n: values.len(),
        outliers,
    }
}

/// Boxplot multi-series comparison tool (`boxplot`).
#[derive(Debug)]
pub struct BoxplotTool;

impl Tool for BoxplotTool {
    fn meta(&self) -> ToolMeta {
        ToolMeta {
            key: "boxplot",
            name: "箱线图分析",
            category: ToolCategory::Descriptive,
            required_data_shape: DataShape::MultipleTimeSeries,
        }
    }

    fn validate(&self, data: &ToolInput, config: &Value) -> (bool, Vec<String>) {
        let mut errors = Vec::new();
        if let Some(message) = expect_shape(data, DataShape::MultipleTimeSeries) {
            errors.push(message);
        } else if let ToolInput::MultipleTimeSeries(series) = data {
            if series.is_empty() {
                errors.push("数据不能为空".to_string());
            }
            for (name, values) in series {
                if values.is_empty() {
                    errors.push(format!("{} 的数据不能为空", name));
                }
            }
        }
        match serde_json::from_value::<BoxplotConfig>(config.clone()) {
            Ok(cfg) if cfg.outlier_factor <= 0.0 => {
                errors.push("outlier_factor 必须大于0".to_string());
            }
            Err(_) => errors.push("配置无效：outlier_factor 必须是数值".to_string()),
            _ => {}
        }
        (errors.is_empty(), errors)
    }

    fn run(&self, data: &ToolInput, config: &Value) -> ToolOutcome {
        let (ok, errors) = self.validate(data, config);
        if !ok {
            return ToolOutcome::failed(errors);
        }
        let ToolInput::MultipleTimeSeries(series) = data else {
            return ToolOutcome::failed(vec!["多组数据格式错误".to_string()]);
        };
        let cfg: BoxplotConfig = serde_json::from_value(config.clone()).unwrap_or_default();

        // BTreeMap iteration keeps every comparison and tie-break stable.
        let summaries: BTreeMap<&str, SeriesSummary> = series
            .iter()
            .map(|(name, values)| (name.as_str(), summarize_series(values, cfg.outlier_factor)))
            .collect();

        let most_variable = extreme_by(&summaries, |s| s.std);
        let most_outliers = extreme_by(&summaries, |s| s.outliers.len() as f64);
        let max_median_series = extreme_by(&summaries, |s| s.median);
        let min_median_series = extreme_by(&summaries, |s| -s.median);
        let median_range =
            summaries[max_median_series].median - summaries[min_median_series].median;

        let total_outliers: usize = summaries.values().map(|s| s.outliers.len()).sum();

        let mut outcome = ToolOutcome::ok();
        let mut series_stats = serde_json::Map::new();
        for (name, summary) in &summaries {
            series_stats.insert(
                (*name).to_string(),
                json!({
                    "q1": summary.q1,
                    "median": summary.median,
                    "q3": summary.q3,
                    "iqr": summary.iqr,
                    "min": summary.min,
                    "max": summary.max,
                    "mean": summary.mean,
                    "std": summary.std,
                    "n": summary.n,
                    "outliers": summary.outliers.iter().map(|(index, value, tag)| {
                        json!({"index": index, "value": value, "type": tag})
                    }).collect::<Vec<_>>(),
                }),
            );
        }
        outcome
            .result
            .insert("series_stats".into(), Value::Object(series_stats));
        outcome
            .result
            .insert("total_outliers".into(), json!(total_outliers));
        outcome.result.insert(
            "comparison".into(),
            json!({
                "most_variable": most_variable,
                "most_outliers": most_outliers,
                "max_median_series": max_median_series,
                "min_median_series": min_median_series,
                "median_range": median_range,
            }),
        );

        outcome
            .metrics
            .insert("total_series".into(), summaries.len() as f64);
        outcome
            .metrics
            .insert("total_outliers".into(), total_outliers as f64);
        outcome
            .metrics
            .insert("median_range".into(), median_range);

        outcome.plot_data = json!({
            "type": "boxplot",
            "series": summaries.iter().map(|(name, s)| {
                json!({
                    "name": name,
                    "min": s.min,
                    "q1": s.q1,
                    "median": s.median,
                    "q3": s.q3,
                    "max": s.max,
                    "outliers": s.outliers.iter().map(|(_, v, _)| *v).collect::<Vec<_>>(),
                })
            }).collect::<Vec<_>>(),
        });

        if total_outliers > 0 {
            outcome
                .warnings
                .push(format!("发现 {} 个异常值", total_outliers));
        }

        outcome.insights.push(format!(
            "{} 波动最大（标准差={:.3}）",
            most_variable, summaries[most_variable].std
        ));
        let top_outlier_count = summaries[most_outliers].outliers.len();
        if top_outlier_count > 0 {
            outcome.insights.push(format!(
                "{} 异常值最多（{}个），需检查原因",
                most_outliers, top_outlier_count
            ));
        } else {
            outcome.insights.push("各组均未发现异常值".to_string());
        }
        outcome.insights.push(format!(
            "中位数最高 {}，最低 {}，差异范围 {:.3}",
            max_median_series, min_median_series, median_range
        ));

        // Stable benchmark: no outliers, std in the lower half of the
        // observed spread.
        let min_std = summaries.values().map(|s| s.std).fold(f64::INFINITY, f64::min);
        let max_std = summaries
            .values()
            .map(|s| s.std)
            .fold(f64::NEG_INFINITY, f64::max);
        let stable_cutoff = min_std + 0.5 * (max_std - min_std);
        let stable: Vec<&str> = summaries
            .iter()
            .filter(|(_, s)| s.outliers.is_empty() && s.std <= stable_cutoff)
            .map(|(name, _)| *name)
            .collect();
        if !stable.is_empty() {
            outcome
                .insights
                .push(format!("{} 过程稳定，可作为标杆", stable.join("、")));
        }

        outcome
    }
}

/// Key of the entry with the strictly largest value of `f`; earlier
/// (alphabetical) keys win ties.
fn extreme_by<'a>(
    summaries: &BTreeMap<&'a str, SeriesSummary>,
    f: impl Fn(&SeriesSummary) -> f64,
) -> &'a str {
    let mut best: Option<(&str, f64)> = None;
    for (name, summary) in summaries {
        let score = f(summary);
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((name, score)),
        }
    }
    best.expect("validated non-empty input").0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn four_series() -> ToolInput {
        let mut series = BTreeMap::new();
        // A: tight cluster around 85.
        series.insert(
            "A".to_string(),
            vec![84.9, 85.0, 85.1, 85.0, 84.95, 85.05, 85.0, 84.98, 85.02, 85.0],
        );
        // B: similar cluster around 85.2.
        series.insert(
            "B".to_string(),
            vec![85.1, 85.2, 85.3, 85.2, 85.15, 85.25, 85.2, 85.18, 85.22, 85.2],
        );
        // C: wide scatter between 82 and 89.
        series.insert(
            "C".to_string(),
            vec![82.0, 89.0, 82.5, 88.5, 82.0, 89.0, 83.0, 88.0, 82.5, 88.5],
        );
        // D: tight cluster around 85.5 with two far outliers.
        series.insert(
            "D".to_string(),
            vec![85.5, 85.45, 85.55, 85.5, 85.48, 85.52, 85.5, 85.5, 79.0, 92.0],
        );
        ToolInput::MultipleTimeSeries(series)
    }

    #[test]
    fn cross_series_comparison_identifies_extremes() {
        let outcome = BoxplotTool.run(&four_series(), &json!({}));
        assert!(outcome.success);
        let comparison = outcome.result_value("comparison").unwrap();
        assert_eq!(comparison["most_variable"], json!("C"));
        assert_eq!(comparison["most_outliers"], json!("D"));
        assert!(comparison["median_range"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn quartiles_are_ordered_for_every_series() {
        let outcome = BoxplotTool.run(&four_series(), &json!({}));
        let stats = outcome.result_value("series_stats").unwrap().as_object().unwrap();
        for (name, s) in stats {
            let q1 = s["q1"].as_f64().unwrap();
            let median = s["median"].as_f64().unwrap();
            let q3 = s["q3"].as_f64().unwrap();
            assert!(q1 <= median && median <= q3, "series {} out of order", name);
        }
    }

    #[test]
    fn outliers_plus_in_fence_points_cover_n() {
        let outcome = BoxplotTool.run(&four_series(), &json!({}));
        let stats = outcome.result_value("series_stats").unwrap().as_object().unwrap();
        let d = &stats["D"];
        let outliers = d["outliers"].as_array().unwrap();
        assert_eq!(outliers.len(), 2);
        assert_eq!(d["n"], json!(10));
        let tags: Vec<&str> = outliers
            .iter()
            .map(|o| o["type"].as_str().unwrap())
            .collect();
        assert!(tags.contains(&"low") && tags.contains(&"high"));
    }

    #[test]
    fn constant_series_has_zero_iqr_and_no_outliers() {
        let mut series = BTreeMap::new();
        series.insert("flat".to_string(), vec![5.0; 8]);
        let outcome = BoxplotTool.run(&ToolInput::MultipleTimeSeries(series), &json!({}));
        assert!(outcome.success);
        let stats = outcome.result_value("series_stats").unwrap();
        assert_eq!(stats["flat"]["iqr"], json!(0.0));
        assert_eq!(stats["flat"]["std"], json!(0.0));
        assert_eq!(stats["flat"]["outliers"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn plot_series_carry_five_number_summaries() {
        let outcome = BoxplotTool.run(&four_series(), &json!({}));
        let series = outcome.plot_data["series"].as_array().unwrap();
        assert_eq!(series.len(), 4);
        for entry in series {
            for field in ["name", "min", "q1", "median", "q3", "max", "outliers"] {
                assert!(!entry[field].is_null(), "missing field {}", field);
            }
        }
    }

    #[test]
    fn stable_series_are_named_in_insights() {
        let outcome = BoxplotTool.run(&four_series(), &json!({}));
        // A and B are tight and outlier-free.
        assert!(outcome
            .insights
            .iter()
            .any(|i| i.contains("标杆") && i.contains('A')));
    }

    #[test]
    fn empty_input_fails_validation() {
        let outcome = BoxplotTool.run(&ToolInput::MultipleTimeSeries(BTreeMap::new()), &json!({}));
        assert!(!outcome.success);
    }
}

//! Pareto analysis: key-few identification and ABC classification.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::envelope::ToolOutcome;
use crate::tool::{expect_shape, CategoryCount, DataShape, Tool, ToolCategory, ToolInput, ToolMeta};

const ABC_B_BOUNDARY_PCT: f64 = 95.0;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ParetoConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.8
}

impl Default for ParetoConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

#[derive(Clone, Debug)]
struct SortedRow {
    category: String,
    count: f64,
    cumulative_count: f64,
    cumulative_pct: f64,
}

/// Pareto analysis tool (`pareto`).
#[derive(Debug)]
pub struct ParetoTool;

impl Tool for ParetoTool {
    fn meta(&self) -> ToolMeta {
        ToolMeta {
            key: "pareto",
            name: "帕累托图分析",
            category: ToolCategory::Descriptive,
            required_data_shape: DataShape::CategoricalCounts,
        }
    }

    fn validate(&self, data: &ToolInput, config: &Value) -> (bool, Vec<String>) {
        let mut errors = Vec::new();
        if let Some(message) = expect_shape(data, DataShape::CategoricalCounts) {
            errors.push(message);
        } else if let ToolInput::CategoricalCounts(rows) = data {
            if rows.is_empty() {
                errors.push("数据不能为空".to_string());
            } else if rows.iter().any(|r| r.count < 0.0) {
                errors.push("类别计数不能为负".to_string());
            } else if rows.iter().map(|r| r.count).sum::<f64>() <= 0.0 {
                errors.push("类别计数总和必须大于0".to_string());
            }
        }
        match serde_json::from_value::<ParetoConfig>(config.clone()) {
            Ok(cfg) if !(cfg.threshold > 0.0 && cfg.threshold <= 1.0) => {
                errors.push("threshold 必须在 (0, 1] 之间".to_string());
            }
            Err(_) => errors.push("配置无效：threshold 必须是数值".to_string()),
            _ => {}
        }
        (errors.is_empty(), errors)
    }

    fn run(&self, data: &ToolInput, config: &Value) -> ToolOutcome {
        let (ok, errors) = self.validate(data, config);
        if !ok {
            return ToolOutcome::failed(errors);
        }
        let ToolInput::CategoricalCounts(rows) = data else {
            return ToolOutcome::failed(vec!["类别数据格式错误".to_string()]);
        };
        let cfg: ParetoConfig = serde_json::from_value(config.clone()).unwrap_or_default();

        // Duplicate categories are summed before ranking, keeping first
        // appearance order for the stable tie-break.
        let mut sorted: Vec<CategoryCount> = Vec::new();
        for row in rows {
            match sorted.iter_mut().find(|r| r.category == row.category) {
                Some(existing) => existing.count += row.count,
                None => sorted.push(row.clone()),
            }
        }
        // Descending sort, stable on ties.
        sorted.sort_by(|a, b| b.count.partial_cmp(&a.count).expect("finite counts"));

        let total: f64 = sorted.iter().map(|r| r.count).sum();
        let mut cumulative = 0.0;
        let table: Vec<SortedRow> = sorted
            .iter()
            .map(|row| {
                cumulative += row.count;
                SortedRow {
                    category: row.category.clone(),
                    count: row.count,
                    cumulative_count: cumulative,
                    cumulative_pct: cumulative / total * 100.0,
                }
            })
            .collect();

        // Key few: smallest prefix whose cumulative share reaches the
        // threshold.
        let threshold_pct = cfg.threshold * 100.0;
        let mut key_few_count = table.len();
        for (i, row) in table.iter().enumerate() {
            if row.cumulative_pct >= threshold_pct {
                key_few_count = i + 1;
                break;
            }
        }
        let key_few: Vec<String> = table[..key_few_count]
            .iter()
            .map(|r| r.category.clone())
            .collect();
        let key_few_contribution = table[key_few_count - 1].cumulative_pct;

        // ABC classes: A is the key-few prefix, B extends to 95 %, C is
        // the tail.
        let mut classes = (Vec::new(), Vec::new(), Vec::new());
        for (i, row) in table.iter().enumerate() {
            if i < key_few_count {
                classes.0.push(row.category.clone());
            } else if row.cumulative_pct <= ABC_B_BOUNDARY_PCT {
                classes.1.push(row.category.clone());
            } else {
                classes.2.push(row.category.clone());
            }
        }

        let mut outcome = ToolOutcome::ok();
        outcome.result.insert("total_count".into(), json!(total));
        outcome
            .result
            .insert("total_categories".into(), json!(table.len()));
        outcome
            .result
            .insert("key_few_count".into(), json!(key_few_count));
        outcome.result.insert(
            "key_few_percentage".into(),
            json!(key_few_count as f64 / table.len() as f64 * 100.0),
        );
        outcome.result.insert(
            "key_few_contribution".into(),
            json!(key_few_contribution),
        );
        outcome.result.insert("key_few".into(), json!(key_few));
        outcome.result.insert(
            "sorted_data".into(),
            Value::Array(
                table
                    .iter()
                    .map(|row| {
                        json!({
                            "category": row.category,
                            "count": row.count,
                            "cumulative_count": row.cumulative_count,
                            "cumulative_pct": row.cumulative_pct,
                        })
                    })
                    .collect(),
            ),
        );
        outcome.result.insert(
            "abc_classification".into(),
            json!({"A": classes.0, "B": classes.1, "C": classes.2}),
        );

        outcome.metrics.insert("total_count".into(), total);
        outcome
            .metrics
            .insert("key_few_count".into(), key_few_count as f64);
        outcome
            .metrics
            .insert("concentration_ratio".into(), key_few_contribution);

        outcome.plot_data = json!({
            "type": "pareto",
            "categories": table.iter().map(|r| r.category.clone()).collect::<Vec<_>>(),
            "counts": table.iter().map(|r| r.count).collect::<Vec<_>>(),
            "cumulative": table.iter().map(|r| r.cumulative_pct).collect::<Vec<_>>(),
            "threshold_line": threshold_pct,
            "colors": colors(table.len()),
        });

        outcome.insights.push(format!(
            "前{}类问题（占类别总数{:.1}%）贡献了{:.1}%的问题总量",
            key_few_count,
            key_few_count as f64 / table.len() as f64 * 100.0,
            key_few_contribution
        ));
        if !classes.0.is_empty() {
            let top: Vec<&str> = classes.0.iter().take(3).map(String::as_str).collect();
            outcome
                .insights
                .push(format!("A类关键问题（优先解决）: {}", top.join("、")));
        }
        if !classes.1.is_empty() {
            let next: Vec<&str> = classes.1.iter().take(3).map(String::as_str).collect();
            outcome
                .insights
                .push(format!("B类次要问题: {}", next.join("、")));
        }
        if key_few_contribution >= 80.0 {
            outcome.insights.push(format!(
                "建议优先解决'{}'类问题，可消除{:.1}%的故障",
                key_few[0], key_few_contribution
            ));
        } else {
            outcome
                .insights
                .push("问题分布较为分散，建议进一步分类细化".to_string());
        }

        outcome
    }
}

/// Leading key-few bars highlighted, tail greyed out; the UI consumes the
/// rgba strings as-is.
fn colors(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            if i < 3 {
                format!("rgba(255, {}, 0, 0.7)", 100 - i * 30)
            } else {
                "rgba(200, 200, 200, 0.5)".to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(counts: &[(&str, f64)]) -> ToolInput {
        ToolInput::CategoricalCounts(
            counts
                .iter()
                .map(|(category, count)| CategoryCount {
                    category: category.to_string(),
                    count: *count,
                })
                .collect(),
        )
    }

    #[test]
    fn key_few_is_the_smallest_prefix_reaching_the_threshold() {
        let input = rows(&[
            ("温度异常", 45.0),
            ("压力异常", 28.0),
            ("液位异常", 22.0),
            ("流量异常", 18.0),
            ("pH值异常", 7.0),
        ]);
        let outcome = ParetoTool.run(&input, &json!({"threshold": 0.8}));
        assert!(outcome.success);

        let cumulative = outcome.plot_data["cumulative"]
            .as_array()
            .expect("cumulative array")
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect::<Vec<_>>();
        let expected = [37.5, 60.8, 79.2, 94.2, 100.0];
        for (got, want) in cumulative.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 0.05, "got {} want {}", got, want);
        }

        // 79.2 < 80, so the prefix extends to the fourth category.
        assert_eq!(outcome.metric("key_few_count"), Some(4.0));
        assert!((outcome.metric("concentration_ratio").unwrap() - 94.2).abs() < 0.05);
        assert!(outcome.metric("concentration_ratio").unwrap() >= 80.0);
    }

    #[test]
    fn totals_and_final_cumulative_are_consistent() {
        let input = rows(&[("a", 10.0), ("b", 5.0), ("c", 5.0)]);
        let outcome = ParetoTool.run(&input, &json!({}));
        assert_eq!(outcome.metric("total_count"), Some(20.0));
        let cumulative = outcome.plot_data["cumulative"].as_array().unwrap();
        let last = cumulative.last().unwrap().as_f64().unwrap();
        assert!((last - 100.0).abs() < 1e-6);
    }

    #[test]
    fn single_category_is_the_whole_key_few() {
        let input = rows(&[("温度异常", 12.0)]);
        let outcome = ParetoTool.run(&input, &json!({}));
        assert!(outcome.success);
        assert_eq!(outcome.metric("key_few_count"), Some(1.0));
        assert!((outcome.metric("concentration_ratio").unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(
            outcome.result_value("key_few_percentage").unwrap(),
            &json!(100.0)
        );
    }

    #[test]
    fn empty_input_is_insufficient_data() {
        let outcome = ParetoTool.run(&rows(&[]), &json!({}));
        assert!(!outcome.success);
        assert!(outcome.errors.iter().any(|e| e.contains("数据不能为空")));
    }

    #[test]
    fn zero_total_is_rejected() {
        let outcome = ParetoTool.run(&rows(&[("a", 0.0), ("b", 0.0)]), &json!({}));
        assert!(!outcome.success);
    }

    #[test]
    fn sort_is_stable_on_ties() {
        let input = rows(&[("first", 5.0), ("second", 5.0), ("big", 10.0)]);
        let outcome = ParetoTool.run(&input, &json!({}));
        let categories = outcome.plot_data["categories"].as_array().unwrap();
        assert_eq!(categories[0], json!("big"));
        assert_eq!(categories[1], json!("first"));
        assert_eq!(categories[2], json!("second"));
    }

    #[test]
    fn duplicate_categories_are_aggregated() {
        let input = rows(&[("温度异常", 10.0), ("压力异常", 8.0), ("温度异常", 5.0)]);
        let outcome = ParetoTool.run(&input, &json!({}));
        assert!(outcome.success);
        assert_eq!(outcome.result_value("total_categories").unwrap(), &json!(2));
        assert_eq!(outcome.metric("total_count"), Some(23.0));
        let counts = outcome.plot_data["counts"].as_array().unwrap();
        assert_eq!(counts[0], json!(15.0));
    }

    #[test]
    fn abc_classes_partition_all_categories() {
        let input = rows(&[
            ("a", 50.0),
            ("b", 25.0),
            ("c", 10.0),
            ("d", 8.0),
            ("e", 4.0),
            ("f", 3.0),
        ]);
        let outcome = ParetoTool.run(&input, &json!({"threshold": 0.8}));
        let abc = outcome.result_value("abc_classification").unwrap();
        let count = ["A", "B", "C"]
            .iter()
            .map(|k| abc[k].as_array().unwrap().len())
            .sum::<usize>();
        assert_eq!(count, 6);
    }

    #[test]
    fn invalid_threshold_fails_validation() {
        let (ok, errors) = ParetoTool.validate(&rows(&[("a", 1.0)]), &json!({"threshold": 1.5}));
        assert!(!ok);
        assert!(errors[0].contains("threshold"));
    }
}

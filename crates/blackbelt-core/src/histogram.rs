//! Histogram analysis with normality testing and distribution labelling.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::envelope::ToolOutcome;
use crate::stats;
use crate::tool::{expect_shape, DataShape, Tool, ToolCategory, ToolInput, ToolMeta};

const NORMALITY_ALPHA: f64 = 0.05;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct HistogramConfig {
    #[serde(default = "default_bins")]
    pub bins: usize,
    pub usl: Option<f64>,
    pub lsl: Option<f64>,
}

fn default_bins() -> usize {
    10
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            bins: default_bins(),
            usl: None,
            lsl: None,
        }
    }
}

/// Bin boundaries and per-bin counts. Bins are uniform over `[min, max]`,
/// right-open except the last. A constant sample gets a unit-width span so
/// that exactly one bin is non-empty.
fn bin_counts(values: &[f64], bins: usize) -> (Vec<f64>, Vec<usize>) {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let (lo, hi) = if (max - min).abs() <= f64::EPSILON {
        (min - 0.5, min + 0.5)
    } else {
        (min, max)
    };
    let width = (hi - lo) / bins as f64;
    let boundaries: Vec<f64> = (0..=bins).map(|i| lo + width * i as f64).collect();
    let mut counts = vec![0usize; bins];
    for &value in values {
        let mut index = ((value - lo) / width).floor() as usize;
        if index >= bins {
            index = bins - 1;
        }
        counts[index] += 1;
    }
    (boundaries, counts)
}

fn distribution_label(is_normal: Option<bool>, skewness: f64, kurtosis: f64) -> &'static str {
    if is_normal == Some(true) {
        "正态"
    } else if skewness.abs() < 1.0 && kurtosis.abs() < 2.0 {
        "近似正态"
    } else if skewness >= 1.0 {
        "右偏"
    } else if skewness <= -1.0 {
        "左偏"
    } else {
        "不规则"
    }
}

/// Histogram analysis tool (`histogram`).
#[derive(Debug)]
pub struct HistogramTool;

impl Tool for HistogramTool {
    fn meta(&self) -> ToolMeta {
        ToolMeta {
            key: "histogram",
            name: "直方图分析",
            category: ToolCategory::Descriptive,
            required_data_shape: DataShape::TimeSeries,
        }
    }

    fn validate(&self, data: &ToolInput, config: &Value) -> (bool, Vec<String>) {
        let mut errors = Vec::new();
        if let Some(message) = expect_shape(data, DataShape::TimeSeries) {
            errors.push(message);
        } else if let Some(values) = data.as_time_series() {
            if values.len() < 2 {
                errors.push("数据点不足，至少需要2个数据点".to_string());
            }
        }
        match serde_json::from_value::<HistogramConfig>(config.clone()) {
            Ok(cfg) if cfg.bins == 0 => errors.push("bins 必须大于0".to_string()),
            Err(_) => errors.push("配置无效：bins 必须是正整数".to_string()),
            _ => {}
        }
        (errors.is_empty(), errors)
    }

    fn run(&self, data: &ToolInput, config: &Value) -> ToolOutcome {
        let (ok, errors) = self.validate(data, config);
        if !ok {
            return ToolOutcome::failed(errors);
        }
        let values = data.as_time_series().expect("validated shape");
        let cfg: HistogramConfig = serde_json::from_value(config.clone()).unwrap_or_default();

        let n = values.len();
        let mean = stats::mean(values);
        let std = stats::sample_std(values);
        let median = stats::median(values);
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let skewness = stats::skewness(values);
        let kurtosis = stats::kurtosis(values);

        let p_value = stats::shapiro_wilk_p(values);
        let is_normal = p_value.map(|p| p >= NORMALITY_ALPHA);
        let label = distribution_label(is_normal, skewness, kurtosis);

        let (boundaries, counts) = bin_counts(values, cfg.bins);

        let mut outcome = ToolOutcome::ok();
        outcome.result.insert("n".into(), json!(n));
        outcome.result.insert("mean".into(), json!(mean));
        outcome.result.insert("std".into(), json!(std));
        outcome.result.insert("median".into(), json!(median));
        outcome.result.insert("min".into(), json!(min));
        outcome.result.insert("max".into(), json!(max));
        outcome.result.insert("skewness".into(), json!(skewness));
        outcome.result.insert("kurtosis".into(), json!(kurtosis));
        outcome.result.insert("p_value".into(), json!(p_value));
        outcome.result.insert("is_normal".into(), json!(is_normal));
        outcome.result.insert("distribution".into(), json!(label));

        outcome.metrics.insert("mean".into(), mean);
        outcome.metrics.insert("std".into(), std);
        outcome.metrics.insert("median".into(), median);
        outcome.metrics.insert("n".into(), n as f64);
        outcome.metrics.insert("skewness".into(), skewness);
        outcome.metrics.insert("kurtosis".into(), kurtosis);

        if let Some(usl) = cfg.usl {
            if max > usl {
                outcome
                    .warnings
                    .push(format!("最大值 {:.3} 超出规格上限 {:.3}", max, usl));
            }
        }
        if let Some(lsl) = cfg.lsl {
            if min < lsl {
                outcome
                    .warnings
                    .push(format!("最小值 {:.3} 低于规格下限 {:.3}", min, lsl));
            }
        }
        if is_normal == Some(false) {
            outcome
                .warnings
                .push("数据未通过正态性检验 (p < 0.05)".to_string());
        }

        let mut lines = serde_json::Map::new();
        lines.insert("mean".into(), json!({"x": mean, "label": "均值"}));
        lines.insert("median".into(), json!({"x": median, "label": "中位数"}));
        if let Some(usl) = cfg.usl {
            lines.insert("usl".into(), json!({"x": usl, "label": "规格上限 (USL)"}));
        }
        if let Some(lsl) = cfg.lsl {
            lines.insert("lsl".into(), json!({"x": lsl, "label": "规格下限 (LSL)"}));
        }
        outcome.plot_data = json!({
            "type": "histogram",
            "bins": boundaries,
            "counts": counts,
            "lines": Value::Object(lines),
        });

        outcome.insights.push(format!(
            "数据分布形态：{}（偏度={:.3}，峰度={:.3}）",
            label, skewness, kurtosis
        ));
        match p_value {
            Some(p) => outcome.insights.push(format!(
                "Shapiro-Wilk 正态性检验 p={:.4}，{}正态分布假设",
                p,
                if p >= NORMALITY_ALPHA { "支持" } else { "拒绝" }
            )),
            None => outcome
                .insights
                .push("样本量超出正态性检验适用范围，未进行检验".to_string()),
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bin_counts_sum_to_n_and_boundaries_are_bins_plus_one() {
        let values: Vec<f64> = (0..50).map(|i| 80.0 + (i as f64) * 0.2).collect();
        let outcome = HistogramTool.run(&ToolInput::TimeSeries(values.clone()), &json!({"bins": 10}));
        assert!(outcome.success);
        let boundaries = outcome.plot_data["bins"].as_array().unwrap();
        let counts = outcome.plot_data["counts"].as_array().unwrap();
        assert_eq!(boundaries.len(), 11);
        assert_eq!(counts.len(), 10);
        let total: u64 = counts.iter().map(|c| c.as_u64().unwrap()).sum();
        assert_eq!(total as usize, values.len());
    }

    #[test]
    fn constant_input_fills_exactly_one_bin() {
        let values = vec![85.0; 12];
        let outcome = HistogramTool.run(&ToolInput::TimeSeries(values), &json!({"bins": 10}));
        assert!(outcome.success);
        let counts = outcome.plot_data["counts"].as_array().unwrap();
        let non_empty = counts.iter().filter(|c| c.as_u64().unwrap() > 0).count();
        assert_eq!(non_empty, 1);
        assert_eq!(counts.iter().map(|c| c.as_u64().unwrap()).sum::<u64>(), 12);
        assert_eq!(outcome.plot_data["bins"].as_array().unwrap().len(), 11);
    }

    #[test]
    fn tiny_sample_skips_normality_test() {
        let outcome = HistogramTool.run(&ToolInput::TimeSeries(vec![1.0, 2.0]), &json!({}));
        assert!(outcome.success);
        assert_eq!(outcome.result_value("p_value").unwrap(), &json!(null));
        assert_eq!(outcome.result_value("is_normal").unwrap(), &json!(null));
        assert!(outcome.result_value("mean").unwrap().is_number());
    }

    #[test]
    fn specification_breaches_produce_warnings() {
        let values = vec![79.0, 82.0, 84.0, 86.0, 91.0, 83.0, 84.5, 85.0];
        let outcome = HistogramTool.run(
            &ToolInput::TimeSeries(values),
            &json!({"usl": 90.0, "lsl": 80.0}),
        );
        assert!(outcome.success);
        assert!(outcome.warnings.iter().any(|w| w.contains("规格上限")));
        assert!(outcome.warnings.iter().any(|w| w.contains("规格下限")));
        assert_eq!(outcome.plot_data["lines"]["usl"]["x"], json!(90.0));
    }

    #[test]
    fn right_skewed_sample_is_labelled() {
        let values = vec![
            1.0, 1.1, 1.0, 1.2, 1.1, 1.0, 1.3, 1.2, 1.1, 1.0, 1.2, 1.1, 1.0, 1.1, 1.2, 1.0, 9.0,
            12.0, 15.0, 20.0,
        ];
        let outcome = HistogramTool.run(&ToolInput::TimeSeries(values), &json!({}));
        assert_eq!(outcome.result_value("distribution").unwrap(), &json!("右偏"));
        assert!(outcome.warnings.iter().any(|w| w.contains("正态性")));
    }

    #[test]
    fn single_point_fails_validation() {
        let outcome = HistogramTool.run(&ToolInput::TimeSeries(vec![85.0]), &json!({}));
        assert!(!outcome.success);
    }

    #[test]
    fn zero_bins_is_rejected() {
        let (ok, errors) =
            HistogramTool.validate(&ToolInput::TimeSeries(vec![1.0, 2.0]), &json!({"bins": 0}));
        assert!(!ok);
        assert!(errors[0].contains("bins"));
    }
}

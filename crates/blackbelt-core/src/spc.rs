//! Statistical process control: individuals/moving-range chart with
//! process capability.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::envelope::ToolOutcome;
use crate::stats;
use crate::tool::{expect_shape, DataShape, Tool, ToolCategory, ToolInput, ToolMeta};

/// 3 / d2 for subgroup size 2; fixed by the control-chart convention.
const MOVING_RANGE_FACTOR: f64 = 2.66;

/// Cpk threshold below which the process is flagged even when in control.
const CPK_WARNING_THRESHOLD: f64 = 1.33;

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct SpcConfig {
    pub usl: Option<f64>,
    pub lsl: Option<f64>,
    pub target: Option<f64>,
}

/// One flagged sample: outside the control limits or outside the
/// specification limits.
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    pub index: usize,
    pub value: f64,
    pub kind: &'static str,
    pub rule: &'static str,
}

impl Violation {
    fn to_json(&self) -> Value {
        json!({
            "index": self.index,
            "value": self.value,
            "type": self.kind,
            "rule": self.rule,
        })
    }
}

/// Full SPC computation result, reused by the monitoring views without
/// going through the envelope.
#[derive(Clone, Debug)]
pub struct SpcSummary {
    pub mean: f64,
    pub std: f64,
    pub n: usize,
    pub mr_bar: f64,
    pub ucl: f64,
    pub lcl: f64,
    pub cp: Option<f64>,
    pub cpu: Option<f64>,
    pub cpl: Option<f64>,
    pub cpk: Option<f64>,
    pub violations: Vec<Violation>,
    pub process_status: &'static str,
}

/// Core SPC computation on an ordered series. Assumes `values.len() >= 2`.
pub fn analyze(values: &[f64], config: &SpcConfig) -> SpcSummary {
    let mean = stats::mean(values);
    let std = stats::sample_std(values);
    let n = values.len();

    let mrs = stats::moving_ranges(values);
    let mr_bar = stats::mean(&mrs);
    let ucl = mean + MOVING_RANGE_FACTOR * mr_bar;
    let lcl = mean - MOVING_RANGE_FACTOR * mr_bar;

    let (cp, cpu, cpl, cpk) = capability(mean, std, config);

    let mut violations = Vec::new();
    for (index, &value) in values.iter().enumerate() {
        if value > ucl {
            violations.push(Violation {
                index,
                value,
                kind: "UCL",
                rule: "Out of control limit",
            });
        } else if value < lcl {
            violations.push(Violation {
                index,
                value,
                kind: "LCL",
                rule: "Out of control limit",
            });
        }
        if let Some(usl) = config.usl {
            if value > usl {
                violations.push(Violation {
                    index,
                    value,
                    kind: "USL",
                    rule: "Out of specification",
                });
            }
        }
        if let Some(lsl) = config.lsl {
            if value < lsl {
                violations.push(Violation {
                    index,
                    value,
                    kind: "LSL",
                    rule: "Out of specification",
                });
            }
        }
    }

    let spec_violated = violations.iter().any(|v| v.kind == "USL" || v.kind == "LSL");
    let beyond_three_sigma = std > 0.0 && values.iter().any(|v| (v - mean).abs() > 3.0 * std);
    let process_status = if beyond_three_sigma || spec_violated {
        "失控"
    } else if cpk.map(|c| c < CPK_WARNING_THRESHOLD).unwrap_or(false) {
        "警告"
    } else {
        "受控"
    };

    SpcSummary {
        mean,
        std,
        n,
        mr_bar,
        ucl,
        lcl,
        cp,
        cpu,
        cpl,
        cpk,
        violations,
        process_status,
    }
}

fn capability(
    mean: f64,
    std: f64,
    config: &SpcConfig,
) -> (Option<f64>, Option<f64>, Option<f64>, Option<f64>) {
    if std <= 0.0 {
        // Constant series: capability indices are undefined.
        return (None, None, None, None);
    }
    let cp = match (config.usl, config.lsl) {
        (Some(usl), Some(lsl)) => Some((usl - lsl) / (6.0 * std)),
        _ => None,
    };
    let cpu = config.usl.map(|usl| (usl - mean) / (3.0 * std));
    let cpl = config.lsl.map(|lsl| (mean - lsl) / (3.0 * std));
    let cpk = match (cpu, cpl) {
        (Some(u), Some(l)) => Some(u.min(l)),
        (Some(u), None) => Some(u),
        (None, Some(l)) => Some(l),
        (None, None) => None,
    };
    (cp, cpu, cpl, cpk)
}

/// Cpk grade label used in insights.
pub fn cpk_grade(cpk: f64) -> &'static str {
    if cpk >= 1.33 {
        "优秀"
    } else if cpk >= 1.0 {
        "良好"
    } else if cpk >= 0.67 {
        "勉强"
    } else {
        "不足"
    }
}

fn build_insights(values: &[f64], summary: &SpcSummary) -> Vec<String> {
    let mut insights = Vec::new();
    match summary.cpk {
        Some(cpk) => insights.push(format!(
            "过程能力 Cpk={:.3}（{}），过程状态：{}",
            cpk,
            cpk_grade(cpk),
            summary.process_status
        )),
        None => insights.push(format!(
            "无法计算过程能力指数（缺少规格限或数据无波动），过程状态：{}",
            summary.process_status
        )),
    }
    insights.push(format!(
        "共分析 {} 个数据点，发现 {} 个异常点",
        summary.n,
        summary.violations.len()
    ));
    if !summary.violations.is_empty() {
        if let Some((index, value)) = values
            .iter()
            .enumerate()
            .max_by(|a, b| {
                let da = (a.1 - summary.mean).abs();
                let db = (b.1 - summary.mean).abs();
                da.partial_cmp(&db).expect("finite values")
            })
            .map(|(i, v)| (i, *v))
        {
            insights.push(format!(
                "偏离最大的样本在第 {} 个点（值 {:.2}，偏离均值 {:.2}），建议优先排查",
                index + 1,
                value,
                (value - summary.mean).abs()
            ));
        }
    }
    insights
}

/// SPC analysis tool (`spc`).
#[derive(Debug)]
pub struct SpcTool;

impl Tool for SpcTool {
    fn meta(&self) -> ToolMeta {
        ToolMeta {
            key: "spc",
            name: "SPC 统计过程控制分析",
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
        if serde_json::from_value::<SpcConfig>(config.clone()).is_err() {
            errors.push("配置无效：usl/lsl/target 必须是数值".to_string());
        }
        (errors.is_empty(), errors)
    }

    fn run(&self, data: &ToolInput, config: &Value) -> ToolOutcome {
        let (ok, errors) = self.validate(data, config);
        if !ok {
            return ToolOutcome::failed(errors);
        }
        let values = data.as_time_series().expect("validated shape");
        let cfg: SpcConfig = serde_json::from_value(config.clone()).unwrap_or_default();
        let summary = analyze(values, &cfg);

        let mut outcome = ToolOutcome::ok();
        outcome.result.insert("mean".into(), json!(summary.mean));
        outcome.result.insert("std".into(), json!(summary.std));
        outcome.result.insert("n".into(), json!(summary.n));
        outcome.result.insert("mr_bar".into(), json!(summary.mr_bar));
        outcome.result.insert("ucl".into(), json!(summary.ucl));
        outcome.result.insert("lcl".into(), json!(summary.lcl));
        outcome.result.insert("usl".into(), json!(cfg.usl));
        outcome.result.insert("lsl".into(), json!(cfg.lsl));
        outcome.result.insert("target".into(), json!(cfg.target));
        outcome.result.insert("cp".into(), json!(summary.cp));
        outcome.result.insert("cpu".into(), json!(summary.cpu));
        outcome.result.insert("cpl".into(), json!(summary.cpl));
        outcome.result.insert("cpk".into(), json!(summary.cpk));
        outcome.result.insert(
            "process_status".into(),
            json!(summary.process_status),
        );
        outcome.result.insert(
            "violations".into(),
            Value::Array(summary.violations.iter().map(Violation::to_json).collect()),
        );

        outcome.metrics.insert("mean".into(), summary.mean);
        outcome.metrics.insert("std".into(), summary.std);
        outcome.metrics.insert("n".into(), summary.n as f64);
        if let Some(cpk) = summary.cpk {
            outcome.metrics.insert("cpk".into(), cpk);
        }
        if let Some(cp) = summary.cp {
            outcome.metrics.insert("cp".into(), cp);
        }

        if let Some(cpk) = summary.cpk {
            if cpk < CPK_WARNING_THRESHOLD {
                outcome
                    .warnings
                    .push(format!("过程能力不足 (Cpk={:.3} < 1.33)", cpk));
            }
        }
        if !summary.violations.is_empty() {
            outcome
                .warnings
                .push(format!("发现 {} 个异常数据点", summary.violations.len()));
        }

        outcome.plot_data = json!({
            "type": "spc",
            "values": values,
            "ucl": summary.ucl,
            "lcl": summary.lcl,
            "target": cfg.target,
            "usl": cfg.usl,
            "lsl": cfg.lsl,
            "violations": summary.violations.iter().map(Violation::to_json).collect::<Vec<_>>(),
        });

        outcome.insights = build_insights(values, &summary);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_config() -> Value {
        json!({"usl": 90.0, "lsl": 80.0, "target": 85.0})
    }

    #[test]
    fn stable_batch_is_in_control() {
        let values = vec![85.0, 85.5, 86.0, 84.8, 85.2, 85.6, 85.1, 85.4, 85.3, 85.7];
        let outcome = SpcTool.run(&ToolInput::TimeSeries(values), &spec_config());
        assert!(outcome.success);
        assert!((outcome.metric("mean").unwrap() - 85.36).abs() < 0.01);
        assert!((outcome.metric("std").unwrap() - 0.367).abs() < 0.01);
        assert!((outcome.metric("cp").unwrap() - 4.55).abs() < 0.1);
        assert!((outcome.metric("cpk").unwrap() - 4.22).abs() < 0.1);
        assert_eq!(
            outcome.result_value("process_status").unwrap(),
            &json!("受控")
        );
        assert_eq!(
            outcome
                .result_value("violations")
                .and_then(|v| v.as_array())
                .map(Vec::len),
            Some(0)
        );
        assert!(outcome.insights.len() >= 2);
    }

    #[test]
    fn usl_breach_is_out_of_control() {
        let values = vec![85.0, 86.0, 85.5, 87.0, 85.8, 84.5, 86.2, 85.9, 90.2, 86.0];
        let outcome = SpcTool.run(&ToolInput::TimeSeries(values), &spec_config());
        assert!(outcome.success);
        let violations = outcome
            .result_value("violations")
            .and_then(|v| v.as_array())
            .expect("violations array");
        assert!(violations.iter().any(|v| {
            v["index"] == json!(8) && v["value"] == json!(90.2) && v["type"] == json!("USL")
        }));
        assert_eq!(
            outcome.result_value("process_status").unwrap(),
            &json!("失控")
        );
        assert!(outcome.insights.iter().any(|i| i.contains("偏离最大")));
    }

    #[test]
    fn constant_series_has_null_capability_and_is_in_control() {
        let values = vec![85.0; 6];
        let outcome = SpcTool.run(&ToolInput::TimeSeries(values), &spec_config());
        assert!(outcome.success);
        assert_eq!(outcome.metric("std"), Some(0.0));
        assert_eq!(outcome.result_value("mr_bar").unwrap(), &json!(0.0));
        assert_eq!(outcome.result_value("cp").unwrap(), &json!(null));
        assert_eq!(outcome.result_value("cpk").unwrap(), &json!(null));
        assert_eq!(outcome.result_value("ucl").unwrap(), &json!(85.0));
        assert_eq!(outcome.result_value("lcl").unwrap(), &json!(85.0));
        assert_eq!(
            outcome.result_value("process_status").unwrap(),
            &json!("受控")
        );
    }

    #[test]
    fn two_points_compute_limits_one_point_fails() {
        let two = SpcTool.run(&ToolInput::TimeSeries(vec![85.0, 86.0]), &json!({}));
        assert!(two.success);
        assert_eq!(two.result_value("mr_bar").unwrap(), &json!(1.0));

        let one = SpcTool.run(&ToolInput::TimeSeries(vec![85.0]), &json!({}));
        assert!(!one.success);
        assert!(one.errors.iter().any(|e| e.contains("数据点不足")));
    }

    #[test]
    fn missing_limits_leave_capability_null() {
        let values = vec![85.0, 85.4, 85.2, 85.6, 85.1];
        let outcome = SpcTool.run(&ToolInput::TimeSeries(values), &json!({"usl": 90.0}));
        assert!(outcome.success);
        assert_eq!(outcome.result_value("cp").unwrap(), &json!(null));
        assert!(outcome.result_value("cpu").unwrap().is_number());
        assert_eq!(outcome.result_value("cpl").unwrap(), &json!(null));
        // Cpk falls back to the single available side.
        assert!(outcome.result_value("cpk").unwrap().is_number());
    }

    #[test]
    fn plot_payload_is_chart_ready() {
        let values = vec![85.0, 85.5, 86.0, 84.8];
        let outcome = SpcTool.run(&ToolInput::TimeSeries(values.clone()), &spec_config());
        assert_eq!(outcome.plot_data["type"], json!("spc"));
        assert_eq!(outcome.plot_data["values"], json!(values));
        assert!(outcome.plot_data["ucl"].is_number());
        assert!(outcome.plot_data["violations"].is_array());
    }

    #[test]
    fn wrong_shape_is_a_validation_error() {
        let input = ToolInput::CategoricalCounts(Vec::new());
        let (ok, errors) = SpcTool.validate(&input, &json!({}));
        assert!(!ok);
        assert!(errors[0].contains("TimeSeries"));
    }
}

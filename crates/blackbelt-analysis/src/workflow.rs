//! The standard analysis sequence: fetch → SPC scan → severity tally →
//! insight synthesis.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use blackbelt_core::{ToolRegistry, EngineError};
use blackbelt_store::{DataContext, ParamSeries};

use crate::severity::{classify, Severity};

/// Groups with fewer points than this are skipped rather than analysed.
const MIN_POINTS: usize = 2;

/// One problematic `(node, param)` group surfaced by the workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterIssue {
    pub node_code: String,
    pub param_code: String,
    pub node_name: String,
    pub param_name: String,
    pub severity: Severity,
    pub process_status: String,
    pub cpk: Option<f64>,
    pub mean: f64,
    pub current_value: f64,
    pub target_value: Option<f64>,
    pub violation_count: usize,
    pub data_points: usize,
    pub batch_id: Option<String>,
}

/// A group the SPC tool could not analyse; the report continues without
/// it but degrades to at least WARNING.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErroredGroup {
    pub node_code: String,
    pub param_code: String,
    pub errors: Vec<String>,
}

/// Workflow output for one context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub status: Severity,
    pub critical_issues: Vec<ParameterIssue>,
    pub warnings: Vec<ParameterIssue>,
    pub errored_groups: Vec<ErroredGroup>,
    pub insights: Vec<String>,
    pub analyzed_groups: usize,
    pub skipped_groups: usize,
}

/// Runs the SPC scan over every group of a context and tallies severity.
///
/// Rerunning on the same context yields an identical outcome: group
/// iteration follows the provider's sorted grouping and all tie-breaks
/// are explicit.
#[derive(Clone)]
pub struct AnalysisWorkflow {
    registry: Arc<ToolRegistry>,
}

impl AnalysisWorkflow {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn run(&self, context: &DataContext) -> Result<WorkflowOutcome, EngineError> {
        let spc = self.registry.get("spc")?;

        let mut issues: Vec<ParameterIssue> = Vec::new();
        let mut errored_groups = Vec::new();
        let mut analyzed = 0usize;
        let mut skipped = 0usize;

        for group in &context.groups {
            if group.values.len() < MIN_POINTS {
                tracing::debug!(
                    node = %group.node_code,
                    param = %group.param_code,
                    points = group.values.len(),
                    "group skipped: not enough data"
                );
                skipped += 1;
                continue;
            }
            let config = match &group.param {
                Some(param) => json!({
                    "usl": param.usl,
                    "lsl": param.lsl,
                    "target": param.target,
                }),
                None => json!({}),
            };
            let outcome = spc.run(
                &blackbelt_core::ToolInput::TimeSeries(group.values.clone()),
                &config,
            );
            analyzed += 1;
            if !outcome.success {
                tracing::warn!(
                    node = %group.node_code,
                    param = %group.param_code,
                    errors = ?outcome.errors,
                    "group errored during SPC scan"
                );
                errored_groups.push(ErroredGroup {
                    node_code: group.node_code.clone(),
                    param_code: group.param_code.clone(),
                    errors: outcome.errors,
                });
                continue;
            }

            let process_status = outcome
                .result_value("process_status")
                .and_then(|v| v.as_str())
                .unwrap_or("受控")
                .to_string();
            let cpk = outcome.metric("cpk");
            let violation_count = outcome
                .result_value("violations")
                .and_then(|v| v.as_array())
                .map(Vec::len)
                .unwrap_or(0);
            let severity = classify(&process_status, cpk, violation_count);
            if severity == Severity::Normal {
                continue;
            }
            issues.push(build_issue(group, severity, &process_status, cpk, violation_count));
        }

        // Deterministic report ordering: severity descending, then
        // param_code, then node_code.
        issues.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.param_code.cmp(&b.param_code))
                .then_with(|| a.node_code.cmp(&b.node_code))
        });

        let critical_issues: Vec<ParameterIssue> = issues
            .iter()
            .filter(|i| matches!(i.severity, Severity::Critical | Severity::High))
            .cloned()
            .collect();
        let warnings: Vec<ParameterIssue> = issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .cloned()
            .collect();

        let mut status = if issues.iter().any(|i| i.severity == Severity::Critical) {
            Severity::Critical
        } else if !critical_issues.is_empty() || !warnings.is_empty() {
            Severity::Warning
        } else {
            Severity::Normal
        };
        if !errored_groups.is_empty() && status == Severity::Normal {
            status = Severity::Warning;
        }

        let insights = build_insights(&critical_issues, &warnings, &errored_groups, status, analyzed);

        Ok(WorkflowOutcome {
            status,
            critical_issues,
            warnings,
            errored_groups,
            insights,
            analyzed_groups: analyzed,
            skipped_groups: skipped,
        })
    }
}

fn build_issue(
    group: &ParamSeries,
    severity: Severity,
    process_status: &str,
    cpk: Option<f64>,
    violation_count: usize,
) -> ParameterIssue {
    let current_value = *group.values.last().expect("non-empty group");
    let mean = group.values.iter().sum::<f64>() / group.values.len() as f64;
    ParameterIssue {
        node_code: group.node_code.clone(),
        param_code: group.param_code.clone(),
        node_name: group.node_name.clone(),
        param_name: group
            .param
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| group.param_code.clone()),
        severity,
        process_status: process_status.to_string(),
        cpk,
        mean,
        current_value,
        target_value: group.param.as_ref().and_then(|p| p.target),
        violation_count,
        data_points: group.values.len(),
        batch_id: group.batch_ids.last().cloned(),
    }
}

fn build_insights(
    critical_issues: &[ParameterIssue],
    warnings: &[ParameterIssue],
    errored: &[ErroredGroup],
    status: Severity,
    analyzed: usize,
) -> Vec<String> {
    let mut insights = Vec::new();
    insights.push(format!(
        "整体状态 {}：共分析 {} 个参数组，{} 个紧急问题，{} 个警告",
        status.as_str(),
        analyzed,
        critical_issues.len(),
        warnings.len()
    ));
    for issue in critical_issues.iter().take(3) {
        let cpk_text = issue
            .cpk
            .map(|c| format!("Cpk={:.2}", c))
            .unwrap_or_else(|| "Cpk不可用".to_string());
        insights.push(format!(
            "{} {}（{}）：{}，{}，{} 个异常点",
            issue.node_name,
            issue.param_name,
            issue.node_code,
            issue.process_status,
            cpk_text,
            issue.violation_count
        ));
    }
    if !warnings.is_empty() {
        insights.push(format!("另有 {} 个参数组处于警告区间", warnings.len()));
    }
    if !errored.is_empty() {
        insights.push(format!("{} 个参数组分析失败，已跳过", errored.len()));
    }
    insights
}

#[cfg(test)]
mod tests {
    use super::*;
    use blackbelt_store::models::{ParamDataType, ParamRole, ParameterDef};
    use blackbelt_store::Dimension;
    use serde_json::Map;

    fn param_def(node: &str, usl: f64, lsl: f64) -> ParameterDef {
        ParameterDef {
            node_code: node.into(),
            code: "temp".into(),
            name: "提取温度".into(),
            unit: Some("℃".into()),
            role: ParamRole::Control,
            usl: Some(usl),
            lsl: Some(lsl),
            target: Some((usl + lsl) / 2.0),
            data_type: ParamDataType::Scalar,
        }
    }

    fn series(node: &str, values: Vec<f64>, param: Option<ParameterDef>) -> ParamSeries {
        let n = values.len();
        ParamSeries {
            node_code: node.into(),
            param_code: "temp".into(),
            node_name: format!("{}罐", node),
            param,
            timestamps: Vec::new(),
            batch_ids: vec!["B1".to_string(); n],
            values,
        }
    }

    fn context(groups: Vec<ParamSeries>) -> DataContext {
        DataContext {
            dimension: Dimension::Workshop,
            key: "BLOCK_E".into(),
            groups,
            batch_ids: vec!["B1".into()],
            metadata: Map::new(),
        }
    }

    fn workflow() -> AnalysisWorkflow {
        AnalysisWorkflow::new(Arc::new(ToolRegistry::with_builtin_tools()))
    }

    /// Tight series: Cpk well above 1.33 against 80..90 limits.
    fn stable_values() -> Vec<f64> {
        (0..30)
            .map(|i| 85.0 + 0.2 * ((i % 5) as f64 - 2.0) / 2.0)
            .collect()
    }

    /// Wide series with one point out of specification.
    fn unstable_values() -> Vec<f64> {
        let mut values: Vec<f64> = (0..29)
            .map(|i| 85.0 + 3.0 * (((i * 7) % 10) as f64 - 4.5) / 4.5)
            .collect();
        values.push(91.0);
        values
    }

    #[test]
    fn healthy_context_is_normal_with_no_issues() {
        let ctx = context(vec![series(
            "E01",
            stable_values(),
            Some(param_def("E01", 90.0, 80.0)),
        )]);
        let outcome = workflow().run(&ctx).expect("run");
        assert_eq!(outcome.status, Severity::Normal);
        assert!(outcome.critical_issues.is_empty());
        assert!(outcome.warnings.is_empty());
        assert!(!outcome.insights.is_empty());
    }

    #[test]
    fn out_of_spec_group_dominates_the_report() {
        let ctx = context(vec![
            series("E01", stable_values(), Some(param_def("E01", 90.0, 80.0))),
            series("E02", unstable_values(), Some(param_def("E02", 90.0, 80.0))),
        ]);
        let outcome = workflow().run(&ctx).expect("run");
        assert_eq!(outcome.status, Severity::Critical);
        assert_eq!(outcome.critical_issues.len(), 1);
        assert_eq!(outcome.critical_issues[0].node_code, "E02");
        assert_eq!(outcome.critical_issues[0].severity, Severity::Critical);
        assert!(outcome.warnings.is_empty());
        assert!(outcome.insights.iter().any(|i| i.contains("E02")));
    }

    #[test]
    fn short_groups_are_skipped_not_errored() {
        let ctx = context(vec![series(
            "E01",
            vec![85.0],
            Some(param_def("E01", 90.0, 80.0)),
        )]);
        let outcome = workflow().run(&ctx).expect("run");
        assert_eq!(outcome.skipped_groups, 1);
        assert_eq!(outcome.analyzed_groups, 0);
        assert_eq!(outcome.status, Severity::Normal);
    }

    #[test]
    fn rerun_yields_identical_reports() {
        let ctx = context(vec![
            series("E02", unstable_values(), Some(param_def("E02", 90.0, 80.0))),
            series("E01", stable_values(), Some(param_def("E01", 90.0, 80.0))),
        ]);
        let wf = workflow();
        let first = wf.run(&ctx).expect("run");
        let second = wf.run(&ctx).expect("run");
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn issues_sort_by_severity_then_param_then_node() {
        let mut wide = unstable_values();
        wide.pop();
        // Wide but inside limits: capability-driven severity.
        let ctx = context(vec![
            series("E03", wide.clone(), Some(param_def("E03", 90.0, 80.0))),
            series("E02", unstable_values(), Some(param_def("E02", 90.0, 80.0))),
        ]);
        let outcome = workflow().run(&ctx).expect("run");
        let all: Vec<&ParameterIssue> = outcome
            .critical_issues
            .iter()
            .chain(outcome.warnings.iter())
            .collect();
        for pair in all.windows(2) {
            assert!(pair[0].severity >= pair[1].severity);
        }
        // E02 breaches the specification, so it leads.
        assert_eq!(all[0].node_code, "E02");
    }
}

//! Human-readable rendering of analysis reports.

use serde_json::{json, Value};

use crate::orchestrator::AnalysisReport;
use crate::severity::Severity;

/// Deterministic paragraph rendering; no side effects.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportFormatter;

impl ReportFormatter {
    pub fn new() -> Self {
        Self
    }

    /// Ordered paragraphs: headline, status badge, issues with evidence,
    /// warnings, insights.
    pub fn render(&self, report: &AnalysisReport) -> Vec<String> {
        let mut paragraphs = Vec::new();
        paragraphs.push(format!(
            "{} 维度诊断报告（{}）",
            report.dimension.to_uppercase(),
            report.key
        ));
        paragraphs.push(format!("整体状态：{}", status_badge(report.status)));

        for issue in &report.critical_issues {
            let cpk_text = issue
                .cpk
                .map(|c| format!("Cpk={:.3}", c))
                .unwrap_or_else(|| "Cpk不可用".to_string());
            paragraphs.push(format!(
                "[{}] {} {}（{}.{}）：{}，{}，当前值 {:.2}，{} 个异常点",
                issue.severity.as_str(),
                issue.node_name,
                issue.param_name,
                issue.node_code,
                issue.param_code,
                issue.process_status,
                cpk_text,
                issue.current_value,
                issue.violation_count
            ));
        }
        for warning in &report.warnings {
            paragraphs.push(format!(
                "[WARNING] {} {}（{}.{}）：{}",
                warning.node_name,
                warning.param_name,
                warning.node_code,
                warning.param_code,
                warning
                    .cpk
                    .map(|c| format!("Cpk={:.3}", c))
                    .unwrap_or_else(|| "能力指数不可用".to_string())
            ));
        }
        for errored in &report.errored_groups {
            paragraphs.push(format!(
                "[ERRORED] {}.{}：{}",
                errored.node_code,
                errored.param_code,
                errored.errors.join("; ")
            ));
        }
        for insight in &report.insights {
            paragraphs.push(insight.clone());
        }
        paragraphs
    }

    /// Summarise several reports into one JSON document, worst status
    /// first. Carried by the cross-workshop daily endpoint.
    pub fn merge_reports(&self, reports: &[AnalysisReport]) -> Value {
        let mut critical = Vec::new();
        let mut warnings = Vec::new();
        for report in reports {
            critical.extend(report.critical_issues.iter().cloned());
            warnings.extend(report.warnings.iter().cloned());
        }
        let overall = reports
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(Severity::Normal);

        critical.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.param_code.cmp(&b.param_code))
                .then_with(|| a.node_code.cmp(&b.node_code))
        });

        json!({
            "analysis_type": "merged_report",
            "overall_status": overall.as_str(),
            "total_reports": reports.len(),
            "critical_issues_count": critical.len(),
            "warnings_count": warnings.len(),
            "critical_issues": critical.iter().take(10).collect::<Vec<_>>(),
            "warnings": warnings.iter().take(20).collect::<Vec<_>>(),
            "reports": reports.iter().map(|r| json!({
                "dimension": r.dimension,
                "key": r.key,
                "status": r.status.as_str(),
            })).collect::<Vec<_>>(),
        })
    }
}

fn status_badge(status: Severity) -> &'static str {
    match status {
        Severity::Critical => "🔴 CRITICAL",
        Severity::High => "🟠 HIGH",
        Severity::Warning => "🟡 WARNING",
        Severity::Normal => "🟢 NORMAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn empty_report(status: Severity) -> AnalysisReport {
        AnalysisReport {
            dimension: "workshop".into(),
            key: "BLOCK_E".into(),
            analysis_id: "workshop_test".into(),
            status,
            critical_issues: Vec::new(),
            warnings: Vec::new(),
            errored_groups: Vec::new(),
            insights: vec!["一切正常".into()],
            metadata: Map::new(),
            quick_actions: Vec::new(),
        }
    }

    #[test]
    fn renders_headline_then_status_then_insights() {
        let paragraphs = ReportFormatter::new().render(&empty_report(Severity::Normal));
        assert!(paragraphs[0].contains("WORKSHOP"));
        assert!(paragraphs[0].contains("BLOCK_E"));
        assert!(paragraphs[1].contains("NORMAL"));
        assert_eq!(paragraphs.last().unwrap(), "一切正常");
    }

    #[test]
    fn rendering_is_deterministic() {
        let report = empty_report(Severity::Warning);
        let formatter = ReportFormatter::new();
        assert_eq!(formatter.render(&report), formatter.render(&report));
    }

    #[test]
    fn merged_reports_take_the_worst_status() {
        let merged = ReportFormatter::new().merge_reports(&[
            empty_report(Severity::Normal),
            empty_report(Severity::Critical),
            empty_report(Severity::Warning),
        ]);
        assert_eq!(merged["overall_status"], json!("CRITICAL"));
        assert_eq!(merged["total_reports"], json!(3));
    }

    #[test]
    fn merging_nothing_is_normal() {
        let merged = ReportFormatter::new().merge_reports(&[]);
        assert_eq!(merged["overall_status"], json!("NORMAL"));
    }
}

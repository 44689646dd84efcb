//! Instruction engine: renders matched action templates into per-role
//! directives and persists them with a lifecycle.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use blackbelt_core::EngineError;
use blackbelt_store::models::{
    ActionDef, Instruction, InstructionKind, InstructionStatus, NewInstruction, NodeType,
    TargetRole,
};
use blackbelt_store::{Dimension, SqliteStore};

use crate::decision::DecisionEngine;
use crate::orchestrator::{AnalysisReport, Orchestrator};
use crate::workflow::ParameterIssue;

/// Per-role instruction cap after priority ordering.
const MAX_INSTRUCTIONS_PER_ROLE: usize = 10;

/// Default valve opening assumed when a template asks for valve numbers
/// and no actual is recorded.
const DEFAULT_VALVE_PCT: f64 = 50.0;
const VALVE_STEP_PCT: f64 = 5.0;

/// Generates, persists and serves daily per-role instructions.
#[derive(Clone)]
pub struct InstructionEngine {
    store: Arc<SqliteStore>,
    orchestrator: Arc<Orchestrator>,
    engine: Arc<dyn DecisionEngine>,
}

impl InstructionEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        orchestrator: Arc<Orchestrator>,
        engine: Arc<dyn DecisionEngine>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            engine,
        }
    }

    /// Analyse the requested dimensions and materialise one instruction
    /// per `(target_date, role, action, batch, node)` tuple. Re-running
    /// for the same date adds nothing.
    pub async fn generate_daily_orders(
        &self,
        target_date: &str,
        dimensions: &[Dimension],
    ) -> Result<BTreeMap<TargetRole, Vec<Instruction>>, EngineError> {
        let mut reports = Vec::new();
        for dimension in dimensions {
            match dimension {
                Dimension::Batch => {
                    for batch in self.store.batches()? {
                        reports.push(self.orchestrator.analyze_by_batch(&batch.id).await?);
                    }
                }
                Dimension::Process => {
                    for node in self.store.nodes_by_type(NodeType::Unit)? {
                        reports.push(
                            self.orchestrator
                                .analyze_by_process(&node.code, None, None)
                                .await?,
                        );
                    }
                }
                Dimension::Workshop => {
                    for block in self.store.nodes_by_type(NodeType::Block)? {
                        reports.push(self.orchestrator.analyze_by_workshop(&block.code).await?);
                    }
                }
                other => {
                    return Err(EngineError::BadRequest(format!(
                        "daily orders do not cover the {} dimension",
                        other.as_str()
                    )));
                }
            }
        }

        let decision_context = self.orchestrator.decision_context()?;
        let mut staged: Vec<NewInstruction> = Vec::new();
        let mut seen: HashSet<(String, String, String, String, String)> = HashSet::new();

        for report in &reports {
            for issue in report.critical_issues.iter().chain(report.warnings.iter()) {
                let actions = self.engine.generate_actions(issue, &decision_context).await?;
                for action in actions {
                    let vars = template_vars(issue, &action);
                    let content = match render_template(&action.instruction_template, &vars) {
                        Ok(content) => content,
                        Err(missing) => {
                            tracing::warn!(
                                action = %action.code,
                                placeholder = %missing,
                                "template has an unresolvable placeholder, skipping"
                            );
                            continue;
                        }
                    };
                    let dedup_key = (
                        target_date.to_string(),
                        action.target_role.as_str().to_string(),
                        action.code.clone(),
                        issue.batch_id.clone().unwrap_or_default(),
                        issue.node_code.clone(),
                    );
                    if !seen.insert(dedup_key) {
                        continue;
                    }
                    staged.push(NewInstruction {
                        target_date: target_date.to_string(),
                        role: action.target_role,
                        action_code: action.code.clone(),
                        batch_id: issue.batch_id.clone(),
                        node_code: Some(issue.node_code.clone()),
                        param_code: Some(issue.param_code.clone()),
                        content,
                        priority: action.priority,
                        evidence: evidence_bag(issue, report),
                        instruction_type: if issue.batch_id.is_some() {
                            InstructionKind::Tactical
                        } else {
                            InstructionKind::Strategic
                        },
                    });
                }
            }
        }

        // Priority first, stable within a level, then the per-role cap.
        staged.sort_by(|a, b| b.priority.rank().cmp(&a.priority.rank()));
        let mut per_role_counts: BTreeMap<TargetRole, usize> = BTreeMap::new();
        let mut groups: BTreeMap<TargetRole, Vec<Instruction>> = BTreeMap::new();
        let mut persisted = 0usize;
        for instruction in staged {
            let count = per_role_counts.entry(instruction.role).or_insert(0);
            if *count >= MAX_INSTRUCTIONS_PER_ROLE {
                continue;
            }
            // Concurrent generators may race on the same tuple; the
            // unique index makes the loser a silent skip.
            if let Some(id) = self.store.insert_instruction_if_absent(&instruction)? {
                let stored = self.store.instruction(id)?.ok_or_else(|| {
                    EngineError::Internal(format!("instruction {} vanished after insert", id))
                })?;
                *count += 1;
                persisted += 1;
                groups.entry(stored.role).or_default().push(stored);
            }
        }
        tracing::info!(
            target_date,
            reports = reports.len(),
            persisted,
            "daily order generation complete"
        );
        Ok(groups)
    }

    /// Role-scoped read, optionally filtered to a comma-separated status
    /// list.
    pub fn get_instructions_by_role(
        &self,
        role: TargetRole,
        target_date: &str,
        statuses: Option<&[InstructionStatus]>,
    ) -> Result<Vec<Instruction>, EngineError> {
        self.store.instructions_by_role(role, target_date, statuses)
    }

    pub fn mark_read(&self, id: i64) -> Result<Instruction, EngineError> {
        self.store.mark_instruction_read(id)
    }

    pub fn mark_done(&self, id: i64, feedback: Option<String>) -> Result<Instruction, EngineError> {
        self.store.mark_instruction_done(id, feedback)
    }
}

/// Substitute `{placeholder}` tokens. An unknown placeholder fails the
/// render so no braces ever reach a persisted instruction.
pub fn render_template(template: &str, vars: &Map<String, Value>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(rest[start..].to_string());
        };
        let key = &after[..end];
        match vars.get(key) {
            Some(value) => out.push_str(&value_text(value)),
            None => return Err(key.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n
            .as_f64()
            .map(format_number)
            .unwrap_or_else(|| n.to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Integers print bare, fractions keep up to two decimals.
fn format_number(v: f64) -> String {
    if (v - v.round()).abs() < 1e-9 {
        format!("{}", v.round() as i64)
    } else {
        let text = format!("{:.2}", v);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn template_vars(issue: &ParameterIssue, action: &ActionDef) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("node_name".into(), json!(issue.node_name));
    vars.insert("node_code".into(), json!(issue.node_code));
    vars.insert("param_code".into(), json!(issue.param_code));
    vars.insert("param_name".into(), json!(issue.param_name));
    vars.insert(
        "batch_id".into(),
        json!(issue.batch_id.clone().unwrap_or_default()),
    );
    vars.insert("current_value".into(), json!(issue.current_value));
    vars.insert(
        "target_value".into(),
        json!(issue.target_value.unwrap_or(0.0)),
    );
    vars.insert("cpk".into(), json!(issue.cpk.unwrap_or(0.0)));

    // Valve guidance: step down when running above target, up otherwise.
    if action.instruction_template.contains("valve") {
        let above_target = issue
            .target_value
            .map(|t| issue.current_value > t)
            .unwrap_or(true);
        let suggested = if above_target {
            DEFAULT_VALVE_PCT - VALVE_STEP_PCT
        } else {
            DEFAULT_VALVE_PCT + VALVE_STEP_PCT
        };
        vars.insert("current_valve".into(), json!(DEFAULT_VALVE_PCT));
        vars.insert("suggested_valve".into(), json!(suggested));
    }
    vars
}

fn evidence_bag(issue: &ParameterIssue, report: &AnalysisReport) -> Map<String, Value> {
    let mut evidence = Map::new();
    evidence.insert("severity".into(), json!(issue.severity.as_str()));
    evidence.insert("process_status".into(), json!(issue.process_status));
    if let Some(cpk) = issue.cpk {
        evidence.insert("cpk".into(), json!(cpk));
    }
    evidence.insert("current_value".into(), json!(issue.current_value));
    if let Some(target) = issue.target_value {
        evidence.insert("target_value".into(), json!(target));
    }
    evidence.insert("violation_count".into(), json!(issue.violation_count));
    if let Some(batch_id) = &issue.batch_id {
        evidence.insert("batch_id".into(), json!(batch_id));
    }
    evidence.insert("dimension".into(), json!(report.dimension));
    evidence
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_every_placeholder() {
        let mut vars = Map::new();
        vars.insert("node_name".into(), json!("醇提罐"));
        vars.insert("current_valve".into(), json!(50.0));
        vars.insert("suggested_valve".into(), json!(45.0));
        let content = render_template(
            "Adjust valve on {node_name} from {current_valve}% to {suggested_valve}%",
            &vars,
        )
        .expect("render");
        assert_eq!(content, "Adjust valve on 醇提罐 from 50% to 45%");
        assert!(!content.contains('{'));
    }

    #[test]
    fn unknown_placeholder_fails_the_render() {
        let vars = Map::new();
        let err = render_template("检查{mystery}状态", &vars).expect_err("missing var");
        assert_eq!(err, "mystery");
    }

    #[test]
    fn numbers_render_without_trailing_noise() {
        assert_eq!(format_number(50.0), "50");
        assert_eq!(format_number(45.0), "45");
        assert_eq!(format_number(85.5), "85.5");
        assert_eq!(format_number(0.847), "0.85");
    }

    #[test]
    fn unterminated_brace_fails_the_render() {
        let vars = Map::new();
        assert!(render_template("调整{node_name", &vars).is_err());
    }
}

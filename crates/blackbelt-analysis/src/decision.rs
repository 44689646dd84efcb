//! Pluggable decision layer: maps report issues to candidate action
//! templates.

use async_trait::async_trait;

use blackbelt_core::EngineError;
use blackbelt_store::models::{ActionDef, ActionPriority};

use crate::severity::Severity;
use crate::workflow::ParameterIssue;

/// Catalog the engine matches against, assembled from the store before a
/// generation pass.
#[derive(Clone, Debug, Default)]
pub struct DecisionContext {
    /// Active action templates.
    pub actions: Vec<ActionDef>,
    /// Explicit `(node, param, severity) → action` overrides; consulted
    /// before any heuristic.
    pub mappings: Vec<ActionMapping>,
}

#[derive(Clone, Debug)]
pub struct ActionMapping {
    pub node_code: String,
    pub param_code: String,
    pub severity: Severity,
    pub action_code: String,
}

/// Decision engine interface.
///
/// The rule-based implementation is the default; an LLM-backed engine
/// plugs in behind the same signature, which is why the trait is async
/// and returns plain action templates rather than anything
/// rule-specific.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn generate_actions(
        &self,
        issue: &ParameterIssue,
        context: &DecisionContext,
    ) -> Result<Vec<ActionDef>, EngineError>;
}

/// Threshold- and keyword-driven engine.
#[derive(Clone, Debug, Default)]
pub struct RuleBasedDecisionEngine;

impl RuleBasedDecisionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Derive the risk code an issue points at, mirroring the fault-tree
    /// naming convention (`R_<node>_TEMP_HIGH` etc.). A missing
    /// param_code derives nothing.
    fn derive_risk_code(issue: &ParameterIssue) -> Option<String> {
        let param = issue.param_code.to_lowercase();
        if param.is_empty() {
            return None;
        }
        let escalated = matches!(issue.severity, Severity::Critical | Severity::High);
        if param.contains("temp") || issue.param_code.contains("温度") {
            if escalated {
                Some(format!("R_{}_TEMP_HIGH", issue.node_code))
            } else {
                Some(format!("R_{}_TEMP_LOW", issue.node_code))
            }
        } else if param.contains("pressure") || issue.param_code.contains("压力") {
            Some(format!("R_{}_PRESSURE_HIGH", issue.node_code))
        } else if param.contains("moisture") || issue.param_code.contains("水分") {
            Some("R_P01_MOISTURE_HIGH".to_string())
        } else if param.contains("time") {
            Some(format!("R_{}_TIME_SHORT", issue.node_code))
        } else {
            None
        }
    }

    fn keyword_matches(template: &str, issue: &ParameterIssue) -> bool {
        if !(template.contains("temp") || template.contains("温度")) {
            return false;
        }
        let param = issue.param_code.to_lowercase();
        !param.is_empty() && (param.contains("temp") || issue.param_code.contains("温度"))
    }

    fn severity_permits(priority: ActionPriority, severity: Severity) -> bool {
        if priority.rank() >= ActionPriority::High.rank() {
            matches!(severity, Severity::Critical | Severity::High)
        } else {
            true
        }
    }
}

#[async_trait]
impl DecisionEngine for RuleBasedDecisionEngine {
    async fn generate_actions(
        &self,
        issue: &ParameterIssue,
        context: &DecisionContext,
    ) -> Result<Vec<ActionDef>, EngineError> {
        let mut matched: Vec<&ActionDef> = Vec::new();

        // 1. Explicit mapping table wins outright.
        for mapping in &context.mappings {
            if mapping.node_code == issue.node_code
                && mapping.param_code == issue.param_code
                && mapping.severity == issue.severity
            {
                if let Some(action) =
                    context.actions.iter().find(|a| a.code == mapping.action_code)
                {
                    matched.push(action);
                }
            }
        }

        // 2. Fault-tree association via the action's risk code.
        let derived_risk = Self::derive_risk_code(issue);
        // 3. Node code mentioned in the template, or the temperature
        //    keyword heuristic.
        for action in &context.actions {
            if !action.active {
                continue;
            }
            let risk_hit = match (&derived_risk, &action.risk_code) {
                (Some(derived), Some(declared)) => derived == declared,
                _ => false,
            };
            let template_hit = action.instruction_template.contains(&issue.node_code)
                || Self::keyword_matches(&action.instruction_template, issue);
            if risk_hit || template_hit {
                matched.push(action);
            }
        }

        matched.retain(|a| Self::severity_permits(a.priority, issue.severity));

        // Priority descending, then code ascending; first hit wins dedup.
        matched.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then_with(|| a.code.cmp(&b.code))
        });
        let mut seen = std::collections::HashSet::new();
        let unique: Vec<ActionDef> = matched
            .into_iter()
            .filter(|a| seen.insert(a.code.clone()))
            .cloned()
            .collect();
        Ok(unique)
    }
}

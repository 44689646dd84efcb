//! # blackbelt-analysis
//!
//! The orchestration layer of the blackbelt service: turns provider
//! contexts into structured analysis reports, reports into candidate
//! actions, and actions into per-role instructions with a persisted
//! lifecycle.
//!
//! Pipeline: provider → [`workflow`] (SPC scan + severity tally) →
//! [`orchestrator`] (per-dimension reports) → [`decision`] (issue →
//! action templates) → [`instructions`] (rendered per-role directives).
//! [`report`] renders reports for humans; [`monitor`] serves the
//! current-state views.

pub mod decision;
pub mod instructions;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod severity;
pub mod workflow;

pub use decision::{DecisionContext, DecisionEngine, RuleBasedDecisionEngine};
pub use instructions::InstructionEngine;
pub use monitor::MonitorService;
pub use orchestrator::{AnalysisReport, Orchestrator};
pub use report::ReportFormatter;
pub use severity::Severity;
pub use workflow::{AnalysisWorkflow, ParameterIssue, WorkflowOutcome};

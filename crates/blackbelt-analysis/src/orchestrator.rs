//! Per-dimension analysis entry points producing [`AnalysisReport`]s.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use blackbelt_core::EngineError;
use blackbelt_store::{DataContext, DataProvider, Dimension, SqliteStore};

use crate::decision::{DecisionContext, DecisionEngine};
use crate::severity::Severity;
use crate::workflow::{AnalysisWorkflow, ErroredGroup, ParameterIssue};

/// Structured output of one dimension invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub dimension: String,
    pub key: String,
    pub analysis_id: String,
    pub status: Severity,
    pub critical_issues: Vec<ParameterIssue>,
    pub warnings: Vec<ParameterIssue>,
    pub errored_groups: Vec<ErroredGroup>,
    pub insights: Vec<String>,
    pub metadata: Map<String, Value>,
    /// For each CRITICAL issue, at most one suggested action code.
    pub quick_actions: Vec<QuickAction>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuickAction {
    pub node_code: String,
    pub param_code: String,
    pub action_code: String,
    pub action_name: String,
    pub priority: String,
}

/// Multi-dimensional report builder: provider → workflow → report, with
/// quick-action suggestions from the decision engine.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<SqliteStore>,
    provider: DataProvider,
    workflow: AnalysisWorkflow,
    engine: Arc<dyn DecisionEngine>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        provider: DataProvider,
        workflow: AnalysisWorkflow,
        engine: Arc<dyn DecisionEngine>,
    ) -> Self {
        Self {
            store,
            provider,
            workflow,
            engine,
        }
    }

    pub async fn analyze_by_batch(&self, batch_id: &str) -> Result<AnalysisReport, EngineError> {
        let context = self.provider.by_batch(batch_id, None)?;
        self.analyze_context(context).await
    }

    /// Stability analysis of one node, scoped to the last
    /// `time_window_days` when given (default: full history window).
    pub async fn analyze_by_process(
        &self,
        node_code: &str,
        param_code: Option<&str>,
        time_window_days: Option<i64>,
    ) -> Result<AnalysisReport, EngineError> {
        let since = time_window_days.map(|days| Utc::now() - chrono::Duration::days(days));
        let context = self.provider.by_process(node_code, param_code, since, None)?;
        self.analyze_context(context).await
    }

    pub async fn analyze_by_workshop(&self, block_code: &str) -> Result<AnalysisReport, EngineError> {
        let context = self.provider.by_workshop(block_code, None)?;
        self.analyze_context(context).await
    }

    pub async fn analyze_by_person(
        &self,
        operator_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<AnalysisReport, EngineError> {
        let context = self.provider.by_person(operator_id, range, None)?;
        self.analyze_context(context).await
    }

    pub async fn analyze_by_time(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AnalysisReport, EngineError> {
        let context = self.provider.by_time(start, end, None)?;
        self.analyze_context(context).await
    }

    pub async fn analyze_by_dimension(
        &self,
        dimension: Dimension,
        key: &str,
    ) -> Result<AnalysisReport, EngineError> {
        match dimension {
            Dimension::Batch => self.analyze_by_batch(key).await,
            Dimension::Process => self.analyze_by_process(key, None, None).await,
            Dimension::Workshop => self.analyze_by_workshop(key).await,
            Dimension::Person => self.analyze_by_person(key, None).await,
            Dimension::Time => Err(EngineError::BadRequest(
                "time dimension requires an explicit interval".to_string(),
            )),
        }
    }

    /// Quick path for the front end: the most urgent suggested actions
    /// for one batch, already priority-ordered by the report build.
    pub async fn recommended_actions(
        &self,
        batch_id: &str,
        max_actions: usize,
    ) -> Result<Vec<QuickAction>, EngineError> {
        let report = self.analyze_by_batch(batch_id).await?;
        Ok(report.quick_actions.into_iter().take(max_actions).collect())
    }

    /// Catalog snapshot handed to the decision engine.
    pub fn decision_context(&self) -> Result<DecisionContext, EngineError> {
        Ok(DecisionContext {
            actions: self.store.actions(true)?,
            mappings: Vec::new(),
        })
    }

    async fn analyze_context(&self, context: DataContext) -> Result<AnalysisReport, EngineError> {
        tracing::info!(
            dimension = context.dimension.as_str(),
            key = %context.key,
            groups = context.groups.len(),
            "running analysis"
        );
        let outcome = self.workflow.run(&context)?;

        let mut metadata = context.metadata.clone();
        metadata.insert("generated_at".into(), json!(Utc::now().to_rfc3339()));
        metadata.insert(
            "analyzed_groups".into(),
            json!(outcome.analyzed_groups),
        );
        metadata.insert("skipped_groups".into(), json!(outcome.skipped_groups));
        metadata.insert("batch_ids".into(), json!(context.batch_ids));

        let decision_context = self.decision_context()?;
        let mut quick_actions = Vec::new();
        for issue in outcome
            .critical_issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
        {
            let candidates = self.engine.generate_actions(issue, &decision_context).await?;
            if let Some(action) = candidates.first() {
                quick_actions.push(QuickAction {
                    node_code: issue.node_code.clone(),
                    param_code: issue.param_code.clone(),
                    action_code: action.code.clone(),
                    action_name: action.name.clone(),
                    priority: action.priority.as_str().to_string(),
                });
            }
        }

        Ok(AnalysisReport {
            dimension: context.dimension.as_str().to_string(),
            key: context.key.clone(),
            analysis_id: format!("{}_{}", context.dimension.as_str(), uuid::Uuid::new_v4()),
            status: outcome.status,
            critical_issues: outcome.critical_issues,
            warnings: outcome.warnings,
            errored_groups: outcome.errored_groups,
            insights: outcome.insights,
            metadata,
            quick_actions,
        })
    }
}

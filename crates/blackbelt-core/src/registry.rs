//! String-keyed tool registry.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::boxplot::BoxplotTool;
use crate::error::EngineError;
use crate::histogram::HistogramTool;
use crate::pareto::ParetoTool;
use crate::spc::SpcTool;
use crate::tool::{Tool, ToolMeta};

/// Registry for analysis tools.
///
/// Initialised once at startup, read-only afterwards; safe to share
/// behind an `Arc`. Keys are unique — re-registering an existing key is
/// an error rather than a silent replacement.
#[derive(Debug)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

/// Listing row returned by [`ToolRegistry::list`].
#[derive(Clone, Debug, Serialize)]
pub struct ToolListing {
    pub key: String,
    pub name: String,
    pub category: String,
    pub required_data_shape: String,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in statistical tool catalog.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(SpcTool))
            .expect("register spc");
        registry
            .register(Arc::new(ParetoTool))
            .expect("register pareto");
        registry
            .register(Arc::new(HistogramTool))
            .expect("register histogram");
        registry
            .register(Arc::new(BoxplotTool))
            .expect("register boxplot");
        tracing::info!(tools = registry.tools.len(), "tool registry initialised");
        registry
    }

    /// Register a tool under its metadata key.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<&mut Self, EngineError> {
        let key = tool.meta().key.to_string();
        if self.tools.contains_key(&key) {
            return Err(EngineError::BadRequest(format!(
                "tool key '{}' is already registered",
                key
            )));
        }
        self.tools.insert(key, tool);
        Ok(self)
    }

    /// Look up a tool by key.
    pub fn get(&self, key: &str) -> Result<Arc<dyn Tool>, EngineError> {
        self.tools
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTool(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tools.contains_key(key)
    }

    /// Registered keys in stable order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.tools.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Metadata listing in stable key order.
    pub fn list(&self) -> Vec<ToolListing> {
        self.keys()
            .into_iter()
            .map(|key| {
                let meta: ToolMeta = self.tools[&key].meta();
                ToolListing {
                    key,
                    name: meta.name.to_string(),
                    category: meta.category.as_str().to_string(),
                    required_data_shape: meta.required_data_shape.as_str().to_string(),
                }
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtin_tools()
    }
}

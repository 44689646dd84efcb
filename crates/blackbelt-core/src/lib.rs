//! # blackbelt-core
//!
//! Tool framework and statistical tool catalog for the blackbelt
//! process-analysis service.
//!
//! - **Tool framework** — a uniform `Tool` contract (metadata, validate,
//!   run) with a string-keyed [`ToolRegistry`]. Adding a tool is adding an
//!   implementation and registering it; no class hierarchy.
//! - **Statistical tools** — SPC (individuals/moving-range control chart
//!   with process capability), Pareto, Histogram (with normality test),
//!   Boxplot (multi-series comparison). Each produces both numeric results
//!   and a chart-ready `plot_data` payload.
//!
//! This crate is pure computation: no I/O, no global mutable state. The
//! registry is read-only after construction and freely shared.

pub mod boxplot;
pub mod envelope;
pub mod error;
pub mod histogram;
pub mod pareto;
pub mod registry;
pub mod spc;
pub mod stats;
pub mod tool;

pub use envelope::ToolOutcome;
pub use error::EngineError;
pub use registry::ToolRegistry;
pub use tool::{CategoryCount, DataShape, Tool, ToolCategory, ToolInput, ToolMeta};

//! # blackbelt-server
//!
//! HTTP boundary for the blackbelt analysis service: DTOs, error
//! mapping and the axum router. Handlers stay thin — parse, delegate to
//! the analysis layer, map errors.

pub mod api_errors;
pub mod api_handlers;
pub mod api_models;

pub use api_errors::ApiError;
pub use api_handlers::{build_router, AppState};

//! # blackbelt-store
//!
//! Typed relational storage for the blackbelt analysis service: process
//! nodes, parameters, risks, batches, measurements, action templates and
//! instructions — plus the dimension-keyed read-only providers the
//! analysis layer consumes.
//!
//! Persistence is SQLite behind an `Arc<Mutex<Connection>>`; schema
//! changes go through numbered migrations. Measurements are an
//! append-only stream; instructions are the only entity mutated after
//! creation (their lifecycle status).

pub mod models;
pub mod providers;
pub mod store;

pub use providers::{DataContext, DataProvider, Dimension, ParamSeries};
pub use store::SqliteStore;

//! Docql: index selection, scan planning and streaming execution for
//! document queries.
//!
//! The crate is organised leaves first: [`types`] carries the shared error
//! type, [`datastore`] describes the storage capabilities the engine consumes,
//! and [`query`] holds the value/expression layer, the planner and the
//! operator pipeline.

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod datastore;
pub mod query;
pub mod telemetry;
pub mod types;

pub use config::EngineConfig;
pub use types::{QueryError, Result};

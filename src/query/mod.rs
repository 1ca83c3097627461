#![forbid(unsafe_code)]

//! Query planning and execution engine.
//!
//! This module holds the value and expression layer, the query model, the
//! index-selecting planner and the streaming operator pipeline.

/// Aggregate functions and accumulators.
pub mod aggregate;

/// Query model consumed by the planner.
///
/// Describes the driving keyspace, nests, filters, grouping, ordering and
/// projection of a `SELECT`.
pub mod ast;

/// Fluent construction of [`ast::SelectQuery`] values.
pub mod builder;

/// Planner error taxonomy.
pub mod errors;

/// Operator pipeline.
///
/// Runs physical plans as a tree of tokio tasks linked by bounded channels
/// and streams annotated rows back to the caller.
pub mod executor;

/// Expressions: construction, analysis, normalisation and evaluation.
pub mod expr;

/// Immutable plan tree shared by EXPLAIN and the executor.
pub mod physical;

/// Sargability analysis, index selection and scan planning.
pub mod planner;

/// Per-request phase counters.
pub mod profile;

/// Document values and pipeline items.
pub mod value;

pub use builder::QueryBuilder;
pub use executor::{Context, Executor, QueryResult, QueryStatus, ResultStream};
pub use planner::{PlanExplain, Planner, PlannerOutput};

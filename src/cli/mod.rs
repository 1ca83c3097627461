#![forbid(unsafe_code)]

//! Fixture-driven entry points behind the `docql` binary.
//!
//! A fixture is a JSON document describing an in-memory datastore
//! (keyspaces, documents and indexes) plus one query. The binary plans the
//! query (`explain`) or plans and runs it (`run`); both are exposed here so
//! they can be driven without a process boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::datastore::memory::MemoryDatastore;
use crate::datastore::{Datastore, IndexState};
use crate::query::ast::SelectQuery;
use crate::query::expr::Expr;
use crate::query::profile::PhaseSnapshot;
use crate::query::value::Value;
use crate::query::{Executor, Planner, PlannerOutput, QueryResult, QueryStatus};
use crate::types::{QueryError, Result};

/// Datastore contents plus the query to plan.
#[derive(Clone, Debug, Deserialize)]
pub struct Fixture {
    /// Engine settings; a `--config` file takes precedence.
    #[serde(default)]
    pub config: Option<EngineConfig>,
    /// Keyspaces to create.
    #[serde(default)]
    pub keyspaces: Vec<KeyspaceFixture>,
    /// Query to plan.
    pub query: SelectQuery,
}

/// One keyspace of a fixture.
#[derive(Clone, Debug, Deserialize)]
pub struct KeyspaceFixture {
    /// Keyspace name.
    pub name: String,
    /// Documents by key.
    #[serde(default)]
    pub docs: BTreeMap<String, Value>,
    /// Name of the primary index, if the keyspace has one.
    #[serde(default)]
    pub primary_index: Option<String>,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexFixture>,
}

/// One secondary index of a fixture.
#[derive(Clone, Debug, Deserialize)]
pub struct IndexFixture {
    /// Index name.
    pub name: String,
    /// Keys, relative to the keyspace (`a.b`, not `alias.a.b`).
    pub keys: Vec<Expr>,
    /// Partial-index condition.
    #[serde(default)]
    pub condition: Option<Expr>,
    /// Lifecycle state; online when omitted.
    #[serde(default)]
    pub state: Option<IndexState>,
}

impl Fixture {
    /// Parses a fixture from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads and parses a fixture file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| QueryError::Io(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Builds the in-memory datastore the fixture describes.
    pub fn datastore(&self) -> Arc<MemoryDatastore> {
        let store = MemoryDatastore::new();
        for entry in &self.keyspaces {
            let keyspace = store.create_keyspace(&entry.name);
            for (key, doc) in &entry.docs {
                keyspace.insert(key.clone(), doc.clone());
            }
            if let Some(primary) = &entry.primary_index {
                keyspace.create_primary_index(primary);
            }
            for index in &entry.indexes {
                let created =
                    keyspace.create_index(&index.name, index.keys.clone(), index.condition.clone());
                if let Some(state) = index.state {
                    created.set_state(state);
                }
            }
            debug!(
                keyspace = %entry.name,
                docs = entry.docs.len(),
                indexes = entry.indexes.len(),
                "cli.fixture.keyspace"
            );
        }
        store
    }

    /// Effective engine settings: `explicit` wins over the fixture's own.
    pub fn engine_config(&self, explicit: Option<&EngineConfig>) -> Result<EngineConfig> {
        let config = explicit
            .or(self.config.as_ref())
            .cloned()
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }
}

/// Plans the fixture's query.
pub fn explain(fixture: &Fixture, config: &EngineConfig) -> Result<PlannerOutput> {
    let store: Arc<dyn Datastore> = fixture.datastore();
    Planner::new(config.planner(), store).plan(&fixture.query)
}

/// Plans and runs the fixture's query to completion.
pub async fn run(fixture: &Fixture, config: &EngineConfig) -> Result<RunOutput> {
    let store: Arc<dyn Datastore> = fixture.datastore();
    let planned = Planner::new(config.planner(), store).plan(&fixture.query)?;
    let executor = Executor::new(config.exec());
    let request_id = format!("cli-{:016x}", planned.plan_hash);
    let ctx = executor.context(&request_id);
    let result = executor.execute(&planned.plan, ctx).finish().await;
    info!(
        request_id = %request_id,
        status = %result.status,
        rows = result.rows.len(),
        "cli.run.done"
    );
    Ok(RunOutput { planned, result })
}

/// Plan and outcome of [`run`].
#[derive(Debug)]
pub struct RunOutput {
    /// Plan that was executed.
    pub planned: PlannerOutput,
    /// Rows and status.
    pub result: QueryResult,
}

impl RunOutput {
    /// Rows rendered as JSON objects.
    pub fn rows_json(&self) -> Vec<serde_json::Value> {
        self.result.rows.iter().map(|row| row.value().to_json()).collect()
    }

    /// End-of-request summary.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            status: self.result.status,
            rows: self.result.rows.len(),
            plan_hash: self.planned.plan_hash,
            errors: self
                .result
                .errors
                .iter()
                .map(|err| ErrorSummary {
                    code: err.code(),
                    message: err.to_string(),
                })
                .collect(),
            warnings: self.result.warnings.clone(),
            phases: self.result.phases.clone(),
        }
    }
}

/// Status line data printed after the rows.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    /// End-of-stream status.
    pub status: QueryStatus,
    /// Rows delivered.
    pub rows: usize,
    /// Hash of the executed plan.
    pub plan_hash: u64,
    /// Errors, fatal first.
    pub errors: Vec<ErrorSummary>,
    /// Warnings.
    pub warnings: Vec<String>,
    /// Phase counters.
    pub phases: PhaseSnapshot,
}

/// Error code and message.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorSummary {
    /// Stable error code.
    pub code: u32,
    /// Rendered message.
    pub message: String,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "status: {}", self.status)?;
        writeln!(f, "rows: {}", self.rows)?;
        writeln!(f, "plan_hash: {:016x}", self.plan_hash)?;
        for err in &self.errors {
            writeln!(f, "error[{}]: {}", err.code, err.message)?;
        }
        for warning in &self.warnings {
            writeln!(f, "warning: {warning}")?;
        }
        for (phase, totals) in &self.phases.phases {
            let name = serde_json::to_value(phase)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(|| format!("{phase:?}"));
            writeln!(
                f,
                "phase {name}: count={} time={}us",
                totals.count,
                totals.nanos / 1_000
            )?;
        }
        Ok(())
    }
}

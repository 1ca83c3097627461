//! Engine configuration shared by the planner and the executor.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::datastore::ScanConsistency;
use crate::types::{QueryError, Result};

/// Intersect scans track branch membership in a 64-bit mask.
pub const MAX_INTERSECT_SCANS: usize = 64;

/// Tunables for planning and execution.
///
/// Loaded from TOML with every field optional; missing fields fall back to
/// [`EngineConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on data-parallel replicas created by `Parallel` nodes.
    pub max_parallelism: usize,
    /// Capacity of every bounded operator channel.
    pub pipeline_cap: usize,
    /// Number of keys fetched per datastore round trip.
    pub pipeline_batch: usize,
    /// Scan operators flush their phase counters after this many entries.
    pub phase_update_count: u64,
    /// Maximum number of branches in an intersect scan.
    pub max_intersect_scans: usize,
    /// Request deadline in milliseconds; `None` disables the watchdog.
    pub request_timeout_ms: Option<u64>,
    /// Default scan consistency for new requests.
    pub scan_consistency: ScanConsistency,
    /// Largest number of disjuncts produced when distributing AND over OR.
    pub dnf_max_terms: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_parallelism(),
            pipeline_cap: 512,
            pipeline_batch: 16,
            phase_update_count: 100,
            max_intersect_scans: MAX_INTERSECT_SCANS,
            request_timeout_ms: None,
            scan_consistency: ScanConsistency::NotBounded,
            dnf_max_terms: 64,
        }
    }
}

impl EngineConfig {
    /// Small pipelines and a short deadline for interactive requests.
    pub fn interactive() -> Self {
        Self {
            max_parallelism: default_parallelism().min(4),
            pipeline_cap: 64,
            pipeline_batch: 16,
            phase_update_count: 64,
            request_timeout_ms: Some(30_000),
            ..Self::default()
        }
    }

    /// Deep pipelines and no deadline for long-running scans.
    pub fn analytics() -> Self {
        Self {
            max_parallelism: default_parallelism(),
            pipeline_cap: 4096,
            pipeline_batch: 256,
            phase_update_count: 1024,
            request_timeout_ms: None,
            ..Self::default()
        }
    }

    /// Parses a TOML document and validates the result.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|err| QueryError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            return Err(QueryError::Config("max_parallelism must be > 0".into()));
        }
        if self.pipeline_cap == 0 {
            return Err(QueryError::Config("pipeline_cap must be > 0".into()));
        }
        if self.pipeline_batch == 0 {
            return Err(QueryError::Config("pipeline_batch must be > 0".into()));
        }
        if self.phase_update_count == 0 {
            return Err(QueryError::Config("phase_update_count must be > 0".into()));
        }
        if !(2..=MAX_INTERSECT_SCANS).contains(&self.max_intersect_scans) {
            return Err(QueryError::Config(format!(
                "max_intersect_scans must be within 2..={MAX_INTERSECT_SCANS}"
            )));
        }
        if self.dnf_max_terms == 0 {
            return Err(QueryError::Config("dnf_max_terms must be > 0".into()));
        }
        Ok(())
    }

    /// Planner view of the configuration.
    pub fn planner(&self) -> PlannerConfig {
        PlannerConfig {
            max_parallelism: self.max_parallelism,
            max_intersect_scans: self.max_intersect_scans,
            dnf_max_terms: self.dnf_max_terms,
        }
    }

    /// Executor view of the configuration.
    pub fn exec(&self) -> ExecConfig {
        ExecConfig {
            pipeline_cap: self.pipeline_cap,
            pipeline_batch: self.pipeline_batch,
            phase_update_count: self.phase_update_count,
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
            scan_consistency: self.scan_consistency,
        }
    }
}

/// Planner inputs that influence rule selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Replica count for `Parallel` nodes when no order index is chosen.
    pub max_parallelism: usize,
    /// Maximum number of intersect branches.
    pub max_intersect_scans: usize,
    /// DNF expansion limit.
    pub dnf_max_terms: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        EngineConfig::default().planner()
    }
}

impl PlannerConfig {
    /// Effective intersect branch limit, capped at [`MAX_INTERSECT_SCANS`].
    pub fn intersect_limit(&self) -> usize {
        self.max_intersect_scans.min(MAX_INTERSECT_SCANS)
    }
}

/// Executor inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecConfig {
    /// Bounded channel capacity.
    pub pipeline_cap: usize,
    /// Fetch batch size.
    pub pipeline_batch: usize,
    /// Phase-count flush threshold for scans.
    pub phase_update_count: u64,
    /// Request deadline.
    pub request_timeout: Option<Duration>,
    /// Scan consistency for new contexts.
    pub scan_consistency: ScanConsistency,
}

impl Default for ExecConfig {
    fn default() -> Self {
        EngineConfig::default().exec()
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#![forbid(unsafe_code)]

use thiserror::Error;

/// Structured errors emitted by the planner.
///
/// A planning error is fatal to plan compilation: no partial plan is ever
/// handed to the executor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The keyspace has no primary index and no secondary index applies.
    #[error("No primary index on keyspace {keyspace}. Use CREATE PRIMARY INDEX to create one.")]
    NoPrimaryIndex {
        /// Keyspace name.
        keyspace: String,
    },
    /// A primary index exists but is not online.
    #[error("Primary index {index} not online.")]
    PrimaryIndexOffline {
        /// Index name.
        index: String,
    },
    /// An index advertised as primary does not expose primary scans.
    #[error("Unable to cast index {index} to primary index")]
    IndexCast {
        /// Index name.
        index: String,
    },
    /// Span derivation produced nothing for an index that passed sargability.
    #[error("Sargable index {index} not sarged")]
    SargableNotSarged {
        /// Index name.
        index: String,
    },
    /// No index can drive the right-hand side of an ANSI NEST.
    #[error("No index available for ANSI NEST term {alias}")]
    NoIndexForNest {
        /// Alias of the nested keyspace term.
        alias: String,
    },
    /// The datastore does not know the keyspace.
    #[error("Keyspace not found: {keyspace}")]
    UnknownKeyspace {
        /// Keyspace name.
        keyspace: String,
    },
    /// Two keyspace terms share an alias.
    #[error("Duplicate keyspace alias {alias}")]
    DuplicateAlias {
        /// Repeated alias.
        alias: String,
    },
    /// An intersection would combine more scans than the executor supports.
    #[error("intersect scan exceeds {max} branches (got {count})")]
    TooManyIntersectScans {
        /// Number of candidate scans.
        count: usize,
        /// Supported maximum.
        max: usize,
    },
    /// Listing indexes or reading index state failed.
    #[error("index metadata for {keyspace} unavailable: {reason}")]
    IndexMetadata {
        /// Keyspace name.
        keyspace: String,
        /// Datastore failure description.
        reason: String,
    },
    /// The query model is inconsistent.
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// What is wrong with the query.
        reason: String,
    },
}

impl PlanError {
    /// Stable numeric error code.
    pub fn code(&self) -> u32 {
        match self {
            PlanError::NoPrimaryIndex { .. } => 4000,
            PlanError::PrimaryIndexOffline { .. } => 4010,
            PlanError::IndexCast { .. } => 4020,
            PlanError::SargableNotSarged { .. } => 4030,
            PlanError::NoIndexForNest { .. } => 4040,
            PlanError::UnknownKeyspace { .. } => 4050,
            PlanError::DuplicateAlias { .. } => 4060,
            PlanError::TooManyIntersectScans { .. } => 4070,
            PlanError::IndexMetadata { .. } => 4080,
            PlanError::InvalidQuery { .. } => 4090,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        PlanError::InvalidQuery {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_object() {
        let err = PlanError::PrimaryIndexOffline {
            index: "#primary".into(),
        };
        assert_eq!(err.to_string(), "Primary index #primary not online.");
        let err = PlanError::IndexCast { index: "ix".into() };
        assert_eq!(err.to_string(), "Unable to cast index ix to primary index");
        assert_eq!(
            PlanError::NoIndexForNest { alias: "r".into() }.code(),
            4040
        );
    }
}

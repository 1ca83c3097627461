//! Query model consumed by the planner.
//!
//! Parsing is out of scope: callers (and fixtures) build these structures
//! directly or through [`QueryBuilder`](crate::query::QueryBuilder). Field
//! references are written fully qualified (`p.a`, `META(p).id`).

use serde::{Deserialize, Serialize};

use crate::query::aggregate::AggFunc;
use crate::query::expr::Expr;

/// `keyspace AS alias`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyspaceTerm {
    /// Keyspace name.
    pub keyspace: String,
    /// Alias used by expressions; defaults to the keyspace name.
    pub alias: String,
}

impl KeyspaceTerm {
    /// Term aliased as `alias`.
    pub fn new(keyspace: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            alias: alias.into(),
        }
    }
}

/// `[LEFT OUTER | INNER] NEST right ON condition`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NestClause {
    /// Nested keyspace.
    pub right: KeyspaceTerm,
    /// ON clause; may reference the left aliases and the nested alias.
    pub on: Expr,
    /// Keep left rows without matches (with an empty array).
    #[serde(default)]
    pub outer: bool,
}

/// One aggregate in the select list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateTerm {
    /// Function.
    pub func: AggFunc,
    /// Argument; `None` means `COUNT(*)`.
    #[serde(default)]
    pub operand: Option<Expr>,
    /// Name under which the result is referenced by `Expr::Aggregate`.
    pub alias: String,
}

/// `GROUP BY` keys plus the aggregates computed per group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupClause {
    /// Group keys; empty for a single global group.
    #[serde(default)]
    pub keys: Vec<Expr>,
    /// Aggregates.
    #[serde(default)]
    pub aggregates: Vec<AggregateTerm>,
}

/// `ORDER BY` term.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderTerm {
    /// Sort expression.
    pub expr: Expr,
    /// Descending order.
    #[serde(default)]
    pub descending: bool,
}

/// Projected column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultTerm {
    /// Projected expression.
    pub expr: Expr,
    /// Output field name.
    pub alias: String,
}

/// `SELECT` statement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    /// Driving keyspace.
    pub from: KeyspaceTerm,
    /// ANSI NEST clauses, applied in order.
    #[serde(default)]
    pub nests: Vec<NestClause>,
    /// WHERE clause.
    #[serde(default, rename = "where")]
    pub filter: Option<Expr>,
    /// GROUP BY clause, also present for aggregates without keys.
    #[serde(default)]
    pub group: Option<GroupClause>,
    /// ORDER BY terms.
    #[serde(default)]
    pub order: Vec<OrderTerm>,
    /// OFFSET.
    #[serde(default)]
    pub offset: Option<u64>,
    /// LIMIT.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Select list; empty means `SELECT *`.
    #[serde(default)]
    pub projection: Vec<ResultTerm>,
}

impl SelectQuery {
    /// Query returning every document of `from`.
    pub fn new(from: KeyspaceTerm) -> Self {
        Self {
            from,
            nests: Vec::new(),
            filter: None,
            group: None,
            order: Vec::new(),
            offset: None,
            limit: None,
            projection: Vec::new(),
        }
    }

    /// Aliases in scope, driving term first.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.from.alias.as_str())
            .chain(self.nests.iter().map(|n| n.right.alias.as_str()))
    }

    /// True when any nest drops unmatched rows.
    pub fn has_inner_nest(&self) -> bool {
        self.nests.iter().any(|n| !n.outer)
    }
}

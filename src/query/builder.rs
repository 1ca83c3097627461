//! Fluent construction of [`SelectQuery`] values.

use rustc_hash::FxHashSet;

use crate::query::aggregate::AggFunc;
use crate::query::ast::{
    AggregateTerm, GroupClause, KeyspaceTerm, NestClause, OrderTerm, ResultTerm, SelectQuery,
};
use crate::query::errors::PlanError;
use crate::query::expr::Expr;
use crate::types::Result;

/// Fluent builder; validation errors surface from [`build`](Self::build).
#[derive(Debug)]
pub struct QueryBuilder {
    query: SelectQuery,
    filters: Vec<Expr>,
    error: Option<PlanError>,
}

impl QueryBuilder {
    /// `SELECT ... FROM keyspace AS alias`
    pub fn select_from(keyspace: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            query: SelectQuery::new(KeyspaceTerm::new(keyspace, alias)),
            filters: Vec::new(),
            error: None,
        }
    }

    /// Adds a WHERE conjunct.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filters.push(expr);
        self
    }

    /// `LEFT OUTER NEST keyspace AS alias ON on`
    pub fn outer_nest(self, keyspace: impl Into<String>, alias: impl Into<String>, on: Expr) -> Self {
        self.nest(keyspace, alias, on, true)
    }

    /// `INNER NEST keyspace AS alias ON on`
    pub fn inner_nest(self, keyspace: impl Into<String>, alias: impl Into<String>, on: Expr) -> Self {
        self.nest(keyspace, alias, on, false)
    }

    fn nest(
        mut self,
        keyspace: impl Into<String>,
        alias: impl Into<String>,
        on: Expr,
        outer: bool,
    ) -> Self {
        self.query.nests.push(NestClause {
            right: KeyspaceTerm::new(keyspace, alias),
            on,
            outer,
        });
        self
    }

    /// Adds GROUP BY keys.
    pub fn group_by(mut self, keys: Vec<Expr>) -> Self {
        self.query
            .group
            .get_or_insert_with(GroupClause::default)
            .keys
            .extend(keys);
        self
    }

    /// Adds an aggregate named `alias`; `operand = None` is `COUNT(*)`.
    pub fn aggregate(mut self, func: AggFunc, operand: Option<Expr>, alias: impl Into<String>) -> Self {
        if operand.is_none() && func != AggFunc::Count {
            self.error.get_or_insert(PlanError::invalid(format!(
                "{func}(*) is not supported"
            )));
        }
        self.query
            .group
            .get_or_insert_with(GroupClause::default)
            .aggregates
            .push(AggregateTerm {
                func,
                operand,
                alias: alias.into(),
            });
        self
    }

    /// Adds an ORDER BY term.
    pub fn order_by(mut self, expr: Expr, descending: bool) -> Self {
        self.query.order.push(OrderTerm { expr, descending });
        self
    }

    /// OFFSET
    pub fn offset(mut self, offset: u64) -> Self {
        self.query.offset = Some(offset);
        self
    }

    /// LIMIT
    pub fn limit(mut self, limit: u64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// Adds a projected column.
    pub fn project(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.query.projection.push(ResultTerm {
            expr,
            alias: alias.into(),
        });
        self
    }

    /// Validates and returns the query.
    pub fn build(mut self) -> Result<SelectQuery> {
        if let Some(err) = self.error {
            return Err(err.into());
        }
        if !self.filters.is_empty() {
            self.query.filter = Some(Expr::and(self.filters));
        }
        validate(&self.query)?;
        Ok(self.query)
    }
}

/// Structural checks shared by the builder and the planner.
pub(crate) fn validate(query: &SelectQuery) -> Result<(), PlanError> {
    let mut aliases = FxHashSet::default();
    for term in std::iter::once(&query.from).chain(query.nests.iter().map(|n| &n.right)) {
        if term.keyspace.is_empty() || term.alias.is_empty() {
            return Err(PlanError::invalid("keyspace and alias must be non-empty"));
        }
        if !aliases.insert(term.alias.as_str()) {
            return Err(PlanError::DuplicateAlias {
                alias: term.alias.clone(),
            });
        }
    }
    if let Some(group) = &query.group {
        let mut names = FxHashSet::default();
        for agg in &group.aggregates {
            if !names.insert(agg.alias.as_str()) {
                return Err(PlanError::invalid(format!(
                    "aggregate alias {} used twice",
                    agg.alias
                )));
            }
        }
    }
    Ok(())
}

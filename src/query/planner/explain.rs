//! EXPLAIN trees and plan hashing.

use std::fmt;
use std::hash::Hasher;

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

use crate::query::physical::{PhysicalPlan, PlanNode};

/// Human-readable explain tree.
#[derive(Clone, Debug, Serialize)]
pub struct PlanExplain {
    /// Root node of the explain tree
    pub root: ExplainNode,
    /// Deterministic hash for the plan.
    pub plan_hash: u64,
}

/// Explain node representing an operator with optional metadata.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainNode {
    /// Operator name
    pub op: String,
    /// Additional properties describing the operator
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub props: Vec<ExplainProp>,
    /// Input operators
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Value of the first property named `key`.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Operator names in depth-first order.
    pub fn ops(&self) -> Vec<&str> {
        let mut out = vec![self.op.as_str()];
        for input in &self.inputs {
            out.extend(input.ops());
        }
        out
    }

    /// First node (depth-first) whose operator is `op`.
    pub fn find(&self, op: &str) -> Option<&ExplainNode> {
        if self.op == op {
            return Some(self);
        }
        self.inputs.iter().find_map(|i| i.find(op))
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}{}", "", self.op, indent = depth * 2)?;
        if !self.props.is_empty() {
            f.write_str(" {")?;
            for (i, prop) in self.props.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}: {}", prop.key, prop.value)?;
            }
            f.write_str("}")?;
        }
        writeln!(f)?;
        for input in &self.inputs {
            input.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for ExplainNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

/// Explain tree plus hash for a finished plan.
pub fn explain_plan(plan: &PhysicalPlan) -> PlanExplain {
    let root = build_explain_tree(&plan.root);
    let plan_hash = hash_explain(&root);
    PlanExplain { root, plan_hash }
}

fn build_explain_tree(node: &PlanNode) -> ExplainNode {
    let mut explain = ExplainNode::new(node.op_name());
    explain.props = op_props(node);
    explain.inputs = node
        .children()
        .into_iter()
        .map(|child| build_explain_tree(child))
        .collect();
    explain
}

fn opt(v: Option<u64>) -> Option<String> {
    v.map(|v| v.to_string())
}

fn op_props(node: &PlanNode) -> Vec<ExplainProp> {
    let mut props = Vec::new();
    match node {
        PlanNode::DummyScan => {}
        PlanNode::CountScan { term, aggregates } => {
            props.push(ExplainProp::plain("keyspace", term.keyspace.name()));
            props.push(ExplainProp::plain("aggregates", aggregates.join(", ")));
        }
        PlanNode::PrimaryScan(scan) => {
            props.push(ExplainProp::plain("index", scan.index_name.as_str()));
            props.push(ExplainProp::plain("keyspace", scan.term.keyspace.name()));
            props.push(ExplainProp::plain("alias", scan.term.alias.as_str()));
            if let Some(limit) = opt(scan.limit) {
                props.push(ExplainProp::literal("limit", limit));
            }
            if let Some(offset) = opt(scan.offset) {
                props.push(ExplainProp::literal("offset", offset));
            }
        }
        PlanNode::IndexScan(scan) => {
            props.push(ExplainProp::plain("index", scan.index.name()));
            props.push(ExplainProp::plain("keyspace", scan.term.keyspace.name()));
            props.push(ExplainProp::plain("alias", scan.term.alias.as_str()));
            props.push(ExplainProp::literal("spans", scan.spans.to_string()));
            props.push(ExplainProp::plain("exact", scan.spans.exact.to_string()));
            if scan.distinct {
                props.push(ExplainProp::plain("distinct", "true"));
            }
            if !scan.push_down.is_empty() {
                props.push(ExplainProp::plain("push_down", scan.push_down.to_string()));
            }
            if let Some(limit) = opt(scan.limit) {
                props.push(ExplainProp::literal("limit", limit));
            }
            if let Some(offset) = opt(scan.offset) {
                props.push(ExplainProp::literal("offset", offset));
            }
            if let Some(group) = &scan.group {
                props.push(ExplainProp::plain("group", group.group_keys.join(", ")));
            }
        }
        PlanNode::IntersectScan(multi)
        | PlanNode::OrderedIntersectScan(multi)
        | PlanNode::UnionScan(multi) => {
            props.push(ExplainProp::plain("branches", multi.scans.len().to_string()));
            if let Some(limit) = opt(multi.limit) {
                props.push(ExplainProp::literal("limit", limit));
            }
        }
        PlanNode::Fetch(fetch) => {
            props.push(ExplainProp::plain("keyspace", fetch.term.keyspace.name()));
            props.push(ExplainProp::plain("alias", fetch.term.alias.as_str()));
        }
        PlanNode::Filter { cond } => {
            props.push(ExplainProp::literal("condition", cond.to_string()));
        }
        PlanNode::AnsiNest(nest) => {
            props.push(ExplainProp::plain("alias", nest.alias.as_str()));
            props.push(ExplainProp::literal("on", nest.on.to_string()));
            props.push(ExplainProp::plain("outer", nest.outer.to_string()));
        }
        PlanNode::Nest(nest) => {
            props.push(ExplainProp::plain("keyspace", nest.term.keyspace.name()));
            props.push(ExplainProp::plain("alias", nest.term.alias.as_str()));
            props.push(ExplainProp::literal("keys", nest.keys.to_string()));
            props.push(ExplainProp::plain("outer", nest.outer.to_string()));
        }
        PlanNode::Group(group) => {
            let keys: Vec<String> = group.keys.iter().map(ToString::to_string).collect();
            props.push(ExplainProp::plain("keys", keys.join(", ")));
            let aggs: Vec<String> = group
                .aggregates
                .iter()
                .map(|a| match &a.operand {
                    Some(e) => format!("{}({e}) as {}", a.func, a.alias),
                    None => format!("{}(*) as {}", a.func, a.alias),
                })
                .collect();
            props.push(ExplainProp::plain("aggregates", aggs.join(", ")));
        }
        PlanNode::Order { terms } => {
            let terms: Vec<String> = terms
                .iter()
                .map(|t| {
                    if t.descending {
                        format!("{} desc", t.expr)
                    } else {
                        t.expr.to_string()
                    }
                })
                .collect();
            props.push(ExplainProp::plain("terms", terms.join(", ")));
        }
        PlanNode::Offset { offset } => {
            props.push(ExplainProp::literal("offset", offset.to_string()));
        }
        PlanNode::Limit { limit } => {
            props.push(ExplainProp::literal("limit", limit.to_string()));
        }
        PlanNode::Project { terms } => {
            let cols: Vec<String> = terms
                .iter()
                .map(|t| format!("{} as {}", t.expr, t.alias))
                .collect();
            props.push(ExplainProp::plain("columns", cols.join(", ")));
        }
        PlanNode::Sequence(_) => {}
        PlanNode::Parallel {
            max_parallelism, ..
        } => {
            props.push(ExplainProp::plain(
                "max_parallelism",
                max_parallelism.to_string(),
            ));
        }
    }
    props
}

fn hash_explain(root: &ExplainNode) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_explain_node(root, &mut hasher);
    hasher.finish()
}

fn hash_explain_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_explain_node(child, hasher);
    }
}

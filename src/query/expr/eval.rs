//! Expression evaluation with MISSING/NULL propagation.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use parking_lot::Mutex;
use regex::Regex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::{Binding, CmpOp, Expr, IsOp, Quantifier};
use crate::query::value::{AnnotatedValue, Value};
use crate::types::{QueryError, Result};

const LIKE_CACHE_LIMIT: usize = 256;

impl Expr {
    /// Evaluates the expression against `item`.
    pub fn evaluate(&self, item: &AnnotatedValue) -> Result<Value> {
        let mut env = Env {
            item,
            vars: SmallVec::new(),
        };
        env.eval(self)
    }

    /// Evaluates and applies filter truthiness.
    pub fn test(&self, item: &AnnotatedValue) -> Result<bool> {
        Ok(self.evaluate(item)?.truth())
    }
}

struct Env<'i, 'e> {
    item: &'i AnnotatedValue,
    /// Bound quantifier variables, innermost last.
    vars: SmallVec<[(&'e str, Value); 4]>,
}

impl<'i, 'e> Env<'i, 'e> {
    fn eval(&mut self, expr: &'e Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Identifier(name) => Ok(self.lookup(name)),
            Expr::Field(base, name) => Ok(self.eval(base)?.field(name)),
            Expr::Meta(alias) => Ok(match self.item.meta_for(alias) {
                Some(meta) => {
                    let mut obj = Value::empty_object();
                    obj.set_field("id", Value::from(meta.id.clone()));
                    obj
                }
                None => Value::Missing,
            }),
            Expr::Cmp(op, l, r) => {
                let l = self.eval(l)?;
                let r = self.eval(r)?;
                Ok(compare(*op, &l, &r))
            }
            Expr::Like(l, r) => {
                let l = self.eval(l)?;
                let r = self.eval(r)?;
                like(expr, &l, &r)
            }
            Expr::In(e, items) => {
                let v = self.eval(e)?;
                if v.is_unknown() {
                    return Ok(v);
                }
                let mut saw_null = false;
                for item in items {
                    let candidate = self.eval(item)?;
                    match candidate {
                        Value::Missing => {}
                        Value::Null => saw_null = true,
                        other if other == v => return Ok(Value::Bool(true)),
                        _ => {}
                    }
                }
                Ok(if saw_null {
                    Value::Null
                } else {
                    Value::Bool(false)
                })
            }
            Expr::Is(op, e) => {
                let v = self.eval(e)?;
                Ok(match op {
                    IsOp::Null if v.is_missing() => Value::Missing,
                    IsOp::Null => Value::Bool(matches!(v, Value::Null)),
                    IsOp::NotNull if v.is_missing() => Value::Missing,
                    IsOp::NotNull => Value::Bool(!matches!(v, Value::Null)),
                    IsOp::Missing => Value::Bool(v.is_missing()),
                    IsOp::NotMissing => Value::Bool(!v.is_missing()),
                    IsOp::Valued => Value::Bool(!v.is_unknown()),
                })
            }
            Expr::And(terms) => {
                let mut missing = false;
                let mut null = false;
                for t in terms {
                    match self.eval(t)? {
                        Value::Missing => missing = true,
                        Value::Null => null = true,
                        v if !v.truth() => return Ok(Value::Bool(false)),
                        _ => {}
                    }
                }
                Ok(if missing {
                    Value::Missing
                } else if null {
                    Value::Null
                } else {
                    Value::Bool(true)
                })
            }
            Expr::Or(terms) => {
                let mut missing = false;
                let mut null = false;
                for t in terms {
                    match self.eval(t)? {
                        Value::Missing => missing = true,
                        Value::Null => null = true,
                        v if v.truth() => return Ok(Value::Bool(true)),
                        _ => {}
                    }
                }
                Ok(if missing {
                    Value::Missing
                } else if null {
                    Value::Null
                } else {
                    Value::Bool(false)
                })
            }
            Expr::Not(e) => Ok(match self.eval(e)? {
                v @ (Value::Missing | Value::Null) => v,
                v => Value::Bool(!v.truth()),
            }),
            Expr::Quantified {
                quantifier,
                bindings,
                satisfies,
            } => self.quantified(*quantifier, bindings, satisfies),
            Expr::ArrayFor {
                distinct,
                mapping,
                bindings,
                when,
                ..
            } => self.array_for(*distinct, mapping, bindings, when.as_deref()),
            Expr::Aggregate(alias) => Ok(self
                .item
                .aggregate(alias)
                .cloned()
                .unwrap_or(Value::Missing)),
            Expr::Cover(text, inner) => match self.item.cover(text) {
                Some(v) => Ok(v.clone()),
                None => self.eval(inner),
            },
        }
    }

    fn lookup(&self, name: &str) -> Value {
        self.vars
            .iter()
            .rev()
            .find(|(var, _)| *var == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.item.field(name))
    }

    /// Evaluates binding collections. `Err(v)` carries the MISSING/NULL
    /// result when a collection is absent or not an array.
    fn collections(&mut self, bindings: &'e [Binding]) -> Result<Result<Vec<Vec<Value>>, Value>> {
        let mut out = Vec::with_capacity(bindings.len());
        for b in bindings {
            match self.eval(&b.expr)? {
                Value::Missing => return Ok(Err(Value::Missing)),
                Value::Array(items) => out.push(items),
                _ => return Ok(Err(Value::Null)),
            }
        }
        Ok(Ok(out))
    }

    fn quantified(
        &mut self,
        quantifier: Quantifier,
        bindings: &'e [Binding],
        satisfies: &'e Expr,
    ) -> Result<Value> {
        let colls = match self.collections(bindings)? {
            Ok(colls) => colls,
            Err(v) => return Ok(v),
        };
        let n = colls.iter().map(Vec::len).min().unwrap_or(0);
        if quantifier == Quantifier::AnyEvery && n == 0 {
            return Ok(Value::Bool(false));
        }
        for i in 0..n {
            let mark = self.vars.len();
            for (b, coll) in bindings.iter().zip(colls.iter()) {
                self.vars.push((b.var.as_str(), coll[i].clone()));
            }
            let ok = self.eval(satisfies)?.truth();
            self.vars.truncate(mark);
            match quantifier {
                Quantifier::Any if ok => return Ok(Value::Bool(true)),
                Quantifier::Every | Quantifier::AnyEvery if !ok => {
                    return Ok(Value::Bool(false))
                }
                _ => {}
            }
        }
        Ok(Value::Bool(quantifier != Quantifier::Any))
    }

    fn array_for(
        &mut self,
        distinct: bool,
        mapping: &'e Expr,
        bindings: &'e [Binding],
        when: Option<&'e Expr>,
    ) -> Result<Value> {
        let colls = match self.collections(bindings)? {
            Ok(colls) => colls,
            Err(v) => return Ok(v),
        };
        let n = colls.iter().map(Vec::len).min().unwrap_or(0);
        let mut out = Vec::with_capacity(n);
        let mut seen = BTreeSet::new();
        for i in 0..n {
            let mark = self.vars.len();
            for (b, coll) in bindings.iter().zip(colls.iter()) {
                self.vars.push((b.var.as_str(), coll[i].clone()));
            }
            let keep = match when {
                Some(cond) => self.eval(cond)?.truth(),
                None => true,
            };
            let mapped = if keep { Some(self.eval(mapping)?) } else { None };
            self.vars.truncate(mark);
            if let Some(v) = mapped {
                if v.is_missing() || (distinct && !seen.insert(v.clone())) {
                    continue;
                }
                out.push(v);
            }
        }
        Ok(Value::Array(out))
    }
}

/// Applies a comparison with MISSING ahead of NULL propagation.
pub(crate) fn compare(op: CmpOp, l: &Value, r: &Value) -> Value {
    if l.is_missing() || r.is_missing() {
        return Value::Missing;
    }
    if matches!(l, Value::Null) || matches!(r, Value::Null) {
        return Value::Null;
    }
    let ord = l.collate(r);
    Value::Bool(match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
    })
}

fn like(expr: &Expr, l: &Value, r: &Value) -> Result<Value> {
    if l.is_missing() || r.is_missing() {
        return Ok(Value::Missing);
    }
    let (Some(s), Some(pattern)) = (l.as_str(), r.as_str()) else {
        return Ok(Value::Null);
    };
    let re = like_regex(pattern).map_err(|err| QueryError::Evaluation {
        expr: expr.to_string(),
        reason: err.to_string(),
    })?;
    Ok(Value::Bool(re.is_match(s)))
}

fn like_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    static CACHE: OnceLock<Mutex<FxHashMap<String, Regex>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(FxHashMap::default()));
    if let Some(re) = cache.lock().get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(&like_to_regex(pattern))?;
    let mut guard = cache.lock();
    if guard.len() >= LIKE_CACHE_LIMIT {
        guard.clear();
    }
    guard.insert(pattern.to_owned(), re.clone());
    Ok(re)
}

/// Translates a LIKE pattern into an anchored regular expression.
///
/// `%` matches any run, `_` any single character; a backslash escapes the
/// next wildcard or backslash.
pub(crate) fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => out.push_str(&regex::escape(&next.to_string())),
                None => out.push_str(&regex::escape("\\")),
            },
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

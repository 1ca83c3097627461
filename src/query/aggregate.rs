//! Aggregate functions shared by the group operator and index push-down.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::value::Value;

/// Supported aggregate functions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    /// `COUNT(expr)`, or `COUNT(*)` without an operand.
    Count,
    /// `SUM(expr)`
    Sum,
    /// `MIN(expr)`
    Min,
    /// `MAX(expr)`
    Max,
    /// `AVG(expr)`
    Avg,
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Avg => "avg",
        })
    }
}

/// Running state of one aggregate.
#[derive(Clone, Debug, PartialEq)]
pub enum Accumulator {
    /// Row or value count.
    Count(u64),
    /// Numeric sum; `None` until a number is seen.
    Sum(Option<f64>),
    /// Smallest non-null value.
    Min(Option<Value>),
    /// Largest non-null value.
    Max(Option<Value>),
    /// Sum and count of numbers.
    Avg { sum: f64, n: u64 },
}

impl Accumulator {
    /// Empty accumulator for `func`.
    pub fn new(func: AggFunc) -> Self {
        match func {
            AggFunc::Count => Accumulator::Count(0),
            AggFunc::Sum => Accumulator::Sum(None),
            AggFunc::Min => Accumulator::Min(None),
            AggFunc::Max => Accumulator::Max(None),
            AggFunc::Avg => Accumulator::Avg { sum: 0.0, n: 0 },
        }
    }

    /// Folds one input. `None` stands for a `COUNT(*)` row.
    pub fn add(&mut self, input: Option<&Value>) {
        let Some(v) = input else {
            if let Accumulator::Count(n) = self {
                *n += 1;
            }
            return;
        };
        if v.is_unknown() {
            return;
        }
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(sum) => {
                if let Some(x) = v.as_f64() {
                    *sum = Some(sum.unwrap_or(0.0) + x);
                }
            }
            Accumulator::Min(min) => {
                if min.as_ref().map_or(true, |m| v < m) {
                    *min = Some(v.clone());
                }
            }
            Accumulator::Max(max) => {
                if max.as_ref().map_or(true, |m| v > m) {
                    *max = Some(v.clone());
                }
            }
            Accumulator::Avg { sum, n } => {
                if let Some(x) = v.as_f64() {
                    *sum += x;
                    *n += 1;
                }
            }
        }
    }

    /// Final value; empty inputs give NULL except for counts.
    pub fn finish(&self) -> Value {
        match self {
            Accumulator::Count(n) => Value::Number(*n as f64),
            Accumulator::Sum(sum) => sum.map(Value::Number).unwrap_or(Value::Null),
            Accumulator::Min(v) | Accumulator::Max(v) => v.clone().unwrap_or(Value::Null),
            Accumulator::Avg { sum, n } => {
                if *n == 0 {
                    Value::Null
                } else {
                    Value::Number(sum / *n as f64)
                }
            }
        }
    }
}

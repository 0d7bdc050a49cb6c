//! Typed boolean filter AST used by filter-scoped jobs.
//!
//! The job engine never interprets a filter against storage itself; it hands
//! the AST plus a target kind to the lexicon repository, which translates it
//! into a storage predicate. [`FilterExpr::matches`] evaluates the same AST
//! against a flat JSON record and backs in-memory lexicons.
//!
//! # Example
//!
//! ```
//! use lexmill_core::filter::{FilterExpr, FilterOp};
//! use serde_json::json;
//!
//! let filter = FilterExpr::and(vec![
//!     FilterExpr::field("pos", FilterOp::Eq, json!("noun")),
//!     FilterExpr::not(FilterExpr::field("flagged", FilterOp::Eq, json!(true))),
//! ]);
//!
//! let record = json!({"pos": "noun", "flagged": false});
//! assert!(filter.matches(record.as_object().unwrap()));
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Comparison operator of a field condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    /// Case-insensitive substring match.
    Contains,
    /// Case-insensitive prefix match.
    StartsWith,
    /// Value is an array; field must equal one of its members.
    In,
    Gt,
    Lt,
    IsNull,
    NotNull,
}

/// Boolean predicate over record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterExpr {
    /// All clauses must hold. Empty ⇒ true.
    And { clauses: Vec<FilterExpr> },
    /// At least one clause must hold. Empty ⇒ false.
    Or { clauses: Vec<FilterExpr> },
    Not { clause: Box<FilterExpr> },
    Field {
        field: String,
        op: FilterOp,
        #[serde(default)]
        value: JsonValue,
    },
}

impl FilterExpr {
    pub fn and(clauses: Vec<FilterExpr>) -> Self {
        FilterExpr::And { clauses }
    }

    pub fn or(clauses: Vec<FilterExpr>) -> Self {
        FilterExpr::Or { clauses }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(clause: FilterExpr) -> Self {
        FilterExpr::Not {
            clause: Box::new(clause),
        }
    }

    pub fn field(field: impl Into<String>, op: FilterOp, value: JsonValue) -> Self {
        FilterExpr::Field {
            field: field.into(),
            op,
            value,
        }
    }

    /// Every field name referenced anywhere in the expression.
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FilterExpr::And { clauses } | FilterExpr::Or { clauses } => {
                for c in clauses {
                    c.collect_fields(out);
                }
            }
            FilterExpr::Not { clause } => clause.collect_fields(out),
            FilterExpr::Field { field, .. } => {
                if !out.contains(&field.as_str()) {
                    out.push(field.as_str());
                }
            }
        }
    }

    /// Nesting depth (a single condition has depth 1).
    pub fn depth(&self) -> usize {
        match self {
            FilterExpr::And { clauses } | FilterExpr::Or { clauses } => {
                1 + clauses.iter().map(|c| c.depth()).max().unwrap_or(0)
            }
            FilterExpr::Not { clause } => 1 + clause.depth(),
            FilterExpr::Field { .. } => 1,
        }
    }

    /// Evaluate against a flat JSON record. Missing fields behave as null.
    pub fn matches(&self, record: &Map<String, JsonValue>) -> bool {
        match self {
            FilterExpr::And { clauses } => clauses.iter().all(|c| c.matches(record)),
            FilterExpr::Or { clauses } => clauses.iter().any(|c| c.matches(record)),
            FilterExpr::Not { clause } => !clause.matches(record),
            FilterExpr::Field { field, op, value } => {
                let actual = record.get(field).unwrap_or(&JsonValue::Null);
                eval_condition(actual, *op, value)
            }
        }
    }
}

fn eval_condition(actual: &JsonValue, op: FilterOp, expected: &JsonValue) -> bool {
    match op {
        FilterOp::IsNull => actual.is_null(),
        FilterOp::NotNull => !actual.is_null(),
        FilterOp::Eq => json_eq(actual, expected),
        FilterOp::Ne => !actual.is_null() && !json_eq(actual, expected),
        FilterOp::Contains => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(e)) => a.to_lowercase().contains(&e.to_lowercase()),
            _ => false,
        },
        FilterOp::StartsWith => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(e)) => a.to_lowercase().starts_with(&e.to_lowercase()),
            _ => false,
        },
        FilterOp::In => expected
            .as_array()
            .is_some_and(|vals| vals.iter().any(|v| json_eq(actual, v))),
        FilterOp::Gt => json_cmp(actual, expected) == Some(Ordering::Greater),
        FilterOp::Lt => json_cmp(actual, expected) == Some(Ordering::Less),
    }
}

fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn json_cmp(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

//! Translation of [`FilterExpr`] into parameterized SQL predicates.
//!
//! Only whitelisted columns of the target table can be referenced; field
//! names never reach the SQL text unless they map to a known column.

use serde_json::Value as JsonValue;

use lexmill_core::{defaults, Error, FilterExpr, FilterOp, Result, TargetKind};

use crate::escape_like;

/// Type-safe parameter binding for SQL queries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Int(i64),
    IntArray(Vec<i64>),
    Bool(bool),
    String(String),
    StringArray(Vec<String>),
}

/// Bind a slice of [`QueryParam`]s onto a query in order.
pub fn bind_params<'q>(
    mut q: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for param in params {
        q = match param {
            QueryParam::Int(v) => q.bind(v),
            QueryParam::IntArray(v) => q.bind(v),
            QueryParam::Bool(b) => q.bind(b),
            QueryParam::String(s) => q.bind(s),
            QueryParam::StringArray(arr) => q.bind(arr),
        };
    }
    q
}

/// Same as [`bind_params`] for scalar queries.
pub fn bind_scalar_params<'q, O>(
    mut q: sqlx::query::QueryScalar<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments>,
    params: &'q [QueryParam],
) -> sqlx::query::QueryScalar<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments> {
    for param in params {
        q = match param {
            QueryParam::Int(v) => q.bind(v),
            QueryParam::IntArray(v) => q.bind(v),
            QueryParam::Bool(b) => q.bind(b),
            QueryParam::String(s) => q.bind(s),
            QueryParam::StringArray(arr) => q.bind(arr),
        };
    }
    q
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Int,
    Text,
    Bool,
}

fn column_for(kind: TargetKind, field: &str) -> Option<(&'static str, ColumnType)> {
    use ColumnType::*;
    let col = match (kind, field) {
        (_, "id") => ("id", Int),
        (_, "code") => ("code", Text),
        (_, "flagged") => ("flagged", Bool),
        (_, "flagged_reason") => ("flagged_reason", Text),
        (TargetKind::Entry, "lemma" | "label") => ("lemma", Text),
        (TargetKind::Entry, "pos") => ("pos", Text),
        (TargetKind::Entry, "gloss") => ("gloss", Text),
        (TargetKind::Entry, "register") => ("register", Text),
        (TargetKind::Entry, "usage_note") => ("usage_note", Text),
        (TargetKind::Entry, "frequency") => ("frequency", Int),
        (TargetKind::Entry, "frame_id") => ("frame_id", Int),
        (TargetKind::Frame, "name" | "label") => ("name", Text),
        (TargetKind::Frame, "definition" | "gloss") => ("definition", Text),
        (TargetKind::Frame, "parent_id") => ("parent_id", Int),
        _ => return None,
    };
    Some(col)
}

/// Generates a SQL WHERE fragment from a filter AST.
///
/// # Example
///
/// ```
/// use lexmill_core::{FilterExpr, FilterOp, TargetKind};
/// use lexmill_db::filter::{FilterQueryBuilder, QueryParam};
/// use serde_json::json;
///
/// let filter = FilterExpr::field("pos", FilterOp::Eq, json!("noun"));
/// let (sql, params) = FilterQueryBuilder::new(TargetKind::Entry, "e", 0)
///     .build(&filter)
///     .unwrap();
/// assert_eq!(sql, "e.pos = $1");
/// assert_eq!(params, vec![QueryParam::String("noun".into())]);
/// ```
pub struct FilterQueryBuilder<'a> {
    kind: TargetKind,
    alias: &'a str,
    param_offset: usize,
}

impl<'a> FilterQueryBuilder<'a> {
    /// Nesting deeper than this is rejected.
    pub const MAX_DEPTH: usize = defaults::MAX_FILTER_DEPTH;

    /// Upper bound on `in` list sizes.
    pub const MAX_IN_ELEMENTS: usize = 1000;

    /// `param_offset` is the number of parameters already bound before the fragment.
    pub fn new(kind: TargetKind, alias: &'a str, param_offset: usize) -> Self {
        Self {
            kind,
            alias,
            param_offset,
        }
    }

    pub fn build(&self, filter: &FilterExpr) -> Result<(String, Vec<QueryParam>)> {
        if filter.depth() > Self::MAX_DEPTH {
            return Err(Error::InvalidInput(format!(
                "filter nesting exceeds {} levels",
                Self::MAX_DEPTH
            )));
        }
        let mut params = Vec::new();
        let sql = self.translate(filter, &mut params)?;
        Ok((sql, params))
    }

    fn translate(&self, expr: &FilterExpr, params: &mut Vec<QueryParam>) -> Result<String> {
        match expr {
            FilterExpr::And { clauses } => self.join(clauses, " AND ", "TRUE", params),
            FilterExpr::Or { clauses } => self.join(clauses, " OR ", "FALSE", params),
            FilterExpr::Not { clause } => Ok(format!("NOT ({})", self.translate(clause, params)?)),
            FilterExpr::Field { field, op, value } => self.condition(field, *op, value, params),
        }
    }

    fn join(
        &self,
        clauses: &[FilterExpr],
        sep: &str,
        empty: &str,
        params: &mut Vec<QueryParam>,
    ) -> Result<String> {
        match clauses {
            [] => Ok(empty.to_string()),
            [only] => self.translate(only, params),
            many => {
                let parts = many
                    .iter()
                    .map(|c| self.translate(c, params))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(sep)))
            }
        }
    }

    fn condition(
        &self,
        field: &str,
        op: FilterOp,
        value: &JsonValue,
        params: &mut Vec<QueryParam>,
    ) -> Result<String> {
        let (col, ty) = column_for(self.kind, field).ok_or_else(|| {
            Error::InvalidInput(format!(
                "unknown filter field '{field}' for {}",
                self.kind.as_str()
            ))
        })?;
        let col = format!("{}.{}", self.alias, col);

        let sql = match op {
            FilterOp::IsNull => format!("{col} IS NULL"),
            FilterOp::NotNull => format!("{col} IS NOT NULL"),
            FilterOp::Eq if value.is_null() => format!("{col} IS NULL"),
            FilterOp::Eq => format!("{col} = {}", self.push(params, scalar(ty, value, field)?)),
            FilterOp::Ne => format!("{col} <> {}", self.push(params, scalar(ty, value, field)?)),
            FilterOp::Gt | FilterOp::Lt => {
                if ty == ColumnType::Bool {
                    return Err(Error::InvalidInput(format!(
                        "field '{field}' does not support ordering"
                    )));
                }
                let sym = if op == FilterOp::Gt { ">" } else { "<" };
                format!("{col} {sym} {}", self.push(params, scalar(ty, value, field)?))
            }
            FilterOp::Contains | FilterOp::StartsWith => {
                let needle = match (ty, value.as_str()) {
                    (ColumnType::Text, Some(s)) => escape_like(s),
                    _ => {
                        return Err(Error::InvalidInput(format!(
                            "'{field}' needs a text value for substring matching"
                        )))
                    }
                };
                let pattern = if op == FilterOp::Contains {
                    format!("%{needle}%")
                } else {
                    format!("{needle}%")
                };
                format!(
                    "{col} ILIKE {} ESCAPE '\\'",
                    self.push(params, QueryParam::String(pattern))
                )
            }
            FilterOp::In => {
                let items = value.as_array().ok_or_else(|| {
                    Error::InvalidInput(format!("'in' on '{field}' needs an array value"))
                })?;
                if items.is_empty() {
                    return Ok("FALSE".to_string());
                }
                if items.len() > Self::MAX_IN_ELEMENTS {
                    return Err(Error::InvalidInput(format!(
                        "'in' list on '{field}' exceeds {} elements",
                        Self::MAX_IN_ELEMENTS
                    )));
                }
                let param = match ty {
                    ColumnType::Int => QueryParam::IntArray(
                        items
                            .iter()
                            .map(|v| as_int(v, field))
                            .collect::<Result<Vec<_>>>()?,
                    ),
                    ColumnType::Text => QueryParam::StringArray(
                        items
                            .iter()
                            .map(|v| as_text(v, field))
                            .collect::<Result<Vec<_>>>()?,
                    ),
                    ColumnType::Bool => {
                        return Err(Error::InvalidInput(format!(
                            "'in' is not supported on boolean field '{field}'"
                        )))
                    }
                };
                format!("{col} = ANY({})", self.push(params, param))
            }
        };
        Ok(sql)
    }

    fn push(&self, params: &mut Vec<QueryParam>, param: QueryParam) -> String {
        params.push(param);
        format!("${}", self.param_offset + params.len())
    }
}

fn scalar(ty: ColumnType, value: &JsonValue, field: &str) -> Result<QueryParam> {
    match ty {
        ColumnType::Int => as_int(value, field).map(QueryParam::Int),
        ColumnType::Text => as_text(value, field).map(QueryParam::String),
        ColumnType::Bool => value
            .as_bool()
            .map(QueryParam::Bool)
            .ok_or_else(|| Error::InvalidInput(format!("'{field}' needs a boolean value"))),
    }
}

fn as_int(value: &JsonValue, field: &str) -> Result<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| Error::InvalidInput(format!("'{field}' needs an integer value")))
}

fn as_text(value: &JsonValue, field: &str) -> Result<String> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        _ => Err(Error::InvalidInput(format!("'{field}' needs a text value"))),
    }
}

//! Query model for entity stores.
//!
//! A [`QuerySpec`] is a conjunction of [`Criterion`]s plus sorting and
//! pagination. Field paths name either an entity header field (see
//! [`HEADER_FIELDS`]) or a dotted path into the serialized entity document.
//! Backends translate the spec to their own query language; this module also
//! provides the in-process evaluation used by the in-memory backend.

use core::cmp::Ordering;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::EntityState;
use crate::error::PersistenceError;

/// Field names resolved from [`EntityState`] instead of the document.
pub const HEADER_FIELDS: &[&str] = &[
    "id",
    "state",
    "state_count",
    "state_timestamp",
    "created_at",
    "updated_at",
    "error_detail",
];

pub const DEFAULT_LIMIT: usize = 50;

/// Comparison operator of a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "like")]
    Like,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
            Operator::Like => "like",
        }
    }
}

impl core::fmt::Display for Operator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Operator {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::Ne),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "in" => Ok(Operator::In),
            "like" => Ok(Operator::Like),
            other => Err(PersistenceError::invalid_query(format!(
                "unsupported operator '{other}'"
            ))),
        }
    }
}

/// Single filter predicate: `operand_left operator operand_right`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub operand_left: String,
    pub operator: Operator,
    pub operand_right: Value,
}

impl Criterion {
    pub fn new(operand_left: impl Into<String>, operator: Operator, operand_right: impl Into<Value>) -> Self {
        Self {
            operand_left: operand_left.into(),
            operator,
            operand_right: operand_right.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    pub fn one_of<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::new(field, Operator::In, Value::Array(values))
    }

    /// Reject shapes that cannot be evaluated (e.g. `in` without a list).
    pub fn validate(&self) -> Result<(), PersistenceError> {
        if self.operand_left.trim().is_empty() {
            return Err(PersistenceError::invalid_query("criterion has an empty field path"));
        }
        match (self.operator, &self.operand_right) {
            (Operator::In, Value::Array(_)) => Ok(()),
            (Operator::In, other) => Err(PersistenceError::invalid_query(format!(
                "'in' on {} requires a list, got {other}",
                self.operand_left
            ))),
            (Operator::Like, Value::String(_)) => Ok(()),
            (Operator::Like, other) => Err(PersistenceError::invalid_query(format!(
                "'like' on {} requires a string pattern, got {other}",
                self.operand_left
            ))),
            _ => Ok(()),
        }
    }

    /// Evaluate against an entity view. A path that does not resolve never matches.
    pub fn matches(&self, view: &FieldView<'_>) -> bool {
        let Some(left) = view.get(&self.operand_left) else {
            return false;
        };
        let right = &self.operand_right;
        match self.operator {
            Operator::Eq => values_equal(&left, right),
            Operator::Ne => !values_equal(&left, right),
            Operator::Lt => compare_values(&left, right) == Some(Ordering::Less),
            Operator::Le => matches!(
                compare_values(&left, right),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Gt => compare_values(&left, right) == Some(Ordering::Greater),
            Operator::Ge => matches!(
                compare_values(&left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::In => match right {
                Value::Array(options) => options.iter().any(|o| values_equal(&left, o)),
                _ => false,
            },
            Operator::Like => match (&left, right) {
                (Value::String(text), Value::String(pattern)) => like_matches(text, pattern),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filter, sort and paginate request for `find_all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default)]
    pub filter: Vec<Criterion>,
    #[serde(default)]
    pub sort_field: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            filter: Vec::new(),
            sort_field: None,
            sort_order: SortOrder::Asc,
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query without a page limit.
    pub fn unbounded() -> Self {
        Self {
            limit: usize::MAX,
            ..Self::default()
        }
    }

    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.filter.push(criterion);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), PersistenceError> {
        self.filter.iter().try_for_each(Criterion::validate)?;
        if let Some(field) = &self.sort_field {
            if field.trim().is_empty() {
                return Err(PersistenceError::invalid_query("sort field must not be empty"));
            }
        }
        Ok(())
    }

    pub fn matches(&self, view: &FieldView<'_>) -> bool {
        self.filter.iter().all(|c| c.matches(view))
    }
}

/// Read-only view of one entity for field resolution.
#[derive(Debug, Clone, Copy)]
pub struct FieldView<'a> {
    state: &'a EntityState,
    document: &'a Value,
}

impl<'a> FieldView<'a> {
    pub fn new(state: &'a EntityState, document: &'a Value) -> Self {
        Self { state, document }
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        if is_header_field(path) {
            return header_value(self.state, path);
        }
        document_path(self.document, path).cloned()
    }
}

pub fn is_header_field(path: &str) -> bool {
    HEADER_FIELDS.contains(&path)
}

fn header_value(state: &EntityState, field: &str) -> Option<Value> {
    match field {
        "id" => Some(Value::from(state.id.clone())),
        "state" => Some(Value::from(state.state)),
        "state_count" => Some(Value::from(state.state_count)),
        "state_timestamp" => Some(Value::from(state.state_timestamp)),
        "created_at" => Some(Value::from(state.created_at)),
        "updated_at" => Some(Value::from(state.updated_at)),
        "error_detail" => state.error_detail.clone().map(Value::from),
        _ => None,
    }
}

/// Resolve a dotted path (`a.b.0.c`) inside a JSON document.
pub fn document_path<'v>(document: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(document, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Order two JSON scalars of the same kind; mixed kinds are incomparable.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    compare_values(left, right) == Some(Ordering::Equal) || left == right
}

/// SQL-style `like`: `%` matches any run of characters, `_` exactly one.
pub fn like_matches(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '%')
}

/// Order two views by `field`; unresolved values sort last in either direction.
pub fn compare_by_field(a: &FieldView<'_>, b: &FieldView<'_>, field: &str, order: SortOrder) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(x), Some(y)) => {
            let ord = compare_values(&x, &y).unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

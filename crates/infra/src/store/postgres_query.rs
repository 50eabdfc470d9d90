//! Translation of [`Criterion`]s and sort keys into Postgres SQL.
//!
//! Header fields map to their columns; any other field path is extracted from
//! the `document` jsonb column with `#>`. Predicates are written so that a
//! value of the wrong kind or a missing path never matches, mirroring the
//! in-process evaluation.

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

use dataspace_core::{Criterion, Operator, SortOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Text,
    Integer,
}

impl ColumnKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ColumnKind::Text => value.is_string(),
            ColumnKind::Integer => value.is_number(),
        }
    }
}

fn header_column(field: &str) -> Option<ColumnKind> {
    match field {
        "id" | "error_detail" => Some(ColumnKind::Text),
        "state" | "state_count" | "state_timestamp" | "created_at" | "updated_at" => {
            Some(ColumnKind::Integer)
        }
        _ => None,
    }
}

fn sql_operator(operator: Operator) -> &'static str {
    match operator {
        Operator::Eq => "=",
        Operator::Ne => "<>",
        Operator::Lt => "<",
        Operator::Le => "<=",
        Operator::Gt => ">",
        Operator::Ge => ">=",
        Operator::In => "IN",
        Operator::Like => "LIKE",
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Append `AND <predicate>` for every criterion.
pub(crate) fn push_criteria(qb: &mut QueryBuilder<'_, Postgres>, criteria: &[Criterion], alias: &str) {
    for criterion in criteria {
        qb.push(" AND ");
        push_criterion(qb, criterion, alias);
    }
}

pub(crate) fn push_criterion(qb: &mut QueryBuilder<'_, Postgres>, criterion: &Criterion, alias: &str) {
    let field = criterion.operand_left.as_str();
    match header_column(field) {
        Some(kind) => push_column_predicate(qb, &format!("{alias}.{field}"), kind, criterion),
        None => push_document_predicate(qb, &format!("{alias}.document"), criterion),
    }
}

fn push_scalar(qb: &mut QueryBuilder<'_, Postgres>, kind: ColumnKind, value: &Value) {
    match (kind, value) {
        (ColumnKind::Text, Value::String(s)) => {
            qb.push_bind(s.clone());
        }
        (ColumnKind::Integer, Value::Number(n)) => match n.as_i64() {
            Some(i) => {
                qb.push_bind(i);
            }
            None => {
                qb.push_bind(n.as_f64().unwrap_or_default());
            }
        },
        _ => {
            qb.push("NULL");
        }
    }
}

fn push_column_predicate(
    qb: &mut QueryBuilder<'_, Postgres>,
    column: &str,
    kind: ColumnKind,
    criterion: &Criterion,
) {
    let right = &criterion.operand_right;
    match criterion.operator {
        Operator::In => {
            let options: Vec<&Value> = match right {
                Value::Array(values) => values.iter().filter(|v| kind.accepts(v)).collect(),
                _ => Vec::new(),
            };
            if options.is_empty() {
                qb.push("FALSE");
                return;
            }
            qb.push(column).push(" IN (");
            for (i, option) in options.into_iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_scalar(qb, kind, option);
            }
            qb.push(")");
        }
        Operator::Like => match (kind, right) {
            (ColumnKind::Text, Value::String(pattern)) => {
                qb.push(column).push(" LIKE ").push_bind(pattern.clone());
            }
            _ => {
                qb.push("FALSE");
            }
        },
        Operator::Ne if !kind.accepts(right) => {
            qb.push(column).push(" IS NOT NULL");
        }
        _ if !kind.accepts(right) => {
            qb.push("FALSE");
        }
        operator => {
            qb.push(column)
                .push(" ")
                .push(sql_operator(operator))
                .push(" ");
            push_scalar(qb, kind, right);
        }
    }
}

fn push_path(qb: &mut QueryBuilder<'_, Postgres>, document: &str, path: &[String]) {
    qb.push("(")
        .push(document)
        .push(" #> ")
        .push_bind(path.to_vec())
        .push("::text[])");
}

fn push_document_predicate(qb: &mut QueryBuilder<'_, Postgres>, document: &str, criterion: &Criterion) {
    let path = path_segments(&criterion.operand_left);
    let right = &criterion.operand_right;
    match criterion.operator {
        Operator::Eq | Operator::Ne => {
            push_path(qb, document, &path);
            qb.push(" ")
                .push(sql_operator(criterion.operator))
                .push(" ")
                .push_bind(right.clone());
        }
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
            qb.push("(jsonb_typeof");
            push_path(qb, document, &path);
            qb.push(" = ").push_bind(json_type(right)).push(" AND ");
            push_path(qb, document, &path);
            qb.push(" ")
                .push(sql_operator(criterion.operator))
                .push(" ")
                .push_bind(right.clone())
                .push(")");
        }
        Operator::In => {
            let options = match right {
                Value::Array(values) if !values.is_empty() => values.clone(),
                _ => {
                    qb.push("FALSE");
                    return;
                }
            };
            push_path(qb, document, &path);
            qb.push(" IN (");
            for (i, option) in options.into_iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push_bind(option);
            }
            qb.push(")");
        }
        Operator::Like => {
            let Value::String(pattern) = right else {
                qb.push("FALSE");
                return;
            };
            qb.push("(jsonb_typeof");
            push_path(qb, document, &path);
            qb.push(" = 'string' AND (")
                .push(document)
                .push(" #>> ")
                .push_bind(path.clone())
                .push("::text[]) LIKE ")
                .push_bind(pattern.clone())
                .push(")");
        }
    }
}

/// Append `ORDER BY`; missing values sort last and `id` breaks ties.
pub(crate) fn push_order(
    qb: &mut QueryBuilder<'_, Postgres>,
    sort_field: Option<&str>,
    order: SortOrder,
    alias: &str,
) {
    qb.push(" ORDER BY ");
    if let Some(field) = sort_field {
        match header_column(field) {
            Some(_) => {
                qb.push(format!("{alias}.{field}"));
            }
            None => push_path(qb, &format!("{alias}.document"), &path_segments(field)),
        }
        qb.push(match order {
            SortOrder::Asc => " ASC NULLS LAST, ",
            SortOrder::Desc => " DESC NULLS LAST, ",
        });
    }
    qb.push(format!("{alias}.id ASC"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(criteria: &[Criterion]) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT e.document FROM entity e WHERE TRUE");
        push_criteria(&mut qb, criteria, "e");
        qb.sql().to_string()
    }

    #[test]
    fn header_fields_use_columns() {
        let sql = render(&[
            Criterion::eq("state", 100),
            Criterion::new("id", Operator::Like, "n-%"),
        ]);
        assert!(sql.contains("e.state = $1"));
        assert!(sql.contains("e.id LIKE $2"));
    }

    #[test]
    fn document_paths_use_jsonb_extraction() {
        let sql = render(&[Criterion::eq("counter_party.id", "provider-7")]);
        assert!(sql.contains("(e.document #> $1::text[]) = $2"));
    }

    #[test]
    fn ordering_checks_json_type() {
        let sql = render(&[Criterion::new("amount", Operator::Gt, json!(10))]);
        assert!(sql.contains("jsonb_typeof(e.document #> $1::text[]) = $2"));
        assert!(sql.contains("> $4"));
    }

    #[test]
    fn kind_mismatches_never_match() {
        assert!(render(&[Criterion::eq("state", "REQUESTED")]).ends_with("AND FALSE"));
        assert!(render(&[Criterion::one_of("state", Vec::<i32>::new())]).ends_with("AND FALSE"));
        assert!(render(&[Criterion::new("state", Operator::Ne, "x")]).ends_with("e.state IS NOT NULL"));
    }

    #[test]
    fn in_lists_bind_each_value() {
        let sql = render(&[Criterion::one_of("state", [100, 200, 300])]);
        assert!(sql.ends_with("e.state IN ($1, $2, $3)"));
    }

    #[test]
    fn order_appends_id_tiebreak() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM entity e");
        push_order(&mut qb, Some("state_timestamp"), SortOrder::Desc, "e");
        assert!(qb.sql().ends_with("ORDER BY e.state_timestamp DESC NULLS LAST, e.id ASC"));

        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM entity e");
        push_order(&mut qb, None, SortOrder::Asc, "e");
        assert!(qb.sql().ends_with("ORDER BY e.id ASC"));
    }
}

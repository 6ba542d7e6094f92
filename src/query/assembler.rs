//! SQL assembler: turns a [`QueryState`] plus a target [`Dialect`] into SQL
//! text and positional parameters (spec.md §4.10).

use crate::adapter::{Dialect, LockMode};
use crate::error::{OrmError, OrmResult};
use crate::query::state::{Aggregate, GroupOp, OrderDirection, QueryState, Term};
use crate::value::Value;

pub struct Assembled {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Assembles a `SELECT` for `query` against `table`, quoting identifiers
/// and emitting lock syntax for `dialect`. The caller supplies the table
/// name because `QueryState.model` is a model identifier, not necessarily
/// the table name (that mapping lives in `ModelDescriptor`).
pub fn assemble_select(query: &QueryState, table: &str, dialect: Dialect) -> OrmResult<Assembled> {
    let mut params = Vec::new();
    let select_list = assemble_select_list(query, dialect);
    let mut sql = format!("SELECT {} FROM {}", select_list, dialect.quote_identifier(table));

    let where_clause = assemble_term(&query.predicate, dialect, &mut params)?;
    if !where_clause.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause);
    }

    if !query.group_by.is_empty() {
        let cols: Vec<String> = query.group_by.iter().map(|c| dialect.quote_identifier(c)).collect();
        sql.push_str(" GROUP BY ");
        sql.push_str(&cols.join(", "));
    }

    if !query.order.is_empty() {
        let terms: Vec<String> = query
            .order
            .iter()
            .map(|t| {
                let dir = match t.direction {
                    OrderDirection::Asc => "ASC",
                    OrderDirection::Desc => "DESC",
                };
                format!("{} {}", dialect.quote_identifier(&t.column), dir)
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
    }

    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = query.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    if let Some(mode) = query.lock {
        let suffix = dialect.emit_lock_suffix(mode)?;
        if !suffix.is_empty() {
            sql.push(' ');
            sql.push_str(&suffix);
        }
    }

    debug_assert_eq!(
        sql.matches('?').count(),
        params.len(),
        "assembled placeholder count must match bound parameter count"
    );

    Ok(Assembled { sql, params })
}

fn assemble_select_list(query: &QueryState, dialect: Dialect) -> String {
    let distinct = if query.distinct { "DISTINCT " } else { "" };
    match &query.aggregate {
        None => format!("{distinct}*"),
        Some(Aggregate::Count) => "COUNT(*)".to_string(),
        Some(Aggregate::Sum(col)) => format!("SUM({})", dialect.quote_identifier(col)),
        // avg is recomputed by the scatter-gather executor from sum+count,
        // so a single-adapter assembler still needs both.
        Some(Aggregate::Avg(col)) => format!(
            "SUM({0}) AS sum_value, COUNT({0}) AS count_value",
            dialect.quote_identifier(col)
        ),
        Some(Aggregate::Min(col)) => format!("MIN({})", dialect.quote_identifier(col)),
        Some(Aggregate::Max(col)) => format!("MAX({})", dialect.quote_identifier(col)),
    }
}

fn assemble_term(term: &Term, dialect: Dialect, params: &mut Vec<Value>) -> OrmResult<String> {
    Ok(match term {
        Term::Eq(col, v) => {
            params.push(v.clone());
            format!("{} = ?", dialect.quote_identifier(col))
        }
        Term::Neq(col, v) => {
            params.push(v.clone());
            format!("{} <> ?", dialect.quote_identifier(col))
        }
        Term::Gt(col, v) => {
            params.push(v.clone());
            format!("{} > ?", dialect.quote_identifier(col))
        }
        Term::Lt(col, v) => {
            params.push(v.clone());
            format!("{} < ?", dialect.quote_identifier(col))
        }
        Term::Gteq(col, v) => {
            params.push(v.clone());
            format!("{} >= ?", dialect.quote_identifier(col))
        }
        Term::Lteq(col, v) => {
            params.push(v.clone());
            format!("{} <= ?", dialect.quote_identifier(col))
        }
        Term::In(col, values) => {
            if values.is_empty() {
                "1 = 0".to_string()
            } else {
                let placeholders = vec!["?"; values.len()].join(", ");
                params.extend(values.iter().cloned());
                format!("{} IN ({})", dialect.quote_identifier(col), placeholders)
            }
        }
        Term::NotIn(col, values) => {
            if values.is_empty() {
                "1 = 1".to_string()
            } else {
                let placeholders = vec!["?"; values.len()].join(", ");
                params.extend(values.iter().cloned());
                format!("{} NOT IN ({})", dialect.quote_identifier(col), placeholders)
            }
        }
        Term::Like(col, pattern) => {
            params.push(Value::Text(pattern.clone()));
            format!("{} LIKE ?", dialect.quote_identifier(col))
        }
        Term::NotLike(col, pattern) => {
            params.push(Value::Text(pattern.clone()));
            format!("{} NOT LIKE ?", dialect.quote_identifier(col))
        }
        Term::Null(col) => format!("{} IS NULL", dialect.quote_identifier(col)),
        Term::NotNull(col) => format!("{} IS NOT NULL", dialect.quote_identifier(col)),
        Term::Between(col, lo, hi) => {
            params.push(lo.clone());
            params.push(hi.clone());
            format!("{} BETWEEN ? AND ?", dialect.quote_identifier(col))
        }
        Term::Exists(table, sub) | Term::NotExists(table, sub) => {
            let keyword = if matches!(term, Term::NotExists(..)) { "NOT EXISTS" } else { "EXISTS" };
            let assembled = assemble_select(sub, table, dialect)?;
            params.extend(assembled.params);
            format!("{keyword} ({})", assembled.sql)
        }
        Term::Group(op, terms) => {
            if terms.is_empty() {
                return Ok(match op {
                    GroupOp::Not => "1 = 0".to_string(),
                    _ => String::new(),
                });
            }
            let joined: Vec<String> = terms
                .iter()
                .map(|t| assemble_term(t, dialect, params))
                .collect::<OrmResult<_>>()?;
            let joined = joined.into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>();
            match op {
                GroupOp::And => format!("({})", joined.join(" AND ")),
                GroupOp::Or => format!("({})", joined.join(" OR ")),
                GroupOp::Not => format!("NOT ({})", joined.join(" AND ")),
            }
        }
        Term::Raw(fragment, raw_params) => {
            params.extend(raw_params.iter().cloned());
            fragment.clone()
        }
    })
}

/// Emits `LockMode` compatibility eagerly so callers get
/// `UnsupportedLockMode` without having to assemble a whole query.
pub fn check_lock_mode(dialect: Dialect, mode: LockMode) -> OrmResult<()> {
    if dialect.supports_lock_mode(mode) || matches!(dialect, Dialect::Sqlite) {
        Ok(())
    } else {
        Err(OrmError::UnsupportedLockMode {
            mode: format!("{mode:?}"),
            dialect: dialect.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::state::OrderDirection;

    #[test]
    fn basic_select_binds_positionally() {
        let q = QueryState::new("User").where_(Term::Eq("id".into(), Value::Int(1)));
        let assembled = assemble_select(&q, "users", Dialect::Postgres).unwrap();
        assert_eq!(assembled.sql, "SELECT * FROM \"users\" WHERE (\"id\" = ?)");
        assert_eq!(assembled.params, vec![Value::Int(1)]);
    }

    #[test]
    fn empty_in_is_constant_false() {
        let q = QueryState::new("User").where_(Term::In("id".into(), vec![]));
        let assembled = assemble_select(&q, "users", Dialect::Postgres).unwrap();
        assert!(assembled.sql.contains("1 = 0"));
        assert!(assembled.params.is_empty());
    }

    #[test]
    fn order_limit_offset_and_lock_compose() {
        let q = QueryState::new("User")
            .order_by("created_at", OrderDirection::Desc)
            .limit(10)
            .offset(5)
            .lock(LockMode::UpdateNoWait);
        let assembled = assemble_select(&q, "users", Dialect::Postgres).unwrap();
        assert!(assembled.sql.ends_with("ORDER BY \"created_at\" DESC LIMIT 10 OFFSET 5 FOR UPDATE NOWAIT"));
    }

    #[test]
    fn placeholder_count_matches_param_count() {
        let q = QueryState::new("User")
            .where_(Term::Between("age".into(), Value::Int(18), Value::Int(65)))
            .where_(Term::In("role".into(), vec![Value::Text("admin".into()), Value::Text("user".into())]));
        let assembled = assemble_select(&q, "users", Dialect::Postgres).unwrap();
        assert_eq!(assembled.sql.matches('?').count(), assembled.params.len());
    }

    #[test]
    fn exists_subquery_uses_the_resolved_table_not_the_model_name() {
        let sub = QueryState::new("OrderItem").where_(Term::Eq("order_id".into(), Value::Int(1)));
        let q = QueryState::new("Order").where_(Term::Exists("order_items".to_string(), Box::new(sub)));
        let assembled = assemble_select(&q, "orders", Dialect::Postgres).unwrap();
        assert!(assembled.sql.contains("EXISTS (SELECT * FROM \"order_items\""));
        assert!(!assembled.sql.contains("\"OrderItem\""));
    }

    #[test]
    fn not_exists_negates_the_keyword() {
        let sub = QueryState::new("OrderItem");
        let q = QueryState::new("Order").where_(Term::NotExists("order_items".to_string(), Box::new(sub)));
        let assembled = assemble_select(&q, "orders", Dialect::Postgres).unwrap();
        assert!(assembled.sql.contains("NOT EXISTS (SELECT * FROM \"order_items\""));
    }

    #[test]
    fn unsupported_lock_mode_raised_at_assembly_time() {
        let q = QueryState::new("User").lock(LockMode::UpdateSkipLocked);
        let err = assemble_select(&q, "users", Dialect::MySql).unwrap_err();
        assert!(matches!(err, OrmError::UnsupportedLockMode { .. }));
    }
}

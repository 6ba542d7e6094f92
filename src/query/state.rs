//! `QueryState`: a dialect-independent description of a query (spec.md
//! §4.10) — predicates, ordering, limit/offset, lock intent, eager list,
//! and optional aggregate. Scopes are plain `fn(QueryState) -> QueryState`;
//! chaining is ordinary method composition, never a generated per-model
//! type (spec.md §9).

use std::collections::HashMap;

use crate::adapter::LockMode;
use crate::query::AssociationPath;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderTerm {
    pub column: String,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone)]
pub enum Aggregate {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
}

/// A predicate term. `Group(And, [])` is the empty, always-true predicate
/// used as `QueryState`'s default.
#[derive(Debug, Clone)]
pub enum Term {
    Eq(String, Value),
    Neq(String, Value),
    Gt(String, Value),
    Lt(String, Value),
    Gteq(String, Value),
    Lteq(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    Like(String, String),
    NotLike(String, String),
    Null(String),
    NotNull(String),
    Between(String, Value, Value),
    /// `table` is the subquery's already-resolved table name, supplied by
    /// the caller the same way [`crate::query::assembler::assemble_select`]'s
    /// own `table` parameter is: `QueryState.model` is a model identifier,
    /// not necessarily a table name, and the assembler has no model
    /// registry of its own to resolve one.
    Exists(String, Box<QueryState>),
    NotExists(String, Box<QueryState>),
    Group(GroupOp, Vec<Term>),
    Raw(String, Vec<Value>),
}

impl Term {
    pub fn and(terms: Vec<Term>) -> Term {
        Term::Group(GroupOp::And, terms)
    }

    /// Whether this term (or any descendant, regardless of `And`/`Or`/`Not`
    /// nesting) is a `Raw` fragment — used to reject scatter-gather plans
    /// over raw SQL of unknown portability.
    pub fn contains_raw(&self) -> bool {
        match self {
            Term::Raw(..) => true,
            Term::Group(_, terms) => terms.iter().any(Term::contains_raw),
            Term::Exists(_, q) | Term::NotExists(_, q) => q.predicate.contains_raw(),
            _ => false,
        }
    }

    /// Shard-key bindings reachable through a chain of `And`-dominated
    /// terms only (spec.md §4.9: terms under `Or`/`Not` outside an
    /// `And`-dominated path do not count).
    fn collect_bindings(&self, shard_columns: &[String], bindings: &mut ShardBindings) {
        match self {
            Term::Eq(col, value) if shard_columns.iter().any(|c| c == col) => {
                bindings.equality.insert(col.clone(), value.clone());
            }
            Term::In(col, values) if shard_columns.iter().any(|c| c == col) => {
                bindings.in_sets.insert(col.clone(), values.clone());
            }
            Term::Group(GroupOp::And, terms) => {
                for term in terms {
                    term.collect_bindings(shard_columns, bindings);
                }
            }
            // Or/Not groups, and non-shard-key terms, contribute nothing.
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShardBindings {
    pub equality: HashMap<String, Value>,
    pub in_sets: HashMap<String, Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct QueryState {
    pub model: String,
    pub predicate: Term,
    pub order: Vec<OrderTerm>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub lock: Option<LockMode>,
    pub eager: Vec<AssociationPath>,
    pub aggregate: Option<Aggregate>,
    pub group_by: Vec<String>,
    pub distinct: bool,
    pub allow_partial: bool,
}

impl QueryState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            predicate: Term::and(Vec::new()),
            order: Vec::new(),
            limit: None,
            offset: None,
            lock: None,
            eager: Vec::new(),
            aggregate: None,
            group_by: Vec::new(),
            distinct: false,
            allow_partial: false,
        }
    }

    /// Conjoins `term` onto the existing predicate.
    pub fn where_(mut self, term: Term) -> Self {
        self.predicate = match self.predicate {
            Term::Group(GroupOp::And, mut terms) => {
                terms.push(term);
                Term::Group(GroupOp::And, terms)
            }
            other => Term::Group(GroupOp::And, vec![other, term]),
        };
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: OrderDirection) -> Self {
        self.order.push(OrderTerm {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = Some(mode);
        self
    }

    pub fn eager_load(mut self, path: impl Into<AssociationPath>) -> Self {
        self.eager.push(path.into());
        self
    }

    pub fn aggregate(mut self, agg: Aggregate) -> Self {
        self.aggregate = Some(agg);
        self
    }

    pub fn group_by(mut self, columns: Vec<String>) -> Self {
        self.group_by = columns;
        self
    }

    pub fn allow_partial(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }

    pub fn shard_bindings(&self, shard_columns: &[String]) -> ShardBindings {
        let mut bindings = ShardBindings::default();
        self.predicate.collect_bindings(shard_columns, &mut bindings);
        bindings
    }

    pub fn contains_raw(&self) -> bool {
        self.predicate.contains_raw()
    }

    pub fn is_write_aggregate_free(&self) -> bool {
        self.aggregate.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_conjoins_and_preserves_order() {
        let q = QueryState::new("User")
            .where_(Term::Eq("id".into(), Value::Int(1)))
            .where_(Term::Eq("active".into(), Value::Bool(true)));
        match q.predicate {
            Term::Group(GroupOp::And, terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected And group, got {other:?}"),
        }
    }

    #[test]
    fn or_dominated_equality_does_not_count_as_shard_binding() {
        let predicate = Term::Group(
            GroupOp::Or,
            vec![Term::Eq("tenant_id".into(), Value::Int(1)), Term::Eq("tenant_id".into(), Value::Int(2))],
        );
        let q = QueryState { predicate, ..QueryState::new("Order") };
        let bindings = q.shard_bindings(&["tenant_id".to_string()]);
        assert!(bindings.equality.is_empty());
    }

    #[test]
    fn and_dominated_equality_and_in_are_collected() {
        let q = QueryState::new("Order")
            .where_(Term::Eq("tenant_id".into(), Value::Int(7)))
            .where_(Term::In("region".into(), vec![Value::Text("us".into()), Value::Text("eu".into())]));
        let bindings = q.shard_bindings(&["tenant_id".to_string(), "region".to_string()]);
        assert_eq!(bindings.equality.get("tenant_id"), Some(&Value::Int(7)));
        assert_eq!(bindings.in_sets.get("region").unwrap().len(), 2);
    }

    #[test]
    fn raw_is_detected_anywhere_in_the_tree() {
        let q = QueryState::new("User").where_(Term::Group(GroupOp::Or, vec![Term::Raw("1=1".into(), vec![])]));
        assert!(q.contains_raw());
    }
}

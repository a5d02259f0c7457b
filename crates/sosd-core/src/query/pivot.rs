//! Pivot: one output column per distinct field name.
//!
//! Runs in two steps over the same snapshot: a DISTINCT lookup of the field
//! names, then a conditional-aggregate query built directly as a [`Select`]
//! with one `GROUP_CONCAT(CASE WHEN value_name = '<name>' THEN value END)`
//! column per name.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::QueryError;
use super::datum::Datum;
use super::exec::{self, Output};
use super::parser::{BinaryOp, Expr, OrderItem, Select, SelectItem};
use super::tables::Relation;
use crate::store::StoreSnapshot;

fn default_keys() -> Vec<String> {
    vec!["comm_rank".to_string(), "frame".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotRequest {
    /// Grouping columns of `viewCombined`.
    #[serde(default = "default_keys")]
    pub keys: Vec<String>,
    /// Regex over field names.
    #[serde(default)]
    pub value_filter: Option<String>,
    /// Regex over pub title or program name.
    #[serde(default)]
    pub pub_filter: Option<String>,
    /// Restrict to one frame.
    #[serde(default)]
    pub frame: Option<i64>,
}

impl Default for PivotRequest {
    fn default() -> Self {
        Self {
            keys: default_keys(),
            value_filter: None,
            pub_filter: None,
            frame: None,
        }
    }
}

impl PivotRequest {
    fn validate(&self) -> Result<(), QueryError> {
        if self.keys.is_empty() {
            return Err(QueryError::Execution("pivot needs at least one key".into()));
        }
        for key in &self.keys {
            if Relation::Combined.column_index(key).is_none() {
                return Err(QueryError::Execution(format!(
                    "no such pivot key: {key}"
                )));
            }
        }
        for re in [&self.value_filter, &self.pub_filter].into_iter().flatten() {
            regex::Regex::new(re)
                .map_err(|e| QueryError::Syntax(format!("invalid filter {re:?}: {e}")))?;
        }
        Ok(())
    }

    /// WHERE clause shared by the name lookup and the pivot itself.
    fn filter(&self) -> Option<Expr> {
        let mut terms = Vec::new();
        if let Some(frame) = self.frame {
            terms.push(Expr::binary(
                BinaryOp::Eq,
                Expr::column("frame"),
                Expr::Literal(Datum::Int(frame)),
            ));
        }
        if let Some(re) = self.pub_filter.as_deref().filter(|s| !s.is_empty()) {
            let by_title = regexp("title", re);
            let by_prog = regexp("prog_name", re);
            terms.push(Expr::Nested(Box::new(Expr::binary(
                BinaryOp::Or,
                by_title,
                by_prog,
            ))));
        }
        if let Some(re) = self.value_filter.as_deref().filter(|s| !s.is_empty()) {
            terms.push(regexp("value_name", re));
        }
        terms
            .into_iter()
            .reduce(|acc, t| Expr::binary(BinaryOp::And, acc, t))
    }

    /// `SELECT DISTINCT value_name ...` discovering the pivot columns.
    pub fn names_query(&self) -> Select {
        let mut select = Select::new(Relation::Combined.name());
        select.distinct = true;
        select.items = vec![SelectItem::Expr {
            expr: Expr::column("value_name"),
            alias: None,
        }];
        select.filter = self.filter();
        select.order_by = vec![OrderItem {
            expr: Expr::column("value_name"),
            descending: false,
        }];
        select
    }

    /// The conditional-aggregate query for a known set of field names.
    pub fn pivot_query(&self, names: &[String]) -> Select {
        let mut select = Select::new(Relation::Combined.name());
        select.items = self
            .keys
            .iter()
            .map(|k| SelectItem::Expr {
                expr: Expr::column(k.as_str()),
                alias: None,
            })
            .collect();
        for name in names {
            let case = Expr::Case {
                operand: None,
                branches: vec![(
                    Expr::binary(
                        BinaryOp::Eq,
                        Expr::column("value_name"),
                        Expr::text(name.as_str()),
                    ),
                    Expr::column("value"),
                )],
                otherwise: None,
            };
            select.items.push(SelectItem::Expr {
                expr: Expr::function("GROUP_CONCAT", vec![case]),
                alias: Some(name.clone()),
            });
        }
        select.filter = self.filter();
        select.group_by = self.keys.iter().map(|k| Expr::column(k.as_str())).collect();
        select.order_by = self
            .keys
            .iter()
            .map(|k| OrderItem {
                expr: Expr::column(k.as_str()),
                descending: false,
            })
            .collect();
        select
    }
}

fn regexp(column: &str, pattern: &str) -> Expr {
    Expr::Regexp {
        expr: Box::new(Expr::column(column)),
        pattern: Box::new(Expr::text(pattern)),
        negated: false,
    }
}

/// SQL text equivalent to the pivot for `names`, for display and logging.
pub fn pivot_sql(req: &PivotRequest, names: &[String]) -> String {
    req.pivot_query(names).to_string()
}

/// Run both pivot steps against one snapshot.
pub fn run(
    req: &PivotRequest,
    snapshot: &StoreSnapshot,
    cancel: &CancellationToken,
    max_rows: usize,
) -> Result<Output, QueryError> {
    req.validate()?;
    let names: Vec<String> = exec::execute(&req.names_query(), snapshot, cancel, 0)?
        .rows
        .into_iter()
        .filter_map(|mut row| match row.pop() {
            Some(Datum::Text(name)) => Some(name),
            _ => None,
        })
        .collect();
    exec::execute(&req.pivot_query(&names), snapshot, cancel, max_rows)
}

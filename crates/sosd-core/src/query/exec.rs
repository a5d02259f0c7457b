//! Query executor: binds a parsed [`Select`] to one relation and evaluates
//! it over a store snapshot.
//!
//! Evaluation follows SQLite conventions where telemetry clients can tell
//! the difference: three-valued logic, NULL-first ordering, case-insensitive
//! ASCII `LIKE`, integer arithmetic promoting to real on overflow, and bare
//! columns in aggregate queries taking their value from the group's last row.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::QueryError;
use super::datum::{Affinity, Datum, Number, SortKey};
use super::parser::{BinaryOp, Expr, Select, SelectItem, UnaryOp};
use super::tables::Relation;
use crate::store::StoreSnapshot;

/// Rows between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Typed result of one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Datum>>,
}

impl Output {
    pub fn render(&self) -> Vec<Vec<Option<String>>> {
        self.rows
            .iter()
            .map(|row| row.iter().map(Datum::render).collect())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarFn {
    Lower,
    Upper,
    Length,
    Abs,
    Coalesce,
    IfNull,
    Round,
    Min,
    Max,
    Typeof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggFn {
    Count,
    Sum,
    Total,
    Avg,
    Min,
    Max,
    GroupConcat,
}

#[derive(Debug, Clone)]
enum Bound {
    Literal(Datum),
    Column(usize),
    Aggregate(usize),
    Unary(UnaryOp, Box<Bound>),
    Binary(BinaryOp, Box<Bound>, Box<Bound>),
    IsNull(Box<Bound>, bool),
    InList(Box<Bound>, Vec<Bound>, bool),
    Between(Box<Bound>, Box<Bound>, Box<Bound>, bool),
    Like(Box<Bound>, Box<Bound>, bool),
    Regexp(Box<Bound>, Regex, bool),
    Case(Option<Box<Bound>>, Vec<(Bound, Bound)>, Option<Box<Bound>>),
    Scalar(ScalarFn, Vec<Bound>),
    Cast(Box<Bound>, Affinity),
}

impl Bound {
    fn is_constant(&self) -> bool {
        match self {
            Bound::Literal(_) => true,
            Bound::Column(_) | Bound::Aggregate(_) => false,
            Bound::Unary(_, e)
            | Bound::IsNull(e, _)
            | Bound::Regexp(e, _, _)
            | Bound::Cast(e, _) => e.is_constant(),
            Bound::Binary(_, l, r) | Bound::Like(l, r, _) => l.is_constant() && r.is_constant(),
            Bound::InList(e, list, _) => e.is_constant() && list.iter().all(Bound::is_constant),
            Bound::Between(e, l, h, _) => e.is_constant() && l.is_constant() && h.is_constant(),
            Bound::Case(op, branches, otherwise) => {
                op.as_ref().is_none_or(|e| e.is_constant())
                    && branches
                        .iter()
                        .all(|(w, t)| w.is_constant() && t.is_constant())
                    && otherwise.as_ref().is_none_or(|e| e.is_constant())
            }
            Bound::Scalar(_, args) => args.iter().all(Bound::is_constant),
        }
    }

    fn has_aggregate(&self) -> bool {
        match self {
            Bound::Aggregate(_) => true,
            Bound::Literal(_) | Bound::Column(_) => false,
            Bound::Unary(_, e)
            | Bound::IsNull(e, _)
            | Bound::Regexp(e, _, _)
            | Bound::Cast(e, _) => e.has_aggregate(),
            Bound::Binary(_, l, r) | Bound::Like(l, r, _) => l.has_aggregate() || r.has_aggregate(),
            Bound::InList(e, list, _) => {
                e.has_aggregate() || list.iter().any(Bound::has_aggregate)
            }
            Bound::Between(e, l, h, _) => {
                e.has_aggregate() || l.has_aggregate() || h.has_aggregate()
            }
            Bound::Case(op, branches, otherwise) => {
                op.as_ref().is_some_and(|e| e.has_aggregate())
                    || branches
                        .iter()
                        .any(|(w, t)| w.has_aggregate() || t.has_aggregate())
                    || otherwise.as_ref().is_some_and(|e| e.has_aggregate())
            }
            Bound::Scalar(_, args) => args.iter().any(Bound::has_aggregate),
        }
    }
}

#[derive(Debug, Clone)]
struct AggSpec {
    func: AggFn,
    /// `None` for `COUNT(*)`.
    arg: Option<Bound>,
    separator: Option<Bound>,
    distinct: bool,
}

#[derive(Debug, Clone)]
enum OrderKey {
    Output(usize),
    Expr(Bound),
}

struct Binder {
    relation: Relation,
    aggregates: Vec<AggSpec>,
}

impl Binder {
    fn new(relation: Relation) -> Self {
        Self {
            relation,
            aggregates: Vec::new(),
        }
    }

    fn bind(&mut self, expr: &Expr, allow_agg: bool) -> Result<Bound, QueryError> {
        let b = |e: &Expr, this: &mut Self| this.bind(e, allow_agg).map(Box::new);
        Ok(match expr {
            Expr::Literal(d) => Bound::Literal(d.clone()),
            Expr::Column { table, name } => {
                if let Some(t) = table
                    && !t.eq_ignore_ascii_case(self.relation.name())
                {
                    return Err(QueryError::Execution(format!(
                        "no such column: {t}.{name}"
                    )));
                }
                let idx = self
                    .relation
                    .column_index(name)
                    .ok_or_else(|| QueryError::Execution(format!("no such column: {name}")))?;
                Bound::Column(idx)
            }
            Expr::QuotedName(name) => match self.relation.column_index(name) {
                Some(idx) => Bound::Column(idx),
                None => Bound::Literal(Datum::Text(name.clone())),
            },
            Expr::Nested(e) => self.bind(e, allow_agg)?,
            Expr::Unary { op, expr } => Bound::Unary(*op, b(expr, self)?),
            Expr::Binary { op, left, right } => {
                Bound::Binary(*op, b(left, self)?, b(right, self)?)
            }
            Expr::IsNull { expr, negated } => Bound::IsNull(b(expr, self)?, *negated),
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let list = list
                    .iter()
                    .map(|e| self.bind(e, allow_agg))
                    .collect::<Result<Vec<_>, _>>()?;
                Bound::InList(b(expr, self)?, list, *negated)
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Bound::Between(b(expr, self)?, b(low, self)?, b(high, self)?, *negated),
            Expr::Like {
                expr,
                pattern,
                negated,
            } => Bound::Like(b(expr, self)?, b(pattern, self)?, *negated),
            Expr::Regexp {
                expr,
                pattern,
                negated,
            } => {
                let Expr::Literal(Datum::Text(pattern)) = pattern.as_ref() else {
                    return Err(QueryError::Execution(
                        "REGEXP pattern must be a string literal".into(),
                    ));
                };
                let re = Regex::new(pattern)
                    .map_err(|e| QueryError::Execution(format!("invalid REGEXP pattern: {e}")))?;
                Bound::Regexp(b(expr, self)?, re, *negated)
            }
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                let operand = operand.as_deref().map(|e| b(e, self)).transpose()?;
                let branches = branches
                    .iter()
                    .map(|(w, t)| Ok((self.bind(w, allow_agg)?, self.bind(t, allow_agg)?)))
                    .collect::<Result<Vec<_>, QueryError>>()?;
                let otherwise = otherwise.as_deref().map(|e| b(e, self)).transpose()?;
                Bound::Case(operand, branches, otherwise)
            }
            Expr::Cast { expr, type_name } => {
                Bound::Cast(b(expr, self)?, Affinity::from_type_name(type_name))
            }
            Expr::Function {
                name,
                args,
                distinct,
                star,
            } => self.bind_function(name, args, *distinct, *star, allow_agg)?,
        })
    }

    fn bind_function(
        &mut self,
        name: &str,
        args: &[Expr],
        distinct: bool,
        star: bool,
        allow_agg: bool,
    ) -> Result<Bound, QueryError> {
        let arity = |ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(QueryError::Execution(format!(
                    "wrong number of arguments to function {name}()"
                )))
            }
        };

        let agg = match name {
            "COUNT" => Some(AggFn::Count),
            "SUM" => Some(AggFn::Sum),
            "TOTAL" => Some(AggFn::Total),
            "AVG" => Some(AggFn::Avg),
            "MIN" if args.len() == 1 => Some(AggFn::Min),
            "MAX" if args.len() == 1 => Some(AggFn::Max),
            "GROUP_CONCAT" => Some(AggFn::GroupConcat),
            _ => None,
        };

        if let Some(func) = agg {
            if !allow_agg {
                return Err(QueryError::Execution(format!(
                    "misuse of aggregate function {name}()"
                )));
            }
            match func {
                AggFn::Count => arity(star || args.len() == 1)?,
                AggFn::GroupConcat => arity(!star && (args.len() == 1 || args.len() == 2))?,
                _ => arity(!star && args.len() == 1)?,
            }
            if distinct && args.len() != 1 {
                return Err(QueryError::Execution(format!(
                    "DISTINCT aggregates must have exactly one argument: {name}()"
                )));
            }
            let arg = args.first().map(|e| self.bind(e, false)).transpose()?;
            let separator = args.get(1).map(|e| self.bind(e, false)).transpose()?;
            self.aggregates.push(AggSpec {
                func,
                arg,
                separator,
                distinct,
            });
            return Ok(Bound::Aggregate(self.aggregates.len() - 1));
        }

        if star || distinct {
            return Err(QueryError::Execution(format!(
                "{name}() is not an aggregate function"
            )));
        }
        let func = match name {
            "LOWER" => ScalarFn::Lower,
            "UPPER" => ScalarFn::Upper,
            "LENGTH" => ScalarFn::Length,
            "ABS" => ScalarFn::Abs,
            "COALESCE" => ScalarFn::Coalesce,
            "IFNULL" => ScalarFn::IfNull,
            "ROUND" => ScalarFn::Round,
            "MIN" => ScalarFn::Min,
            "MAX" => ScalarFn::Max,
            "TYPEOF" => ScalarFn::Typeof,
            _ => return Err(QueryError::Execution(format!("no such function: {name}"))),
        };
        match func {
            ScalarFn::Lower
            | ScalarFn::Upper
            | ScalarFn::Length
            | ScalarFn::Abs
            | ScalarFn::Typeof => arity(args.len() == 1)?,
            ScalarFn::IfNull => arity(args.len() == 2)?,
            ScalarFn::Round => arity(args.len() == 1 || args.len() == 2)?,
            ScalarFn::Coalesce | ScalarFn::Min | ScalarFn::Max => arity(args.len() >= 2)?,
        }
        let args = args
            .iter()
            .map(|e| self.bind(e, allow_agg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Bound::Scalar(func, args))
    }
}

/// Execute `select` against `snapshot`.
///
/// `max_rows == 0` disables the result size guard.
pub fn execute(
    select: &Select,
    snapshot: &StoreSnapshot,
    cancel: &CancellationToken,
    max_rows: usize,
) -> Result<Output, QueryError> {
    let relation = Relation::lookup(&select.from)
        .ok_or_else(|| QueryError::Execution(format!("no such table: {}", select.from)))?;
    let mut binder = Binder::new(relation);

    let mut columns = Vec::new();
    let mut projections = Vec::new();
    for item in &select.items {
        match item {
            SelectItem::Wildcard => {
                for (idx, name) in relation.columns().iter().enumerate() {
                    columns.push((*name).to_string());
                    projections.push(Bound::Column(idx));
                }
            }
            SelectItem::Expr { expr, alias } => {
                columns.push(
                    alias
                        .clone()
                        .unwrap_or_else(|| column_label(expr, relation)),
                );
                projections.push(binder.bind(expr, true)?);
            }
        }
    }

    let filter = select
        .filter
        .as_ref()
        .map(|e| binder.bind(e, false))
        .transpose()?;

    let mut group_by = Vec::with_capacity(select.group_by.len());
    for expr in &select.group_by {
        let bound = match output_ref(expr, relation, &columns)? {
            Some(idx) => projections[idx].clone(),
            None => binder.bind(expr, false)?,
        };
        if bound.has_aggregate() {
            return Err(QueryError::Execution(
                "aggregate functions are not allowed in GROUP BY".into(),
            ));
        }
        group_by.push(bound);
    }

    let having = select
        .having
        .as_ref()
        .map(|e| binder.bind(e, true))
        .transpose()?;

    let mut order = Vec::with_capacity(select.order_by.len());
    for item in &select.order_by {
        let key = match output_ref(&item.expr, relation, &columns)? {
            Some(idx) => OrderKey::Output(idx),
            None => OrderKey::Expr(binder.bind(&item.expr, true)?),
        };
        order.push((key, item.descending));
    }

    let limit = select
        .limit
        .as_ref()
        .map(|e| constant_int(e, &mut binder, "LIMIT"))
        .transpose()?
        .filter(|n| *n >= 0)
        .map(|n| n as usize);
    let offset = select
        .offset
        .as_ref()
        .map(|e| constant_int(e, &mut binder, "OFFSET"))
        .transpose()?
        .map_or(0, |n| n.max(0) as usize);

    let aggregates = binder.aggregates;
    let is_aggregate = !group_by.is_empty() || !aggregates.is_empty();
    if having.is_some() && !is_aggregate {
        return Err(QueryError::Execution(
            "a GROUP BY clause is required before HAVING".into(),
        ));
    }

    let mut produced: Vec<(Vec<Datum>, Vec<Datum>)> = Vec::new();
    let order_keys = |out: &[Datum], row: &[Datum], aggs: &[Datum]| -> Vec<Datum> {
        order
            .iter()
            .map(|(key, _)| match key {
                OrderKey::Output(idx) => out[*idx].clone(),
                OrderKey::Expr(b) => eval(b, row, aggs),
            })
            .collect()
    };

    if is_aggregate {
        let width = relation.columns().len();
        let mut groups: BTreeMap<SortKey, Group> = BTreeMap::new();
        if group_by.is_empty() {
            groups.insert(SortKey(Vec::new()), Group::new(&aggregates, width));
        }

        for (n, row) in relation.rows(snapshot).enumerate() {
            check_cancel(n, cancel)?;
            if !passes(filter.as_ref(), &row) {
                continue;
            }
            let key = SortKey(group_by.iter().map(|g| eval(g, &row, &[])).collect());
            let group = groups
                .entry(key)
                .or_insert_with(|| Group::new(&aggregates, width));
            for (state, spec) in group.states.iter_mut().zip(&aggregates) {
                state.update(spec, &row);
            }
            group.last = row;
        }

        for group in groups.into_values() {
            let aggs: Vec<Datum> = group.states.into_iter().map(AggState::finish).collect();
            if let Some(h) = &having
                && eval(h, &group.last, &aggs).truth() != Some(true)
            {
                continue;
            }
            let out: Vec<Datum> = projections
                .iter()
                .map(|p| eval(p, &group.last, &aggs))
                .collect();
            let keys = order_keys(&out, &group.last, &aggs);
            produced.push((keys, out));
        }
    } else {
        // Without ORDER BY or DISTINCT, rows past the LIMIT are never needed.
        let stop_after = match (order.is_empty() && !select.distinct, limit) {
            (true, Some(limit)) => Some(offset.saturating_add(limit)),
            _ => None,
        };
        let guard_early = max_rows > 0 && limit.is_none() && !select.distinct;

        for (n, row) in relation.rows(snapshot).enumerate() {
            check_cancel(n, cancel)?;
            if stop_after.is_some_and(|stop| produced.len() >= stop) {
                break;
            }
            if !passes(filter.as_ref(), &row) {
                continue;
            }
            let out: Vec<Datum> = projections.iter().map(|p| eval(p, &row, &[])).collect();
            let keys = order_keys(&out, &row, &[]);
            produced.push((keys, out));
            if guard_early && produced.len().saturating_sub(offset) > max_rows {
                return Err(QueryError::TooLarge { limit: max_rows });
            }
        }
    }

    if select.distinct {
        let mut seen = BTreeSet::new();
        produced.retain(|(_, out)| seen.insert(SortKey(out.clone())));
    }

    if !order.is_empty() {
        produced.sort_by(|(a, _), (b, _)| {
            for ((x, y), (_, descending)) in a.iter().zip(b).zip(&order) {
                let ord = x.total_cmp(y);
                if ord != Ordering::Equal {
                    return if *descending { ord.reverse() } else { ord };
                }
            }
            Ordering::Equal
        });
    }

    let rows: Vec<Vec<Datum>> = produced
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .map(|(_, out)| out)
        .collect();

    if max_rows > 0 && rows.len() > max_rows {
        return Err(QueryError::TooLarge { limit: max_rows });
    }
    Ok(Output { columns, rows })
}

fn check_cancel(n: usize, cancel: &CancellationToken) -> Result<(), QueryError> {
    if n % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
        return Err(QueryError::Cancelled);
    }
    Ok(())
}

fn passes(filter: Option<&Bound>, row: &[Datum]) -> bool {
    filter.is_none_or(|f| eval(f, row, &[]).truth() == Some(true))
}

/// Output column label for an unaliased expression.
fn column_label(expr: &Expr, relation: Relation) -> String {
    match expr {
        Expr::Column { name, .. } => relation
            .columns()
            .iter()
            .find(|c| c.eq_ignore_ascii_case(name))
            .map_or_else(|| name.clone(), |c| (*c).to_string()),
        Expr::QuotedName(name) => name.clone(),
        other => other.to_string(),
    }
}

/// Resolve ORDER BY / GROUP BY terms that name an output column: a 1-based
/// position, or an alias that is not also a table column.
fn output_ref(
    expr: &Expr,
    relation: Relation,
    columns: &[String],
) -> Result<Option<usize>, QueryError> {
    match expr {
        Expr::Literal(Datum::Int(pos)) => {
            let idx = usize::try_from(*pos)
                .ok()
                .and_then(|p| p.checked_sub(1))
                .filter(|idx| *idx < columns.len())
                .ok_or_else(|| {
                    QueryError::Execution(format!("term out of range: position {pos}"))
                })?;
            Ok(Some(idx))
        }
        Expr::Column { table: None, name } | Expr::QuotedName(name)
            if relation.column_index(name).is_none() =>
        {
            Ok(columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
        }
        _ => Ok(None),
    }
}

fn constant_int(expr: &Expr, binder: &mut Binder, clause: &str) -> Result<i64, QueryError> {
    let bound = binder.bind(expr, false)?;
    if !bound.is_constant() {
        return Err(QueryError::Execution(format!(
            "{clause} must be a constant expression"
        )));
    }
    match eval(&bound, &[], &[]).as_number() {
        Some(Number::Int(n)) => Ok(n),
        Some(Number::Real(r)) if r.fract() == 0.0 => Ok(r as i64),
        _ => Err(QueryError::Execution(format!(
            "{clause} must be an integer"
        ))),
    }
}

struct Group {
    states: Vec<AggState>,
    last: Vec<Datum>,
}

impl Group {
    fn new(specs: &[AggSpec], width: usize) -> Self {
        Self {
            states: specs.iter().map(AggState::new).collect(),
            last: vec![Datum::Null; width],
        }
    }
}

#[derive(Debug)]
enum Acc {
    Count(i64),
    Sum {
        int: i64,
        real: f64,
        is_real: bool,
        any: bool,
    },
    Avg {
        sum: f64,
        n: i64,
    },
    Min(Option<Datum>),
    Max(Option<Datum>),
    Concat(Option<String>),
}

#[derive(Debug)]
struct AggState {
    acc: Acc,
    total: bool,
    seen: Option<BTreeSet<SortKey>>,
}

impl AggState {
    fn new(spec: &AggSpec) -> Self {
        let acc = match spec.func {
            AggFn::Count => Acc::Count(0),
            AggFn::Sum | AggFn::Total => Acc::Sum {
                int: 0,
                real: 0.0,
                is_real: false,
                any: false,
            },
            AggFn::Avg => Acc::Avg { sum: 0.0, n: 0 },
            AggFn::Min => Acc::Min(None),
            AggFn::Max => Acc::Max(None),
            AggFn::GroupConcat => Acc::Concat(None),
        };
        Self {
            acc,
            total: spec.func == AggFn::Total,
            seen: spec.distinct.then(BTreeSet::new),
        }
    }

    fn update(&mut self, spec: &AggSpec, row: &[Datum]) {
        let Some(arg) = &spec.arg else {
            // COUNT(*)
            if let Acc::Count(n) = &mut self.acc {
                *n += 1;
            }
            return;
        };
        let value = eval(arg, row, &[]);
        if value.is_null() {
            return;
        }
        if let Some(seen) = &mut self.seen
            && !seen.insert(SortKey(vec![value.clone()]))
        {
            return;
        }

        match &mut self.acc {
            Acc::Count(n) => *n += 1,
            Acc::Sum {
                int,
                real,
                is_real,
                any,
            } => {
                *any = true;
                match value.as_number() {
                    Some(Number::Int(i)) if !*is_real => match int.checked_add(i) {
                        Some(sum) => *int = sum,
                        None => {
                            *is_real = true;
                            *real = *int as f64 + i as f64;
                        }
                    },
                    Some(num) => {
                        if !*is_real {
                            *is_real = true;
                            *real = *int as f64;
                        }
                        *real += num.as_f64();
                    }
                    None => {}
                }
            }
            Acc::Avg { sum, n } => {
                if let Some(num) = value.as_number() {
                    *sum += num.as_f64();
                    *n += 1;
                }
            }
            Acc::Min(cur) => {
                if cur.as_ref().is_none_or(|c| value.total_cmp(c) == Ordering::Less) {
                    *cur = Some(value);
                }
            }
            Acc::Max(cur) => {
                if cur
                    .as_ref()
                    .is_none_or(|c| value.total_cmp(c) == Ordering::Greater)
                {
                    *cur = Some(value);
                }
            }
            Acc::Concat(out) => {
                let text = value.render().unwrap_or_default();
                match out {
                    None => *out = Some(text),
                    Some(acc) => {
                        let sep = spec
                            .separator
                            .as_ref()
                            .map_or(Some(",".to_string()), |s| eval(s, row, &[]).render())
                            .unwrap_or_default();
                        acc.push_str(&sep);
                        acc.push_str(&text);
                    }
                }
            }
        }
    }

    fn finish(self) -> Datum {
        match self.acc {
            Acc::Count(n) => Datum::Int(n),
            Acc::Sum {
                int,
                real,
                is_real,
                any,
            } => match (self.total, any, is_real) {
                (true, _, false) => Datum::Real(int as f64),
                (true, _, true) => Datum::Real(real),
                (false, false, _) => Datum::Null,
                (false, true, false) => Datum::Int(int),
                (false, true, true) => Datum::Real(real),
            },
            Acc::Avg { sum, n } if n > 0 => Datum::Real(sum / n as f64),
            Acc::Avg { .. } => Datum::Null,
            Acc::Min(v) | Acc::Max(v) => v.unwrap_or(Datum::Null),
            Acc::Concat(v) => v.map_or(Datum::Null, Datum::Text),
        }
    }
}

fn eval(bound: &Bound, row: &[Datum], aggs: &[Datum]) -> Datum {
    match bound {
        Bound::Literal(d) => d.clone(),
        Bound::Column(idx) => row.get(*idx).cloned().unwrap_or(Datum::Null),
        Bound::Aggregate(idx) => aggs.get(*idx).cloned().unwrap_or(Datum::Null),
        Bound::Unary(op, e) => {
            let v = eval(e, row, aggs);
            match op {
                UnaryOp::Not => Datum::from_bool(v.truth().map(|t| !t)),
                UnaryOp::Plus => v,
                UnaryOp::Minus => match v.as_number() {
                    Some(Number::Int(i)) => i
                        .checked_neg()
                        .map_or(Datum::Real(-(i as f64)), Datum::Int),
                    Some(Number::Real(r)) => Datum::Real(-r),
                    None => Datum::Null,
                },
            }
        }
        Bound::Binary(op, l, r) => eval_binary(*op, l, r, row, aggs),
        Bound::IsNull(e, negated) => {
            let is_null = eval(e, row, aggs).is_null();
            Datum::from_bool(Some(is_null != *negated))
        }
        Bound::InList(e, list, negated) => {
            let v = eval(e, row, aggs);
            if v.is_null() {
                return Datum::Null;
            }
            let mut saw_null = false;
            for item in list {
                match v.compare(&eval(item, row, aggs)) {
                    Some(Ordering::Equal) => return Datum::from_bool(Some(!*negated)),
                    None => saw_null = true,
                    Some(_) => {}
                }
            }
            if saw_null {
                Datum::Null
            } else {
                Datum::from_bool(Some(*negated))
            }
        }
        Bound::Between(e, low, high, negated) => {
            let v = eval(e, row, aggs);
            let ge = v.compare(&eval(low, row, aggs)).map(|o| o != Ordering::Less);
            let le = v
                .compare(&eval(high, row, aggs))
                .map(|o| o != Ordering::Greater);
            let inside = and3(ge, le);
            Datum::from_bool(if *negated { inside.map(|b| !b) } else { inside })
        }
        Bound::Like(e, pattern, negated) => {
            match (eval(e, row, aggs).render(), eval(pattern, row, aggs).render()) {
                (Some(text), Some(pattern)) => {
                    Datum::from_bool(Some(like_match(&pattern, &text) != *negated))
                }
                _ => Datum::Null,
            }
        }
        Bound::Regexp(e, re, negated) => match eval(e, row, aggs).render() {
            Some(text) => Datum::from_bool(Some(re.is_match(&text) != *negated)),
            None => Datum::Null,
        },
        Bound::Case(operand, branches, otherwise) => {
            let subject = operand.as_ref().map(|o| eval(o, row, aggs));
            for (when, then) in branches {
                let w = eval(when, row, aggs);
                let hit = match &subject {
                    Some(s) => s.compare(&w) == Some(Ordering::Equal),
                    None => w.truth() == Some(true),
                };
                if hit {
                    return eval(then, row, aggs);
                }
            }
            otherwise
                .as_ref()
                .map_or(Datum::Null, |e| eval(e, row, aggs))
        }
        Bound::Scalar(func, args) => eval_scalar(*func, args, row, aggs),
        Bound::Cast(e, affinity) => eval(e, row, aggs).cast(*affinity),
    }
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn eval_binary(op: BinaryOp, l: &Bound, r: &Bound, row: &[Datum], aggs: &[Datum]) -> Datum {
    match op {
        BinaryOp::And => {
            let left = eval(l, row, aggs).truth();
            if left == Some(false) {
                return Datum::Int(0);
            }
            Datum::from_bool(and3(left, eval(r, row, aggs).truth()))
        }
        BinaryOp::Or => {
            let left = eval(l, row, aggs).truth();
            if left == Some(true) {
                return Datum::Int(1);
            }
            Datum::from_bool(or3(left, eval(r, row, aggs).truth()))
        }
        BinaryOp::Eq
        | BinaryOp::NotEq
        | BinaryOp::Lt
        | BinaryOp::LtEq
        | BinaryOp::Gt
        | BinaryOp::GtEq => {
            let ord = eval(l, row, aggs).compare(&eval(r, row, aggs));
            Datum::from_bool(ord.map(|o| match op {
                BinaryOp::Eq => o == Ordering::Equal,
                BinaryOp::NotEq => o != Ordering::Equal,
                BinaryOp::Lt => o == Ordering::Less,
                BinaryOp::LtEq => o != Ordering::Greater,
                BinaryOp::Gt => o == Ordering::Greater,
                _ => o != Ordering::Less,
            }))
        }
        BinaryOp::Concat => {
            match (eval(l, row, aggs).render(), eval(r, row, aggs).render()) {
                (Some(a), Some(b)) => Datum::Text(a + &b),
                _ => Datum::Null,
            }
        }
        BinaryOp::Plus
        | BinaryOp::Minus
        | BinaryOp::Multiply
        | BinaryOp::Divide
        | BinaryOp::Modulo => {
            let (Some(a), Some(b)) = (
                eval(l, row, aggs).as_number(),
                eval(r, row, aggs).as_number(),
            ) else {
                return Datum::Null;
            };
            arithmetic(op, a, b)
        }
    }
}

fn arithmetic(op: BinaryOp, a: Number, b: Number) -> Datum {
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        let exact = match op {
            BinaryOp::Plus => x.checked_add(y),
            BinaryOp::Minus => x.checked_sub(y),
            BinaryOp::Multiply => x.checked_mul(y),
            BinaryOp::Divide | BinaryOp::Modulo if y == 0 => return Datum::Null,
            BinaryOp::Divide => x.checked_div(y),
            _ => x.checked_rem(y),
        };
        if let Some(v) = exact {
            return Datum::Int(v);
        }
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinaryOp::Plus => x + y,
        BinaryOp::Minus => x - y,
        BinaryOp::Multiply => x * y,
        BinaryOp::Divide if y == 0.0 => return Datum::Null,
        BinaryOp::Divide => x / y,
        _ => {
            let (xi, yi) = (x as i64, y as i64);
            if yi == 0 {
                return Datum::Null;
            }
            return Datum::Real(xi.wrapping_rem(yi) as f64);
        }
    };
    Number::Real(result).into_datum()
}

fn eval_scalar(func: ScalarFn, args: &[Bound], row: &[Datum], aggs: &[Datum]) -> Datum {
    let mut values = args.iter().map(|a| eval(a, row, aggs));
    match func {
        ScalarFn::Lower | ScalarFn::Upper | ScalarFn::Length | ScalarFn::Abs => {
            let v = values.next().unwrap_or(Datum::Null);
            match func {
                ScalarFn::Lower => v.render().map_or(Datum::Null, |s| Datum::Text(s.to_lowercase())),
                ScalarFn::Upper => v.render().map_or(Datum::Null, |s| Datum::Text(s.to_uppercase())),
                ScalarFn::Length => v
                    .render()
                    .map_or(Datum::Null, |s| Datum::Int(s.chars().count() as i64)),
                _ => match v.as_number() {
                    Some(Number::Int(i)) => {
                        i.checked_abs().map_or(Datum::Real((i as f64).abs()), Datum::Int)
                    }
                    Some(Number::Real(r)) => Datum::Real(r.abs()),
                    None => Datum::Null,
                },
            }
        }
        ScalarFn::Coalesce | ScalarFn::IfNull => {
            values.find(|v| !v.is_null()).unwrap_or(Datum::Null)
        }
        ScalarFn::Round => {
            let v = values.next().unwrap_or(Datum::Null);
            let digits = values
                .next()
                .and_then(|d| d.as_number())
                .map_or(0, |n| n.as_f64() as i32)
                .clamp(0, 15);
            match v.as_number() {
                Some(n) => {
                    let scale = 10f64.powi(digits);
                    Datum::Real((n.as_f64() * scale).round() / scale)
                }
                None => Datum::Null,
            }
        }
        ScalarFn::Min | ScalarFn::Max => {
            let all: Vec<Datum> = values.collect();
            if all.iter().any(Datum::is_null) {
                return Datum::Null;
            }
            let pick = if func == ScalarFn::Min {
                all.into_iter().min_by(Datum::total_cmp)
            } else {
                all.into_iter().max_by(Datum::total_cmp)
            };
            pick.unwrap_or(Datum::Null)
        }
        ScalarFn::Typeof => {
            let v = values.next().unwrap_or(Datum::Null);
            Datum::Text(v.type_name().to_string())
        }
    }
}

/// SQL `LIKE`: `%` matches any run, `_` one character, ASCII case-insensitive.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '%' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '_' || p[pi].eq_ignore_ascii_case(&t[ti])) {
            pi += 1;
            ti += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}

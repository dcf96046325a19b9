use anyhow::Result;
use std::{cmp::Ordering, sync::Arc};

use super::{ArithOp, BufferPool, Predicate, Row, Scalar, TableSchema, TableStorage, Value};
use crate::error::EngineError;

/// Aggregate functions usable in a select list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One output column of a scan.
#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    Expr(Scalar),
    /// `arg = None` is `COUNT(*)`
    Aggregate { func: AggFunc, arg: Option<Scalar> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderKey {
    pub expr: Scalar,
    pub descending: bool,
}

/// Everything a single-table SELECT does after reading the rows.
///
/// ## Query Processing Pipeline
/// ```text
/// rows → WHERE filter → ORDER BY → aggregate? → OFFSET/LIMIT → projection
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanPlan {
    pub predicate: Option<Predicate>,
    pub order_by: Vec<OrderKey>,
    pub offset: usize,
    pub limit: Option<usize>,
    /// `None` keeps every column (`SELECT *`)
    pub projection: Option<Vec<Projection>>,
}

impl ScanPlan {
    /// `SELECT *` with no clauses.
    pub fn all() -> Self {
        Self::default()
    }

    fn is_aggregate(&self) -> bool {
        self.projection
            .as_ref()
            .map_or(false, |p| p.iter().any(|p| matches!(p, Projection::Aggregate { .. })))
    }
}

/// Reads every row of `table` and runs `plan` over them.
///
/// Dirty pages of the table are flushed by the scan so recent writes are
/// visible. There are no indexes; every SELECT is a full scan.
pub async fn execute_select_scan(
    table: &Arc<TableStorage>,
    buffers: &BufferPool,
    schema: &TableSchema,
    plan: &ScanPlan,
) -> Result<Vec<Row>> {
    let rows = table.scan(buffers).await?;
    Ok(run_plan(schema, rows, plan))
}

/// Applies `plan` to rows already in memory. A table-less SELECT passes a
/// single empty row and an empty schema.
pub fn run_plan(schema: &TableSchema, rows: Vec<Row>, plan: &ScanPlan) -> Vec<Row> {
    let mut rows: Vec<Row> =
        rows.into_iter().filter(|r| matches(schema, r, plan.predicate.as_ref())).collect();

    if !plan.order_by.is_empty() {
        let mut keyed: Vec<(Vec<Value>, Row)> = rows
            .into_iter()
            .map(|r| (plan.order_by.iter().map(|k| k.expr.eval(schema, &r)).collect(), r))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| {
            for (key, (x, y)) in plan.order_by.iter().zip(a.iter().zip(b.iter())) {
                let ord = x.sort_cmp(y);
                let ord = if key.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        rows = keyed.into_iter().map(|(_, r)| r).collect();
    }

    let rows = match &plan.projection {
        Some(projection) if plan.is_aggregate() => vec![aggregate(schema, &rows, projection)],
        _ => rows,
    };

    let limited = rows.into_iter().skip(plan.offset).take(plan.limit.unwrap_or(usize::MAX));
    match &plan.projection {
        Some(_) if plan.is_aggregate() => limited.collect(),
        Some(projection) => limited
            .map(|r| {
                projection
                    .iter()
                    .map(|p| match p {
                        Projection::Expr(e) => e.eval(schema, &r),
                        Projection::Aggregate { .. } => Value::Null,
                    })
                    .collect()
            })
            .collect(),
        None => limited.collect(),
    }
}

fn aggregate(schema: &TableSchema, rows: &[Row], projection: &[Projection]) -> Row {
    projection
        .iter()
        .map(|p| match p {
            Projection::Expr(e) => rows.first().map_or(Value::Null, |r| e.eval(schema, r)),
            Projection::Aggregate { func, arg } => {
                let values: Vec<Value> = match arg {
                    None => return Value::Int(rows.len() as i64),
                    Some(e) => {
                        rows.iter().map(|r| e.eval(schema, r)).filter(|v| !v.is_null()).collect()
                    }
                };
                fold_aggregate(*func, values)
            }
        })
        .collect()
}

fn fold_aggregate(func: AggFunc, values: Vec<Value>) -> Value {
    if func == AggFunc::Count {
        return Value::Int(values.len() as i64);
    }
    if values.is_empty() {
        return Value::Null;
    }
    match func {
        AggFunc::Count => Value::Int(values.len() as i64),
        AggFunc::Min => values.into_iter().min_by(|a, b| a.sort_cmp(b)).unwrap_or(Value::Null),
        AggFunc::Max => values.into_iter().max_by(|a, b| a.sort_cmp(b)).unwrap_or(Value::Null),
        AggFunc::Sum => values
            .into_iter()
            .fold(Value::Int(0), |acc, v| arith(ArithOp::Add, acc, v)),
        AggFunc::Avg => {
            let n = values.len() as f64;
            let total: f64 = values.iter().filter_map(Value::as_f64).sum();
            Value::Real(total / n)
        }
    }
}

impl Scalar {
    /// Evaluates against one row. Unknown columns read as NULL; callers
    /// validate names before execution.
    pub fn eval(&self, schema: &TableSchema, row: &[Value]) -> Value {
        match self {
            Scalar::Literal(v) => v.clone(),
            Scalar::Column(name) => schema
                .index_of(name)
                .and_then(|i| row.get(i))
                .cloned()
                .unwrap_or(Value::Null),
            Scalar::Negate(inner) => match inner.eval(schema, row) {
                Value::Null => Value::Null,
                Value::Int(i) => i.checked_neg().map_or(Value::Real(-(i as f64)), Value::Int),
                Value::Real(f) => Value::Real(-f),
                text => Value::Real(-text.as_f64().unwrap_or(0.0)),
            },
            Scalar::Arith { op, left, right } => {
                arith(*op, left.eval(schema, row), right.eval(schema, row))
            }
        }
    }

    /// Column names this expression reads.
    pub fn columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Scalar::Literal(_) => {}
            Scalar::Column(name) => out.push(name),
            Scalar::Negate(inner) => inner.columns(out),
            Scalar::Arith { left, right, .. } => {
                left.columns(out);
                right.columns(out);
            }
        }
    }
}

fn arith(op: ArithOp, l: Value, r: Value) -> Value {
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        let exact = match op {
            ArithOp::Add => Some(a.checked_add(b)),
            ArithOp::Sub => Some(a.checked_sub(b)),
            ArithOp::Mul => Some(a.checked_mul(b)),
            ArithOp::Mod if b == 0 => return Value::Null,
            ArithOp::Mod => Some(a.checked_rem(b)),
            ArithOp::Div => None,
        };
        if let Some(Some(v)) = exact {
            return Value::Int(v);
        }
    }
    let x = l.as_f64().unwrap_or(0.0);
    let y = r.as_f64().unwrap_or(0.0);
    match op {
        ArithOp::Add => Value::Real(x + y),
        ArithOp::Sub => Value::Real(x - y),
        ArithOp::Mul => Value::Real(x * y),
        ArithOp::Div | ArithOp::Mod if y == 0.0 => Value::Null,
        ArithOp::Div => Value::Real(x / y),
        ArithOp::Mod => Value::Real(x % y),
    }
}

impl Predicate {
    /// Three-valued evaluation: `None` is SQL UNKNOWN.
    pub fn eval(&self, schema: &TableSchema, row: &[Value]) -> Option<bool> {
        match self {
            Predicate::Const(b) => Some(*b),
            Predicate::Compare { left, op, right } => left
                .eval(schema, row)
                .sql_cmp(&right.eval(schema, row))
                .map(|ord| op.holds(ord)),
            Predicate::IsNull(e) => Some(e.eval(schema, row).is_null()),
            Predicate::IsNotNull(e) => Some(!e.eval(schema, row).is_null()),
            Predicate::InList { expr, list, negated } => {
                let v = expr.eval(schema, row);
                if v.is_null() {
                    return None;
                }
                let mut saw_null = false;
                for item in list {
                    match v.sql_cmp(&item.eval(schema, row)) {
                        Some(Ordering::Equal) => return Some(!negated),
                        None => saw_null = true,
                        Some(_) => {}
                    }
                }
                if saw_null {
                    None
                } else {
                    Some(*negated)
                }
            }
            Predicate::Like { expr, pattern, negated } => {
                let text = expr.eval(schema, row).to_text()?;
                Some(like_match(&text, pattern) != *negated)
            }
            Predicate::Not(p) => p.eval(schema, row).map(|b| !b),
            Predicate::And(l, r) => match (l.eval(schema, row), r.eval(schema, row)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Predicate::Or(l, r) => match (l.eval(schema, row), r.eval(schema, row)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
        }
    }

    /// Column names the predicate reads.
    pub fn columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Const(_) => {}
            Predicate::Compare { left, right, .. } => {
                left.columns(out);
                right.columns(out);
            }
            Predicate::IsNull(e) | Predicate::IsNotNull(e) | Predicate::Like { expr: e, .. } => {
                e.columns(out)
            }
            Predicate::InList { expr, list, .. } => {
                expr.columns(out);
                for item in list {
                    item.columns(out);
                }
            }
            Predicate::Not(p) => p.columns(out),
            Predicate::And(l, r) | Predicate::Or(l, r) => {
                l.columns(out);
                r.columns(out);
            }
        }
    }
}

/// Whether `row` passes the WHERE clause. UNKNOWN filters the row out.
pub fn matches(schema: &TableSchema, row: &[Value], pred: Option<&Predicate>) -> bool {
    pred.map_or(true, |p| p.eval(schema, row) == Some(true))
}

/// SQL LIKE with `%`, `_` and `\` escapes, ASCII case-insensitive.
pub fn like_match(text: &str, pattern: &str) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Tok {
        Any,
        One,
        Lit(char),
    }
    let mut toks = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        toks.push(match c {
            '%' => Tok::Any,
            '_' => Tok::One,
            '\\' => Tok::Lit(chars.next().unwrap_or('\\')),
            c => Tok::Lit(c),
        });
    }
    let text: Vec<char> = text.chars().collect();

    // reachable[j]: pattern prefix of length j matches the text consumed so far
    let mut reachable = vec![false; toks.len() + 1];
    reachable[0] = true;
    for j in 0..toks.len() {
        if toks[j] == Tok::Any && reachable[j] {
            reachable[j + 1] = true;
        }
    }
    for ch in text {
        let mut next = vec![false; toks.len() + 1];
        for j in 0..toks.len() {
            next[j + 1] = match toks[j] {
                // `%` matches nothing here, or swallows `ch` and stays put
                Tok::Any => next[j] || reachable[j + 1],
                Tok::One => reachable[j],
                Tok::Lit(p) => reachable[j] && p.eq_ignore_ascii_case(&ch),
            };
        }
        reachable = next;
    }
    reachable[toks.len()]
}

/// Computes the rows an UPDATE would leave behind. Assignment expressions
/// read the row as it was before the statement. Returns the new rows and the
/// number of rows matched.
pub fn apply_assignments(
    schema: &TableSchema,
    rows: Vec<Row>,
    assignments: &[(String, Scalar)],
    predicate: Option<&Predicate>,
) -> Result<(Vec<Row>, u64), EngineError> {
    let targets = assignments
        .iter()
        .map(|(name, expr)| {
            schema
                .index_of(name)
                .map(|idx| (idx, expr))
                .ok_or_else(|| EngineError::unknown_column(name))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut matched = 0u64;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if !matches(schema, &row, predicate) {
            out.push(row);
            continue;
        }
        matched += 1;
        let mut updated = row.clone();
        for (idx, expr) in &targets {
            let col = &schema.columns[*idx];
            updated[*idx] = col.col_type.coerce(&col.name, expr.eval(schema, &row))?;
        }
        out.push(updated);
    }
    Ok((out, matched))
}

use anyhow::Result;
use sqlparser::ast::{
    self as ast, ColumnDef, ColumnOption, Expr, GroupByExpr, ObjectName, ObjectType, Query, SelectItem, SetExpr,
    ShowStatementFilter, Statement, TableConstraint, TableFactor, TableWithJoins,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::engine::{
    like_match, run_plan, Column, ColumnType, Engine, OrderKey, Projection, Row, Scalar, ScanPlan,
    StatementResult, TableSchema, Value,
};
use crate::error::{codes, EngineError};

mod expr;
mod pragma;

pub use expr::{system_variable, SYSTEM_VARIABLES};

/// Name reported by `DATABASE()`, `SHOW DATABASES` and `SHOW TABLES`.
pub const DATABASE_NAME: &str = "zerodb";

/// Coarse statement class, decided once from the leading keyword.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    /// Produces a row-set: `SELECT`, `WITH`, `SHOW`, `DESCRIBE`, `DESC`, `EXPLAIN`
    Select,
    /// Produces an affected-row count
    Mutation,
    /// `PRAGMA name[(arg)]`
    Pragma,
    Unknown,
}

/// Classifies `sql` by its first keyword, case-insensitively. Leading
/// whitespace, comments and opening parentheses are skipped.
pub fn classify(sql: &str) -> StatementKind {
    match leading_keyword(sql).as_deref() {
        Some("SELECT" | "WITH" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN") => StatementKind::Select,
        Some(
            "INSERT" | "UPDATE" | "DELETE" | "CREATE" | "DROP" | "ALTER" | "REPLACE" | "TRUNCATE"
            | "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SET" | "USE",
        ) => StatementKind::Mutation,
        Some("PRAGMA") => StatementKind::Pragma,
        _ => StatementKind::Unknown,
    }
}

fn skip_noise(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(r) = rest.strip_prefix("--").or_else(|| rest.strip_prefix('#')) {
            rest = r.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(r) = rest.strip_prefix("/*") {
            rest = r.split_once("*/").map_or("", |(_, tail)| tail);
        } else if let Some(r) = rest.strip_prefix('(') {
            rest = r;
        } else {
            return rest;
        }
    }
}

fn leading_keyword(sql: &str) -> Option<String> {
    let word: String = skip_noise(sql)
        .chars()
        .take_while(|c| c.is_ascii_alphabetic() || *c == '_')
        .collect();
    if word.is_empty() {
        None
    } else {
        Some(word.to_ascii_uppercase())
    }
}

fn syntax_error(sql: &str) -> EngineError {
    let near: String = skip_noise(sql).chars().take(80).collect();
    EngineError::parse(format!(
        "You have an error in your SQL syntax; check the manual that corresponds to your \
         MySQL server version for the right syntax to use near '{}' at line 1",
        near
    ))
}

/// Parses and executes one SQL statement against `engine`.
///
/// ## Processing Pipeline
/// 1. Trailing `;` and whitespace are dropped; nothing left is `ER_EMPTY_QUERY`
/// 2. [`classify`] picks the path; `Unknown` is `ER_PARSE_ERROR`
/// 3. Pragmas go to their own small parser
/// 4. Everything else is parsed with `sqlparser` (MySQL dialect), must be a
///    single statement, and is planned into engine calls
///
/// Errors the client should see are [`EngineError`]s inside the `anyhow`
/// chain; the caller recovers them with [`EngineError::from_anyhow`].
pub async fn execute(engine: &Engine, sql: &str) -> Result<StatementResult> {
    let sql = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if skip_noise(sql).is_empty() {
        return Err(EngineError::new(codes::ER_EMPTY_QUERY, "Query was empty").into());
    }

    let kind = classify(sql);
    debug!(?kind, "dispatching statement");
    match kind {
        StatementKind::Unknown => return Err(syntax_error(sql).into()),
        StatementKind::Pragma => return pragma::execute(engine, sql).await,
        StatementKind::Select | StatementKind::Mutation => {}
    }
    if let Some(result) = show_shortcut(sql) {
        return Ok(result);
    }
    if leading_keyword(sql).as_deref() == Some("REPLACE") {
        return Err(EngineError::unsupported("REPLACE is not supported").into());
    }

    let stmt = match parse_one(sql) {
        Ok(stmt) => stmt,
        // Connectors send session SETs this parser does not know; they
        // change nothing here.
        Err(e) if leading_keyword(sql).as_deref() == Some("SET") => {
            debug!(error = %e.message, "ignoring unparsed SET");
            return Ok(StatementResult::mutation(0));
        }
        Err(e) => return Err(e.into()),
    };
    run_statement(engine, stmt).await
}

fn parse_one(sql: &str) -> Result<Statement, EngineError> {
    // The parser panics on some malformed REPLACE statements.
    let parsed = std::panic::catch_unwind(|| Parser::parse_sql(&MySqlDialect {}, sql))
        .map_err(|_| syntax_error(sql))?;
    let mut ast = parsed
        .map_err(|e| EngineError::parse(format!("You have an error in your SQL syntax: {}", e)))?;
    if ast.len() != 1 {
        return Err(EngineError::parse("Only one statement at a time is supported"));
    }
    ast.pop().ok_or_else(|| syntax_error(sql))
}

/// `SHOW` forms answered without the parser.
fn show_shortcut(sql: &str) -> Option<StatementResult> {
    let words: Vec<String> = sql.split_whitespace().map(str::to_ascii_uppercase).collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["SHOW", "DATABASES" | "SCHEMAS"] => Some(StatementResult::RowSet {
            columns: vec!["Database".into()],
            rows: vec![vec![text(DATABASE_NAME)]],
        }),
        ["SHOW", "WARNINGS" | "ERRORS"] => Some(StatementResult::RowSet {
            columns: vec!["Level".into(), "Code".into(), "Message".into()],
            rows: vec![],
        }),
        _ => None,
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn object_name(name: &ObjectName) -> Result<String, EngineError> {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .ok_or_else(|| EngineError::parse("Missing table name"))
}

fn table_of(from: &TableWithJoins) -> Result<String, EngineError> {
    if !from.joins.is_empty() {
        return Err(EngineError::unsupported("JOIN is not supported"));
    }
    match &from.relation {
        TableFactor::Table { name, .. } => object_name(name),
        _ => Err(EngineError::unsupported("Only plain table references are supported")),
    }
}

async fn run_statement(engine: &Engine, stmt: Statement) -> Result<StatementResult> {
    match stmt {
        // CREATE TABLE [IF NOT EXISTS] t (id INTEGER PRIMARY KEY, name TEXT NOT NULL, ...)
        Statement::CreateTable { name, columns, constraints, if_not_exists, .. } => {
            let schema = table_schema(&object_name(&name)?, &columns, &constraints)?;
            engine.create_table(schema, if_not_exists).await?;
            Ok(StatementResult::mutation(0))
        }

        // DROP TABLE [IF EXISTS] a, b
        Statement::Drop { object_type, if_exists, names, .. } => {
            if object_type != ObjectType::Table {
                return Err(EngineError::unsupported(format!("DROP {} is not supported", object_type)).into());
            }
            let names = names.iter().map(object_name).collect::<Result<Vec<_>, _>>()?;
            if !if_exists {
                let missing: Vec<&str> = names
                    .iter()
                    .filter(|n| engine.schema(n).is_err())
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return Err(EngineError::new(
                        codes::ER_BAD_TABLE,
                        format!("Unknown table '{}'", missing.join(",")),
                    )
                    .into());
                }
            }
            for name in &names {
                engine.drop_table(name, true).await?;
            }
            Ok(StatementResult::mutation(0))
        }

        // INSERT INTO t [(cols)] VALUES (...), (...)
        Statement::Insert {
            table_name, columns, source, ignore, replace_into, on, or, returning, ..
        } => {
            if replace_into {
                return Err(EngineError::unsupported("REPLACE is not supported").into());
            }
            if ignore || or.is_some() {
                return Err(EngineError::unsupported("INSERT IGNORE is not supported").into());
            }
            if on.is_some() {
                return Err(EngineError::unsupported("ON DUPLICATE KEY UPDATE is not supported").into());
            }
            if returning.is_some() {
                return Err(EngineError::unsupported("RETURNING is not supported").into());
            }
            let table = object_name(&table_name)?;
            let source = source.ok_or_else(|| EngineError::unsupported("INSERT requires VALUES"))?;
            let values = match source.body.as_ref() {
                SetExpr::Values(values) => &values.rows,
                _ => return Err(EngineError::unsupported("INSERT ... SELECT is not supported").into()),
            };
            let schema = engine.schema(&table)?;
            let names: Vec<&str> = columns.iter().map(|c| c.value.as_str()).collect();
            let rows = insert_rows(&schema, &names, values)?;
            let outcome = engine.insert_rows(&table, rows).await?;
            Ok(StatementResult::Mutation {
                affected_rows: outcome.inserted,
                last_insert_id: outcome.last_insert_id,
            })
        }

        // UPDATE t SET c = expr, ... [WHERE ...]
        Statement::Update { table, assignments, from, selection, returning } => {
            if from.is_some() {
                return Err(EngineError::unsupported("UPDATE ... FROM is not supported").into());
            }
            if returning.is_some() {
                return Err(EngineError::unsupported("RETURNING is not supported").into());
            }
            let name = table_of(&table)?;
            let schema = engine.schema(&name)?;
            let mut planned = Vec::with_capacity(assignments.len());
            for a in &assignments {
                let column = a
                    .id
                    .last()
                    .map(|ident| ident.value.clone())
                    .ok_or_else(|| EngineError::parse("Missing column in SET"))?;
                let value = expr::scalar(&a.value)?;
                let mut read = vec![column.as_str()];
                value.columns(&mut read);
                expr::check_columns(&schema, read, "field list")?;
                planned.push((column, value));
            }
            let predicate = selection.as_ref().map(expr::predicate).transpose()?;
            if let Some(p) = &predicate {
                let mut read = Vec::new();
                p.columns(&mut read);
                expr::check_columns(&schema, read, "where clause")?;
            }
            let matched = engine.update(&name, planned, predicate).await?;
            Ok(StatementResult::mutation(matched))
        }

        // DELETE FROM t [WHERE ...]
        Statement::Delete { tables, from, using, selection, returning, order_by, limit } => {
            if !order_by.is_empty() || limit.is_some() {
                return Err(EngineError::unsupported("DELETE with ORDER BY or LIMIT is not supported").into());
            }
            if returning.is_some() {
                return Err(EngineError::unsupported("RETURNING is not supported").into());
            }
            let [target] = from.as_slice() else {
                return Err(EngineError::unsupported("Only single table DELETE is supported").into());
            };
            if !tables.is_empty() || using.is_some() {
                return Err(EngineError::unsupported("Only single table DELETE is supported").into());
            }
            let name = table_of(target)?;
            let schema = engine.schema(&name)?;
            let predicate = selection.as_ref().map(expr::predicate).transpose()?;
            if let Some(p) = &predicate {
                let mut read = Vec::new();
                p.columns(&mut read);
                expr::check_columns(&schema, read, "where clause")?;
            }
            let removed = engine.delete(&name, predicate).await?;
            Ok(StatementResult::mutation(removed))
        }

        Statement::Truncate { table_name, .. } => {
            engine.delete(&object_name(&table_name)?, None).await?;
            Ok(StatementResult::mutation(0))
        }

        Statement::Query(q) => select(engine, &q).await,

        Statement::ShowTables { filter, .. } => {
            let mut rows = Vec::new();
            for name in engine.table_names() {
                if passes(&name, filter.as_ref())? {
                    rows.push(vec![Value::Text(name)]);
                }
            }
            Ok(StatementResult::RowSet {
                columns: vec![format!("Tables_in_{}", DATABASE_NAME)],
                rows,
            })
        }

        Statement::ShowColumns { table_name, .. } | Statement::ExplainTable { table_name, .. } => {
            let schema = engine.schema(&object_name(&table_name)?)?;
            Ok(describe(&schema))
        }

        Statement::ShowVariables { filter, .. } => {
            let mut rows = Vec::new();
            for name in SYSTEM_VARIABLES {
                if passes(name, filter.as_ref())? {
                    rows.push(vec![text(name), system_variable(name)?]);
                }
            }
            Ok(StatementResult::RowSet {
                columns: vec!["Variable_name".into(), "Value".into()],
                rows,
            })
        }

        // Every statement commits on its own; session settings are accepted
        // and ignored.
        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::SetVariable { .. }
        | Statement::SetNames { .. }
        | Statement::SetNamesDefault { .. }
        | Statement::SetTransaction { .. }
        | Statement::Use { .. } => Ok(StatementResult::mutation(0)),

        other => Err(EngineError::unsupported(format!(
            "This version of zerodb doesn't yet support '{}'",
            statement_head(&other)
        ))
        .into()),
    }
}

/// Applies a `SHOW ... LIKE` filter. `WHERE` filters are not supported.
fn passes(name: &str, filter: Option<&ShowStatementFilter>) -> Result<bool, EngineError> {
    match filter {
        None => Ok(true),
        Some(ShowStatementFilter::Like(p)) | Some(ShowStatementFilter::ILike(p)) => {
            Ok(like_match(name, p))
        }
        Some(ShowStatementFilter::Where(_)) => {
            Err(EngineError::unsupported("SHOW ... WHERE is not supported"))
        }
    }
}

fn statement_head(stmt: &Statement) -> String {
    stmt.to_string().split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

fn table_schema(
    name: &str,
    defs: &[ColumnDef],
    constraints: &[TableConstraint],
) -> Result<TableSchema, EngineError> {
    let mut columns = defs.iter().map(column).collect::<Result<Vec<_>, _>>()?;

    for constraint in constraints {
        match constraint {
            TableConstraint::Unique { columns: keys, is_primary, .. } => {
                if keys.len() != 1 {
                    return Err(EngineError::unsupported("Multi-column keys are not supported"));
                }
                let key = &keys[0].value;
                let col = columns
                    .iter_mut()
                    .find(|c| c.name.eq_ignore_ascii_case(key))
                    .ok_or_else(|| EngineError::unknown_column(key))?;
                if *is_primary {
                    col.primary_key = true;
                    col.not_null = true;
                } else {
                    col.unique = true;
                }
            }
            other => debug!(%other, "ignoring table constraint"),
        }
    }

    if columns.iter().filter(|c| c.primary_key).count() > 1 {
        return Err(EngineError::new(codes::ER_PARSE_ERROR, "Multiple primary key defined"));
    }
    for col in columns.iter_mut() {
        if col.primary_key && col.col_type == ColumnType::Integer {
            col.auto_increment = true;
        }
    }
    Ok(TableSchema::new(name, columns))
}

fn column(def: &ColumnDef) -> Result<Column, EngineError> {
    let declared = def.data_type.to_string();
    let mut col = Column::new(&def.name.value, ColumnType::from_sql(&declared));
    if declared.eq_ignore_ascii_case("SERIAL") {
        col.auto_increment = true;
        col.unique = true;
        col.not_null = true;
    }
    for opt in &def.options {
        match &opt.option {
            ColumnOption::NotNull => col.not_null = true,
            ColumnOption::Null => col.not_null = false,
            ColumnOption::Unique { is_primary: true, .. } => {
                col.primary_key = true;
                col.not_null = true;
            }
            ColumnOption::Unique { .. } => col.unique = true,
            ColumnOption::Default(e) => {
                let v = expr::constant(e)?;
                col.default = Some(col.col_type.coerce(&col.name, v)?);
            }
            other => {
                let text = other.to_string().to_ascii_uppercase();
                if text == "AUTO_INCREMENT" || text == "AUTOINCREMENT" {
                    col.auto_increment = true;
                } else {
                    debug!(column = %col.name, option = %text, "ignoring column option");
                }
            }
        }
    }
    Ok(col)
}

/// Expands VALUES rows to full-width rows in schema order. Columns left out
/// of the list get their DEFAULT, or NULL.
fn insert_rows(schema: &TableSchema, names: &[&str], values: &[Vec<Expr>]) -> Result<Vec<Row>, EngineError> {
    let targets: Vec<usize> = if names.is_empty() {
        (0..schema.columns.len()).collect()
    } else {
        expr::check_columns(schema, names.iter().copied(), "field list")?;
        names.iter().filter_map(|n| schema.index_of(n)).collect()
    };

    let mut rows = Vec::with_capacity(values.len());
    for (n, exprs) in values.iter().enumerate() {
        if exprs.len() != targets.len() {
            return Err(EngineError::new(
                codes::ER_WRONG_VALUE_COUNT,
                format!("Column count doesn't match value count at row {}", n + 1),
            ));
        }
        let mut row: Row = schema
            .columns
            .iter()
            .map(|c| c.default.clone().unwrap_or(Value::Null))
            .collect();
        for (idx, e) in targets.iter().zip(exprs) {
            row[*idx] = expr::constant(e)?;
        }
        rows.push(row);
    }
    Ok(rows)
}

fn describe(schema: &TableSchema) -> StatementResult {
    let rows = schema
        .columns
        .iter()
        .map(|c| {
            let key = if c.primary_key {
                "PRI"
            } else if c.unique {
                "UNI"
            } else {
                ""
            };
            vec![
                Value::Text(c.name.clone()),
                text(c.col_type.sql_name()),
                text(if c.not_null { "NO" } else { "YES" }),
                text(key),
                c.default.clone().unwrap_or(Value::Null),
                text(if c.auto_increment { "auto_increment" } else { "" }),
            ]
        })
        .collect();
    StatementResult::RowSet {
        columns: ["Field", "Type", "Null", "Key", "Default", "Extra"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        rows,
    }
}

/// Column header for an unaliased select-list expression.
fn display_name(e: &Expr) -> String {
    match e {
        Expr::Identifier(id) => id.value.clone(),
        Expr::Value(ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s)) => {
            s.clone()
        }
        Expr::CompoundIdentifier(parts) if !parts.iter().any(|p| p.value.starts_with("@@")) => {
            parts.last().map(|p| p.value.clone()).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

async fn select(engine: &Engine, q: &Query) -> Result<StatementResult> {
    if q.with.is_some() {
        return Err(EngineError::unsupported("WITH is not supported").into());
    }
    let mut q = q;
    // `(SELECT ...)` with nothing outside the parentheses
    while let SetExpr::Query(inner) = q.body.as_ref() {
        if !q.order_by.is_empty() || q.limit.is_some() || q.offset.is_some() {
            break;
        }
        q = inner.as_ref();
    }
    let s = match q.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(EngineError::unsupported("Only plain SELECT is supported").into()),
    };
    if s.distinct.is_some() {
        return Err(EngineError::unsupported("SELECT DISTINCT is not supported").into());
    }
    if matches!(&s.group_by, GroupByExpr::All)
        || matches!(&s.group_by, GroupByExpr::Expressions(v) if !v.is_empty())
    {
        return Err(EngineError::unsupported("GROUP BY is not supported").into());
    }
    if s.having.is_some() {
        return Err(EngineError::unsupported("HAVING is not supported").into());
    }
    let table = match s.from.as_slice() {
        [] => None,
        [one] => Some(table_of(one)?),
        _ => return Err(EngineError::unsupported("Only single table SELECT is supported").into()),
    };
    let schema = match &table {
        Some(t) => engine.schema(t)?,
        None => TableSchema::default(),
    };

    let mut columns = Vec::new();
    let mut items = Vec::new();
    for item in &s.projection {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                if table.is_none() {
                    return Err(EngineError::parse("No tables used").into());
                }
                for c in &schema.columns {
                    columns.push(c.name.clone());
                    items.push(Projection::Expr(Scalar::Column(c.name.clone())));
                }
            }
            SelectItem::UnnamedExpr(e) => {
                columns.push(display_name(e));
                items.push(expr::projection(e)?);
            }
            SelectItem::ExprWithAlias { expr: e, alias } => {
                columns.push(alias.value.clone());
                items.push(expr::projection(e)?);
            }
        }
    }
    let mut read = Vec::new();
    for item in &items {
        match item {
            Projection::Expr(e) | Projection::Aggregate { arg: Some(e), .. } => e.columns(&mut read),
            Projection::Aggregate { arg: None, .. } => {}
        }
    }
    expr::check_columns(&schema, read, "field list")?;

    let predicate = s.selection.as_ref().map(expr::predicate).transpose()?;
    if let Some(p) = &predicate {
        let mut read = Vec::new();
        p.columns(&mut read);
        expr::check_columns(&schema, read, "where clause")?;
    }

    let mut order_by = Vec::with_capacity(q.order_by.len());
    for key in &q.order_by {
        let descending = key.asc == Some(false);
        if let Some(scalar) = order_target(&schema, &columns, &items, &key.expr)? {
            let mut read = Vec::new();
            scalar.columns(&mut read);
            expr::check_columns(&schema, read, "order clause")?;
            order_by.push(OrderKey { expr: scalar, descending });
        }
    }

    let limit = q.limit.as_ref().map(count_clause).transpose()?;
    let offset = q.offset.as_ref().map(|o| count_clause(&o.value)).transpose()?.unwrap_or(0);
    let plan = ScanPlan { predicate, order_by, offset, limit, projection: Some(items) };

    let rows = match &table {
        Some(t) => engine.select(t, &plan).await?,
        None => run_plan(&schema, vec![vec![]], &plan),
    };
    Ok(StatementResult::RowSet { columns, rows })
}

/// Resolves an ORDER BY key: a 1-based select-list position, a select-list
/// alias, or an expression over the table. Keys naming an aggregate sort
/// nothing and are dropped.
fn order_target(
    schema: &TableSchema,
    columns: &[String],
    items: &[Projection],
    e: &Expr,
) -> Result<Option<Scalar>, EngineError> {
    let by_item = |idx: usize| match &items[idx] {
        Projection::Expr(s) => Some(s.clone()),
        Projection::Aggregate { .. } => None,
    };
    match e {
        Expr::Value(ast::Value::Number(n, _)) => {
            let pos: usize = n.parse().unwrap_or(0);
            if pos == 0 || pos > items.len() {
                return Err(EngineError::new(
                    codes::ER_BAD_FIELD,
                    format!("Unknown column '{}' in 'order clause'", n),
                ));
            }
            Ok(by_item(pos - 1))
        }
        Expr::Identifier(id) if schema.index_of(&id.value).is_none() => {
            match columns.iter().position(|c| c.eq_ignore_ascii_case(&id.value)) {
                Some(idx) => Ok(by_item(idx)),
                None => Ok(Some(expr::scalar(e)?)),
            }
        }
        _ => Ok(Some(expr::scalar(e)?)),
    }
}

fn count_clause(e: &Expr) -> Result<usize, EngineError> {
    match expr::constant(e)? {
        Value::Int(n) if n >= 0 => Ok(n as usize),
        other => Err(EngineError::parse(format!("Incorrect argument to LIMIT: {}", other))),
    }
}

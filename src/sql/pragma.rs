//! `PRAGMA` statements: engine maintenance and introspection.
//!
//! ```text
//! PRAGMA shrink_memory        flush, empty the buffer pool, compact the WAL
//! PRAGMA wal_checkpoint       flush and compact the WAL only
//! PRAGMA cache_size           buffer pool capacity and occupancy
//! PRAGMA table_list           one row per table
//! PRAGMA table_info(name)     one row per column
//! ```

use anyhow::Result;
use tracing::info;

use super::DATABASE_NAME;
use crate::engine::{Engine, StatementResult, Value};
use crate::error::EngineError;

/// A parsed pragma: its name and the optional `(arg)` or `= arg`.
#[derive(Debug, PartialEq, Eq)]
struct Pragma<'a> {
    name: String,
    arg: Option<&'a str>,
}

fn parse(sql: &str) -> Result<Pragma<'_>, EngineError> {
    let rest = sql.trim_start();
    let rest = rest
        .get(..6)
        .filter(|kw| kw.eq_ignore_ascii_case("PRAGMA"))
        .map(|_| &rest[6..])
        .ok_or_else(|| EngineError::parse("Expected PRAGMA"))?
        .trim();

    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(rest.len());
    let name = rest[..end].to_ascii_lowercase();
    if name.is_empty() {
        return Err(EngineError::parse("PRAGMA needs a name"));
    }
    // `main.table_info(t)` names the schema first
    let name = name.rsplit('.').next().unwrap_or_default().to_string();

    let tail = rest[end..].trim();
    let arg = if let Some(inner) = tail.strip_prefix('(') {
        Some(
            inner
                .strip_suffix(')')
                .ok_or_else(|| EngineError::parse("Unclosed PRAGMA argument"))?
                .trim(),
        )
    } else if let Some(value) = tail.strip_prefix('=') {
        Some(value.trim())
    } else if tail.is_empty() {
        None
    } else {
        return Err(EngineError::parse(format!("Unexpected '{}' after PRAGMA {}", tail, name)));
    };
    let arg = arg.map(|a| a.trim_matches(|c| c == '\'' || c == '"' || c == '`'));
    Ok(Pragma { name, arg })
}

fn row_set(columns: &[&str], rows: Vec<Vec<Value>>) -> StatementResult {
    StatementResult::RowSet { columns: columns.iter().map(|c| c.to_string()).collect(), rows }
}

fn count(n: usize) -> Value {
    Value::Int(n as i64)
}

/// Runs a `PRAGMA` statement and reports its outcome as a row-set.
pub async fn execute(engine: &Engine, sql: &str) -> Result<StatementResult> {
    let pragma = parse(sql)?;
    match (pragma.name.as_str(), pragma.arg) {
        ("shrink_memory", None) => {
            let report = engine.release().await?;
            info!(?report, "shrink_memory");
            Ok(row_set(
                &["pages_flushed", "pages_dropped", "wal_records_compacted"],
                vec![vec![
                    count(report.pages_flushed),
                    count(report.pages_dropped),
                    count(report.wal_records_compacted),
                ]],
            ))
        }
        ("wal_checkpoint", _) => {
            let compacted = engine.checkpoint().await?;
            Ok(row_set(
                &["busy", "log", "checkpointed"],
                vec![vec![Value::Int(0), count(compacted), count(compacted)]],
            ))
        }
        ("cache_size", None) => {
            let stats = engine.buffer_stats();
            Ok(row_set(
                &["cache_size", "cached_pages", "hits", "misses"],
                vec![vec![
                    count(stats.capacity),
                    count(stats.cached),
                    Value::Int(stats.hits as i64),
                    Value::Int(stats.misses as i64),
                ]],
            ))
        }
        ("cache_size", Some(_)) => {
            Err(EngineError::unsupported("cache_size is fixed at startup (buffer_pool_pages)").into())
        }
        ("table_list", None) => {
            let mut rows = Vec::new();
            for name in engine.table_names() {
                let ncol = engine.schema(&name)?.columns.len();
                rows.push(vec![
                    Value::Text(DATABASE_NAME.to_string()),
                    Value::Text(name),
                    Value::Text("table".to_string()),
                    count(ncol),
                ]);
            }
            Ok(row_set(&["schema", "name", "type", "ncol"], rows))
        }
        ("table_info", Some(table)) => {
            let schema = engine.schema(table)?;
            let rows = schema
                .columns
                .iter()
                .enumerate()
                .map(|(cid, c)| {
                    vec![
                        count(cid),
                        Value::Text(c.name.clone()),
                        Value::Text(c.col_type.sql_name().to_string()),
                        Value::Int(i64::from(c.not_null)),
                        c.default.clone().unwrap_or(Value::Null),
                        Value::Int(i64::from(c.primary_key)),
                    ]
                })
                .collect();
            Ok(row_set(&["cid", "name", "type", "notnull", "dflt_value", "pk"], rows))
        }
        ("table_info", None) => Err(EngineError::parse("PRAGMA table_info needs a table name").into()),
        (name, _) => Err(EngineError::unsupported(format!("Unknown pragma '{}'", name)).into()),
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf};

use super::Value;
use crate::error::{codes, EngineError};

/// Storage class of a column.
///
/// ## Type Mapping
/// - `ColumnType::Integer` ↔ `Value::Int(i64)`
/// - `ColumnType::Real` ↔ `Value::Real(f64)`
/// - `ColumnType::Text` ↔ `Value::Text(String)`
///
/// Any column may also hold `Value::Null` unless it is declared NOT NULL.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    /// Maps a declared SQL type name (`INT`, `VARCHAR(20)`, `DOUBLE` ...) to a
    /// storage class. Unknown names fall back to text.
    pub fn from_sql(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        let base = upper.split(|c: char| c == '(' || c.is_whitespace()).next().unwrap_or("");
        match base {
            "INT" | "INTEGER" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "BIGINT" | "BOOL"
            | "BOOLEAN" | "SERIAL" => ColumnType::Integer,
            "REAL" | "FLOAT" | "DOUBLE" | "DECIMAL" | "DEC" | "NUMERIC" => ColumnType::Real,
            _ => ColumnType::Text,
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    /// Converts `value` into this column's storage class.
    pub fn coerce(&self, column: &str, value: Value) -> Result<Value, EngineError> {
        let wrong = |v: &Value| {
            EngineError::new(
                codes::ER_WRONG_VALUE,
                format!(
                    "Incorrect {} value: '{}' for column '{}'",
                    self.sql_name().to_ascii_lowercase(),
                    v.to_text().unwrap_or_default(),
                    column
                ),
            )
        };
        Ok(match (self, value) {
            (_, Value::Null) => Value::Null,
            (ColumnType::Integer, Value::Int(i)) => Value::Int(i),
            (ColumnType::Integer, Value::Real(f)) => Value::Int(f.round() as i64),
            (ColumnType::Integer, Value::Text(s)) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    Value::Int(i)
                } else if let Ok(f) = trimmed.parse::<f64>() {
                    Value::Int(f.round() as i64)
                } else {
                    return Err(wrong(&Value::Text(s)));
                }
            }
            (ColumnType::Real, Value::Int(i)) => Value::Real(i as f64),
            (ColumnType::Real, Value::Real(f)) => Value::Real(f),
            (ColumnType::Real, Value::Text(s)) => match s.trim().parse::<f64>() {
                Ok(f) => Value::Real(f),
                Err(_) => return Err(wrong(&Value::Text(s))),
            },
            (ColumnType::Text, Value::Text(s)) => Value::Text(s),
            (ColumnType::Text, other) => Value::Text(other.to_text().unwrap_or_default()),
        })
    }
}

/// Definition of a single column within a table.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Column {
    /// Column name (unique within a table, compared case-insensitively)
    pub name: String,
    /// Storage class for values in this column
    pub col_type: ColumnType,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    /// Ids are assigned when the inserted value is NULL or omitted
    #[serde(default)]
    pub auto_increment: bool,
    /// Value used when an INSERT column list leaves this column out
    #[serde(default)]
    pub default: Option<Value>,
}

impl Column {
    pub fn new(name: &str, col_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            col_type,
            not_null: false,
            primary_key: false,
            unique: false,
            auto_increment: false,
            default: None,
        }
    }

    /// Whether two rows may not share a value in this column.
    pub fn is_unique(&self) -> bool {
        self.primary_key || self.unique
    }
}

/// Schema of one table: ordered columns plus the auto-increment high-water
/// mark.
///
/// ## Column Ordering
/// The order of `columns` determines:
/// - `SELECT *` projection order
/// - positional `INSERT ... VALUES` matching
/// - the layout of stored rows
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    /// Highest id handed out (or observed) for the auto-increment column
    #[serde(default)]
    pub auto_increment: u64,
}

impl TableSchema {
    pub fn new(name: &str, columns: Vec<Column>) -> Self {
        Self { name: name.to_string(), columns, auto_increment: 0 }
    }

    /// Position of `column` in the row layout.
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(column))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn auto_increment_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.auto_increment)
    }
}

/// Database catalog: table schemas plus the recovery checkpoint.
///
/// Persisted as pretty JSON after every change when a path is configured;
/// the in-memory store runs with no path at all.
///
/// ## File Format
/// ```json
/// {
///   "tables": {
///     "users": {
///       "name": "users",
///       "columns": [{"name": "id", "col_type": "Integer", "primary_key": true, ...}],
///       "auto_increment": 3
///     }
///   },
///   "last_applied_lsn": 42
/// }
/// ```
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct Catalog {
    /// Table schemas keyed by lower-cased table name
    pub tables: BTreeMap<String, TableSchema>,
    /// Highest WAL LSN whose effects are on disk
    pub last_applied_lsn: u64,
    #[serde(skip)]
    path: Option<PathBuf>,
}

/// Catalog key for a table name; table names are case-insensitive.
pub fn table_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl Catalog {
    /// Catalog that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the catalog at `path`, creating an empty one if the file is
    /// missing.
    pub fn load_or_create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let bytes = fs::read(&path)?;
            let mut c: Catalog = serde_json::from_slice(&bytes)?;
            c.path = Some(path);
            Ok(c)
        } else {
            let c = Catalog { path: Some(path), ..Default::default() };
            c.persist()?;
            Ok(c)
        }
    }

    pub fn get(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&table_key(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(&table_key(name))
    }

    pub fn create_table(&mut self, schema: TableSchema) -> Result<()> {
        self.tables.insert(table_key(&schema.name), schema);
        self.persist()
    }

    pub fn drop_table(&mut self, name: &str) -> Result<Option<TableSchema>> {
        let removed = self.tables.remove(&table_key(name));
        self.persist()?;
        Ok(removed)
    }

    /// Raises the auto-increment mark of `table` to at least `seen`.
    pub fn observe_auto_increment(&mut self, table: &str, seen: u64) -> Result<()> {
        if let Some(schema) = self.tables.get_mut(&table_key(table)) {
            if seen > schema.auto_increment {
                schema.auto_increment = seen;
                return self.persist();
            }
        }
        Ok(())
    }

    /// Records that every WAL record up to `lsn` has been applied.
    pub fn update_last_applied_lsn(&mut self, lsn: u64) -> Result<()> {
        self.last_applied_lsn = lsn;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            fs::write(path, serde_json::to_vec_pretty(self)?)?;
        }
        Ok(())
    }
}

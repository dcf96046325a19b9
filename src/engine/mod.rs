use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::HashMap, collections::HashSet, fmt, fs, path::PathBuf, sync::Arc};
use tracing::{debug, info, warn};

mod buffer;
mod catalog;
mod executor;
mod handle;
mod storage;

pub use buffer::{BufferPage, BufferPool, BufferStats};
pub use catalog::{table_key, Catalog, Column, ColumnType, TableSchema};
pub use executor::{
    apply_assignments, execute_select_scan, like_match, run_plan, AggFunc, OrderKey, Projection,
    ScanPlan,
};
pub use handle::{EngineHandle, ExecStats};
pub use storage::{PageId, PageOnDisk, TableStorage, Wal, WalRecord, WalRecordType, PAGE_SIZE};

use crate::config::IN_MEMORY;
use crate::error::{codes, EngineError};

/// A single SQL value.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text-protocol rendering; `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(i) => Some(i.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// Numeric view of the value. Text is parsed the way MySQL does for
    /// arithmetic: leading whitespace ignored, unparsable text is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    /// SQL comparison. `None` when either side is NULL (unknown). Text
    /// compares ASCII case-insensitively, the same rule LIKE uses.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(fold_cmp(a, b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => a.to_text().cmp(&b.to_text()).into(),
            },
        }
    }

    /// Total order used by ORDER BY: NULLs first, then numbers, then text.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Int(_) | Value::Real(_) => 1,
                Value::Text(_) => 2,
            }
        }
        match rank(self).cmp(&rank(other)) {
            Ordering::Equal => self.sql_cmp(other).unwrap_or(Ordering::Equal),
            unequal => unequal,
        }
    }
}

fn fold_cmp(a: &str, b: &str) -> Ordering {
    a.bytes().map(|c| c.to_ascii_lowercase()).cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

/// Key under which UNIQUE columns detect duplicates; agrees with `sql_cmp`.
fn unique_key(v: &Value) -> Option<String> {
    match v {
        Value::Text(s) => Some(s.to_ascii_lowercase()),
        other => other.to_text(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(s) => f.write_str(&s),
            None => f.write_str("NULL"),
        }
    }
}

/// A stored row: one value per column, in schema order.
pub type Row = Vec<Value>;

/// What a statement produced.
#[derive(Clone, Debug, PartialEq)]
pub enum StatementResult {
    /// Column names plus rows; may be empty.
    RowSet { columns: Vec<String>, rows: Vec<Row> },
    /// Row count for INSERT/UPDATE/DELETE/DDL.
    Mutation { affected_rows: u64, last_insert_id: Option<u64> },
}

impl StatementResult {
    pub fn mutation(affected_rows: u64) -> Self {
        StatementResult::Mutation { affected_rows, last_insert_id: None }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    pub fn holds(&self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::NotEq => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::LtEq => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::GtEq => ord != Ordering::Less,
        }
    }
}

/// Row-level scalar expression: literals, column references and arithmetic.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Scalar {
    Literal(Value),
    Column(String),
    Negate(Box<Scalar>),
    Arith { op: ArithOp, left: Box<Scalar>, right: Box<Scalar> },
}

/// WHERE clause condition.
///
/// Column references are by name so a predicate stays meaningful when it is
/// replayed from the WAL.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Predicate {
    /// Constant condition such as `WHERE 1 = 1`
    Const(bool),
    Compare { left: Scalar, op: CmpOp, right: Scalar },
    IsNull(Scalar),
    IsNotNull(Scalar),
    InList { expr: Scalar, list: Vec<Scalar>, negated: bool },
    Like { expr: Scalar, pattern: String, negated: bool },
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

/// Outcome of an INSERT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub last_insert_id: Option<u64>,
}

/// What a memory release gave back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub pages_flushed: usize,
    pub pages_dropped: usize,
    pub wal_records_compacted: usize,
}

/// The storage engine.
///
/// ## Architecture
///
/// ```text
/// ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
/// │    WAL      │    │    Catalog   │    │ Buffer Pool │
/// │ (Durability)│    │  (Schemas)   │    │   (Cache)   │
/// └─────────────┘    └──────────────┘    └─────────────┘
///        │                   │                   │
///        └───────────────────┼───────────────────┘
///                    ┌───────▼────────┐
///                    │     Engine     │
///                    └───────┬────────┘
///                    ┌───────▼────────┐
///                    │ Table Storage  │
///                    │ (file/memory)  │
///                    └────────────────┘
/// ```
///
/// A `:memory:` engine has no WAL and no files; everything else behaves the
/// same. The engine itself does not serialize statements: callers go
/// through [`EngineHandle`], which runs one operation at a time.
pub struct Engine {
    data_dir: Option<PathBuf>,
    catalog: RwLock<Catalog>,
    wal: Option<RwLock<Wal>>,
    buffers: BufferPool,
    /// Storage handles keyed by lower-cased table name
    tables: RwLock<HashMap<String, Arc<TableStorage>>>,
}

impl Engine {
    /// Opens the engine for `storage_path`: `:memory:` for a transient
    /// database, otherwise a data directory (created if missing) that is
    /// recovered from its WAL.
    pub async fn open(storage_path: &str, buffer_pool_pages: usize) -> Result<Self> {
        if storage_path == IN_MEMORY {
            info!(buffer_pool_pages, "opening in-memory engine");
            return Ok(Self::in_memory(buffer_pool_pages));
        }
        Self::open_dir(PathBuf::from(storage_path), buffer_pool_pages).await
    }

    pub fn in_memory(buffer_pool_pages: usize) -> Self {
        Self {
            data_dir: None,
            catalog: RwLock::new(Catalog::in_memory()),
            wal: None,
            buffers: BufferPool::new(buffer_pool_pages),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a file-backed engine.
    ///
    /// 1. Creates `tables/` and `wal/` under `data_dir`
    /// 2. Loads the catalog
    /// 3. Opens the WAL, numbering new records above the catalog checkpoint
    /// 4. Reopens every table file
    /// 5. Replays WAL records newer than `last_applied_lsn`
    async fn open_dir(data_dir: PathBuf, buffer_pool_pages: usize) -> Result<Self> {
        fs::create_dir_all(data_dir.join("tables"))?;
        fs::create_dir_all(data_dir.join("wal"))?;

        let catalog = Catalog::load_or_create(data_dir.join("catalog.json"))?;
        let wal = Wal::open(data_dir.join("wal").join("log.jsonl"), catalog.last_applied_lsn)?;

        let mut tables = HashMap::new();
        for (key, schema) in catalog.tables.iter() {
            let st = TableStorage::open(data_dir.join("tables"), &schema.name)?;
            tables.insert(key.clone(), Arc::new(st));
        }

        let mut engine = Self {
            data_dir: Some(data_dir),
            catalog: RwLock::new(catalog),
            wal: Some(RwLock::new(wal)),
            buffers: BufferPool::new(buffer_pool_pages),
            tables: RwLock::new(tables),
        };
        engine.recover().await?;
        info!(dir = ?engine.data_dir, tables = engine.table_names().len(), "engine opened");
        Ok(engine)
    }

    /// Replays WAL records with LSN > `last_applied_lsn`, in order.
    async fn recover(&mut self) -> Result<()> {
        let last_applied_lsn = self.catalog.read().last_applied_lsn;
        let records = match &self.wal {
            Some(wal) => wal.read().read_from_lsn(last_applied_lsn)?,
            None => return Ok(()),
        };
        if records.is_empty() {
            debug!(last_applied_lsn, "no WAL records to replay");
            return Ok(());
        }

        warn!(count = records.len(), last_applied_lsn, "replaying WAL records");
        let mut max_applied_lsn = last_applied_lsn;
        for r in records {
            let lsn = r.lsn();
            match r {
                WalRecord::CreateTable { schema, .. } => {
                    if !self.catalog.read().contains(&schema.name) {
                        self.apply_create(schema)?;
                    }
                }
                WalRecord::DropTable { name, .. } => {
                    if self.catalog.read().contains(&name) {
                        self.apply_drop(&name).await?;
                    }
                }
                WalRecord::Insert { table, base_rows, rows, .. } => {
                    let present = self.get_storage(&table)?.row_count(&self.buffers).await?;
                    let landed = (present.saturating_sub(base_rows) as usize).min(rows.len());
                    if landed > 0 {
                        debug!(lsn, table = %table, landed, "insert already in table file");
                    }
                    self.apply_insert(&table, rows, landed).await?;
                }
                WalRecord::Update { table, assignments, predicate, .. } => {
                    let schema = self.schema(&table)?;
                    let st = self.get_storage(&table)?;
                    let rows = st.scan(&self.buffers).await?;
                    let (rows, _) =
                        apply_assignments(&schema, rows, &assignments, predicate.as_ref())?;
                    st.replace_rows(&self.buffers, rows).await?;
                }
                WalRecord::Delete { table, predicate, .. } => {
                    self.apply_delete(&table, predicate.as_ref()).await?;
                }
            }
            max_applied_lsn = lsn;
        }

        self.catalog.write().update_last_applied_lsn(max_applied_lsn)?;
        info!(max_applied_lsn, "recovery complete");
        Ok(())
    }

    /// Whether this engine writes to disk.
    pub fn is_persistent(&self) -> bool {
        self.data_dir.is_some()
    }

    pub fn schema(&self, table: &str) -> Result<TableSchema> {
        self.catalog
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| EngineError::no_such_table(table).into())
    }

    /// Table names as declared, sorted case-insensitively.
    pub fn table_names(&self) -> Vec<String> {
        self.catalog.read().tables.values().map(|t| t.name.clone()).collect()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffers.stats()
    }

    /// Creates a table. Returns `false` when it already exists and
    /// `if_not_exists` is set.
    pub async fn create_table(&self, schema: TableSchema, if_not_exists: bool) -> Result<bool> {
        if self.catalog.read().contains(&schema.name) {
            if if_not_exists {
                return Ok(false);
            }
            return Err(EngineError::new(
                codes::ER_TABLE_EXISTS,
                format!("Table '{}' already exists", schema.name),
            )
            .into());
        }
        if schema.columns.is_empty() {
            return Err(EngineError::new(
                codes::ER_TABLE_MUST_HAVE_COLUMNS,
                "A table must have at least 1 column",
            )
            .into());
        }
        let mut seen = HashSet::new();
        for c in &schema.columns {
            if !seen.insert(c.name.to_ascii_lowercase()) {
                return Err(EngineError::new(
                    codes::ER_DUP_FIELDNAME,
                    format!("Duplicate column name '{}'", c.name),
                )
                .into());
            }
        }

        let lsn = self.log(WalRecordType::CreateTable { schema: schema.clone() })?;
        self.apply_create(schema)?;
        self.mark_applied(lsn)?;
        Ok(true)
    }

    fn apply_create(&self, schema: TableSchema) -> Result<()> {
        let st = match &self.data_dir {
            Some(dir) => TableStorage::open(dir.join("tables"), &schema.name)?,
            None => TableStorage::in_memory(&schema.name),
        };
        let key = table_key(&schema.name);
        self.catalog.write().create_table(schema)?;
        self.tables.write().insert(key, Arc::new(st));
        Ok(())
    }

    /// Drops a table. Returns `false` when it is missing and `if_exists` is
    /// set.
    pub async fn drop_table(&self, name: &str, if_exists: bool) -> Result<bool> {
        if !self.catalog.read().contains(name) {
            if if_exists {
                return Ok(false);
            }
            return Err(
                EngineError::new(codes::ER_BAD_TABLE, format!("Unknown table '{}'", name)).into()
            );
        }
        let lsn = self.log(WalRecordType::DropTable { name: name.to_string() })?;
        self.apply_drop(name).await?;
        self.mark_applied(lsn)?;
        Ok(true)
    }

    async fn apply_drop(&self, name: &str) -> Result<()> {
        let st = self.tables.write().remove(&table_key(name));
        if let Some(st) = st {
            st.remove(&self.buffers).await?;
        }
        self.catalog.write().drop_table(name)?;
        Ok(())
    }

    /// Inserts full-width rows (one value per column, NULL where nothing was
    /// given).
    ///
    /// Values are coerced to their column types, NULL auto-increment slots get
    /// the next id, then NOT NULL and UNIQUE/PRIMARY KEY are checked against
    /// the table and the batch. Nothing is written unless every row passes.
    pub async fn insert_rows(&self, table: &str, rows: Vec<Row>) -> Result<InsertOutcome> {
        let schema = self.schema(table)?;
        let st = self.get_storage(table)?;
        let auto_col = schema.auto_increment_column();
        let mut next_id = schema.auto_increment;
        let mut last_insert_id = None;

        let mut prepared = Vec::with_capacity(rows.len());
        for (n, row) in rows.into_iter().enumerate() {
            if row.len() != schema.columns.len() {
                return Err(EngineError::new(
                    codes::ER_WRONG_VALUE_COUNT,
                    format!("Column count doesn't match value count at row {}", n + 1),
                )
                .into());
            }
            let mut out = Vec::with_capacity(row.len());
            for (col, v) in schema.columns.iter().zip(row) {
                out.push(col.col_type.coerce(&col.name, v)?);
            }
            if let Some(idx) = auto_col {
                match out[idx].clone() {
                    Value::Null => {
                        next_id += 1;
                        out[idx] = Value::Int(next_id as i64);
                        last_insert_id = Some(next_id);
                    }
                    Value::Int(i) if i > 0 => {
                        next_id = next_id.max(i as u64);
                        last_insert_id = Some(i as u64);
                    }
                    _ => {}
                }
            }
            check_not_null(&schema, &out)?;
            prepared.push(out);
        }

        let base_rows = if schema.columns.iter().any(Column::is_unique) {
            let existing = st.scan(&self.buffers).await?;
            check_unique(&schema, existing.iter().chain(prepared.iter()))?;
            existing.len() as u64
        } else {
            st.row_count(&self.buffers).await?
        };

        let inserted = prepared.len() as u64;
        if inserted == 0 {
            return Ok(InsertOutcome { inserted, last_insert_id: None });
        }
        let lsn = self.log(WalRecordType::Insert {
            table: schema.name.clone(),
            base_rows,
            rows: prepared.clone(),
        })?;
        self.apply_insert(&schema.name, prepared, 0).await?;
        self.mark_applied(lsn)?;
        Ok(InsertOutcome { inserted, last_insert_id })
    }

    /// Appends `rows` after skipping the first `landed`, which are already
    /// stored. The auto-increment counter observes every row either way.
    async fn apply_insert(&self, table: &str, mut rows: Vec<Row>, landed: usize) -> Result<()> {
        let st = self.get_storage(table)?;
        let auto_col = self.schema(table)?.auto_increment_column();
        let max_id = rows
            .iter()
            .filter_map(|row| match auto_col.and_then(|idx| row.get(idx)) {
                Some(Value::Int(i)) if *i > 0 => Some(*i as u64),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        rows.drain(..landed.min(rows.len()));
        st.append_rows(&self.buffers, rows).await?;
        self.buffers.flush_all_for(&st).await?;
        self.catalog.write().observe_auto_increment(table, max_id)?;
        Ok(())
    }

    /// Runs a scan plan against one table.
    pub async fn select(&self, table: &str, plan: &ScanPlan) -> Result<Vec<Row>> {
        let schema = self.schema(table)?;
        let st = self.get_storage(table)?;
        execute_select_scan(&st, &self.buffers, &schema, plan).await
    }

    /// Applies `assignments` to every row matching `predicate`. Returns the
    /// number of matched rows.
    pub async fn update(
        &self,
        table: &str,
        assignments: Vec<(String, Scalar)>,
        predicate: Option<Predicate>,
    ) -> Result<u64> {
        let schema = self.schema(table)?;
        for (column, _) in &assignments {
            if schema.index_of(column).is_none() {
                return Err(EngineError::unknown_column(column).into());
            }
        }
        let st = self.get_storage(table)?;
        let rows = st.scan(&self.buffers).await?;
        let (rows, matched) = apply_assignments(&schema, rows, &assignments, predicate.as_ref())?;
        if matched == 0 {
            return Ok(0);
        }
        for row in &rows {
            check_not_null(&schema, row)?;
        }
        check_unique(&schema, rows.iter())?;

        let lsn = self.log(WalRecordType::Update {
            table: schema.name.clone(),
            assignments,
            predicate,
        })?;
        st.replace_rows(&self.buffers, rows).await?;
        self.mark_applied(lsn)?;
        Ok(matched)
    }

    /// Deletes rows matching `predicate` (all rows when `None`).
    pub async fn delete(&self, table: &str, predicate: Option<Predicate>) -> Result<u64> {
        let schema = self.schema(table)?;
        let st = self.get_storage(table)?;
        let rows = st.scan(&self.buffers).await?;
        let matched = rows.iter().filter(|r| executor::matches(&schema, r, predicate.as_ref())).count();
        if matched == 0 {
            return Ok(0);
        }
        let lsn = self.log(WalRecordType::Delete { table: schema.name.clone(), predicate: predicate.clone() })?;
        self.apply_delete(&schema.name, predicate.as_ref()).await?;
        self.mark_applied(lsn)?;
        Ok(matched as u64)
    }

    async fn apply_delete(&self, table: &str, predicate: Option<&Predicate>) -> Result<u64> {
        let schema = self.schema(table)?;
        let st = self.get_storage(table)?;
        let rows = st.scan(&self.buffers).await?;
        let before = rows.len();
        let kept: Vec<Row> =
            rows.into_iter().filter(|r| !executor::matches(&schema, r, predicate)).collect();
        let removed = (before - kept.len()) as u64;
        st.replace_rows(&self.buffers, kept).await?;
        Ok(removed)
    }

    /// Flushes dirty pages and truncates the WAL up to the checkpoint.
    /// Returns the number of WAL records removed.
    pub async fn checkpoint(&self) -> Result<usize> {
        self.buffers.flush_all().await?;
        let applied = self.catalog.read().last_applied_lsn;
        match &self.wal {
            Some(wal) => wal.write().compact(applied),
            None => Ok(0),
        }
    }

    /// Gives cached memory back: flush, empty the buffer pool, compact the
    /// WAL. Data stays intact and the next statement reloads pages lazily.
    pub async fn release(&self) -> Result<ReleaseReport> {
        let pages_flushed = self.buffers.flush_all().await?;
        let pages_dropped = self.buffers.clear();
        let wal_records_compacted = self.checkpoint().await?;
        let report = ReleaseReport { pages_flushed, pages_dropped, wal_records_compacted };
        debug!(?report, "engine memory released");
        Ok(report)
    }

    /// Flushes everything to storage. The engine must not be used afterwards.
    pub async fn close(&self) -> Result<()> {
        self.checkpoint().await?;
        self.buffers.clear();
        info!(persistent = self.is_persistent(), "engine closed");
        Ok(())
    }

    fn log(&self, record_type: WalRecordType) -> Result<Option<u64>> {
        match &self.wal {
            Some(wal) => {
                let mut wal = wal.write();
                let record = wal.create_record(record_type);
                wal.append(&record)?;
                Ok(Some(record.lsn()))
            }
            None => Ok(None),
        }
    }

    fn mark_applied(&self, lsn: Option<u64>) -> Result<()> {
        if let Some(lsn) = lsn {
            self.catalog.write().update_last_applied_lsn(lsn)?;
        }
        Ok(())
    }

    fn get_storage(&self, table: &str) -> Result<Arc<TableStorage>> {
        self.tables
            .read()
            .get(&table_key(table))
            .cloned()
            .ok_or_else(|| EngineError::no_such_table(table).into())
    }
}

fn check_not_null(schema: &TableSchema, row: &[Value]) -> Result<(), EngineError> {
    for (col, v) in schema.columns.iter().zip(row) {
        if col.not_null && v.is_null() {
            return Err(EngineError::new(
                codes::ER_BAD_NULL,
                format!("Column '{}' cannot be null", col.name),
            ));
        }
    }
    Ok(())
}

fn check_unique<'a>(
    schema: &TableSchema,
    rows: impl Iterator<Item = &'a Row> + Clone,
) -> Result<(), EngineError> {
    for (idx, col) in schema.columns.iter().enumerate().filter(|(_, c)| c.is_unique()) {
        let mut seen = HashSet::new();
        for row in rows.clone() {
            let Some(value) = row.get(idx) else { continue };
            let Some(key) = unique_key(value) else { continue };
            if !seen.insert(key) {
                let key = value.to_text().unwrap_or_default();
                let key_name = if col.primary_key { "PRIMARY" } else { col.name.as_str() };
                return Err(EngineError::new(
                    codes::ER_DUP_ENTRY,
                    format!("Duplicate entry '{}' for key '{}.{}'", key, schema.name, key_name),
                ));
            }
        }
    }
    Ok(())
}

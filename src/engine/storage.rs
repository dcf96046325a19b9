use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs as tfs;

use super::{catalog::table_key, BufferPool, Predicate, Row, Scalar, TableSchema};

/// Target page size (4KB). A page grows until its serialized form would
/// exceed this; a single oversized row still gets a page of its own.
pub const PAGE_SIZE: usize = 4096;

/// Page number within one table, starting at 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

/// A page as stored: an ordered run of rows.
///
/// ## Serialization
/// Pages are serialized with `bincode`; a table file is a `Vec<PageOnDisk>`.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct PageOnDisk {
    pub rows: Vec<Row>,
}

impl PageOnDisk {
    pub fn empty() -> Self {
        Self { rows: Vec::new() }
    }

    /// Moves all rows out of this page, leaving it empty.
    pub fn take(&mut self) -> Self {
        PageOnDisk { rows: std::mem::take(&mut self.rows) }
    }

    fn encoded_len(&self) -> Result<u64> {
        Ok(bincode::serialized_size(self)?)
    }
}

/// Where a table's pages live.
enum Backing {
    /// `<dir>/<table>.tbl`, one bincode-encoded `Vec<PageOnDisk>`
    File(PathBuf),
    /// Pages kept in process memory for `:memory:` databases
    Memory(Mutex<Vec<PageOnDisk>>),
}

/// Paged row storage for a single table.
///
/// ## File Structure
/// ```text
/// tables/<name>.tbl:
/// [Page0][Page1][Page2]...[PageN]   (bincode Vec<PageOnDisk>)
/// ```
///
/// Point reads and writes go through the [`BufferPool`]; bulk rewrites
/// (UPDATE, DELETE) flush the table's dirty pages, rewrite the whole page
/// list and then drop the table's cached pages so no stale copy survives.
pub struct TableStorage {
    /// Table name as declared
    pub name: String,
    backing: Backing,
}

impl TableStorage {
    /// Opens the file-backed storage for `name` under `dir`, creating an empty
    /// table file if none exists.
    pub fn open(dir: PathBuf, name: &str) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let path = Self::file_path(&dir, name);
        if !path.exists() {
            let empty_pages: Vec<PageOnDisk> = Vec::new();
            fs::write(&path, bincode::serialize(&empty_pages)?)?;
        }
        Ok(Self { name: name.to_string(), backing: Backing::File(path) })
    }

    pub fn in_memory(name: &str) -> Self {
        Self { name: name.to_string(), backing: Backing::Memory(Mutex::new(Vec::new())) }
    }

    fn file_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.tbl", table_key(name)))
    }

    /// Cache key component; table names are case-insensitive.
    pub fn key(&self) -> String {
        table_key(&self.name)
    }

    async fn load(&self) -> Result<Vec<PageOnDisk>> {
        match &self.backing {
            Backing::File(path) => {
                let data = match tfs::read(path).await {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("reading table file {}", path.display())))
                    }
                };
                if data.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(bincode::deserialize(&data)?)
                }
            }
            Backing::Memory(pages) => Ok(pages.lock().clone()),
        }
    }

    async fn store(&self, pages: Vec<PageOnDisk>) -> Result<()> {
        match &self.backing {
            Backing::File(path) => {
                let bytes = bincode::serialize(&pages)?;
                tfs::write(path, bytes).await?;
            }
            Backing::Memory(slot) => *slot.lock() = pages,
        }
        Ok(())
    }

    /// Reads one page; a page past the end reads as empty.
    pub async fn read_page(&self, pid: PageId) -> Result<PageOnDisk> {
        let mut pages = self.load().await?;
        let idx = pid.0 as usize;
        if idx < pages.len() {
            Ok(pages.swap_remove(idx))
        } else {
            Ok(PageOnDisk::empty())
        }
    }

    /// Writes a page in place, padding the table with empty pages if needed.
    pub async fn write_page(&self, pid: PageId, page: PageOnDisk) -> Result<()> {
        let mut pages = self.load().await?;
        let idx = pid.0 as usize;
        if idx >= pages.len() {
            pages.resize(idx + 1, PageOnDisk::empty());
        }
        pages[idx] = page;
        self.store(pages).await
    }

    pub async fn page_count(&self) -> Result<u64> {
        Ok(self.load().await?.len() as u64)
    }

    /// Appends `rows` in order. The last page is filled through the buffer
    /// pool; rows that do not fit are paginated and written in one store, so
    /// the table is loaded a bounded number of times per call.
    pub async fn append_rows(self: &Arc<Self>, buffers: &BufferPool, rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut count = self.page_count().await?;
        if count == 0 {
            self.write_page(PageId(0), PageOnDisk::empty()).await?;
            count = 1;
        }

        let last_pid = PageId(count - 1);
        let buf_page = buffers.get_or_load(self, last_pid).await?;
        let mut rows = rows.into_iter();
        let mut spill = Vec::new();
        {
            let mut page_data = buf_page.data.write();
            for row in rows.by_ref() {
                page_data.rows.push(row);
                if page_data.rows.len() > 1 && page_data.encoded_len()? > PAGE_SIZE as u64 {
                    spill.extend(page_data.rows.pop());
                    break;
                }
            }
            *buf_page.dirty.write() = true;
        }
        spill.extend(rows);

        if !spill.is_empty() {
            let mut pages = self.load().await?;
            pages.resize(count as usize, PageOnDisk::empty());
            pages.extend(paginate(spill)?);
            self.store(pages).await?;
        }
        Ok(())
    }

    /// Number of stored rows, counting unflushed appends.
    pub async fn row_count(&self, buffers: &BufferPool) -> Result<u64> {
        buffers.flush_all_for(self).await?;
        Ok(self.load().await?.iter().map(|p| p.rows.len() as u64).sum())
    }

    /// Every row in page order. Dirty pages of this table are flushed first
    /// so recent appends are visible.
    pub async fn scan(&self, buffers: &BufferPool) -> Result<Vec<Row>> {
        buffers.flush_all_for(self).await?;
        Ok(self.load().await?.into_iter().flat_map(|p| p.rows).collect())
    }

    /// Replaces the table contents with `rows`, repaginated, and drops the
    /// table's pages from the buffer pool.
    pub async fn replace_rows(&self, buffers: &BufferPool, rows: Vec<Row>) -> Result<()> {
        buffers.flush_all_for(self).await?;
        let pages = paginate(rows)?;
        self.store(pages).await?;
        buffers.evict_table(&self.key());
        Ok(())
    }

    /// Deletes the backing file (if any) and forgets cached pages.
    pub async fn remove(&self, buffers: &BufferPool) -> Result<()> {
        buffers.evict_table(&self.key());
        match &self.backing {
            Backing::File(path) => {
                if path.exists() {
                    tfs::remove_file(path).await?;
                }
            }
            Backing::Memory(pages) => pages.lock().clear(),
        }
        Ok(())
    }
}

fn paginate(rows: Vec<Row>) -> Result<Vec<PageOnDisk>> {
    let mut pages = Vec::new();
    let mut current = PageOnDisk::empty();
    for row in rows {
        current.rows.push(row);
        if current.rows.len() > 1 && current.encoded_len()? > PAGE_SIZE as u64 {
            if let Some(spill) = current.rows.pop() {
                pages.push(std::mem::replace(&mut current, PageOnDisk { rows: vec![spill] }));
            }
        }
    }
    if !current.rows.is_empty() {
        pages.push(current);
    }
    Ok(pages)
}

/// One logged change, ordered by its Log Sequence Number.
///
/// Row changes are logged once per statement, so a multi-row INSERT or a
/// bulk UPDATE is a single record and replays as a unit.
///
/// ## Serialization Format
/// JSON Lines, discriminated by `type`:
/// ```json
/// {"type":"Insert","lsn":4,"table":"users","base_rows":0,"rows":[[{"Int":1},{"Text":"ada"}]]}
/// ```
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum WalRecord {
    CreateTable {
        lsn: u64,
        schema: TableSchema,
    },
    DropTable {
        lsn: u64,
        name: String,
    },
    /// Fully materialized rows, auto-increment ids already assigned.
    /// `base_rows` is the table's row count before the insert; replay skips
    /// rows that already landed past it.
    Insert {
        lsn: u64,
        table: String,
        base_rows: u64,
        rows: Vec<Row>,
    },
    Update {
        lsn: u64,
        table: String,
        assignments: Vec<(String, Scalar)>,
        predicate: Option<Predicate>,
    },
    Delete {
        lsn: u64,
        table: String,
        predicate: Option<Predicate>,
    },
}

impl WalRecord {
    pub fn lsn(&self) -> u64 {
        match self {
            WalRecord::CreateTable { lsn, .. }
            | WalRecord::DropTable { lsn, .. }
            | WalRecord::Insert { lsn, .. }
            | WalRecord::Update { lsn, .. }
            | WalRecord::Delete { lsn, .. } => *lsn,
        }
    }
}

/// A [`WalRecord`] before the log has assigned it an LSN.
#[derive(Clone, Debug)]
pub enum WalRecordType {
    CreateTable { schema: TableSchema },
    DropTable { name: String },
    Insert { table: String, base_rows: u64, rows: Vec<Row> },
    Update { table: String, assignments: Vec<(String, Scalar)>, predicate: Option<Predicate> },
    Delete { table: String, predicate: Option<Predicate> },
}

/// Write-ahead log for file-backed databases.
///
/// ## Architecture
/// ```text
/// Statement → create_record() → append() + fsync → apply to tables
///           → flush table pages → catalog.last_applied_lsn = lsn
/// ```
///
/// ## Compaction
/// Once every record is applied and the table files are flushed, the log can
/// be truncated (`compact`). LSNs keep counting from the catalog checkpoint so
/// a truncated log never hands out an LSN that recovery would skip.
pub struct Wal {
    path: PathBuf,
    file: File,
    next_lsn: u64,
}

impl Wal {
    /// Opens or creates the log. `floor_lsn` is the highest LSN already known
    /// to be applied; new records are numbered above both it and anything
    /// still in the file.
    pub fn open(path: PathBuf, floor_lsn: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let existing = Self::read_records_from_path(&path)?;
        let max_in_file = existing.iter().map(WalRecord::lsn).max().unwrap_or(0);
        let file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        Ok(Self { path, file, next_lsn: max_in_file.max(floor_lsn) + 1 })
    }

    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Assigns the next LSN to `record_type`.
    pub fn create_record(&mut self, record_type: WalRecordType) -> WalRecord {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        match record_type {
            WalRecordType::CreateTable { schema } => WalRecord::CreateTable { lsn, schema },
            WalRecordType::DropTable { name } => WalRecord::DropTable { lsn, name },
            WalRecordType::Insert { table, base_rows, rows } => {
                WalRecord::Insert { lsn, table, base_rows, rows }
            }
            WalRecordType::Update { table, assignments, predicate } => {
                WalRecord::Update { lsn, table, assignments, predicate }
            }
            WalRecordType::Delete { table, predicate } => {
                WalRecord::Delete { lsn, table, predicate }
            }
        }
    }

    /// Appends and fsyncs; the record is durable once this returns.
    pub fn append(&mut self, rec: &WalRecord) -> Result<()> {
        let line = serde_json::to_string(rec)?;
        writeln!(self.file, "{}", line)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn read_records_from_path(path: &Path) -> Result<Vec<WalRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let f = OpenOptions::new().read(true).open(path)?;
        let reader = BufReader::new(f);
        let mut out = Vec::new();
        for line in reader.lines() {
            let l = line?;
            if l.trim().is_empty() {
                continue;
            }
            let rec: WalRecord = serde_json::from_str(&l)?;
            out.push(rec);
        }
        Ok(out)
    }

    pub fn read_all(&self) -> Result<Vec<WalRecord>> {
        Self::read_records_from_path(&self.path)
    }

    /// Records with LSN strictly greater than `from_lsn`.
    pub fn read_from_lsn(&self, from_lsn: u64) -> Result<Vec<WalRecord>> {
        let all_records = self.read_all()?;
        Ok(all_records.into_iter().filter(|r| r.lsn() > from_lsn).collect())
    }

    /// Drops every record with LSN ≤ `applied_lsn`. Returns how many were
    /// removed.
    pub fn compact(&mut self, applied_lsn: u64) -> Result<usize> {
        let all = self.read_all()?;
        let before = all.len();
        let keep: Vec<WalRecord> = all.into_iter().filter(|r| r.lsn() > applied_lsn).collect();
        let removed = before - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp)?;
            for rec in &keep {
                writeln!(out, "{}", serde_json::to_string(rec)?)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().create(true).read(true).append(true).open(&self.path)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CmpOp, Value};

    fn text_row(i: i64, len: usize) -> Row {
        vec![Value::Int(i), Value::Text("x".repeat(len))]
    }

    #[tokio::test]
    async fn appends_spill_into_new_pages() {
        let buffers = BufferPool::new(8);
        let st = Arc::new(TableStorage::in_memory("t"));
        for i in 0..10 {
            st.append_rows(&buffers, vec![text_row(i, 1000)]).await.unwrap();
        }
        assert!(st.page_count().await.unwrap() >= 3);
        let rows = st.scan(&buffers).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, (0..10).map(Value::Int).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn one_batch_fills_the_last_page_then_spills_in_order() {
        let buffers = BufferPool::new(8);
        let st = Arc::new(TableStorage::in_memory("t"));
        st.append_rows(&buffers, vec![text_row(0, 10)]).await.unwrap();
        let batch: Vec<Row> = (1..12).map(|i| text_row(i, 1000)).collect();
        st.append_rows(&buffers, batch).await.unwrap();
        st.append_rows(&buffers, Vec::new()).await.unwrap();

        assert!(st.page_count().await.unwrap() >= 3);
        assert_eq!(st.row_count(&buffers).await.unwrap(), 12);
        let ids: Vec<_> = st.scan(&buffers).await.unwrap().into_iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, (0..12).map(Value::Int).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unreadable_table_file_is_an_error_not_an_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let buffers = BufferPool::new(4);
        let st = Arc::new(TableStorage::open(dir.path().to_path_buf(), "items").unwrap());
        st.append_rows(&buffers, vec![text_row(1, 3)]).await.unwrap();
        buffers.flush_all().await.unwrap();
        buffers.clear();

        let path = dir.path().join("items.tbl");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        assert!(st.scan(&buffers).await.is_err());
        assert!(st.row_count(&buffers).await.is_err());
    }

    #[tokio::test]
    async fn file_backing_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let buffers = BufferPool::new(4);
        {
            let st = Arc::new(TableStorage::open(dir.path().to_path_buf(), "Items").unwrap());
            st.append_rows(&buffers, vec![text_row(1, 3), text_row(2, 3)]).await.unwrap();
            buffers.flush_all().await.unwrap();
        }
        assert!(dir.path().join("items.tbl").exists());
        let st = TableStorage::open(dir.path().to_path_buf(), "items").unwrap();
        let fresh = BufferPool::new(4);
        assert_eq!(st.scan(&fresh).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn replace_rows_leaves_no_stale_cache() {
        let buffers = BufferPool::new(4);
        let st = Arc::new(TableStorage::in_memory("t"));
        st.append_rows(&buffers, vec![text_row(1, 3), text_row(2, 3)]).await.unwrap();
        st.replace_rows(&buffers, vec![text_row(2, 3)]).await.unwrap();
        assert_eq!(buffers.stats().cached, 0);

        st.append_rows(&buffers, vec![text_row(3, 3)]).await.unwrap();
        let rows = st.scan(&buffers).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Int(2));
    }

    #[tokio::test]
    async fn remove_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let buffers = BufferPool::new(4);
        let st = TableStorage::open(dir.path().to_path_buf(), "gone").unwrap();
        st.remove(&buffers).await.unwrap();
        assert!(!dir.path().join("gone.tbl").exists());
    }

    #[test]
    fn wal_numbers_records_above_the_floor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal").join("log.jsonl");
        let mut wal = Wal::open(path.clone(), 0).unwrap();
        let first = wal.create_record(WalRecordType::DropTable { name: "a".into() });
        wal.append(&first).unwrap();
        let second = wal.create_record(WalRecordType::Delete {
            table: "b".into(),
            predicate: Some(Predicate::Compare {
                left: Scalar::Column("id".into()),
                op: CmpOp::Eq,
                right: Scalar::Literal(Value::Int(1)),
            }),
        });
        wal.append(&second).unwrap();
        assert_eq!((first.lsn(), second.lsn()), (1, 2));
        assert_eq!(wal.read_from_lsn(1).unwrap(), vec![second]);

        assert_eq!(wal.compact(2).unwrap(), 2);
        assert!(wal.read_all().unwrap().is_empty());
        drop(wal);

        let mut reopened = Wal::open(path, 2).unwrap();
        assert_eq!(reopened.next_lsn(), 3);
        let third = reopened.create_record(WalRecordType::DropTable { name: "c".into() });
        reopened.append(&third).unwrap();
        assert_eq!(reopened.read_all().unwrap().len(), 1);
    }

    #[test]
    fn compaction_keeps_unapplied_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("log.jsonl"), 0).unwrap();
        for name in ["a", "b", "c"] {
            let rec = wal.create_record(WalRecordType::DropTable { name: name.into() });
            wal.append(&rec).unwrap();
        }
        assert_eq!(wal.compact(2).unwrap(), 2);
        let left = wal.read_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].lsn(), 3);
    }
}

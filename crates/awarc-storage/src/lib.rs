//! Versioned, partitioned parquet table with content-hash merge-upsert.
//!
//! A table is a directory of immutable segment files
//! (`partition=<key>/part-<uuid>.parquet`) plus an append-only `_log/`
//! directory of committed versions. Version files are written with
//! `create_new`, which doubles as the optimistic-concurrency check: two
//! writers racing for the same version collide on the filesystem and the
//! loser surfaces [`StorageError::MergeConflict`] with the table left at its
//! prior version.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow_array::{Array, ArrayRef, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field, Schema};
use chrono::{DateTime, SecondsFormat, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "awarc-storage";

/// Hex characters kept from the SHA-256 digest of the canonical payload.
pub const CONTENT_HASH_LEN: usize = 16;

const LOG_DIR: &str = "_log";
const COL_PAYLOAD: &str = "payload";
const COL_CONTENT_HASH: &str = "content_hash";
const COL_FIRST_SEEN: &str = "first_seen_at";
const COL_LAST_UPDATED: &str = "last_updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid record or batch: {0}")]
    Validation(String),
    #[error("concurrent commit detected for version {version} of table {table}")]
    MergeConflict { table: String, version: u64 },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("retention horizon would drop segments still referenced by an open snapshot at version {pinned}")]
    RetentionViolation { pinned: u64 },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::StorageUnavailable(err.to_string())
    }
}

impl From<ParquetError> for StorageError {
    fn from(err: ParquetError) -> Self {
        StorageError::StorageUnavailable(err.to_string())
    }
}

impl From<ArrowError> for StorageError {
    fn from(err: ArrowError) -> Self {
        StorageError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::StorageUnavailable(err.to_string())
    }
}

/// Canonical encoding of a payload: object fields sorted lexicographically at
/// every level, numbers in `serde_json`'s fixed shortest-roundtrip form,
/// `null` spelled literally, no insignificant whitespace. The `denylist`
/// drops volatile top-level fields before encoding.
pub fn canonical_json<S: AsRef<str>>(payload: &Map<String, Value>, denylist: &[S]) -> String {
    let mut out = String::new();
    let sorted: BTreeMap<&String, &Value> = payload
        .iter()
        .filter(|(key, _)| !denylist.iter().any(|d| d.as_ref() == key.as_str()))
        .collect();
    out.push('{');
    for (index, (key, value)) in sorted.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_canonical(&Value::String((*key).clone()), &mut out);
        out.push(':');
        write_canonical(value, &mut out);
    }
    out.push('}');
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(_) => {
            let encoded =
                serde_json::to_string(value).expect("JSON string serialization is infallible");
            out.push_str(&encoded);
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (index, (key, nested)) in sorted.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String((*key).clone()), out);
                out.push(':');
                write_canonical(nested, out);
            }
            out.push('}');
        }
    }
}

/// Deterministic fingerprint of a payload's business fields: truncated hex
/// SHA-256 over [`canonical_json`]. Field insertion order and denylisted
/// fields never influence the result.
pub fn content_hash<S: AsRef<str>>(payload: &Map<String, Value>, denylist: &[S]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload, denylist).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..CONTENT_HASH_LEN].to_string()
}

fn key_scalar(field: &str, value: &Value) -> Result<String, StorageError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(StorageError::Validation(format!(
            "merge key field '{field}' must be a scalar, got {value}"
        ))),
    }
}

fn extract_merge_key(
    payload: &Map<String, Value>,
    merge_keys: &[String],
) -> Result<Vec<String>, StorageError> {
    merge_keys
        .iter()
        .map(|field| {
            let value = payload.get(field).ok_or_else(|| {
                StorageError::Validation(format!("merge key field '{field}' missing from payload"))
            })?;
            key_scalar(field, value)
        })
        .collect()
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Per-table configuration: which payload fields form the merge key and which
/// volatile fields are excluded from the content hash.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub merge_keys: Vec<String>,
    pub hash_denylist: Vec<String>,
}

/// One immutable parquet segment as recorded in the version log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub partition: String,
    pub path: String,
    pub rows: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    version: u64,
    timestamp: DateTime<Utc>,
    operation: String,
    add: Vec<SegmentMeta>,
    remove: Vec<SegmentMeta>,
}

#[derive(Debug, Clone)]
struct RemovedSegment {
    meta: SegmentMeta,
    added_version: u64,
    removed_version: u64,
    removed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TableState {
    version: Option<u64>,
    active: Vec<(SegmentMeta, u64)>,
    removed: Vec<RemovedSegment>,
}

impl TableState {
    fn partition_segments(&self, partition: &str) -> Vec<SegmentMeta> {
        self.active
            .iter()
            .filter(|(meta, _)| meta.partition == partition)
            .map(|(meta, _)| meta.clone())
            .collect()
    }
}

/// One stored row read back from a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub key: Vec<String>,
    pub payload: Map<String, Value>,
    pub content_hash: String,
    pub first_seen_at: String,
    pub last_updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactStats {
    pub partition: String,
    pub segments_before: usize,
    pub compacted: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VacuumStats {
    pub files_deleted: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OptimizeStats {
    pub partitions_compacted: usize,
    pub files_deleted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub version: Option<u64>,
    pub partitions: Vec<String>,
    pub active_segments: usize,
    pub rows: u64,
}

/// Consistent view of the table at the version current when it was opened.
///
/// Open snapshots pin their version in the owning table's reader registry;
/// [`Table::vacuum`] refuses to delete segments a pinned version still
/// references. The pin is released on drop.
pub struct Snapshot {
    root: PathBuf,
    merge_keys: Vec<String>,
    version: Option<u64>,
    active: Vec<SegmentMeta>,
    pins: Arc<Mutex<Vec<u64>>>,
}

impl Snapshot {
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn rows(&self, partition: &str) -> Result<Vec<StoredRow>, StorageError> {
        let mut rows = Vec::new();
        for meta in self.active.iter().filter(|m| m.partition == partition) {
            rows.extend(read_segment(&self.root, &self.merge_keys, meta)?);
        }
        Ok(rows)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if let Some(version) = self.version {
            let mut pins = self.pins.lock().expect("reader registry poisoned");
            if let Some(index) = pins.iter().position(|pin| *pin == version) {
                pins.remove(index);
            }
        }
    }
}

/// Versioned, partitioned parquet table.
#[derive(Debug)]
pub struct Table {
    root: PathBuf,
    config: TableConfig,
    pins: Arc<Mutex<Vec<u64>>>,
}

impl Table {
    /// Binds a table handle to a location. The location is created lazily on
    /// the first commit; opening a non-existent table is cheap and valid.
    pub fn open(root: impl Into<PathBuf>, config: TableConfig) -> Result<Self, StorageError> {
        if config.merge_keys.is_empty() {
            return Err(StorageError::Validation(
                "table config must declare at least one merge key".to_string(),
            ));
        }
        let reserved = [COL_PAYLOAD, COL_CONTENT_HASH, COL_FIRST_SEEN, COL_LAST_UPDATED];
        if let Some(clash) = config
            .merge_keys
            .iter()
            .find(|key| reserved.contains(&key.as_str()))
        {
            return Err(StorageError::Validation(format!(
                "merge key field '{clash}' collides with a reserved segment column"
            )));
        }
        Ok(Self {
            root: root.into(),
            config,
            pins: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    fn load_state(&self) -> Result<TableState, StorageError> {
        let mut entries: Vec<(u64, PathBuf)> = Vec::new();
        let dir = match fs::read_dir(self.log_dir()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(TableState {
                    version: None,
                    active: Vec::new(),
                    removed: Vec::new(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(version) = stem.parse::<u64>() {
                    entries.push((version, entry.path()));
                }
            }
        }
        entries.sort_by_key(|(version, _)| *version);

        let mut version = None;
        let mut active: BTreeMap<String, (SegmentMeta, u64)> = BTreeMap::new();
        let mut removed = Vec::new();
        for (_, path) in &entries {
            let text = fs::read_to_string(path)?;
            let log: LogEntry = serde_json::from_str(&text)?;
            for gone in &log.remove {
                if let Some((meta, added_version)) = active.remove(&gone.path) {
                    removed.push(RemovedSegment {
                        meta,
                        added_version,
                        removed_version: log.version,
                        removed_at: log.timestamp,
                    });
                }
            }
            for added in &log.add {
                active.insert(added.path.clone(), (added.clone(), log.version));
            }
            version = Some(log.version);
        }
        Ok(TableState {
            version,
            active: active.into_values().collect(),
            removed,
        })
    }

    pub fn current_version(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.load_state()?.version)
    }

    /// Opens a consistent read view and pins its version against vacuum.
    pub fn snapshot(&self) -> Result<Snapshot, StorageError> {
        let state = self.load_state()?;
        if let Some(version) = state.version {
            self.pins
                .lock()
                .expect("reader registry poisoned")
                .push(version);
        }
        Ok(Snapshot {
            root: self.root.clone(),
            merge_keys: self.config.merge_keys.clone(),
            version: state.version,
            active: state.active.into_iter().map(|(meta, _)| meta).collect(),
            pins: Arc::clone(&self.pins),
        })
    }

    /// Current rows of one partition.
    pub fn read_partition(&self, partition: &str) -> Result<Vec<StoredRow>, StorageError> {
        let state = self.load_state()?;
        let mut rows = Vec::new();
        for meta in state.partition_segments(partition) {
            rows.extend(read_segment(&self.root, &self.config.merge_keys, &meta)?);
        }
        Ok(rows)
    }

    /// Merge-upserts one batch of payloads into a partition as a single
    /// atomic commit.
    ///
    /// Classification against the committed state of the partition: a merge
    /// key absent from the partition is an insert; a present key with a
    /// different content hash is an update (payload replaced,
    /// `first_seen_at` preserved, `last_updated_at` bumped to `now`); a
    /// present key with an identical hash is not written at all. A batch
    /// that classifies entirely as unchanged commits nothing and the table
    /// version does not advance.
    pub fn merge(
        &self,
        partition: &str,
        batch: &[Map<String, Value>],
        now: DateTime<Utc>,
    ) -> Result<MergeStats, StorageError> {
        let state = self.load_state()?;
        self.merge_from(&state, partition, batch, now)
    }

    fn merge_from(
        &self,
        state: &TableState,
        partition: &str,
        batch: &[Map<String, Value>],
        now: DateTime<Utc>,
    ) -> Result<MergeStats, StorageError> {
        struct Incoming<'a> {
            key: Vec<String>,
            payload: &'a Map<String, Value>,
            hash: String,
        }

        let mut seen: HashSet<Vec<String>> = HashSet::new();
        let mut incoming = Vec::with_capacity(batch.len());
        for payload in batch {
            let key = extract_merge_key(payload, &self.config.merge_keys)?;
            if !seen.insert(key.clone()) {
                return Err(StorageError::Validation(format!(
                    "duplicate merge key {key:?} within one batch"
                )));
            }
            let hash = content_hash(payload, &self.config.hash_denylist);
            incoming.push(Incoming { key, payload, hash });
        }

        struct ExistingRow {
            hash: String,
            first_seen_at: String,
            segment: String,
        }

        let segments = state.partition_segments(partition);
        let mut loaded: Vec<(SegmentMeta, Vec<StoredRow>)> = Vec::with_capacity(segments.len());
        let mut existing: HashMap<Vec<String>, ExistingRow> = HashMap::new();
        for meta in segments {
            let rows = read_segment(&self.root, &self.config.merge_keys, &meta)?;
            for row in &rows {
                existing.insert(
                    row.key.clone(),
                    ExistingRow {
                        hash: row.content_hash.clone(),
                        first_seen_at: row.first_seen_at.clone(),
                        segment: meta.path.clone(),
                    },
                );
            }
            loaded.push((meta, rows));
        }

        let now_str = format_ts(now);
        let mut stats = MergeStats {
            inserted: 0,
            updated: 0,
            unchanged: 0,
            version: state.version,
        };
        let mut new_rows: Vec<StoredRow> = Vec::new();
        let mut updated_keys: HashSet<Vec<String>> = HashSet::new();
        let mut touched: HashSet<String> = HashSet::new();
        for item in incoming {
            match existing.get(&item.key) {
                None => {
                    stats.inserted += 1;
                    new_rows.push(StoredRow {
                        key: item.key,
                        payload: item.payload.clone(),
                        content_hash: item.hash,
                        first_seen_at: now_str.clone(),
                        last_updated_at: now_str.clone(),
                    });
                }
                Some(row) if row.hash == item.hash => stats.unchanged += 1,
                Some(row) => {
                    stats.updated += 1;
                    touched.insert(row.segment.clone());
                    new_rows.push(StoredRow {
                        key: item.key.clone(),
                        payload: item.payload.clone(),
                        content_hash: item.hash,
                        first_seen_at: row.first_seen_at.clone(),
                        last_updated_at: now_str.clone(),
                    });
                    updated_keys.insert(item.key);
                }
            }
        }

        if new_rows.is_empty() {
            debug!(partition, unchanged = stats.unchanged, "merge is a no-op");
            return Ok(stats);
        }

        let mut add = Vec::new();
        let mut remove = Vec::new();
        let mut written: Vec<PathBuf> = Vec::new();
        let mut rewrite = || -> Result<(), StorageError> {
            for (meta, rows) in &loaded {
                if !touched.contains(&meta.path) {
                    continue;
                }
                remove.push(meta.clone());
                let survivors: Vec<StoredRow> = rows
                    .iter()
                    .filter(|row| !updated_keys.contains(&row.key))
                    .cloned()
                    .collect();
                if !survivors.is_empty() {
                    let (survivor_meta, abs) = self.write_segment(partition, &survivors)?;
                    written.push(abs);
                    add.push(survivor_meta);
                }
            }
            let (new_meta, abs) = self.write_segment(partition, &new_rows)?;
            written.push(abs);
            add.push(new_meta);
            Ok(())
        };
        if let Err(err) = rewrite() {
            for path in &written {
                let _ = fs::remove_file(path);
            }
            return Err(err);
        }

        match self.commit(state.version, "merge", add, remove, now) {
            Ok(version) => {
                stats.version = Some(version);
                info!(
                    partition,
                    inserted = stats.inserted,
                    updated = stats.updated,
                    unchanged = stats.unchanged,
                    version,
                    "merge committed"
                );
                Ok(stats)
            }
            Err(err) => {
                for path in &written {
                    let _ = fs::remove_file(path);
                }
                Err(err)
            }
        }
    }

    /// Rewrites a partition's segments into one. A partition already served
    /// by a single segment is left untouched and the version does not
    /// advance.
    pub fn compact(
        &self,
        partition: &str,
        now: DateTime<Utc>,
    ) -> Result<CompactStats, StorageError> {
        let state = self.load_state()?;
        let segments = state.partition_segments(partition);
        if segments.len() <= 1 {
            return Ok(CompactStats {
                partition: partition.to_string(),
                segments_before: segments.len(),
                compacted: false,
            });
        }

        let mut rows = Vec::new();
        for meta in &segments {
            rows.extend(read_segment(&self.root, &self.config.merge_keys, meta)?);
        }
        let (meta, abs) = self.write_segment(partition, &rows)?;
        match self.commit(state.version, "compact", vec![meta], segments.clone(), now) {
            Ok(version) => {
                info!(
                    partition,
                    segments_before = segments.len(),
                    version,
                    "partition compacted"
                );
                Ok(CompactStats {
                    partition: partition.to_string(),
                    segments_before: segments.len(),
                    compacted: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(abs);
                Err(err)
            }
        }
    }

    /// Permanently deletes segment files that belong only to versions older
    /// than the retention horizon. Refuses with
    /// [`StorageError::RetentionViolation`] if an open snapshot still pins a
    /// version that references a candidate file; nothing is deleted in that
    /// case.
    pub fn vacuum(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<VacuumStats, StorageError> {
        let state = self.load_state()?;
        let retention = chrono::Duration::from_std(retention).map_err(|_| {
            StorageError::Validation("retention duration out of range".to_string())
        })?;
        let horizon = now - retention;

        let candidates: Vec<&RemovedSegment> = state
            .removed
            .iter()
            .filter(|gone| gone.removed_at < horizon && self.root.join(&gone.meta.path).exists())
            .collect();
        if candidates.is_empty() {
            return Ok(VacuumStats { files_deleted: 0 });
        }

        {
            let pins = self.pins.lock().expect("reader registry poisoned");
            for pin in pins.iter() {
                for gone in &candidates {
                    if gone.added_version <= *pin && *pin < gone.removed_version {
                        return Err(StorageError::RetentionViolation { pinned: *pin });
                    }
                }
            }
        }

        let mut files_deleted = 0;
        for gone in candidates {
            fs::remove_file(self.root.join(&gone.meta.path))?;
            files_deleted += 1;
        }
        info!(files_deleted, "vacuum removed expired segments");
        Ok(VacuumStats { files_deleted })
    }

    /// Compacts every partition, then vacuums versions past the retention
    /// horizon. Both halves are idempotent.
    pub fn optimize(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<OptimizeStats, StorageError> {
        let info = self.info()?;
        let mut partitions_compacted = 0;
        for partition in &info.partitions {
            if self.compact(partition, now)?.compacted {
                partitions_compacted += 1;
            }
        }
        let vacuum = self.vacuum(retention, now)?;
        Ok(OptimizeStats {
            partitions_compacted,
            files_deleted: vacuum.files_deleted,
        })
    }

    pub fn info(&self) -> Result<TableInfo, StorageError> {
        let state = self.load_state()?;
        let partitions: BTreeSet<String> = state
            .active
            .iter()
            .map(|(meta, _)| meta.partition.clone())
            .collect();
        Ok(TableInfo {
            version: state.version,
            partitions: partitions.into_iter().collect(),
            active_segments: state.active.len(),
            rows: state.active.iter().map(|(meta, _)| meta.rows).sum(),
        })
    }

    fn write_segment(
        &self,
        partition: &str,
        rows: &[StoredRow],
    ) -> Result<(SegmentMeta, PathBuf), StorageError> {
        let relative = format!("partition={partition}/part-{}.parquet", Uuid::new_v4());
        let absolute = self.root.join(&relative);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut fields: Vec<Field> = self
            .config
            .merge_keys
            .iter()
            .map(|key| Field::new(key, DataType::Utf8, false))
            .collect();
        for name in [COL_PAYLOAD, COL_CONTENT_HASH, COL_FIRST_SEEN, COL_LAST_UPDATED] {
            fields.push(Field::new(name, DataType::Utf8, false));
        }
        let schema = Arc::new(Schema::new(fields));

        let mut columns: Vec<ArrayRef> = Vec::new();
        for index in 0..self.config.merge_keys.len() {
            columns.push(Arc::new(StringArray::from_iter_values(
                rows.iter().map(|row| row.key[index].as_str()),
            )));
        }
        let empty: [&str; 0] = [];
        columns.push(Arc::new(StringArray::from_iter_values(
            rows.iter().map(|row| canonical_json(&row.payload, &empty)),
        )));
        columns.push(Arc::new(StringArray::from_iter_values(
            rows.iter().map(|row| row.content_hash.as_str()),
        )));
        columns.push(Arc::new(StringArray::from_iter_values(
            rows.iter().map(|row| row.first_seen_at.as_str()),
        )));
        columns.push(Arc::new(StringArray::from_iter_values(
            rows.iter().map(|row| row.last_updated_at.as_str()),
        )));

        let batch = RecordBatch::try_new(schema, columns)?;
        let file = File::create(&absolute)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        debug!(path = relative, rows = rows.len(), "segment written");

        Ok((
            SegmentMeta {
                partition: partition.to_string(),
                path: relative,
                rows: rows.len() as u64,
            },
            absolute,
        ))
    }

    fn commit(
        &self,
        base: Option<u64>,
        operation: &str,
        add: Vec<SegmentMeta>,
        remove: Vec<SegmentMeta>,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let version = base.map_or(0, |current| current + 1);
        let entry = LogEntry {
            version,
            timestamp: now,
            operation: operation.to_string(),
            add,
            remove,
        };
        fs::create_dir_all(self.log_dir())?;
        let path = self.log_dir().join(format!("{version:08}.json"));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::MergeConflict {
                    table: self.root.display().to_string(),
                    version,
                });
            }
            Err(err) => return Err(err.into()),
        };
        file.write_all(&serde_json::to_vec_pretty(&entry)?)?;
        file.flush()?;
        Ok(version)
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, StorageError> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| {
            StorageError::StorageUnavailable(format!("segment is missing UTF-8 column '{name}'"))
        })
}

fn read_segment(
    root: &Path,
    merge_keys: &[String],
    meta: &SegmentMeta,
) -> Result<Vec<StoredRow>, StorageError> {
    let file = File::open(root.join(&meta.path))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut rows = Vec::with_capacity(meta.rows as usize);
    for batch in reader {
        let batch = batch?;
        let payloads = string_column(&batch, COL_PAYLOAD)?;
        let hashes = string_column(&batch, COL_CONTENT_HASH)?;
        let first_seen = string_column(&batch, COL_FIRST_SEEN)?;
        let last_updated = string_column(&batch, COL_LAST_UPDATED)?;
        let mut key_columns = Vec::with_capacity(merge_keys.len());
        for key in merge_keys {
            key_columns.push(string_column(&batch, key)?);
        }
        for index in 0..batch.num_rows() {
            let payload = match serde_json::from_str::<Value>(payloads.value(index))? {
                Value::Object(map) => map,
                other => {
                    return Err(StorageError::StorageUnavailable(format!(
                        "segment {} row {index} holds a non-object payload: {other}",
                        meta.path
                    )));
                }
            };
            rows.push(StoredRow {
                key: key_columns
                    .iter()
                    .map(|column| column.value(index).to_string())
                    .collect(),
                payload,
                content_hash: hashes.value(index).to_string(),
                first_seen_at: first_seen.value(index).to_string(),
                last_updated_at: last_updated.value(index).to_string(),
            });
        }
    }
    Ok(rows)
}

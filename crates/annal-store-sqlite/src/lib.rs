use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use annal_core::{
    HistoryConfig, HistoryError, HistoryId, HistoryRecord, HistoryStore, IndexSpec, Operation,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

/// Store-level options resolved alongside the tracking configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Alternate database file backing this history collection. Collections
    /// without an override share the registry's default database.
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub collection: String,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
}

/// Explicit store-handle cache: one [`SqliteHistory`] per resolved history
/// collection name, created on first use and shared for the registry's
/// lifetime. Owned by the embedding application rather than hidden in a
/// process-wide static, so it can be torn down and multi-instanced in tests.
pub struct HistoryRegistry {
    default_database: PathBuf,
    connections: Mutex<BTreeMap<PathBuf, Arc<Mutex<Connection>>>>,
    handles: Mutex<BTreeMap<String, Arc<SqliteHistory>>>,
}

impl HistoryRegistry {
    #[must_use]
    pub fn new(default_database: impl Into<PathBuf>) -> Self {
        Self {
            default_database: default_database.into(),
            connections: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(BTreeMap::new()),
        }
    }

    /// Return the store handle for a tracking configuration, creating and
    /// registering it on first use. Idempotent per resolved collection name:
    /// racing first calls serialize behind the registry lock, the first
    /// completed registration wins, and every later caller receives that
    /// instance.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid, the resolved name
    /// is not a usable table identifier, or registration fails.
    pub fn handle_for(
        &self,
        config: &HistoryConfig,
        options: &StoreOptions,
    ) -> Result<Arc<SqliteHistory>> {
        config.validate().map_err(|err| anyhow!("history configuration rejected: {err}"))?;
        let name = config.history_collection_name();
        validate_identifier(&name)?;

        let mut handles =
            self.handles.lock().map_err(|_| anyhow!("history registry mutex is poisoned"))?;
        if let Some(handle) = handles.get(&name) {
            return Ok(Arc::clone(handle));
        }

        let database = options.database.clone().unwrap_or_else(|| self.default_database.clone());
        let conn = self.connection(&database)?;
        let handle = Arc::new(SqliteHistory::register(conn, &name, &config.indexes)?);
        handles.insert(name, Arc::clone(&handle));
        Ok(handle)
    }

    /// Run the quick-check health probe against the default database.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or probed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.connection(&self.default_database)?;
        let guard = conn.lock().map_err(|_| anyhow!("history connection mutex is poisoned"))?;
        let message: String = guard
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run PRAGMA quick_check")?;
        Ok(IntegrityReport { quick_check_ok: message == "ok", quick_check_message: message })
    }

    fn connection(&self, database: &Path) -> Result<Arc<Mutex<Connection>>> {
        let mut connections =
            self.connections.lock().map_err(|_| anyhow!("history registry mutex is poisoned"))?;
        if let Some(conn) = connections.get(database) {
            return Ok(Arc::clone(conn));
        }
        let conn = Arc::new(Mutex::new(open_connection(database)?));
        connections.insert(database.to_path_buf(), Arc::clone(&conn));
        Ok(conn)
    }
}

/// Append-only store handle for one history collection (one SQLite table).
pub struct SqliteHistory {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteHistory {
    fn register(
        conn: Arc<Mutex<Connection>>,
        table: &str,
        indexes: &[IndexSpec],
    ) -> Result<Self> {
        {
            let guard =
                conn.lock().map_err(|_| anyhow!("history connection mutex is poisoned"))?;
            guard
                .execute_batch(&create_table_sql(table))
                .with_context(|| format!("failed to register history collection {table}"))?;
            for spec in indexes {
                let sql = create_index_sql(table, spec)?;
                guard
                    .execute_batch(&sql)
                    .with_context(|| format!("failed to create declared index on {table}"))?;
            }
        }
        Ok(Self { conn, table: table.to_string() })
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.table
    }

    /// Append one history record inside a transaction.
    ///
    /// # Errors
    /// Returns an error when serialization or any write in the transaction
    /// fails.
    pub fn append_record(&self, record: &HistoryRecord) -> Result<()> {
        let mut conn = self.lock_connection()?;
        let tx = conn.transaction().context("failed to start history transaction")?;
        tx.execute(
            &format!(
                "INSERT INTO \"{}\"(
                    history_id, recorded_at, operation, document_id, collection_name,
                    document_json, diff_json, additional_json, modified_by_json, metadata_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                self.table
            ),
            params![
                record.history_id.to_string(),
                rfc3339(record.date)?,
                record.operation.as_str(),
                record.document_id,
                record.collection_name,
                serde_json::to_string(&record.document)
                    .context("failed to serialize document snapshot")?,
                encode_json_option(record.diff.as_ref(), "diff")?,
                encode_json_option(record.additional_fields.as_ref(), "additional fields")?,
                encode_json_option(record.modified_by.as_ref(), "actor")?,
                serde_json::to_string(&record.metadata)
                    .context("failed to serialize metadata")?,
            ],
        )
        .context("failed to insert history record")?;
        tx.commit().context("failed to commit history transaction")?;
        Ok(())
    }

    /// Load records in append order, optionally filtered by subject id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list(&self, document_id: Option<&str>, limit: Option<u64>) -> Result<Vec<HistoryRecord>> {
        let conn = self.lock_connection()?;
        let mut sql = format!(
            "SELECT history_id, recorded_at, operation, document_id, collection_name,
                    document_json, diff_json, additional_json, modified_by_json, metadata_json
             FROM \"{}\"",
            self.table
        );
        if document_id.is_some() {
            sql.push_str(" WHERE document_id = ?1");
        }
        // rowid preserves append order; record ids carry no ordering contract.
        sql.push_str(" ORDER BY rowid ASC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = match document_id {
            Some(id) => stmt.query(params![id])?,
            None => stmt.query([])?,
        };

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_row(row)?);
        }
        Ok(records)
    }

    /// Number of records currently stored for this collection.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self) -> Result<u64> {
        let conn = self.lock_connection()?;
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", self.table), [], |row| row.get(0))
            .context("failed to count history records")?;
        u64::try_from(count).map_err(|_| anyhow!("history row count is negative"))
    }

    /// Delete every record in this collection; maintenance use only.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_all(&self) -> Result<u64> {
        let conn = self.lock_connection()?;
        let removed = conn
            .execute(&format!("DELETE FROM \"{}\"", self.table), [])
            .context("failed to clear history collection")?;
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }

    /// Export this collection as deterministic NDJSON plus a manifest with
    /// per-file digests.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or
    /// serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let records = self.list(None, None)?;
        let file_name = format!("{}.ndjson", self.table);
        let (sha256, exported) = write_ndjson_file(&out_dir.join(&file_name), &records)?;

        let manifest = ExportManifest {
            collection: self.table.clone(),
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest { path: file_name, sha256, records: exported }],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    fn lock_connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("history connection mutex is poisoned"))
    }
}

impl HistoryStore for SqliteHistory {
    fn append(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        self.append_record(record).map_err(|err| HistoryError::Store(format!("{err:#}")))
    }

    fn clear(&self) -> Result<u64, HistoryError> {
        self.clear_all().map_err(|err| HistoryError::Store(format!("{err:#}")))
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(conn)
}

fn validate_identifier(name: &str) -> Result<()> {
    let usable = !name.is_empty()
        && !name.starts_with(|ch: char| ch.is_ascii_digit())
        && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if usable {
        Ok(())
    } else {
        Err(anyhow!(HistoryError::Configuration(format!(
            "history collection name is not a usable identifier: {name}"
        ))))
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
  history_id TEXT PRIMARY KEY,
  recorded_at TEXT NOT NULL,
  operation TEXT NOT NULL CHECK (operation IN ('insert','update','remove')),
  document_id TEXT,
  collection_name TEXT,
  document_json TEXT NOT NULL,
  diff_json TEXT,
  additional_json TEXT,
  modified_by_json TEXT,
  metadata_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS \"idx_{table}_document_id\" ON \"{table}\"(document_id);
CREATE INDEX IF NOT EXISTS \"idx_{table}_recorded_at\" ON \"{table}\"(recorded_at);"
    )
}

fn create_index_sql(table: &str, spec: &IndexSpec) -> Result<String> {
    if spec.columns.is_empty() {
        return Err(anyhow!("index declarations MUST name at least one column"));
    }
    for column in &spec.columns {
        validate_identifier(column)?;
    }
    let name = match &spec.name {
        Some(name) => {
            validate_identifier(name)?;
            name.clone()
        }
        None => format!("idx_{table}_{}", spec.columns.join("_")),
    };
    let unique = if spec.unique { "UNIQUE " } else { "" };
    Ok(format!(
        "CREATE {unique}INDEX IF NOT EXISTS \"{name}\" ON \"{table}\"({})",
        spec.columns.join(", ")
    ))
}

fn encode_json_option<T: Serialize>(value: Option<&T>, what: &str) -> Result<Option<String>> {
    match value {
        Some(value) => Ok(Some(
            serde_json::to_string(value).with_context(|| format!("failed to serialize {what}"))?,
        )),
        None => Ok(None),
    }
}

fn decode_json_option<T: DeserializeOwned>(value: Option<String>, what: &str) -> Result<Option<T>> {
    match value {
        Some(text) => Ok(Some(
            serde_json::from_str(&text)
                .with_context(|| format!("failed to deserialize {what}"))?,
        )),
        None => Ok(None),
    }
}

fn decode_row(row: &rusqlite::Row<'_>) -> Result<HistoryRecord> {
    let history_id_raw: String = row.get(0)?;
    let recorded_at_raw: String = row.get(1)?;
    let operation_raw: String = row.get(2)?;
    let document_json: String = row.get(5)?;
    let diff_json: Option<String> = row.get(6)?;
    let additional_json: Option<String> = row.get(7)?;
    let modified_by_json: Option<String> = row.get(8)?;
    let metadata_json: String = row.get(9)?;

    Ok(HistoryRecord {
        history_id: HistoryId(
            Ulid::from_string(&history_id_raw)
                .map_err(|err| anyhow!("invalid history_id {history_id_raw}: {err}"))?,
        ),
        date: OffsetDateTime::parse(&recorded_at_raw, &Rfc3339)
            .map_err(|err| anyhow!("invalid recorded_at {recorded_at_raw}: {err}"))?,
        operation: Operation::parse(&operation_raw)
            .ok_or_else(|| anyhow!("unknown operation: {operation_raw}"))?,
        document: serde_json::from_str(&document_json)
            .context("failed to deserialize document snapshot")?,
        diff: decode_json_option(diff_json, "diff")?,
        additional_fields: decode_json_option(additional_json, "additional fields")?,
        document_id: row.get(3)?,
        collection_name: row.get(4)?,
        modified_by: decode_json_option(modified_by_json, "actor")?,
        metadata: serde_json::from_str(&metadata_json)
            .context("failed to deserialize metadata")?,
    })
}

fn write_ndjson_file<T: Serialize>(path: &Path, rows: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for row in rows {
        let line = serde_json::to_string(row).context("failed to serialize export row")?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
    }
    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), rows.len()))
}

fn rfc3339(at: OffsetDateTime) -> Result<String> {
    at.format(&Rfc3339).context("failed to format record timestamp")
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format timestamp")
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use annal_core::{HistoryTracker, MutationContext};
    use serde_json::{json, Map};
    use time::Duration;

    use super::*;

    fn unique_temp_db(prefix: &str) -> PathBuf {
        let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_nanos(),
            Err(err) => panic!("clock should be >= UNIX_EPOCH: {err}"),
        };
        std::env::temp_dir().join(format!("annal-{prefix}-{now}.sqlite3"))
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_record(document_id: &str, operation: Operation) -> HistoryRecord {
        HistoryRecord {
            history_id: HistoryId::new(),
            date: fixture_time(),
            operation,
            document: json!({"_id": document_id, "title": "A", "message": "M"}),
            diff: Some(json!({"_id": document_id, "title": "A"})),
            additional_fields: None,
            document_id: Some(document_id.to_string()),
            collection_name: Some("posts".to_string()),
            modified_by: Some(json!({"name": "ada"})),
            metadata: Map::new(),
        }
    }

    fn open_handle(registry: &HistoryRegistry, config: &HistoryConfig) -> Arc<SqliteHistory> {
        match registry.handle_for(config, &StoreOptions::default()) {
            Ok(handle) => handle,
            Err(err) => panic!("handle should register: {err}"),
        }
    }

    fn append_ok(handle: &SqliteHistory, record: &HistoryRecord) {
        if let Err(err) = handle.append_record(record) {
            panic!("record should append: {err}");
        }
    }

    fn list_ok(
        handle: &SqliteHistory,
        document_id: Option<&str>,
        limit: Option<u64>,
    ) -> Vec<HistoryRecord> {
        match handle.list(document_id, limit) {
            Ok(records) => records,
            Err(err) => panic!("records should list: {err}"),
        }
    }

    #[test]
    fn registry_returns_the_cached_handle() {
        let registry = HistoryRegistry::new(unique_temp_db("cached"));
        let config = HistoryConfig::new("posts");

        let first = open_handle(&registry, &config);
        let second = open_handle(&registry, &config);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.collection(), "posts_history");
    }

    #[test]
    fn concurrent_first_access_yields_exactly_one_handle() {
        let registry = Arc::new(HistoryRegistry::new(unique_temp_db("race")));
        let config = HistoryConfig::new("posts");

        let mut handles = Vec::new();
        std::thread::scope(|scope| {
            let workers = (0..8)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    let config = config.clone();
                    scope.spawn(move || match registry.handle_for(&config, &StoreOptions::default())
                    {
                        Ok(handle) => handle,
                        Err(err) => panic!("racing registration should succeed: {err}"),
                    })
                })
                .collect::<Vec<_>>();
            for worker in workers {
                match worker.join() {
                    Ok(handle) => handles.push(handle),
                    Err(_) => panic!("racing registration thread panicked"),
                }
            }
        });

        let Some(first) = handles.first() else {
            panic!("at least one handle should exist");
        };
        assert!(handles.iter().all(|handle| Arc::ptr_eq(first, handle)));
    }

    #[test]
    fn append_then_list_round_trips_the_record_shape() {
        let registry = HistoryRegistry::new(unique_temp_db("roundtrip"));
        let handle = open_handle(&registry, &HistoryConfig::new("posts"));

        let record = fixture_record("a1", Operation::Insert);
        append_ok(&handle, &record);

        let listed = list_ok(&handle, None, None);
        assert_eq!(listed, vec![record]);
    }

    #[test]
    fn list_filters_by_document_id_and_respects_limit() {
        let registry = HistoryRegistry::new(unique_temp_db("filter"));
        let handle = open_handle(&registry, &HistoryConfig::new("posts"));

        append_ok(&handle, &fixture_record("a1", Operation::Insert));
        append_ok(&handle, &fixture_record("a1", Operation::Update));
        append_ok(&handle, &fixture_record("b2", Operation::Insert));

        let trail = list_ok(&handle, Some("a1"), None);
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].operation, Operation::Insert);
        assert_eq!(trail[1].operation, Operation::Update);

        let limited = list_ok(&handle, None, Some(1));
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].document_id.as_deref(), Some("a1"));
    }

    #[test]
    fn clear_reports_the_removed_count() {
        let registry = HistoryRegistry::new(unique_temp_db("clear"));
        let handle = open_handle(&registry, &HistoryConfig::new("posts"));

        append_ok(&handle, &fixture_record("a1", Operation::Insert));
        append_ok(&handle, &fixture_record("a2", Operation::Insert));
        match handle.count() {
            Ok(count) => assert_eq!(count, 2),
            Err(err) => panic!("count should succeed: {err}"),
        }

        match handle.clear_all() {
            Ok(removed) => assert_eq!(removed, 2),
            Err(err) => panic!("clear should succeed: {err}"),
        }
        assert!(list_ok(&handle, None, None).is_empty());
    }

    #[test]
    fn alternate_database_isolates_collections() {
        let registry = HistoryRegistry::new(unique_temp_db("main"));
        let alternate = unique_temp_db("alternate");

        let mut offsite = HistoryConfig::new("audits");
        offsite.custom_collection_name = Some("audits_offsite".to_string());
        let handle = match registry
            .handle_for(&offsite, &StoreOptions { database: Some(alternate.clone()) })
        {
            Ok(handle) => handle,
            Err(err) => panic!("alternate connection should register: {err}"),
        };

        append_ok(&handle, &fixture_record("a1", Operation::Insert));
        assert!(alternate.exists());
        assert_eq!(list_ok(&handle, None, None).len(), 1);
    }

    #[test]
    fn declared_indexes_are_created_verbatim() {
        let registry = HistoryRegistry::new(unique_temp_db("indexes"));
        let mut config = HistoryConfig::new("posts");
        config.indexes = vec![IndexSpec {
            name: Some("idx_posts_history_actor_probe".to_string()),
            columns: vec!["document_id".to_string(), "operation".to_string()],
            unique: false,
        }];
        let handle = open_handle(&registry, &config);

        let conn = match handle.lock_connection() {
            Ok(conn) => conn,
            Err(err) => panic!("connection should lock: {err}"),
        };
        let found: i64 = match conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            params!["idx_posts_history_actor_probe"],
            |row| row.get(0),
        ) {
            Ok(found) => found,
            Err(err) => panic!("sqlite_master should be queryable: {err}"),
        };
        assert_eq!(found, 1);
    }

    #[test]
    fn unusable_collection_names_are_rejected() {
        let registry = HistoryRegistry::new(unique_temp_db("names"));
        let mut config = HistoryConfig::new("posts");
        config.custom_collection_name = Some("posts-history; DROP TABLE".to_string());

        assert!(registry.handle_for(&config, &StoreOptions::default()).is_err());
    }

    #[test]
    fn export_writes_manifest_and_matching_digest() {
        let registry = HistoryRegistry::new(unique_temp_db("export"));
        let handle = open_handle(&registry, &HistoryConfig::new("posts"));
        append_ok(&handle, &fixture_record("a1", Operation::Insert));
        append_ok(&handle, &fixture_record("a1", Operation::Remove));

        let out_dir = std::env::temp_dir().join(format!(
            "annal-export-{}",
            match SystemTime::now().duration_since(UNIX_EPOCH) {
                Ok(elapsed) => elapsed.as_nanos(),
                Err(err) => panic!("clock should be >= UNIX_EPOCH: {err}"),
            }
        ));
        let manifest = match handle.export_snapshot(&out_dir) {
            Ok(manifest) => manifest,
            Err(err) => panic!("export should succeed: {err}"),
        };

        assert_eq!(manifest.collection, "posts_history");
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].records, 2);

        let body = match fs::read(out_dir.join(&manifest.files[0].path)) {
            Ok(body) => body,
            Err(err) => panic!("export file should exist: {err}"),
        };
        let mut hasher = Sha256::new();
        hasher.update(&body);
        assert_eq!(format!("{:x}", hasher.finalize()), manifest.files[0].sha256);
        assert_eq!(body.iter().filter(|byte| **byte == b'\n').count(), 2);
    }

    #[test]
    fn integrity_probe_reports_ok_for_a_fresh_database() {
        let registry = HistoryRegistry::new(unique_temp_db("probe"));
        let _handle = open_handle(&registry, &HistoryConfig::new("posts"));

        match registry.integrity_check() {
            Ok(report) => {
                assert!(report.quick_check_ok);
                assert_eq!(report.quick_check_message, "ok");
            }
            Err(err) => panic!("integrity probe should run: {err}"),
        }
    }

    #[tokio::test]
    async fn tracker_persists_through_a_registry_handle() {
        let registry = HistoryRegistry::new(unique_temp_db("tracker"));
        let mut config = HistoryConfig::new("posts");
        config.include_collection_name = true;
        let handle = open_handle(&registry, &config);

        let tracker = HistoryTracker::new(config, Arc::clone(&handle));
        let recorded = match tracker
            .record_insert(&json!({"_id": "a1", "title": "A"}), &MutationContext::new())
            .await
        {
            Ok(record) => record,
            Err(err) => panic!("insert should record: {err}"),
        };

        let listed = list_ok(&handle, Some("a1"), None);
        assert_eq!(listed, vec![recorded]);

        match tracker.clear_history() {
            Ok(removed) => assert_eq!(removed, 1),
            Err(err) => panic!("clear should succeed: {err}"),
        }
        assert_eq!(list_ok(&handle, None, None).len(), 0);
    }
}

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use fieldbook_core::ActionKind;
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use super::queue::{ActionId, ActionStatus, PendingAction};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DEVICE_ID_KEY: &str = "device_id";
const ACTIVE_SESSION_KEY: &str = "current";
const ACTION_COLUMNS: &str =
    "id, kind, payload, created_at, synced, status, attempt, retry_at, last_error";
const RECORD_COLUMNS: &str = "key, data, provenance, watermark, updated_at";

// Primary result codes; extended codes carry them in the low byte.
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistent storage is unavailable: {0}")]
    StorageUnavailable(String),
    #[error("local store is corrupt: {0}")]
    StoreCorrupt(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid stored json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid provenance: {0}")]
    InvalidProvenance(String),
    #[error("invalid action status: {0}")]
    InvalidActionStatus(String),
    #[error("invalid action kind: {0}")]
    InvalidActionKind(String),
    #[error("table {table} has no {index:?} index")]
    UnsupportedIndex { table: Table, index: Index },
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// Logical tables holding cached read models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Clients,
    Sessions,
    Invoices,
    BillingRates,
    ActiveSession,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Clients => "clients",
            Table::Sessions => "sessions",
            Table::Invoices => "invoices",
            Table::BillingRates => "billing_rates",
            Table::ActiveSession => "active_session",
        }
    }

    fn has_index(&self, index: Index) -> bool {
        match self {
            Table::Sessions => true,
            Table::Invoices | Table::BillingRates => index == Index::ClientId,
            Table::Clients | Table::ActiveSession => false,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    ClientId,
    StartedAt,
}

/// An index together with the value to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKey<'a> {
    ClientId(&'a str),
    StartedAt(i64),
}

impl IndexKey<'_> {
    fn index(&self) -> Index {
        match self {
            IndexKey::ClientId(_) => Index::ClientId,
            IndexKey::StartedAt(_) => Index::StartedAt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Confirmed,
    Pending,
}

impl Provenance {
    fn as_str(&self) -> &'static str {
        match self {
            Provenance::Confirmed => "confirmed",
            Provenance::Pending => "pending",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "confirmed" => Ok(Provenance::Confirmed),
            "pending" => Ok(Provenance::Pending),
            other => Err(StoreError::InvalidProvenance(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub data: Value,
    pub provenance: Provenance,
    pub watermark: i64,
    pub updated_at: i64,
}

impl Record {
    fn client_id(&self) -> Option<&str> {
        self.data.get("client_id").and_then(Value::as_str)
    }

    fn started_at(&self) -> Option<i64> {
        self.data.get("started_at").and_then(Value::as_i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

/// Raised when the store had to fall back to memory-only operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWarning {
    pub reason: String,
}

impl fmt::Display for StoreWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "local data is kept in memory only and will not survive a restart ({})",
            self.reason
        )
    }
}

#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    device_id: String,
    persistent: bool,
}

impl LocalStore {
    pub async fn open(location: &StoreLocation) -> Result<Self, StoreError> {
        match location {
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|err| {
                        StoreError::StorageUnavailable(format!(
                            "cannot create {}: {err}",
                            parent.display()
                        ))
                    })?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true);
                let pool = SqlitePool::connect_with(options)
                    .await
                    .map_err(classify_open_error)?;
                Self::with_pool(pool, true).await
            }
            StoreLocation::Memory => {
                let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
                // The database lives as long as one connection does.
                let pool = SqlitePoolOptions::new()
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await
                    .map_err(classify_open_error)?;
                Self::with_pool(pool, false).await
            }
        }
    }

    /// Opens the on-disk store, degrading to memory when the platform
    /// refuses persistent storage. Corruption is not masked.
    pub async fn open_or_fallback(path: &Path) -> Result<(Self, Option<StoreWarning>), StoreError> {
        match Self::open(&StoreLocation::File(path.to_path_buf())).await {
            Ok(store) => Ok((store, None)),
            Err(StoreError::StorageUnavailable(reason)) => {
                tracing::warn!(%reason, "persistent storage unavailable, using in-memory store");
                let store = Self::open(&StoreLocation::Memory).await?;
                Ok((store, Some(StoreWarning { reason })))
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes the database file and opens a fresh, empty store in its place.
    pub async fn reset(path: &Path) -> Result<Self, StoreError> {
        for candidate in [
            path.to_path_buf(),
            sidecar_path(path, "-wal"),
            sidecar_path(path, "-shm"),
        ] {
            match fs::remove_file(&candidate) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StoreError::StorageUnavailable(format!(
                        "cannot remove {}: {err}",
                        candidate.display()
                    )));
                }
            }
        }
        tracing::info!(path = %path.display(), "local store reset");
        Self::open(&StoreLocation::File(path.to_path_buf())).await
    }

    /// Wraps an existing pool, migrating it first. Used by tests and embedders.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        Self::with_pool(pool, false).await
    }

    async fn with_pool(pool: SqlitePool, persistent: bool) -> Result<Self, StoreError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|err| StoreError::StoreCorrupt(err.to_string()))?;
        let device_id = load_or_create_device_id(&pool).await?;
        Ok(Self {
            pool,
            device_id,
            persistent,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }

    pub async fn begin(&self) -> Result<StoreTx, StoreError> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn put(&self, table: Table, record: &Record) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        put_record(&mut conn, table, record).await
    }

    /// Writes every record or none of them.
    pub async fn put_batch(&self, records: &[(Table, Record)]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (table, record) in records {
            put_record(&mut tx, *table, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, table: Table, key: &str) -> Result<Option<Record>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        get_record(&mut conn, table, key).await
    }

    pub async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        delete_record(&mut conn, table, key).await
    }

    pub async fn list(&self, table: Table) -> Result<Vec<Record>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} ORDER BY started_at DESC, key ASC",
            table.name()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn query_by_index(
        &self,
        table: Table,
        key: IndexKey<'_>,
    ) -> Result<Vec<Record>, StoreError> {
        if !table.has_index(key.index()) {
            return Err(StoreError::UnsupportedIndex {
                table,
                index: key.index(),
            });
        }
        let rows = match key {
            IndexKey::ClientId(client_id) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM {} WHERE client_id = ?1 ORDER BY started_at DESC, key ASC",
                    table.name()
                );
                sqlx::query(&sql)
                    .bind(client_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            IndexKey::StartedAt(started_at) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM {} WHERE started_at = ?1 ORDER BY key ASC",
                    table.name()
                );
                sqlx::query(&sql)
                    .bind(started_at)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(record_from_row).collect()
    }

    pub async fn append_action(
        &self,
        kind: ActionKind,
        payload: &Value,
        created_at: i64,
    ) -> Result<ActionId, StoreError> {
        let result = sqlx::query(
            "INSERT INTO pending_actions (kind, payload, created_at, synced, status, attempt)
             VALUES (?1, ?2, ?3, 0, 'pending', 0)",
        )
        .bind(kind.as_str())
        .bind(serde_json::to_string(payload)?)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_action(&self, id: ActionId) -> Result<Option<PendingAction>, StoreError> {
        let sql = format!("SELECT {ACTION_COLUMNS} FROM pending_actions WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(action_from_row).transpose()
    }

    /// Oldest action not yet confirmed by the server.
    pub async fn head_unsynced_action(&self) -> Result<Option<PendingAction>, StoreError> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM pending_actions WHERE synced = 0 ORDER BY id ASC LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(action_from_row).transpose()
    }

    pub async fn list_actions(&self, synced: bool) -> Result<Vec<PendingAction>, StoreError> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM pending_actions WHERE synced = ?1 ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(if synced { 1 } else { 0 })
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(action_from_row).collect()
    }

    pub async fn count_unsynced_actions(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_actions WHERE synced = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn count_blocked_actions(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_actions WHERE synced = 0 AND status IN ('failed', 'stuck')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    /// Highest action id ever assigned, including pruned ones.
    pub async fn last_action_id(&self) -> Result<ActionId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "SELECT COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'pending_actions'), 0)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Highest action id such that it and every action before it are
    /// synced. Server data fetched now reflects at most these actions.
    pub async fn confirmed_through(&self) -> Result<ActionId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "SELECT COALESCE(\
                (SELECT MIN(id) - 1 FROM pending_actions WHERE synced = 0), \
                (SELECT seq FROM sqlite_sequence WHERE name = 'pending_actions'), \
                0)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn record_action_failure(
        &self,
        id: ActionId,
        status: ActionStatus,
        attempt: u32,
        retry_at: Option<i64>,
        last_error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_actions SET status = ?1, attempt = ?2, retry_at = ?3, last_error = ?4
             WHERE id = ?5 AND synced = 0",
        )
        .bind(status.as_str())
        .bind(attempt)
        .bind(retry_at)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Puts an unsynced action back into the deliverable state, optionally
    /// replacing its payload.
    pub async fn reset_action(
        &self,
        id: ActionId,
        payload: Option<&Value>,
    ) -> Result<bool, StoreError> {
        let payload = payload.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            "UPDATE pending_actions
             SET status = 'pending', attempt = 0, retry_at = NULL, last_error = NULL,
                 payload = COALESCE(?1, payload)
             WHERE id = ?2 AND synced = 0",
        )
        .bind(payload)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_action(&self, id: ActionId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM pending_actions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn prune_synced_actions(&self, created_before: i64) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM pending_actions WHERE synced = 1 AND created_at < ?1")
                .bind(created_before)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn id_map(&self) -> Result<HashMap<String, String>, StoreError> {
        let rows = sqlx::query("SELECT local_id, server_id FROM id_map")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("local_id")?, row.try_get("server_id")?);
        }
        Ok(out)
    }

    pub async fn active_session(&self) -> Result<Option<Record>, StoreError> {
        self.get(Table::ActiveSession, ACTIVE_SESSION_KEY).await
    }
}

/// A multi-record write that commits all-or-nothing.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    pub async fn get(&mut self, table: Table, key: &str) -> Result<Option<Record>, StoreError> {
        get_record(&mut self.tx, table, key).await
    }

    pub async fn put(&mut self, table: Table, record: &Record) -> Result<(), StoreError> {
        put_record(&mut self.tx, table, record).await
    }

    pub async fn delete(&mut self, table: Table, key: &str) -> Result<bool, StoreError> {
        delete_record(&mut self.tx, table, key).await
    }

    pub async fn active_session(&mut self) -> Result<Option<Record>, StoreError> {
        get_record(&mut self.tx, Table::ActiveSession, ACTIVE_SESSION_KEY).await
    }

    /// Stores `record` as the running session; its key is replaced.
    pub async fn set_active_session(&mut self, record: &Record) -> Result<(), StoreError> {
        let record = Record {
            key: ACTIVE_SESSION_KEY.to_string(),
            ..record.clone()
        };
        put_record(&mut self.tx, Table::ActiveSession, &record).await
    }

    pub async fn clear_active_session(&mut self) -> Result<bool, StoreError> {
        delete_record(&mut self.tx, Table::ActiveSession, ACTIVE_SESSION_KEY).await
    }

    pub async fn mark_action_synced(&mut self, id: ActionId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_actions SET synced = 1, status = 'pending', retry_at = NULL, last_error = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn record_id_mapping(
        &mut self,
        local_id: &str,
        server_id: &str,
        action_id: ActionId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO id_map (local_id, server_id, action_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(local_id) DO UPDATE SET server_id = excluded.server_id, action_id = excluded.action_id",
        )
        .bind(local_id)
        .bind(server_id)
        .bind(action_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

async fn put_record(
    conn: &mut SqliteConnection,
    table: Table,
    record: &Record,
) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO {} (key, data, provenance, watermark, client_id, started_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(key) DO UPDATE SET
            data = excluded.data,
            provenance = excluded.provenance,
            watermark = excluded.watermark,
            client_id = excluded.client_id,
            started_at = excluded.started_at,
            updated_at = excluded.updated_at",
        table.name()
    );
    sqlx::query(&sql)
        .bind(&record.key)
        .bind(serde_json::to_string(&record.data)?)
        .bind(record.provenance.as_str())
        .bind(record.watermark)
        .bind(record.client_id())
        .bind(record.started_at())
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn get_record(
    conn: &mut SqliteConnection,
    table: Table,
    key: &str,
) -> Result<Option<Record>, StoreError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} WHERE key = ?1",
        table.name()
    );
    let row = sqlx::query(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

async fn delete_record(
    conn: &mut SqliteConnection,
    table: Table,
    key: &str,
) -> Result<bool, StoreError> {
    let sql = format!("DELETE FROM {} WHERE key = ?1", table.name());
    let result = sqlx::query(&sql).bind(key).execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

fn record_from_row(row: &SqliteRow) -> Result<Record, StoreError> {
    let data: String = row.try_get("data")?;
    let provenance: String = row.try_get("provenance")?;
    Ok(Record {
        key: row.try_get("key")?,
        data: serde_json::from_str(&data)?,
        provenance: Provenance::parse(&provenance)?,
        watermark: row.try_get("watermark")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<PendingAction, StoreError> {
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let synced: i64 = row.try_get("synced")?;
    Ok(PendingAction {
        id: row.try_get("id")?,
        kind: ActionKind::from_str(&kind).map_err(|_| StoreError::InvalidActionKind(kind))?,
        payload: serde_json::from_str(&payload)?,
        created_at: row.try_get("created_at")?,
        synced: synced != 0,
        status: ActionStatus::parse(&status)?,
        attempt: row.try_get("attempt")?,
        retry_at: row.try_get("retry_at")?,
        last_error: row.try_get("last_error")?,
    })
}

async fn load_or_create_device_id(pool: &SqlitePool) -> Result<String, StoreError> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?1")
            .bind(DEVICE_ID_KEY)
            .fetch_optional(pool)
            .await?;
    if let Some(device_id) = existing {
        return Ok(device_id);
    }
    let device_id = format!("{:016x}", rand::random::<u64>());
    sqlx::query("INSERT INTO store_meta (key, value) VALUES (?1, ?2)")
        .bind(DEVICE_ID_KEY)
        .bind(&device_id)
        .execute(pool)
        .await?;
    Ok(device_id)
}

fn classify_open_error(err: sqlx::Error) -> StoreError {
    let primary_code = match &err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff),
        _ => None,
    };
    match primary_code {
        Some(SQLITE_CORRUPT | SQLITE_NOTADB) => StoreError::StoreCorrupt(err.to_string()),
        _ => StoreError::StorageUnavailable(err.to_string()),
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn expected_schema_version() -> i64 {
    MIGRATOR.iter().map(|m| m.version).max().unwrap_or(0)
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("fieldbook");
    path.push("sync");
    path.push("fieldbook.db");
    Ok(path)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

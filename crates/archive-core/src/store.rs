use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use legisarc_protocol::error::LegisError;
use legisarc_protocol::types::{BatchStatus, IngestionBatch, Params, RawPayload};
use rusqlite::{Connection, Row};
use serde_json::Value;

#[derive(Clone)]
pub struct ArchiveStore {
    conn: Arc<Mutex<Connection>>,
}

impl ArchiveStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ingestion_batches (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                batch_type TEXT NOT NULL,
                range_start TEXT,
                range_end TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                item_count INTEGER NOT NULL DEFAULT 0,
                merkle_root TEXT,
                anchor_id TEXT,
                notes TEXT
            );

            CREATE TABLE IF NOT EXISTS raw_payloads (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                params TEXT NOT NULL,
                primary_key TEXT,
                fetched_at TEXT NOT NULL,
                http_status INTEGER NOT NULL,
                url TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                body TEXT NOT NULL,
                batch_id TEXT NOT NULL REFERENCES ingestion_batches(id)
            );
            CREATE INDEX IF NOT EXISTS idx_raw_payloads_endpoint ON raw_payloads(endpoint);
            CREATE INDEX IF NOT EXISTS idx_raw_payloads_batch ON raw_payloads(batch_id);
            CREATE INDEX IF NOT EXISTS idx_raw_payloads_pk ON raw_payloads(primary_key);

            CREATE TABLE IF NOT EXISTS batch_items (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL REFERENCES ingestion_batches(id),
                raw_payload_id TEXT NOT NULL REFERENCES raw_payloads(id),
                item_sha256 TEXT NOT NULL,
                leaf_index INTEGER NOT NULL,
                UNIQUE(batch_id, leaf_index)
            );

            CREATE TABLE IF NOT EXISTS anchors (
                id TEXT PRIMARY KEY,
                anchor_type TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                root TEXT NOT NULL,
                batch_id TEXT NOT NULL,
                metadata TEXT NOT NULL,
                anchored_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_state (
                job_name TEXT PRIMARY KEY,
                cursor TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reconcile_reports (
                id TEXT PRIMARY KEY,
                run_at TEXT NOT NULL,
                status TEXT NOT NULL,
                checks TEXT NOT NULL,
                issues TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LegisError::Storage("connection mutex poisoned".to_owned()).into())
    }
}

pub(crate) fn decode_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|err| LegisError::Storage(format!("corrupt stored json: {err}")).into())
}

pub(crate) fn decode_date(raw: Option<String>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

pub(crate) fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| LegisError::Storage(format!("corrupt stored timestamp: {err}")).into())
}

/// Intermediate row shapes: sqlite hands back strings, the typed decode
/// happens outside the `query_map` closure.
pub(crate) struct BatchRowRaw {
    pub id: String,
    pub source: String,
    pub batch_type: String,
    pub range_start: Option<String>,
    pub range_end: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub item_count: i64,
    pub merkle_root: Option<String>,
    pub anchor_id: Option<String>,
    pub notes: Option<String>,
}

impl BatchRowRaw {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            batch_type: row.get(2)?,
            range_start: row.get(3)?,
            range_end: row.get(4)?,
            started_at: row.get(5)?,
            finished_at: row.get(6)?,
            status: row.get(7)?,
            item_count: row.get(8)?,
            merkle_root: row.get(9)?,
            anchor_id: row.get(10)?,
            notes: row.get(11)?,
        })
    }

    pub fn decode(self) -> Result<IngestionBatch> {
        Ok(IngestionBatch {
            id: self.id,
            source: self.source,
            batch_type: self.batch_type,
            range_start: decode_date(self.range_start),
            range_end: decode_date(self.range_end),
            started_at: decode_timestamp(&self.started_at)?,
            finished_at: match self.finished_at {
                Some(raw) => Some(decode_timestamp(&raw)?),
                None => None,
            },
            status: BatchStatus::parse(&self.status),
            item_count: self.item_count,
            merkle_root: self.merkle_root,
            anchor_id: self.anchor_id,
            notes: self.notes,
        })
    }
}

pub(crate) struct PayloadRowRaw {
    pub id: String,
    pub source: String,
    pub endpoint: String,
    pub params: String,
    pub primary_key: Option<String>,
    pub fetched_at: String,
    pub http_status: i64,
    pub url: String,
    pub sha256: String,
    pub body: String,
    pub batch_id: String,
}

impl PayloadRowRaw {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            endpoint: row.get(2)?,
            params: row.get(3)?,
            primary_key: row.get(4)?,
            fetched_at: row.get(5)?,
            http_status: row.get(6)?,
            url: row.get(7)?,
            sha256: row.get(8)?,
            body: row.get(9)?,
            batch_id: row.get(10)?,
        })
    }

    pub fn decode(self) -> Result<RawPayload> {
        let params: Params = serde_json::from_str(&self.params).unwrap_or_default();
        Ok(RawPayload {
            id: self.id,
            source: self.source,
            endpoint: self.endpoint,
            params,
            primary_key: self.primary_key,
            fetched_at: decode_timestamp(&self.fetched_at)?,
            http_status: self.http_status as u16,
            url: self.url,
            sha256: self.sha256,
            body: decode_json(&self.body)?,
            batch_id: self.batch_id,
        })
    }
}

pub(crate) const BATCH_COLUMNS: &str = "id, source, batch_type, range_start, range_end, \
     started_at, finished_at, status, item_count, merkle_root, anchor_id, notes";

pub(crate) const PAYLOAD_COLUMNS: &str = "id, source, endpoint, params, primary_key, \
     fetched_at, http_status, url, sha256, body, batch_id";

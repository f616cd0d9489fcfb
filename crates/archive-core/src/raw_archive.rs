//! Append-only archive of raw upstream responses, grouped into batches
//! that are sealed with a Merkle root and anchored.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use legisarc_proof::{merkle_root, sha256_json};
use legisarc_protocol::error::LegisError;
use legisarc_protocol::types::{
    request_url, BatchStatus, IngestionBatch, Params, RawPayload, SOURCE_CAMARA,
};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::anchor::AnchorPublisher;
use crate::store::{ArchiveStore, BatchRowRaw, BATCH_COLUMNS};

#[derive(Clone)]
pub struct RawArchive {
    store: ArchiveStore,
    publisher: AnchorPublisher,
}

impl RawArchive {
    pub fn new(store: ArchiveStore, publisher: AnchorPublisher) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    pub fn start_batch(
        &self,
        batch_type: &str,
        range_start: Option<NaiveDate>,
        range_end: Option<NaiveDate>,
    ) -> Result<IngestionBatch> {
        let batch = IngestionBatch {
            id: Uuid::new_v4().to_string(),
            source: SOURCE_CAMARA.to_owned(),
            batch_type: batch_type.to_owned(),
            range_start,
            range_end,
            started_at: Utc::now(),
            finished_at: None,
            status: BatchStatus::Running,
            item_count: 0,
            merkle_root: None,
            anchor_id: None,
            notes: None,
        };
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT INTO ingestion_batches
                 (id, source, batch_type, range_start, range_end, started_at, status, item_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                batch.id,
                batch.source,
                batch.batch_type,
                batch.range_start.map(|d| d.to_string()),
                batch.range_end.map(|d| d.to_string()),
                batch.started_at.to_rfc3339(),
                batch.status.as_str(),
            ],
        )?;
        info!(batch_id = %batch.id, batch_type = %batch.batch_type, "started ingestion batch");
        Ok(batch)
    }

    /// Archives one response and appends it as the batch's next Merkle
    /// leaf. Prior payloads for the same (endpoint, primary key) are
    /// never touched; the archive is a full version history.
    pub fn add_payload(
        &self,
        batch_id: &str,
        endpoint: &str,
        params: &Params,
        primary_key: Option<&str>,
        http_status: u16,
        body: &Value,
    ) -> Result<RawPayload> {
        self.add_payload_from(
            SOURCE_CAMARA,
            batch_id,
            endpoint,
            params,
            primary_key,
            http_status,
            body,
        )
    }

    /// Same as `add_payload` but under an explicit source label, used for
    /// bulk-dataset fallback material.
    #[allow(clippy::too_many_arguments)]
    pub fn add_payload_from(
        &self,
        source: &str,
        batch_id: &str,
        endpoint: &str,
        params: &Params,
        primary_key: Option<&str>,
        http_status: u16,
        body: &Value,
    ) -> Result<RawPayload> {
        let sha256 = sha256_json(body).context("hash payload body")?;
        let payload = RawPayload {
            id: Uuid::new_v4().to_string(),
            source: source.to_owned(),
            endpoint: endpoint.to_owned(),
            params: params.clone(),
            primary_key: primary_key.map(str::to_owned),
            fetched_at: Utc::now(),
            http_status,
            url: request_url(endpoint, params),
            sha256,
            body: body.clone(),
            batch_id: batch_id.to_owned(),
        };

        let conn = self.store.lock()?;
        let leaf_index: i64 = conn.query_row(
            "SELECT item_count FROM ingestion_batches WHERE id = ?1",
            params![batch_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO raw_payloads
                 (id, source, endpoint, params, primary_key, fetched_at, http_status, url, sha256, body, batch_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                payload.id,
                payload.source,
                payload.endpoint,
                serde_json::to_string(&payload.params)?,
                payload.primary_key,
                payload.fetched_at.to_rfc3339(),
                i64::from(payload.http_status),
                payload.url,
                payload.sha256,
                serde_json::to_string(&payload.body)?,
                payload.batch_id,
            ],
        )?;
        conn.execute(
            "INSERT INTO batch_items (id, batch_id, raw_payload_id, item_sha256, leaf_index)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                batch_id,
                payload.id,
                payload.sha256,
                leaf_index,
            ],
        )?;
        conn.execute(
            "UPDATE ingestion_batches SET item_count = item_count + 1 WHERE id = ?1",
            params![batch_id],
        )?;
        debug!(batch_id, endpoint, leaf_index, "archived payload");
        Ok(payload)
    }

    /// Seals the batch: Merkle root over the leaves in index order,
    /// anchor publication, then success status and notes.
    pub fn finish_batch(&self, batch_id: &str, metadata: Option<Value>) -> Result<IngestionBatch> {
        let batch = self.batch(batch_id)?;
        let leaves = self.batch_leaves(batch_id)?;
        let root = merkle_root(&leaves);

        let entry_type = format!("camara:{}", batch.batch_type);
        let anchor = self.publisher.anchor_root(
            &entry_type,
            &root,
            batch_id,
            metadata.clone().unwrap_or_else(|| Value::Object(Default::default())),
        )?;

        let notes = match &metadata {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        let finished_at = Utc::now();
        let conn = self.store.lock()?;
        conn.execute(
            "UPDATE ingestion_batches
             SET status = 'success', finished_at = ?2, merkle_root = ?3, anchor_id = ?4, notes = ?5
             WHERE id = ?1",
            params![batch_id, finished_at.to_rfc3339(), root, anchor.id, notes],
        )?;
        drop(conn);
        info!(batch_id, root = %root, items = leaves.len(), "sealed ingestion batch");
        self.batch(batch_id)
    }

    /// Marks the batch failed. Items already written stay put so partial
    /// ingestion remains auditable.
    pub fn fail_batch(&self, batch_id: &str, notes: &str) -> Result<()> {
        let conn = self.store.lock()?;
        conn.execute(
            "UPDATE ingestion_batches
             SET status = 'failed', finished_at = ?2, notes = ?3
             WHERE id = ?1",
            params![batch_id, Utc::now().to_rfc3339(), notes],
        )?;
        Ok(())
    }

    pub fn batch(&self, batch_id: &str) -> Result<IngestionBatch> {
        let conn = self.store.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {BATCH_COLUMNS} FROM ingestion_batches WHERE id = ?1"),
                params![batch_id],
                BatchRowRaw::from_row,
            )
            .optional()?;
        drop(conn);
        match raw {
            Some(row) => row.decode(),
            None => Err(LegisError::NotFound(format!("batch {batch_id}")).into()),
        }
    }

    pub fn batch_leaves(&self, batch_id: &str) -> Result<Vec<String>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(
            "SELECT item_sha256 FROM batch_items WHERE batch_id = ?1 ORDER BY leaf_index",
        )?;
        let leaves = stmt
            .query_map(params![batch_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(leaves)
    }
}

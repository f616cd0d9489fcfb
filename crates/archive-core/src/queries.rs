//! Read-side queries the reconciliation engine runs against the archive.

use anyhow::Result;
use legisarc_protocol::types::{IngestionBatch, RawPayload};
use rusqlite::{params, OptionalExtension};

use crate::store::{ArchiveStore, BatchRowRaw, PayloadRowRaw, BATCH_COLUMNS, PAYLOAD_COLUMNS};

pub fn payload_count(store: &ArchiveStore) -> Result<i64> {
    let conn = store.lock()?;
    let count = conn.query_row("SELECT COUNT(*) FROM raw_payloads", [], |row| row.get(0))?;
    Ok(count)
}

/// All payloads whose endpoint matches a SQL LIKE pattern, oldest first.
pub fn payloads_like(store: &ArchiveStore, endpoint_pattern: &str) -> Result<Vec<RawPayload>> {
    let conn = store.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAYLOAD_COLUMNS} FROM raw_payloads WHERE endpoint LIKE ?1 ORDER BY fetched_at"
    ))?;
    let rows = stmt
        .query_map(params![endpoint_pattern], PayloadRowRaw::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    drop(conn);
    rows.into_iter().map(PayloadRowRaw::decode).collect()
}

/// Earliest archived payload for one (endpoint pattern, primary key) —
/// the raw reference a graph node is audited against.
pub fn first_payload_for(
    store: &ArchiveStore,
    endpoint_pattern: &str,
    primary_key: &str,
) -> Result<Option<RawPayload>> {
    let conn = store.lock()?;
    let raw = conn
        .query_row(
            &format!(
                "SELECT {PAYLOAD_COLUMNS} FROM raw_payloads
                 WHERE endpoint LIKE ?1 AND primary_key = ?2
                 ORDER BY fetched_at LIMIT 1"
            ),
            params![endpoint_pattern, primary_key],
            PayloadRowRaw::from_row,
        )
        .optional()?;
    drop(conn);
    raw.map(PayloadRowRaw::decode).transpose()
}

pub fn latest_success_batch(
    store: &ArchiveStore,
    batch_type_prefix: &str,
) -> Result<Option<IngestionBatch>> {
    let conn = store.lock()?;
    let raw = conn
        .query_row(
            &format!(
                "SELECT {BATCH_COLUMNS} FROM ingestion_batches
                 WHERE status = 'success' AND batch_type LIKE ?1 || '%'
                 ORDER BY started_at DESC LIMIT 1"
            ),
            params![batch_type_prefix],
            BatchRowRaw::from_row,
        )
        .optional()?;
    drop(conn);
    raw.map(BatchRowRaw::decode).transpose()
}

/// Whether some successful batch of this type declares a range fully
/// covering the given calendar year. Arms the per-year coverage gates.
pub fn year_fully_covered(store: &ArchiveStore, batch_type_prefix: &str, year: i32) -> Result<bool> {
    let start = format!("{year}-01-01");
    let end = format!("{year}-12-31");
    let conn = store.lock()?;
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM ingestion_batches
             WHERE status = 'success' AND batch_type LIKE ?1 || '%'
               AND range_start IS NOT NULL AND range_end IS NOT NULL
               AND range_start <= ?2 AND range_end >= ?3
             LIMIT 1",
            params![batch_type_prefix, start, end],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// Payloads fetched outside their batch's declared date range, for
/// batches that declare both bounds.
pub fn temporal_violations(store: &ArchiveStore) -> Result<i64> {
    let conn = store.lock()?;
    let count = conn.query_row(
        "SELECT COUNT(*)
         FROM raw_payloads p
         JOIN ingestion_batches b ON p.batch_id = b.id
         WHERE b.range_start IS NOT NULL AND b.range_end IS NOT NULL
           AND (date(p.fetched_at) < b.range_start
                OR date(p.fetched_at) > b.range_end)",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn anchors_for_batch(
    store: &ArchiveStore,
    batch_id: &str,
) -> Result<Vec<legisarc_protocol::types::AnchorRecord>> {
    let conn = store.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, anchor_type, entry_type, root, batch_id, metadata, anchored_at
         FROM anchors WHERE batch_id = ?1 ORDER BY anchored_at",
    )?;
    let rows = stmt
        .query_map(params![batch_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    drop(conn);
    rows.into_iter()
        .map(|(id, anchor_type, entry_type, root, batch_id, metadata, anchored_at)| {
            Ok(legisarc_protocol::types::AnchorRecord {
                id,
                anchor_type,
                entry_type,
                root,
                batch_id,
                metadata: crate::store::decode_json(&metadata)?,
                anchored_at,
            })
        })
        .collect()
}

/// Dense-leaf invariant probe: count of batches whose item_count does not
/// match their batch_items rows.
pub fn item_count_mismatches(store: &ArchiveStore) -> Result<i64> {
    let conn = store.lock()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM ingestion_batches b
         WHERE b.item_count != (SELECT COUNT(*) FROM batch_items i WHERE i.batch_id = b.id)",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

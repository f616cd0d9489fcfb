//! Tamper-evident publication of batch Merkle roots. The variant is a
//! construction-time choice, not a runtime lookup.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use legisarc_protocol::types::AnchorRecord;
use rusqlite::params;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::store::ArchiveStore;

#[derive(Clone)]
pub enum AnchorPublisher {
    /// Appends to a durable local JSON log of roots; stands in for
    /// eventual publication to an external ledger.
    File { log_path: PathBuf },
    /// Inserts one row into the primary store; that row id is the
    /// canonical anchor identity.
    Relational { store: ArchiveStore },
    /// Extension point for a real external chain; returns a synthetic
    /// record immediately, no external call is made.
    Placeholder,
    /// File and Relational together; the relational id is the logical one.
    Composite {
        log_path: PathBuf,
        store: ArchiveStore,
    },
}

impl AnchorPublisher {
    pub fn anchor_root(
        &self,
        entry_type: &str,
        root: &str,
        batch_id: &str,
        metadata: Value,
    ) -> Result<AnchorRecord> {
        let record = match self {
            Self::File { log_path } => {
                let record = new_record("file-log", entry_type, root, batch_id, metadata);
                append_to_log(log_path, &record)?;
                record
            }
            Self::Relational { store } => {
                let record = new_record("relational", entry_type, root, batch_id, metadata);
                insert_anchor(store, &record)?;
                record
            }
            Self::Placeholder => new_record("ledger-placeholder", entry_type, root, batch_id, metadata),
            Self::Composite { log_path, store } => {
                let file_record =
                    new_record("file-log", entry_type, root, batch_id, metadata.clone());
                append_to_log(log_path, &file_record)?;
                let record = new_record("relational", entry_type, root, batch_id, metadata);
                insert_anchor(store, &record)?;
                record
            }
        };
        info!(
            anchor_id = %record.id,
            anchor_type = %record.anchor_type,
            root = %record.root,
            batch_id = %record.batch_id,
            "anchored batch root"
        );
        Ok(record)
    }
}

fn new_record(
    anchor_type: &str,
    entry_type: &str,
    root: &str,
    batch_id: &str,
    metadata: Value,
) -> AnchorRecord {
    AnchorRecord {
        id: Uuid::new_v4().to_string(),
        anchor_type: anchor_type.to_owned(),
        entry_type: entry_type.to_owned(),
        root: root.to_owned(),
        batch_id: batch_id.to_owned(),
        metadata,
        anchored_at: Utc::now().timestamp_millis(),
    }
}

/// The log is a JSON array that only ever grows: load, append, rewrite.
fn append_to_log(log_path: &PathBuf, record: &AnchorRecord) -> Result<()> {
    let mut entries: Vec<Value> = if log_path.exists() {
        let raw = fs::read_to_string(log_path)
            .with_context(|| format!("read anchor log {}", log_path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("decode anchor log {}", log_path.display()))?
    } else {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create anchor log dir {}", parent.display()))?;
        }
        Vec::new()
    };
    entries.push(serde_json::to_value(record)?);
    fs::write(log_path, serde_json::to_string_pretty(&entries)?)
        .with_context(|| format!("write anchor log {}", log_path.display()))?;
    Ok(())
}

fn insert_anchor(store: &ArchiveStore, record: &AnchorRecord) -> Result<()> {
    let conn = store.lock()?;
    conn.execute(
        "INSERT INTO anchors (id, anchor_type, entry_type, root, batch_id, metadata, anchored_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.id,
            record.anchor_type,
            record.entry_type,
            record.root,
            record.batch_id,
            serde_json::to_string(&record.metadata)?,
            record.anchored_at,
        ],
    )?;
    Ok(())
}

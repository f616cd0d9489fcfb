//! Reconciliation report persistence. One immutable row per run.

use anyhow::Result;
use legisarc_protocol::types::{BatchStatus, ReconcileCheck, ReconcileIssue, ReconcileReport};
use rusqlite::{params, OptionalExtension};

use crate::store::{decode_timestamp, ArchiveStore};

pub fn save_report(store: &ArchiveStore, report: &ReconcileReport) -> Result<()> {
    let conn = store.lock()?;
    conn.execute(
        "INSERT INTO reconcile_reports (id, run_at, status, checks, issues)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            report.id,
            report.run_at.to_rfc3339(),
            report.status.as_str(),
            serde_json::to_string(&report.checks)?,
            serde_json::to_string(&report.issues)?,
        ],
    )?;
    Ok(())
}

pub fn latest_report(store: &ArchiveStore) -> Result<Option<ReconcileReport>> {
    let conn = store.lock()?;
    let raw = conn
        .query_row(
            "SELECT id, run_at, status, checks, issues
             FROM reconcile_reports ORDER BY run_at DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    drop(conn);
    match raw {
        Some((id, run_at, status, checks, issues)) => {
            let checks: Vec<ReconcileCheck> = serde_json::from_str(&checks)?;
            let issues: Vec<ReconcileIssue> = serde_json::from_str(&issues)?;
            Ok(Some(ReconcileReport {
                id,
                run_at: decode_timestamp(&run_at)?,
                status: BatchStatus::parse(&status),
                checks,
                issues,
            }))
        }
        None => Ok(None),
    }
}

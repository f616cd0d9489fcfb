//! Durable per-job cursor and status; the sole resumption mechanism.

use anyhow::Result;
use chrono::Utc;
use legisarc_protocol::types::{JobState, JobStatus};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::store::{decode_json, decode_timestamp, ArchiveStore};

#[derive(Clone)]
pub struct JobStateStore {
    store: ArchiveStore,
}

impl JobStateStore {
    pub fn new(store: ArchiveStore) -> Self {
        Self { store }
    }

    pub fn get(&self, job_name: &str) -> Result<Option<JobState>> {
        let conn = self.store.lock()?;
        let raw = conn
            .query_row(
                "SELECT cursor, status, updated_at FROM job_state WHERE job_name = ?1",
                params![job_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);
        match raw {
            Some((cursor, status, updated_at)) => Ok(Some(JobState {
                job_name: job_name.to_owned(),
                cursor: decode_json(&cursor)?,
                status: JobStatus::parse(&status),
                updated_at: decode_timestamp(&updated_at)?,
            })),
            None => Ok(None),
        }
    }

    /// Overwrites the single row for this job name.
    pub fn set(&self, job_name: &str, cursor: &Value, status: JobStatus) -> Result<()> {
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT INTO job_state (job_name, cursor, status, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_name) DO UPDATE
             SET cursor = excluded.cursor, status = excluded.status, updated_at = excluded.updated_at",
            params![
                job_name,
                serde_json::to_string(cursor)?,
                status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<JobState>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(
            "SELECT job_name, cursor, status, updated_at FROM job_state ORDER BY job_name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter()
            .map(|(job_name, cursor, status, updated_at)| {
                Ok(JobState {
                    job_name,
                    cursor: decode_json(&cursor)?,
                    status: JobStatus::parse(&status),
                    updated_at: decode_timestamp(&updated_at)?,
                })
            })
            .collect()
    }
}

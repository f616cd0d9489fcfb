//! Record/replay fixture store keyed by the request signature, so
//! ingestion runs can be reproduced without live network access.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use legisarc_proof::sha256_json;
use legisarc_protocol::error::LegisError;
use legisarc_protocol::types::Params;
use serde_json::{json, Value};

#[derive(Debug, Clone, Default)]
pub enum FixtureMode {
    #[default]
    Off,
    Record(PathBuf),
    Replay(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FixtureStore {
    mode: FixtureMode,
}

impl FixtureStore {
    pub fn new(mode: FixtureMode) -> Self {
        Self { mode }
    }

    fn key(url: &str, params: &Params) -> Result<String> {
        sha256_json(&json!({
            "method": "GET",
            "url": url,
            "params": params,
        }))
    }

    /// In replay mode, returns the stored `(status, body)` for this request
    /// signature; a missing fixture is a hard failure, never a silent
    /// fall-through to the network. In other modes returns `None`.
    pub fn replay(&self, url: &str, params: &Params) -> Result<Option<(u16, Value)>> {
        let FixtureMode::Replay(dir) = &self.mode else {
            return Ok(None);
        };
        let path = dir.join(format!("{}.json", Self::key(url, params)?));
        if !path.exists() {
            return Err(LegisError::FixtureMiss(url.to_owned()).into());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read fixture {}", path.display()))?;
        let record: Value = serde_json::from_str(&raw)
            .with_context(|| format!("decode fixture {}", path.display()))?;
        let status = record["status"].as_u64().unwrap_or(200) as u16;
        Ok(Some((status, record["body"].clone())))
    }

    /// In record mode, persists a completed response under this request
    /// signature. No-op otherwise.
    pub fn record(&self, url: &str, params: &Params, status: u16, body: &Value) -> Result<()> {
        let FixtureMode::Record(dir) = &self.mode else {
            return Ok(());
        };
        fs::create_dir_all(dir).with_context(|| format!("create fixture dir {}", dir.display()))?;
        let path = dir.join(format!("{}.json", Self::key(url, params)?));
        let record = json!({"status": status, "url": url, "body": body});
        fs::write(&path, serde_json::to_string(&record)?)
            .with_context(|| format!("write fixture {}", path.display()))?;
        Ok(())
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request parameters, kept sorted so fixture keys and archived URLs are
/// deterministic regardless of insertion order.
pub type Params = BTreeMap<String, String>;

pub const SOURCE_CAMARA: &str = "camara";
pub const SOURCE_CAMARA_DATASET: &str = "camara_dataset";

pub const JOB_LEGISLATORS: &str = "ingest_deputados_current";
pub const JOB_BILLS: &str = "ingest_bills_since";
pub const JOB_VOTES: &str = "ingest_votes_since";
pub const JOB_EXPENSES: &str = "ingest_expenses_since";

pub const BATCH_LEGISLATORS: &str = "camara:deputados:current";
pub const BATCH_BILLS_PREFIX: &str = "camara:bills:";
pub const BATCH_VOTES_PREFIX: &str = "camara:votes:";
pub const BATCH_EXPENSES_PREFIX: &str = "camara:expenses:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Success,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// One archived upstream response. Immutable once written; the same
/// (endpoint, primary key) may appear many times across batches, forming
/// an append-only version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
    pub id: String,
    pub source: String,
    pub endpoint: String,
    pub params: Params,
    pub primary_key: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub http_status: u16,
    pub url: String,
    pub sha256: String,
    pub body: Value,
    pub batch_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub id: String,
    pub source: String,
    pub batch_type: String,
    pub range_start: Option<NaiveDate>,
    pub range_end: Option<NaiveDate>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub item_count: i64,
    pub merkle_root: Option<String>,
    pub anchor_id: Option<String>,
    pub notes: Option<String>,
}

/// Links a batch to a payload at a fixed Merkle leaf position. Leaf
/// indexes within one batch are dense and gapless starting at 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub batch_id: String,
    pub raw_payload_id: String,
    pub item_sha256: String,
    pub leaf_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub id: String,
    pub anchor_type: String,
    pub entry_type: String,
    pub root: String,
    pub batch_id: String,
    pub metadata: Value,
    pub anchored_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_name: String,
    pub cursor: Value,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
}

// --- per-job cursors -----------------------------------------------------
//
// One cursor shape per job kind, serialized into the generic job_state
// cursor column and deserialized by job name.

/// Cursor for the legislators job: plain page progression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCursor {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default)]
    pub processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            page: default_page(),
            processed: 0,
            error: None,
        }
    }
}

/// Cursor for the date-windowed jobs (bills, votes).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowCursor {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub window_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_end: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub events: u64,
    #[serde(default)]
    pub actions: u64,
    #[serde(default)]
    pub legislator_ids: Vec<i64>,
    #[serde(default)]
    pub fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cursor for the expenses job: legislator-index x year progression. An
/// empty `legislator_ids` filter on a successful run marks a full,
/// unfiltered backfill, which is what arms the expenses coverage gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegislatorYearCursor {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub legislator_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub fallback_rows: u64,
    #[serde(default)]
    pub coverage_gaps: u64,
    #[serde(default)]
    pub legislator_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_page() -> u32 {
    1
}

// --- window outcomes and coverage gaps -----------------------------------

/// Explicit per-window result for the windowed jobs. A window that could
/// not be served live is not an exception path; it is data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WindowOutcome {
    Success {
        window_start: NaiveDate,
        window_end: NaiveDate,
        pages: u32,
    },
    UsedFallback {
        window_start: NaiveDate,
        window_end: NaiveDate,
        reason: String,
        rows_recovered: u64,
    },
    Failed {
        window_start: NaiveDate,
        window_end: NaiveDate,
        reason: String,
    },
}

/// A unit (window, or legislator/year pair) the live API failed to serve,
/// recorded in the batch notes under `coverage_gaps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageGap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_end: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legislator_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub reason: String,
    #[serde(default)]
    pub fallback_rows: u64,
    #[serde(default)]
    pub fallback_events: u64,
    #[serde(default)]
    pub fallback_actions: u64,
}

/// Classification archived alongside a non-200 nominal roll-call fetch so
/// that expected absence stays distinguishable from silent loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NominalRollError {
    NotAvailable,
    UpstreamError,
    HttpError,
}

impl NominalRollError {
    pub fn classify(status: u16) -> Self {
        if status == 404 {
            Self::NotAvailable
        } else if status >= 500 {
            Self::UpstreamError
        } else {
            Self::HttpError
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAvailable => "nominal_votes_not_available",
            Self::UpstreamError => "upstream_error",
            Self::HttpError => "nominal_votes_http_error",
        }
    }
}

// --- normalized entities --------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub source_id: i64,
    pub name: Option<String>,
    pub electoral_name: Option<String>,
    pub party: Option<String>,
    pub state: Option<String>,
    pub photo_url: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bill {
    pub id: String,
    pub source_id: i64,
    pub bill_type: Option<String>,
    pub number: Option<i64>,
    pub year: Option<i64>,
    pub summary: Option<String>,
    pub presented_at: Option<NaiveDate>,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteEvent {
    pub id: String,
    pub source_id: String,
    pub registered_at: Option<String>,
    pub approved: Option<i64>,
    pub description: Option<String>,
    pub bill_id: Option<String>,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteAction {
    pub id: String,
    pub vote_event_id: String,
    pub person_id: String,
    pub position: Option<String>,
    pub party_orientation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    pub id: String,
    pub source_id: String,
    pub person_id: String,
    pub organization_id: String,
    pub value: Option<f64>,
    pub document_date: Option<NaiveDate>,
    pub year: Option<i64>,
    pub month: Option<i64>,
    pub supplier_name: Option<String>,
    pub expense_type: Option<String>,
}

// --- reconciliation -------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileCheck {
    pub name: String,
    pub issue_type: String,
    pub expected: Option<i64>,
    pub actual: Option<i64>,
    pub ok: bool,
    pub gate: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileIssue {
    pub issue_type: String,
    pub check_name: String,
    pub expected: Option<i64>,
    pub actual: Option<i64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub id: String,
    pub run_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub checks: Vec<ReconcileCheck>,
    pub issues: Vec<ReconcileIssue>,
}

// --- helpers ----------------------------------------------------------------

/// Renders sorted params as a query string for the archived request URL.
pub fn query_string(params: &Params) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={}", v.replace(' ', "%20")))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn request_url(endpoint: &str, params: &Params) -> String {
    if params.is_empty() {
        endpoint.to_owned()
    } else {
        format!("{endpoint}?{}", query_string(params))
    }
}

/// Tolerant date parse for upstream values: plain dates, datetimes with a
/// `T` separator, and trailing `Z` offsets all reduce to the date part.
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    let date_part = raw.split('T').next().unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_cursor_defaults_to_page_one() {
        let cursor: PageCursor = serde_json::from_value(json!({})).expect("cursor json");
        assert_eq!(cursor.page, 1);
        assert_eq!(cursor.processed, 0);
    }

    #[test]
    fn window_cursor_roundtrips_with_omitted_fields() {
        let cursor: WindowCursor =
            serde_json::from_value(json!({"window_index": 3, "processed": 12}))
                .expect("cursor json");
        assert_eq!(cursor.window_index, 3);
        assert_eq!(cursor.processed, 12);
        assert!(cursor.legislator_ids.is_empty());
        assert!(!cursor.fallback);
    }

    #[test]
    fn nominal_roll_errors_classify_by_status() {
        assert_eq!(
            NominalRollError::classify(404),
            NominalRollError::NotAvailable
        );
        assert_eq!(
            NominalRollError::classify(503),
            NominalRollError::UpstreamError
        );
        assert_eq!(NominalRollError::classify(403), NominalRollError::HttpError);
    }

    #[test]
    fn parse_date_strips_time_and_offset() {
        assert_eq!(
            parse_date(&json!("2023-05-17T14:03:00Z")),
            NaiveDate::from_ymd_opt(2023, 5, 17)
        );
        assert_eq!(
            parse_date(&json!("2023-05-17")),
            NaiveDate::from_ymd_opt(2023, 5, 17)
        );
        assert_eq!(parse_date(&json!("")), None);
        assert_eq!(parse_date(&json!(42)), None);
    }

    #[test]
    fn request_url_appends_sorted_query() {
        let mut params = Params::new();
        params.insert("pagina".to_owned(), "2".to_owned());
        params.insert("itens".to_owned(), "100".to_owned());
        assert_eq!(
            request_url("/deputados", &params),
            "/deputados?itens=100&pagina=2"
        );
        assert_eq!(request_url("/deputados", &Params::new()), "/deputados");
    }
}

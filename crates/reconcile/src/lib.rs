//! Independent auditor over the archive, the graph and the job state.
//! Every run computes the full check list, derives the gated-failing
//! subset as issues, and persists the report. A failing check is data,
//! never an error; only infrastructure unavailability propagates.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{Datelike, Utc};
use legisarc_archive_core::{queries, reports, ArchiveStore, JobStateStore};
use legisarc_fetch_client::{last_page_hint, FetchClient};
use legisarc_graph_writer::{
    GraphNode, GraphReader, EDGE_CAST, EDGE_HAS_EXPENSE, EDGE_IN_EVENT, EDGE_ON_BILL, LABEL_BILL,
    LABEL_EXPENSE, LABEL_ORGANIZATION, LABEL_PARTY, LABEL_PERSON, LABEL_STATE, LABEL_VOTE_ACTION,
    LABEL_VOTE_EVENT,
};
use legisarc_protocol::endpoints::{self, DEPUTADOS_ENDPOINT, PROPOSICOES_ENDPOINT, VOTACOES_ENDPOINT};
use legisarc_protocol::types::{
    BatchStatus, JobStatus, LegislatorYearCursor, Params, ReconcileCheck, ReconcileIssue,
    ReconcileReport, BATCH_BILLS_PREFIX, BATCH_EXPENSES_PREFIX, BATCH_VOTES_PREFIX, JOB_EXPENSES,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

/// First calendar year the per-year coverage checks reach back to.
pub const DEFAULT_BASE_YEAR: i32 = 2018;

const SAMPLE_LIMIT: usize = 50;

pub struct ReconcileEngine<R: GraphReader> {
    store: ArchiveStore,
    jobs: JobStateStore,
    graph: R,
    client: FetchClient,
    base_year: i32,
}

impl<R: GraphReader> ReconcileEngine<R> {
    pub fn new(store: ArchiveStore, jobs: JobStateStore, graph: R, client: FetchClient) -> Self {
        Self {
            store,
            jobs,
            graph,
            client,
            base_year: DEFAULT_BASE_YEAR,
        }
    }

    pub fn with_base_year(mut self, base_year: i32) -> Self {
        self.base_year = base_year;
        self
    }

    /// Runs every check family, persists the report and returns it.
    pub fn run(&self) -> Result<ReconcileReport> {
        let mut checks = Vec::new();

        checks.extend(self.coverage_checks()?);
        checks.extend(self.integrity_checks()?);
        checks.extend(self.uniqueness_checks()?);
        checks.push(self.temporal_check()?);
        checks.push(self.nominal_roll_check()?);
        checks.push(self.documented_gap_check()?);
        checks.push(self.raw_payload_exists_check()?);
        checks.push(self.sample_audit(LABEL_BILL)?);
        checks.push(self.sample_audit(LABEL_VOTE_EVENT)?);
        checks.push(self.sample_audit(LABEL_EXPENSE)?);

        // single final sweep: the failing gated subset is the issue list
        let issues: Vec<ReconcileIssue> = checks
            .iter()
            .filter(|check| !check.ok && check.gate)
            .map(|check| ReconcileIssue {
                issue_type: check.issue_type.clone(),
                check_name: check.name.clone(),
                expected: check.expected,
                actual: check.actual,
                context: check.context.clone(),
            })
            .collect();

        let status = if issues.is_empty() {
            BatchStatus::Success
        } else {
            BatchStatus::Failed
        };
        let report = ReconcileReport {
            id: Uuid::new_v4().to_string(),
            run_at: Utc::now(),
            status,
            checks,
            issues,
        };
        reports::save_report(&self.store, &report)?;
        info!(
            report_id = %report.id,
            status = report.status.as_str(),
            checks = report.checks.len(),
            issues = report.issues.len(),
            "reconciliation run complete"
        );
        Ok(report)
    }

    // --- coverage ----------------------------------------------------------

    fn coverage_checks(&self) -> Result<Vec<ReconcileCheck>> {
        let mut checks = Vec::new();

        let mut api_legislators = 0_i64;
        let mut params = Params::new();
        params.insert("itens".to_owned(), "100".to_owned());
        for page in self.client.paginated(DEPUTADOS_ENDPOINT, params, None) {
            let (status, body, _params) = page?;
            if status != 200 {
                continue;
            }
            api_legislators += body["dados"].as_array().map_or(0, Vec::len) as i64;
        }
        let graph_legislators = self.graph.count(LABEL_PERSON)?;
        checks.push(check(
            "coverage_legislators_current",
            "coverage_legislators",
            Some(api_legislators),
            Some(graph_legislators),
            graph_legislators == api_legislators && api_legislators > 0,
            true,
            Value::Null,
        ));

        let legislators_with_expenses = self.legislators_with_expenses_since(self.base_year)?;
        checks.push(check(
            "coverage_legislators_with_expenses_since_base_year",
            "coverage_legislators_with_expenses",
            Some(api_legislators),
            Some(legislators_with_expenses),
            legislators_with_expenses >= api_legislators && api_legislators > 0,
            self.expenses_coverage_gate_armed()?,
            json!({"base_year": self.base_year}),
        ));

        let bills = self.graph.nodes(LABEL_BILL)?;
        let events = self.graph.nodes(LABEL_VOTE_EVENT)?;
        let expenses = self.graph.nodes(LABEL_EXPENSE)?;

        let current_year = Utc::now().year();
        for year in self.base_year..=current_year {
            let expected_bills = self.api_year_estimate(PROPOSICOES_ENDPOINT, year);
            let actual_bills = count_by_year(&bills, "year", year);
            checks.push(check(
                "coverage_bills_year",
                "coverage_bills_year",
                Some(expected_bills),
                Some(actual_bills),
                actual_bills >= expected_bills,
                queries::year_fully_covered(&self.store, BATCH_BILLS_PREFIX, year)?,
                json!({"year": year}),
            ));

            let expected_votes = self.api_year_estimate(VOTACOES_ENDPOINT, year);
            let year_prefix = format!("{year}-");
            let actual_votes = events
                .iter()
                .filter(|node| {
                    node.props["registered_at"]
                        .as_str()
                        .is_some_and(|at| at.starts_with(&year_prefix))
                })
                .count() as i64;
            checks.push(check(
                "coverage_votes_year",
                "coverage_votes_year",
                Some(expected_votes),
                Some(actual_votes),
                actual_votes >= expected_votes,
                queries::year_fully_covered(&self.store, BATCH_VOTES_PREFIX, year)?,
                json!({"year": year}),
            ));

            let expected_expenses = self.expenses_expected_from_raw(year)?;
            let actual_expenses = count_by_year(&expenses, "year", year);
            checks.push(check(
                "coverage_expenses_year",
                "coverage_expenses_year",
                Some(expected_expenses),
                Some(actual_expenses),
                actual_expenses >= expected_expenses,
                queries::year_fully_covered(&self.store, BATCH_EXPENSES_PREFIX, year)?,
                json!({"year": year, "expected_from": "raw_payloads"}),
            ));
        }
        Ok(checks)
    }

    /// Per-year total hint from a one-item probe request. Live failures
    /// degrade to zero so reconciliation stays runnable offline.
    fn api_year_estimate(&self, endpoint: &str, year: i32) -> i64 {
        let mut params = Params::new();
        params.insert("ano".to_owned(), year.to_string());
        params.insert("itens".to_owned(), "1".to_owned());
        match self.client.get(endpoint, &params) {
            Ok((200, body)) => match last_page_hint(&body) {
                Some(pages) => i64::from(pages),
                None => body["dados"].as_array().map_or(0, Vec::len) as i64,
            },
            Ok((status, _body)) => {
                warn!(endpoint, year, status, "year probe returned non-200");
                0
            }
            Err(err) => {
                warn!(endpoint, year, error = %format!("{err:#}"), "year probe failed");
                0
            }
        }
    }

    /// The expenses expectation comes from the archive itself: every
    /// 200-status expenses page archived for the year contributes its
    /// row count.
    fn expenses_expected_from_raw(&self, year: i32) -> Result<i64> {
        let year_param = year.to_string();
        let mut total = 0_i64;
        for payload in queries::payloads_like(&self.store, "/deputados/%/despesas")? {
            if payload.http_status != 200 {
                continue;
            }
            if payload.params.get("ano") != Some(&year_param) {
                continue;
            }
            total += payload.body["dados"].as_array().map_or(0, Vec::len) as i64;
        }
        Ok(total)
    }

    fn legislators_with_expenses_since(&self, base_year: i32) -> Result<i64> {
        let mut people: HashSet<String> = HashSet::new();
        for node in self.graph.nodes(LABEL_EXPENSE)? {
            let in_range = node.props["year"]
                .as_i64()
                .is_some_and(|year| year >= i64::from(base_year));
            if !in_range {
                continue;
            }
            if let Some(person_id) = node.props["person_id"].as_str() {
                if self.graph.edge_exists(EDGE_HAS_EXPENSE, person_id, &node.id)? {
                    people.insert(person_id.to_owned());
                }
            }
        }
        Ok(people.len() as i64)
    }

    /// Armed only after a successful, unfiltered expenses backfill: a
    /// non-empty legislator-id filter in the cursor means partial data
    /// is expected, so the check stays informational.
    fn expenses_coverage_gate_armed(&self) -> Result<bool> {
        let Some(state) = self.jobs.get(JOB_EXPENSES)? else {
            return Ok(false);
        };
        if state.status != JobStatus::Success {
            return Ok(false);
        }
        let cursor: LegislatorYearCursor = match serde_json::from_value(state.cursor) {
            Ok(cursor) => cursor,
            Err(_) => return Ok(false),
        };
        Ok(cursor.legislator_ids.is_empty())
    }

    // --- integrity -----------------------------------------------------------

    fn integrity_checks(&self) -> Result<Vec<ReconcileCheck>> {
        let persons: HashSet<String> = node_ids(self.graph.nodes(LABEL_PERSON)?);
        let events: HashSet<String> = node_ids(self.graph.nodes(LABEL_VOTE_EVENT)?);
        let bills: HashSet<String> = node_ids(self.graph.nodes(LABEL_BILL)?);

        let mut actions_without_event = 0_i64;
        let mut actions_without_person = 0_i64;
        for action in self.graph.nodes(LABEL_VOTE_ACTION)? {
            let event_ok = match action.props["vote_event_id"].as_str() {
                Some(event_id) => {
                    events.contains(event_id)
                        && self.graph.edge_exists(EDGE_IN_EVENT, &action.id, event_id)?
                }
                None => false,
            };
            if !event_ok {
                actions_without_event += 1;
            }
            let person_ok = match action.props["person_id"].as_str() {
                Some(person_id) => {
                    persons.contains(person_id)
                        && self.graph.edge_exists(EDGE_CAST, person_id, &action.id)?
                }
                None => false,
            };
            if !person_ok {
                actions_without_person += 1;
            }
        }

        let mut expenses_without_person = 0_i64;
        for expense in self.graph.nodes(LABEL_EXPENSE)? {
            let person_ok = match expense.props["person_id"].as_str() {
                Some(person_id) => {
                    persons.contains(person_id)
                        && self.graph.edge_exists(EDGE_HAS_EXPENSE, person_id, &expense.id)?
                }
                None => false,
            };
            if !person_ok {
                expenses_without_person += 1;
            }
        }

        let mut events_without_bill_edge = 0_i64;
        for event in self.graph.nodes(LABEL_VOTE_EVENT)? {
            let Some(bill_id) = event.props["bill_id"].as_str() else {
                continue;
            };
            let linked = bills.contains(bill_id)
                && self.graph.edge_exists(EDGE_ON_BILL, &event.id, bill_id)?;
            if !linked {
                events_without_bill_edge += 1;
            }
        }

        let item_count_mismatches = queries::item_count_mismatches(&self.store)?;

        Ok(vec![
            zero_check(
                "integrity_vote_action_has_event",
                "referential_integrity",
                actions_without_event,
            ),
            zero_check(
                "integrity_vote_action_has_person",
                "referential_integrity",
                actions_without_person,
            ),
            zero_check(
                "integrity_expense_has_person",
                "referential_integrity",
                expenses_without_person,
            ),
            zero_check(
                "integrity_vote_event_bill_link",
                "referential_integrity",
                events_without_bill_edge,
            ),
            zero_check(
                "integrity_batch_item_counts",
                "archive_integrity",
                item_count_mismatches,
            ),
        ])
    }

    // --- uniqueness ------------------------------------------------------------

    fn uniqueness_checks(&self) -> Result<Vec<ReconcileCheck>> {
        let labels = [
            LABEL_PERSON,
            LABEL_BILL,
            LABEL_VOTE_EVENT,
            LABEL_VOTE_ACTION,
            LABEL_EXPENSE,
            LABEL_ORGANIZATION,
            LABEL_PARTY,
            LABEL_STATE,
        ];
        let mut checks = Vec::new();
        for label in labels {
            let mut seen: HashMap<String, i64> = HashMap::new();
            for node in self.graph.nodes(label)? {
                *seen.entry(node.id).or_insert(0) += 1;
            }
            let duplicates = seen.values().filter(|count| **count > 1).count() as i64;
            checks.push(zero_check(
                &format!("uniqueness_{}", label.to_lowercase()),
                "uniqueness",
                duplicates,
            ));
        }
        Ok(checks)
    }

    // --- temporal ----------------------------------------------------------------

    fn temporal_check(&self) -> Result<ReconcileCheck> {
        let violations = queries::temporal_violations(&self.store)?;
        Ok(zero_check(
            "temporal_batch_fetched_at_consistent",
            "temporal_consistency",
            violations,
        ))
    }

    // --- nominal rolls -------------------------------------------------------------

    /// Undocumented loss is the failure: a non-200 roll-call payload is
    /// fine as long as it carries a typed error classification.
    fn nominal_roll_check(&self) -> Result<ReconcileCheck> {
        let mut undocumented = 0_i64;
        let mut unavailable = 0_i64;
        for payload in queries::payloads_like(&self.store, "/votacoes/%/votos")? {
            let error_type = payload.body["metadata"]["error_type"].as_str();
            if payload.http_status != 200 && error_type.is_none() {
                undocumented += 1;
            }
            if error_type == Some("nominal_votes_not_available") {
                unavailable += 1;
            }
        }
        Ok(check(
            "coverage_nominal_rolls_unavailable_documented",
            "nominal_rolls",
            Some(0),
            Some(undocumented),
            undocumented == 0,
            true,
            json!({"unavailable_count": unavailable}),
        ))
    }

    // --- documented gaps --------------------------------------------------------------

    /// Outstanding backlog signal: the latest successful expenses batch
    /// recording coverage gaps in its own notes fails this check.
    fn documented_gap_check(&self) -> Result<ReconcileCheck> {
        let gap_count = queries::latest_success_batch(&self.store, BATCH_EXPENSES_PREFIX)?
            .and_then(|batch| batch.notes)
            .and_then(|notes| serde_json::from_str::<Value>(&notes).ok())
            .map(|metadata| metadata["coverage_gaps"].as_array().map_or(0, Vec::len) as i64)
            .unwrap_or(0);
        Ok(zero_check(
            "coverage_expenses_documented_gaps",
            "coverage_expenses_documented_gaps",
            gap_count,
        ))
    }

    fn raw_payload_exists_check(&self) -> Result<ReconcileCheck> {
        let count = queries::payload_count(&self.store)?;
        Ok(check(
            "raw_payload_exists",
            "raw",
            Some(1),
            Some(count),
            count > 0,
            true,
            Value::Null,
        ))
    }

    // --- sample audits -----------------------------------------------------------------

    /// Bounded drift audit: resolve a sample of graph nodes back to
    /// their earliest archived payload and compare key fields. Nodes
    /// without an archived counterpart are skipped, not failed; absence
    /// is the coverage checks' concern.
    fn sample_audit(&self, label: &str) -> Result<ReconcileCheck> {
        let nodes = self.graph.nodes(label)?;
        let sample = nodes.iter().take(SAMPLE_LIMIT);

        let mut checked = 0_i64;
        let mut mismatches = 0_i64;
        match label {
            LABEL_BILL => {
                for node in sample {
                    let Some(source_id) = node.props["source_id"].as_i64() else {
                        continue;
                    };
                    let endpoint = endpoints::proposicao_details(source_id);
                    let Some(raw) =
                        queries::first_payload_for(&self.store, &endpoint, &source_id.to_string())?
                    else {
                        continue;
                    };
                    checked += 1;
                    let dados = raw_record(&raw.body);
                    let id_drift = dados["id"].as_i64() != Some(source_id);
                    let year_drift = drift_i64(&node.props["year"], &dados["ano"]);
                    let number_drift = drift_i64(&node.props["number"], &dados["numero"]);
                    if id_drift || year_drift || number_drift {
                        mismatches += 1;
                    }
                }
            }
            LABEL_VOTE_EVENT => {
                for node in sample {
                    let Some(source_id) = node.props["source_id"].as_str() else {
                        continue;
                    };
                    let endpoint = endpoints::votacao_details(source_id);
                    let Some(raw) = queries::first_payload_for(&self.store, &endpoint, source_id)?
                    else {
                        continue;
                    };
                    checked += 1;
                    let dados = raw_record(&raw.body);
                    let id_drift = dados["id"].as_str() != Some(source_id);
                    let registered_drift = match node.props["registered_at"].as_str() {
                        Some(at) => dados["dataHoraRegistro"].as_str() != Some(at),
                        None => false,
                    };
                    if id_drift || registered_drift {
                        mismatches += 1;
                    }
                }
            }
            LABEL_EXPENSE => {
                let raw_rows = self.expense_raw_index()?;
                for node in sample {
                    let Some(source_id) = node.props["source_id"].as_str() else {
                        continue;
                    };
                    let Some(row) = raw_rows.get(source_id) else {
                        continue;
                    };
                    checked += 1;
                    let year_drift = drift_i64(&node.props["year"], &row["ano"]);
                    let month_drift = drift_i64(&node.props["month"], &row["mes"]);
                    if year_drift || month_drift {
                        mismatches += 1;
                    }
                }
            }
            _ => {}
        }

        Ok(check(
            &format!("audit_sample_raw_vs_graph_{}", label.to_lowercase()),
            "audit",
            Some(0),
            Some(mismatches),
            checked == 0 || mismatches == 0,
            true,
            json!({"label": label, "checked": checked}),
        ))
    }

    /// Expense rows live inside archived list pages; index them by
    /// document code, earliest page first.
    fn expense_raw_index(&self) -> Result<HashMap<String, Value>> {
        let mut index: HashMap<String, Value> = HashMap::new();
        for payload in queries::payloads_like(&self.store, "/deputados/%/despesas")? {
            if payload.http_status != 200 {
                continue;
            }
            for row in payload.body["dados"].as_array().into_iter().flatten() {
                let code = match &row["codDocumento"] {
                    Value::String(code) if !code.is_empty() => code.clone(),
                    Value::Number(code) => code.to_string(),
                    _ => continue,
                };
                index.entry(code).or_insert_with(|| row.clone());
            }
        }
        Ok(index)
    }
}

fn check(
    name: &str,
    issue_type: &str,
    expected: Option<i64>,
    actual: Option<i64>,
    ok: bool,
    gate: bool,
    context: Value,
) -> ReconcileCheck {
    ReconcileCheck {
        name: name.to_owned(),
        issue_type: issue_type.to_owned(),
        expected,
        actual,
        ok,
        gate,
        context,
    }
}

fn zero_check(name: &str, issue_type: &str, actual: i64) -> ReconcileCheck {
    check(name, issue_type, Some(0), Some(actual), actual == 0, true, Value::Null)
}

fn node_ids(nodes: Vec<GraphNode>) -> HashSet<String> {
    nodes.into_iter().map(|node| node.id).collect()
}

fn count_by_year(nodes: &[GraphNode], key: &str, year: i32) -> i64 {
    nodes
        .iter()
        .filter(|node| node.props[key].as_i64() == Some(i64::from(year)))
        .count() as i64
}

/// Detail payloads wrap the record under `dados`; list payloads are
/// compared against their first row upstream of this helper.
fn raw_record(body: &Value) -> &Value {
    match body.get("dados") {
        Some(dados) if dados.is_object() => dados,
        _ => body,
    }
}

/// Field drift, tolerant of numbers archived as strings. A value absent
/// on the graph side is not drift.
fn drift_i64(node_value: &Value, raw_value: &Value) -> bool {
    let Some(node_number) = node_value.as_i64() else {
        return false;
    };
    let raw_number = match raw_value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    raw_number != Some(node_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_tolerates_string_numbers_and_absent_node_fields() {
        assert!(!drift_i64(&json!(2023), &json!(2023)));
        assert!(!drift_i64(&json!(2023), &json!("2023")));
        assert!(drift_i64(&json!(2023), &json!(2024)));
        assert!(drift_i64(&json!(2023), &Value::Null));
        assert!(!drift_i64(&Value::Null, &json!(2024)));
    }

    #[test]
    fn raw_record_unwraps_detail_payloads_only() {
        let detail = json!({"dados": {"id": 1}});
        assert_eq!(raw_record(&detail)["id"], 1);
        let flat = json!({"id": 2});
        assert_eq!(raw_record(&flat)["id"], 2);
    }
}

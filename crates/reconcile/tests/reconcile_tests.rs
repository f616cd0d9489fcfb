use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use legisarc_archive_core::{reports, AnchorPublisher, ArchiveStore, JobStateStore, RawArchive};
use legisarc_fetch_client::{FetchClient, FetchConfig};
use legisarc_graph_writer::{GraphWriter, MemoryGraph, LABEL_BILL};
use legisarc_protocol::types::{BatchStatus, Params, Person};
use legisarc_reconcile::ReconcileEngine;
use serde_json::json;

/// Stub upstream. Pops scripted `(status, body)` responses in order;
/// once the script is exhausted it echoes `{"dados": "<path>"}`.
struct StubServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StubServer {
    fn start(script: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
        listener
            .set_nonblocking(true)
            .expect("set nonblocking listener");
        let addr = listener.local_addr().expect("listener local addr");
        let stop = Arc::new(AtomicBool::new(false));
        let script: Arc<Mutex<VecDeque<(u16, String)>>> =
            Arc::new(Mutex::new(script.into_iter().collect()));

        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let script = Arc::clone(&script);
                        thread::spawn(move || handle_conn(stream, &script));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_conn(mut stream: TcpStream, script: &Arc<Mutex<VecDeque<(u16, String)>>>) {
    let mut buf = [0_u8; 8192];
    let n = stream.read(&mut buf).unwrap_or(0);
    if n == 0 {
        return;
    }
    let req = String::from_utf8_lossy(&buf[..n]);
    let line = req.lines().next().unwrap_or_default().to_owned();

    let scripted = script.lock().expect("script lock").pop_front();
    let (status, body) = match scripted {
        Some(pair) => pair,
        None => {
            let path = line.split(' ').nth(1).unwrap_or("/").to_owned();
            (200, json!({"dados": path}).to_string())
        }
    };
    let response = format!(
        "HTTP/1.1 {} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

struct Fixture {
    store: ArchiveStore,
    archive: RawArchive,
    jobs: JobStateStore,
    graph: MemoryGraph,
    client: FetchClient,
    _server: StubServer,
}

/// One archived payload so `raw_payload_exists` holds, plus whatever
/// the scripted upstream answers during the run.
fn fixture(script: Vec<(u16, String)>) -> Fixture {
    let server = StubServer::start(script);
    let store = ArchiveStore::open_in_memory().expect("open store");
    let archive = RawArchive::new(store.clone(), AnchorPublisher::Placeholder);
    let jobs = JobStateStore::new(store.clone());
    let graph = MemoryGraph::default();
    let client = FetchClient::new(FetchConfig {
        base_url: server.base_url(),
        max_rps: 0.0,
        timeout: Duration::from_secs(5),
        max_retries: 0,
        ..FetchConfig::default()
    })
    .expect("client");

    let batch = archive
        .start_batch("camara:deputados:current", None, None)
        .expect("start batch");
    archive
        .add_payload(
            &batch.id,
            "/deputados",
            &Params::new(),
            None,
            200,
            &json!({"dados": [{"id": 1}, {"id": 2}]}),
        )
        .expect("archive payload");
    archive.finish_batch(&batch.id, None).expect("seal batch");

    Fixture {
        store,
        archive,
        jobs,
        graph,
        client,
        _server: server,
    }
}

fn engine(fx: &Fixture) -> ReconcileEngine<MemoryGraph> {
    ReconcileEngine::new(
        fx.store.clone(),
        fx.jobs.clone(),
        fx.graph.clone(),
        fx.client.clone(),
    )
    .with_base_year(Utc::now().year())
}

fn person(id: i64) -> Person {
    Person {
        id: format!("camara:person:{id}"),
        source_id: id,
        name: Some(format!("Pessoa {id}")),
        electoral_name: None,
        party: Some("XYZ".to_owned()),
        state: Some("SP".to_owned()),
        photo_url: None,
        email: None,
    }
}

fn deputados_page(ids: &[i64]) -> (u16, String) {
    let dados: Vec<_> = ids.iter().map(|id| json!({"id": id})).collect();
    (200, json!({"dados": dados, "links": []}).to_string())
}

#[test]
fn matching_graph_and_api_reconcile_clean() {
    let fx = fixture(vec![deputados_page(&[1, 2])]);
    fx.graph.upsert_person(&person(1)).expect("upsert");
    fx.graph.upsert_person(&person(2)).expect("upsert");

    let report = engine(&fx).run().expect("run");
    assert_eq!(report.status, BatchStatus::Success);
    assert!(report.issues.is_empty(), "issues: {:?}", report.issues);
    assert!(report.checks.iter().any(|c| c.name == "raw_payload_exists" && c.ok));

    let reloaded = reports::latest_report(&fx.store)
        .expect("load report")
        .expect("report saved");
    assert_eq!(reloaded.id, report.id);
    assert_eq!(reloaded.checks.len(), report.checks.len());
}

#[test]
fn legislator_count_shortfall_is_a_gated_issue() {
    let fx = fixture(vec![deputados_page(&[1, 2, 3])]);
    fx.graph.upsert_person(&person(1)).expect("upsert");
    fx.graph.upsert_person(&person(2)).expect("upsert");

    let report = engine(&fx).run().expect("run");
    assert_eq!(report.status, BatchStatus::Failed);
    let issue = report
        .issues
        .iter()
        .find(|i| i.check_name == "coverage_legislators_current")
        .expect("coverage issue");
    assert_eq!(issue.expected, Some(3));
    assert_eq!(issue.actual, Some(2));
}

#[test]
fn duplicate_node_identities_fail_uniqueness() {
    let fx = fixture(vec![deputados_page(&[1])]);
    fx.graph.upsert_person(&person(1)).expect("upsert");
    fx.graph
        .insert_unchecked(LABEL_BILL, "camara:bill:7", json!({"id": "camara:bill:7"}));
    fx.graph
        .insert_unchecked(LABEL_BILL, "camara:bill:7", json!({"id": "camara:bill:7"}));

    let report = engine(&fx).run().expect("run");
    assert_eq!(report.status, BatchStatus::Failed);
    assert!(report
        .issues
        .iter()
        .any(|i| i.check_name == "uniqueness_bill" && i.actual == Some(1)));
}

#[test]
fn undocumented_nominal_roll_loss_is_flagged() {
    let fx = fixture(vec![deputados_page(&[1])]);
    fx.graph.upsert_person(&person(1)).expect("upsert");

    let batch = fx
        .archive
        .start_batch("camara:votes:2024-01-01", None, None)
        .expect("start batch");
    // undocumented non-200
    fx.archive
        .add_payload(
            &batch.id,
            "/votacoes/111-1/votos",
            &Params::new(),
            Some("111-1"),
            500,
            &json!({}),
        )
        .expect("archive roll");
    // documented absence
    fx.archive
        .add_payload(
            &batch.id,
            "/votacoes/111-2/votos",
            &Params::new(),
            Some("111-2"),
            404,
            &json!({"dados": [], "metadata": {"error_type": "nominal_votes_not_available", "status_code": 404}}),
        )
        .expect("archive roll");
    fx.archive.finish_batch(&batch.id, None).expect("seal");

    let report = engine(&fx).run().expect("run");
    let check = report
        .checks
        .iter()
        .find(|c| c.name == "coverage_nominal_rolls_unavailable_documented")
        .expect("nominal roll check");
    assert!(!check.ok);
    assert_eq!(check.actual, Some(1));
    assert_eq!(check.context["unavailable_count"], 1);
    assert!(report
        .issues
        .iter()
        .any(|i| i.check_name == "coverage_nominal_rolls_unavailable_documented"));
}

#[test]
fn recorded_expense_gaps_keep_failing_until_cleared() {
    let fx = fixture(vec![deputados_page(&[1])]);
    fx.graph.upsert_person(&person(1)).expect("upsert");

    let batch = fx
        .archive
        .start_batch("camara:expenses:2024-01-01", None, None)
        .expect("start batch");
    fx.archive
        .finish_batch(
            &batch.id,
            Some(json!({
                "processed": 0,
                "fallback_rows": 0,
                "coverage_gaps": [{"legislator_id": 1, "year": 2024, "reason": "timeout"}],
            })),
        )
        .expect("seal");

    let report = engine(&fx).run().expect("run");
    let issue = report
        .issues
        .iter()
        .find(|i| i.check_name == "coverage_expenses_documented_gaps")
        .expect("documented gap issue");
    assert_eq!(issue.actual, Some(1));
}

#[test]
fn payload_fetched_after_declared_range_violates_temporal_check() {
    let fx = fixture(vec![deputados_page(&[1])]);
    fx.graph.upsert_person(&person(1)).expect("upsert");

    // backfill batch whose declared range ended long before the fetch
    let batch = fx
        .archive
        .start_batch(
            "camara:bills:2023-01-01",
            NaiveDate::from_ymd_opt(2023, 1, 1),
            NaiveDate::from_ymd_opt(2023, 12, 31),
        )
        .expect("start batch");
    fx.archive
        .add_payload(
            &batch.id,
            "/proposicoes",
            &Params::new(),
            None,
            200,
            &json!({"dados": []}),
        )
        .expect("archive payload");
    fx.archive.finish_batch(&batch.id, None).expect("seal");

    let report = engine(&fx).run().expect("run");
    let check = report
        .checks
        .iter()
        .find(|c| c.name == "temporal_batch_fetched_at_consistent")
        .expect("temporal check");
    assert!(!check.ok);
    assert_eq!(check.actual, Some(1));
    assert!(report
        .issues
        .iter()
        .any(|i| i.check_name == "temporal_batch_fetched_at_consistent"));
}

#[test]
fn sample_audit_catches_normalization_drift() {
    let fx = fixture(vec![deputados_page(&[1])]);
    fx.graph.upsert_person(&person(1)).expect("upsert");

    let batch = fx
        .archive
        .start_batch("camara:bills:2024-01-01", None, None)
        .expect("start batch");
    fx.archive
        .add_payload(
            &batch.id,
            "/proposicoes/77",
            &Params::new(),
            Some("77"),
            200,
            &json!({"dados": {"id": 77, "ano": 2024, "numero": 10, "siglaTipo": "PL"}}),
        )
        .expect("archive detail");
    fx.archive.finish_batch(&batch.id, None).expect("seal");

    // graph carries a different year than the archived record
    fx.graph.insert_unchecked(
        LABEL_BILL,
        "camara:bill:77",
        json!({"id": "camara:bill:77", "source_id": 77, "year": 2023, "number": 10}),
    );

    let report = engine(&fx).run().expect("run");
    let check = report
        .checks
        .iter()
        .find(|c| c.name == "audit_sample_raw_vs_graph_bill")
        .expect("bill audit check");
    assert!(!check.ok);
    assert_eq!(check.actual, Some(1));
    assert_eq!(check.context["checked"], 1);
}

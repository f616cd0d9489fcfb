use legisarc_archive_core::{queries, reports, AnchorPublisher, ArchiveStore, JobStateStore, RawArchive};
use legisarc_proof::{merkle_root, sha256_json};
use legisarc_protocol::types::{
    BatchStatus, JobStatus, Params, ReconcileReport, BATCH_LEGISLATORS,
};
use serde_json::{json, Value};
use uuid::Uuid;

fn file_archive(dir: &tempfile::TempDir) -> RawArchive {
    let store = ArchiveStore::open_in_memory().expect("open store");
    let publisher = AnchorPublisher::File {
        log_path: dir.path().join("anchors.json"),
    };
    RawArchive::new(store, publisher)
}

#[test]
fn sealed_batch_root_matches_reference_computation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = file_archive(&dir);
    let batch = archive
        .start_batch(BATCH_LEGISLATORS, None, None)
        .expect("start batch");

    let bodies: Vec<Value> = (0..5)
        .map(|i| json!({"dados": {"id": i, "nome": format!("Deputado {i}")}}))
        .collect();
    for (i, body) in bodies.iter().enumerate() {
        archive
            .add_payload(
                &batch.id,
                &format!("/deputados/{i}"),
                &Params::new(),
                Some(&i.to_string()),
                200,
                body,
            )
            .expect("add payload");
    }

    let reference: Vec<String> = bodies
        .iter()
        .map(|b| sha256_json(b).expect("hash"))
        .collect();
    let expected_root = merkle_root(&reference);

    let sealed = archive
        .finish_batch(&batch.id, Some(json!({"coverage_gaps": []})))
        .expect("finish batch");
    assert_eq!(sealed.status, BatchStatus::Success);
    assert_eq!(sealed.item_count, 5);
    assert_eq!(sealed.merkle_root.as_deref(), Some(expected_root.as_str()));
    assert!(sealed.anchor_id.is_some());
    assert!(sealed.finished_at.is_some());

    // leaves are dense and ordered
    assert_eq!(archive.batch_leaves(&batch.id).expect("leaves"), reference);

    // the file log holds exactly one entry carrying the root and batch id
    let raw = std::fs::read_to_string(dir.path().join("anchors.json")).expect("read log");
    let entries: Vec<Value> = serde_json::from_str(&raw).expect("decode log");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["root"], json!(expected_root));
    assert_eq!(entries[0]["batch_id"], json!(batch.id));
    assert_eq!(entries[0]["anchor_type"], json!("file-log"));
}

#[test]
fn empty_batch_seals_with_empty_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = file_archive(&dir);
    let batch = archive
        .start_batch(BATCH_LEGISLATORS, None, None)
        .expect("start batch");
    let sealed = archive.finish_batch(&batch.id, None).expect("finish");
    assert_eq!(sealed.merkle_root.as_deref(), Some(""));
    assert_eq!(sealed.item_count, 0);
}

#[test]
fn failed_batch_keeps_archived_items() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = file_archive(&dir);
    let batch = archive
        .start_batch("camara:bills:2024-01-01", None, None)
        .expect("start batch");
    archive
        .add_payload(
            &batch.id,
            "/proposicoes/1",
            &Params::new(),
            Some("1"),
            200,
            &json!({"dados": {"id": 1}}),
        )
        .expect("add payload");
    archive
        .fail_batch(&batch.id, "upstream gave up")
        .expect("fail batch");

    let failed = archive.batch(&batch.id).expect("reload");
    assert_eq!(failed.status, BatchStatus::Failed);
    assert_eq!(failed.notes.as_deref(), Some("upstream gave up"));
    assert_eq!(failed.item_count, 1);
    assert_eq!(archive.batch_leaves(&batch.id).expect("leaves").len(), 1);
    assert!(failed.merkle_root.is_none());
}

#[test]
fn composite_anchor_writes_both_sinks_and_returns_relational_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ArchiveStore::open_in_memory().expect("open store");
    let publisher = AnchorPublisher::Composite {
        log_path: dir.path().join("anchors.json"),
        store: store.clone(),
    };
    let archive = RawArchive::new(store.clone(), publisher);

    let batch = archive
        .start_batch(BATCH_LEGISLATORS, None, None)
        .expect("start batch");
    let sealed = archive.finish_batch(&batch.id, None).expect("finish");

    let rows = queries::anchors_for_batch(&store, &batch.id).expect("anchors");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].anchor_type, "relational");
    assert_eq!(sealed.anchor_id.as_deref(), Some(rows[0].id.as_str()));

    let raw = std::fs::read_to_string(dir.path().join("anchors.json")).expect("read log");
    let entries: Vec<Value> = serde_json::from_str(&raw).expect("decode log");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["anchor_type"], json!("file-log"));
}

#[test]
fn payload_hash_is_canonical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = file_archive(&dir);
    let batch = archive
        .start_batch(BATCH_LEGISLATORS, None, None)
        .expect("start batch");
    let body = json!({"dados": {"nome": "X", "id": 9}});
    let payload = archive
        .add_payload(&batch.id, "/deputados/9", &Params::new(), Some("9"), 200, &body)
        .expect("add payload");
    assert_eq!(payload.sha256, sha256_json(&body).expect("hash"));
}

#[test]
fn job_state_roundtrips_cursor_and_status() {
    let store = ArchiveStore::open_in_memory().expect("open store");
    let jobs = JobStateStore::new(store);

    assert!(jobs.get("ingest_bills_since").expect("get").is_none());

    let cursor = json!({"window_index": 2, "processed": 40});
    jobs.set("ingest_bills_since", &cursor, JobStatus::Running)
        .expect("set running");
    jobs.set("ingest_bills_since", &cursor, JobStatus::Success)
        .expect("set success");

    let state = jobs
        .get("ingest_bills_since")
        .expect("get")
        .expect("state exists");
    assert_eq!(state.status, JobStatus::Success);
    assert_eq!(state.cursor["window_index"], 2);

    let all = jobs.list().expect("list");
    assert_eq!(all.len(), 1);
}

#[test]
fn reports_persist_and_reload() {
    let store = ArchiveStore::open_in_memory().expect("open store");
    let report = ReconcileReport {
        id: Uuid::new_v4().to_string(),
        run_at: chrono::Utc::now(),
        status: BatchStatus::Success,
        checks: vec![],
        issues: vec![],
    };
    reports::save_report(&store, &report).expect("save");
    let loaded = reports::latest_report(&store)
        .expect("load")
        .expect("report exists");
    assert_eq!(loaded.id, report.id);
    assert_eq!(loaded.status, BatchStatus::Success);
}

#[test]
fn year_coverage_gate_requires_full_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = file_archive(&dir);
    let store = archive.store().clone();

    let full = archive
        .start_batch(
            "camara:bills:2023-01-01",
            chrono::NaiveDate::from_ymd_opt(2023, 1, 1),
            chrono::NaiveDate::from_ymd_opt(2023, 12, 31),
        )
        .expect("start batch");
    archive.finish_batch(&full.id, None).expect("finish");

    let partial = archive
        .start_batch(
            "camara:bills:2024-03-01",
            chrono::NaiveDate::from_ymd_opt(2024, 3, 1),
            chrono::NaiveDate::from_ymd_opt(2024, 6, 30),
        )
        .expect("start batch");
    archive.finish_batch(&partial.id, None).expect("finish");

    assert!(queries::year_fully_covered(&store, "camara:bills:", 2023).expect("covered"));
    assert!(!queries::year_fully_covered(&store, "camara:bills:", 2024).expect("covered"));
}

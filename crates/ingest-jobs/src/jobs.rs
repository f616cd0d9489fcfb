//! The per-entity orchestrators. Each job is a named state machine
//! (idle -> running -> success | failed) whose progress is persisted
//! after every page/window/unit of work.

use anyhow::{bail, Result};
use chrono::{Duration, NaiveDate, Utc};
use legisarc_archive_core::{JobStateStore, RawArchive};
use legisarc_fetch_client::FetchClient;
use legisarc_graph_writer::GraphWriter;
use legisarc_protocol::endpoints::{
    self, DEFAULT_PAGE_SIZE, DEPUTADOS_ENDPOINT, PROPOSICOES_ENDPOINT, VOTACOES_ENDPOINT,
};
use legisarc_protocol::ids;
use legisarc_protocol::types::{
    CoverageGap, JobStatus, LegislatorYearCursor, NominalRollError, PageCursor, Params,
    WindowCursor, WindowOutcome, BATCH_BILLS_PREFIX, BATCH_EXPENSES_PREFIX, BATCH_LEGISLATORS,
    BATCH_VOTES_PREFIX, JOB_BILLS, JOB_EXPENSES, JOB_LEGISLATORS, JOB_VOTES,
};
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::fallback::DatasetConfig;
use crate::normalize::{
    normalize_bill, normalize_expense, normalize_person, normalize_vote_action,
    normalize_vote_event, opt_i64, vote_legislator_id,
};
use crate::windows::{date_windows, MAX_WINDOW_DAYS};

pub struct IngestJobs<G: GraphWriter> {
    pub(crate) client: FetchClient,
    pub(crate) archive: RawArchive,
    pub(crate) jobs: JobStateStore,
    pub(crate) graph: G,
    pub(crate) datasets: DatasetConfig,
}

impl<G: GraphWriter> IngestJobs<G> {
    pub fn new(
        client: FetchClient,
        archive: RawArchive,
        jobs: JobStateStore,
        graph: G,
        datasets: DatasetConfig,
    ) -> Self {
        Self {
            client,
            archive,
            jobs,
            graph,
            datasets,
        }
    }

    fn set_state<C: Serialize>(&self, job_name: &str, cursor: &C, status: JobStatus) -> Result<()> {
        self.jobs.set(job_name, &serde_json::to_value(cursor)?, status)
    }

    fn resume_cursor<C: serde::de::DeserializeOwned + Default>(&self, job_name: &str) -> C {
        self.jobs
            .get(job_name)
            .ok()
            .flatten()
            .and_then(|state| serde_json::from_value(state.cursor).ok())
            .unwrap_or_default()
    }

    /// Outermost failure handler: persist the failed batch and job state,
    /// then let the error propagate.
    fn fail_job(&self, job_name: &str, batch_id: &str, err: anyhow::Error) -> Result<Value> {
        let reason = format!("{err:#}");
        warn!(job = job_name, batch_id, error = %reason, "job failed");
        if let Err(db_err) = self.archive.fail_batch(batch_id, &reason) {
            warn!(batch_id, error = %format!("{db_err:#}"), "could not mark batch failed");
        }
        let _ = self
            .jobs
            .set(job_name, &json!({"error": reason}), JobStatus::Failed);
        Err(err)
    }

    // --- legislators -------------------------------------------------------

    /// Paginates the current members list and re-archives and re-upserts
    /// every member's detail record on each run, whether or not it
    /// changed. Resumes from the last committed page.
    pub fn ingest_legislators(&self, max_pages: Option<u32>) -> Result<Value> {
        let resume: PageCursor = self.resume_cursor(JOB_LEGISLATORS);
        let start_page = resume.page.max(1);
        self.set_state(
            JOB_LEGISLATORS,
            &PageCursor {
                page: start_page,
                processed: 0,
                error: None,
            },
            JobStatus::Running,
        )?;
        let batch = self.archive.start_batch(BATCH_LEGISLATORS, None, None)?;

        match self.run_legislators(&batch.id, start_page, max_pages) {
            Ok(processed) => {
                self.archive
                    .finish_batch(&batch.id, Some(json!({"item_count": processed})))?;
                self.set_state(
                    JOB_LEGISLATORS,
                    &PageCursor {
                        page: 1,
                        processed,
                        error: None,
                    },
                    JobStatus::Success,
                )?;
                info!(processed, batch_id = %batch.id, "legislators ingested");
                Ok(json!({
                    "job": JOB_LEGISLATORS,
                    "status": "success",
                    "processed": processed,
                    "batch_id": batch.id,
                }))
            }
            Err(err) => self.fail_job(JOB_LEGISLATORS, &batch.id, err),
        }
    }

    fn run_legislators(
        &self,
        batch_id: &str,
        start_page: u32,
        max_pages: Option<u32>,
    ) -> Result<u64> {
        self.graph.ensure_constraints()?;
        let mut processed = 0_u64;
        let mut params = list_params();
        params.insert("pagina".to_owned(), start_page.to_string());

        for page in self.client.paginated(DEPUTADOS_ENDPOINT, params, max_pages) {
            let (status, body, page_params) = page?;
            self.archive
                .add_payload(batch_id, DEPUTADOS_ENDPOINT, &page_params, None, status, &body)?;

            for dep in items_with(&body, |item| opt_i64(item, "id")) {
                let (dep_id, item) = dep;
                let endpoint = endpoints::deputado_details(dep_id);
                let (d_status, d_body) = self.client.get(&endpoint, &Params::new())?;
                self.archive.add_payload(
                    batch_id,
                    &endpoint,
                    &Params::new(),
                    Some(&dep_id.to_string()),
                    d_status,
                    &d_body,
                )?;
                let detail = detail_or(&d_body, &item);
                if let Some(person) = normalize_person(detail) {
                    self.graph.upsert_person(&person)?;
                    processed += 1;
                }
            }

            self.set_state(
                JOB_LEGISLATORS,
                &PageCursor {
                    page: page_number(&page_params),
                    processed,
                    error: None,
                },
                JobStatus::Running,
            )?;
        }
        Ok(processed)
    }

    // --- bills ---------------------------------------------------------------

    pub fn ingest_bills_since(
        &self,
        from: NaiveDate,
        to: Option<NaiveDate>,
        max_pages: Option<u32>,
    ) -> Result<Value> {
        let to = to.unwrap_or_else(|| Utc::now().date_naive());
        let mut cursor = WindowCursor {
            from: Some(from),
            to: Some(to),
            ..WindowCursor::default()
        };
        self.set_state(JOB_BILLS, &cursor, JobStatus::Running)?;
        let batch = self.archive.start_batch(
            &format!("{BATCH_BILLS_PREFIX}{from}"),
            Some(from),
            Some(to),
        )?;

        match self.run_bills(&batch.id, from, to, max_pages, &mut cursor) {
            Ok((processed, gaps, outcomes)) => {
                self.archive.finish_batch(
                    &batch.id,
                    Some(json!({"processed": processed, "coverage_gaps": gaps})),
                )?;
                cursor.processed = processed;
                self.set_state(JOB_BILLS, &cursor, JobStatus::Success)?;
                info!(processed, gaps = gaps.len(), batch_id = %batch.id, "bills ingested");
                Ok(json!({
                    "job": JOB_BILLS,
                    "status": "success",
                    "processed": processed,
                    "batch_id": batch.id,
                    "windows": outcomes,
                }))
            }
            Err(err) => self.fail_job(JOB_BILLS, &batch.id, err),
        }
    }

    fn run_bills(
        &self,
        batch_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        max_pages: Option<u32>,
        cursor: &mut WindowCursor,
    ) -> Result<(u64, Vec<CoverageGap>, Vec<WindowOutcome>)> {
        let mut processed = 0_u64;
        let mut gaps = Vec::new();
        let mut outcomes = Vec::new();

        for (index, (window_start, window_end)) in
            date_windows(from, to, MAX_WINDOW_DAYS).into_iter().enumerate()
        {
            cursor.window_index = index as u32 + 1;
            cursor.window_start = Some(window_start);
            cursor.window_end = Some(window_end);

            match self.bills_window(batch_id, window_start, window_end, max_pages, cursor, &mut processed) {
                Ok(pages) => outcomes.push(WindowOutcome::Success {
                    window_start,
                    window_end,
                    pages,
                }),
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(%window_start, %window_end, error = %reason, "bills window failed live");
                    if self.datasets.bills_url_template.is_some() {
                        let rows =
                            self.bills_static_fallback(batch_id, window_start, window_end)?;
                        processed += rows;
                        gaps.push(window_gap(window_start, window_end, &reason, rows, 0, 0));
                        outcomes.push(WindowOutcome::UsedFallback {
                            window_start,
                            window_end,
                            reason,
                            rows_recovered: rows,
                        });
                        cursor.fallback = true;
                    } else {
                        gaps.push(window_gap(window_start, window_end, &reason, 0, 0, 0));
                        outcomes.push(WindowOutcome::Failed {
                            window_start,
                            window_end,
                            reason,
                        });
                    }
                    cursor.processed = processed;
                    self.set_state(JOB_BILLS, cursor, JobStatus::Running)?;
                }
            }
        }
        Ok((processed, gaps, outcomes))
    }

    fn bills_window(
        &self,
        batch_id: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
        max_pages: Option<u32>,
        cursor: &mut WindowCursor,
        processed: &mut u64,
    ) -> Result<u32> {
        let mut pages_seen = 0_u32;
        let params = window_params(window_start, window_end);
        for page in self.client.paginated(PROPOSICOES_ENDPOINT, params, max_pages) {
            let (status, body, page_params) = page?;
            pages_seen += 1;
            self.archive.add_payload(
                batch_id,
                PROPOSICOES_ENDPOINT,
                &page_params,
                None,
                status,
                &body,
            )?;

            let items = items_with(&body, |item| opt_i64(item, "id"));
            let requests: Vec<(String, Params)> = items
                .iter()
                .map(|(id, _)| (endpoints::proposicao_details(*id), Params::new()))
                .collect();
            let responses = self.client.fetch_many(requests)?;

            for ((prop_id, item), (d_status, d_body)) in items.iter().zip(responses) {
                let endpoint = endpoints::proposicao_details(*prop_id);
                self.archive.add_payload(
                    batch_id,
                    &endpoint,
                    &Params::new(),
                    Some(&prop_id.to_string()),
                    d_status,
                    &d_body,
                )?;
                if let Some(bill) = normalize_bill(detail_or(&d_body, item)) {
                    self.graph.upsert_bill(&bill)?;
                    *processed += 1;
                }
            }

            cursor.page = Some(page_number(&page_params));
            cursor.processed = *processed;
            self.set_state(JOB_BILLS, cursor, JobStatus::Running)?;
        }
        Ok(pages_seen)
    }

    // --- votes ---------------------------------------------------------------

    /// Vote events plus their nominal rolls. An optional legislator-id
    /// filter restricts which vote actions are upserted; the filter is
    /// recorded in the cursor because the expenses coverage gate reads
    /// the analogous field there.
    pub fn ingest_votes_since(
        &self,
        from: NaiveDate,
        to: Option<NaiveDate>,
        legislator_ids: &[i64],
        max_pages: Option<u32>,
    ) -> Result<Value> {
        let to = to.unwrap_or_else(|| Utc::now().date_naive());
        let mut selected: Vec<i64> = legislator_ids.to_vec();
        selected.sort_unstable();
        selected.dedup();

        let mut cursor = WindowCursor {
            from: Some(from),
            to: Some(to),
            legislator_ids: selected.clone(),
            ..WindowCursor::default()
        };
        self.set_state(JOB_VOTES, &cursor, JobStatus::Running)?;
        let batch = self.archive.start_batch(
            &format!("{BATCH_VOTES_PREFIX}{from}"),
            Some(from),
            Some(to),
        )?;

        match self.run_votes(&batch.id, from, to, &selected, max_pages, &mut cursor) {
            Ok((events, actions, gaps, outcomes)) => {
                self.archive.finish_batch(
                    &batch.id,
                    Some(json!({"events": events, "actions": actions, "coverage_gaps": gaps})),
                )?;
                cursor.events = events;
                cursor.actions = actions;
                self.set_state(JOB_VOTES, &cursor, JobStatus::Success)?;
                info!(events, actions, gaps = gaps.len(), batch_id = %batch.id, "votes ingested");
                Ok(json!({
                    "job": JOB_VOTES,
                    "status": "success",
                    "events": events,
                    "actions": actions,
                    "batch_id": batch.id,
                    "windows": outcomes,
                }))
            }
            Err(err) => self.fail_job(JOB_VOTES, &batch.id, err),
        }
    }

    #[allow(clippy::type_complexity)]
    fn run_votes(
        &self,
        batch_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        selected: &[i64],
        max_pages: Option<u32>,
        cursor: &mut WindowCursor,
    ) -> Result<(u64, u64, Vec<CoverageGap>, Vec<WindowOutcome>)> {
        let mut events = 0_u64;
        let mut actions = 0_u64;
        let mut gaps = Vec::new();
        let mut outcomes = Vec::new();

        for (index, (window_start, window_end)) in
            date_windows(from, to, MAX_WINDOW_DAYS).into_iter().enumerate()
        {
            cursor.window_index = index as u32 + 1;
            cursor.window_start = Some(window_start);
            cursor.window_end = Some(window_end);

            match self.votes_window(
                batch_id,
                window_start,
                window_end,
                selected,
                max_pages,
                cursor,
                &mut events,
                &mut actions,
            ) {
                Ok(pages) => outcomes.push(WindowOutcome::Success {
                    window_start,
                    window_end,
                    pages,
                }),
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(%window_start, %window_end, error = %reason, "votes window failed live");
                    if self.datasets.votes_url_template.is_some() {
                        let (fb_events, fb_actions) = self.votes_static_fallback(
                            batch_id,
                            window_start,
                            window_end,
                            selected,
                        )?;
                        events += fb_events;
                        actions += fb_actions;
                        gaps.push(window_gap(
                            window_start,
                            window_end,
                            &reason,
                            0,
                            fb_events,
                            fb_actions,
                        ));
                        outcomes.push(WindowOutcome::UsedFallback {
                            window_start,
                            window_end,
                            reason,
                            rows_recovered: fb_events + fb_actions,
                        });
                        cursor.fallback = true;
                    } else {
                        gaps.push(window_gap(window_start, window_end, &reason, 0, 0, 0));
                        outcomes.push(WindowOutcome::Failed {
                            window_start,
                            window_end,
                            reason,
                        });
                    }
                    cursor.events = events;
                    cursor.actions = actions;
                    self.set_state(JOB_VOTES, cursor, JobStatus::Running)?;
                }
            }
        }
        Ok((events, actions, gaps, outcomes))
    }

    #[allow(clippy::too_many_arguments)]
    fn votes_window(
        &self,
        batch_id: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
        selected: &[i64],
        max_pages: Option<u32>,
        cursor: &mut WindowCursor,
        events: &mut u64,
        actions: &mut u64,
    ) -> Result<u32> {
        let mut pages_seen = 0_u32;
        let params = window_params(window_start, window_end);
        for page in self.client.paginated(VOTACOES_ENDPOINT, params, max_pages) {
            let (status, body, page_params) = page?;
            pages_seen += 1;
            self.archive
                .add_payload(batch_id, VOTACOES_ENDPOINT, &page_params, None, status, &body)?;

            let items = items_with(&body, |item| {
                item.get("id").and_then(Value::as_str).map(str::to_owned)
            });
            let detail_requests: Vec<(String, Params)> = items
                .iter()
                .map(|(id, _)| (endpoints::votacao_details(id), Params::new()))
                .collect();
            let nominal_requests: Vec<(String, Params)> = items
                .iter()
                .map(|(id, _)| (endpoints::votacao_votos(id), Params::new()))
                .collect();
            let details = self.client.fetch_many(detail_requests)?;
            let nominals = self.client.fetch_many_lenient(nominal_requests)?;

            for (((votacao_id, item), (d_status, d_body)), (v_status, v_body)) in
                items.iter().zip(details).zip(nominals)
            {
                let detail_endpoint = endpoints::votacao_details(votacao_id);
                self.archive.add_payload(
                    batch_id,
                    &detail_endpoint,
                    &Params::new(),
                    Some(votacao_id),
                    d_status,
                    &d_body,
                )?;
                let Some(event) = normalize_vote_event(detail_or(&d_body, item)) else {
                    continue;
                };
                self.graph.upsert_vote_event(&event)?;
                *events += 1;

                let votos_endpoint = endpoints::votacao_votos(votacao_id);
                if v_status != 200 {
                    let annotated = annotate_roll_error(&v_body, v_status);
                    self.archive.add_payload(
                        batch_id,
                        &votos_endpoint,
                        &Params::new(),
                        Some(votacao_id),
                        v_status,
                        &annotated,
                    )?;
                    continue;
                }

                self.archive.add_payload(
                    batch_id,
                    &votos_endpoint,
                    &Params::new(),
                    Some(votacao_id),
                    v_status,
                    &v_body,
                )?;
                for voto in v_body["dados"].as_array().into_iter().flatten() {
                    let Some(dep_id) = vote_legislator_id(voto) else {
                        continue;
                    };
                    if !selected.is_empty() && !selected.contains(&dep_id) {
                        continue;
                    }
                    let person_id = ids::person_id(dep_id);
                    let action = normalize_vote_action(voto, &event.id, &person_id);
                    self.graph.upsert_vote_action(&action)?;
                    *actions += 1;
                }
            }

            cursor.page = Some(page_number(&page_params));
            cursor.events = *events;
            cursor.actions = *actions;
            self.set_state(JOB_VOTES, cursor, JobStatus::Running)?;
        }
        Ok(pages_seen)
    }

    // --- expenses ------------------------------------------------------------

    /// Every known legislator x every year in range. Per-pair live
    /// failures are deferred into coverage gaps and back-filled from the
    /// bulk CSV dataset after the main pass.
    pub fn ingest_expenses_since(
        &self,
        from: NaiveDate,
        to: Option<NaiveDate>,
        legislator_ids: &[i64],
    ) -> Result<Value> {
        let to = to.unwrap_or_else(|| Utc::now().date_naive());
        let mut selected: Vec<i64> = legislator_ids.to_vec();
        selected.sort_unstable();
        selected.dedup();

        let resume: LegislatorYearCursor = self.resume_cursor(JOB_EXPENSES);
        let start_index = resume.legislator_index;
        let start_year = resume.year.unwrap_or_else(|| from_year(from));

        let mut cursor = LegislatorYearCursor {
            from: Some(from),
            to: Some(to),
            legislator_index: start_index,
            year: Some(start_year),
            legislator_ids: selected.clone(),
            ..LegislatorYearCursor::default()
        };
        self.set_state(JOB_EXPENSES, &cursor, JobStatus::Running)?;
        let batch = self.archive.start_batch(
            &format!("{BATCH_EXPENSES_PREFIX}{from}"),
            Some(from),
            Some(to),
        )?;

        match self.run_expenses(&batch.id, from, to, &selected, start_index, start_year, &mut cursor)
        {
            Ok((processed, fallback_rows, gaps)) => {
                self.archive.finish_batch(
                    &batch.id,
                    Some(json!({
                        "processed": processed,
                        "fallback_rows": fallback_rows,
                        "coverage_gaps": gaps,
                    })),
                )?;
                let success_cursor = LegislatorYearCursor {
                    from: Some(from),
                    to: Some(to),
                    processed,
                    fallback_rows,
                    coverage_gaps: gaps.len() as u64,
                    legislator_ids: selected,
                    ..LegislatorYearCursor::default()
                };
                self.set_state(JOB_EXPENSES, &success_cursor, JobStatus::Success)?;
                info!(processed, fallback_rows, gaps = gaps.len(), batch_id = %batch.id, "expenses ingested");
                Ok(json!({
                    "job": JOB_EXPENSES,
                    "status": "success",
                    "processed": processed,
                    "fallback_rows": fallback_rows,
                    "coverage_gaps": gaps,
                    "batch_id": batch.id,
                }))
            }
            Err(err) => self.fail_job(JOB_EXPENSES, &batch.id, err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_expenses(
        &self,
        batch_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        selected: &[i64],
        start_index: usize,
        start_year: i32,
        cursor: &mut LegislatorYearCursor,
    ) -> Result<(u64, u64, Vec<CoverageGap>)> {
        // seed the legislator universe from the current-members list,
        // archiving each seed page
        let mut legislators: Vec<i64> = Vec::new();
        for page in self.client.paginated(DEPUTADOS_ENDPOINT, list_params(), None) {
            let (status, body, page_params) = page?;
            let seed_key = format!("expenses_seed:{}", page_number(&page_params));
            self.archive.add_payload(
                batch_id,
                DEPUTADOS_ENDPOINT,
                &page_params,
                Some(&seed_key),
                status,
                &body,
            )?;
            legislators.extend(
                items_with(&body, |item| opt_i64(item, "id"))
                    .into_iter()
                    .map(|(id, _)| id),
            );
        }
        if !selected.is_empty() {
            legislators.retain(|id| selected.contains(id));
        }
        legislators.sort_unstable();
        legislators.dedup();

        let first_year = from_year(from);
        let last_year = from_year(to);
        let mut processed = 0_u64;
        let mut gaps: Vec<CoverageGap> = Vec::new();

        for (index, dep_id) in legislators.iter().enumerate() {
            if index < start_index {
                continue;
            }
            let year_from = if index == start_index { start_year } else { first_year };
            for year in year_from..=last_year {
                match self.expenses_pair(batch_id, *dep_id, year, &mut processed) {
                    Ok(()) => {
                        cursor.legislator_index = index;
                        cursor.year = Some(year);
                        cursor.processed = processed;
                        self.set_state(JOB_EXPENSES, cursor, JobStatus::Running)?;
                    }
                    Err(err) => {
                        let reason = format!("{err:#}");
                        warn!(legislator = dep_id, year, error = %reason, "expenses pair deferred");
                        gaps.push(CoverageGap {
                            window_start: None,
                            window_end: None,
                            legislator_id: Some(*dep_id),
                            year: Some(year),
                            reason,
                            fallback_rows: 0,
                            fallback_events: 0,
                            fallback_actions: 0,
                        });
                    }
                }
            }
        }

        let mut fallback_rows = 0_u64;
        if !gaps.is_empty() && self.datasets.expenses_url_template.is_some() {
            fallback_rows = self.expenses_dataset_fallback(batch_id, &legislators, &gaps)?;
            cursor.fallback_rows = fallback_rows;
        }
        Ok((processed, fallback_rows, gaps))
    }

    fn expenses_pair(
        &self,
        batch_id: &str,
        dep_id: i64,
        year: i32,
        processed: &mut u64,
    ) -> Result<()> {
        let endpoint = endpoints::despesas(dep_id);
        let mut params = list_params();
        params.insert("ano".to_owned(), year.to_string());
        for page in self.client.paginated(&endpoint, params, None) {
            let (status, body, page_params) = page?;
            let pk = format!("{dep_id}:{year}:{}", page_number(&page_params));
            self.archive
                .add_payload(batch_id, &endpoint, &page_params, Some(&pk), status, &body)?;
            for expense_row in body["dados"].as_array().into_iter().flatten() {
                let expense = normalize_expense(expense_row, dep_id);
                self.graph.upsert_expense(&expense)?;
                *processed += 1;
            }
        }
        Ok(())
    }

    // --- smoke ---------------------------------------------------------------

    /// Fast end-to-end health check: sample a few legislators, then run
    /// legislators + recent votes + recent expenses restricted to them.
    pub fn smoke(&self, sample_size: usize) -> Result<Value> {
        let today = Utc::now().date_naive();
        let from = today - Duration::days(30);

        let mut ids: Vec<i64> = Vec::new();
        for page in self.client.paginated(DEPUTADOS_ENDPOINT, list_params(), None) {
            let (status, body, _params) = page?;
            if status != 200 {
                bail!("could not list current members for smoke (status {status})");
            }
            ids.extend(
                items_with(&body, |item| opt_i64(item, "id"))
                    .into_iter()
                    .map(|(id, _)| id),
            );
        }
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            bail!("no current members available for smoke");
        }
        let mut rng = rand::thread_rng();
        let mut selected: Vec<i64> = ids
            .choose_multiple(&mut rng, sample_size.min(ids.len()))
            .copied()
            .collect();
        selected.sort_unstable();

        Ok(json!({
            "window": {"from": from.to_string(), "to": today.to_string()},
            "selected_legislators": selected,
            "legislators": self.ingest_legislators(None)?,
            "votes_recent": self.ingest_votes_since(from, Some(today), &selected, Some(3))?,
            "expenses_recent": self.ingest_expenses_since(from, Some(today), &selected)?,
        }))
    }
}

// --- shared helpers ----------------------------------------------------------

fn list_params() -> Params {
    let mut params = Params::new();
    params.insert("itens".to_owned(), DEFAULT_PAGE_SIZE.to_string());
    params
}

fn window_params(window_start: NaiveDate, window_end: NaiveDate) -> Params {
    let mut params = list_params();
    params.insert("dataInicio".to_owned(), window_start.to_string());
    params.insert("dataFim".to_owned(), window_end.to_string());
    params.insert("ordenarPor".to_owned(), "id".to_owned());
    params.insert("ordem".to_owned(), "ASC".to_owned());
    params
}

fn page_number(params: &Params) -> u32 {
    params
        .get("pagina")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(1)
}

/// Collection items that carry a usable key, paired with that key.
fn items_with<T>(body: &Value, key: impl Fn(&Value) -> Option<T>) -> Vec<(T, Value)> {
    body["dados"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|item| key(item).map(|k| (k, item.clone())))
        .collect()
}

/// Detail responses wrap the record in `dados`; fall back to the
/// collection item when the wrapper is missing.
fn detail_or<'a>(detail_body: &'a Value, item: &'a Value) -> &'a Value {
    match detail_body.get("dados") {
        Some(dados) if dados.is_object() => dados,
        _ => item,
    }
}

fn from_year(date: NaiveDate) -> i32 {
    use chrono::Datelike;
    date.year()
}

fn window_gap(
    window_start: NaiveDate,
    window_end: NaiveDate,
    reason: &str,
    fallback_rows: u64,
    fallback_events: u64,
    fallback_actions: u64,
) -> CoverageGap {
    CoverageGap {
        window_start: Some(window_start),
        window_end: Some(window_end),
        legislator_id: None,
        year: None,
        reason: reason.to_owned(),
        fallback_rows,
        fallback_events,
        fallback_actions,
    }
}

/// Non-200 nominal rolls are archived, not dropped: the body is annotated
/// with a typed error classification so expected absence stays
/// distinguishable from silent loss.
pub(crate) fn annotate_roll_error(body: &Value, status: u16) -> Value {
    let mut obj: Map<String, Value> = body.as_object().cloned().unwrap_or_default();
    let mut metadata = obj
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    metadata.insert(
        "error_type".to_owned(),
        Value::from(NominalRollError::classify(status).as_str()),
    );
    metadata.insert("status_code".to_owned(), Value::from(status));
    obj.insert("metadata".to_owned(), Value::Object(metadata));
    obj.entry("dados".to_owned()).or_insert_with(|| json!([]));
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_error_annotation_classifies_and_defaults_dados() {
        let annotated = annotate_roll_error(&Value::Null, 404);
        assert_eq!(annotated["metadata"]["error_type"], "nominal_votes_not_available");
        assert_eq!(annotated["metadata"]["status_code"], 404);
        assert_eq!(annotated["dados"], json!([]));

        let upstream = annotate_roll_error(&json!({"dados": [1]}), 503);
        assert_eq!(upstream["metadata"]["error_type"], "upstream_error");
        assert_eq!(upstream["dados"], json!([1]));

        let other = annotate_roll_error(&json!({}), 403);
        assert_eq!(other["metadata"]["error_type"], "nominal_votes_http_error");
    }

    #[test]
    fn items_with_pairs_keys_and_skips_keyless_rows() {
        let body = json!({"dados": [{"id": 1}, {"nome": "sem id"}, {"id": 2}]});
        let items = items_with(&body, |item| opt_i64(item, "id"));
        let keys: Vec<i64> = items.iter().map(|(id, _)| *id).collect();
        assert_eq!(keys, vec![1, 2]);
    }
}

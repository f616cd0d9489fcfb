//! Throttled, retrying HTTP client for the upstream open-data API, with
//! bounded ordered fan-out, lazy pagination and record/replay fixtures.

pub mod fixtures;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use legisarc_protocol::endpoints::DEFAULT_BASE_URL;
use legisarc_protocol::error::LegisError;
use legisarc_protocol::types::Params;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

pub use fixtures::{FixtureMode, FixtureStore};

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: String,
    pub max_rps: f64,
    pub timeout: Duration,
    pub max_retries: u32,
    pub max_concurrency: usize,
    pub user_agent: String,
    pub fixture_mode: FixtureMode,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            max_rps: 2.0,
            timeout: Duration::from_secs(30),
            max_retries: 4,
            max_concurrency: 4,
            user_agent: "legisarc/0.1".to_owned(),
            fixture_mode: FixtureMode::Off,
        }
    }
}

struct Inner {
    config: FetchConfig,
    client: reqwest::blocking::Client,
    // Timestamp of the most recent dispatched request. Held across the
    // throttle sleep so call timing is serialized client-wide.
    last_call: Mutex<Option<Instant>>,
    fixtures: FixtureStore,
}

#[derive(Clone)]
pub struct FetchClient {
    inner: Arc<Inner>,
}

impl FetchClient {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("build http client")?;
        let fixtures = FixtureStore::new(config.fixture_mode.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                last_call: Mutex::new(None),
                fixtures,
            }),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_owned()
        } else {
            format!("{}{}", self.inner.config.base_url.trim_end_matches('/'), endpoint)
        }
    }

    fn throttle(&self) {
        if self.inner.config.max_rps <= 0.0 {
            return;
        }
        let min_interval = Duration::from_secs_f64(1.0 / self.inner.config.max_rps);
        let mut last = recover(self.inner.last_call.lock());
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < min_interval {
                thread::sleep(min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    /// GET that retries transient failures (network errors, 5xx, 429, and
    /// unparseable bodies) with backoff, and returns every other status
    /// immediately with its decoded body for caller inspection.
    pub fn get(&self, endpoint: &str, params: &Params) -> Result<(u16, Value)> {
        let url = self.url(endpoint);
        if let Some(hit) = self.inner.fixtures.replay(&url, params)? {
            return Ok(hit);
        }
        let mut last_status = 0_u16;
        let mut last_error = String::new();
        for attempt in 0..=self.inner.config.max_retries {
            self.throttle();
            match self.inner.client.get(&url).query(params).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status >= 500 || status == 429 {
                        last_status = status;
                        warn!(url = %url, status, attempt, "retryable upstream status");
                    } else {
                        match resp.json::<Value>() {
                            Ok(body) => {
                                self.inner.fixtures.record(&url, params, status, &body)?;
                                return Ok((status, body));
                            }
                            Err(err) => {
                                last_status = status;
                                last_error = err.to_string();
                                warn!(url = %url, status, attempt, "undecodable body, retrying");
                            }
                        }
                    }
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(url = %url, attempt, error = %last_error, "network error, retrying");
                }
            }
            if attempt < self.inner.config.max_retries {
                thread::sleep(backoff_delay(attempt));
            }
        }
        if last_status > 0 {
            Err(LegisError::RetriesExhausted {
                url,
                status: last_status,
            }
            .into())
        } else {
            Err(LegisError::Transport {
                url,
                reason: last_error,
            }
            .into())
        }
    }

    /// GET that returns whatever status the upstream produced, body decoded
    /// best-effort (`null` if not JSON). Only network errors are retried.
    pub fn get_lenient(&self, endpoint: &str, params: &Params) -> Result<(u16, Value)> {
        let url = self.url(endpoint);
        if let Some(hit) = self.inner.fixtures.replay(&url, params)? {
            return Ok(hit);
        }
        let mut last_error = String::new();
        for attempt in 0..=self.inner.config.max_retries {
            self.throttle();
            match self.inner.client.get(&url).query(params).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.json::<Value>().unwrap_or(Value::Null);
                    self.inner.fixtures.record(&url, params, status, &body)?;
                    return Ok((status, body));
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(url = %url, attempt, error = %last_error, "network error, retrying");
                }
            }
            if attempt < self.inner.config.max_retries {
                thread::sleep(backoff_delay(attempt));
            }
        }
        Err(LegisError::Transport {
            url,
            reason: last_error,
        }
        .into())
    }

    /// Plain-text GET against an absolute URL (bulk dataset downloads).
    /// Returns any status immediately; retries network errors only.
    pub fn get_text(&self, url: &str) -> Result<(u16, String)> {
        let url = self.url(url);
        let empty = Params::new();
        if let Some((status, body)) = self.inner.fixtures.replay(&url, &empty)? {
            let text = body.as_str().unwrap_or_default().to_owned();
            return Ok((status, text));
        }
        let mut last_error = String::new();
        for attempt in 0..=self.inner.config.max_retries {
            self.throttle();
            match self.inner.client.get(&url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().unwrap_or_default();
                    self.inner
                        .fixtures
                        .record(&url, &empty, status, &Value::String(text.clone()))?;
                    return Ok((status, text));
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(url = %url, attempt, error = %last_error, "network error, retrying");
                }
            }
            if attempt < self.inner.config.max_retries {
                thread::sleep(backoff_delay(attempt));
            }
        }
        Err(LegisError::Transport {
            url,
            reason: last_error,
        }
        .into())
    }

    /// Bounded concurrent fan-out. Results preserve input order regardless
    /// of completion order. The whole batch carries an aggregate deadline;
    /// on expiry or on any request error, unstarted work is cancelled and
    /// the call fails with no partial result.
    pub fn fetch_many(&self, requests: Vec<(String, Params)>) -> Result<Vec<(u16, Value)>> {
        self.fetch_many_inner(requests, false)
    }

    /// Fan-out over `get_lenient`: non-200 statuses come back as results
    /// instead of failing the batch.
    pub fn fetch_many_lenient(&self, requests: Vec<(String, Params)>) -> Result<Vec<(u16, Value)>> {
        self.fetch_many_inner(requests, true)
    }

    fn fetch_many_inner(
        &self,
        requests: Vec<(String, Params)>,
        lenient: bool,
    ) -> Result<Vec<(u16, Value)>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let total = requests.len();
        let workers = self.inner.config.max_concurrency.clamp(1, total);

        let queue: Arc<Mutex<VecDeque<(usize, String, Params)>>> = Arc::new(Mutex::new(
            requests
                .into_iter()
                .enumerate()
                .map(|(idx, (endpoint, params))| (idx, endpoint, params))
                .collect(),
        ));
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<(usize, String, Result<(u16, Value)>)>();

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let client = self.clone();
            let queue = Arc::clone(&queue);
            let cancel = Arc::clone(&cancel);
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let job = recover(queue.lock()).pop_front();
                    let Some((idx, endpoint, params)) = job else {
                        break;
                    };
                    let result = if lenient {
                        client.get_lenient(&endpoint, &params)
                    } else {
                        client.get(&endpoint, &params)
                    };
                    if tx.send((idx, endpoint, result)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        // In-flight blocking requests cannot be aborted; the deadline
        // budgets one full request lifetime per queued wave.
        let per_wave = self.inner.config.timeout.max(Duration::from_secs(5)) * 2;
        let waves = total.div_ceil(workers) as u32;
        let deadline = Instant::now() + per_wave * waves;

        let mut results: Vec<Option<(u16, Value)>> = vec![None; total];
        let mut received = 0_usize;
        let mut failure: Option<anyhow::Error> = None;
        while received < total {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                failure = Some(LegisError::FanOutTimeout(per_wave.as_secs_f64() * f64::from(waves)).into());
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((idx, _endpoint, Ok(pair))) => {
                    results[idx] = Some(pair);
                    received += 1;
                }
                Ok((_idx, endpoint, Err(err))) => {
                    failure = Some(err.context(format!("fan-out request {endpoint}")));
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    failure =
                        Some(LegisError::FanOutTimeout(per_wave.as_secs_f64() * f64::from(waves)).into());
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    failure = Some(LegisError::Transport {
                        url: String::new(),
                        reason: "fan-out workers exited early".to_owned(),
                    }
                    .into());
                    break;
                }
            }
        }

        cancel.store(true, Ordering::Relaxed);
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(err) = failure {
            return Err(err);
        }
        results
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    LegisError::Transport {
                        url: String::new(),
                        reason: "fan-out result missing".to_owned(),
                    }
                    .into()
                })
            })
            .collect()
    }

    /// Lazy page iterator. Advances the `pagina` parameter while the
    /// response declares a `next` link, or until `max_pages`. A `pagina`
    /// value already present in `params` sets the starting page.
    pub fn paginated(&self, endpoint: &str, mut params: Params, max_pages: Option<u32>) -> Pages {
        let page = params
            .remove("pagina")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1);
        Pages {
            client: self.clone(),
            endpoint: endpoint.to_owned(),
            params,
            page,
            yielded: 0,
            max_pages,
            done: false,
        }
    }
}

pub struct Pages {
    client: FetchClient,
    endpoint: String,
    params: Params,
    page: u32,
    yielded: u32,
    max_pages: Option<u32>,
    done: bool,
}

impl Iterator for Pages {
    type Item = Result<(u16, Value, Params)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(max) = self.max_pages {
            if self.yielded >= max {
                self.done = true;
                return None;
            }
        }
        let mut params = self.params.clone();
        params.insert("pagina".to_owned(), self.page.to_string());
        match self.client.get(&self.endpoint, &params) {
            Ok((status, body)) => {
                self.yielded += 1;
                self.page += 1;
                self.done = !has_next_link(&body);
                debug!(endpoint = %self.endpoint, page = self.page - 1, status, "fetched page");
                Some(Ok((status, body, params)))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

pub fn has_next_link(body: &Value) -> bool {
    body["links"]
        .as_array()
        .map(|links| links.iter().any(|link| link["rel"] == "next"))
        .unwrap_or(false)
}

/// Total-page hint from the `last` link's `pagina` query parameter, when
/// the upstream provides one.
pub fn last_page_hint(body: &Value) -> Option<u32> {
    let links = body["links"].as_array()?;
    let href = links
        .iter()
        .find(|link| link["rel"] == "last")?
        .get("href")?
        .as_str()?;
    href.split(['?', '&'])
        .find_map(|segment| segment.strip_prefix("pagina="))
        .and_then(|raw| raw.parse().ok())
}

fn backoff_delay(attempt: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.3);
    let secs = (2_f64.powi(attempt.min(16) as i32) + jitter).min(8.0);
    Duration::from_secs_f64(secs)
}

fn recover<'a, T>(lock: Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    match lock {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

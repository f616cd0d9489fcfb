use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use legisarc_fetch_client::{FetchClient, FetchConfig, FixtureMode};
use legisarc_protocol::types::Params;
use serde_json::{json, Value};

/// Stub upstream. Pops scripted `(status, body)` responses in order; once
/// the script is exhausted it echoes the request path as
/// `{"dados": "<path>"}` with a little random latency.
struct StubServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    hits: Arc<Mutex<Vec<String>>>,
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
        let hits = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Mutex<VecDeque<(u16, String)>>> =
            Arc::new(Mutex::new(script.into_iter().collect()));

        let stop_flag = Arc::clone(&stop);
        let hits_log = Arc::clone(&hits);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let script = Arc::clone(&script);
                        let hits = Arc::clone(&hits_log);
                        thread::spawn(move || handle_conn(stream, &script, &hits));
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
            hits,
            handle: Some(handle),
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn hit_count(&self) -> usize {
        self.hits.lock().expect("hits lock").len()
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

fn handle_conn(
    mut stream: TcpStream,
    script: &Arc<Mutex<VecDeque<(u16, String)>>>,
    hits: &Arc<Mutex<Vec<String>>>,
) {
    let mut buf = [0_u8; 8192];
    let n = stream.read(&mut buf).unwrap_or(0);
    if n == 0 {
        return;
    }
    let req = String::from_utf8_lossy(&buf[..n]);
    let line = req.lines().next().unwrap_or_default().to_owned();
    hits.lock().expect("hits lock").push(line.clone());

    let scripted = script.lock().expect("script lock").pop_front();
    let (status, body) = match scripted {
        Some(pair) => pair,
        None => {
            let path = line.split(' ').nth(1).unwrap_or("/").to_owned();
            let jitter = u64::from(path.len() as u32 % 5) * 10;
            thread::sleep(Duration::from_millis(jitter));
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

fn fast_config(base_url: String) -> FetchConfig {
    FetchConfig {
        base_url,
        max_rps: 0.0,
        timeout: Duration::from_secs(5),
        max_retries: 4,
        max_concurrency: 4,
        ..FetchConfig::default()
    }
}

#[test]
fn get_retries_429_then_returns_success_body() {
    let server = StubServer::start(vec![
        (429, "{}".to_owned()),
        (429, "{}".to_owned()),
        (200, json!({"dados": [1, 2]}).to_string()),
    ]);
    let client = FetchClient::new(fast_config(server.base_url())).expect("client");

    let started = Instant::now();
    let (status, body) = client.get("/deputados", &Params::new()).expect("get ok");
    assert_eq!(status, 200);
    assert_eq!(body["dados"], json!([1, 2]));
    assert_eq!(server.hit_count(), 3);
    // two backoff sleeps of at least 1s and 2s
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[test]
fn get_returns_404_immediately_without_retry() {
    let server = StubServer::start(vec![(404, json!({"erro": "nao encontrado"}).to_string())]);
    let client = FetchClient::new(fast_config(server.base_url())).expect("client");

    let (status, body) = client
        .get("/votacoes/0/votos", &Params::new())
        .expect("get ok");
    assert_eq!(status, 404);
    assert_eq!(body["erro"], "nao encontrado");
    assert_eq!(server.hit_count(), 1);
}

#[test]
fn get_lenient_returns_500_without_retry() {
    let server = StubServer::start(vec![(500, "oops".to_owned())]);
    let client = FetchClient::new(fast_config(server.base_url())).expect("client");

    let (status, body) = client
        .get_lenient("/votacoes/1/votos", &Params::new())
        .expect("lenient get ok");
    assert_eq!(status, 500);
    assert_eq!(body, Value::Null);
    assert_eq!(server.hit_count(), 1);
}

#[test]
fn fetch_many_preserves_input_order() {
    let server = StubServer::start(Vec::new());
    let client = FetchClient::new(fast_config(server.base_url())).expect("client");

    let requests: Vec<(String, Params)> = (0..8)
        .map(|i| (format!("/deputados/{i}{}", "x".repeat(i)), Params::new()))
        .collect();
    let expected: Vec<String> = requests.iter().map(|(path, _)| path.clone()).collect();

    let results = client.fetch_many(requests).expect("fan-out ok");
    assert_eq!(results.len(), expected.len());
    for (result, path) in results.iter().zip(expected) {
        assert_eq!(result.0, 200);
        assert_eq!(result.1["dados"], json!(path));
    }
}

#[test]
fn throttle_spaces_sequential_calls() {
    let server = StubServer::start(Vec::new());
    let mut config = fast_config(server.base_url());
    config.max_rps = 20.0;
    let client = FetchClient::new(config).expect("client");

    let started = Instant::now();
    for i in 0..4 {
        let endpoint = format!("/deputados/{i}");
        client.get(&endpoint, &Params::new()).expect("get ok");
    }
    // 4 calls at 20 rps require at least 3 * 50ms of spacing
    assert!(started.elapsed() >= Duration::from_millis(140));
}

#[test]
fn paginated_follows_next_links() {
    let server = StubServer::start(vec![
        (
            200,
            json!({
                "dados": [{"id": 1}],
                "links": [{"rel": "next", "href": "p2"}]
            })
            .to_string(),
        ),
        (200, json!({"dados": [{"id": 2}], "links": []}).to_string()),
    ]);
    let client = FetchClient::new(fast_config(server.base_url())).expect("client");

    let pages: Vec<_> = client
        .paginated("/proposicoes", Params::new(), None)
        .collect::<Result<Vec<_>, _>>()
        .expect("pages ok");
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].2.get("pagina").map(String::as_str), Some("1"));
    assert_eq!(pages[1].2.get("pagina").map(String::as_str), Some("2"));
    assert_eq!(pages[1].1["dados"][0]["id"], 2);
}

#[test]
fn paginated_respects_max_pages() {
    let server = StubServer::start(Vec::new());
    let client = FetchClient::new(fast_config(server.base_url())).expect("client");

    // echo responses never declare a next link, but a scripted next-link
    // loop would also stop at the bound
    let pages: Vec<_> = client
        .paginated("/votacoes", Params::new(), Some(1))
        .collect::<Result<Vec<_>, _>>()
        .expect("pages ok");
    assert_eq!(pages.len(), 1);
}

#[test]
fn fixture_replay_miss_is_a_hard_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = fast_config("http://127.0.0.1:9".to_owned());
    config.fixture_mode = FixtureMode::Replay(dir.path().to_path_buf());
    let client = FetchClient::new(config).expect("client");

    let err = client
        .get("/deputados", &Params::new())
        .expect_err("replay miss should fail");
    assert!(err.to_string().contains("fixture replay miss"));
}

#[test]
fn fixtures_record_then_replay_without_network() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = StubServer::start(vec![(200, json!({"dados": [{"id": 7}]}).to_string())]);
    let base_url = server.base_url();

    let mut config = fast_config(base_url.clone());
    config.fixture_mode = FixtureMode::Record(dir.path().to_path_buf());
    let recorder = FetchClient::new(config).expect("client");
    let (status, body) = recorder.get("/deputados/7", &Params::new()).expect("record get");
    assert_eq!(status, 200);
    drop(server);

    let mut config = fast_config(base_url);
    config.fixture_mode = FixtureMode::Replay(dir.path().to_path_buf());
    let replayer = FetchClient::new(config).expect("client");
    let (replay_status, replay_body) = replayer
        .get("/deputados/7", &Params::new())
        .expect("replay get");
    assert_eq!(replay_status, 200);
    assert_eq!(replay_body, body);
}

//! In-process fake LRS for integration tests.
//!
//! `MockLrsServer` serves the xAPI statements resource over HTTP from a
//! [`MemoryAdapter`], so `LrsAdapter` and the forwarder can be exercised
//! against a real socket.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    io::Read,
    sync::{
        Arc,
        atomic::{AtomicU16, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use lrs_store::{BackendAdapter, Cursor, MemoryAdapter, Statement, StatementQuery, StoreError};
use lrs_store_http::{Credentials, LrsAdapter, LrsAdapterConfig, RetryConfig};
use parking_lot::Mutex;
use reqwest::Url;
use tiny_http::{Header, Method, Request, Response, Server};

pub const STATEMENTS_PATH: &str = "/xAPI/statements";
pub const HEARTBEAT_PATH: &str = "/__heartbeat__";

/// A request as seen by the mock.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub url: String,
    pub authorization: Option<String>,
    pub xapi_version: Option<String>,
}

struct Shared {
    adapter: MemoryAdapter,
    heartbeat_status: AtomicU16,
    failing_gets: AtomicUsize,
    requests: Mutex<Vec<Recorded>>,
}

/// A fake LRS listening on a random local port.
///
/// Stops serving when dropped.
pub struct MockLrsServer {
    server: Arc<Server>,
    shared: Arc<Shared>,
    base_url: String,
    worker: Option<thread::JoinHandle<()>>,
}

impl MockLrsServer {
    pub fn start() -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind mock LRS"));
        let addr = server.server_addr().to_ip().expect("ip listener");
        let shared = Arc::new(Shared {
            adapter: MemoryAdapter::new(),
            heartbeat_status: AtomicU16::new(200),
            failing_gets: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let worker = {
            let server = Arc::clone(&server);
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .expect("mock LRS runtime");
                while let Ok(request) = server.recv() {
                    runtime.block_on(handle(&shared, request));
                }
            })
        };

        Self { server, shared, base_url: format!("http://{addr}"), worker: Some(worker) }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn statements_url(&self) -> String {
        format!("{}{STATEMENTS_PATH}", self.base_url)
    }

    /// Statements stored by the mock.
    pub fn adapter(&self) -> &MemoryAdapter {
        &self.shared.adapter
    }

    pub fn set_heartbeat_status(&self, status: u16) {
        self.shared.heartbeat_status.store(status, Ordering::SeqCst);
    }

    /// Answers the next `n` statement `GET`s with `503`.
    pub fn fail_next_gets(&self, n: usize) {
        self.shared.failing_gets.store(n, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.shared.requests.lock().clone()
    }

    /// An adapter for this server with fast retries.
    pub fn lrs_adapter(&self, credentials: Option<Credentials>) -> LrsAdapter {
        let config = LrsAdapterConfig::builder()
            .base_url(self.base_url())
            .maybe_credentials(credentials)
            .timeout(Duration::from_secs(5))
            .retry(fast_retry(3))
            .build()
            .expect("valid adapter config");
        LrsAdapter::new(config).expect("adapter")
    }
}

impl Drop for MockLrsServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_retries(max_retries)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(10))
        .build()
        .expect("valid retry config")
}

fn header(request: &Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str().to_owned())
}

fn json_response(status: u16, body: String) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string(body)
        .with_status_code(status)
        .with_header(Header::from_bytes("Content-Type", "application/json").expect("header"))
}

fn error_status(err: &StoreError) -> u16 {
    match err {
        StoreError::Conflict { .. } | StoreError::DuplicateInBatch { .. } => 409,
        StoreError::Validation { .. } | StoreError::Parameter(_) => 400,
        _ => 500,
    }
}

async fn handle(shared: &Shared, mut request: Request) {
    shared.requests.lock().push(Recorded {
        method: request.method().to_string(),
        url: request.url().to_owned(),
        authorization: header(&request, "Authorization"),
        xapi_version: header(&request, "X-Experience-API-Version"),
    });

    let method = request.method().clone();
    let url = Url::parse(&format!("http://mock{}", request.url())).expect("request url");
    let response = match (method, url.path()) {
        (Method::Get, HEARTBEAT_PATH) => {
            let status = shared.heartbeat_status.load(Ordering::SeqCst);
            json_response(status, "{}".into())
        },
        (Method::Get, STATEMENTS_PATH) => {
            let failing = shared.failing_gets.load(Ordering::SeqCst);
            if failing > 0 {
                shared.failing_gets.store(failing - 1, Ordering::SeqCst);
                json_response(503, r#"{"error": "unavailable"}"#.into())
            } else {
                get_statements(shared, &url).await
            }
        },
        (Method::Post, STATEMENTS_PATH) => {
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).expect("request body");
            post_statements(shared, &body).await
        },
        _ => json_response(404, "{}".into()),
    };
    let _ = request.respond(response);
}

async fn get_statements(shared: &Shared, url: &Url) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut cursor = None;
    let mut params = Vec::new();
    for (name, value) in url.query_pairs() {
        if name == "cursor" {
            cursor = Some(Cursor::new(value.into_owned()));
        } else {
            params.push((name.into_owned(), value.into_owned()));
        }
    }
    let query = match StatementQuery::from_xapi_params(params.iter().cloned()) {
        Ok(query) => query,
        Err(err) => return json_response(400, format!(r#"{{"error": "{err}"}}"#)),
    };
    let single = query.statement_id.is_some() || query.voided_statement_id.is_some();
    let limit = query.limit.filter(|l| *l > 0).unwrap_or(100);

    let page = match shared.adapter.fetch_page(&query, cursor.as_ref(), limit).await {
        Ok(page) => page,
        Err(err) => return json_response(error_status(&err), "{}".into()),
    };

    if single {
        return match page.statements.into_iter().next() {
            Some(statement) => json_response(200, serde_json::to_string(&statement).unwrap()),
            None => json_response(404, "{}".into()),
        };
    }

    let more = page.more.map(|next| {
        let mut link = Url::parse(&format!("http://mock{STATEMENTS_PATH}")).unwrap();
        link.query_pairs_mut().extend_pairs(params.iter()).append_pair("cursor", next.as_str());
        match link.query() {
            Some(query) => format!("{STATEMENTS_PATH}?{query}"),
            None => STATEMENTS_PATH.to_owned(),
        }
    });
    let body = serde_json::json!({
        "statements": page.statements,
        "more": more.unwrap_or_default(),
    });
    json_response(200, body.to_string())
}

async fn post_statements(shared: &Shared, body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let statements: Vec<Statement> = match serde_json::from_str(body) {
        Ok(statements) => statements,
        Err(err) => return json_response(400, format!(r#"{{"error": "{err}"}}"#)),
    };
    let ids: Vec<String> =
        statements.iter().filter_map(|s| s.id).map(|id| id.to_string()).collect();
    match shared.adapter.insert_page(statements).await {
        Ok(_) => json_response(200, serde_json::to_string(&ids).unwrap()),
        Err(err) => json_response(error_status(&err), "{}".into()),
    }
}

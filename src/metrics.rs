//! Prometheus metrics for the directory (RED: Rate, Errors, Duration) and the HTTP endpoint serving them.

use crate::directory::Directory;
use crate::error::ResultCode;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Upper bounds of the duration buckets, in seconds. +Inf is reported from the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Operations always present in the output, even before the first request.
const OPERATIONS: [&str; 10] = [
    "bind", "unbind", "add", "delete", "modify", "modifydn", "compare", "search", "abandon",
    "extended",
];

#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        // Only the first matching bucket is incremented; render() accumulates.
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Counters shared by every listener (thread-safe, lock-free on the hot path).
#[derive(Debug, Default)]
pub struct Metrics {
    /// Client connections accepted.
    connections_total: AtomicU64,
    /// Connections refused because `max_connections` was reached.
    connections_rejected: AtomicU64,
    connections_active: AtomicI64,
    /// Undecodable LDAP messages.
    parse_errors: AtomicU64,
    requests: DashMap<&'static str, AtomicU64>,
    /// (operation, result code name) -> count
    results: DashMap<(&'static str, &'static str), AtomicU64>,
    durations: DashMap<&'static str, DurationHistogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request that produced no result (abandon, unbind).
    pub fn inc_request(&self, op: &'static str) {
        self.requests
            .entry(op)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completed operation with its result code and duration.
    pub fn observe(&self, op: &'static str, code: ResultCode, duration: Duration) {
        self.inc_request(op);
        self.results
            .entry((op, code.name()))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        self.durations.entry(op).or_default().observe(duration);
    }

    pub fn active_connections(&self) -> i64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Render in the Prometheus text exposition format.
    pub fn render(&self, entries: usize) -> String {
        let mut out = String::new();
        out.push_str("# HELP ldap_directory_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_directory_connections_total counter\n");
        out.push_str(&format!(
            "ldap_directory_connections_total {}\n",
            self.connections_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_directory_connections_rejected_total Connections closed at accept because the connection limit was reached.\n");
        out.push_str("# TYPE ldap_directory_connections_rejected_total counter\n");
        out.push_str(&format!(
            "ldap_directory_connections_rejected_total {}\n",
            self.connections_rejected.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_directory_connections_active Client connections currently open.\n");
        out.push_str("# TYPE ldap_directory_connections_active gauge\n");
        out.push_str(&format!(
            "ldap_directory_connections_active {}\n",
            self.active_connections()
        ));

        out.push_str("# HELP ldap_directory_parse_errors_total Total number of LDAP message parse errors (invalid BER / wrong tag).\n");
        out.push_str("# TYPE ldap_directory_parse_errors_total counter\n");
        out.push_str(&format!(
            "ldap_directory_parse_errors_total {}\n",
            self.parse_errors.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_directory_entries Entries currently held in the directory.\n");
        out.push_str("# TYPE ldap_directory_entries gauge\n");
        out.push_str(&format!("ldap_directory_entries {}\n", entries));

        out.push_str("# HELP ldap_directory_requests_total Total LDAP requests by operation.\n");
        out.push_str("# TYPE ldap_directory_requests_total counter\n");
        for op in OPERATIONS {
            let val = self
                .requests
                .get(op)
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0);
            out.push_str(&format!("ldap_directory_requests_total{{op=\"{}\"}} {}\n", op, val));
        }

        out.push_str("# HELP ldap_directory_results_total Operation results by LDAP result code.\n");
        out.push_str("# TYPE ldap_directory_results_total counter\n");
        let mut results: Vec<_> = self
            .results
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        results.sort();
        for ((op, code), count) in results {
            out.push_str(&format!(
                "ldap_directory_results_total{{op=\"{}\",code=\"{}\"}} {}\n",
                op, code, count
            ));
        }

        out.push_str("# HELP ldap_directory_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_directory_request_duration_seconds histogram\n");
        let mut ops: Vec<&'static str> = self.durations.iter().map(|e| *e.key()).collect();
        ops.sort();
        for op in ops {
            let Some(hist) = self.durations.get(op) else {
                continue;
            };
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_directory_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_directory_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_directory_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_directory_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

/// GET /ready body.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    entries: usize,
    connections: i64,
}

/// Path from the HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Status, body and content type for one metrics endpoint request.
async fn respond(path: &str, metrics: &Metrics, directory: &Directory) -> (&'static str, String, &'static str) {
    match path {
        "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
        "/ready" => {
            // A closed directory fails entry_count with `unavailable`.
            let entries = directory.store().entry_count().await;
            let ready = entries.is_ok() && !directory.is_closed();
            let body = serde_json::to_string(&ReadyBody {
                ready,
                entries: entries.unwrap_or(0),
                connections: metrics.active_connections(),
            })
            .unwrap_or_else(|_| r#"{"ready":false,"error":"serialize"}"#.to_string());
            let status = if ready { "200 OK" } else { "503 Service Unavailable" };
            (status, body, "application/json")
        }
        "/metrics" => {
            let entries = directory.store().entry_count().await.unwrap_or(0);
            ("200 OK", metrics.render(entries), "text/plain; charset=utf-8")
        }
        _ => (
            "404 Not Found",
            "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
            "text/plain; charset=utf-8",
        ),
    }
}

/// HTTP server for GET /metrics, GET /health and GET /ready.
/// - /health (liveness): 200 while the process runs.
/// - /ready (readiness): 200 while the directory is open, 503 after close.
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>, directory: Directory) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let directory = directory.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if total >= 4 && buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");
            let (status, body, content_type) = respond(path, &metrics, &directory).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

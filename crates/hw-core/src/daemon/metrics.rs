//! Prometheus metrics endpoint for the hostwatch daemon.
//!
//! Serves `/metrics` in Prometheus exposition format and `/health` for
//! supervisors, from a lightweight HTTP server on a background thread.
//!
//! ## Metrics
//!
//! **Gauges:**
//! - `hw_queue_depth`: batches waiting in the local queue
//! - `hw_queue_bytes`: bytes held by the local queue
//! - `hw_queue_oldest_age_seconds`: age of the oldest queued batch
//! - `hw_queue_stuck_batches`: queued batches above the retry threshold
//! - `hw_daemon_uptime_seconds`
//!
//! **Counters:**
//! - `hw_batches_total{outcome}`: write outcomes (persisted/enqueued/failed)
//! - `hw_replayed_total`: batches delivered by replay
//! - `hw_evictions_total{reason}`: batches dropped as data loss
//! - `hw_replay_cycles_total{result}`: replay cycles by how they ended

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hw_common::config::MetricsConfig;
use hw_telemetry::{EvictionEvent, QueueStats, ReplayReport, WriteOutcome};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Prometheus metrics for the daemon. Cheap to clone; clones share values.
#[derive(Clone)]
pub struct HostwatchMetrics {
    pub registry: Registry,

    pub queue_depth: IntGauge,
    pub queue_bytes: IntGauge,
    pub queue_oldest_age_seconds: IntGauge,
    pub queue_stuck_batches: IntGauge,
    pub daemon_uptime_seconds: IntGauge,

    pub batches_total: IntCounterVec,
    pub replayed_total: IntCounter,
    pub evictions_total: IntCounterVec,
    pub replay_cycles_total: IntCounterVec,

    healthy: Arc<AtomicBool>,
    started_at: Instant,
}

impl HostwatchMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queue_depth = IntGauge::new("hw_queue_depth", "Batches waiting in the local queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let queue_bytes = IntGauge::new("hw_queue_bytes", "Bytes held by the local queue")?;
        registry.register(Box::new(queue_bytes.clone()))?;

        let queue_oldest_age_seconds = IntGauge::new(
            "hw_queue_oldest_age_seconds",
            "Age of the oldest queued batch in seconds",
        )?;
        registry.register(Box::new(queue_oldest_age_seconds.clone()))?;

        let queue_stuck_batches = IntGauge::new(
            "hw_queue_stuck_batches",
            "Queued batches whose retry count exceeds the stuck threshold",
        )?;
        registry.register(Box::new(queue_stuck_batches.clone()))?;

        let daemon_uptime_seconds =
            IntGauge::new("hw_daemon_uptime_seconds", "Daemon uptime in seconds")?;
        registry.register(Box::new(daemon_uptime_seconds.clone()))?;

        let batches_total = IntCounterVec::new(
            Opts::new("hw_batches_total", "Sampled batches by write outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(batches_total.clone()))?;

        let replayed_total =
            IntCounter::new("hw_replayed_total", "Queued batches delivered by replay")?;
        registry.register(Box::new(replayed_total.clone()))?;

        let evictions_total = IntCounterVec::new(
            Opts::new("hw_evictions_total", "Batches dropped from the local queue"),
            &["reason"],
        )?;
        registry.register(Box::new(evictions_total.clone()))?;

        let replay_cycles_total = IntCounterVec::new(
            Opts::new("hw_replay_cycles_total", "Replay cycles by result"),
            &["result"],
        )?;
        registry.register(Box::new(replay_cycles_total.clone()))?;

        let build_info = IntGauge::with_opts(
            Opts::new("hw_build_info", "Build information")
                .const_label("version", env!("CARGO_PKG_VERSION")),
        )?;
        build_info.set(1);
        registry.register(Box::new(build_info))?;

        Ok(Self {
            registry,
            queue_depth,
            queue_bytes,
            queue_oldest_age_seconds,
            queue_stuck_batches,
            daemon_uptime_seconds,
            batches_total,
            replayed_total,
            evictions_total,
            replay_cycles_total,
            healthy: Arc::new(AtomicBool::new(true)),
            started_at: Instant::now(),
        })
    }

    pub fn update_queue(&self, stats: &QueueStats) {
        self.queue_depth.set(stats.depth as i64);
        self.queue_bytes.set(stats.total_bytes as i64);
        self.queue_oldest_age_seconds
            .set(stats.oldest_age_secs.unwrap_or(0) as i64);
        self.queue_stuck_batches.set(stats.stuck_batches as i64);
    }

    pub fn record_write(&self, outcome: &WriteOutcome) {
        self.batches_total
            .with_label_values(&[outcome.label()])
            .inc();
        if let WriteOutcome::Enqueued { evicted, .. } = outcome {
            self.record_evictions(evicted);
        }
    }

    pub fn record_replay(&self, report: &ReplayReport) {
        let result = if report.cancelled {
            "cancelled"
        } else if report.storage_fault.is_some() {
            "storage_fault"
        } else if report.stopped_on_connectivity {
            "primary_unavailable"
        } else {
            "completed"
        };
        self.replay_cycles_total.with_label_values(&[result]).inc();
        self.replayed_total.inc_by(report.replayed.len() as u64);
        self.record_evictions(&report.evicted);
    }

    fn record_evictions(&self, events: &[EvictionEvent]) {
        for event in events {
            self.evictions_total
                .with_label_values(&[event.reason.label()])
                .inc();
        }
    }

    /// Value reported by `/health`.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        self.daemon_uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Errors starting the metrics endpoint.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("invalid metrics bind address {addr}: {source}")]
    Address {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("cannot listen on {addr}: {reason}")]
    Listen { addr: SocketAddr, reason: String },

    #[error("failed to spawn metrics thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("failed to register metrics: {0}")]
    Registry(#[from] prometheus::Error),
}

/// A response body with its status, before it is bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub exposition: bool,
}

impl Reply {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Reply {
            status,
            body: body.into(),
            exposition: false,
        }
    }
}

/// Answer one request path.
pub fn route(path: &str, metrics: &HostwatchMetrics) -> Reply {
    // Scrapers sometimes append a query string
    let path = path.split('?').next().unwrap_or(path);
    match path.trim_end_matches('/') {
        "/metrics" => match metrics.render() {
            Ok(body) => Reply {
                status: 200,
                body,
                exposition: true,
            },
            Err(e) => {
                error!(error = %e, "failed to render metrics");
                Reply::text(500, format!("error: {}", e))
            }
        },
        "/health" | "/healthz" if metrics.is_healthy() => Reply::text(200, "ok"),
        "/health" | "/healthz" => Reply::text(503, "degraded"),
        _ => Reply::text(404, "not found"),
    }
}

/// Running metrics endpoint. Stops when dropped.
pub struct MetricsServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl MetricsServer {
    pub fn start(config: &MetricsConfig, metrics: HostwatchMetrics) -> Result<Self, MetricsError> {
        let raw = format!("{}:{}", config.bind, config.port);
        let addr: SocketAddr = raw
            .parse()
            .map_err(|source| MetricsError::Address { addr: raw, source })?;
        let server = tiny_http::Server::http(addr).map_err(|e| MetricsError::Listen {
            addr,
            reason: e.to_string(),
        })?;
        // Port 0 binds an ephemeral port
        let addr = server.server_addr().to_ip().unwrap_or(addr);

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("hw-metrics".to_string())
                .spawn(move || serve(&server, &metrics, &stop))?
        };
        info!(addr = %addr, "metrics endpoint listening");

        Ok(MetricsServer {
            addr,
            stop,
            worker: Some(worker),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            info!("metrics endpoint stopped");
        }
    }
}

fn serve(server: &tiny_http::Server, metrics: &HostwatchMetrics, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        let request = match server.recv_timeout(Duration::from_millis(250)) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "metrics endpoint accept failed; endpoint disabled");
                return;
            }
        };

        debug!(method = %request.method(), url = %request.url(), "metrics request");
        let reply = route(request.url(), metrics);
        let mut response =
            tiny_http::Response::from_string(reply.body).with_status_code(reply.status);
        if reply.exposition {
            if let Ok(header) = tiny_http::Header::from_bytes(
                &b"Content-Type"[..],
                &b"text/plain; version=0.0.4; charset=utf-8"[..],
            ) {
                response = response.with_header(header);
            }
        }
        if let Err(e) = request.respond(response) {
            warn!(error = %e, "failed to answer metrics request");
        }
    }
}

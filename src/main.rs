//! ringcache
//!
//! Runs a standalone distributed cache over in-memory nodes, with health and
//! Prometheus endpoints. Useful for trying configurations and for chaos drills.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           ringcache                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Eviction    │    │   Health     │    │   Backup     │       │
//! │  │  Scheduler   │    │   Monitor    │    │   Scheduler  │       │
//! │  └──────┬───────┘    └──────┬───────┘    └──────┬───────┘       │
//! │         └───────────────────┼───────────────────┘               │
//! │                      DistributedCache                            │
//! │                             │                                    │
//! │        /healthz /readyz ◀───┴───▶ /metrics    EventBus ▶ logs    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ringcache::adapters::{EventLogger, PrometheusExporter};
use ringcache::cache::SubscriptionFilter;
use ringcache::domain::Severity;
use ringcache::{DistributedCache, EngineConfig, NodeConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// ringcache - replicated, consistent-hashed cache engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "RINGCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Nodes as `id=address` (or just `id`), replacing those in the config file
    #[arg(long, env = "RINGCACHE_NODES", value_delimiter = ',')]
    nodes: Vec<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Also log informational events (gets, sets, deletes)
    #[arg(long, env = "LOG_ALL_EVENTS")]
    log_all_events: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = load_config(&args)?;
    info!("Starting ringcache {}", ringcache::version());
    info!("  Nodes: {}", config.nodes.len());
    info!("  Replication factor: {}", config.ring.replication_factor);
    info!("  Write quorum: {}", config.write_quorum());
    info!("  Read quorum: {}", config.replication.read_quorum);

    let cache = Arc::new(DistributedCache::in_memory(config).context("building cache")?);
    let exporter = Arc::new(PrometheusExporter::new().context("registering metrics")?);
    let shutdown = CancellationToken::new();

    // Mirror bus events into the log
    let (logger, filter) = if args.log_all_events {
        (EventLogger::info_level(), SubscriptionFilter::all())
    } else {
        (
            EventLogger::new(),
            SubscriptionFilter::all().min_severity(Severity::Operational),
        )
    };
    let logger_handle = logger.spawn(cache.subscribe("event-logger", filter), shutdown.child_token());

    let tasks = cache.start_background();
    info!("Started {} background tasks", tasks.len());

    let endpoints = Arc::new(Endpoints {
        cache: cache.clone(),
        exporter,
    });
    let health_server = tokio::spawn(serve(
        args.health_addr.clone(),
        Surface::Health,
        endpoints.clone(),
        shutdown.child_token(),
    ));
    let metrics_server = tokio::spawn(serve(
        args.metrics_addr.clone(),
        Surface::Metrics,
        endpoints,
        shutdown.child_token(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    tasks.shutdown().await;
    shutdown.cancel();
    cache.events().close();

    for (name, server) in [("health", health_server), ("metrics", metrics_server)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server error: {:#}", name, e),
            Err(e) => error!("{} server task failed: {}", name, e),
        }
    }
    match logger_handle.await {
        Ok(logged) => info!("Event logger stopped after {} events", logged),
        Err(e) => error!("Event logger task failed: {}", e),
    }

    info!("ringcache shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if !args.nodes.is_empty() {
        config.nodes = args
            .nodes
            .iter()
            .map(|node| parse_node(node))
            .collect::<anyhow::Result<_>>()?;
        config.validate().context("validating node list")?;
    }
    if config.nodes.is_empty() {
        bail!("no nodes configured; pass --nodes or list them in the config file");
    }
    Ok(config)
}

/// `id=address` or a bare `id`, which gets an in-process address
fn parse_node(raw: &str) -> anyhow::Result<NodeConfig> {
    let raw = raw.trim();
    let (id, address) = match raw.split_once('=') {
        Some((id, address)) => (id.trim(), address.trim().to_string()),
        None => (raw, format!("mem://{}", raw)),
    };
    if id.is_empty() || address.is_empty() {
        bail!("invalid node {:?}, expected id=address", raw);
    }
    Ok(NodeConfig::new(id, address))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health and Metrics Servers
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Surface {
    Health,
    Metrics,
}

struct Endpoints {
    cache: Arc<DistributedCache>,
    exporter: Arc<PrometheusExporter>,
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

impl Endpoints {
    fn route(&self, surface: Surface, path: &str) -> Response<Full<Bytes>> {
        match (surface, path) {
            (Surface::Health, "/healthz") | (Surface::Health, "/livez") => {
                respond(StatusCode::OK, "text/plain", "ok")
            }
            (Surface::Health, "/readyz") => {
                let health = self.cache.health();
                let status = if health.status.is_operational() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                match serde_json::to_vec(&health) {
                    Ok(body) => respond(status, "application/json", body),
                    Err(e) => respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                }
            }
            (Surface::Metrics, "/metrics") => {
                self.exporter.update(&self.cache.stats());
                match self.exporter.encode() {
                    Ok((content_type, body)) => respond(StatusCode::OK, &content_type, body),
                    Err(e) => respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        }
    }
}

async fn serve(
    addr: String,
    surface: Surface,
    endpoints: Arc<Endpoints>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {:?} server address {}", surface, addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {:?} server to {}", surface, addr))?;

    info!("{:?} server listening on {}", surface, addr);

    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{:?} server shutting down", surface);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("{:?} server accept error: {}", surface, e);
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let endpoints = endpoints.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = endpoints.route(surface, req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{:?} server connection error: {}", surface, e);
            }
        });
    }
}

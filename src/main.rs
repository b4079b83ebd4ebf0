use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::io;
use std::sync::Arc;
use std::{env, fs};
use tokio::net::TcpListener;
use tollgate::app_state::AppState;
use tollgate::auth::TokenAuthenticator;
use tollgate::billing::ledger::Ledger;
use tollgate::billing::payer::PayerResolver;
use tollgate::billing::settlement::SettlementWorker;
use tollgate::config::{Settings, StorageBackend};
use tollgate::handlers::executions::handle_execution_intake;
use tollgate::handlers::forward::handle_relay;
use tollgate::handlers::response::{empty_body, json_response};
use tollgate::registry::RouteRegistry;
use tollgate::storage::memory::MemoryStorage;
use tollgate::storage::postgres::PgStorage;
use tollgate::storage::Storage;
use tollgate::telemetry::init_logging;
use tollgate::upstream::Forwarder;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration loading
// ---------------------------------------------------------------------------

/// Load and parse the YAML configuration file.
///
/// The path is read from `TOLLGATE_CONFIG` (env) or falls back to
/// `./tollgate.yaml`. A missing file is not an error: the service starts
/// with defaults and the in-memory storage backend.
fn load_config() -> Result<Settings, Box<dyn std::error::Error + Send + Sync>> {
    let path = env::var("TOLLGATE_CONFIG").unwrap_or_else(|_| "./tollgate.yaml".to_string());

    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path, "no configuration file found, starting with defaults");
            return Ok(Settings::default());
        }
        Err(e) => return Err(format!("failed to read {path}: {e}").into()),
    };

    let settings: Settings =
        serde_yaml::from_str(&contents).map_err(|e| format!("failed to parse {path}: {e}"))?;

    info!(path = %path, "configuration loaded");
    Ok(settings)
}

// ---------------------------------------------------------------------------
// Application state initialization
// ---------------------------------------------------------------------------

/// Build the shared [`AppState`] from parsed [`Settings`].
async fn init_app_state(
    settings: &Settings,
) -> Result<AppState, Box<dyn std::error::Error + Send + Sync>> {
    let storage = init_storage(settings).await?;

    let registry = RouteRegistry::new(Arc::clone(&storage), settings.cache.route_ttl());
    let authenticator = TokenAuthenticator::new(Arc::clone(&storage), settings.cache.auth_ttl());
    let ledger = Arc::new(Ledger::new(
        Arc::clone(&storage),
        settings.billing.default_total_quota,
    ));
    let payer = PayerResolver::new(Arc::clone(&storage), settings.cache.payer_ttl());

    let forwarder =
        Forwarder::new().map_err(|e| format!("failed to build upstream client: {e}"))?;

    let settlement_tx = SettlementWorker::new(
        Arc::clone(&ledger),
        payer,
        settings.billing.base_currency.clone(),
        settings.billing.exchange_rate,
        settings.settlement.retry_policy(),
    )
    .start(settings.settlement.queue_capacity);

    Ok(AppState {
        registry,
        authenticator,
        ledger,
        forwarder,
        settlement_tx,
    })
}

/// Initialize the storage backend named in the configuration.
async fn init_storage(
    settings: &Settings,
) -> Result<Arc<dyn Storage>, Box<dyn std::error::Error + Send + Sync>> {
    let storage: Arc<dyn Storage> = match settings.storage.backend {
        StorageBackend::Memory => {
            info!(backend = "memory", "initialized storage");
            Arc::new(MemoryStorage::new())
        }
        StorageBackend::Postgres => {
            let connection_string = match env::var("DATABASE_URL") {
                Ok(url) => url,
                Err(_) => settings
                    .storage
                    .connection_string
                    .clone()
                    .ok_or("connection_string is required for the postgres storage backend")?,
            };

            debug!(connection_string = %connection_string, "postgres connection");
            info!(backend = "postgres", "initializing storage");

            Arc::new(
                PgStorage::connect(&connection_string)
                    .await
                    .map_err(|e| format!("failed to initialize postgres storage: {e}"))?,
            )
        }
    };

    Ok(storage)
}

// ---------------------------------------------------------------------------
// Request routing
// ---------------------------------------------------------------------------

/// Route an incoming HTTP request to the appropriate handler.
///
/// Everything that is not a service endpoint is treated as a relay request;
/// the first path segment selects the forwarding route.
async fn route(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();

    match (req.method(), path.as_str()) {
        (&Method::GET, "/healthz") => Ok(json_response(StatusCode::OK, &json!({"status": "ok"}))),
        (&Method::POST, "/internal/executions") => handle_execution_intake(req, state).await,
        (_, "/") => {
            debug!(method = %req.method(), "no forwarding prefix in path");
            let mut not_found = Response::new(empty_body());
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
        _ => handle_relay(req, state).await,
    }
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Accept connections and spawn a task per connection.
///
/// Listens for `SIGINT` / `ctrl-c` and shuts down gracefully, allowing
/// in-flight connections to finish.
async fn run_server(
    state: Arc<AppState>,
    configured_bind: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bind_address = env::var("TOLLGATE_BIND_ADDRESS").unwrap_or_else(|_| configured_bind);
    let listener = TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "server listening");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _) = result?;
                let peer_addr = stream.peer_addr()?;
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::task::spawn(async move {
                    debug!(peer = ?peer_addr, "accepted connection");

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { route(req, state).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        warn!(error = ?err, "error serving connection");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("received shutdown signal, stopping server");
                break;
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();
    let settings = load_config()?;
    let state = Arc::new(init_app_state(&settings).await?);
    run_server(state, settings.bind_address).await
}

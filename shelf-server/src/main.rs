use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::{routing::get, Json, Router};
use clap::Parser;
use futures::stream::{self, Stream};
use shelf_core::events::EventBus;
use shelf_core::operations::OperationManager;
use shelf_core::scan::ScanConfig;
use shelf_core::settings::Settings;
use shelf_core::store::secrets::SecretKey;
use shelf_core::store::Store;
use tracing::{error, info, warn};

/// shelf-server -- thin process harness around the shelf-core library.
///
/// Wires the Store, Settings, OperationManager and EventBus together,
/// runs a periodic scan loop over the configured import roots, and
/// exposes a health check plus a server-sent-events stream of library
/// events. The full REST surface is out of scope (spec.md §1); this is
/// only enough of a harness to prove the wiring, the way `bae-server`
/// wires `bae-core`'s `LibraryManager` behind a router without
/// reimplementing Subsonic inside the core crate.
#[derive(Parser)]
#[command(name = "shelf-server")]
struct Args {
    /// Directory where the Store's data lives (LSM partitions or the
    /// SQLite file, depending on the configured backend).
    #[arg(long, env = "SHELF_DATA_DIR")]
    data_dir: PathBuf,

    /// Storage backend: "lsm" or "sqlite". Empty defaults to "lsm".
    #[arg(long, default_value = "lsm", env = "SHELF_STORAGE_BACKEND")]
    storage_backend: String,

    /// Path to the process-wide secret key file used to encrypt secrets
    /// at rest (spec.md §4.1 "Encrypted secrets").
    #[arg(long, env = "SHELF_SECRET_KEY_PATH")]
    secret_key_path: PathBuf,

    /// Path to the YAML settings mirror (spec.md §4.2 recovery path).
    #[arg(long, env = "SHELF_CONFIG_YAML_PATH")]
    config_yaml_path: PathBuf,

    /// Port for the harness HTTP server.
    #[arg(long, default_value = "8420", env = "SHELF_PORT")]
    port: u16,

    /// Address to bind the server to.
    #[arg(long, default_value = "0.0.0.0", env = "SHELF_BIND")]
    bind: String,

    /// Background scan interval in seconds.
    #[arg(long, default_value = "300", env = "SHELF_SCAN_INTERVAL")]
    scan_interval: u64,
}

fn configure_logging() {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[derive(serde::Serialize)]
struct HealthStatus {
    status: &'static str,
    storage_backend: String,
    library_root: String,
}

#[tokio::main]
async fn main() {
    configure_logging();
    let args = Args::parse();

    if !args.data_dir.is_absolute() {
        error!("--data-dir must be an absolute path, got: {}", args.data_dir.display());
        std::process::exit(1);
    }

    info!("shelf-server starting");
    info!("Data dir: {}", args.data_dir.display());

    std::fs::create_dir_all(&args.data_dir).unwrap_or_else(|e| {
        error!("Failed to create data directory {}: {e}", args.data_dir.display());
        std::process::exit(1);
    });

    let store: Arc<dyn Store> = match shelf_core::store::open(&args.storage_backend, &args.data_dir).await {
        Ok(store) => Arc::from(store),
        Err(e) => {
            error!("Failed to open store: {e}");
            std::process::exit(1);
        }
    };

    let secret_key = SecretKey::load_or_create(&args.secret_key_path).unwrap_or_else(|e| {
        error!("Failed to load or create secret key: {e}");
        std::process::exit(1);
    });

    let settings = Arc::new(
        Settings::load(store.clone(), secret_key, args.config_yaml_path)
            .await
            .unwrap_or_else(|e| {
                error!("Failed to load settings: {e}");
                std::process::exit(1);
            }),
    );

    let config = settings.current();
    info!("Library root: {}", config.library_root.display());
    info!("Storage backend: {}", config.storage_backend);

    let events = Arc::new(EventBus::new(256));
    let operations = Arc::new(OperationManager::new(
        store.clone(),
        config.operation_timeout_minutes,
        config.operation_retention_hours,
    ));

    let scan_interval = args.scan_interval.max(5);
    let scan_store = store.clone();
    let scan_settings = settings.clone();
    let scan_events = events.clone();
    let scan_operations = operations.clone();

    // Background scan loop, analogous to bae-server's sync loop: run once
    // at startup then on a fixed interval thereafter, publishing progress
    // over the event bus instead of returning a result to a caller.
    tokio::spawn(async move {
        loop {
            run_one_scan(&scan_store, &scan_settings, &scan_events, &scan_operations).await;
            tokio::time::sleep(Duration::from_secs(scan_interval)).await;
        }
    });

    let health_store = store.clone();
    let health_settings = settings.clone();
    let health_handler = get(move || {
        let store = health_store.clone();
        let settings = health_settings.clone();
        async move {
            let config = settings.current();
            let status = if store.list_books().await.is_ok() { "ok" } else { "degraded" };
            Json(HealthStatus {
                status,
                storage_backend: config.storage_backend.clone(),
                library_root: config.library_root.display().to_string(),
            })
        }
    });

    let sse_events = events.clone();
    let events_handler = get(move || {
        let events = sse_events.clone();
        async move { events_stream(events) }
    });

    let app = Router::new()
        .route("/health", health_handler)
        .route("/events", events_handler);

    let addr = format!("{}:{}", args.bind, args.port);
    info!("Binding to {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        error!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    info!("shelf-server listening on http://{addr}");
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}

/// Runs one scan pass against the configured import roots and reports it
/// through the operation manager, mirroring `bae-server`'s
/// `pull_new_changesets`: failures are logged and swallowed so the
/// background loop keeps running.
async fn run_one_scan(
    store: &Arc<dyn Store>,
    settings: &Arc<Settings>,
    events: &EventBus,
    operations: &OperationManager,
) {
    let config = settings.current();
    let scan_config = ScanConfig {
        import_roots: vec![config.library_root.clone()],
        supported_extensions: config.supported_extensions.clone(),
        exclude_patterns: config.exclude_patterns.clone(),
        exclusion_marker_name: config.exclusion_marker_name.clone(),
        concurrent_scans: config.concurrent_scans,
    };

    let handle = match operations.start(shelf_core::models::OperationType::Scan, None).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Failed to start scan operation: {e}");
            return;
        }
    };

    if let Err(e) = operations.mark_running(&handle.id).await {
        warn!("Failed to mark scan operation running: {e}");
        return;
    }

    match shelf_core::scan::run_scan(store.clone(), events, &handle.id, handle.cancellation, &scan_config).await {
        Ok(summary) => {
            info!(?summary, "background scan complete");
            let _ = operations
                .complete(&handle.id, Some(format!("scanned {} files", summary.scanned)))
                .await;
        }
        Err(e) => {
            warn!("Background scan failed: {e}");
            let _ = operations.fail(&handle.id, e.to_string()).await;
        }
    }
}

/// Bridges the event bus to a server-sent-events response, translating
/// every [`shelf_core::events::Event`] into one `Sse` event named after
/// `Event::name()` with the JSON-encoded payload as its data field.
fn events_stream(events: Arc<EventBus>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = events.subscribe();
    let stream = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let payload = serde_json::to_string(&event).unwrap_or_default();
        let sse_event = SseEvent::default().event(event.name()).data(payload);
        Some((Ok(sse_event), subscription))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ja_store::{JsonDirStore, MemoryStore, RecordAdapter, RecordStore};

mod api;
mod config;
mod planner;

use config::{Config, StoreKind};
use planner::QueryPlanner;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "ja-hub",
    version,
    about = "Job Analytics aggregation server"
)]
struct Args {
    /// Path to config file
    #[arg(long, default_value = "ja-hub.toml")]
    config: PathBuf,

    /// Server bind address (overrides `server.bind`)
    #[arg(long)]
    bind: Option<String>,

    /// Record store backend (overrides `store.kind`)
    #[arg(long, value_enum)]
    store: Option<StoreKind>,

    /// Directory of JSON batch files (overrides `store.data_dir`)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory served at `/` (overrides `server.static_dir`)
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(kind) = self.store {
            config.store.kind = kind;
        }
        if let Some(dir) = &self.data_dir {
            config.store.data_dir = dir.clone();
        }
        if let Some(dir) = &self.static_dir {
            config.server.static_dir = Some(dir.clone());
        }
    }
}

// =============================================================================
// Application State
// =============================================================================

pub struct AppState {
    pub planner: QueryPlanner,
    pub start_time: Instant,
}

fn open_store(config: &Config) -> Arc<dyn RecordStore> {
    match config.store.kind {
        StoreKind::JsonDir => {
            let dir = &config.store.data_dir;
            if !dir.is_dir() {
                tracing::warn!(
                    "Data directory {} does not exist; analytics will report the store as unavailable",
                    dir.display()
                );
            }
            Arc::new(JsonDirStore::new(dir.clone()))
        }
        StoreKind::Memory => Arc::new(MemoryStore::new("memory")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ja_hub=info,ja_store=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    args.apply(&mut config);

    let engine = match config.engine_config() {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = match config.server.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid bind address '{}': {}", config.server.bind, e);
            std::process::exit(1);
        }
    };

    let store = open_store(&config);
    let planner = QueryPlanner::new(RecordAdapter::new(store), engine, config.cache.ttl());

    let state = Arc::new(AppState {
        planner: planner.clone(),
        start_time: Instant::now(),
    });

    // Spawn cache maintenance
    let sweep_every = config.cache.sweep_interval();
    tokio::spawn(async move { cache_maintenance(planner, sweep_every).await });

    let mut app = api::router(state);
    if let Some(dir) = &config.server.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    let app = app
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  Job Analytics v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  API:        http://{}/api/analytics/:dimension", addr);
    tracing::info!("  Store:      {:?} ({})", config.store.kind, config.store.data_dir.display());
    tracing::info!("  Cache TTL:  {}s", config.cache.ttl_secs);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

// =============================================================================
// Background cache maintenance (expiry sweep + out-of-band batch detection)
// =============================================================================

async fn cache_maintenance(planner: QueryPlanner, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        planner.sweep_expired().await;
        if let Err(e) = planner.refresh_fingerprint().await {
            tracing::warn!("Store fingerprint check failed: {}", e);
        }
    }
}

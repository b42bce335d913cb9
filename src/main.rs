/// Main entry point for the trading engine
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tickbroker::{
    admin::{AuditLog, StorageAdmin},
    bbook::{run_swap_scheduler, BBookEngine, SwapSchedule},
    config::load_config,
    data::{JsonlBackend, OhlcCache, SqliteBackend, TickBackend, TickStore},
    error::{EngineError, Result},
    hub::{
        server::{bind_ws, run_ws_server},
        BroadcastHub,
    },
    ingest::QuoteIngestor,
    ledger::Ledger,
    lp::{run_quote_source, SimulatedLp},
    maintenance::{
        ensure_state_dirs, run_engine_sweeper, run_ohlc_compaction, RetentionSweeper,
    },
    registry::SymbolRegistry,
    types::{EngineConfig, Quote, TickBackendKind},
};

/// Exit codes: 0 clean shutdown, 1 fatal startup error, 2
/// unrecoverable runtime error
const EXIT_OK: i32 = 0;
const EXIT_STARTUP: i32 = 1;
const EXIT_RUNTIME: i32 = 2;

struct EngineApp {
    config: Arc<EngineConfig>,
    registry: Arc<SymbolRegistry>,
    tick_store: Arc<TickStore>,
    ohlc: Arc<OhlcCache>,
    hub: Arc<BroadcastHub>,
    bbook: Arc<BBookEngine>,
    ingestor: Arc<QuoteIngestor>,
    storage_admin: Arc<StorageAdmin>,
    retention: Arc<RetentionSweeper>,
    listener: Option<TcpListener>,
    quote_tx: mpsc::Sender<Quote>,
    quote_rx: Option<mpsc::Receiver<Quote>>,
}

impl EngineApp {
    /// Startup phase: any failure here is a configuration/bind error
    async fn new(config: EngineConfig) -> Result<Self> {
        let config = Arc::new(config);
        let root = PathBuf::from(&config.data_root);
        ensure_state_dirs(&root).await?;

        let registry = Arc::new(
            SymbolRegistry::new(config.category_patterns.clone())
                .with_persistence(root.join("config.json"))?,
        );

        let backend: Arc<dyn TickBackend> = match config.tick_backend {
            TickBackendKind::Jsonl => Arc::new(JsonlBackend::new(&root)),
            TickBackendKind::Sqlite => Arc::new(SqliteBackend::new(&root, config.broker_id)),
        };
        let tick_store = Arc::new(TickStore::new(&root, Arc::clone(&backend), &config));
        let ohlc = Arc::new(OhlcCache::new(config.ohlc_history_bars));
        let hub = Arc::new(BroadcastHub::new(Arc::clone(&registry), &config));

        let ledger = Arc::new(Ledger::open(root.join("ledger/ledger.log")).await?);
        let bbook = Arc::new(BBookEngine::new(
            Arc::clone(&registry),
            ledger,
            Arc::clone(&hub),
            &config,
        ));

        let ingestor = Arc::new(QuoteIngestor::new(
            Arc::clone(&registry),
            Arc::clone(&tick_store),
            Arc::clone(&ohlc),
            Arc::clone(&hub),
            Arc::clone(&bbook),
            &config,
        ));

        let audit = Arc::new(AuditLog::open(root.join("audit.log")).await?);
        let storage_admin = Arc::new(StorageAdmin::new(
            root.clone(),
            Arc::clone(&backend),
            Arc::clone(&registry),
            audit,
            config.broker_id,
        ));
        let retention = Arc::new(RetentionSweeper::new(root, Arc::clone(&backend), &config));

        // Validate the schedule and bind the hub socket up front
        SwapSchedule::from_config(&config)?;
        let listener = bind_ws(&config.ws_bind).await?;

        let (quote_tx, quote_rx) = mpsc::channel(config.ingest_queue_capacity);

        Ok(EngineApp {
            config,
            registry,
            tick_store,
            ohlc,
            hub,
            bbook,
            ingestor,
            storage_admin,
            retention,
            listener: Some(listener),
            quote_tx,
            quote_rx: Some(quote_rx),
        })
    }

    async fn run(&mut self) -> Result<()> {
        info!(symbols = self.registry.symbol_count(), backend = ?self.config.tick_backend, "🚀 Engine starting");

        let stats = self.storage_admin.storage_stats().await?;
        info!(files = stats.total_files, bytes = stats.total_bytes, "Tick storage scanned");

        let listener = self
            .listener
            .take()
            .ok_or_else(|| EngineError::Internal("engine already running".to_string()))?;
        let ws = tokio::spawn(run_ws_server(
            listener,
            Arc::clone(&self.hub),
            Duration::from_secs(self.config.session_read_deadline_secs),
        ));
        tokio::spawn(Arc::clone(&self.hub).run_heartbeat());

        // Maintenance workers
        tokio::spawn(
            Arc::clone(&self.retention)
                .run(Duration::from_secs(self.config.retention_sweep_interval_secs)),
        );
        tokio::spawn(run_ohlc_compaction(
            Arc::clone(&self.ohlc),
            self.config.ohlc_idle_days,
        ));
        tokio::spawn(run_engine_sweeper(Arc::clone(&self.bbook)));
        tokio::spawn(run_swap_scheduler(
            Arc::clone(&self.bbook),
            SwapSchedule::from_config(&self.config)?,
        ));

        // Quote pipeline: LP adapters (or the simulated feed) push
        // into quote_tx, the ingestor fans out per symbol
        let quote_rx = self
            .quote_rx
            .take()
            .ok_or_else(|| EngineError::Internal("engine already running".to_string()))?;
        let ingest = tokio::spawn(Arc::clone(&self.ingestor).run(quote_rx));

        if self.config.sim_feed {
            info!(symbols = ?self.config.sim_symbols, "📡 Simulated LP feed enabled");
            let lp = SimulatedLp::new(self.config.sim_symbols.clone(), Duration::from_millis(100));
            tokio::spawn(run_quote_source(lp, self.quote_tx.clone()));
        } else {
            info!("📡 Waiting for LP adapters on the quote channel");
        }

        // Run until ctrl-c or the hub front end dies
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown signal received");
            }
            result = ws => {
                let message = match result {
                    Ok(Err(e)) => format!("WebSocket server failed: {}", e),
                    Ok(Ok(())) => "WebSocket server exited".to_string(),
                    Err(e) => format!("WebSocket server panicked: {}", e),
                };
                return Err(EngineError::WebSocket(message));
            }
        }

        self.shutdown(ingest).await;
        Ok(())
    }

    /// Drain: stop accepting quotes, flush the per-symbol streams and
    /// the tick store within the deadline, then close client sessions.
    async fn shutdown(&self, ingest: tokio::task::JoinHandle<()>) {
        let deadline = Duration::from_secs(self.config.drain_deadline_secs);

        // The app holds the last quote sender, so abort the consumer
        // and drain what already entered the per-symbol streams
        ingest.abort();
        self.ingestor.shutdown(deadline).await;
        self.tick_store.shutdown(deadline).await;
        self.hub.shutdown().await;

        let stats = self.tick_store.stats();
        info!(
            accepted = stats.accepted,
            dropped_writes = stats.dropped_writes,
            failed_batches = stats.failed_batches,
            "✅ Engine drained"
        );
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());

    // A missing config file falls back to built-in defaults; a file
    // that exists but fails to parse or validate is a startup error
    let config = if std::path::Path::new(&config_path).exists() {
        match load_config(&config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Startup failed [{}]: {}", e.error_code(), e);
                std::process::exit(EXIT_STARTUP);
            }
        }
    } else {
        eprintln!("Config file {} not found, using defaults", config_path);
        toml::from_str("").expect("default config is valid")
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("tickbroker={}", config.log_level))),
        )
        .init();

    let mut app = match EngineApp::new(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, code = e.error_code(), "Startup failed");
            std::process::exit(EXIT_STARTUP);
        }
    };

    match app.run().await {
        Ok(()) => {
            info!("Clean shutdown");
            std::process::exit(EXIT_OK);
        }
        Err(e) => {
            error!(error = %e, code = e.error_code(), "Unrecoverable runtime error");
            std::process::exit(EXIT_RUNTIME);
        }
    }
}

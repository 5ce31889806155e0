use axum::{extract::State, http::StatusCode, routing::get, Router};
use clap::Parser;
use orbit_engine::{api::create_rest_api, Engine, EngineConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "orbit-engine")]
#[command(about = "Orbit cluster engine node", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "orbit.yaml", env = "ORBIT_CONFIG")]
    config: PathBuf,

    /// Data directory
    #[arg(long, env = "ORBIT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Node ID, used only when the data directory is new
    #[arg(long)]
    node_id: Option<String>,

    /// REST API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Consensus RPC port
    #[arg(long)]
    raft_port: Option<u16>,

    /// Image registry for build tags
    #[arg(long)]
    registry: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if args.config.exists() {
        EngineConfig::from_file(&args.config)?
    } else {
        EngineConfig::default()
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.monitoring.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if !args.config.exists() {
        tracing::warn!("Config file {:?} not found, using defaults", args.config);
    }

    // Override with CLI args
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(node_id) = args.node_id {
        config.node.node_id = Some(node_id);
    }
    if let Some(port) = args.api_port {
        config.api.port = port;
    }
    if let Some(port) = args.raft_port {
        config.raft.port = port;
    }
    if let Some(registry) = args.registry {
        config.build.registry = registry;
    }
    config.validate()?;

    tracing::info!("Starting engine with config: {:?}", config);

    let engine = Arc::new(Engine::new(config.clone())?);
    engine.start().await?;
    tracing::info!(node_id = %engine.node_id(), status = %engine.status(), "Engine started");

    // Persist status changes such as being joined by a leader
    let watch_engine = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            watch_engine.refresh_metrics();
        }
    });

    // Start metrics server
    let metrics_engine = engine.clone();
    let metrics_port = config.monitoring.prometheus_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_engine, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // REST API runs until ctrl-c
    let app = create_rest_api(engine.clone());
    let addr = format!("{}:{}", config.api.host, config.api.port);
    tracing::info!("REST API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    engine.shutdown();
    Ok(())
}

async fn start_metrics_server(engine: Arc<Engine>, port: u16) -> anyhow::Result<()> {
    async fn metrics_handler(State(engine): State<Arc<Engine>>) -> Result<String, StatusCode> {
        engine.refresh_metrics();
        engine.metrics().gather_text().map_err(|e| {
            tracing::error!("Could not encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(engine);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

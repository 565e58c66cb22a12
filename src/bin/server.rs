use axum::{Router, http::Method, routing::get};
use clap::Parser;
use eidolon::server::{
    collector, tasks,
    config::{AppState, CliArgs, ServerConfig},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "eidolon-server")]
#[command(about = "Eidolon network discovery server")]
struct Cli {
    /// Override server port
    #[arg(long)]
    server_port: Option<u16>,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,

    /// Override database url
    #[arg(long)]
    database_url: Option<String>,

    /// Override external scanner executable
    #[arg(long)]
    scanner_bin: Option<String>,

    /// Override graph store url
    #[arg(long)]
    graph_url: Option<String>,
}

impl From<Cli> for CliArgs {
    fn from(cli: Cli) -> Self {
        Self {
            server_port: cli.server_port,
            log_level: cli.log_level,
            database_url: cli.database_url,
            scanner_bin: cli.scanner_bin,
            graph_url: cli.graph_url,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cli_args = CliArgs::from(cli);

    // Load configuration using figment
    let config = ServerConfig::load(cli_args)?;
    let listen_addr = format!("0.0.0.0:{}", &config.server_port);

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "eidolon={},server={}",
            config.log_level, config.log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Create app state
    let state = AppState::new(config).await?;
    let registry = state.services.task_registry.clone();
    let bus = state.services.event_bus.clone();

    // Periodically drop finished bus topics nobody listens to anymore
    let purge_bus = bus.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            purge_bus.purge_closed().await;
        }
    });

    let api_router = Router::new()
        .nest("/collector", collector::handlers::create_router())
        .nest("/tasks", tasks::handlers::create_router())
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    // Create main app
    let app = Router::new().merge(api_router).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                    .allow_headers(Any),
            ),
    );

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    let actual_port = listener.local_addr()?.port();

    tracing::info!("🚀 Eidolon server started successfully");
    tracing::info!("🔧 API: http://<your-ip>:{}", actual_port);

    // Cancel running tasks and publish their terminal events before the
    // bus closes; closing the bus is what ends the open stream responses
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested, cancelling running scans");
            registry.shutdown().await;
            bus.shutdown().await;
        })
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

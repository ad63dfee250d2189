use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use arrow_flight::flight_service_server::FlightServiceServer;
use authentication::{
    Authenticator,
    BearerAuthenticator,
};
use clap::Parser;
use common::StorageConfig;
use flight::MetricsFlightService;
use local_backend::{
    router,
    LocalAppState,
};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::MetricsServiceServer;
use otel::{
    OtelBridge,
    OtelMetricsService,
};
use storage::DerivedMetricManager;
use tracing_subscriber::EnvFilter;

/// A time-series database speaking Prometheus remote write/read, OTLP,
/// and Arrow Flight.
#[derive(Parser, Debug)]
#[command(name = "chronik-backend")]
struct Args {
    /// HTTP listen address for the Prometheus API surface.
    #[arg(long, default_value = "127.0.0.1:9201")]
    listen_address: SocketAddr,

    /// gRPC listen address for OTLP and Arrow Flight ingestion.
    #[arg(long, default_value = "127.0.0.1:9202")]
    grpc_listen_address: SocketAddr,

    /// Root directory for block files.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Require this bearer token on HTTP requests.
    #[arg(long)]
    bearer_token: Option<String>,

    /// Drop rules applied at write time, as Prometheus-style selectors.
    #[arg(long = "drop-rule")]
    drop_rules: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let authenticator: Option<Arc<dyn Authenticator>> = args.bearer_token.map(|token| {
        let mut auth = BearerAuthenticator::new();
        auth.add_token(token, None);
        Arc::new(auth) as Arc<dyn Authenticator>
    });
    let config = StorageConfig::with_data_dir(&args.data_dir);
    let state = LocalAppState::new(config, authenticator)
        .with_context(|| format!("opening storage at {}", args.data_dir.display()))?;
    for selector in &args.drop_rules {
        state.storage.rule_manager().add_drop_rule(selector)?;
    }

    let derived = DerivedMetricManager::new(state.storage.clone(), state.query_engine.clone());
    derived.start();

    let bridge = OtelBridge::new(state.storage.clone());
    let grpc = tonic::transport::Server::builder()
        .add_service(MetricsServiceServer::new(OtelMetricsService::new(bridge)))
        .add_service(FlightServiceServer::new(MetricsFlightService::new(
            state.storage.clone(),
        )))
        .serve_with_shutdown(args.grpc_listen_address, shutdown_signal());
    let grpc_task = tokio::spawn(grpc);
    tracing::info!("gRPC (OTLP + Flight) listening on {}", args.grpc_listen_address);

    let listener = tokio::net::TcpListener::bind(args.listen_address)
        .await
        .with_context(|| format!("binding {}", args.listen_address))?;
    tracing::info!("HTTP listening on {}", args.listen_address);
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    derived.stop().await;
    state.storage.close().await?;
    grpc_task.await??;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
    }
}

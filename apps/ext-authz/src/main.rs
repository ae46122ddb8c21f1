mod config;
mod http;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use grove_ext_authz::metrics::AuthMetrics;
use grove_ext_authz::proto;
use grove_ext_authz::proto::authorization_server::AuthorizationServer;
use grove_ext_authz::ratelimit::{HttpUsageWarehouse, RateLimitStore};
use grove_ext_authz::server::AuthzService;
use grove_ext_authz::store::postgres::PostgresPortalAppSource;
use grove_ext_authz::store::postgrest::PostgrestPortalAppSource;
use grove_ext_authz::store::{PortalAppSource, PortalAppStore};

use config::{Config, DataSourceType};
use http::{HttpState, SERVICE_NAME};

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load configuration
    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    });

    // Initialize logging; LOGGER_LEVEL applies when RUST_LOG is unset
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logger_level.clone())),
        )
        .init();

    tracing::info!(
        port = config.port,
        metrics_port = config.metrics_port,
        data_source = ?config.data_source_type,
        image_tag = %config.image_tag,
        "starting external auth server"
    );

    let metrics = Arc::new(AuthMetrics::new());

    // Select the portal app data source
    let source: Arc<dyn PortalAppSource> = match &config.data_source_type {
        DataSourceType::Postgres => {
            let connection_string = config
                .postgres_connection_string
                .as_deref()
                .expect("validated by Config");
            let source = PostgresPortalAppSource::connect(connection_string)
                .await
                .unwrap_or_else(|e| {
                    eprintln!("Failed to connect to postgres: {e}");
                    std::process::exit(1);
                });
            Arc::new(source)
        }
        DataSourceType::Postgrest => {
            let source = PostgrestPortalAppSource::new(
                config.postgrest_base_url.clone().expect("validated by Config"),
                config.postgrest_jwt_secret.clone().expect("validated by Config"),
                config.postgrest_jwt_role.clone(),
                config.postgrest_jwt_email.clone().expect("validated by Config"),
                config.portal_app_source_timeout,
            )
            .unwrap_or_else(|e| {
                eprintln!("Failed to build PostgREST client: {e}");
                std::process::exit(1);
            });
            Arc::new(source)
        }
    };

    // Bootstrap the portal app store; starting without a snapshot is fatal
    let portal_apps = PortalAppStore::new(
        source,
        config.portal_app_source_timeout,
        Arc::clone(&metrics),
    )
    .await
    .unwrap_or_else(|e| {
        eprintln!("Failed to initialize portal app store: {e}");
        std::process::exit(1);
    });
    let portal_apps = Arc::new(portal_apps);

    // Bootstrap the rate limit store; a failed initial refresh is tolerated
    let warehouse = HttpUsageWarehouse::new(
        config.warehouse_base_url.clone(),
        config.warehouse_api_token.clone(),
        config.warehouse_timeout,
    )
    .unwrap_or_else(|e| {
        eprintln!("Failed to build warehouse client: {e}");
        std::process::exit(1);
    });
    let rate_limits = RateLimitStore::new(
        Arc::new(warehouse),
        Arc::clone(&portal_apps),
        config.warehouse_timeout,
        Arc::clone(&metrics),
    )
    .await;

    // Background refresh workers
    let token = CancellationToken::new();
    let portal_refresh = tokio::spawn(Arc::clone(&portal_apps).run_refresh(
        config.portal_app_store_refresh_interval,
        token.clone(),
    ));
    let rate_limit_refresh = tokio::spawn(Arc::clone(&rate_limits).run_refresh(
        config.rate_limit_store_refresh_interval,
        token.clone(),
    ));

    // Metrics + health HTTP server
    let http_state = HttpState {
        metrics: Arc::clone(&metrics),
        version: config.image_tag.clone(),
    };
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to bind metrics listener on {metrics_addr}: {e}");
            std::process::exit(1);
        });
    let metrics_shutdown = token.clone();
    let metrics_server = tokio::spawn(async move {
        tracing::info!(%metrics_addr, "metrics server listening");
        if let Err(e) = axum::serve(metrics_listener, http::router(http_state))
            .with_graceful_shutdown(async move { metrics_shutdown.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "metrics server failed");
        }
    });

    // Cancel everything on SIGINT/SIGTERM
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    // The ext_authz gRPC service
    let service = AuthzService::new(portal_apps, rate_limits, metrics);

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<AuthorizationServer<AuthzService>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .unwrap_or_else(|e| {
            eprintln!("Failed to build reflection service: {e}");
            std::process::exit(1);
        });

    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%grpc_addr, service = SERVICE_NAME, "ext_authz gRPC server listening");

    Server::builder()
        .add_service(health_service)
        .add_service(reflection_service)
        .add_service(AuthorizationServer::new(service))
        .serve_with_shutdown(grpc_addr, token.clone().cancelled_owned())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Server error: {e}");
            std::process::exit(1);
        });

    // Wait for in-flight refreshes to wind down before exiting
    token.cancel();
    let _ = portal_refresh.await;
    let _ = rate_limit_refresh.await;
    let _ = metrics_server.await;

    tracing::info!("external auth server stopped");
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

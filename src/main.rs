//! Kubernetes-aware HTTP load balancer.
//!
//! # Environment Variables
//!
//! - `BACKEND_NAME`: Kubernetes service to balance across
//! - `BACKEND_PORT`: Backend port, number or name
//! - `LOADBALANCER_PORT`: Port to listen on
//! - `LOADBALANCER_METHOD`: Load balancing method (default: RoundRobin)
//! - `NAMESPACE`: Service namespace (default: uses pod's namespace)
//! - `POD_NAME` / `POD_IP`: Identity reported by `/status`
//!
//! Values may also come from a JSON config file; see `--help`.

use std::future::IntoFuture;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use k8s_http_balancer::config::{Cli, Settings};
use k8s_http_balancer::{AppState, Dispatcher, EndpointsFeed, Error, Registry, discover, router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let settings = Settings::load(cli)?;
    info!(
        "Balancing {} on port {} using {}",
        settings.backend_name, settings.backend_port, settings.strategy
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let discovery = settings.discovery_config();
    let registry = Arc::new(Registry::new(&discovery.service_name, discovery.port.clone()));
    let feed = EndpointsFeed::connect(&discovery).await?;
    info!("Watching Endpoints in namespace {}", feed.namespace());
    let mut watch = discover(feed, registry.clone(), shutdown.clone());

    // Don't serve before the first full listing has been reconciled
    info!("Waiting for endpoint discovery...");
    tokio::select! {
        () = registry.wait_synced() => {}
        result = &mut watch => return watch_result(result),
        () = shutdown.cancelled() => return Ok(()),
    }
    info!(
        "Discovered {} backend(s) for {}",
        registry.len(),
        registry.service_name()
    );

    let dispatcher = Dispatcher::new(registry, settings.strategy.build(), settings.upstream);
    let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.listen_port));
    let app = router(Arc::new(AppState::new(dispatcher, settings)));

    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| Error::Io("failed to bind listener", e))?;
    info!("Starting server on {listen_addr}");

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .into_future();

    tokio::select! {
        result = server => {
            result.map_err(|e| Error::Io("server failed", e))?;
            info!("Server stopped");
            shutdown.cancel();
            Ok(())
        }

        result = &mut watch => {
            // Stale membership is worse than no service
            shutdown.cancel();
            watch_result(result)
        }
    }
}

fn watch_result(result: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    match result {
        Ok(result) => result,
        Err(e) => Err(Error::Io(
            "endpoint watcher panicked",
            std::io::Error::other(e),
        )),
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let (Ok(mut sigterm), Ok(mut sigint)) = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) else {
                error!("failed to install signal handlers");
                return;
            };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }

        info!("Shutting down");
        shutdown.cancel();
    });
}

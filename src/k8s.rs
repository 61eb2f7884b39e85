//! Kubernetes endpoint discovery using `Endpoints` watches.
//!
//! This module wraps the connection to the Kubernetes API and turns the
//! `Endpoints` resource of one service into a change feed. Every event on the
//! feed carries the full membership of the resource, so the consumer can
//! rebuild its backend list from each event alone.
//!
//! # How It Works
//!
//! 1. Connects to the API server (explicit kubeconfig, in-cluster, or default)
//! 2. Watches `Endpoints` resources for the specified service
//! 3. Hands every watcher event to the [`Registry`], which replaces its backend
//!    set wholesale
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use k8s_http_balancer::{DiscoveryConfig, EndpointsFeed, Registry, discover};
//!
//! let config = DiscoveryConfig::new("backend", 8080);
//! let registry = Arc::new(Registry::new(&config.service_name, config.port.clone()));
//! let feed = EndpointsFeed::connect(&config).await?;
//! let watch = discover(feed, registry.clone(), CancellationToken::new());
//! registry.wait_synced().await;
//! ```

use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Endpoints;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client, Config};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::registry::Registry;

/// Result type for discovery operations.
type Result<T> = std::result::Result<T, Error>;

/// Consecutive watch errors tolerated before the feed is considered lost.
///
/// The watcher backs off between attempts, so this spans a few minutes.
const MAX_CONSECUTIVE_WATCH_ERRORS: u32 = 10;

/// Port specification for the backend service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Port {
    /// A numeric port number.
    Number(u16),
    /// A named port (resolved from the `Endpoints` subset).
    Name(String),
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl FromStr for Port {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(s.parse::<u16>().map_or_else(|_| Self::from(s), Self::Number))
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Configuration for Kubernetes endpoint discovery.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// The Kubernetes service name to watch.
    pub service_name: String,

    /// The Kubernetes namespace where the service is deployed.
    /// If `None`, uses the current namespace from the kube client.
    pub namespace: Option<String>,

    /// The port for the backend service (number or name).
    pub port: Port,

    /// Explicit kubeconfig file. If `None`, the in-cluster or default
    /// configuration is inferred.
    pub kubeconfig: Option<PathBuf>,
}

impl DiscoveryConfig {
    /// Creates a new discovery configuration.
    ///
    /// The port can be specified as a number (`8080`) or a name (`"http"`).
    /// Uses the current namespace from the kube client configuration.
    #[must_use]
    pub fn new(service_name: impl Into<String>, port: impl Into<Port>) -> Self {
        Self {
            service_name: service_name.into(),
            namespace: None,
            port: port.into(),
            kubeconfig: None,
        }
    }

    /// Sets an explicit namespace for the service.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets an explicit kubeconfig file to connect with.
    #[must_use]
    pub fn kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }
}

/// Subscribable change feed for the `Endpoints` resource of one service.
#[derive(Clone)]
pub struct EndpointsFeed {
    api: Api<Endpoints>,
    namespace: String,
    service_name: String,
}

impl EndpointsFeed {
    /// Connects to the Kubernetes API.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be loaded or no client
    /// configuration can be inferred.
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self> {
        let client = match &config.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                let client_config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await?;
                Client::try_from(client_config)?
            }

            None => Client::try_default().await?,
        };

        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());

        Ok(Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            service_name: config.service_name.clone(),
        })
    }

    /// The namespace being watched.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Subscribes to membership changes of the service.
    ///
    /// Each item is a watcher event carrying the full `Endpoints` object.
    pub fn subscribe(
        &self,
    ) -> impl Stream<Item = std::result::Result<Event<Endpoints>, watcher::Error>> + Send + 'static
    {
        let field_selector = format!("metadata.name={}", self.service_name);
        let watcher_config = WatcherConfig::default().fields(&field_selector);
        watcher::watcher(self.api.clone(), watcher_config).default_backoff()
    }
}

/// Starts reconciling the registry from the feed in a background task.
///
/// The task runs until `shutdown` is cancelled (returning `Ok`) or the feed
/// is lost (returning `Err`). Transient watch errors are logged and the
/// watch carries on with the last known membership; the feed is lost when
/// the stream ends or keeps failing [`MAX_CONSECUTIVE_WATCH_ERRORS`] times
/// in a row. Callers should treat a lost feed as fatal.
///
/// # Requirements
///
/// - The application must have RBAC permissions to watch `Endpoints` resources
/// - Kubernetes client configuration (in-cluster or kubeconfig)
#[must_use]
pub fn discover(
    feed: EndpointsFeed,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        tracing::debug!(
            "Starting Kubernetes endpoint watch for {}/{}",
            feed.namespace,
            feed.service_name
        );

        let result = discovery_loop(feed.subscribe(), &registry, &shutdown).await;
        if let Err(e) = &result {
            tracing::error!("Kubernetes endpoint watcher failed: {e}");
        }

        result
    })
}

/// Feeds watcher events into the registry until shutdown or feed loss.
async fn discovery_loop<S, E>(
    stream: S,
    registry: &Registry,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Event<Endpoints>, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::pin!(stream);
    let mut failures = 0_u32;

    loop {
        let item = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::debug!("shutdown requested, stopping Kubernetes watcher");
                return Ok(());
            }

            item = stream.next() => item,
        };

        match item {
            None => return Err(Error::FeedClosed),
            Some(Ok(event)) => {
                if failures > 0 {
                    tracing::info!("Kubernetes endpoint watch recovered after {failures} error(s)");
                    failures = 0;
                }

                registry.reconcile(&event);
            }
            Some(Err(e)) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_WATCH_ERRORS {
                    return Err(Error::Watch(failures, Box::new(e)));
                }

                tracing::warn!(
                    "Kubernetes endpoint watch error ({failures}/{MAX_CONSECUTIVE_WATCH_ERRORS}), keeping {} backend(s): {e}",
                    registry.len()
                );
            }
        }
    }
}

//! Backend registry reconciled from `Endpoints` events.
//!
//! The registry owns the current backend set. Each reconciliation builds a
//! complete new set and swaps it in with a single pointer store, so readers
//! only ever observe a set produced by one reconciliation pass.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::{EndpointSubset, Endpoints};
use kube::runtime::watcher::Event;
use tokio::sync::watch;

use crate::k8s::Port;

/// One addressable backend instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Backend {
    /// Address requests are forwarded to.
    pub address: SocketAddr,
    /// Pod (or host) name, for diagnostics only.
    pub identity: String,
}

impl Backend {
    /// Creates a backend record.
    #[must_use]
    pub fn new(address: SocketAddr, identity: impl Into<String>) -> Self {
        Self {
            address,
            identity: identity.into(),
        }
    }
}

/// Thread-safe view of the backends that currently belong to one service.
pub struct Registry {
    service_name: String,
    port: Port,
    backends: ArcSwap<Vec<Backend>>,
    // Written only by the single reconciling task.
    seen_in_relist: AtomicBool,
    synced: watch::Sender<bool>,
}

impl Registry {
    /// Creates an empty registry tracking `service_name`.
    #[must_use]
    pub fn new(service_name: impl Into<String>, port: Port) -> Self {
        Self {
            service_name: service_name.into(),
            port,
            backends: ArcSwap::from_pointee(Vec::new()),
            seen_in_relist: AtomicBool::new(false),
            synced: watch::Sender::new(false),
        }
    }

    /// The service whose `Endpoints` this registry tracks.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the current backend set.
    ///
    /// The returned set is immutable and stays valid however long the caller
    /// keeps it, regardless of later reconciliations.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Backend>> {
        self.backends.load_full()
    }

    /// Number of backends in the current set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    /// Whether the current set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.load().is_empty()
    }

    /// Waits until the initial listing of the service has completed.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Applies one change-feed event.
    ///
    /// Events for other resources are ignored. Every applied event replaces
    /// the whole backend set, so replaying the same event is a no-op.
    pub fn reconcile(&self, event: &Event<Endpoints>) {
        match event {
            Event::Apply(endpoints) => {
                if self.is_tracked(endpoints) {
                    self.replace(extract_ready_backends(endpoints, &self.port));
                }
            }

            Event::InitApply(endpoints) => {
                if self.is_tracked(endpoints) {
                    self.seen_in_relist.store(true, Ordering::Relaxed);
                    self.replace(extract_ready_backends(endpoints, &self.port));
                }
            }

            Event::Delete(endpoints) => {
                if self.is_tracked(endpoints) {
                    tracing::info!("Endpoints for {} deleted", self.service_name);
                    self.replace(Vec::new());
                }
            }

            Event::Init => {
                tracing::debug!("Kubernetes watcher relist started");
                self.seen_in_relist.store(false, Ordering::Relaxed);
            }

            Event::InitDone => {
                if !self.seen_in_relist.load(Ordering::Relaxed) && !self.is_empty() {
                    tracing::info!(
                        "Endpoints for {} missing after relist, dropping all backends",
                        self.service_name
                    );
                    self.replace(Vec::new());
                }

                if !self.synced.send_replace(true) {
                    tracing::info!(
                        "initial sync complete: {} backends for {}",
                        self.len(),
                        self.service_name
                    );
                }
            }
        }
    }

    fn is_tracked(&self, endpoints: &Endpoints) -> bool {
        let name = endpoints.metadata.name.as_deref();
        if name == Some(self.service_name.as_str()) {
            true
        } else {
            tracing::debug!("ignoring Endpoints event for {name:?}");
            false
        }
    }

    fn replace(&self, backends: Vec<Backend>) {
        tracing::debug!(
            "Kubernetes discovery: {} backends for {}",
            backends.len(),
            self.service_name
        );
        self.backends.store(Arc::new(backends));
    }
}

/// Flattens the ready addresses of an `Endpoints` object into backends.
fn extract_ready_backends(endpoints: &Endpoints, port: &Port) -> Vec<Backend> {
    let mut backends = Vec::new();

    for subset in endpoints.subsets.iter().flatten() {
        let Some(port_number) = resolve_port(subset, port) else {
            tracing::debug!("no port {port} in subset, skipping");
            continue;
        };

        // `addresses` holds ready members only
        for addr in subset.addresses.iter().flatten() {
            let Ok(ip) = addr.ip.parse::<IpAddr>() else {
                tracing::debug!("skipping unparsable endpoint address {}", addr.ip);
                continue;
            };

            let identity = addr
                .target_ref
                .as_ref()
                .and_then(|r| r.name.clone())
                .or_else(|| addr.hostname.clone())
                .unwrap_or_else(|| "unknown".to_string());

            tracing::debug!("adding backend {identity} at {ip}:{port_number}");
            backends.push(Backend::new(SocketAddr::new(ip, port_number), identity));
        }
    }

    backends
}

fn resolve_port(subset: &EndpointSubset, port: &Port) -> Option<u16> {
    match port {
        Port::Number(n) => Some(*n),
        Port::Name(name) => subset.ports.as_ref().and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .and_then(|p| u16::try_from(p.port).ok())
        }),
    }
}

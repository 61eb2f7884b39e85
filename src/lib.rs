#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes-aware HTTP load balancer.
//!
//! A `ClusterIP` service picks a backend per TCP connection, so clients that
//! hold long-lived connections pin themselves to one pod. This crate sits in
//! front of a service instead: it watches the service's `Endpoints` resource,
//! keeps an always-consistent list of ready backends, and forwards each
//! incoming HTTP request to one of them, streaming bodies in both directions.
//!
//! # Features
//!
//! - **Kubernetes API discovery**: Real-time backend updates via `Endpoints` watch
//! - **Whole-set reconciliation**: Readers never observe a half-applied update
//! - **Pluggable selection**: Round-robin over a lock-free request counter
//! - **Streaming forwarding**: Request and response bodies are never buffered
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use k8s_http_balancer::{
//!     AppState, Dispatcher, DiscoveryConfig, EndpointsFeed, Registry, StrategyKind,
//!     UpstreamOptions, discover, router,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let config = DiscoveryConfig::new("backend", 8080);
//! let registry = Arc::new(Registry::new(&config.service_name, config.port.clone()));
//! let feed = EndpointsFeed::connect(&config).await?;
//! let _watch = discover(feed, registry.clone(), CancellationToken::new());
//! registry.wait_synced().await;
//!
//! let dispatcher = Dispatcher::new(
//!     registry,
//!     StrategyKind::RoundRobin.build(),
//!     UpstreamOptions::default(),
//! );
//! // Serve `router(Arc::new(AppState::new(dispatcher, settings)))` with axum
//! ```

pub mod config;
mod error;
mod k8s;
mod proxy;
mod registry;
mod server;
mod strategy;

pub use error::{Error, ProxyError};
pub use k8s::{DiscoveryConfig, EndpointsFeed, Port, discover};
pub use proxy::{Dispatcher, UpstreamOptions};
pub use registry::{Backend, Registry};
pub use server::{AppState, router};
pub use strategy::{RoundRobin, Strategy, StrategyKind};

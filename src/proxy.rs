//! Per-request dispatch: counter, snapshot, selection, and streaming forward.
//!
//! Request and response bodies are passed through as streams, so large or
//! long-lived transfers do not grow memory. Dropping the future returned by
//! [`Dispatcher::forward`] (for example when the caller disconnects) drops
//! the in-flight upstream connection with it.
//!
//! The response timeout only starts once the request body has been handed
//! to the backend, so slow uploads are bounded by the backend, not by us.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Scheme, Uri};
use http::{Request, Response, Version};
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::sync::oneshot;

use crate::error::ProxyError;
use crate::registry::{Backend, Registry};
use crate::strategy::Strategy;

/// Headers that apply to a single connection and are not forwarded.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Upstream connection settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpstreamOptions {
    /// Time allowed to establish a TCP connection to a backend.
    pub connect_timeout: Duration,
    /// Time allowed for a backend to send response headers once the request
    /// body has been sent.
    pub response_timeout: Duration,
    /// How long an idle pooled connection is kept open.
    pub idle_timeout: Duration,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Ties discovery and selection to forwarded requests.
///
/// The only state shared across requests is the request counter, which is
/// updated atomically and never under the registry's control.
pub struct Dispatcher {
    registry: Arc<Registry>,
    strategy: Box<dyn Strategy>,
    requests: AtomicU64,
    client: Client<HttpConnector, Body>,
    response_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher with a fresh request counter.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        strategy: Box<dyn Strategy>,
        options: UpstreamOptions,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(options.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(options.idle_timeout)
            .build(connector);

        Self {
            registry,
            strategy,
            requests: AtomicU64::new(0),
            client,
            response_timeout: options.response_timeout,
        }
    }

    /// The registry backends are selected from.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of requests dispatched so far.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Consumes one counter value and selects a backend for it.
    ///
    /// The counter is advanced even when no backend is available.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NoBackends`] if the backend set is empty; the
    /// strategy is not consulted in that case.
    pub fn dispatch(&self) -> Result<Backend, ProxyError> {
        let counter = self.requests.fetch_add(1, Ordering::Relaxed);
        self.select(counter).ok_or(ProxyError::NoBackends)
    }

    /// Returns the backend the next request would be sent to, without
    /// advancing the counter.
    #[must_use]
    pub fn peek(&self) -> Option<Backend> {
        self.select(self.requests.load(Ordering::Relaxed))
    }

    fn select(&self, counter: u64) -> Option<Backend> {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return None;
        }

        Some(self.strategy.select(&snapshot, counter).clone())
    }

    /// Forwards a request to the next selected backend.
    ///
    /// Method, headers and body pass through unchanged apart from the target
    /// authority and hop-by-hop headers. Failures are not retried.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NoBackends`] when no backend is known, and a
    /// gateway error when the selected backend fails or times out.
    pub async fn forward(&self, mut req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let backend = self.dispatch()?;
        rewrite_target(&mut req, backend.address)?;

        tracing::debug!(
            "forwarding {} {} to {} ({})",
            req.method(),
            req.uri(),
            backend.identity,
            backend.address
        );

        let (sent_tx, sent_rx) = oneshot::channel();
        let req = req.map(|body| Body::new(UploadBody::new(body, sent_tx)));

        let response = self.client.request(req);
        tokio::pin!(response);

        // A backend may answer before reading the whole body; otherwise the
        // clock starts when the body is done (or dropped by the client)
        let response = tokio::select! {
            biased;

            response = &mut response => response?,

            _ = sent_rx => tokio::time::timeout(self.response_timeout, &mut response)
                .await
                .map_err(|_| ProxyError::Timeout(self.response_timeout))??,
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Request body that reports when it has been fully sent.
///
/// The signal fires on the last frame, or when the client drops the body
/// (after writing it, or because the request was abandoned).
struct UploadBody {
    inner: Body,
    sent: Option<oneshot::Sender<()>>,
}

impl UploadBody {
    fn new(inner: Body, sent: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            sent: Some(sent),
        }
    }

    fn finish(&mut self) {
        if let Some(sent) = self.sent.take() {
            let _ = sent.send(());
        }
    }
}

impl HttpBody for UploadBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(frame, Poll::Ready(None | Some(Err(_)))) {
            this.finish();
        }

        frame
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Points the request at `addr`, keeping the path and query.
fn rewrite_target(req: &mut Request<Body>, addr: SocketAddr) -> Result<(), http::Error> {
    let authority = addr.to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    let uri = Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()?;

    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    strip_hop_by_hop(headers);
    headers.insert(header::HOST, HeaderValue::try_from(authority)?);

    Ok(())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are connection-scoped too
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::watcher::Event;

    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;
    use crate::k8s::Port;
    use crate::strategy::RoundRobin;

    /// Round-robin that remembers every counter value it was given.
    #[derive(Debug)]
    struct Recording(Arc<Mutex<Vec<u64>>>);

    impl Strategy for Recording {
        fn select<'a>(&self, backends: &'a [Backend], counter: u64) -> &'a Backend {
            self.0.lock().unwrap().push(counter);
            RoundRobin.select(backends, counter)
        }
    }

    fn registry_with(ips: &[&str]) -> Arc<Registry> {
        let registry = Arc::new(Registry::new("backend", Port::Number(8080)));
        set_backends(&registry, ips);
        registry
    }

    fn set_backends(registry: &Registry, ips: &[&str]) {
        let endpoints = Endpoints {
            metadata: ObjectMeta {
                name: Some("backend".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| EndpointAddress {
                            ip: (*ip).to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
        };

        registry.reconcile(&Event::Apply(endpoints));
    }

    fn dispatcher(registry: Arc<Registry>) -> Dispatcher {
        Dispatcher::new(registry, Box::new(RoundRobin), UpstreamOptions::default())
    }

    fn ip(backend: &Backend) -> String {
        backend.address.ip().to_string()
    }

    #[tokio::test]
    async fn dispatch_rotates_from_zero() {
        let d = dispatcher(registry_with(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]));

        let picked: Vec<_> = (0..4).map(|_| ip(&d.dispatch().unwrap())).collect();

        assert_eq!(picked, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1"]);
        assert_eq!(d.requests(), 4);
    }

    #[tokio::test]
    async fn dispatch_continues_after_shrink() {
        let registry = registry_with(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let d = dispatcher(registry.clone());

        for _ in 0..5 {
            d.dispatch().unwrap();
        }

        set_backends(&registry, &["10.0.0.1", "10.0.0.3"]);

        // Counter value 5 over two backends selects index 1
        assert_eq!(ip(&d.dispatch().unwrap()), "10.0.0.3");
    }

    #[tokio::test]
    async fn dispatch_with_no_backends_is_unavailable() {
        let d = dispatcher(registry_with(&[]));

        assert!(matches!(d.dispatch(), Err(ProxyError::NoBackends)));
        assert!(d.peek().is_none());
    }

    #[tokio::test]
    async fn peek_does_not_advance_counter() {
        let d = dispatcher(registry_with(&["10.0.0.1", "10.0.0.2"]));

        let first = d.peek().unwrap();
        let second = d.peek().unwrap();

        assert_eq!(first, second);
        assert_eq!(d.requests(), 0);
        assert_eq!(d.dispatch().unwrap(), first);
        assert_eq!(ip(&d.peek().unwrap()), "10.0.0.2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatch_uses_each_counter_value_once() {
        const TASKS: u64 = 64;
        const PER_TASK: u64 = 50;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let d = Arc::new(Dispatcher::new(
            registry_with(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
            Box::new(Recording(seen.clone())),
            UpstreamOptions::default(),
        ));

        let tasks: Vec<_> = (0..TASKS)
            .map(|_| {
                let d = d.clone();
                tokio::spawn(async move {
                    for _ in 0..PER_TASK {
                        d.dispatch().unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        let total = TASKS * PER_TASK;
        assert_eq!(d.requests(), total);

        let seen = seen.lock().unwrap();
        let unique: HashSet<u64> = seen.iter().copied().collect();
        assert_eq!(seen.len(), usize::try_from(total).unwrap());
        assert_eq!(unique, (0..total).collect());
    }

    #[tokio::test]
    async fn upload_body_signals_after_last_frame() {
        let (tx, mut rx) = oneshot::channel();
        let mut body = UploadBody::new(Body::from("payload"), tx);

        let frame = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await;
        assert_eq!(frame.unwrap().unwrap().into_data().unwrap(), "payload");

        let end = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await;
        assert!(end.is_none());
        assert_eq!(rx.try_recv(), Ok(()));
    }

    #[tokio::test]
    async fn upload_body_signals_when_dropped() {
        let (tx, rx) = oneshot::channel();
        let body = UploadBody::new(Body::from("never read"), tx);

        drop(body);
        assert!(rx.await.is_err());
    }

    #[test]
    fn rewrite_keeps_path_query_and_headers() {
        let mut req = Request::builder()
            .method("POST")
            .uri("http://balancer.local/upload?part=2")
            .header(header::HOST, "balancer.local")
            .header("x-request-id", "abc")
            .header(header::CONNECTION, "keep-alive, x-hop")
            .header("x-hop", "1")
            .header("keep-alive", "timeout=5")
            .body(Body::empty())
            .unwrap();

        rewrite_target(&mut req, "10.0.0.7:8080".parse().unwrap()).unwrap();

        assert_eq!(req.uri(), "http://10.0.0.7:8080/upload?part=2");
        assert_eq!(req.method(), "POST");
        assert_eq!(req.headers()[header::HOST], "10.0.0.7:8080");
        assert_eq!(req.headers()["x-request-id"], "abc");
        assert!(req.headers().get(header::CONNECTION).is_none());
        assert!(req.headers().get("x-hop").is_none());
        assert!(req.headers().get("keep-alive").is_none());
    }

    #[test]
    fn rewrite_origin_form_uri() {
        let mut req = Request::builder()
            .uri("/status/deep")
            .body(Body::empty())
            .unwrap();

        rewrite_target(&mut req, "[2001:db8::1]:80".parse().unwrap()).unwrap();

        assert_eq!(req.uri(), "http://[2001:db8::1]:80/status/deep");
    }
}

//! Error types for discovery, configuration and request forwarding.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors raised while starting up or while watching the cluster.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes client error.
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be read or applied.
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// The endpoint change feed kept failing without recovering.
    #[error("endpoint watch failed {0} times in a row: {1}")]
    Watch(u32, #[source] Box<dyn std::error::Error + Send + Sync>),

    /// The endpoint change feed ended unexpectedly.
    #[error("endpoint watch stream ended")]
    FeedClosed,

    /// A configuration file could not be read.
    #[error("failed to read config file {0}: {1}")]
    ConfigRead(String, #[source] std::io::Error),

    /// A configuration file could not be parsed.
    #[error("failed to parse config file {0}: {1}")]
    ConfigParse(String, #[source] serde_json::Error),

    /// A required setting was not provided by any configuration layer.
    #[error("missing setting `{0}` (set it in the config file or via {1})")]
    MissingSetting(&'static str, &'static str),

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),
}

/// Errors returned to the caller of a single forwarded request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No backends are currently known.
    #[error("no backends available")]
    NoBackends,

    /// The selected backend could not be reached or failed mid-request.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// The selected backend did not answer within the configured time.
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    /// The outbound request could not be rewritten for the selected backend.
    #[error("failed to rewrite request: {0}")]
    Rewrite(#[from] http::Error),
}

impl ProxyError {
    /// HTTP status reported to the caller for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoBackends => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) | Self::Rewrite(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backends_is_service_unavailable() {
        assert_eq!(
            ProxyError::NoBackends.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn timeout_is_gateway_timeout() {
        let err = ProxyError::Timeout(Duration::from_secs(15));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.to_string(), "upstream did not respond within 15s");
    }

    #[test]
    fn watch_error_reports_failure_count() {
        let err = Error::Watch(3, "connection refused".into());
        assert_eq!(
            err.to_string(),
            "endpoint watch failed 3 times in a row: connection refused"
        );
    }

    #[test]
    fn missing_setting_names_env_var() {
        let err = Error::MissingSetting("backendname", "BACKEND_NAME");
        assert_eq!(
            err.to_string(),
            "missing setting `backendname` (set it in the config file or via BACKEND_NAME)"
        );
    }
}

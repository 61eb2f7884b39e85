//! Startup configuration: an optional JSON file layered under flags and
//! environment variables.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::Error;
use crate::k8s::{DiscoveryConfig, Port};
use crate::proxy::UpstreamOptions;
use crate::strategy::StrategyKind;

/// Config files tried, in order, when no explicit path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["/etc/balancer/config.json", "config.json"];

/// Command line arguments; every option can also be set from the environment.
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON config file (default: first of /etc/balancer/config.json, ./config.json)
    #[arg(long, env = "BALANCER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Name of the Kubernetes service to balance across
    #[arg(long, env = "BACKEND_NAME")]
    pub backend_name: Option<String>,

    /// Backend port, as a number or a named port
    #[arg(long, env = "BACKEND_PORT")]
    pub backend_port: Option<Port>,

    /// Port this balancer listens on
    #[arg(long, env = "LOADBALANCER_PORT")]
    pub listen_port: Option<u16>,

    /// Load balancing method
    #[arg(long, env = "LOADBALANCER_METHOD")]
    pub method: Option<String>,

    /// Namespace of the backend service (default: the client's namespace)
    #[arg(long, env = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Kubeconfig file, for running outside the cluster
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Name reported by the status endpoint (default: $HOSTNAME)
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// IP reported by the status endpoint
    #[arg(long, env = "POD_IP", default_value = "127.0.0.1")]
    pub pod_ip: String,

    /// Seconds allowed to connect to a backend
    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT", default_value_t = 5)]
    pub connect_timeout: u64,

    /// Seconds allowed for a backend to send response headers
    #[arg(long, env = "UPSTREAM_RESPONSE_TIMEOUT", default_value_t = 15)]
    pub response_timeout: u64,

    /// Seconds an idle backend connection is kept for reuse
    #[arg(long, env = "UPSTREAM_IDLE_TIMEOUT", default_value_t = 60)]
    pub idle_timeout: u64,
}

/// Values read from a JSON config file; all optional so flags can fill gaps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct FileSettings {
    /// Backend service name.
    #[serde(rename = "backendname")]
    pub backend_name: Option<String>,
    /// Backend port.
    #[serde(rename = "backendport")]
    pub backend_port: Option<Port>,
    /// Listen port.
    #[serde(rename = "loadbalancerport")]
    pub listen_port: Option<u16>,
    /// Load balancing method.
    #[serde(rename = "loadbalancermethod")]
    pub method: Option<String>,
    /// Backend namespace.
    pub namespace: Option<String>,
}

impl FileSettings {
    /// Reads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn read(path: &Path) -> Result<Self, Error> {
        let contents =
            std::fs::read(path).map_err(|e| Error::ConfigRead(path.display().to_string(), e))?;
        let settings = serde_json::from_slice(&contents)
            .map_err(|e| Error::ConfigParse(path.display().to_string(), e))?;

        tracing::info!("Loaded config from {}", path.display());
        Ok(settings)
    }

    /// Reads the first existing file of `paths`, or defaults if none exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn discover(paths: &[&str]) -> Result<Self, Error> {
        for path in paths {
            match Self::read(Path::new(path)) {
                Ok(settings) => return Ok(settings),
                Err(Error::ConfigRead(_, e)) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        tracing::debug!("no config file found, using flags and environment only");
        Ok(Self::default())
    }
}

/// Fully resolved settings consumed by the rest of the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Backend service name.
    pub backend_name: String,
    /// Backend port.
    pub backend_port: Port,
    /// Listen port.
    pub listen_port: u16,
    /// Selected strategy.
    pub strategy: StrategyKind,
    /// Backend namespace, if set explicitly.
    pub namespace: Option<String>,
    /// Kubeconfig file, if set explicitly.
    pub kubeconfig: Option<PathBuf>,
    /// Name reported by the status endpoint.
    pub pod_name: String,
    /// IP reported by the status endpoint.
    pub pod_ip: String,
    /// Upstream connection settings.
    pub upstream: UpstreamOptions,
}

impl Settings {
    /// Loads the config file layer and applies `cli` on top of it.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is broken or a required setting is
    /// missing from every layer.
    pub fn load(cli: Cli) -> Result<Self, Error> {
        let file = match &cli.config {
            Some(path) => FileSettings::read(path)?,
            None => FileSettings::discover(&DEFAULT_CONFIG_PATHS)?,
        };

        Self::resolve(file, cli)
    }

    /// Merges the file layer with `cli`; values from `cli` win.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSetting`] if the backend name, backend port or
    /// listen port is set in neither layer.
    pub fn resolve(file: FileSettings, cli: Cli) -> Result<Self, Error> {
        let backend_name = cli
            .backend_name
            .or(file.backend_name)
            .ok_or(Error::MissingSetting("backendname", "BACKEND_NAME"))?;
        let backend_port = cli
            .backend_port
            .or(file.backend_port)
            .ok_or(Error::MissingSetting("backendport", "BACKEND_PORT"))?;
        let listen_port = cli
            .listen_port
            .or(file.listen_port)
            .ok_or(Error::MissingSetting("loadbalancerport", "LOADBALANCER_PORT"))?;

        let strategy = cli
            .method
            .or(file.method)
            .map_or_else(StrategyKind::default, |name| StrategyKind::from_name(&name));

        let pod_name = cli
            .pod_name
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            backend_name,
            backend_port,
            listen_port,
            strategy,
            namespace: cli.namespace.or(file.namespace),
            kubeconfig: cli.kubeconfig,
            pod_name,
            pod_ip: cli.pod_ip,
            upstream: UpstreamOptions {
                connect_timeout: Duration::from_secs(cli.connect_timeout),
                response_timeout: Duration::from_secs(cli.response_timeout),
                idle_timeout: Duration::from_secs(cli.idle_timeout),
            },
        })
    }

    /// Discovery configuration for the backend service.
    #[must_use]
    pub fn discovery_config(&self) -> DiscoveryConfig {
        let mut config = DiscoveryConfig::new(&self.backend_name, self.backend_port.clone());
        if let Some(namespace) = &self.namespace {
            config = config.namespace(namespace);
        }

        if let Some(path) = &self.kubeconfig {
            config = config.kubeconfig(path);
        }

        config
    }
}

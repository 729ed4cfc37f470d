//! Operator configuration
//!
//! Every flag can also be given through the environment, which is how the
//! operator is configured when deployed.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::backend::rest::RestBackendConfig;
use crate::controller::ControllerSettings;
use crate::error::{Error, Result};

/// Resource kinds a controller can be started for
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ControllerKind {
    SecurityPolicy,
    NetworkInfo,
    IpAddressAllocation,
    AddressBinding,
    NetworkPolicy,
}

/// netsync operator
#[derive(Parser, Debug, Clone)]
#[command(name = "netsync-operator", version, about)]
pub struct OperatorConfig {
    /// Base URL of the network backend (e.g. https://backend.example:443)
    #[arg(long, env = "NETSYNC_BACKEND_URL")]
    pub backend_url: String,

    #[arg(long, env = "NETSYNC_BACKEND_USERNAME", default_value = "admin")]
    pub backend_username: String,

    #[arg(long, env = "NETSYNC_BACKEND_PASSWORD", hide_env_values = true, default_value = "")]
    pub backend_password: String,

    /// Skip TLS certificate verification of the backend
    #[arg(long, env = "NETSYNC_BACKEND_INSECURE")]
    pub backend_insecure: bool,

    /// Cluster name, written into the ownership tag of every remote object
    #[arg(long, env = "NETSYNC_CLUSTER", default_value = "netsync")]
    pub cluster: String,

    /// Policy domain security policies are created in
    #[arg(long, env = "NETSYNC_DOMAIN", default_value = "default")]
    pub domain: String,

    /// Project used when a network configuration names none
    #[arg(long, env = "NETSYNC_PROJECT", default_value = "/orgs/default/projects/default")]
    pub project: String,

    /// Garbage collection interval in seconds
    #[arg(long, env = "NETSYNC_GC_INTERVAL", default_value = "600")]
    pub gc_interval: u64,

    /// Timeout for the backend work of one reconcile, in seconds
    #[arg(long, env = "NETSYNC_BACKEND_TIMEOUT", default_value = "60")]
    pub backend_timeout: u64,

    /// Requeue delay in seconds when the backend is too old for a kind
    #[arg(long, env = "NETSYNC_GATE_COOLDOWN", default_value = "300")]
    pub gate_cooldown: u64,

    /// Concurrent reconciles per controller
    #[arg(long, env = "NETSYNC_CONCURRENCY", default_value = "4")]
    pub concurrency: u16,

    /// First retry delay in seconds
    #[arg(long, env = "NETSYNC_BACKOFF_BASE", default_value = "1")]
    pub backoff_base: u64,

    /// Retry delay cap in seconds
    #[arg(long, env = "NETSYNC_BACKOFF_MAX", default_value = "300")]
    pub backoff_max: u64,

    /// Controllers to run
    #[arg(
        long,
        env = "NETSYNC_CONTROLLERS",
        value_enum,
        value_delimiter = ',',
        default_value = "security-policy,network-info,ip-address-allocation,address-binding,network-policy"
    )]
    pub controllers: Vec<ControllerKind>,

    /// Address of the metrics and health server
    #[arg(long, env = "NETSYNC_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: SocketAddr,

    /// Log as JSON
    #[arg(long, env = "NETSYNC_LOG_JSON")]
    pub log_json: bool,
}

impl OperatorConfig {
    /// Reject combinations clap cannot express
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::ConfigError("concurrency must be at least 1".to_string()));
        }
        if self.gc_interval == 0 {
            return Err(Error::ConfigError("gc interval must be at least 1s".to_string()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::ConfigError(format!(
                "backoff base ({}s) exceeds backoff max ({}s)",
                self.backoff_base, self.backoff_max
            )));
        }
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(Error::ConfigError(format!(
                "backend url '{}' must start with http:// or https://",
                self.backend_url
            )));
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            cluster: self.cluster.clone(),
            project: self.project.clone(),
            domain: self.domain.clone(),
            gc_interval: Duration::from_secs(self.gc_interval),
            backend_timeout: Duration::from_secs(self.backend_timeout),
            gate_cooldown: Duration::from_secs(self.gate_cooldown),
            concurrency: self.concurrency,
            backoff_base: Duration::from_secs(self.backoff_base),
            backoff_max: Duration::from_secs(self.backoff_max),
        }
    }

    pub fn rest_backend_config(&self) -> RestBackendConfig {
        RestBackendConfig {
            base_url: self.backend_url.trim_end_matches('/').to_string(),
            username: self.backend_username.clone(),
            password: self.backend_password.clone(),
            insecure: self.backend_insecure,
            cluster: self.cluster.clone(),
            request_timeout: Duration::from_secs(self.backend_timeout),
        }
    }

    pub fn is_enabled(&self, kind: ControllerKind) -> bool {
        self.controllers.contains(&kind)
    }
}

//! Process-wide default registries
//!
//! Nothing is created implicitly: a service opts in by calling one of the
//! `init_*` functions during startup, usually with `MetricsConfig::from_env()`.

use crate::client::ClientMetrics;
use crate::config::MetricsConfig;
use crate::error::{MetricsError, MetricsResult};
use crate::server::ServerMetrics;
use once_cell::sync::OnceCell;
use tracing::info;

static DEFAULT_SERVER_METRICS: OnceCell<ServerMetrics> = OnceCell::new();
static DEFAULT_CLIENT_METRICS: OnceCell<ClientMetrics> = OnceCell::new();

/// Build the default server metrics; fails if already initialized
pub fn init_default_server_metrics(config: &MetricsConfig) -> MetricsResult<&'static ServerMetrics> {
    let mut created = false;
    let metrics = DEFAULT_SERVER_METRICS.get_or_try_init(|| {
        created = true;
        ServerMetrics::with_config(config)
    })?;
    if !created {
        return Err(MetricsError::AlreadyInitialized("server"));
    }

    info!("Default gRPC server metrics initialized");
    Ok(metrics)
}

/// Build the default client metrics; fails if already initialized
pub fn init_default_client_metrics(config: &MetricsConfig) -> MetricsResult<&'static ClientMetrics> {
    let mut created = false;
    let metrics = DEFAULT_CLIENT_METRICS.get_or_try_init(|| {
        created = true;
        ClientMetrics::with_config(config)
    })?;
    if !created {
        return Err(MetricsError::AlreadyInitialized("client"));
    }

    info!("Default gRPC client metrics initialized");
    Ok(metrics)
}

pub fn default_server_metrics() -> Option<&'static ServerMetrics> {
    DEFAULT_SERVER_METRICS.get()
}

pub fn default_client_metrics() -> Option<&'static ClientMetrics> {
    DEFAULT_CLIENT_METRICS.get()
}

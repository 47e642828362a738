#[macro_use]
extern crate log;

use std::{net::SocketAddr, sync::Arc};

use dashboard_admin_apis::DEFAULT_DASHBOARD_CONFIG_NAME;
use kube::Client;

use api_server::{ApiState, start_api_server};
use cluster::KubeCluster;
use dashboard_config::DashboardConfigCache;
use prometheus_exporter::{init_metrics, start_prometheus_metrics_server};
use utils::env_var;

mod api_server;
mod cluster;
mod dashboard_config;
mod errors;
mod groups;
mod prometheus_exporter;
mod rollout;
mod settings;
#[cfg(test)]
mod testing;
mod utils;

/// The K8s field manager name.
const MANAGER: &'static str = "dashboard-admin";

#[derive(Clone)]
struct Configuration {
    client: Client,
    /// Namespace of the dashboard and of all ConfigMaps and workloads it manages.
    namespace: String,
    dashboard_config_name: String,
    listen_addr: SocketAddr,
    metrics_addr: SocketAddr,
}

fn socket_addr(addr_var: &str, port_var: &str, default_port: &str) -> anyhow::Result<SocketAddr> {
    let addr = env_var(addr_var).unwrap_or_else(|| "0.0.0.0".to_string());
    let port = env_var(port_var).unwrap_or_else(|| default_port.to_string());
    Ok(format!("{}:{}", addr, port).parse()?)
}

impl Configuration {
    pub fn new(client: Client) -> anyhow::Result<Self> {
        let namespace =
            env_var("NAMESPACE").unwrap_or_else(|| client.default_namespace().to_string());
        let dashboard_config_name = env_var("DASHBOARD_CONFIG_NAME")
            .unwrap_or_else(|| DEFAULT_DASHBOARD_CONFIG_NAME.to_string());
        info!(
            "Managing dashboard configuration {}/{}",
            namespace, dashboard_config_name
        );
        Ok(Configuration {
            client,
            namespace,
            dashboard_config_name,
            listen_addr: socket_addr("LISTEN_ADDR", "LISTEN_PORT", "8080")?,
            metrics_addr: socket_addr("METRICS_LISTEN_ADDR", "METRICS_LISTEN_PORT", "9000")?,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let registry = init_metrics()?;
    let client = Client::try_default().await?;
    let configuration = Configuration::new(client)?;
    let (dashboard_config, dashboard_config_reflector) = DashboardConfigCache::new(
        configuration.client.clone(),
        configuration.namespace.as_str(),
        configuration.dashboard_config_name.as_str(),
    );
    let cluster = KubeCluster::new(
        configuration.client.clone(),
        configuration.namespace.as_str(),
    );
    let state = Arc::new(ApiState::new(cluster, dashboard_config));
    info!("start API server ...");
    tokio::select! {
       r = start_api_server(configuration.listen_addr, state) => r?,
       r = dashboard_config_reflector => r?,
       r = start_prometheus_metrics_server(configuration.metrics_addr, registry) => r?,
    };
    Ok(())
}

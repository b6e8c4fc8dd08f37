//! The proxy's YAML configuration surface.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listeners: Vec<ListenerConfig>,
    pub virtual_clusters: Vec<VirtualClusterConfig>,
    /// KMS backing the record-encryption filter. Omit when no cluster
    /// encrypts.
    #[serde(default)]
    pub kms: Option<KmsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    /// Bind address, e.g. "0.0.0.0:9192".
    pub bind: String,
    /// TLS listeners resolve virtual clusters by SNI; plaintext
    /// listeners serve exactly one cluster.
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualClusterConfig {
    pub name: String,
    /// Listener this cluster is reachable through.
    pub listener: String,
    /// Upstream bootstrap address, e.g. "kafka-0.example:9092".
    pub upstream_bootstrap: String,
    #[serde(default)]
    pub downstream_tls: Option<DownstreamTlsConfig>,
    #[serde(default)]
    pub upstream_tls: Option<UpstreamTlsConfig>,
    /// Log connection lifecycle events.
    #[serde(default)]
    pub log_network: bool,
    /// Log each decoded frame at debug level.
    #[serde(default)]
    pub log_frames: bool,
    #[serde(default)]
    pub broker_address_rules: Option<BrokerAddressRules>,
    /// Statically known upstream brokers, addressed by per-broker SNI
    /// names.
    #[serde(default)]
    pub upstream_nodes: Vec<UpstreamNode>,
    /// When set, downstream connections must authenticate via
    /// SASL/PLAIN before anything is relayed.
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfigEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamTlsConfig {
    pub certificate_file: PathBuf,
    pub certificate_key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTlsConfig {
    /// Custom CA bundle; system roots are used when absent.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

/// How downstream names map onto this cluster.
///
/// The bootstrap name resolves to the upstream bootstrap; names
/// matching the broker pattern (`$(nodeId)` substituted) resolve to
/// the statically configured upstream node of that id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAddressRules {
    pub bootstrap_host: String,
    #[serde(default)]
    pub broker_host_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamNode {
    pub node_id: i32,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaslConfig {
    /// PLAIN credentials: username to password.
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfigEntry {
    /// Registered short name of the filter, e.g. "record-encryption".
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KmsConfig {
    /// Process-local KMS for development and tests.
    InMemory {
        /// KEK aliases to provision at startup.
        keks: Vec<String>,
    },
}

impl ProxyConfig {
    pub fn load(path: &Path) -> anyhow::Result<ProxyConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: ProxyConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration errors are fatal at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.listeners.is_empty(), "at least one listener required");

        let mut listener_names = std::collections::HashSet::new();
        for listener in &self.listeners {
            anyhow::ensure!(
                listener_names.insert(listener.name.as_str()),
                "duplicate listener '{}'",
                listener.name
            );
            listener
                .bind
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("listener '{}' bind address", listener.name))?;
        }

        let mut cluster_names = std::collections::HashSet::new();
        let mut plaintext_listeners = std::collections::HashSet::new();
        for cluster in &self.virtual_clusters {
            anyhow::ensure!(
                cluster_names.insert(cluster.name.as_str()),
                "duplicate virtual cluster '{}'",
                cluster.name
            );
            let listener = self
                .listeners
                .iter()
                .find(|l| l.name == cluster.listener)
                .with_context(|| {
                    format!(
                        "virtual cluster '{}' references unknown listener '{}'",
                        cluster.name, cluster.listener
                    )
                })?;

            if listener.tls {
                anyhow::ensure!(
                    cluster.downstream_tls.is_some(),
                    "virtual cluster '{}' is on TLS listener '{}' but has no downstream TLS material",
                    cluster.name,
                    listener.name
                );
                anyhow::ensure!(
                    cluster.broker_address_rules.is_some(),
                    "virtual cluster '{}' is on TLS listener '{}' but has no broker address rules for SNI routing",
                    cluster.name,
                    listener.name
                );
            } else {
                anyhow::ensure!(
                    plaintext_listeners.insert(listener.name.as_str()),
                    "plaintext listener '{}' serves more than one virtual cluster",
                    listener.name
                );
            }

            host_port(&cluster.upstream_bootstrap).with_context(|| {
                format!("virtual cluster '{}' upstream bootstrap", cluster.name)
            })?;
        }
        Ok(())
    }
}

pub fn host_port(address: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .context("expected host:port")?;
    anyhow::ensure!(!host.is_empty(), "empty host in '{address}'");
    let port: u16 = port.parse().context("invalid port")?;
    Ok((host.to_string(), port))
}

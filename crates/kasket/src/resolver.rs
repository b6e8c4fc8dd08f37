//! Maps (local endpoint, SNI hostname) to a virtual cluster binding.

use crate::config::{host_port, UpstreamNode, VirtualClusterConfig};
use kasket_api::FilterFactory;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no virtual cluster bound to endpoint '{0}'")]
    UnknownEndpoint(String),
    #[error("no virtual cluster matches SNI hostname '{0}'")]
    UnknownSni(String),
    #[error("endpoint '{0}' requires SNI, but the client sent none")]
    MissingSni(String),
    #[error("virtual cluster '{0}' has no downstream TLS material")]
    NoTlsMaterial(String),
}

/// Where an accepted connection relays to.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
}

/// Runtime form of one configured virtual cluster: parsed config plus
/// the TLS server material and filter factories built at startup.
pub struct ClusterRuntime {
    pub name: Arc<str>,
    pub config: VirtualClusterConfig,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub filters: Vec<(Arc<dyn FilterFactory>, serde_json::Value)>,
}

/// The resolution of one accepted connection. Immutable per lookup.
#[derive(Clone)]
pub struct Binding {
    pub cluster: Arc<ClusterRuntime>,
    pub upstream: UpstreamTarget,
    /// True when the client addressed the bootstrap name rather than a
    /// specific broker; such connections exist to serve discovery.
    pub restrict_to_discovery: bool,
}

enum SniRule {
    Bootstrap,
    Broker(UpstreamNode),
}

struct ListenerBindings {
    /// The single cluster of a plaintext listener.
    default: Option<Arc<ClusterRuntime>>,
    /// SNI name -> (cluster, rule) for TLS listeners.
    sni: HashMap<String, (Arc<ClusterRuntime>, SniRule)>,
}

struct Table {
    listeners: HashMap<String, ListenerBindings>,
}

/// Read-mostly binding table; reconfiguration swaps the whole table
/// under the write lock.
pub struct BindingTable {
    inner: std::sync::RwLock<Table>,
}

impl BindingTable {
    pub fn new(clusters: Vec<Arc<ClusterRuntime>>) -> anyhow::Result<Self> {
        let table = Self::build(clusters)?;
        Ok(BindingTable {
            inner: std::sync::RwLock::new(table),
        })
    }

    /// Replace all bindings, e.g. after a configuration reload.
    pub fn replace(&self, clusters: Vec<Arc<ClusterRuntime>>) -> anyhow::Result<()> {
        let table = Self::build(clusters)?;
        *self.inner.write().unwrap() = table;
        Ok(())
    }

    fn build(clusters: Vec<Arc<ClusterRuntime>>) -> anyhow::Result<Table> {
        let mut listeners: HashMap<String, ListenerBindings> = HashMap::new();

        for cluster in clusters {
            let bindings = listeners
                .entry(cluster.config.listener.clone())
                .or_insert_with(|| ListenerBindings {
                    default: None,
                    sni: HashMap::new(),
                });

            match &cluster.config.broker_address_rules {
                None => {
                    anyhow::ensure!(
                        bindings.default.is_none(),
                        "listener '{}' already has a default cluster",
                        cluster.config.listener
                    );
                    bindings.default = Some(cluster.clone());
                }
                Some(rules) => {
                    bindings.sni.insert(
                        rules.bootstrap_host.clone(),
                        (cluster.clone(), SniRule::Bootstrap),
                    );
                    if let Some(pattern) = &rules.broker_host_pattern {
                        for node in &cluster.config.upstream_nodes {
                            let hostname =
                                pattern.replace("$(nodeId)", &node.node_id.to_string());
                            bindings
                                .sni
                                .insert(hostname, (cluster.clone(), SniRule::Broker(node.clone())));
                        }
                    }
                }
            }
        }
        Ok(Table { listeners })
    }

    /// Resolve a plaintext connection by its listener.
    pub fn resolve_plaintext(&self, listener: &str) -> Result<Binding, ResolveError> {
        let table = self.inner.read().unwrap();
        let bindings = table
            .listeners
            .get(listener)
            .ok_or_else(|| ResolveError::UnknownEndpoint(listener.to_string()))?;

        let cluster = bindings
            .default
            .clone()
            .ok_or_else(|| ResolveError::MissingSni(listener.to_string()))?;
        let upstream = bootstrap_target(&cluster)?;
        Ok(Binding {
            cluster,
            upstream,
            restrict_to_discovery: true,
        })
    }

    /// Resolve a TLS connection by the SNI hostname the client sent.
    /// Called from inside the SNI inspection step, before any
    /// handshake bytes are committed.
    pub fn resolve_sni(
        &self,
        listener: &str,
        sni: Option<&str>,
    ) -> Result<Binding, ResolveError> {
        let table = self.inner.read().unwrap();
        let bindings = table
            .listeners
            .get(listener)
            .ok_or_else(|| ResolveError::UnknownEndpoint(listener.to_string()))?;

        let Some(sni) = sni else {
            // SNI-less TLS can still serve a single-cluster listener.
            let cluster = bindings
                .default
                .clone()
                .ok_or_else(|| ResolveError::MissingSni(listener.to_string()))?;
            let upstream = bootstrap_target(&cluster)?;
            return Ok(Binding {
                cluster,
                upstream,
                restrict_to_discovery: true,
            });
        };

        let (cluster, rule) = bindings
            .sni
            .get(sni)
            .ok_or_else(|| ResolveError::UnknownSni(sni.to_string()))?;

        let (upstream, restrict_to_discovery) = match rule {
            SniRule::Bootstrap => (bootstrap_target(cluster)?, true),
            SniRule::Broker(node) => (
                UpstreamTarget {
                    host: node.host.clone(),
                    port: node.port,
                },
                false,
            ),
        };
        Ok(Binding {
            cluster: cluster.clone(),
            upstream,
            restrict_to_discovery,
        })
    }
}

fn bootstrap_target(cluster: &ClusterRuntime) -> Result<UpstreamTarget, ResolveError> {
    // Validated at startup; re-parse is cheap and keeps the table lean.
    let (host, port) = host_port(&cluster.config.upstream_bootstrap)
        .map_err(|_| ResolveError::UnknownEndpoint(cluster.config.upstream_bootstrap.clone()))?;
    Ok(UpstreamTarget { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerAddressRules, VirtualClusterConfig};

    fn cluster(name: &str, listener: &str, rules: Option<BrokerAddressRules>) -> Arc<ClusterRuntime> {
        Arc::new(ClusterRuntime {
            name: Arc::from(name),
            config: VirtualClusterConfig {
                name: name.to_string(),
                listener: listener.to_string(),
                upstream_bootstrap: format!("{name}-kafka.internal:9092"),
                downstream_tls: None,
                upstream_tls: None,
                log_network: false,
                log_frames: false,
                broker_address_rules: rules,
                upstream_nodes: vec![
                    UpstreamNode {
                        node_id: 0,
                        host: format!("{name}-kafka-0.internal"),
                        port: 9092,
                    },
                    UpstreamNode {
                        node_id: 1,
                        host: format!("{name}-kafka-1.internal"),
                        port: 9092,
                    },
                ],
                sasl: None,
                filters: vec![],
            },
            tls: None,
            filters: vec![],
        })
    }

    fn rules(name: &str) -> BrokerAddressRules {
        BrokerAddressRules {
            bootstrap_host: format!("{name}.kasket.example"),
            broker_host_pattern: Some(format!("broker$(nodeId).{name}.kasket.example")),
        }
    }

    #[test]
    fn bootstrap_sni_resolves_to_bootstrap_target() {
        let table =
            BindingTable::new(vec![cluster("alpha", "tls", Some(rules("alpha")))]).unwrap();

        let binding = table
            .resolve_sni("tls", Some("alpha.kasket.example"))
            .unwrap();
        assert_eq!(&*binding.cluster.name, "alpha");
        assert!(binding.restrict_to_discovery);
        assert_eq!(
            binding.upstream,
            UpstreamTarget {
                host: "alpha-kafka.internal".to_string(),
                port: 9092
            }
        );
    }

    #[test]
    fn broker_sni_resolves_to_that_node() {
        let table =
            BindingTable::new(vec![cluster("alpha", "tls", Some(rules("alpha")))]).unwrap();

        let binding = table
            .resolve_sni("tls", Some("broker1.alpha.kasket.example"))
            .unwrap();
        assert!(!binding.restrict_to_discovery);
        assert_eq!(binding.upstream.host, "alpha-kafka-1.internal");
    }

    #[test]
    fn two_clusters_multiplex_behind_one_listener() {
        let table = BindingTable::new(vec![
            cluster("alpha", "tls", Some(rules("alpha"))),
            cluster("beta", "tls", Some(rules("beta"))),
        ])
        .unwrap();

        let alpha = table
            .resolve_sni("tls", Some("alpha.kasket.example"))
            .unwrap();
        let beta = table.resolve_sni("tls", Some("beta.kasket.example")).unwrap();
        assert_eq!(&*alpha.cluster.name, "alpha");
        assert_eq!(&*beta.cluster.name, "beta");
    }

    #[test]
    fn unknown_sni_is_rejected() {
        let table =
            BindingTable::new(vec![cluster("alpha", "tls", Some(rules("alpha")))]).unwrap();

        assert!(matches!(
            table.resolve_sni("tls", Some("unknown.example")),
            Err(ResolveError::UnknownSni(_))
        ));
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let table = BindingTable::new(vec![]).unwrap();
        assert!(matches!(
            table.resolve_plaintext("nope"),
            Err(ResolveError::UnknownEndpoint(_))
        ));
        assert!(matches!(
            table.resolve_sni("nope", Some("x")),
            Err(ResolveError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn plaintext_listener_serves_its_single_cluster() {
        let table = BindingTable::new(vec![cluster("alpha", "plain", None)]).unwrap();
        let binding = table.resolve_plaintext("plain").unwrap();
        assert_eq!(&*binding.cluster.name, "alpha");
    }

    #[test]
    fn reconfiguration_swaps_bindings() {
        let table = BindingTable::new(vec![cluster("alpha", "tls", Some(rules("alpha")))]).unwrap();
        table
            .replace(vec![cluster("beta", "tls", Some(rules("beta")))])
            .unwrap();

        assert!(table.resolve_sni("tls", Some("alpha.kasket.example")).is_err());
        assert!(table.resolve_sni("tls", Some("beta.kasket.example")).is_ok());
    }
}

use anyhow::Context;
use clap::Parser;
use kasket::chain::FilterChain;
use kasket::config::{ListenerConfig, ProxyConfig, VirtualClusterConfig};
use kasket::filters::ApiVersionsIntersection;
use kasket::registry::FilterRegistry;
use kasket::resolver::{BindingTable, ClusterRuntime};
use kasket::{frontend, logging, metrics_server, registry};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::LazyConfigAcceptor;

/// A transparent, filtering proxy for the Kafka wire protocol.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Path to the proxy configuration file.
    #[arg(long, env = "KASKET_CONFIG", default_value = "kasket.yaml")]
    config: PathBuf,

    /// The port to serve prometheus metrics on.
    #[arg(long, env = "METRICS_PORT", default_value = "9190")]
    metrics_port: u16,

    /// How long to wait for a frame before closing an idle connection.
    #[arg(long, env = "IDLE_CONNECTION_TIMEOUT", value_parser = humantime::parse_duration, default_value = "60s")]
    idle_connection_timeout: std::time::Duration,

    /// Maximum number of downstream connections to allow at once.
    #[arg(long, env = "MAX_CONNECTIONS", default_value = "300")]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();

    let cli = Cli::parse();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .unwrap();

    tracing::info!("starting kasket");

    // Configuration problems, unknown filters, and invalid filter
    // capability sets are all fatal before any socket is bound.
    let config = ProxyConfig::load(&cli.config)?;
    let registry = registry::build(config.kms.as_ref())?;

    let mut clusters = Vec::new();
    for cluster in &config.virtual_clusters {
        clusters.push(build_cluster_runtime(cluster, &registry)?);
    }
    let table = Arc::new(BindingTable::new(clusters)?);

    let metrics_listener = TcpListener::bind(("::".parse::<std::net::IpAddr>()?, cli.metrics_port))
        .await
        .context("failed to bind metrics port")?;
    let metrics_router = metrics_server::build_router();
    tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_router).await.unwrap()
    });

    let cancel_token = tokio_util::sync::CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received Ctrl+C, initiating shutdown");
        ctrl_c_token.cancel();
    });

    let connection_limit = Arc::new(tokio::sync::Semaphore::new(cli.max_connections));

    let mut accept_tasks = Vec::new();
    for listener in &config.listeners {
        let tcp = TcpListener::bind(&listener.bind)
            .await
            .with_context(|| format!("failed to bind listener '{}'", listener.name))?;
        tracing::info!(listener = listener.name, bind = listener.bind, tls = listener.tls, "listening");

        let task = tokio::spawn(accept_loop(
            listener.clone(),
            tcp,
            table.clone(),
            cli.idle_connection_timeout,
            cancel_token.clone(),
            connection_limit.clone(),
        ));
        accept_tasks.push(task);
    }

    for task in accept_tasks {
        task.await??;
    }

    Ok(())
}

fn build_cluster_runtime(
    cluster: &VirtualClusterConfig,
    registry: &FilterRegistry,
) -> anyhow::Result<Arc<ClusterRuntime>> {
    let tls = match &cluster.downstream_tls {
        None => None,
        Some(tls) => {
            let certs = load_certs(&tls.certificate_file)?;
            let key = load_key(&tls.certificate_key_file)?;
            let config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
            Some(Arc::new(config))
        }
    };

    let mut filters = Vec::new();
    let mut probe_hooks = vec![(
        "api-versions-intersection".to_string(),
        ApiVersionsIntersection::hooks(),
    )];
    for entry in &cluster.filters {
        let factory = registry.get(&entry.name).with_context(|| {
            format!(
                "virtual cluster '{}' references unknown filter '{}'",
                cluster.name, entry.name
            )
        })?;
        let instance = factory.create(&entry.config).with_context(|| {
            format!(
                "virtual cluster '{}' filter '{}' failed to instantiate",
                cluster.name, entry.name
            )
        })?;
        probe_hooks.push((entry.name.clone(), instance));
        filters.push((factory, entry.config.clone()));
    }
    // Surface capability-mix violations now rather than on the first
    // connection.
    FilterChain::build(probe_hooks)
        .with_context(|| format!("virtual cluster '{}' filter chain", cluster.name))?;

    Ok(Arc::new(ClusterRuntime {
        name: Arc::from(cluster.name.as_str()),
        config: cluster.clone(),
        tls,
        filters,
    }))
}

async fn accept_loop(
    listener: ListenerConfig,
    tcp: TcpListener,
    table: Arc<BindingTable>,
    idle_timeout: std::time::Duration,
    stop: tokio_util::sync::CancellationToken,
    connection_limit: Arc<tokio::sync::Semaphore>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            accept = tcp.accept() => {
                let Ok((socket, addr)) = accept else {
                    continue;
                };
                let _ = socket.set_nodelay(true);

                if listener.tls {
                    serve_tls(&listener, socket, addr, &table, idle_timeout, &stop, &connection_limit);
                } else {
                    serve_plaintext(&listener, socket, addr, &table, idle_timeout, &stop, &connection_limit);
                }
            }
            _ = stop.cancelled() => break,
        }
    }
    Ok(())
}

fn serve_plaintext(
    listener: &ListenerConfig,
    socket: tokio::net::TcpStream,
    addr: std::net::SocketAddr,
    table: &Arc<BindingTable>,
    idle_timeout: std::time::Duration,
    stop: &tokio_util::sync::CancellationToken,
    connection_limit: &Arc<tokio::sync::Semaphore>,
) {
    let binding = match table.resolve_plaintext(&listener.name) {
        Ok(binding) => binding,
        Err(err) => {
            tracing::warn!(%err, listener = listener.name, "closing unresolvable connection");
            metrics::counter!("kasket_rejected_connections", "reason" => "resolution")
                .increment(1);
            return;
        }
    };

    tokio::spawn(frontend::serve(
        socket,
        addr,
        binding,
        idle_timeout,
        stop.child_token(),
        connection_limit.clone(),
    ));
}

fn serve_tls(
    listener: &ListenerConfig,
    socket: tokio::net::TcpStream,
    addr: std::net::SocketAddr,
    table: &Arc<BindingTable>,
    idle_timeout: std::time::Duration,
    stop: &tokio_util::sync::CancellationToken,
    connection_limit: &Arc<tokio::sync::Semaphore>,
) {
    let listener_name = listener.name.clone();
    let table = table.clone();
    let stop = stop.child_token();
    let connection_limit = connection_limit.clone();

    // The handshake runs in the connection's own task so a slow client
    // cannot stall the accept loop.
    tokio::spawn(async move {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), socket);
        let start = match acceptor.await {
            Ok(start) => start,
            Err(err) => {
                tracing::debug!(%err, "TLS client hello failed");
                return;
            }
        };

        // Virtual-cluster resolution happens inside the SNI step: an
        // unresolvable name aborts the handshake before any
        // application bytes are exchanged.
        let sni = start.client_hello().server_name().map(str::to_string);
        let binding = match table.resolve_sni(&listener_name, sni.as_deref()) {
            Ok(binding) => binding,
            Err(err) => {
                tracing::warn!(%err, listener = listener_name, "closing unresolvable TLS connection");
                metrics::counter!("kasket_rejected_connections", "reason" => "resolution")
                    .increment(1);
                return;
            }
        };
        let Some(tls_config) = binding.cluster.tls.clone() else {
            tracing::warn!(
                cluster = %binding.cluster.name,
                "cluster on a TLS listener has no TLS material"
            );
            return;
        };

        let stream = match start.into_stream(tls_config).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(%err, "TLS handshake failed");
                return;
            }
        };

        let _ = frontend::serve(stream, addr, binding, idle_timeout, stop, connection_limit).await;
    });
}

fn load_certs(path: &Path) -> io::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut io::BufReader::new(std::fs::File::open(path)?)).collect()
}

fn load_key(path: &Path) -> io::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    Ok(
        rustls_pemfile::private_key(&mut io::BufReader::new(std::fs::File::open(path)?))?
            .ok_or(io::Error::new(
                io::ErrorKind::Other,
                "no private key found".to_string(),
            ))?,
    )
}

//! The downstream side of a proxied connection.
//!
//! One task per connection owns both socket ends and every piece of
//! per-connection state; the select loop serializes all work for the
//! connection, so a slow peer in either direction naturally pauses
//! reads from the other (every write is awaited before the next read).

use crate::backend::{Backend, InFlight};
use crate::chain::{ChainDriver, FilterChain, RequestVerdict, ResponseVerdict};
use crate::codec::{self, DownstreamCodec, DownstreamItem, RequestSubscriptions};
use crate::filters::ApiVersionsIntersection;
use crate::orderer::ResponseOrderer;
use crate::resolver::Binding;
use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use kafka_protocol::messages::api_versions_response::ApiVersion;
use kafka_protocol::messages::{
    ApiKey, ApiVersionsResponse, RequestHeader, SaslAuthenticateResponse, SaslHandshakeResponse,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::ResponseError;
use kasket_api::{
    DecodedResponseFrame, FilterContext, RequestBody, RequestFrame, ResponseBody, ResponseFrame,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::Semaphore;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// Downstream connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    AwaitingFirstFrame,
    AuthGating,
    Ready,
    ConnectingUpstream,
    Relaying,
    Closing,
    Closed,
}

enum Flow {
    Continue,
    /// Graceful close: flush pending writes, then FIN.
    Close(&'static str),
}

enum Event {
    Downstream(Option<Result<DownstreamItem, kasket_api::FrameError>>),
    Upstream(Option<anyhow::Result<(InFlight, BytesMut)>>),
    Idle,
    Stop,
}

struct Connection {
    state: ConnectionState,
    binding: Binding,
    driver: ChainDriver,
    orderer: ResponseOrderer,
    authenticated_as: Option<String>,
}

/// Serve one accepted (and, for TLS listeners, already-handshaken)
/// downstream connection until either side closes.
#[tracing::instrument(
    level = "info",
    err(Debug, level = "warn"),
    skip(socket, binding, stop, connection_limit),
    fields(cluster = %binding.cluster.name, ?addr)
)]
pub async fn serve<S>(
    socket: S,
    addr: std::net::SocketAddr,
    binding: Binding,
    idle_timeout: std::time::Duration,
    stop: CancellationToken,
    connection_limit: Arc<Semaphore>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let permit = match connection_limit.try_acquire() {
        Ok(permit) => permit,
        Err(_) => {
            metrics::counter!("kasket_rejected_connections", "reason" => "over_limit")
                .increment(1);
            anyhow::bail!("connection limit reached, rejecting connection");
        }
    };

    if binding.cluster.config.log_network {
        tracing::info!("accepted client connection");
    }
    metrics::gauge!("kasket_total_connections").increment(1);

    let result = serve_inner(socket, binding, idle_timeout, stop).await;

    metrics::gauge!("kasket_total_connections").decrement(1);
    drop(permit);
    result
}

async fn serve_inner<S>(
    socket: S,
    binding: Binding,
    idle_timeout: std::time::Duration,
    stop: CancellationToken,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    // Filter instances are created per connection, from the cluster's
    // configured factories, with the built-in version clamp first.
    let mut hooks = vec![(
        "api-versions-intersection".to_string(),
        ApiVersionsIntersection::hooks(),
    )];
    for (factory, config) in &binding.cluster.filters {
        let instance = factory
            .create(config)
            .with_context(|| format!("instantiating filter '{}'", factory.short_name()))?;
        hooks.push((factory.short_name().to_string(), instance));
    }
    let chain = FilterChain::build(hooks)?;
    let subscriptions = Arc::new(RequestSubscriptions::new(chain.request_subscriptions()));

    let driver = ChainDriver::new(
        chain,
        FilterContext {
            cluster: binding.cluster.name.clone(),
            client_id: None,
        },
    );

    let (read_half, write_half) = tokio::io::split(socket);
    let mut reader = FramedRead::new(read_half, DownstreamCodec::new(subscriptions));
    let mut writer = write_half;
    let mut backend: Option<Backend> = None;

    let mut conn = Connection {
        state: ConnectionState::AwaitingFirstFrame,
        binding,
        driver,
        orderer: ResponseOrderer::new(),
        authenticated_as: None,
    };

    let close_reason = loop {
        let event = tokio::select! {
            item = reader.next() => Event::Downstream(item),
            response = async { backend.as_mut().expect("guarded by arm condition").next_response().await },
                if backend.is_some() => Event::Upstream(response),
            _ = tokio::time::sleep(idle_timeout) => Event::Idle,
            _ = stop.cancelled() => Event::Stop,
        };

        let flow = match event {
            Event::Downstream(None) => Flow::Close("client closed the connection"),
            Event::Downstream(Some(Err(err))) => {
                // Framing errors are fatal for the connection.
                tracing::error!(%err, "terminating connection on framing error");
                Flow::Close("malformed frame")
            }
            Event::Downstream(Some(Ok(item))) => {
                conn.handle_downstream(item, &mut reader, &mut writer, &mut backend)
                    .await?
            }
            Event::Upstream(None) => {
                tracing::warn!("upstream closed the connection");
                Flow::Close("upstream closed")
            }
            Event::Upstream(Some(Err(err))) => {
                tracing::error!(%err, "terminating connection on upstream error");
                Flow::Close("upstream error")
            }
            Event::Upstream(Some(Ok((entry, payload)))) => {
                conn.handle_upstream(entry, payload, &mut writer).await?
            }
            Event::Idle => Flow::Close("idle timeout"),
            Event::Stop => Flow::Close("shutdown"),
        };

        if let Flow::Close(reason) = flow {
            break reason;
        }
    };

    conn.state = ConnectionState::Closing;
    if conn.binding.cluster.config.log_network {
        tracing::info!(
            reason = close_reason,
            user = conn.authenticated_as.as_deref(),
            in_flight = conn.orderer.in_flight(),
            "closing client connection"
        );
    }
    writer.shutdown().await?;
    conn.state = ConnectionState::Closed;

    Ok(())
}

impl Connection {
    async fn handle_downstream<S>(
        &mut self,
        item: DownstreamItem,
        reader: &mut FramedRead<tokio::io::ReadHalf<S>, DownstreamCodec>,
        writer: &mut WriteHalf<S>,
        backend: &mut Option<Backend>,
    ) -> anyhow::Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        if self.state == ConnectionState::AwaitingFirstFrame {
            self.state = if self.binding.cluster.config.sasl.is_some() {
                ConnectionState::AuthGating
            } else {
                ConnectionState::Ready
            };
        }

        if self.binding.cluster.config.log_frames {
            match &item {
                DownstreamItem::Frame(RequestFrame::Decoded(frame)) => tracing::debug!(
                    api_key = ?frame.api_key(),
                    correlation_id = frame.correlation_id(),
                    "request frame"
                ),
                DownstreamItem::Frame(RequestFrame::Opaque(frame)) => tracing::debug!(
                    api_key = frame.api_key,
                    correlation_id = frame.correlation_id,
                    "opaque request frame"
                ),
                DownstreamItem::RawSasl(_) => tracing::debug!("raw SASL frame"),
            }
        }

        if self.state == ConnectionState::AuthGating {
            return self.handle_auth_gating(item, reader, writer).await;
        }

        let DownstreamItem::Frame(frame) = item else {
            tracing::error!("raw SASL bytes outside of authentication");
            return Ok(Flow::Close("protocol violation"));
        };

        match self.driver.run_request(frame).await? {
            RequestVerdict::Forward(frame) => {
                if backend.is_none() {
                    self.state = ConnectionState::ConnectingUpstream;
                    *backend = Some(
                        Backend::connect(
                            &self.binding.upstream,
                            self.binding.cluster.config.upstream_tls.as_ref(),
                        )
                        .await
                        .context("failed to connect upstream")?,
                    );
                    self.state = ConnectionState::Relaying;
                    if self.binding.cluster.config.log_network {
                        tracing::info!(
                            upstream = format!(
                                "{}:{}",
                                self.binding.upstream.host, self.binding.upstream.port
                            ),
                            discovery = self.binding.restrict_to_discovery,
                            "connected upstream"
                        );
                    }
                }

                // Response decode interest is keyed on the API alone: a
                // request nobody inspected can still have a subscribed
                // response (e.g. fetch decryption).
                let (correlation_id, decode_response) = match &frame {
                    RequestFrame::Decoded(frame) => (
                        frame.correlation_id(),
                        self.driver.chain().wants_response(frame.api_key()),
                    ),
                    RequestFrame::Opaque(frame) => (
                        frame.correlation_id,
                        ApiKey::try_from(frame.api_key)
                            .map_or(false, |key| self.driver.chain().wants_response(key)),
                    ),
                };
                self.orderer.register(correlation_id);
                backend
                    .as_mut()
                    .expect("connected above")
                    .send(&frame, decode_response)
                    .await?;
            }
            RequestVerdict::Respond(response) => {
                let correlation_id = response.correlation_id();
                self.orderer.register(correlation_id);
                let encoded = codec::encode_response(&response)?;
                let flushable = self.orderer.complete(correlation_id, encoded)?;
                self.write_frames(writer, flushable).await?;
            }
            RequestVerdict::Drop { close, reason } => {
                tracing::warn!(reason, "filter dropped request");
                if close {
                    return Ok(Flow::Close("filter closed connection"));
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_upstream<S>(
        &mut self,
        entry: InFlight,
        payload: BytesMut,
        writer: &mut WriteHalf<S>,
    ) -> anyhow::Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let frame = codec::decode_response(
            entry.api_key,
            entry.api_version,
            entry.downstream_correlation_id,
            payload,
            entry.decode_response,
        )?;

        match self.driver.run_response(frame).await? {
            ResponseVerdict::Forward(frame) => {
                let encoded = codec::encode_response(&frame)?;
                let flushable = self
                    .orderer
                    .complete(entry.downstream_correlation_id, encoded)?;
                self.write_frames(writer, flushable).await?;
            }
            ResponseVerdict::Drop { close, reason } => {
                tracing::warn!(reason, "filter dropped response");
                if close {
                    return Ok(Flow::Close("filter closed connection"));
                }
                // Unblock everything queued behind the dropped id.
                let flushable = self.orderer.cancel(entry.downstream_correlation_id)?;
                self.write_frames(writer, flushable).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_auth_gating<S>(
        &mut self,
        item: DownstreamItem,
        reader: &mut FramedRead<tokio::io::ReadHalf<S>, DownstreamCodec>,
        writer: &mut WriteHalf<S>,
    ) -> anyhow::Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let users = &self
            .binding
            .cluster
            .config
            .sasl
            .as_ref()
            .expect("gating only with SASL configured")
            .users;

        let frame = match item {
            DownstreamItem::RawSasl(auth_bytes) => {
                // Post-v0-handshake raw authentication: bare auth bytes,
                // answered without a response header.
                return match verify_plain(users, &auth_bytes) {
                    Ok(username) => {
                        tracing::debug!(username, "SASL authentication succeeded");
                        self.authenticated_as = Some(username);
                        self.state = ConnectionState::Ready;

                        let mut out = BytesMut::new();
                        out.put_i32(0);
                        writer.write_all(&out).await?;
                        writer.flush().await?;
                        Ok(Flow::Continue)
                    }
                    Err(err) => {
                        tracing::warn!(%err, "SASL authentication failed");
                        Ok(Flow::Close("authentication failed"))
                    }
                };
            }
            DownstreamItem::Frame(RequestFrame::Decoded(frame)) => frame,
            DownstreamItem::Frame(RequestFrame::Opaque(frame)) => {
                tracing::warn!(
                    api_key = frame.api_key,
                    "request before authentication completed"
                );
                return Ok(Flow::Close("unauthenticated request"));
            }
        };

        let header = frame.header.clone();
        match frame.body {
            // Clients negotiate versions before authenticating; answer
            // locally since no upstream connection exists yet.
            RequestBody::ApiVersions(_) => {
                let response = local_api_versions_response();
                self.respond_local(writer, &header, ApiKey::ApiVersions, ResponseBody::ApiVersions(response))
                    .await?;
                Ok(Flow::Continue)
            }
            RequestBody::SaslHandshake(request) => {
                let mut response = SaslHandshakeResponse::default();
                response
                    .mechanisms
                    .push(StrBytes::from_static_str("PLAIN"));
                if request.mechanism.ne("PLAIN") {
                    response.error_code = ResponseError::UnsupportedSaslMechanism.code();
                } else if header.request_api_version == 0 {
                    // v0 handshakes send the auth bytes as a raw frame.
                    reader.decoder_mut().raw_sasl = true;
                }
                self.respond_local(
                    writer,
                    &header,
                    ApiKey::SaslHandshake,
                    ResponseBody::SaslHandshake(response),
                )
                .await?;
                Ok(Flow::Continue)
            }
            RequestBody::SaslAuthenticate(request) => {
                match verify_plain(users, &request.auth_bytes) {
                    Ok(username) => {
                        tracing::debug!(username, "SASL authentication succeeded");
                        self.authenticated_as = Some(username);
                        self.state = ConnectionState::Ready;

                        self.respond_local(
                            writer,
                            &header,
                            ApiKey::SaslAuthenticate,
                            ResponseBody::SaslAuthenticate(SaslAuthenticateResponse::default()),
                        )
                        .await?;
                        Ok(Flow::Continue)
                    }
                    Err(err) => {
                        tracing::warn!(%err, "SASL authentication failed");
                        let response = SaslAuthenticateResponse::default()
                            .with_error_code(ResponseError::SaslAuthenticationFailed.code())
                            .with_error_message(Some(StrBytes::from_static_str(
                                "authentication failed",
                            )));
                        self.respond_local(
                            writer,
                            &header,
                            ApiKey::SaslAuthenticate,
                            ResponseBody::SaslAuthenticate(response),
                        )
                        .await?;
                        Ok(Flow::Close("authentication failed"))
                    }
                }
            }
            other => {
                tracing::warn!(api_key = ?other.api_key(), "request before authentication completed");
                Ok(Flow::Close("unauthenticated request"))
            }
        }
    }

    async fn respond_local<S>(
        &mut self,
        writer: &mut WriteHalf<S>,
        header: &RequestHeader,
        api_key: ApiKey,
        body: ResponseBody,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let response = ResponseFrame::Decoded(DecodedResponseFrame {
            api_key,
            api_version: header.request_api_version,
            correlation_id: header.correlation_id,
            body,
        });
        self.orderer.register(header.correlation_id);
        let encoded = codec::encode_response(&response)?;
        let flushable = self.orderer.complete(header.correlation_id, encoded)?;
        self.write_frames(writer, flushable).await
    }

    async fn write_frames<S>(
        &mut self,
        writer: &mut WriteHalf<S>,
        frames: Vec<Bytes>,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        if frames.is_empty() {
            return Ok(());
        }
        let mut written = 0u64;
        for frame in frames {
            written += frame.len() as u64;
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
        metrics::counter!("kasket_network_bytes", "direction" => "downstream").increment(written);
        Ok(())
    }
}

/// Responses generated before an upstream connection exists advertise
/// exactly the version ranges this proxy can decode.
fn local_api_versions_response() -> ApiVersionsResponse {
    let api_keys = kasket_api::proxied_api_keys()
        .iter()
        .filter_map(|api_key| {
            kasket_api::supported_versions(*api_key).map(|range| {
                ApiVersion::default()
                    .with_api_key(*api_key as i16)
                    .with_min_version(range.min)
                    .with_max_version(range.max)
            })
        })
        .collect();

    ApiVersionsResponse::default().with_api_keys(api_keys)
}

/// Parse and verify a SASL/PLAIN payload (NUL-separated authzid,
/// authcid, password) against the configured users.
fn verify_plain(users: &HashMap<String, String>, auth_bytes: &[u8]) -> anyhow::Result<String> {
    let mut it = auth_bytes.split(|b| *b == 0).map(std::str::from_utf8);

    let _authzid = it.next().context("expected SASL authzid")??;
    let username = it.next().context("expected SASL authcid (username)")??;
    let password = it.next().context("expected SASL password")??;

    match users.get(username) {
        Some(expected) if expected == password => Ok(username.to_string()),
        _ => anyhow::bail!("unknown user or bad password"),
    }
}

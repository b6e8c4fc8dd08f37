//! The upstream side of a proxied connection.
//!
//! Owns the broker socket, issues proxy-local correlation ids, and
//! maps upstream responses back to the downstream request they answer.

use crate::codec;
use crate::config::UpstreamTlsConfig;
use crate::resolver::UpstreamTarget;
use anyhow::Context;
use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use kafka_protocol::messages::ApiKey;
use kafka_protocol::protocol::buf::ByteBuf;
use kasket_api::RequestFrame;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Bookkeeping for one request relayed upstream.
pub struct InFlight {
    pub downstream_correlation_id: i32,
    pub api_key: i16,
    pub api_version: i16,
    /// Set when the chain wants the response decoded as this API.
    pub decode_response: Option<ApiKey>,
}

type BoxedRead =
    FramedRead<Pin<Box<dyn AsyncRead + Send>>, LengthDelimitedCodec>;
type BoxedWrite =
    FramedWrite<Pin<Box<dyn AsyncWrite + Send>>, LengthDelimitedCodec>;

pub struct Backend {
    reader: BoxedRead,
    writer: BoxedWrite,
    next_correlation_id: i32,
    in_flight: HashMap<i32, InFlight>,
}

fn length_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(codec::MAX_FRAME_LENGTH)
        .new_codec()
}

impl Backend {
    /// Open (and optionally TLS-wrap) the upstream connection.
    #[tracing::instrument(skip(tls))]
    pub async fn connect(
        target: &UpstreamTarget,
        tls: Option<&UpstreamTlsConfig>,
    ) -> anyhow::Result<Backend> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .with_context(|| format!("connecting upstream {}:{}", target.host, target.port))?;
        stream.set_nodelay(true)?;

        let (reader, writer): (
            Pin<Box<dyn AsyncRead + Send>>,
            Pin<Box<dyn AsyncWrite + Send>>,
        ) = match tls {
            None => {
                let (r, w) = tokio::io::split(stream);
                (Box::pin(r), Box::pin(w))
            }
            Some(config) => {
                let mut roots = RootCertStore::empty();
                match &config.ca_file {
                    Some(path) => {
                        let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
                            std::fs::File::open(path)
                                .with_context(|| format!("opening CA file {}", path.display()))?,
                        ))
                        .collect::<Result<Vec<_>, _>>()?;
                        for cert in certs {
                            roots.add(cert)?;
                        }
                    }
                    None => {
                        for cert in rustls_native_certs::load_native_certs()? {
                            roots.add(cert)?;
                        }
                    }
                }

                let tls_config = ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                let connector = TlsConnector::from(Arc::new(tls_config));
                let server_name = ServerName::try_from(target.host.clone())
                    .context("upstream host is not a valid TLS server name")?;

                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .context("upstream TLS handshake")?;
                let (r, w) = tokio::io::split(stream);
                (Box::pin(r), Box::pin(w))
            }
        };

        tracing::debug!(host = target.host, port = target.port, "connected upstream");

        Ok(Backend {
            reader: FramedRead::new(reader, length_codec()),
            writer: FramedWrite::new(writer, length_codec()),
            next_correlation_id: 0,
            in_flight: HashMap::new(),
        })
    }

    /// Relay a request upstream under a proxy-issued correlation id.
    pub async fn send(&mut self, frame: &RequestFrame, decode_response: bool) -> anyhow::Result<()> {
        let upstream_id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);

        let (downstream_id, api_key_code, api_version) = match frame {
            RequestFrame::Decoded(frame) => (
                frame.correlation_id(),
                frame.api_key() as i16,
                frame.api_version(),
            ),
            RequestFrame::Opaque(frame) => {
                (frame.correlation_id, frame.api_key, frame.api_version)
            }
        };
        let decode_response = if decode_response {
            ApiKey::try_from(api_key_code)
                .ok()
                .filter(|key| kasket_api::is_proxied(*key))
        } else {
            None
        };

        let payload = codec::encode_request(frame, upstream_id)?;
        self.in_flight.insert(
            upstream_id,
            InFlight {
                downstream_correlation_id: downstream_id,
                api_key: api_key_code,
                api_version,
                decode_response,
            },
        );

        self.writer
            .send(payload)
            .await
            .context("writing upstream request")?;
        Ok(())
    }

    /// The next upstream response payload together with the in-flight
    /// entry it answers. Returns None at upstream EOF.
    pub async fn next_response(&mut self) -> Option<anyhow::Result<(InFlight, BytesMut)>> {
        let frame = match self.reader.next().await? {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err.into())),
        };
        if frame.len() < 4 {
            return Some(Err(anyhow::anyhow!("upstream response shorter than a header")));
        }

        let upstream_id = frame.peek_bytes(0..4).get_i32();
        let Some(entry) = self.in_flight.remove(&upstream_id) else {
            return Some(Err(anyhow::anyhow!(
                "upstream response with unknown correlation id {upstream_id}"
            )));
        };
        Some(Ok((entry, frame)))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::{MetadataRequest, RequestHeader};
    use kasket_api::{DecodedRequestFrame, RequestBody};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn metadata_frame(correlation_id: i32) -> RequestFrame {
        RequestFrame::Decoded(DecodedRequestFrame {
            header: RequestHeader::default()
                .with_request_api_key(ApiKey::Metadata as i16)
                .with_request_api_version(4)
                .with_correlation_id(correlation_id),
            body: RequestBody::Metadata(MetadataRequest::default()),
        })
    }

    #[tokio::test]
    async fn rewrites_correlation_ids_and_restores_them() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A fake broker that echoes each request's correlation id back
        // in a minimal response frame.
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for _ in 0..2 {
                let mut len = [0u8; 4];
                socket.read_exact(&mut len).await.unwrap();
                let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
                socket.read_exact(&mut payload).await.unwrap();

                let cid = &payload[4..8];
                use tokio::io::AsyncWriteExt;
                socket.write_all(&8u32.to_be_bytes()).await.unwrap();
                socket.write_all(cid).await.unwrap();
                socket.write_all(b"ok!!").await.unwrap();
            }
        });

        let target = UpstreamTarget {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        };
        let mut backend = Backend::connect(&target, None).await.unwrap();

        // Two downstream requests with colliding downstream ids get
        // distinct upstream ids.
        backend.send(&metadata_frame(500), false).await.unwrap();
        backend.send(&metadata_frame(501), false).await.unwrap();
        assert_eq!(backend.in_flight(), 2);

        let (first, _) = backend.next_response().await.unwrap().unwrap();
        let (second, _) = backend.next_response().await.unwrap().unwrap();
        assert_eq!(first.downstream_correlation_id, 500);
        assert_eq!(second.downstream_correlation_id, 501);
        assert_eq!(backend.in_flight(), 0);

        broker.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_upstream_correlation_id_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            use tokio::io::AsyncWriteExt;
            socket.write_all(&4u32.to_be_bytes()).await.unwrap();
            socket.write_all(&999i32.to_be_bytes()).await.unwrap();
        });

        let target = UpstreamTarget {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        };
        let mut backend = Backend::connect(&target, None).await.unwrap();

        assert!(backend.next_response().await.unwrap().is_err());
        broker.await.unwrap();
    }
}

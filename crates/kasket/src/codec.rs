//! Kafka wire framing with selective structural decode.
//!
//! Frames are length-delimited (4-byte big-endian prefix, 128 MiB
//! cap). The decoder peeks the request header fields and only decodes
//! bodies some active filter subscribes to; everything else is carried
//! as an opaque frame and re-emitted verbatim. Encoding is symmetric.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::buf::ByteBuf;
use kafka_protocol::protocol::{Decodable, Encodable};
use kasket_api::{
    DecodedRequestFrame, DecodedResponseFrame, FrameError, OpaqueFrame, RequestBody, RequestFrame,
    ResponseBody, ResponseFrame,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::codec::{Decoder, LengthDelimitedCodec};

pub const MAX_FRAME_LENGTH: usize = 1 << 27; // 128 MiB

/// The request API keys to decode structurally: everything the chain
/// subscribes to, plus the keys the frontend itself must inspect for
/// SASL gating and version negotiation.
pub struct RequestSubscriptions {
    wanted: HashSet<i16>,
}

impl RequestSubscriptions {
    pub fn new(chain_keys: impl IntoIterator<Item = ApiKey>) -> Self {
        let mut wanted: HashSet<i16> = chain_keys.into_iter().map(|key| key as i16).collect();
        for key in [
            ApiKey::SaslHandshake,
            ApiKey::SaslAuthenticate,
            ApiKey::ApiVersions,
        ] {
            wanted.insert(key as i16);
        }
        RequestSubscriptions { wanted }
    }

    pub fn wants(&self, api_key: ApiKey) -> bool {
        self.wanted.contains(&(api_key as i16))
    }
}

fn length_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// One inbound item on the downstream side.
pub enum DownstreamItem {
    Frame(RequestFrame),
    /// SASL handshake v0 puts the connection into "raw" mode: the next
    /// frame is bare auth bytes without a request header.
    RawSasl(Bytes),
}

pub struct DownstreamCodec {
    length: LengthDelimitedCodec,
    subscriptions: Arc<RequestSubscriptions>,
    /// Set by the frontend after a v0 SASL handshake.
    pub raw_sasl: bool,
}

impl DownstreamCodec {
    pub fn new(subscriptions: Arc<RequestSubscriptions>) -> Self {
        DownstreamCodec {
            length: length_codec(),
            subscriptions,
            raw_sasl: false,
        }
    }
}

impl Decoder for DownstreamCodec {
    type Item = DownstreamItem;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DownstreamItem>, FrameError> {
        let Some(mut frame) = self.length.decode(src)? else {
            return Ok(None);
        };

        if self.raw_sasl {
            self.raw_sasl = false;
            return Ok(Some(DownstreamItem::RawSasl(frame.freeze())));
        }

        if frame.len() < 8 {
            return Err(FrameError::InvalidApiKey(-1));
        }
        let api_key_code = frame.peek_bytes(0..2).get_i16();
        let api_version = frame.peek_bytes(2..4).get_i16();
        let correlation_id = frame.peek_bytes(4..8).get_i32();

        // API keys this build does not know (or nobody subscribes to)
        // relay verbatim; framing alone is the integrity boundary.
        let decodable = ApiKey::try_from(api_key_code)
            .ok()
            .filter(|key| kasket_api::is_proxied(*key) && self.subscriptions.wants(*key));

        let Some(api_key) = decodable else {
            return Ok(Some(DownstreamItem::Frame(RequestFrame::Opaque(
                OpaqueFrame {
                    api_key: api_key_code,
                    api_version,
                    correlation_id,
                    payload: frame.freeze(),
                },
            ))));
        };

        let decoded = decode_request(api_key, api_version, frame).map_err(|err| {
            tracing::error!(?api_key, correlation_id, %err, "malformed request frame");
            err
        })?;
        Ok(Some(DownstreamItem::Frame(RequestFrame::Decoded(decoded))))
    }
}

fn decode_request(
    api_key: ApiKey,
    api_version: i16,
    mut frame: BytesMut,
) -> Result<DecodedRequestFrame, FrameError> {
    let header = RequestHeader::decode(&mut frame, api_key.request_header_version(api_version))?;
    let body = RequestBody::decode(api_key, api_version, &mut frame)?;

    if !frame.is_empty() {
        return Err(FrameError::TrailingBytes {
            api_key,
            left: frame.len(),
        });
    }
    Ok(DecodedRequestFrame { header, body })
}

/// Decode an upstream response payload (length prefix already
/// stripped). The API key and version come from the in-flight request
/// this response answers; `correlation_id` is the downstream id to
/// restore. Responses without a subscriber (`decode_as` is None) get
/// their correlation id patched in place and relay verbatim.
pub fn decode_response(
    api_key_code: i16,
    api_version: i16,
    correlation_id: i32,
    mut payload: BytesMut,
    decode_as: Option<ApiKey>,
) -> Result<ResponseFrame, FrameError> {
    let Some(api_key) = decode_as else {
        if payload.len() < 4 {
            return Err(FrameError::InvalidApiKey(api_key_code));
        }
        payload[0..4].copy_from_slice(&correlation_id.to_be_bytes());
        return Ok(ResponseFrame::Opaque(OpaqueFrame {
            api_key: api_key_code,
            api_version,
            correlation_id,
            payload: payload.freeze(),
        }));
    };

    let _header =
        ResponseHeader::decode(&mut payload, api_key.response_header_version(api_version))?;
    let body = ResponseBody::decode(api_key, api_version, &mut payload).map_err(|err| {
        tracing::error!(?api_key, correlation_id, %err, "malformed response frame");
        err
    })?;

    if !payload.is_empty() {
        return Err(FrameError::TrailingBytes {
            api_key,
            left: payload.len(),
        });
    }
    Ok(ResponseFrame::Decoded(DecodedResponseFrame {
        api_key,
        api_version,
        correlation_id,
        body,
    }))
}

/// Encode a response as a complete wire frame, length prefix included.
pub fn encode_response(frame: &ResponseFrame) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    match frame {
        ResponseFrame::Decoded(frame) => {
            buf.put_i32(0); // Length placeholder.
            let offset = buf.len();

            let header = ResponseHeader::default().with_correlation_id(frame.correlation_id);
            header.encode(
                &mut buf,
                frame.api_key.response_header_version(frame.api_version),
            )?;
            frame.body.encode(frame.api_version, &mut buf)?;

            let len = (buf.len() - offset) as u32;
            buf[..4].copy_from_slice(&len.to_be_bytes());
        }
        ResponseFrame::Opaque(frame) => {
            buf.put_u32(frame.payload.len() as u32);
            buf.extend_from_slice(&frame.payload);
        }
    }
    Ok(buf.freeze())
}

/// Encode a request payload for the upstream connection (no length
/// prefix; the upstream writer frames it), rewriting the correlation
/// id to the proxy-issued upstream id.
pub fn encode_request(frame: &RequestFrame, upstream_correlation_id: i32) -> Result<Bytes, FrameError> {
    match frame {
        RequestFrame::Decoded(frame) => {
            let mut buf = BytesMut::new();
            let mut header = frame.header.clone();
            header.correlation_id = upstream_correlation_id;
            header.encode(
                &mut buf,
                frame.api_key().request_header_version(frame.api_version()),
            )?;
            frame.body.encode(frame.api_version(), &mut buf)?;
            Ok(buf.freeze())
        }
        RequestFrame::Opaque(frame) => {
            let mut buf = BytesMut::from(&frame.payload[..]);
            if buf.len() < 8 {
                return Err(FrameError::InvalidApiKey(frame.api_key));
            }
            buf[4..8].copy_from_slice(&upstream_correlation_id.to_be_bytes());
            Ok(buf.freeze())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
    use kafka_protocol::messages::{MetadataRequest, MetadataResponse, TopicName};
    use kafka_protocol::protocol::StrBytes;

    fn wire_frame(header: &RequestHeader, api_key: ApiKey, version: i16, body: &impl Encodable) -> BytesMut {
        let mut payload = BytesMut::new();
        header
            .encode(&mut payload, api_key.request_header_version(version))
            .unwrap();
        body.encode(&mut payload, version).unwrap();

        let mut framed = BytesMut::new();
        framed.put_u32(payload.len() as u32);
        framed.extend_from_slice(&payload);
        framed
    }

    fn metadata_request_frame(correlation_id: i32) -> (RequestHeader, MetadataRequest, BytesMut) {
        let version = 4;
        let header = RequestHeader::default()
            .with_request_api_key(ApiKey::Metadata as i16)
            .with_request_api_version(version)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(StrBytes::from_static_str("test-client")));
        let body = MetadataRequest::default().with_topics(Some(vec![
            MetadataRequestTopic::default()
                .with_name(Some(TopicName(StrBytes::from_static_str("events")))),
        ]));
        let framed = wire_frame(&header, ApiKey::Metadata, version, &body);
        (header, body, framed)
    }

    #[test]
    fn subscribed_requests_decode_structurally() {
        let mut codec = DownstreamCodec::new(Arc::new(RequestSubscriptions::new([
            ApiKey::Metadata,
        ])));
        let (header, body, mut framed) = metadata_request_frame(7);

        let item = codec.decode(&mut framed).unwrap().unwrap();
        let DownstreamItem::Frame(RequestFrame::Decoded(decoded)) = item else {
            panic!("expected a decoded frame");
        };
        assert_eq!(decoded.correlation_id(), 7);
        assert_eq!(decoded.header, header);
        let RequestBody::Metadata(parsed) = decoded.body else {
            panic!("wrong body variant");
        };
        assert_eq!(parsed, body);
    }

    #[test]
    fn unsubscribed_requests_pass_through_opaque() {
        let mut codec = DownstreamCodec::new(Arc::new(RequestSubscriptions::new([])));
        let (_, _, mut framed) = metadata_request_frame(3);
        let original_payload = framed[4..].to_vec();

        let item = codec.decode(&mut framed).unwrap().unwrap();
        let DownstreamItem::Frame(RequestFrame::Opaque(opaque)) = item else {
            panic!("expected an opaque frame");
        };
        assert_eq!(opaque.api_key, ApiKey::Metadata as i16);
        assert_eq!(opaque.correlation_id, 3);
        assert_eq!(&opaque.payload[..], &original_payload[..]);
    }

    #[test]
    fn decoded_request_reencodes_to_the_same_bytes() {
        let mut codec = DownstreamCodec::new(Arc::new(RequestSubscriptions::new([
            ApiKey::Metadata,
        ])));
        let (_, _, mut framed) = metadata_request_frame(11);
        let original_payload = framed[4..].to_vec();

        let DownstreamItem::Frame(frame) = codec.decode(&mut framed).unwrap().unwrap() else {
            panic!("expected a frame");
        };
        // Correlation id preserved: re-encode with the same id.
        let encoded = encode_request(&frame, 11).unwrap();
        assert_eq!(&encoded[..], &original_payload[..]);
    }

    #[test]
    fn opaque_request_rewrites_only_the_correlation_id() {
        let mut codec = DownstreamCodec::new(Arc::new(RequestSubscriptions::new([])));
        let (_, _, mut framed) = metadata_request_frame(3);
        let original_payload = framed[4..].to_vec();

        let DownstreamItem::Frame(frame) = codec.decode(&mut framed).unwrap().unwrap() else {
            panic!("expected a frame");
        };
        let encoded = encode_request(&frame, 99).unwrap();

        assert_eq!(&encoded[0..4], &original_payload[0..4]);
        assert_eq!(&encoded[4..8], &99i32.to_be_bytes());
        assert_eq!(&encoded[8..], &original_payload[8..]);
    }

    #[test]
    fn malformed_subscribed_frame_is_an_error() {
        let mut codec = DownstreamCodec::new(Arc::new(RequestSubscriptions::new([
            ApiKey::Metadata,
        ])));
        let (_, _, mut framed) = metadata_request_frame(5);
        // Truncate the body: length prefix says less, body decode fails.
        let truncated_len = framed.len() - 3;
        framed.truncate(truncated_len);
        framed[0..4].copy_from_slice(&((truncated_len - 4) as u32).to_be_bytes());

        assert!(codec.decode(&mut framed).is_err());
    }

    #[test]
    fn unknown_api_keys_relay_opaque() {
        let mut codec = DownstreamCodec::new(Arc::new(RequestSubscriptions::new([])));

        let mut framed = BytesMut::new();
        framed.put_u32(8);
        framed.put_i16(999); // newer than this build of the proxy
        framed.put_i16(0);
        framed.put_i32(1);

        let item = codec.decode(&mut framed).unwrap().unwrap();
        let DownstreamItem::Frame(RequestFrame::Opaque(opaque)) = item else {
            panic!("expected an opaque frame");
        };
        assert_eq!(opaque.api_key, 999);
        assert_eq!(opaque.correlation_id, 1);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut codec = DownstreamCodec::new(Arc::new(RequestSubscriptions::new([])));

        let mut framed = BytesMut::new();
        framed.put_u32(4);
        framed.put_i32(0); // too short to carry a request header

        assert!(matches!(
            codec.decode(&mut framed),
            Err(FrameError::InvalidApiKey(-1))
        ));
    }

    #[test]
    fn response_round_trips_through_encode() {
        let version = 5;
        let body = MetadataResponse::default()
            .with_cluster_id(Some(StrBytes::from_static_str("cluster")))
            .with_controller_id(kafka_protocol::messages::BrokerId(1));

        let frame = ResponseFrame::Decoded(DecodedResponseFrame {
            api_key: ApiKey::Metadata,
            api_version: version,
            correlation_id: 42,
            body: ResponseBody::Metadata(body.clone()),
        });
        let wire = encode_response(&frame).unwrap();

        // Strip the length prefix and decode as the backend would.
        let payload = BytesMut::from(&wire[4..]);
        let decoded = decode_response(
            ApiKey::Metadata as i16,
            version,
            42,
            payload,
            Some(ApiKey::Metadata),
        )
        .unwrap();
        let ResponseFrame::Decoded(decoded) = decoded else {
            panic!("expected decoded response");
        };
        assert_eq!(decoded.correlation_id, 42);
        let ResponseBody::Metadata(parsed) = decoded.body else {
            panic!("wrong body variant");
        };
        assert_eq!(parsed, body);
    }

    #[test]
    fn opaque_response_gets_correlation_id_restored() {
        let mut payload = BytesMut::new();
        payload.put_i32(77); // upstream correlation id
        payload.extend_from_slice(b"opaque-body");

        let frame = decode_response(ApiKey::DescribeCluster as i16, 0, 5, payload, None).unwrap();
        let ResponseFrame::Opaque(opaque) = frame else {
            panic!("expected opaque response");
        };
        assert_eq!(opaque.correlation_id, 5);
        assert_eq!(&opaque.payload[0..4], &5i32.to_be_bytes());
        assert_eq!(&opaque.payload[4..], b"opaque-body");
    }
}

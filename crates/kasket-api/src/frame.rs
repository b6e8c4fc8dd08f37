use crate::{RequestBody, ResponseBody};
use bytes::Bytes;
use kafka_protocol::messages::{ApiKey, RequestHeader};

/// A request decoded into structural form, as presented to filters.
#[derive(Debug, Clone)]
pub struct DecodedRequestFrame {
    pub header: RequestHeader,
    pub body: RequestBody,
}

impl DecodedRequestFrame {
    pub fn api_key(&self) -> ApiKey {
        self.body.api_key()
    }

    pub fn api_version(&self) -> i16 {
        self.header.request_api_version
    }

    pub fn correlation_id(&self) -> i32 {
        self.header.correlation_id
    }
}

/// A response decoded into structural form.
///
/// Response frames on the wire carry only a correlation id; the API key
/// and version are recovered from the in-flight request they answer.
#[derive(Debug, Clone)]
pub struct DecodedResponseFrame {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub body: ResponseBody,
}

/// A frame no active filter subscribes to: header fields are peeked for
/// routing, the payload (header included) is relayed verbatim.
#[derive(Debug, Clone)]
pub struct OpaqueFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub enum RequestFrame {
    Decoded(DecodedRequestFrame),
    Opaque(OpaqueFrame),
}

impl RequestFrame {
    pub fn correlation_id(&self) -> i32 {
        match self {
            RequestFrame::Decoded(frame) => frame.correlation_id(),
            RequestFrame::Opaque(frame) => frame.correlation_id,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResponseFrame {
    Decoded(DecodedResponseFrame),
    Opaque(OpaqueFrame),
}

impl ResponseFrame {
    pub fn correlation_id(&self) -> i32 {
        match self {
            ResponseFrame::Decoded(frame) => frame.correlation_id,
            ResponseFrame::Opaque(frame) => frame.correlation_id,
        }
    }
}

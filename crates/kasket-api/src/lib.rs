//! The filter-facing API of the Kasket proxy: the frame model seen by
//! filters, the table of structurally-decoded ("proxied") Kafka APIs,
//! and the traits a filter implements to intercept traffic.

mod body;
pub use body::{is_proxied, proxied_api_keys, supported_versions, RequestBody, ResponseBody};

mod frame;
pub use frame::{
    DecodedRequestFrame, DecodedResponseFrame, OpaqueFrame, RequestFrame, ResponseFrame,
};

mod filter;
pub use filter::{
    ApiKeyHook, FilterContext, FilterFactory, FilterHooks, RequestFilter, RequestOutcome,
    ResponseFilter, ResponseOutcome,
};

/// Errors raised while decoding or re-encoding Kafka wire frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid request API key {0}")]
    InvalidApiKey(i16),
    #[error("API {0:?} is not structurally decoded by this proxy")]
    UnsupportedApi(kafka_protocol::messages::ApiKey),
    #[error("frame has {left} bytes remaining after decoding {api_key:?}")]
    TrailingBytes {
        api_key: kafka_protocol::messages::ApiKey,
        left: usize,
    },
    #[error("failed to decode frame")]
    Decode(anyhow::Error),
    #[error("failed to encode frame")]
    Encode(anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

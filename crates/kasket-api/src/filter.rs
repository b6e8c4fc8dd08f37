use crate::{DecodedRequestFrame, DecodedResponseFrame, ResponseBody};
use async_trait::async_trait;
use kafka_protocol::messages::ApiKey;
use kafka_protocol::protocol::StrBytes;
use std::sync::Arc;

/// Per-connection context handed to every filter invocation.
#[derive(Debug, Clone)]
pub struct FilterContext {
    /// Name of the virtual cluster this connection resolved to.
    pub cluster: Arc<str>,
    /// The client id from the most recent request header, if any.
    pub client_id: Option<StrBytes>,
}

/// What a filter decided to do with a request.
pub enum RequestOutcome {
    /// Hand the (possibly modified) request to the next filter, and
    /// ultimately to the upstream broker.
    Forward(DecodedRequestFrame),
    /// Answer the request locally. The generated response traverses the
    /// response hooks of the filters that preceded this one, in reverse,
    /// before being written downstream in arrival order.
    ShortCircuit(ResponseBody),
    /// Drop the request. `close` escalates to closing the connection.
    Fail { close: bool, reason: String },
}

/// What a filter decided to do with a response.
pub enum ResponseOutcome {
    Forward(DecodedResponseFrame),
    Fail { close: bool, reason: String },
}

/// A filter hook over request frames of any API key it wants.
#[async_trait]
pub trait RequestFilter: Send {
    /// Which request API keys this hook intercepts. Keys outside the
    /// proxied-API table are rejected at chain construction.
    fn wants_request(&self, api_key: ApiKey) -> bool;

    async fn on_request(
        &mut self,
        cx: &mut FilterContext,
        frame: DecodedRequestFrame,
    ) -> anyhow::Result<RequestOutcome>;
}

/// A filter hook over response frames of any API key it wants.
#[async_trait]
pub trait ResponseFilter: Send {
    fn wants_response(&self, api_key: ApiKey) -> bool;

    async fn on_response(
        &mut self,
        cx: &mut FilterContext,
        frame: DecodedResponseFrame,
    ) -> anyhow::Result<ResponseOutcome>;
}

/// A hook bound to exactly one API key.
pub enum ApiKeyHook {
    Request(ApiKey, Box<dyn RequestFilter>),
    Response(ApiKey, Box<dyn ResponseFilter>),
}

impl ApiKeyHook {
    pub fn api_key(&self) -> ApiKey {
        match self {
            ApiKeyHook::Request(key, _) | ApiKeyHook::Response(key, _) => *key,
        }
    }
}

/// The hooks one configured filter contributes to a chain.
///
/// Exactly one of the three capability categories may be populated:
/// `sub_filters` (a composite, flattened with recursion limit 2),
/// `request`/`response` (a generic filter), or `specific` (per-API-key
/// hooks). Mixing categories is rejected when the chain is built.
#[derive(Default)]
pub struct FilterHooks {
    pub sub_filters: Vec<FilterHooks>,
    pub request: Option<Box<dyn RequestFilter>>,
    pub response: Option<Box<dyn ResponseFilter>>,
    pub specific: Vec<ApiKeyHook>,
}

impl FilterHooks {
    pub fn composite(sub_filters: Vec<FilterHooks>) -> Self {
        FilterHooks {
            sub_filters,
            ..Default::default()
        }
    }

    pub fn generic(
        request: Option<Box<dyn RequestFilter>>,
        response: Option<Box<dyn ResponseFilter>>,
    ) -> Self {
        FilterHooks {
            request,
            response,
            ..Default::default()
        }
    }

    pub fn specific(hooks: Vec<ApiKeyHook>) -> Self {
        FilterHooks {
            specific: hooks,
            ..Default::default()
        }
    }
}

/// Instantiates a configured filter for each new connection.
///
/// Factories are registered per virtual cluster; `create` runs lazily,
/// on the connection's first frame.
pub trait FilterFactory: Send + Sync {
    fn short_name(&self) -> &str;

    fn config_schema(&self) -> schemars::schema::RootSchema;

    fn create(&self, config: &serde_json::Value) -> anyhow::Result<FilterHooks>;
}

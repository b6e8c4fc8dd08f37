//! Built-in filter clamping ApiVersions responses to what this proxy
//! can re-encode.
//!
//! The upstream broker may advertise newer versions of a proxied API
//! than the codec supports; letting a client negotiate one of those
//! would make its frames undecodable here. APIs the proxy relays
//! opaquely are left untouched.

use async_trait::async_trait;
use kafka_protocol::messages::ApiKey;
use kasket_api::{
    DecodedResponseFrame, FilterContext, FilterHooks, ResponseBody, ResponseFilter,
    ResponseOutcome,
};

pub struct ApiVersionsIntersection;

impl ApiVersionsIntersection {
    pub fn hooks() -> FilterHooks {
        FilterHooks::generic(None, Some(Box::new(ApiVersionsIntersection)))
    }
}

#[async_trait]
impl ResponseFilter for ApiVersionsIntersection {
    fn wants_response(&self, api_key: ApiKey) -> bool {
        api_key == ApiKey::ApiVersions
    }

    async fn on_response(
        &mut self,
        _cx: &mut FilterContext,
        mut frame: DecodedResponseFrame,
    ) -> anyhow::Result<ResponseOutcome> {
        let ResponseBody::ApiVersions(ref mut response) = frame.body else {
            return Ok(ResponseOutcome::Forward(frame));
        };

        response.api_keys.retain_mut(|version| {
            let Ok(api_key) = ApiKey::try_from(version.api_key) else {
                // Unknown to this build of the proxy; relayed opaquely.
                return true;
            };
            let Some(supported) = kasket_api::supported_versions(api_key) else {
                return true;
            };
            version.min_version = version.min_version.max(supported.min);
            version.max_version = version.max_version.min(supported.max);
            version.min_version <= version.max_version
        });

        Ok(ResponseOutcome::Forward(frame))
    }
}

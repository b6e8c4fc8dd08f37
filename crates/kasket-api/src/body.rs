use crate::FrameError;
use bytes::BytesMut;
use kafka_protocol::messages::*;
use kafka_protocol::protocol::{Decodable, Encodable, Message, VersionRange};

/// The set of Kafka APIs this proxy can decode into structural form.
///
/// Requests and responses for any other API key are relayed verbatim as
/// opaque frames; a filter asking to intercept one of those is rejected
/// when the chain is built.
macro_rules! proxied_apis {
    ($mac:ident) => {
        $mac! {
            (Produce, ProduceRequest, ProduceResponse),
            (Fetch, FetchRequest, FetchResponse),
            (ListOffsets, ListOffsetsRequest, ListOffsetsResponse),
            (Metadata, MetadataRequest, MetadataResponse),
            (OffsetCommit, OffsetCommitRequest, OffsetCommitResponse),
            (OffsetFetch, OffsetFetchRequest, OffsetFetchResponse),
            (FindCoordinator, FindCoordinatorRequest, FindCoordinatorResponse),
            (JoinGroup, JoinGroupRequest, JoinGroupResponse),
            (Heartbeat, HeartbeatRequest, HeartbeatResponse),
            (LeaveGroup, LeaveGroupRequest, LeaveGroupResponse),
            (SyncGroup, SyncGroupRequest, SyncGroupResponse),
            (DescribeGroups, DescribeGroupsRequest, DescribeGroupsResponse),
            (ListGroups, ListGroupsRequest, ListGroupsResponse),
            (SaslHandshake, SaslHandshakeRequest, SaslHandshakeResponse),
            (ApiVersions, ApiVersionsRequest, ApiVersionsResponse),
            (CreateTopics, CreateTopicsRequest, CreateTopicsResponse),
            (DeleteTopics, DeleteTopicsRequest, DeleteTopicsResponse),
            (InitProducerId, InitProducerIdRequest, InitProducerIdResponse),
            (SaslAuthenticate, SaslAuthenticateRequest, SaslAuthenticateResponse),
            (DescribeConfigs, DescribeConfigsRequest, DescribeConfigsResponse),
        }
    };
}

macro_rules! define_bodies {
    ($(($key:ident, $req:ident, $resp:ident)),* $(,)?) => {
        /// A structurally decoded request body.
        #[derive(Debug, Clone)]
        pub enum RequestBody {
            $($key($req),)*
        }

        /// A structurally decoded response body.
        #[derive(Debug, Clone)]
        pub enum ResponseBody {
            $($key($resp),)*
        }

        impl RequestBody {
            pub fn api_key(&self) -> ApiKey {
                match self {
                    $(RequestBody::$key(_) => ApiKey::$key,)*
                }
            }

            pub fn decode(
                api_key: ApiKey,
                version: i16,
                buf: &mut BytesMut,
            ) -> Result<Self, FrameError> {
                match api_key {
                    $(ApiKey::$key => Ok(RequestBody::$key($req::decode(buf, version).map_err(FrameError::Decode)?)),)*
                    other => Err(FrameError::UnsupportedApi(other)),
                }
            }

            pub fn encode(&self, version: i16, buf: &mut BytesMut) -> Result<(), FrameError> {
                match self {
                    $(RequestBody::$key(body) => body.encode(buf, version).map_err(FrameError::Encode)?,)*
                }
                Ok(())
            }
        }

        impl ResponseBody {
            pub fn api_key(&self) -> ApiKey {
                match self {
                    $(ResponseBody::$key(_) => ApiKey::$key,)*
                }
            }

            pub fn decode(
                api_key: ApiKey,
                version: i16,
                buf: &mut BytesMut,
            ) -> Result<Self, FrameError> {
                match api_key {
                    $(ApiKey::$key => Ok(ResponseBody::$key($resp::decode(buf, version).map_err(FrameError::Decode)?)),)*
                    other => Err(FrameError::UnsupportedApi(other)),
                }
            }

            pub fn encode(&self, version: i16, buf: &mut BytesMut) -> Result<(), FrameError> {
                match self {
                    $(ResponseBody::$key(body) => body.encode(buf, version).map_err(FrameError::Encode)?,)*
                }
                Ok(())
            }
        }

        /// Whether `api_key` is in the proxied-API table.
        pub fn is_proxied(api_key: ApiKey) -> bool {
            matches!(api_key, $(ApiKey::$key)|*)
        }

        /// Every API key in the proxied-API table.
        pub fn proxied_api_keys() -> &'static [ApiKey] {
            &[$(ApiKey::$key),*]
        }

        /// The request version range this proxy can re-encode for `api_key`,
        /// or None if the API is relayed opaquely.
        pub fn supported_versions(api_key: ApiKey) -> Option<VersionRange> {
            match api_key {
                $(ApiKey::$key => Some(<$req as Message>::VERSIONS),)*
                _ => None,
            }
        }
    };
}

proxied_apis!(define_bodies);

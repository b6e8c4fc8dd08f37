//! The envelope-encryption filter: encrypts record batches on the
//! produce path and restores them on the fetch path.

use crate::kms::Kms;
use crate::manager::DekManager;
use crate::pool::BufferPool;
use crate::selector::TemplateKekSelector;
use crate::transform::EnvelopeTransform;
use crate::{EncryptionError, EncryptionScheme, RecordFieldName, RecordFields};
use anyhow::Context;
use async_trait::async_trait;
use kafka_protocol::messages::produce_response::{PartitionProduceResponse, TopicProduceResponse};
use kafka_protocol::messages::{ApiKey, ProduceRequest, ProduceResponse};
use kafka_protocol::ResponseError;
use kasket_api::{
    ApiKeyHook, DecodedRequestFrame, DecodedResponseFrame, FilterContext, FilterFactory,
    FilterHooks, RequestBody, RequestFilter, RequestOutcome, ResponseBody, ResponseFilter,
    ResponseOutcome,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration surface of the `record-encryption` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EncryptionConfig {
    /// Template deriving a KEK alias from a topic name;
    /// `${topicName}` is substituted.
    pub kek_selector_template: String,
    /// Which record parts to encrypt.
    #[serde(default = "default_fields")]
    pub fields: Vec<RecordFieldName>,
    /// How long one DEK may serve encryptions before rotation.
    #[serde(with = "humantime_serde", default = "default_dek_ttl")]
    #[schemars(with = "String")]
    pub dek_ttl: std::time::Duration,
    /// Encryption budget of one DEK.
    #[serde(default = "default_max_encryptions_per_dek")]
    pub max_encryptions_per_dek: u64,
}

fn default_fields() -> Vec<RecordFieldName> {
    vec![RecordFieldName::RecordValue]
}

fn default_dek_ttl() -> std::time::Duration {
    std::time::Duration::from_secs(5)
}

fn default_max_encryptions_per_dek() -> u64 {
    1 << 32
}

struct SharedState<K: Kms> {
    transform: EnvelopeTransform<K>,
    selector: TemplateKekSelector<K>,
    fields: RecordFields,
}

/// Builds `record-encryption` filter instances against one KMS.
///
/// Per distinct configuration the factory keeps a single shared state:
/// the DEK and decryptor caches must span connections so that all
/// producers of a virtual cluster draw from the same DEK lease.
pub struct RecordEncryptionFilterFactory<K: Kms> {
    kms: Arc<K>,
    pool: Arc<BufferPool>,
    shared: std::sync::Mutex<HashMap<String, Arc<SharedState<K>>>>,
}

impl<K: Kms> RecordEncryptionFilterFactory<K> {
    pub fn new(kms: Arc<K>, pool: Arc<BufferPool>) -> Self {
        RecordEncryptionFilterFactory {
            kms,
            pool,
            shared: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn shared_state(&self, config: &EncryptionConfig) -> anyhow::Result<Arc<SharedState<K>>> {
        let key = serde_json::to_string(config).context("canonicalizing filter config")?;

        let mut shared = self.shared.lock().unwrap();
        if let Some(state) = shared.get(&key) {
            return Ok(state.clone());
        }

        let fields = config
            .fields
            .iter()
            .fold(RecordFields::empty(), |acc, name| acc.union((*name).into()));
        anyhow::ensure!(!fields.is_empty(), "at least one record field is required");

        let manager = Arc::new(DekManager::new(
            self.kms.clone(),
            config.dek_ttl,
            config.max_encryptions_per_dek,
        ));
        let state = Arc::new(SharedState {
            transform: EnvelopeTransform::new(manager, self.pool.clone()),
            selector: TemplateKekSelector::new(
                self.kms.clone(),
                config.kek_selector_template.clone(),
            ),
            fields,
        });
        shared.insert(key, state.clone());
        Ok(state)
    }
}

impl<K: Kms> FilterFactory for RecordEncryptionFilterFactory<K> {
    fn short_name(&self) -> &str {
        "record-encryption"
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(EncryptionConfig)
    }

    fn create(&self, config: &serde_json::Value) -> anyhow::Result<FilterHooks> {
        let config: EncryptionConfig = serde_json::from_value(config.clone())
            .context("parsing record-encryption filter config")?;
        let state = self.shared_state(&config)?;

        Ok(FilterHooks::specific(vec![
            ApiKeyHook::Request(
                ApiKey::Produce,
                Box::new(ProduceEncryptFilter {
                    state: state.clone(),
                }),
            ),
            ApiKeyHook::Response(ApiKey::Fetch, Box::new(FetchDecryptFilter { state })),
        ]))
    }
}

struct ProduceEncryptFilter<K: Kms> {
    state: Arc<SharedState<K>>,
}

#[async_trait]
impl<K: Kms> RequestFilter for ProduceEncryptFilter<K> {
    fn wants_request(&self, api_key: ApiKey) -> bool {
        api_key == ApiKey::Produce
    }

    async fn on_request(
        &mut self,
        _cx: &mut FilterContext,
        frame: DecodedRequestFrame,
    ) -> anyhow::Result<RequestOutcome> {
        let DecodedRequestFrame { header, body } = frame;
        let mut request = match body {
            RequestBody::Produce(request) => request,
            other => {
                return Ok(RequestOutcome::Forward(DecodedRequestFrame {
                    header,
                    body: other,
                }))
            }
        };

        for topic_index in 0..request.topic_data.len() {
            let topic_name = request.topic_data[topic_index].name.to_string();

            let kek_id = match self.state.selector.select(&topic_name).await {
                Ok(kek_id) => kek_id,
                Err(err) => {
                    tracing::warn!(topic = topic_name, error = %err, "KEK resolution failed");
                    return Ok(fail_produce(
                        &request,
                        EncryptionError::Kms(err).as_produce_error(),
                    ));
                }
            };
            let scheme = EncryptionScheme {
                kek_id,
                fields: self.state.fields,
            };

            for partition_index in 0..request.topic_data[topic_index].partition_data.len() {
                let partition = &mut request.topic_data[topic_index].partition_data[partition_index];
                let partition_id = partition.index;
                let Some(records) = partition.records.take() else {
                    continue;
                };
                match self
                    .state
                    .transform
                    .encrypt_batch(&topic_name, partition_id, &scheme, &records)
                    .await
                {
                    Ok(encrypted) => {
                        request.topic_data[topic_index].partition_data[partition_index].records =
                            Some(encrypted);
                    }
                    Err(err) => {
                        tracing::warn!(
                            topic = topic_name,
                            partition = partition_id,
                            error = %err,
                            "record encryption failed"
                        );
                        return Ok(fail_produce(&request, err.as_produce_error()));
                    }
                }
            }
        }

        Ok(RequestOutcome::Forward(DecodedRequestFrame {
            header,
            body: RequestBody::Produce(request),
        }))
    }
}

/// Fail a produce request without partial output: every partition of
/// the request gets the mapped error code. With acks=0 there is no
/// response to carry the error, so the connection is closed instead.
fn fail_produce(request: &ProduceRequest, error: ResponseError) -> RequestOutcome {
    if request.acks == 0 {
        return RequestOutcome::Fail {
            close: true,
            reason: format!("record encryption failed on an acks=0 produce: {error:?}"),
        };
    }

    let responses = request
        .topic_data
        .iter()
        .map(|topic| {
            TopicProduceResponse::default()
                .with_name(topic.name.clone())
                .with_partition_responses(
                    topic
                        .partition_data
                        .iter()
                        .map(|partition| {
                            PartitionProduceResponse::default()
                                .with_index(partition.index)
                                .with_error_code(error.code())
                                .with_base_offset(-1)
                        })
                        .collect(),
                )
        })
        .collect();

    RequestOutcome::ShortCircuit(ResponseBody::Produce(
        ProduceResponse::default().with_responses(responses),
    ))
}

struct FetchDecryptFilter<K: Kms> {
    state: Arc<SharedState<K>>,
}

#[async_trait]
impl<K: Kms> ResponseFilter for FetchDecryptFilter<K> {
    fn wants_response(&self, api_key: ApiKey) -> bool {
        api_key == ApiKey::Fetch
    }

    async fn on_response(
        &mut self,
        _cx: &mut FilterContext,
        mut frame: DecodedResponseFrame,
    ) -> anyhow::Result<ResponseOutcome> {
        let ResponseBody::Fetch(ref mut response) = frame.body else {
            return Ok(ResponseOutcome::Forward(frame));
        };

        for topic in &mut response.responses {
            let topic_name = topic.topic.to_string();
            for partition in &mut topic.partitions {
                let Some(records) = partition.records.take() else {
                    continue;
                };
                match self
                    .state
                    .transform
                    .decrypt_batch(&topic_name, partition.partition_index, &records)
                    .await
                {
                    Ok(decrypted) => partition.records = Some(decrypted),
                    Err(err) => {
                        // Scoped to this partition; the fetch response
                        // itself survives.
                        tracing::warn!(
                            topic = topic_name,
                            partition = partition.partition_index,
                            error = %err,
                            "record decryption failed"
                        );
                        partition.error_code = err.as_fetch_error().code();
                    }
                }
            }
        }

        Ok(ResponseOutcome::Forward(frame))
    }
}

impl EncryptionError {
    /// Kafka error code surfaced on a failed produce request.
    pub fn as_produce_error(&self) -> ResponseError {
        match self {
            EncryptionError::RequestNotSatisfiable { .. } => ResponseError::PolicyViolation,
            EncryptionError::TombstoneHeaderEncryption => ResponseError::InvalidRecord,
            EncryptionError::Kms(err) if err.is_transient() => ResponseError::KafkaStorageError,
            EncryptionError::DekAcquisition(_) => ResponseError::KafkaStorageError,
            EncryptionError::UnsupportedMagic(_) | EncryptionError::BatchCodec(_) => {
                ResponseError::CorruptMessage
            }
            _ => ResponseError::UnknownServerError,
        }
    }

    /// Kafka error code surfaced on a failed fetch partition.
    pub fn as_fetch_error(&self) -> ResponseError {
        match self {
            EncryptionError::Kms(err) if err.is_transient() => ResponseError::KafkaStorageError,
            EncryptionError::DekAcquisition(_) => ResponseError::KafkaStorageError,
            EncryptionError::Integrity
            | EncryptionError::UnknownVersion(_)
            | EncryptionError::Wrapper(_)
            | EncryptionError::Parcel(_)
            | EncryptionError::BatchCodec(_) => ResponseError::CorruptMessage,
            _ => ResponseError::UnknownServerError,
        }
    }
}

//! Maps topic names to KEK ids through a user-configured template.

use crate::kms::{Kms, KmsError};
use crate::loading::LoadingMap;
use std::sync::Arc;

pub const TOPIC_NAME_PLACEHOLDER: &str = "${topicName}";

/// Derives a KEK alias from a topic name by template substitution, then
/// resolves it through the KMS. Resolutions are cached; concurrent
/// misses for one topic coalesce onto a single KMS call.
pub struct TemplateKekSelector<K: Kms> {
    kms: Arc<K>,
    template: String,
    resolved: LoadingMap<String, K::KekId>,
}

impl<K: Kms> TemplateKekSelector<K> {
    pub fn new(kms: Arc<K>, template: String) -> Self {
        TemplateKekSelector {
            kms,
            template,
            resolved: LoadingMap::new(),
        }
    }

    pub async fn select(&self, topic_name: &str) -> Result<K::KekId, KmsError> {
        let alias = self.template.replace(TOPIC_NAME_PLACEHOLDER, topic_name);

        let (generation, load) = self.resolved.get_or_load(&alias, || {
            let kms = self.kms.clone();
            let alias = alias.clone();
            async move {
                metrics::counter!("enseal_kms_requests", "op" => "resolve_kek_id").increment(1);
                Ok(kms.resolve_kek_id(&alias).await?)
            }
        });

        match load.await {
            Ok(kek_id) => Ok(kek_id),
            Err(err) => {
                self.resolved.invalidate(&alias, generation);
                match err.downcast_ref::<KmsError>() {
                    Some(KmsError::Unavailable(msg)) => Err(KmsError::Unavailable(msg.clone())),
                    Some(KmsError::UnknownAlias(alias)) => {
                        Err(KmsError::UnknownAlias(alias.clone()))
                    }
                    Some(KmsError::UnknownKek(kek)) => Err(KmsError::UnknownKek(kek.clone())),
                    Some(KmsError::InvalidEdek(msg)) => Err(KmsError::InvalidEdek(msg.clone())),
                    None => Err(KmsError::Unavailable(err.to_string())),
                }
            }
        }
    }
}

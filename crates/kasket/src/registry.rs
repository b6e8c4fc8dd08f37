//! Maps configured filter names to their factories.
//!
//! Filters ship in-tree; there is no dynamic plugin discovery. The
//! record-encryption filter is available whenever a KMS is configured.

use crate::config::KmsConfig;
use enseal::filter::RecordEncryptionFilterFactory;
use enseal::pool::BufferPool;
use enseal::testing::InMemoryKms;
use kasket_api::FilterFactory;
use std::collections::HashMap;
use std::sync::Arc;

/// Scratch buffers retained per size class, shared by every
/// record-encryption filter instance in the process.
const POOLED_BUFFERS_PER_CLASS: usize = 32;

#[derive(Default)]
pub struct FilterRegistry {
    factories: HashMap<String, Arc<dyn FilterFactory>>,
}

impl FilterRegistry {
    pub fn register(&mut self, factory: Arc<dyn FilterFactory>) {
        self.factories
            .insert(factory.short_name().to_string(), factory);
    }

    pub fn get(&self, short_name: &str) -> Option<Arc<dyn FilterFactory>> {
        self.factories.get(short_name).cloned()
    }
}

pub fn build(kms: Option<&KmsConfig>) -> anyhow::Result<FilterRegistry> {
    let mut registry = FilterRegistry::default();

    if let Some(KmsConfig::InMemory { keks }) = kms {
        let kms = InMemoryKms::new();
        for alias in keks {
            kms.register_kek(alias);
        }
        let pool = BufferPool::new(POOLED_BUFFERS_PER_CLASS);
        registry.register(Arc::new(RecordEncryptionFilterFactory::new(kms, pool)));
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kms_config_enables_record_encryption() {
        let registry = build(Some(&KmsConfig::InMemory {
            keks: vec!["KEK_orders".to_string()],
        }))
        .unwrap();
        let factory = registry.get("record-encryption").unwrap();

        // The declared config schema is real and serializable.
        let schema = factory.config_schema();
        let rendered = serde_json::to_value(&schema).unwrap();
        assert!(rendered["properties"]["kek_selector_template"].is_object());
    }

    #[test]
    fn no_kms_means_no_encryption_filter() {
        let registry = build(None).unwrap();
        assert!(registry.get("record-encryption").is_none());
    }
}

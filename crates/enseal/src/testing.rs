//! An in-memory KMS for tests and local development.
//!
//! KEKs are held in process memory and EDEKs are AES-GCM wrappings of
//! the DEK under the named KEK, so round trips behave like a real KMS
//! without any external service.

use crate::kms::{DekMaterial, DekPair, EdekSerde, Kms, KmsError};
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct InMemoryKms {
    keks: std::sync::RwLock<HashMap<String, [u8; 32]>>,
    generate_counts: std::sync::Mutex<HashMap<String, u64>>,
    unavailable: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct InMemoryEdek {
    kek_id: String,
    nonce: [u8; 12],
    wrapped: Bytes,
}

impl InMemoryKms {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryKms {
            keks: std::sync::RwLock::new(HashMap::new()),
            generate_counts: std::sync::Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Create a KEK addressed by `alias`. The KEK id equals the alias.
    pub fn register_kek(&self, alias: &str) {
        let mut kek = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut kek);
        self.keks.write().unwrap().insert(alias.to_string(), kek);
    }

    /// How many DEKs were generated under `kek_id`.
    pub fn generate_count(&self, kek_id: &str) -> u64 {
        self.generate_counts
            .lock()
            .unwrap()
            .get(kek_id)
            .copied()
            .unwrap_or(0)
    }

    /// Simulate a KMS outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), KmsError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KmsError::Unavailable("in-memory KMS is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Kms for InMemoryKms {
    type KekId = String;
    type Edek = InMemoryEdek;

    async fn generate_dek_pair(&self, kek_id: &String) -> Result<DekPair<InMemoryEdek>, KmsError> {
        self.check_available()?;

        let kek = *self
            .keks
            .read()
            .unwrap()
            .get(kek_id)
            .ok_or_else(|| KmsError::UnknownKek(kek_id.clone()))?;

        let mut dek = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut dek);
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let mut wrapped = BytesMut::with_capacity(dek.len() + 16);
        wrapped.extend_from_slice(&dek);
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], &mut wrapped)
            .map_err(|_| KmsError::Unavailable("wrap failure".into()))?;
        wrapped.extend_from_slice(&tag);

        *self
            .generate_counts
            .lock()
            .unwrap()
            .entry(kek_id.clone())
            .or_insert(0) += 1;

        Ok(DekPair {
            dek: DekMaterial::new(dek),
            edek: InMemoryEdek {
                kek_id: kek_id.clone(),
                nonce,
                wrapped: wrapped.freeze(),
            },
        })
    }

    async fn decrypt_edek(&self, edek: &InMemoryEdek) -> Result<DekMaterial, KmsError> {
        self.check_available()?;

        let kek = *self
            .keks
            .read()
            .unwrap()
            .get(&edek.kek_id)
            .ok_or_else(|| KmsError::UnknownKek(edek.kek_id.clone()))?;

        if edek.wrapped.len() != 32 + 16 {
            return Err(KmsError::InvalidEdek("bad wrapped length".into()));
        }
        let mut dek = [0u8; 32];
        dek.copy_from_slice(&edek.wrapped[..32]);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&edek.nonce),
                &[],
                &mut dek,
                Tag::from_slice(&edek.wrapped[32..]),
            )
            .map_err(|_| KmsError::InvalidEdek("tag verification failed".into()))?;

        Ok(DekMaterial::new(dek))
    }

    async fn resolve_kek_id(&self, alias: &str) -> Result<String, KmsError> {
        self.check_available()?;

        if self.keks.read().unwrap().contains_key(alias) {
            Ok(alias.to_string())
        } else {
            Err(KmsError::UnknownAlias(alias.to_string()))
        }
    }

    fn edek_serde(&self) -> Arc<dyn EdekSerde<InMemoryEdek>> {
        Arc::new(InMemoryEdekSerde)
    }
}

struct InMemoryEdekSerde;

impl EdekSerde<InMemoryEdek> for InMemoryEdekSerde {
    fn size_of(&self, edek: &InMemoryEdek) -> usize {
        2 + edek.kek_id.len() + 12 + 2 + edek.wrapped.len()
    }

    fn serialize(&self, edek: &InMemoryEdek, buf: &mut BytesMut) {
        buf.put_u16(edek.kek_id.len() as u16);
        buf.extend_from_slice(edek.kek_id.as_bytes());
        buf.extend_from_slice(&edek.nonce);
        buf.put_u16(edek.wrapped.len() as u16);
        buf.extend_from_slice(&edek.wrapped);
    }

    fn deserialize(&self, buf: &mut Bytes) -> Result<InMemoryEdek, KmsError> {
        let invalid = || KmsError::InvalidEdek("truncated".into());

        if buf.len() < 2 {
            return Err(invalid());
        }
        let kek_len = buf.get_u16() as usize;
        if buf.len() < kek_len + 12 + 2 {
            return Err(invalid());
        }
        let kek_id = String::from_utf8(buf.split_to(kek_len).to_vec())
            .map_err(|_| KmsError::InvalidEdek("KEK id is not utf-8".into()))?;
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&buf.split_to(12));
        let wrapped_len = buf.get_u16() as usize;
        if buf.len() < wrapped_len {
            return Err(invalid());
        }
        let wrapped = buf.split_to(wrapped_len);

        Ok(InMemoryEdek {
            kek_id,
            nonce,
            wrapped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dek_pairs_unwrap_to_the_same_material() {
        let kms = InMemoryKms::new();
        kms.register_kek("kek");

        let pair = kms.generate_dek_pair(&"kek".to_string()).await.unwrap();
        let unwrapped = kms.decrypt_edek(&pair.edek).await.unwrap();
        assert_eq!(pair.dek.key(), unwrapped.key());
    }

    #[tokio::test]
    async fn edek_serde_round_trips() {
        let kms = InMemoryKms::new();
        kms.register_kek("kek");
        let serde = kms.edek_serde();

        let pair = kms.generate_dek_pair(&"kek".to_string()).await.unwrap();
        let mut buf = BytesMut::new();
        serde.serialize(&pair.edek, &mut buf);
        assert_eq!(buf.len(), serde.size_of(&pair.edek));

        let parsed = serde.deserialize(&mut buf.freeze()).unwrap();
        assert_eq!(parsed.kek_id, pair.edek.kek_id);
        assert_eq!(parsed.wrapped, pair.edek.wrapped);

        let unwrapped = kms.decrypt_edek(&parsed).await.unwrap();
        assert_eq!(pair.dek.key(), unwrapped.key());
    }

    #[tokio::test]
    async fn unknown_alias_is_an_error() {
        let kms = InMemoryKms::new();
        assert!(matches!(
            kms.resolve_kek_id("missing").await,
            Err(KmsError::UnknownAlias(_))
        ));
    }
}

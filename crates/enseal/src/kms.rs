//! The Key Management Service interface the encryption core consumes.
//!
//! A KMS holds key encryption keys (KEKs). The proxy never sees KEK
//! material: it asks the KMS to generate a DEK together with its
//! wrapped form (the EDEK), stores the EDEK in-band with the records,
//! and hands EDEKs back to the KMS on the fetch path.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Raw DEK material handed out by a KMS. Zeroized on drop.
pub struct DekMaterial(Zeroizing<[u8; 32]>);

impl DekMaterial {
    pub fn new(bytes: [u8; 32]) -> Self {
        DekMaterial(Zeroizing::new(bytes))
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A freshly generated DEK and its KMS-wrapped form.
pub struct DekPair<E> {
    pub dek: DekMaterial,
    pub edek: E,
}

#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("KMS unavailable: {0}")]
    Unavailable(String),
    #[error("unknown KEK '{0}'")]
    UnknownKek(String),
    #[error("no KEK registered for alias '{0}'")]
    UnknownAlias(String),
    #[error("EDEK rejected by KMS: {0}")]
    InvalidEdek(String),
}

impl KmsError {
    /// Transient errors fail the in-flight request with a retriable
    /// Kafka error code; the connection survives.
    pub fn is_transient(&self) -> bool {
        matches!(self, KmsError::Unavailable(_))
    }
}

/// Declares how a KMS's opaque EDEK type is laid down in the wrapper.
pub trait EdekSerde<E>: Send + Sync {
    fn size_of(&self, edek: &E) -> usize;

    fn serialize(&self, edek: &E, buf: &mut BytesMut);

    fn deserialize(&self, buf: &mut Bytes) -> Result<E, KmsError>;
}

/// The three KMS operations the encryption core depends on, plus the
/// EDEK serde. Implementations must be thread-safe; calls may be issued
/// concurrently from many connections and are never retried here.
#[async_trait]
pub trait Kms: Send + Sync + 'static {
    type KekId: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static;
    type Edek: Clone + Send + Sync + 'static;

    /// Generate a fresh DEK under `kek_id`, returning it both raw and
    /// wrapped.
    async fn generate_dek_pair(&self, kek_id: &Self::KekId)
        -> Result<DekPair<Self::Edek>, KmsError>;

    /// Unwrap an EDEK previously produced by `generate_dek_pair`.
    async fn decrypt_edek(&self, edek: &Self::Edek) -> Result<DekMaterial, KmsError>;

    /// Resolve a KEK alias (derived from a topic name by a selector)
    /// to the KEK id it currently designates.
    async fn resolve_kek_id(&self, alias: &str) -> Result<Self::KekId, KmsError>;

    fn edek_serde(&self) -> Arc<dyn EdekSerde<Self::Edek>>;
}

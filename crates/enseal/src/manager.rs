//! DEK lifecycle: acquisition, lease accounting, rotation, and the
//! decrypt-side EDEK → decryptor cache.

use crate::context::{EncryptReservation, KeyContext, ReserveOutcome};
use crate::kms::{EdekSerde, Kms, KmsError};
use crate::loading::LoadingMap;
use crate::wrapper;
use crate::EncryptionError;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How many times one encrypt call may chase a usable key context
/// before giving up with `RequestNotSatisfiable`.
const ACQUIRE_ATTEMPTS: u32 = 3;

/// Manages per-KEK data encryption keys.
///
/// Shared across all connections of a virtual cluster: the caches are
/// internally thread-safe, and concurrent misses for one KEK coalesce
/// onto a single KMS call.
pub struct DekManager<K: Kms> {
    kms: Arc<K>,
    serde: Arc<dyn EdekSerde<K::Edek>>,
    dek_ttl: Duration,
    max_encryptions_per_dek: u64,
    contexts: LoadingMap<K::KekId, Arc<KeyContext>>,
    decryptors: LoadingMap<Bytes, Arc<Decryptor>>,
}

impl<K: Kms> DekManager<K> {
    pub fn new(kms: Arc<K>, dek_ttl: Duration, max_encryptions_per_dek: u64) -> Self {
        let serde = kms.edek_serde();
        DekManager {
            kms,
            serde,
            dek_ttl,
            max_encryptions_per_dek,
            contexts: LoadingMap::new(),
            decryptors: LoadingMap::new(),
        }
    }

    pub fn kms(&self) -> &Arc<K> {
        &self.kms
    }

    /// Reserve `n` encryptions against the current DEK for `kek_id`,
    /// rotating the DEK when it is destroyed, expired, or short on
    /// budget.
    pub(crate) async fn reserve(
        &self,
        kek_id: &K::KekId,
        n: u64,
    ) -> Result<(Bytes, EncryptReservation), EncryptionError> {
        for _ in 0..ACQUIRE_ATTEMPTS {
            let (generation, load) = self.contexts.get_or_load(kek_id, || {
                let kms = self.kms.clone();
                let serde = self.serde.clone();
                let kek_id = kek_id.clone();
                let ttl = self.dek_ttl;
                let max_encryptions = self.max_encryptions_per_dek;

                async move {
                    metrics::counter!("enseal_kms_requests", "op" => "generate_dek_pair")
                        .increment(1);
                    let pair = kms.generate_dek_pair(&kek_id).await?;

                    let mut buf = BytesMut::with_capacity(serde.size_of(&pair.edek));
                    serde.serialize(&pair.edek, &mut buf);

                    tracing::debug!(?kek_id, "generated fresh DEK");
                    Ok(Arc::new(KeyContext::new(
                        buf.freeze(),
                        pair.dek,
                        ttl,
                        max_encryptions,
                    )))
                }
            });

            let context = match load.await {
                Ok(context) => context,
                Err(err) => {
                    // A failed load must not poison the cache; the next
                    // call retries the KMS.
                    self.contexts.invalidate(kek_id, generation);
                    return Err(EncryptionError::from_shared(err));
                }
            };

            if context.is_expired(Instant::now()) {
                context.destroy();
                self.contexts.invalidate(kek_id, generation);
                metrics::counter!("enseal_dek_rotations", "reason" => "expired").increment(1);
                continue;
            }

            match context.try_reserve(n) {
                ReserveOutcome::Reserved(reservation) => {
                    return Ok((context.serialized_edek().clone(), reservation));
                }
                ReserveOutcome::Destroyed => {
                    // Another writer rotated it; the entry may already
                    // point at a successor.
                    self.contexts.invalidate(kek_id, generation);
                }
                ReserveOutcome::Exhausted => {
                    context.destroy();
                    self.contexts.invalidate(kek_id, generation);
                    metrics::counter!("enseal_dek_rotations", "reason" => "exhausted").increment(1);
                }
            }
        }

        Err(EncryptionError::RequestNotSatisfiable {
            attempts: ACQUIRE_ATTEMPTS,
        })
    }

    /// The decryptor for a serialized EDEK, unwrapping it through the
    /// KMS at most once per cache lifetime.
    pub(crate) async fn decryptor(
        &self,
        serialized_edek: &Bytes,
    ) -> Result<Arc<Decryptor>, EncryptionError> {
        let (generation, load) = self.decryptors.get_or_load(serialized_edek, || {
            let kms = self.kms.clone();
            let serde = self.serde.clone();
            let mut edek_buf = serialized_edek.clone();

            async move {
                let edek = serde.deserialize(&mut edek_buf)?;
                metrics::counter!("enseal_kms_requests", "op" => "decrypt_edek").increment(1);
                let dek = kms.decrypt_edek(&edek).await?;
                Ok(Arc::new(Decryptor::new(dek.key())))
            }
        });

        match load.await {
            Ok(decryptor) => Ok(decryptor),
            Err(err) => {
                self.decryptors.invalidate(serialized_edek, generation);
                Err(EncryptionError::from_shared(err))
            }
        }
    }
}

impl EncryptionError {
    fn from_shared(err: crate::SharedError) -> EncryptionError {
        // Surface a typed KMS error when the load failed inside the KMS.
        if let Some(kms_err) = err.downcast_ref::<KmsError>() {
            return EncryptionError::Kms(match kms_err {
                KmsError::Unavailable(msg) => KmsError::Unavailable(msg.clone()),
                KmsError::UnknownKek(kek) => KmsError::UnknownKek(kek.clone()),
                KmsError::UnknownAlias(alias) => KmsError::UnknownAlias(alias.clone()),
                KmsError::InvalidEdek(msg) => KmsError::InvalidEdek(msg.clone()),
            });
        }
        EncryptionError::DekAcquisition(err)
    }
}

/// Decrypts records written under one EDEK. Stateful: the cipher is
/// serialized by a mutex for the GCM duration of any one record.
pub struct Decryptor {
    cipher: std::sync::Mutex<Aes256Gcm>,
}

impl Decryptor {
    fn new(key: &[u8; 32]) -> Self {
        Decryptor {
            cipher: std::sync::Mutex::new(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))),
        }
    }

    /// Decrypt one wrapper's ciphertext into `out`. A tag mismatch is
    /// an integrity error scoped to that record.
    pub(crate) fn decrypt(
        &self,
        parsed: &wrapper::Wrapper,
        out: &mut BytesMut,
    ) -> Result<(), EncryptionError> {
        let start = out.len();
        out.extend_from_slice(&parsed.ciphertext);

        let cipher = self.cipher.lock().unwrap();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&parsed.iv),
                &[],
                &mut out[start..],
                Tag::from_slice(&parsed.tag),
            )
            .map_err(|_| EncryptionError::Integrity)
    }
}

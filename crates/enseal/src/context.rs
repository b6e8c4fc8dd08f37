//! Per-DEK lease bookkeeping.

use crate::kms::DekMaterial;
use crate::EncryptionError;
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use bytes::Bytes;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// An active DEK together with its lease state: the serialized EDEK
/// that names it in-band, an expiry deadline, the remaining-encryptions
/// budget, the encryptor, and the destroyed flag.
///
/// The mutex serializes the triple (destroyed, remaining, IV counter);
/// IV issue is therefore atomic with budget accounting, which is what
/// guarantees IV uniqueness up to the encryption cap.
pub(crate) struct KeyContext {
    serialized_edek: Bytes,
    expires_at: Instant,
    inner: std::sync::Mutex<ContextInner>,
}

struct ContextInner {
    cipher: Option<Aes256Gcm>,
    key: Zeroizing<[u8; 32]>,
    remaining: u64,
    iv_counter: u64,
    destroyed: bool,
}

/// Outcome of attempting to reserve encryptions against a context.
pub(crate) enum ReserveOutcome {
    Reserved(EncryptReservation),
    /// Another writer destroyed the context; retry against a fresh one.
    Destroyed,
    /// The remaining budget cannot satisfy the request.
    Exhausted,
}

/// A reserved run of encryptions: a copy of the cipher plus an
/// exclusive IV range. Taken out of the context so that record
/// encryption happens outside the context lock.
pub(crate) struct EncryptReservation {
    cipher: Aes256Gcm,
    iv_base: u64,
    count: u64,
    used: u64,
}

impl EncryptReservation {
    pub fn cipher(&self) -> &Aes256Gcm {
        &self.cipher
    }

    /// The next IV of the reserved range: four zero bytes then the
    /// big-endian counter.
    pub fn next_iv(&mut self) -> Result<[u8; 12], EncryptionError> {
        if self.used == self.count {
            return Err(EncryptionError::Cipher);
        }
        let mut iv = [0u8; 12];
        iv[4..].copy_from_slice(&(self.iv_base + self.used).to_be_bytes());
        self.used += 1;
        Ok(iv)
    }
}

impl KeyContext {
    pub fn new(
        serialized_edek: Bytes,
        dek: DekMaterial,
        ttl: Duration,
        max_encryptions: u64,
    ) -> Self {
        let key = Zeroizing::new(*dek.key());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));

        KeyContext {
            serialized_edek,
            expires_at: Instant::now() + ttl,
            inner: std::sync::Mutex::new(ContextInner {
                cipher: Some(cipher),
                key,
                remaining: max_encryptions,
                iv_counter: 0,
                destroyed: false,
            }),
        }
    }

    pub fn serialized_edek(&self) -> &Bytes {
        &self.serialized_edek
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Reserve `n` encryptions, decrementing the budget and advancing
    /// the IV counter under the lock.
    pub fn try_reserve(&self, n: u64) -> ReserveOutcome {
        let mut inner = self.inner.lock().unwrap();

        if inner.destroyed {
            return ReserveOutcome::Destroyed;
        }
        if inner.remaining < n {
            return ReserveOutcome::Exhausted;
        }

        let cipher = inner
            .cipher
            .clone()
            .expect("cipher present while not destroyed");
        let iv_base = inner.iv_counter;

        inner.remaining -= n;
        inner.iv_counter += n;

        ReserveOutcome::Reserved(EncryptReservation {
            cipher,
            iv_base,
            count: n,
            used: 0,
        })
    }

    /// Make the key material unrecoverable. Records already written
    /// keep referencing the serialized EDEK, which only the KMS can
    /// unlock. Idempotent.
    pub fn destroy(&self) {
        use zeroize::Zeroize;

        let mut inner = self.inner.lock().unwrap();
        inner.destroyed = true;
        inner.cipher = None;
        inner.key.zeroize();
    }

    #[cfg(test)]
    pub fn remaining(&self) -> u64 {
        self.inner.lock().unwrap().remaining
    }

    #[cfg(test)]
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().unwrap().destroyed
    }
}

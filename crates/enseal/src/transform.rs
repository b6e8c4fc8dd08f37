//! The record transform engine: iterates a record batch, encrypts the
//! selected fields of each record into a parcel, wraps the parcel with
//! the EDEK header, and writes the transformed batch. The decrypt path
//! mirrors it.

use crate::batch;
use crate::kms::Kms;
use crate::manager::DekManager;
use crate::parcel;
use crate::pool::BufferPool;
use crate::wrapper;
use crate::{EncryptionError, EncryptionScheme, RecordFields};
use aes_gcm::aead::AeadInPlace;
use aes_gcm::Nonce;
use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::Record;
use std::sync::Arc;

pub struct EnvelopeTransform<K: Kms> {
    manager: Arc<DekManager<K>>,
    pool: Arc<BufferPool>,
}

impl<K: Kms> EnvelopeTransform<K> {
    pub fn new(manager: Arc<DekManager<K>>, pool: Arc<BufferPool>) -> Self {
        EnvelopeTransform { manager, pool }
    }

    pub fn manager(&self) -> &Arc<DekManager<K>> {
        &self.manager
    }

    /// Encrypt every non-tombstone record of `batch` under the scheme's
    /// KEK. Tombstones pass through unchanged; batches with nothing to
    /// encrypt are returned byte-identical without touching the KMS.
    #[tracing::instrument(level = "debug", skip(self, scheme, records), fields(partition))]
    pub async fn encrypt_batch(
        &self,
        topic: &str,
        partition: i32,
        scheme: &EncryptionScheme<K::KekId>,
        records: &Bytes,
    ) -> Result<Bytes, EncryptionError> {
        if records.is_empty() || batch::is_compacted_empty(records) {
            return Ok(records.clone());
        }
        match batch::peek_magic(records) {
            Some(2) => {}
            Some(magic) => return Err(EncryptionError::UnsupportedMagic(magic)),
            None => {
                return Err(EncryptionError::BatchCodec(anyhow::anyhow!(
                    "truncated record batch"
                )))
            }
        }

        let decoded = batch::decode(records).map_err(EncryptionError::BatchCodec)?;
        if decoded.records.is_empty() {
            return Ok(records.clone());
        }

        // Header-only encryption of a tombstone would replace its null
        // value with a wrapper; reject before any key work so the batch
        // fails with no partial output.
        if !scheme.fields.contains(RecordFields::RECORD_VALUE) {
            if decoded.records.iter().any(|r| r.value.is_none()) {
                return Err(EncryptionError::TombstoneHeaderEncryption);
            }
        }

        let to_encrypt = decoded.records.iter().filter(|r| r.value.is_some()).count() as u64;
        if to_encrypt == 0 {
            return Ok(records.clone());
        }

        // The wrapper displaces the record value, so the value always
        // rides in the parcel even for header-selecting schemes.
        let parcel_fields = scheme.fields.union(RecordFields::RECORD_VALUE);

        let mut max_parcel = 0;
        for record in decoded.records.iter().filter(|r| r.value.is_some()) {
            max_parcel = max_parcel.max(parcel::size_of(parcel_fields, record)?);
        }

        let (edek, mut reservation) = self.manager.reserve(&scheme.kek_id, to_encrypt).await?;
        let max_wrapper = wrapper::size_of(edek.len(), max_parcel)?;

        let mut parcel_buf = self.pool.acquire(max_parcel);
        let mut wrapper_buf = self.pool.acquire(max_wrapper);
        let mut out_records = Vec::with_capacity(decoded.records.len());

        for record in decoded.records {
            if record.value.is_none() {
                out_records.push(record);
                continue;
            }

            parcel_buf.clear();
            parcel::write(parcel_fields, &record, &mut parcel_buf)?;

            let iv = reservation.next_iv()?;
            wrapper_buf.clear();
            wrapper::write_prefix(&edek, &iv, &mut wrapper_buf)?;
            let ciphertext_start = wrapper_buf.len();
            wrapper_buf.extend_from_slice(&parcel_buf);
            let tag = reservation
                .cipher()
                .encrypt_in_place_detached(
                    Nonce::from_slice(&iv),
                    &[],
                    &mut wrapper_buf[ciphertext_start..],
                )
                .map_err(|_| EncryptionError::Cipher)?;
            wrapper_buf.extend_from_slice(&tag);

            let mut headers = IndexMap::new();
            headers.insert(
                StrBytes::from_static_str(wrapper::ENCRYPTION_HEADER),
                Some(Bytes::from_static(&[wrapper::ENCRYPTION_VERSION_V1])),
            );
            if !scheme.fields.contains(RecordFields::RECORD_HEADER_VALUES) {
                for (key, value) in &record.headers {
                    headers.insert(key.clone(), value.clone());
                }
            }

            out_records.push(Record {
                value: Some(Bytes::copy_from_slice(&wrapper_buf)),
                headers,
                ..record
            });
        }

        metrics::counter!("enseal_record_encryptions", "topic" => topic.to_string())
            .increment(to_encrypt);

        let mut out = BytesMut::new();
        batch::encode(&out_records, decoded.compression, &mut out)
            .map_err(EncryptionError::BatchCodec)?;
        Ok(out.freeze())
    }

    /// Restore the plaintext form of every record carrying the
    /// encryption header. Batches without any such record are returned
    /// byte-identical. An integrity failure drops that one record and
    /// leaves the rest of the batch intact.
    #[tracing::instrument(level = "debug", skip(self, records), fields(partition))]
    pub async fn decrypt_batch(
        &self,
        topic: &str,
        partition: i32,
        records: &Bytes,
    ) -> Result<Bytes, EncryptionError> {
        if records.is_empty() || batch::is_compacted_empty(records) {
            return Ok(records.clone());
        }
        // Legacy message sets cannot carry the encryption header.
        if batch::peek_magic(records) != Some(2) {
            return Ok(records.clone());
        }

        let decoded = batch::decode(records).map_err(EncryptionError::BatchCodec)?;

        let header_key = StrBytes::from_static_str(wrapper::ENCRYPTION_HEADER);
        let mut max_ciphertext = 0usize;
        let mut any_encrypted = false;
        for record in &decoded.records {
            if record.headers.contains_key(&header_key) {
                any_encrypted = true;
                max_ciphertext = max_ciphertext.max(record.value.as_ref().map_or(0, |v| v.len()));
            }
        }
        if !any_encrypted {
            return Ok(records.clone());
        }

        let mut plain_buf = self.pool.acquire(max_ciphertext);
        let mut out_records = Vec::with_capacity(decoded.records.len());
        let mut decrypted = 0u64;
        let mut dropped = 0u64;

        for record in decoded.records {
            let version = match record.headers.get(&header_key) {
                None => {
                    out_records.push(record);
                    continue;
                }
                Some(Some(value)) if value.len() == 1 => value[0],
                Some(_) => return Err(EncryptionError::Wrapper("malformed encryption header")),
            };
            if version != wrapper::ENCRYPTION_VERSION_V1 {
                return Err(EncryptionError::UnknownVersion(version));
            }

            let mut value = record
                .value
                .clone()
                .ok_or(EncryptionError::Wrapper("encrypted record without value"))?;
            let parsed = wrapper::parse(&mut value)?;

            let decryptor = self.manager.decryptor(&parsed.edek).await?;

            plain_buf.clear();
            match decryptor.decrypt(&parsed, &mut plain_buf) {
                Ok(()) => {}
                Err(EncryptionError::Integrity) => {
                    // Scoped to this record; adjacent records still
                    // decrypt.
                    metrics::counter!("enseal_integrity_failures", "topic" => topic.to_string())
                        .increment(1);
                    tracing::warn!(
                        topic,
                        partition,
                        offset = record.offset,
                        "dropping record that failed integrity verification"
                    );
                    dropped += 1;
                    continue;
                }
                Err(other) => return Err(other),
            }

            let mut parcel_bytes = Bytes::copy_from_slice(&plain_buf);
            let parcel = parcel::read(&mut parcel_bytes)?;

            let value = parcel
                .value
                .ok_or(EncryptionError::Parcel("parcel does not carry the value"))?;
            let headers = match parcel.headers {
                Some(headers) => headers,
                None => {
                    let mut headers = record.headers.clone();
                    headers.shift_remove(&header_key);
                    headers
                }
            };

            decrypted += 1;
            out_records.push(Record {
                value,
                headers,
                ..record
            });
        }

        metrics::counter!("enseal_record_decryptions", "topic" => topic.to_string())
            .increment(decrypted);

        if out_records.is_empty() && dropped > 0 {
            // Every record failed verification; nothing to re-encode.
            return Err(EncryptionError::Integrity);
        }

        let mut out = BytesMut::new();
        batch::encode(&out_records, decoded.compression, &mut out)
            .map_err(EncryptionError::BatchCodec)?;
        Ok(out.freeze())
    }
}

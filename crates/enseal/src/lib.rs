//! Envelope encryption of Kafka record batches, as a Kasket filter.
//!
//! Producers' record payloads are encrypted with short-lived data
//! encryption keys (DEKs); each DEK travels with the records it
//! protected, wrapped by a Key Management Service into an EDEK the
//! proxy cannot unwrap itself. The fetch path reverses the transform.

pub mod filter;
pub mod kms;
pub mod manager;
pub mod parcel;
pub mod pool;
pub mod selector;
pub mod testing;
pub mod transform;
pub mod wrapper;

mod batch;
mod context;
mod loading;

pub use loading::SharedError;

use serde::{Deserialize, Serialize};

/// The record parts an encryption scheme may select.
///
/// Encoded positionally: bit 0 is the record value, bit 1 the record's
/// header values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFields(u16);

impl RecordFields {
    pub const RECORD_VALUE: RecordFields = RecordFields(1 << 0);
    pub const RECORD_HEADER_VALUES: RecordFields = RecordFields(1 << 1);

    const ALL: u16 = 0b11;

    pub fn empty() -> Self {
        RecordFields(0)
    }

    pub fn union(self, other: RecordFields) -> RecordFields {
        RecordFields(self.0 | other.0)
    }

    pub fn contains(self, other: RecordFields) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, EncryptionError> {
        if bits & !Self::ALL != 0 {
            return Err(EncryptionError::Parcel("unknown field bits"));
        }
        Ok(RecordFields(bits))
    }
}

/// Config-surface spelling of one [`RecordFields`] flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecordFieldName {
    RecordValue,
    RecordHeaderValues,
}

impl From<RecordFieldName> for RecordFields {
    fn from(name: RecordFieldName) -> RecordFields {
        match name {
            RecordFieldName::RecordValue => RecordFields::RECORD_VALUE,
            RecordFieldName::RecordHeaderValues => RecordFields::RECORD_HEADER_VALUES,
        }
    }
}

/// What to encrypt, and under which key hierarchy.
#[derive(Debug, Clone)]
pub struct EncryptionScheme<K> {
    pub kek_id: K,
    pub fields: RecordFields,
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    /// The per-DEK encryption budget could not satisfy this request
    /// within the retry allowance.
    #[error("no usable data encryption key after {attempts} attempts")]
    RequestNotSatisfiable { attempts: u32 },
    /// Header-only encryption of a tombstone would replace its null
    /// value and defeat compaction.
    #[error("cannot encrypt headers of a tombstone record")]
    TombstoneHeaderEncryption,
    /// AEAD tag verification failed for one record.
    #[error("record failed integrity verification")]
    Integrity,
    #[error("unknown encryption version {0}")]
    UnknownVersion(u8),
    #[error("malformed parcel: {0}")]
    Parcel(&'static str),
    #[error("malformed wrapper: {0}")]
    Wrapper(&'static str),
    #[error("cipher failure")]
    Cipher,
    #[error("record batch is not a v2 batch (magic {0})")]
    UnsupportedMagic(i8),
    #[error("failed to decode record batch")]
    BatchCodec(#[source] anyhow::Error),
    #[error(transparent)]
    Kms(#[from] kms::KmsError),
    #[error("failed to obtain data encryption key")]
    DekAcquisition(#[source] SharedError),
}

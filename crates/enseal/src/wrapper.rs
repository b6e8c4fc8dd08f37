//! The wrapper: the in-band envelope written to a transformed record's
//! value.
//!
//! Layout (encryption version 1):
//!
//! ```text
//! uvarint edek_length
//! bytes   edek_bytes       (KMS-specific opaque)
//! u8      aad_code         (0 = NONE)
//! u8      cipher_code      (0 = AES_GCM_96_128)
//! bytes   iv               (12 B)
//! bytes   ciphertext
//! bytes   auth_tag         (16 B)
//! ```
//!
//! The encryption version itself is not part of the wrapper; it rides
//! in the record header so readers know which wrapper layout to parse.

use crate::EncryptionError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::protocol::buf::ByteBuf;
use kafka_protocol::protocol::types;
use kafka_protocol::protocol::{Decoder, Encoder};

/// Name of the record header that marks an encrypted record. Its value
/// is a single encryption-version byte.
pub const ENCRYPTION_HEADER: &str = "kasket.io/encryption";

pub const ENCRYPTION_VERSION_V1: u8 = 1;

/// Only supported AAD code in V1; the code space is reserved.
pub const AAD_NONE: u8 = 0;
pub const CIPHER_AES_GCM_96_128: u8 = 0;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A parsed V1 wrapper. `ciphertext` excludes the trailing tag.
pub struct Wrapper {
    pub edek: Bytes,
    pub aad_code: u8,
    pub cipher_code: u8,
    pub iv: [u8; IV_LEN],
    pub ciphertext: Bytes,
    pub tag: [u8; TAG_LEN],
}

/// Wrapper size as a pure function of the EDEK and (maximum) parcel
/// sizes.
pub fn size_of(edek_len: usize, parcel_len: usize) -> Result<usize, EncryptionError> {
    let prefix = types::UnsignedVarInt
        .compute_size(edek_len as u32)
        .map_err(|_| EncryptionError::Wrapper("EDEK too large"))?;
    Ok(prefix + edek_len + 2 + IV_LEN + parcel_len + TAG_LEN)
}

/// Write everything up to and including the IV. The caller appends the
/// parcel bytes, encrypts them in place, and appends the tag.
pub fn write_prefix(
    edek: &Bytes,
    iv: &[u8; IV_LEN],
    buf: &mut BytesMut,
) -> Result<(), EncryptionError> {
    types::UnsignedVarInt
        .encode(buf, edek.len() as u32)
        .map_err(|_| EncryptionError::Wrapper("EDEK too large"))?;
    buf.extend_from_slice(edek);
    buf.put_u8(AAD_NONE);
    buf.put_u8(CIPHER_AES_GCM_96_128);
    buf.extend_from_slice(iv);
    Ok(())
}

/// Parse a V1 wrapper out of a record value.
pub fn parse(buf: &mut Bytes) -> Result<Wrapper, EncryptionError> {
    let edek_len = types::UnsignedVarInt
        .decode(buf)
        .map_err(|_| EncryptionError::Wrapper("truncated EDEK length"))?;
    let edek = buf
        .try_get_bytes(edek_len as usize)
        .map_err(|_| EncryptionError::Wrapper("truncated EDEK"))?;

    if buf.len() < 2 + IV_LEN + TAG_LEN {
        return Err(EncryptionError::Wrapper("truncated"));
    }
    let aad_code = buf.get_u8();
    if aad_code != AAD_NONE {
        return Err(EncryptionError::Wrapper("unsupported AAD code"));
    }
    let cipher_code = buf.get_u8();
    if cipher_code != CIPHER_AES_GCM_96_128 {
        return Err(EncryptionError::Wrapper("unsupported cipher code"));
    }

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&buf.split_to(IV_LEN));

    let ciphertext = buf.split_to(buf.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(buf);

    Ok(Wrapper {
        edek,
        aad_code,
        cipher_code,
        iv,
        ciphertext,
        tag,
    })
}

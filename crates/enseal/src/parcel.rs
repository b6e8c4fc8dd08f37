//! The parcel: the serialized set of record fields that are encrypted
//! together.
//!
//! Layout (version 1): `u8 version | u16 field bitmap | fields in bit
//! order, each length-prefixed`. The record value uses a varint length
//! (-1 for null); header values use the Kafka varint-array form.

use crate::{EncryptionError, RecordFields};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_protocol::protocol::buf::ByteBuf;
use kafka_protocol::protocol::types;
use kafka_protocol::protocol::{Decoder, Encoder, StrBytes};
use kafka_protocol::records::Record;

pub const PARCEL_VERSION_V1: u8 = 1;

/// The record fields restored from a decrypted parcel. The outer
/// `Option` distinguishes "field not carried" from a carried null.
pub struct Parcel {
    pub value: Option<Option<Bytes>>,
    pub headers: Option<IndexMap<StrBytes, Option<Bytes>>>,
}

/// Exact encoded size of the parcel for `record` under `fields`.
pub fn size_of(fields: RecordFields, record: &Record) -> Result<usize, EncryptionError> {
    let mut size = 1 + 2;

    if fields.contains(RecordFields::RECORD_VALUE) {
        size += bytes_opt_size(record.value.as_ref())?;
    }
    if fields.contains(RecordFields::RECORD_HEADER_VALUES) {
        size += headers_size(&record.headers)?;
    }
    Ok(size)
}

/// Serialize the selected fields of `record` into `buf`.
pub fn write(
    fields: RecordFields,
    record: &Record,
    buf: &mut BytesMut,
) -> Result<(), EncryptionError> {
    buf.put_u8(PARCEL_VERSION_V1);
    buf.put_u16(fields.bits());

    if fields.contains(RecordFields::RECORD_VALUE) {
        write_bytes_opt(record.value.as_ref(), buf)?;
    }
    if fields.contains(RecordFields::RECORD_HEADER_VALUES) {
        write_headers(&record.headers, buf)?;
    }
    Ok(())
}

/// Parse a decrypted parcel.
pub fn read(buf: &mut Bytes) -> Result<Parcel, EncryptionError> {
    if buf.len() < 3 {
        return Err(EncryptionError::Parcel("truncated"));
    }
    let version = buf.get_u8();
    if version != PARCEL_VERSION_V1 {
        return Err(EncryptionError::UnknownVersion(version));
    }

    let fields = RecordFields::from_bits(buf.get_u16())?;

    let value = if fields.contains(RecordFields::RECORD_VALUE) {
        Some(read_bytes_opt(buf)?)
    } else {
        None
    };
    let headers = if fields.contains(RecordFields::RECORD_HEADER_VALUES) {
        Some(read_headers(buf)?)
    } else {
        None
    };

    if !buf.is_empty() {
        return Err(EncryptionError::Parcel("trailing bytes"));
    }
    Ok(Parcel { value, headers })
}

fn bytes_opt_size(bytes: Option<&Bytes>) -> Result<usize, EncryptionError> {
    let len = bytes.map_or(-1, |b| b.len() as i32);
    let size = types::VarInt
        .compute_size(len)
        .map_err(|_| EncryptionError::Parcel("length out of range"))?;
    Ok(size + bytes.map_or(0, |b| b.len()))
}

fn write_bytes_opt(bytes: Option<&Bytes>, buf: &mut BytesMut) -> Result<(), EncryptionError> {
    let len = bytes.map_or(-1, |b| b.len() as i32);
    types::VarInt
        .encode(buf, len)
        .map_err(|_| EncryptionError::Parcel("length out of range"))?;
    if let Some(bytes) = bytes {
        buf.extend_from_slice(bytes);
    }
    Ok(())
}

fn read_bytes_opt(buf: &mut Bytes) -> Result<Option<Bytes>, EncryptionError> {
    let len = types::VarInt
        .decode(buf)
        .map_err(|_| EncryptionError::Parcel("truncated length"))?;
    match len {
        -1 => Ok(None),
        len if len < -1 => Err(EncryptionError::Parcel("negative length")),
        len => buf
            .try_get_bytes(len as usize)
            .map(Some)
            .map_err(|_| EncryptionError::Parcel("truncated bytes")),
    }
}

fn headers_size(headers: &IndexMap<StrBytes, Option<Bytes>>) -> Result<usize, EncryptionError> {
    let mut size = types::VarInt
        .compute_size(headers.len() as i32)
        .map_err(|_| EncryptionError::Parcel("header count out of range"))?;

    for (key, value) in headers {
        let key_bytes = key.as_bytes();
        size += types::VarInt
            .compute_size(key_bytes.len() as i32)
            .map_err(|_| EncryptionError::Parcel("header key out of range"))?;
        size += key_bytes.len();
        size += bytes_opt_size(value.as_ref())?;
    }
    Ok(size)
}

fn write_headers(
    headers: &IndexMap<StrBytes, Option<Bytes>>,
    buf: &mut BytesMut,
) -> Result<(), EncryptionError> {
    types::VarInt
        .encode(buf, headers.len() as i32)
        .map_err(|_| EncryptionError::Parcel("header count out of range"))?;

    for (key, value) in headers {
        let key_bytes = key.as_bytes();
        types::VarInt
            .encode(buf, key_bytes.len() as i32)
            .map_err(|_| EncryptionError::Parcel("header key out of range"))?;
        buf.extend_from_slice(key_bytes);
        write_bytes_opt(value.as_ref(), buf)?;
    }
    Ok(())
}

fn read_headers(buf: &mut Bytes) -> Result<IndexMap<StrBytes, Option<Bytes>>, EncryptionError> {
    let count = types::VarInt
        .decode(buf)
        .map_err(|_| EncryptionError::Parcel("truncated header count"))?;
    if count < 0 {
        return Err(EncryptionError::Parcel("negative header count"));
    }

    let mut headers = IndexMap::with_capacity(count as usize);
    for _ in 0..count {
        let key_len = types::VarInt
            .decode(buf)
            .map_err(|_| EncryptionError::Parcel("truncated header key length"))?;
        if key_len < 0 {
            return Err(EncryptionError::Parcel("negative header key length"));
        }
        let key_bytes = buf
            .try_get_bytes(key_len as usize)
            .map_err(|_| EncryptionError::Parcel("truncated header key"))?;
        let key = StrBytes::try_from(key_bytes)
            .map_err(|_| EncryptionError::Parcel("header key is not utf-8"))?;
        let value = read_bytes_opt(buf)?;
        headers.insert(key, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: Option<&'static [u8]>, headers: &[(&'static str, Option<&'static [u8]>)]) -> Record {
        let mut header_map = IndexMap::new();
        for (key, value) in headers {
            header_map.insert(
                StrBytes::from_static_str(key),
                value.map(Bytes::from_static),
            );
        }
        Record {
            transactional: false,
            control: false,
            partition_leader_epoch: 0,
            producer_id: -1,
            producer_epoch: -1,
            timestamp_type: kafka_protocol::records::TimestampType::Creation,
            offset: 0,
            sequence: 0,
            timestamp: 0,
            key: None,
            value: value.map(Bytes::from_static),
            headers: header_map,
        }
    }

    #[test]
    fn value_round_trips() {
        let fields = RecordFields::RECORD_VALUE;
        let record = record(Some(b"payload"), &[("h", Some(b"v"))]);

        let mut buf = BytesMut::new();
        write(fields, &record, &mut buf).unwrap();
        assert_eq!(buf.len(), size_of(fields, &record).unwrap());

        let parcel = read(&mut buf.freeze()).unwrap();
        assert_eq!(parcel.value, Some(Some(Bytes::from_static(b"payload"))));
        assert!(parcel.headers.is_none());
    }

    #[test]
    fn value_and_headers_round_trip() {
        let fields = RecordFields::RECORD_VALUE.union(RecordFields::RECORD_HEADER_VALUES);
        let record = record(Some(b"payload"), &[("a", Some(b"1")), ("b", None)]);

        let mut buf = BytesMut::new();
        write(fields, &record, &mut buf).unwrap();
        assert_eq!(buf.len(), size_of(fields, &record).unwrap());

        let parcel = read(&mut buf.freeze()).unwrap();
        assert_eq!(parcel.value, Some(Some(Bytes::from_static(b"payload"))));

        let headers = parcel.headers.unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.get(&StrBytes::from_static_str("a")),
            Some(&Some(Bytes::from_static(b"1")))
        );
        assert_eq!(headers.get(&StrBytes::from_static_str("b")), Some(&None));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_u16(1);
        assert!(matches!(
            read(&mut buf.freeze()),
            Err(EncryptionError::UnknownVersion(9))
        ));
    }

    #[test]
    fn unknown_field_bits_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(PARCEL_VERSION_V1);
        buf.put_u16(0b100);
        assert!(matches!(
            read(&mut buf.freeze()),
            Err(EncryptionError::Parcel(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let fields = RecordFields::RECORD_VALUE;
        let record = record(Some(b"x"), &[]);

        let mut buf = BytesMut::new();
        write(fields, &record, &mut buf).unwrap();
        buf.put_u8(0xff);
        assert!(matches!(
            read(&mut buf.freeze()),
            Err(EncryptionError::Parcel("trailing bytes"))
        ));
    }
}

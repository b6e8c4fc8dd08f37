//! Record-batch decode/encode around the per-record transform.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::records::{
    Compression, Record, RecordBatchDecoder, RecordBatchEncoder, RecordEncodeOptions,
};

// Offsets into the v2 batch header: baseOffset(8) batchLength(4)
// partitionLeaderEpoch(4) magic(1) crc(4) attributes(2)
// lastOffsetDelta(4) baseTimestamp(8) maxTimestamp(8) producerId(8)
// producerEpoch(2) baseSequence(4) recordCount(4).
const BATCH_LENGTH_OFFSET: usize = 8;
const MAGIC_OFFSET: usize = 16;
const ATTRIBUTES_OFFSET: usize = 21;
const RECORD_COUNT_OFFSET: usize = 57;

pub(crate) struct DecodedBatch {
    pub records: Vec<Record>,
    pub compression: Compression,
}

/// Magic byte of the first batch in `batch`, or None if too short to
/// carry one.
pub(crate) fn peek_magic(batch: &Bytes) -> Option<i8> {
    if batch.len() <= MAGIC_OFFSET {
        return None;
    }
    Some(batch[MAGIC_OFFSET] as i8)
}

/// True when `batch` is a single v2 batch whose record count is zero,
/// i.e. all its records were compacted away. Such batches relay
/// byte-identical without ever being decoded.
pub(crate) fn is_compacted_empty(batch: &Bytes) -> bool {
    if batch.len() < RECORD_COUNT_OFFSET + 4 {
        return false;
    }
    let batch_length = i32::from_be_bytes(
        batch[BATCH_LENGTH_OFFSET..BATCH_LENGTH_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    if batch.len() as i64 != 12 + batch_length as i64 {
        return false;
    }
    let count = i32::from_be_bytes(
        batch[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    count == 0
}

fn peek_compression(batch: &Bytes) -> anyhow::Result<Compression> {
    if batch.len() < ATTRIBUTES_OFFSET + 2 {
        bail!("record batch is too short to carry attributes");
    }
    let attributes = i16::from_be_bytes([batch[ATTRIBUTES_OFFSET], batch[ATTRIBUTES_OFFSET + 1]]);
    Ok(match attributes & 0x7 {
        0 => Compression::None,
        1 => Compression::Gzip,
        2 => Compression::Snappy,
        3 => Compression::Lz4,
        4 => Compression::Zstd,
        other => bail!("unknown compression code {other}"),
    })
}

/// Flatten a v2 batch into records, remembering the batch compression
/// so encode can re-apply it.
pub(crate) fn decode(batch: &Bytes) -> anyhow::Result<DecodedBatch> {
    let compression = peek_compression(batch)?;
    let mut buf = batch.clone();
    let records = RecordBatchDecoder::decode_with_custom_compression(
        &mut buf,
        Some(decompress as fn(&mut Bytes, Compression) -> anyhow::Result<Bytes>),
    )?;
    Ok(DecodedBatch {
        records,
        compression,
    })
}

pub(crate) fn encode(
    records: &[Record],
    compression: Compression,
    buf: &mut BytesMut,
) -> anyhow::Result<()> {
    let options = RecordEncodeOptions {
        compression,
        version: 2,
    };
    RecordBatchEncoder::encode(buf, records.iter(), &options, Some(compress))?;
    Ok(())
}

fn decompress(input: &mut Bytes, compression: Compression) -> anyhow::Result<Bytes> {
    match compression {
        Compression::None => Ok(input.clone()),
        Compression::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(input.reader());
            let mut out = Vec::new();
            std::io::copy(&mut decoder, &mut out)?;
            Ok(out.into())
        }
        Compression::Lz4 => {
            let mut decoder = lz4_flex::frame::FrameDecoder::new(input.reader());
            let mut out = Vec::new();
            std::io::copy(&mut decoder, &mut out)?;
            Ok(out.into())
        }
        unsupported => bail!("unsupported compression type {unsupported:?}"),
    }
}

fn compress<Output: BufMut>(
    input: &mut BytesMut,
    output: &mut Output,
    compression: Compression,
) -> anyhow::Result<()> {
    match compression {
        Compression::None => output.put(input),
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(output.writer(), flate2::Compression::default());
            std::io::copy(&mut input.reader(), &mut encoder)?;
            encoder.finish()?;
        }
        Compression::Lz4 => {
            let mut frame_info = lz4_flex::frame::FrameInfo::default();
            frame_info.block_mode = lz4_flex::frame::BlockMode::Independent;

            let mut encoder =
                lz4_flex::frame::FrameEncoder::with_frame_info(frame_info, output.writer());
            std::io::copy(&mut input.reader(), &mut encoder)?;
            encoder.finish()?;
        }
        unsupported => bail!("unsupported compression type {unsupported:?}"),
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use kafka_protocol::records::TimestampType;

    fn record(offset: i64, value: Option<&'static [u8]>) -> Record {
        Record {
            transactional: false,
            control: false,
            partition_leader_epoch: 0,
            producer_id: -1,
            producer_epoch: -1,
            timestamp_type: TimestampType::Creation,
            offset,
            sequence: offset as i32,
            timestamp: 1_700_000_000_000 + offset,
            key: None,
            value: value.map(Bytes::from_static),
            headers: IndexMap::new(),
        }
    }

    #[test]
    fn round_trips_uncompressed() {
        let records = vec![record(0, Some(b"a")), record(1, None), record(2, Some(b"c"))];

        let mut buf = BytesMut::new();
        encode(&records, Compression::None, &mut buf).unwrap();
        let encoded = buf.freeze();

        assert_eq!(peek_magic(&encoded), Some(2));
        let decoded = decode(&encoded).unwrap();
        assert!(matches!(decoded.compression, Compression::None));
        assert_eq!(decoded.records.len(), 3);
        assert_eq!(decoded.records[0].value, Some(Bytes::from_static(b"a")));
        assert_eq!(decoded.records[1].value, None);
        assert_eq!(decoded.records[2].offset, 2);
    }

    #[test]
    fn round_trips_lz4() {
        let records = vec![record(5, Some(b"payload-payload-payload"))];

        let mut buf = BytesMut::new();
        encode(&records, Compression::Lz4, &mut buf).unwrap();
        let encoded = buf.freeze();

        let decoded = decode(&encoded).unwrap();
        assert!(matches!(decoded.compression, Compression::Lz4));
        assert_eq!(
            decoded.records[0].value,
            Some(Bytes::from_static(b"payload-payload-payload"))
        );
    }

    #[test]
    fn round_trips_gzip() {
        let records = vec![record(0, Some(b"zzzzzzzzzzzzzzzz"))];

        let mut buf = BytesMut::new();
        encode(&records, Compression::Gzip, &mut buf).unwrap();

        let decoded = decode(&buf.freeze()).unwrap();
        assert!(matches!(decoded.compression, Compression::Gzip));
        assert_eq!(
            decoded.records[0].value,
            Some(Bytes::from_static(b"zzzzzzzzzzzzzzzz"))
        );
    }
}

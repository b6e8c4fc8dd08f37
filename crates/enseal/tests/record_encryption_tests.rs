//! End-to-end tests of the envelope transform against the in-memory
//! KMS: round trips, DEK rotation, and the failure-containment rules.

use bytes::{BufMut, Bytes, BytesMut};
use enseal::manager::DekManager;
use enseal::pool::BufferPool;
use enseal::testing::InMemoryKms;
use enseal::transform::EnvelopeTransform;
use enseal::wrapper::ENCRYPTION_HEADER;
use enseal::{EncryptionError, EncryptionScheme, RecordFields};
use indexmap::IndexMap;
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{
    Compression, Record, RecordBatchDecoder, RecordBatchEncoder, RecordEncodeOptions,
    TimestampType,
};
use std::sync::Arc;
use std::time::Duration;

fn record(offset: i64, value: Option<&[u8]>, headers: &[(&str, &[u8])]) -> Record {
    let mut header_map = IndexMap::new();
    for (key, value) in headers {
        header_map.insert(
            StrBytes::from_string(key.to_string()),
            Some(Bytes::copy_from_slice(value)),
        );
    }
    Record {
        transactional: false,
        control: false,
        partition_leader_epoch: 3,
        producer_id: 42,
        producer_epoch: 2,
        timestamp_type: TimestampType::Creation,
        offset,
        sequence: offset as i32,
        timestamp: 1_700_000_000_000 + offset,
        key: Some(Bytes::from_static(b"record-key")),
        value: value.map(Bytes::copy_from_slice),
        headers: header_map,
    }
}

fn encode_batch(records: &[Record]) -> Bytes {
    let mut buf = BytesMut::new();
    let options = RecordEncodeOptions {
        compression: Compression::None,
        version: 2,
    };
    RecordBatchEncoder::encode(&mut buf, records.iter(), &options, Some(no_compression))
        .expect("record encoding cannot fail");
    buf.freeze()
}

fn no_compression<Output: BufMut>(
    input: &mut BytesMut,
    output: &mut Output,
    _compression: Compression,
) -> anyhow::Result<()> {
    output.put(input);
    Ok(())
}

fn decode_batch(batch: &Bytes) -> Vec<Record> {
    let mut buf = batch.clone();
    RecordBatchDecoder::decode_with_custom_compression(
        &mut buf,
        Some(no_decompression as fn(&mut Bytes, Compression) -> anyhow::Result<Bytes>),
    )
    .expect("record decoding cannot fail")
}

fn no_decompression(input: &mut Bytes, _compression: Compression) -> anyhow::Result<Bytes> {
    Ok(input.clone())
}

fn transform(kms: &Arc<InMemoryKms>, max_encryptions: u64) -> EnvelopeTransform<InMemoryKms> {
    let manager = Arc::new(DekManager::new(
        kms.clone(),
        Duration::from_secs(5),
        max_encryptions,
    ));
    EnvelopeTransform::new(manager, BufferPool::new(8))
}

fn scheme(fields: RecordFields) -> EncryptionScheme<String> {
    EncryptionScheme {
        kek_id: "kek".to_string(),
        fields,
    }
}

fn assert_records_equivalent(original: &[Record], restored: &[Record]) {
    assert_eq!(original.len(), restored.len());
    for (a, b) in original.iter().zip(restored) {
        assert_eq!(a.offset, b.offset);
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.key, b.key);
        assert_eq!(a.value, b.value);
        assert_eq!(a.headers, b.headers);
        assert_eq!(a.producer_id, b.producer_id);
        assert_eq!(a.producer_epoch, b.producer_epoch);
        assert_eq!(a.transactional, b.transactional);
        assert_eq!(a.control, b.control);
    }
}

#[tokio::test]
async fn value_scheme_round_trips() {
    let kms = InMemoryKms::new();
    kms.register_kek("kek");
    let transform = transform(&kms, 1 << 20);

    let records = vec![
        record(0, Some(b"first"), &[("trace", b"abc")]),
        record(1, Some(b"second"), &[]),
        record(2, None, &[("tomb", b"stone")]),
    ];
    let batch = encode_batch(&records);

    let encrypted = transform
        .encrypt_batch("orders", 0, &scheme(RecordFields::RECORD_VALUE), &batch)
        .await
        .unwrap();

    // Ciphertext replaced the values; the marker header is present and
    // the original headers survive in the clear.
    let header_key = StrBytes::from_static_str(ENCRYPTION_HEADER);
    let encrypted_records = decode_batch(&encrypted);
    assert!(encrypted_records[0].headers.contains_key(&header_key));
    assert_ne!(encrypted_records[0].value, records[0].value);
    assert!(encrypted_records[0]
        .headers
        .contains_key(&StrBytes::from_static_str("trace")));
    // The tombstone passed through untouched.
    assert!(encrypted_records[2].value.is_none());
    assert!(!encrypted_records[2].headers.contains_key(&header_key));

    let decrypted = transform.decrypt_batch("orders", 0, &encrypted).await.unwrap();
    assert_records_equivalent(&records, &decode_batch(&decrypted));
}

#[tokio::test]
async fn value_and_header_scheme_round_trips() {
    let kms = InMemoryKms::new();
    kms.register_kek("kek");
    let transform = transform(&kms, 1 << 20);

    let fields = RecordFields::RECORD_VALUE.union(RecordFields::RECORD_HEADER_VALUES);
    let records = vec![record(0, Some(b"payload"), &[("pii", b"sensitive")])];
    let batch = encode_batch(&records);

    let encrypted = transform
        .encrypt_batch("orders", 0, &scheme(fields), &batch)
        .await
        .unwrap();

    // Header values ride inside the parcel: only the marker remains.
    let encrypted_records = decode_batch(&encrypted);
    assert_eq!(encrypted_records[0].headers.len(), 1);
    assert!(encrypted_records[0]
        .headers
        .contains_key(&StrBytes::from_static_str(ENCRYPTION_HEADER)));

    let decrypted = transform.decrypt_batch("orders", 0, &encrypted).await.unwrap();
    assert_records_equivalent(&records, &decode_batch(&decrypted));
}

#[tokio::test]
async fn unencrypted_batch_is_returned_byte_identical() {
    let kms = InMemoryKms::new();
    kms.register_kek("kek");
    let transform = transform(&kms, 1 << 20);

    let batch = encode_batch(&[record(0, Some(b"plain"), &[("h", b"v")])]);
    let fetched = transform.decrypt_batch("orders", 0, &batch).await.unwrap();

    assert_eq!(batch, fetched);
    assert_eq!(kms.generate_count("kek"), 0);
}

#[tokio::test]
async fn compacted_empty_batch_passes_through_without_kms_calls() {
    let kms = InMemoryKms::new();
    kms.register_kek("kek");
    let transform = transform(&kms, 1 << 20);

    // A v2 batch header whose records were all compacted away:
    // sizeInBytes > 0, record count == 0.
    let mut batch = BytesMut::new();
    batch.put_i64(7); // baseOffset
    batch.put_i32(49); // batchLength
    batch.put_i32(0); // partitionLeaderEpoch
    batch.put_i8(2); // magic
    batch.put_u32(0xdeadbeef); // crc (never verified on this path)
    batch.put_i16(0); // attributes
    batch.put_i32(0); // lastOffsetDelta
    batch.put_i64(0); // baseTimestamp
    batch.put_i64(0); // maxTimestamp
    batch.put_i64(-1); // producerId
    batch.put_i16(-1); // producerEpoch
    batch.put_i32(-1); // baseSequence
    batch.put_i32(0); // records count
    let batch = batch.freeze();

    let out = transform
        .encrypt_batch("orders", 0, &scheme(RecordFields::RECORD_VALUE), &batch)
        .await
        .unwrap();
    assert_eq!(batch, out);

    let out = transform.decrypt_batch("orders", 0, &batch).await.unwrap();
    assert_eq!(batch, out);

    assert_eq!(kms.generate_count("kek"), 0);
}

#[tokio::test]
async fn header_only_scheme_rejects_tombstones() {
    let kms = InMemoryKms::new();
    kms.register_kek("kek");
    let transform = transform(&kms, 1 << 20);

    let batch = encode_batch(&[
        record(0, Some(b"live"), &[("h", b"v")]),
        record(1, None, &[("h", b"v")]),
    ]);

    let err = transform
        .encrypt_batch(
            "orders",
            0,
            &scheme(RecordFields::RECORD_HEADER_VALUES),
            &batch,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EncryptionError::TombstoneHeaderEncryption));
    // The batch failed before any key material was requested.
    assert_eq!(kms.generate_count("kek"), 0);
}

#[tokio::test]
async fn corrupted_record_is_dropped_and_neighbors_survive() {
    let kms = InMemoryKms::new();
    kms.register_kek("kek");
    let transform = transform(&kms, 1 << 20);

    let records = vec![
        record(0, Some(b"alpha"), &[]),
        record(1, Some(b"bravo"), &[]),
        record(2, Some(b"charlie"), &[]),
    ];
    let batch = encode_batch(&records);
    let encrypted = transform
        .encrypt_batch("orders", 0, &scheme(RecordFields::RECORD_VALUE), &batch)
        .await
        .unwrap();

    // Flip one ciphertext bit in the middle record.
    let mut tampered_records = decode_batch(&encrypted);
    let mut corrupted = tampered_records[1].value.take().unwrap().to_vec();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0x01;
    tampered_records[1].value = Some(corrupted.into());
    let tampered = encode_batch(&tampered_records);

    let decrypted = transform.decrypt_batch("orders", 0, &tampered).await.unwrap();
    let restored = decode_batch(&decrypted);

    assert_eq!(restored.len(), 2);
    assert_eq!(restored[0].value, Some(Bytes::from_static(b"alpha")));
    assert_eq!(restored[1].value, Some(Bytes::from_static(b"charlie")));
}

#[tokio::test]
async fn concurrent_exhaustion_rotates_once_and_both_calls_succeed() {
    let kms = InMemoryKms::new();
    kms.register_kek("kek");
    let transform = transform(&kms, 10);

    let batch_a = encode_batch(&(0..8).map(|i| record(i, Some(b"a"), &[])).collect::<Vec<_>>());
    let batch_b = encode_batch(&(0..8).map(|i| record(i, Some(b"b"), &[])).collect::<Vec<_>>());

    let scheme = scheme(RecordFields::RECORD_VALUE);
    let (left, right) = futures::future::join(
        transform.encrypt_batch("orders", 0, &scheme, &batch_a),
        transform.encrypt_batch("orders", 1, &scheme, &batch_b),
    )
    .await;

    let left = left.unwrap();
    let right = right.unwrap();

    // One call drained 8 of the first DEK's budget of 10; the other
    // triggered rotation onto a second DEK. Exactly two generations.
    assert_eq!(kms.generate_count("kek"), 2);

    for encrypted in [left, right] {
        let decrypted = transform.decrypt_batch("orders", 0, &encrypted).await.unwrap();
        assert_eq!(decode_batch(&decrypted).len(), 8);
    }
}

#[tokio::test]
async fn kms_outage_fails_the_batch_transiently() {
    let kms = InMemoryKms::new();
    kms.register_kek("kek");
    let transform = transform(&kms, 1 << 20);

    let batch = encode_batch(&[record(0, Some(b"x"), &[])]);

    kms.set_unavailable(true);
    let err = transform
        .encrypt_batch("orders", 0, &scheme(RecordFields::RECORD_VALUE), &batch)
        .await
        .unwrap_err();
    match &err {
        EncryptionError::Kms(kms_err) => assert!(kms_err.is_transient()),
        other => panic!("expected transient KMS error, got {other:?}"),
    }

    // Once the KMS recovers the same transform serves the batch.
    kms.set_unavailable(false);
    let encrypted = transform
        .encrypt_batch("orders", 0, &scheme(RecordFields::RECORD_VALUE), &batch)
        .await
        .unwrap();
    let decrypted = transform.decrypt_batch("orders", 0, &encrypted).await.unwrap();
    assert_eq!(
        decode_batch(&decrypted)[0].value,
        Some(Bytes::from_static(b"x"))
    );
}

#[tokio::test]
async fn distinct_keks_get_distinct_deks() {
    let kms = InMemoryKms::new();
    kms.register_kek("kek-a");
    kms.register_kek("kek-b");
    let transform = transform(&kms, 1 << 20);

    let batch = encode_batch(&[record(0, Some(b"x"), &[])]);

    let scheme_a = EncryptionScheme {
        kek_id: "kek-a".to_string(),
        fields: RecordFields::RECORD_VALUE,
    };
    let scheme_b = EncryptionScheme {
        kek_id: "kek-b".to_string(),
        fields: RecordFields::RECORD_VALUE,
    };

    transform.encrypt_batch("t", 0, &scheme_a, &batch).await.unwrap();
    transform.encrypt_batch("t", 0, &scheme_b, &batch).await.unwrap();

    assert_eq!(kms.generate_count("kek-a"), 1);
    assert_eq!(kms.generate_count("kek-b"), 1);
}

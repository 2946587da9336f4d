mod support;

use core_decode::{
    AudioCodec, AudioDecoderConfig, DecodeStreamError, DecoderConfig, DecryptConfig,
    DecryptStatus, DecryptingDemuxerStream, DemuxerRead, DemuxerStream, EncodedBuffer,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{
    aac_config, buffer, cdm_with, cdm_without_decryptor, ms, passthrough_decryptor, wait_until,
    MockDecryptor, ScriptItem, ScriptedDemuxer,
};
use tokio::sync::watch;

fn encrypted_aac() -> DecoderConfig {
    AudioDecoderConfig::new(AudioCodec::Aac, 44_100, 2)
        .encrypted(true)
        .into()
}

fn encrypted_buffer(timestamp_ms: u64) -> EncodedBuffer {
    buffer(timestamp_ms)
        .with_splice_timestamp(ms(timestamp_ms + 5))
        .with_decrypt_config(DecryptConfig::new(vec![0xAB; 16], vec![0u8; 16]))
}

fn clear_payload() -> EncodedBuffer {
    EncodedBuffer::new(&b"clear"[..], ms(0), ms(0))
}

/// Decryptor reporting `NoKey` for the first `missing` attempts.
fn decryptor_missing_keys(missing: usize, keys: &Arc<watch::Sender<u64>>) -> MockDecryptor {
    let attempts = AtomicUsize::new(0);
    let mut decryptor = MockDecryptor::new();
    decryptor.expect_decrypt().returning(move |_, _| {
        if attempts.fetch_add(1, Ordering::SeqCst) < missing {
            DecryptStatus::NoKey
        } else {
            DecryptStatus::Success(clear_payload())
        }
    });
    decryptor.expect_cancel_decrypt().returning(|_| ());
    let keys = Arc::clone(keys);
    decryptor
        .expect_new_key_watch()
        .returning(move || keys.subscribe());
    decryptor
}

#[tokio::test]
async fn test_initialize_requires_encrypted_stream() {
    let stream = DecryptingDemuxerStream::new(None);
    let err = stream
        .initialize(
            ScriptedDemuxer::new(aac_config()),
            cdm_with(Arc::new(passthrough_decryptor())),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DecodeStreamError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_initialize_requires_decryptor() {
    let stream = DecryptingDemuxerStream::new(None);
    let err = stream
        .initialize(ScriptedDemuxer::new(encrypted_aac()), cdm_without_decryptor())
        .await
        .unwrap_err();
    assert!(matches!(err, DecodeStreamError::DecryptorUnavailable(_)));
}

#[tokio::test]
async fn test_reports_clear_config_and_passes_clear_buffers() {
    let source = ScriptedDemuxer::new(encrypted_aac());
    source.push_buffer(buffer(7));
    source.push_end_of_stream();
    let stream = DecryptingDemuxerStream::new(None);
    stream
        .initialize(source.clone(), cdm_with(Arc::new(passthrough_decryptor())))
        .await
        .unwrap();

    assert_eq!(stream.decoder_config(), aac_config());
    assert_eq!(stream.read().await, DemuxerRead::Ok(buffer(7)));
    assert_eq!(stream.read().await, DemuxerRead::Ok(EncodedBuffer::end_of_stream()));
}

#[tokio::test]
async fn test_decrypted_buffer_keeps_source_timing() {
    let source = ScriptedDemuxer::new(encrypted_aac());
    source.push_buffer(encrypted_buffer(40));
    let keys = Arc::new(watch::channel(0u64).0);
    let stream = DecryptingDemuxerStream::new(None);
    stream
        .initialize(source, cdm_with(Arc::new(decryptor_missing_keys(0, &keys))))
        .await
        .unwrap();

    let DemuxerRead::Ok(clear) = stream.read().await else {
        panic!("expected a decrypted buffer");
    };
    assert_eq!(clear.data(), &b"clear"[..]);
    assert_eq!(clear.timestamp(), ms(40));
    assert_eq!(clear.duration(), ms(10));
    assert_eq!(clear.splice_timestamp(), Some(ms(45)));
    assert!(!clear.is_encrypted());
}

#[tokio::test]
async fn test_missing_key_waits_and_retries_when_key_arrives() {
    let source = ScriptedDemuxer::new(encrypted_aac());
    source.push_buffer(encrypted_buffer(0));
    let keys = Arc::new(watch::channel(0u64).0);
    let waiting = Arc::new(Mutex::new(0));

    let counter = Arc::clone(&waiting);
    let stream = Arc::new(DecryptingDemuxerStream::new(Some(Arc::new(move || {
        *counter.lock() += 1;
    }))));
    stream
        .initialize(source, cdm_with(Arc::new(decryptor_missing_keys(1, &keys))))
        .await
        .unwrap();

    let read = tokio::spawn({
        let stream = Arc::clone(&stream);
        async move { stream.read().await }
    });
    wait_until(|| *waiting.lock() == 1).await;

    keys.send_modify(|generation| *generation += 1);

    let DemuxerRead::Ok(clear) = read.await.unwrap() else {
        panic!("expected a decrypted buffer");
    };
    assert_eq!(clear.data(), &b"clear"[..]);
    assert_eq!(*waiting.lock(), 1);
}

#[tokio::test]
async fn test_reset_aborts_read_waiting_for_key() {
    let source = ScriptedDemuxer::new(encrypted_aac());
    source.push_buffer(encrypted_buffer(0));
    source.push_buffer(buffer(20));
    let keys = Arc::new(watch::channel(0u64).0);
    let waiting = Arc::new(Mutex::new(0));

    let cancels = Arc::new(AtomicUsize::new(0));
    let mut decryptor = MockDecryptor::new();
    decryptor
        .expect_decrypt()
        .returning(|_, _| DecryptStatus::NoKey);
    let cancel_counter = Arc::clone(&cancels);
    decryptor.expect_cancel_decrypt().returning(move |_| {
        cancel_counter.fetch_add(1, Ordering::SeqCst);
    });
    let watch_keys = Arc::clone(&keys);
    decryptor
        .expect_new_key_watch()
        .returning(move || watch_keys.subscribe());

    let counter = Arc::clone(&waiting);
    let stream = Arc::new(DecryptingDemuxerStream::new(Some(Arc::new(move || {
        *counter.lock() += 1;
    }))));
    stream
        .initialize(source, cdm_with(Arc::new(decryptor)))
        .await
        .unwrap();

    let read = tokio::spawn({
        let stream = Arc::clone(&stream);
        async move { stream.read().await }
    });
    wait_until(|| *waiting.lock() == 1).await;

    stream.reset().await;
    assert_eq!(read.await.unwrap(), DemuxerRead::Aborted);
    assert_eq!(cancels.load(Ordering::SeqCst), 1);

    // Reads after the reset are unaffected.
    assert_eq!(stream.read().await, DemuxerRead::Ok(buffer(20)));
}

#[tokio::test]
async fn test_config_change_updates_clear_config() {
    let source = ScriptedDemuxer::new(encrypted_aac());
    let new_config: DecoderConfig = AudioDecoderConfig::new(AudioCodec::Opus, 48_000, 2)
        .encrypted(true)
        .into();
    source.push(ScriptItem::ChangeConfig(new_config.clone()));
    let stream = DecryptingDemuxerStream::new(None);
    stream
        .initialize(source, cdm_with(Arc::new(passthrough_decryptor())))
        .await
        .unwrap();

    assert_eq!(stream.read().await, DemuxerRead::ConfigChanged);
    assert_eq!(stream.decoder_config(), new_config.to_clear());
    assert!(stream.supports_config_changes());
}

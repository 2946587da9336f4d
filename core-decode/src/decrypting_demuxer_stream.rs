//! # Decrypting Demuxer Stream
//!
//! A [`DemuxerStream`] adapter that decrypts encrypted buffers before handing
//! them on, so that decoders without decryption support can play protected
//! content.
//!
//! ## Overview
//!
//! - Clear and end-of-stream buffers pass through untouched.
//! - Encrypted buffers go to the CDM's [`Decryptor`]. The clear buffer keeps
//!   the original timestamp, duration and splice timestamp.
//! - When the decryptor has no key, the waiting-for-key callback fires and the
//!   decrypt is retried as soon as a new key is added.
//! - [`reset`](DecryptingDemuxerStream::reset) aborts the pending read and any
//!   decrypt in flight.
//! - The reported [`decoder_config`](DemuxerStream::decoder_config) is always the
//!   clear variant of the wrapped stream's configuration.

use crate::error::{DecodeStreamError, Result};
use crate::traits::{
    CdmContext, DecryptStatus, Decryptor, DemuxerRead, DemuxerStream, WaitingForKeyCallback,
};
use crate::types::{AudioCodec, AudioDecoderConfig, DecoderConfig, EncodedBuffer, StreamType};
use async_trait::async_trait;
use core_runtime::logging::redact_key_id;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Inner {
    stream: Option<Arc<dyn DemuxerStream>>,
    decryptor: Option<Arc<dyn Decryptor>>,
    config: Option<DecoderConfig>,
    reset_token: CancellationToken,
}

/// Wraps an encrypted [`DemuxerStream`] and produces clear buffers.
pub struct DecryptingDemuxerStream {
    inner: Mutex<Inner>,
    waiting_for_key: Option<WaitingForKeyCallback>,
}

impl DecryptingDemuxerStream {
    pub fn new(waiting_for_key: Option<WaitingForKeyCallback>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                stream: None,
                decryptor: None,
                config: None,
                reset_token: CancellationToken::new(),
            }),
            waiting_for_key,
        }
    }

    /// Bind to `stream` and obtain a decryptor from `cdm`.
    ///
    /// # Errors
    ///
    /// - [`DecodeStreamError::InvalidConfig`] if `stream` is not encrypted
    /// - [`DecodeStreamError::DecryptorUnavailable`] if the CDM has no decryptor
    pub async fn initialize(
        &self,
        stream: Arc<dyn DemuxerStream>,
        cdm: Arc<dyn CdmContext>,
    ) -> Result<()> {
        let config = stream.decoder_config();
        if !config.is_encrypted() {
            return Err(DecodeStreamError::InvalidConfig(format!(
                "{} stream is not encrypted",
                stream.stream_type()
            )));
        }

        let decryptor = cdm.decryptor().await.ok_or_else(|| {
            DecodeStreamError::DecryptorUnavailable(format!(
                "CDM has no decryptor for the {} stream",
                stream.stream_type()
            ))
        })?;

        debug!(stream_type = %stream.stream_type(), "Decrypting demuxer stream initialized");

        let mut inner = self.inner.lock();
        inner.config = Some(config.to_clear());
        inner.decryptor = Some(decryptor);
        inner.stream = Some(stream);
        Ok(())
    }

    /// Abort the pending read and any decrypt in flight.
    ///
    /// Reads issued after this call are unaffected.
    pub async fn reset(&self) {
        let (old_token, decryptor, stream_type) = {
            let mut inner = self.inner.lock();
            let old = std::mem::replace(&mut inner.reset_token, CancellationToken::new());
            let stream_type = inner.stream.as_ref().map(|s| s.stream_type());
            (old, inner.decryptor.clone(), stream_type)
        };

        old_token.cancel();
        if let (Some(decryptor), Some(stream_type)) = (decryptor, stream_type) {
            decryptor.cancel_decrypt(stream_type);
        }
        debug!("Decrypting demuxer stream reset");
    }

    async fn decrypt(
        &self,
        decryptor: Arc<dyn Decryptor>,
        stream_type: StreamType,
        buffer: EncodedBuffer,
        reset_token: CancellationToken,
    ) -> DemuxerRead {
        // Subscribe before the first attempt so a key added mid-decrypt is seen.
        let mut key_watch = decryptor.new_key_watch();

        loop {
            let _ = key_watch.borrow_and_update();

            let status = tokio::select! {
                _ = reset_token.cancelled() => return DemuxerRead::Aborted,
                status = decryptor.decrypt(stream_type, buffer.clone()) => status,
            };

            match status {
                DecryptStatus::Success(clear) => {
                    return DemuxerRead::Ok(clear.with_timing_of(&buffer));
                }
                DecryptStatus::Error => {
                    warn!(%stream_type, timestamp = ?buffer.timestamp(), "Decrypt failed");
                    return DemuxerRead::Aborted;
                }
                DecryptStatus::NoKey => {
                    if key_watch.has_changed().unwrap_or(false) {
                        debug!(%stream_type, "Key added during decrypt, retrying");
                        continue;
                    }

                    let key_id = buffer
                        .decrypt_config()
                        .map(|config| redact_key_id(&config.key_id))
                        .unwrap_or_default();
                    debug!(%stream_type, %key_id, "Waiting for decryption key");
                    if let Some(callback) = &self.waiting_for_key {
                        callback();
                    }

                    tokio::select! {
                        _ = reset_token.cancelled() => return DemuxerRead::Aborted,
                        changed = key_watch.changed() => {
                            if changed.is_err() {
                                warn!(%stream_type, "Key notifications closed while waiting for key");
                                return DemuxerRead::Aborted;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DemuxerStream for DecryptingDemuxerStream {
    async fn read(&self) -> DemuxerRead {
        let (stream, decryptor, reset_token) = {
            let inner = self.inner.lock();
            (
                inner.stream.clone(),
                inner.decryptor.clone(),
                inner.reset_token.clone(),
            )
        };
        let (Some(stream), Some(decryptor)) = (stream, decryptor) else {
            warn!("Read on uninitialized decrypting demuxer stream");
            return DemuxerRead::Aborted;
        };

        let result = tokio::select! {
            _ = reset_token.cancelled() => return DemuxerRead::Aborted,
            result = stream.read() => result,
        };

        match result {
            DemuxerRead::Aborted => DemuxerRead::Aborted,
            DemuxerRead::ConfigChanged => {
                let config = stream.decoder_config().to_clear();
                debug!(stream_type = %stream.stream_type(), "Decrypting demuxer stream config changed");
                self.inner.lock().config = Some(config);
                DemuxerRead::ConfigChanged
            }
            DemuxerRead::Ok(buffer) if !buffer.is_encrypted() => DemuxerRead::Ok(buffer),
            DemuxerRead::Ok(buffer) => {
                self.decrypt(decryptor, stream.stream_type(), buffer, reset_token)
                    .await
            }
        }
    }

    fn stream_type(&self) -> StreamType {
        let inner = self.inner.lock();
        match (&inner.stream, &inner.config) {
            (Some(stream), _) => stream.stream_type(),
            (None, Some(config)) => config.stream_type(),
            (None, None) => StreamType::Audio,
        }
    }

    fn decoder_config(&self) -> DecoderConfig {
        let inner = self.inner.lock();
        match (&inner.config, &inner.stream) {
            (Some(config), _) => config.clone(),
            (None, Some(stream)) => stream.decoder_config().to_clear(),
            (None, None) => AudioDecoderConfig::new(AudioCodec::Unknown, 0, 0).into(),
        }
    }

    fn supports_config_changes(&self) -> bool {
        self.inner
            .lock()
            .stream
            .as_ref()
            .map(|s| s.supports_config_changes())
            .unwrap_or(false)
    }

    fn enable_bitstream_converter(&self) {
        let stream = self.inner.lock().stream.clone();
        if let Some(stream) = stream {
            stream.enable_bitstream_converter();
        }
    }
}

impl std::fmt::Debug for DecryptingDemuxerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DecryptingDemuxerStream")
            .field("initialized", &inner.decryptor.is_some())
            .field("config", &inner.config)
            .finish()
    }
}

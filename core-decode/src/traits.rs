//! # Collaborator Traits
//!
//! Capability traits for everything the decoder stream consumes but does not
//! implement itself: encoded-buffer sources, decoders, and the content
//! decryption module (CDM).
//!
//! ## Threading Model
//!
//! Every collaborator call runs on its own spawned tokio task, so all traits
//! here are `Send + Sync` and take `&self`. Implementations that need mutable
//! state keep it behind a lock.
//!
//! ## Cancellation
//!
//! The decoder stream cancels outstanding operations by dropping their futures.
//! A [`DemuxerStream::read`] future that is dropped must not deliver its buffer
//! anywhere else; a dropped [`Decoder::decode`] future is treated as aborted.

use crate::error::Result;
use crate::stream_traits::StreamTraits;
use crate::types::{DecoderConfig, EncodedBuffer, StreamType};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Source Streams
// ============================================================================

/// Result of a single [`DemuxerStream::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxerRead {
    /// The next encoded buffer (possibly end-of-stream).
    Ok(EncodedBuffer),
    /// The read was cancelled (seek, teardown).
    Aborted,
    /// The stream configuration changed; [`DemuxerStream::decoder_config`]
    /// now reports the new configuration.
    ConfigChanged,
}

/// A source of encoded buffers for a single elementary stream.
#[async_trait]
pub trait DemuxerStream: Send + Sync {
    /// Read the next buffer.
    ///
    /// Only one read is outstanding at a time. Dropping the returned future
    /// cancels the read.
    async fn read(&self) -> DemuxerRead;

    /// Kind of stream this source produces.
    fn stream_type(&self) -> StreamType;

    /// Current decoder configuration.
    fn decoder_config(&self) -> DecoderConfig;

    /// Returns `true` if [`DemuxerRead::ConfigChanged`] may be produced.
    fn supports_config_changes(&self) -> bool {
        false
    }

    /// Ask the source to convert its bitstream into the decoder's input format.
    fn enable_bitstream_converter(&self) {}
}

// ============================================================================
// Decoders
// ============================================================================

/// Result of a single [`Decoder::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    /// The decode was abandoned because of a reset.
    Aborted,
    DecodeError,
}

/// Callback through which a decoder delivers outputs.
///
/// Outputs for a buffer must be delivered before the matching
/// [`Decoder::decode`] future resolves.
pub struct OutputSink<O> {
    callback: Arc<dyn Fn(O) + Send + Sync>,
}

impl<O> OutputSink<O> {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(O) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Hand a decoded output to the decoder stream.
    pub fn deliver(&self, output: O) {
        (self.callback)(output)
    }
}

impl<O> Clone for OutputSink<O> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<O> fmt::Debug for OutputSink<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// A decoder for one kind of stream.
///
/// # Example
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use core_decode::{
///     AudioBuffer, AudioDecoderConfig, AudioStreamTraits, DecodeStatus, Decoder,
///     EncodedBuffer, OutputSink, Result,
/// };
/// use parking_lot::Mutex;
///
/// struct SilenceDecoder {
///     sink: Mutex<Option<OutputSink<AudioBuffer>>>,
/// }
///
/// #[async_trait]
/// impl Decoder<AudioStreamTraits> for SilenceDecoder {
///     fn name(&self) -> &str {
///         "silence"
///     }
///
///     async fn initialize(
///         &self,
///         _config: AudioDecoderConfig,
///         _low_delay: bool,
///         output: OutputSink<AudioBuffer>,
///     ) -> Result<()> {
///         *self.sink.lock() = Some(output);
///         Ok(())
///     }
///
///     async fn decode(&self, buffer: EncodedBuffer) -> DecodeStatus {
///         if !buffer.is_end_of_stream() {
///             if let Some(sink) = self.sink.lock().as_ref() {
///                 sink.deliver(AudioBuffer::new(vec![0.0; 2048], 1024, 2, 44100, buffer.timestamp()));
///             }
///         }
///         DecodeStatus::Ok
///     }
///
///     async fn reset(&self) {}
/// }
/// ```
#[async_trait]
pub trait Decoder<T: StreamTraits>: Send + Sync {
    /// Human readable decoder name, used in logs and events.
    fn name(&self) -> &str;

    /// Returns `true` for hardware or OS provided decoders.
    fn is_platform_decoder(&self) -> bool {
        false
    }

    /// Prepare the decoder for `config`.
    ///
    /// May be called again on an initialized decoder to reconfigure it. The
    /// `output` sink replaces any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the decoder cannot handle the configuration.
    async fn initialize(
        &self,
        config: T::Config,
        low_delay: bool,
        output: OutputSink<T::Output>,
    ) -> Result<()>;

    /// Decode one buffer. An end-of-stream buffer flushes all pending outputs.
    async fn decode(&self, buffer: EncodedBuffer) -> DecodeStatus;

    /// Abandon all pending work. Outstanding decodes resolve before this does.
    async fn reset(&self);

    /// Maximum number of concurrent [`decode`](Self::decode) calls.
    fn max_decode_requests(&self) -> usize {
        1
    }

    /// Returns `false` if the decoder holds resources that would stall the
    /// source when more reads are issued.
    fn can_read_without_stalling(&self) -> bool {
        true
    }

    /// Returns `true` if the source must convert its bitstream first.
    fn needs_bitstream_conversion(&self) -> bool {
        false
    }
}

// ============================================================================
// Content Decryption
// ============================================================================

/// Result of a single [`Decryptor::decrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptStatus {
    Success(EncodedBuffer),
    /// The key for this buffer is not available yet.
    NoKey,
    Error,
}

/// Decrypts encrypted buffers.
#[async_trait]
pub trait Decryptor: Send + Sync {
    async fn decrypt(&self, stream_type: StreamType, buffer: EncodedBuffer) -> DecryptStatus;

    /// Cancel any decrypt in flight for `stream_type`.
    fn cancel_decrypt(&self, stream_type: StreamType);

    /// Watch channel whose value is bumped every time a key is added.
    fn new_key_watch(&self) -> watch::Receiver<u64>;
}

/// Access point to the content decryption module.
#[async_trait]
pub trait CdmContext: Send + Sync {
    /// Resolves once the CDM is ready; `None` if it cannot decrypt.
    async fn decryptor(&self) -> Option<Arc<dyn Decryptor>>;
}

/// Creates decoders that decrypt and decode in one step.
pub trait DecryptingDecoderFactory<T: StreamTraits>: Send + Sync {
    fn create(&self, cdm: Arc<dyn CdmContext>) -> Arc<dyn Decoder<T>>;
}

// ============================================================================
// Callbacks
// ============================================================================

/// Receives decode statistics.
pub type StatisticsCallback = Arc<dyn Fn(crate::config::PipelineStatistics) + Send + Sync>;

/// Invoked when decryption stalls waiting for a key.
pub type WaitingForKeyCallback = Arc<dyn Fn() + Send + Sync>;

/// Receives splice timestamps ahead of the buffer that carries them, and
/// `None` once a splice has ended.
pub type SpliceObserver = Arc<dyn Fn(Option<Duration>) + Send + Sync>;

/// Invoked once per configuration change reported by the source.
pub type ConfigChangeObserver = Arc<dyn Fn() + Send + Sync>;

//! # Media Types
//!
//! Value types that flow through the decode pipeline:
//!
//! - [`EncodedBuffer`]: compressed payload produced by a [`DemuxerStream`](crate::traits::DemuxerStream)
//! - [`AudioDecoderConfig`] / [`VideoDecoderConfig`]: codec parameters a decoder is initialized with
//! - [`AudioBuffer`] / [`VideoFrame`]: decoded units handed to the consumer
//!
//! Encoded payloads use [`Bytes`] so that moving a buffer from the source to
//! the decoder never copies the data.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Stream Type
// ============================================================================

/// Kind of elementary stream a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Audio => f.write_str("audio"),
            StreamType::Video => f.write_str("video"),
        }
    }
}

// ============================================================================
// Codecs
// ============================================================================

/// Audio codecs a source may carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Mp3,
    Opus,
    Vorbis,
    Flac,
    Pcm,
    /// Codec not recognized by the source.
    Unknown,
}

/// Video codecs a source may carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
    /// Codec not recognized by the source.
    Unknown,
}

// ============================================================================
// Encryption
// ============================================================================

/// A clear/encrypted byte run inside an encrypted sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsampleEntry {
    pub clear_bytes: u32,
    pub cypher_bytes: u32,
}

/// Per-buffer decryption parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptConfig {
    pub key_id: Bytes,
    pub iv: Bytes,
    pub subsamples: Vec<SubsampleEntry>,
}

impl DecryptConfig {
    pub fn new(key_id: impl Into<Bytes>, iv: impl Into<Bytes>) -> Self {
        Self {
            key_id: key_id.into(),
            iv: iv.into(),
            subsamples: Vec::new(),
        }
    }

    pub fn with_subsamples(mut self, subsamples: Vec<SubsampleEntry>) -> Self {
        self.subsamples = subsamples;
        self
    }
}

// ============================================================================
// Encoded Buffers
// ============================================================================

/// A compressed buffer read from a source.
///
/// End-of-stream buffers carry no payload and no timing; every accessor on them
/// returns the neutral value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBuffer {
    data: Bytes,
    timestamp: Duration,
    duration: Duration,
    end_of_stream: bool,
    splice_timestamp: Option<Duration>,
    decrypt_config: Option<DecryptConfig>,
}

impl EncodedBuffer {
    /// Create a buffer holding `data` presented at `timestamp`.
    pub fn new(data: impl Into<Bytes>, timestamp: Duration, duration: Duration) -> Self {
        Self {
            data: data.into(),
            timestamp,
            duration,
            end_of_stream: false,
            splice_timestamp: None,
            decrypt_config: None,
        }
    }

    /// Create the end-of-stream sentinel.
    pub fn end_of_stream() -> Self {
        Self {
            data: Bytes::new(),
            timestamp: Duration::ZERO,
            duration: Duration::ZERO,
            end_of_stream: true,
            splice_timestamp: None,
            decrypt_config: None,
        }
    }

    /// Mark this buffer as the join point of a splice.
    pub fn with_splice_timestamp(mut self, splice_timestamp: Duration) -> Self {
        self.splice_timestamp = Some(splice_timestamp);
        self
    }

    /// Attach decryption parameters, marking the buffer as encrypted.
    pub fn with_decrypt_config(mut self, decrypt_config: DecryptConfig) -> Self {
        self.decrypt_config = Some(decrypt_config);
        self
    }

    /// Copy timing and splice information from `other`.
    ///
    /// Decryptors return fresh buffers; the decrypting stream uses this to keep
    /// the original presentation timing.
    pub fn with_timing_of(mut self, other: &EncodedBuffer) -> Self {
        self.timestamp = other.timestamp;
        self.duration = other.duration;
        self.splice_timestamp = other.splice_timestamp;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Payload size in bytes (zero for end-of-stream).
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn splice_timestamp(&self) -> Option<Duration> {
        self.splice_timestamp
    }

    pub fn decrypt_config(&self) -> Option<&DecryptConfig> {
        self.decrypt_config.as_ref()
    }

    /// Returns `true` if the payload must be decrypted before decoding.
    pub fn is_encrypted(&self) -> bool {
        !self.end_of_stream && self.decrypt_config.is_some()
    }
}

// ============================================================================
// Decoder Configurations
// ============================================================================

/// Behaviour shared by audio and video decoder configurations.
pub trait MediaConfig: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Returns `true` if a decoder could plausibly be initialized with this config.
    fn is_valid(&self) -> bool;

    /// Returns `true` if buffers described by this config are encrypted.
    fn is_encrypted(&self) -> bool;

    /// The same configuration describing already-decrypted buffers.
    fn to_clear(&self) -> Self;
}

/// Audio decoder parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDecoderConfig {
    pub codec: AudioCodec,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    pub channels: u16,
    /// Codec-specific initialization data (e.g. AudioSpecificConfig).
    #[serde(default, with = "bytes_serde")]
    pub extra_data: Bytes,
    #[serde(default)]
    pub encrypted: bool,
}

impl AudioDecoderConfig {
    pub fn new(codec: AudioCodec, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec,
            sample_rate,
            channels,
            extra_data: Bytes::new(),
            encrypted: false,
        }
    }

    pub fn with_extra_data(mut self, extra_data: impl Into<Bytes>) -> Self {
        self.extra_data = extra_data.into();
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }
}

impl MediaConfig for AudioDecoderConfig {
    fn is_valid(&self) -> bool {
        self.codec != AudioCodec::Unknown && self.sample_rate > 0 && self.channels > 0
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn to_clear(&self) -> Self {
        Self {
            encrypted: false,
            ..self.clone()
        }
    }
}

/// Video decoder parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDecoderConfig {
    pub codec: VideoCodec,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Codec-specific initialization data (e.g. SPS/PPS for H.264).
    #[serde(default, with = "bytes_serde")]
    pub extra_data: Bytes,
    #[serde(default)]
    pub encrypted: bool,
}

impl VideoDecoderConfig {
    pub fn new(codec: VideoCodec, coded_width: u32, coded_height: u32) -> Self {
        Self {
            codec,
            coded_width,
            coded_height,
            extra_data: Bytes::new(),
            encrypted: false,
        }
    }

    pub fn with_extra_data(mut self, extra_data: impl Into<Bytes>) -> Self {
        self.extra_data = extra_data.into();
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }
}

impl MediaConfig for VideoDecoderConfig {
    fn is_valid(&self) -> bool {
        self.codec != VideoCodec::Unknown && self.coded_width > 0 && self.coded_height > 0
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn to_clear(&self) -> Self {
        Self {
            encrypted: false,
            ..self.clone()
        }
    }
}

/// Configuration reported by a source stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DecoderConfig {
    Audio(AudioDecoderConfig),
    Video(VideoDecoderConfig),
}

impl DecoderConfig {
    pub fn stream_type(&self) -> StreamType {
        match self {
            DecoderConfig::Audio(_) => StreamType::Audio,
            DecoderConfig::Video(_) => StreamType::Video,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            DecoderConfig::Audio(config) => config.is_valid(),
            DecoderConfig::Video(config) => config.is_valid(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        match self {
            DecoderConfig::Audio(config) => config.is_encrypted(),
            DecoderConfig::Video(config) => config.is_encrypted(),
        }
    }

    pub fn to_clear(&self) -> Self {
        match self {
            DecoderConfig::Audio(config) => DecoderConfig::Audio(config.to_clear()),
            DecoderConfig::Video(config) => DecoderConfig::Video(config.to_clear()),
        }
    }
}

impl From<AudioDecoderConfig> for DecoderConfig {
    fn from(config: AudioDecoderConfig) -> Self {
        DecoderConfig::Audio(config)
    }
}

impl From<VideoDecoderConfig> for DecoderConfig {
    fn from(config: VideoDecoderConfig) -> Self {
        DecoderConfig::Video(config)
    }
}

mod bytes_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        Vec::<u8>::deserialize(deserializer).map(Bytes::from)
    }
}

// ============================================================================
// Decoded Outputs
// ============================================================================

/// Common view over decoded units.
pub trait DecodedOutput: fmt::Debug + Send + 'static {
    fn timestamp(&self) -> Duration;

    fn is_end_of_stream(&self) -> bool;
}

/// A block of decoded PCM audio.
///
/// Samples are interleaved f32 in `[-1.0, 1.0]` (stereo is LRLRLR...).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    /// Number of frames (one sample per channel).
    pub frames: usize,
    pub channels: u16,
    pub sample_rate: u32,
    pub timestamp: Duration,
    end_of_stream: bool,
}

impl AudioBuffer {
    pub fn new(
        samples: Vec<f32>,
        frames: usize,
        channels: u16,
        sample_rate: u32,
        timestamp: Duration,
    ) -> Self {
        Self {
            samples,
            frames,
            channels,
            sample_rate,
            timestamp,
            end_of_stream: false,
        }
    }

    /// Create the end-of-stream marker output.
    pub fn end_of_stream() -> Self {
        Self {
            samples: Vec::new(),
            frames: 0,
            channels: 0,
            sample_rate: 0,
            timestamp: Duration::ZERO,
            end_of_stream: true,
        }
    }

    /// Playback duration of this block.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames as f64 / self.sample_rate as f64)
    }
}

impl DecodedOutput for AudioBuffer {
    fn timestamp(&self) -> Duration {
        self.timestamp
    }

    fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }
}

/// A decoded picture.
///
/// Planes are reference counted so that frames produced by hardware decoders
/// can share storage with the decoder that made them.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Bytes>,
    pub timestamp: Duration,
    end_of_stream: bool,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, planes: Vec<Bytes>, timestamp: Duration) -> Self {
        Self {
            width,
            height,
            planes,
            timestamp,
            end_of_stream: false,
        }
    }

    /// Create the end-of-stream marker output.
    pub fn end_of_stream() -> Self {
        Self {
            width: 0,
            height: 0,
            planes: Vec::new(),
            timestamp: Duration::ZERO,
            end_of_stream: true,
        }
    }
}

impl DecodedOutput for VideoFrame {
    fn timestamp(&self) -> Duration {
        self.timestamp
    }

    fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }
}

// ============================================================================
// Tests
// ============================================================================

//! # Decoder Stream Configuration
//!
//! Configuration, state and statistics types for the decoder stream.

use crate::error::{DecodeStreamError, Result};
use serde::{Deserialize, Serialize};

/// Decoder stream configuration.
///
/// Controls decoder initialization flags and which decryption paths the
/// selector may take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderStreamConfig {
    /// Ask decoders to favour latency over throughput (no frame reordering
    /// delay, minimal internal queueing).
    ///
    /// Default: false.
    #[serde(default = "default_low_delay")]
    pub low_delay: bool,

    /// Whether the selector may use a combined decrypt-and-decode decoder for
    /// encrypted streams before falling back to a decrypting source.
    ///
    /// Default: true, except on Android where platform decoders decrypt on
    /// their own.
    #[serde(default = "default_enable_decrypting_decoder")]
    pub enable_decrypting_decoder: bool,

    /// Capacity of the event bus created when none is supplied.
    ///
    /// Default: 64 events.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl Default for DecoderStreamConfig {
    fn default() -> Self {
        Self {
            low_delay: default_low_delay(),
            enable_decrypting_decoder: default_enable_decrypting_decoder(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl DecoderStreamConfig {
    /// Create a configuration for real-time communication.
    pub fn low_latency() -> Self {
        Self {
            low_delay: true,
            event_bus_capacity: 16,
            ..Default::default()
        }
    }

    /// Create a configuration for file or VOD playback.
    pub fn high_quality() -> Self {
        Self {
            low_delay: false,
            event_bus_capacity: 256,
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON, filling missing fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeStreamError::InvalidPipelineConfig`] if the JSON is
    /// malformed or the resulting configuration fails [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DecodeStreamError::InvalidPipelineConfig(e.to_string()))?;
        config
            .validate()
            .map_err(DecodeStreamError::InvalidPipelineConfig)?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.event_bus_capacity == 0 {
            return Err("event_bus_capacity must be > 0".to_string());
        }

        Ok(())
    }
}

// ============================================================================
// Default Functions (for serde)
// ============================================================================

fn default_low_delay() -> bool {
    false
}

fn default_enable_decrypting_decoder() -> bool {
    cfg!(not(target_os = "android"))
}

fn default_event_bus_capacity() -> usize {
    64
}

// ============================================================================
// Pipeline State
// ============================================================================

/// Current state of a decoder stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// `initialize` has not been called, or selection failed.
    Uninitialized,
    /// The selector is looking for a decoder.
    Initializing,
    /// Decoding normally.
    Normal,
    /// Draining the decoder ahead of a reinitialization.
    FlushingDecoder,
    /// A source read is outstanding.
    PendingDemuxerRead,
    /// Reinitializing the decoder with a new configuration.
    ReinitializingDecoder,
    /// The end-of-stream buffer has been decoded.
    EndOfStream,
    /// A decode failed or no replacement decoder could be found.
    Error,
}

impl PipelineState {
    /// Returns `true` once a decoder has been selected.
    pub fn is_initialized(&self) -> bool {
        !matches!(self, Self::Uninitialized | Self::Initializing)
    }

    /// Returns `true` if the stream will produce no further decoded outputs
    /// until it is reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Error)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Decode statistics delivered through the statistics callback.
///
/// Each report is a delta; consumers sum them with [`accumulate`](Self::accumulate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatistics {
    pub audio_bytes_decoded: u64,
    pub video_bytes_decoded: u64,
    pub video_frames_decoded: u64,
    pub video_frames_dropped: u64,
}

impl PipelineStatistics {
    /// Add `other` into `self`.
    pub fn accumulate(&mut self, other: &PipelineStatistics) {
        self.audio_bytes_decoded += other.audio_bytes_decoded;
        self.video_bytes_decoded += other.video_bytes_decoded;
        self.video_frames_decoded += other.video_frames_decoded;
        self.video_frames_dropped += other.video_frames_dropped;
    }

    /// Returns `true` if nothing was decoded.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

//! # Decode Pipeline Module
//!
//! Turns a stream of encoded media buffers into decoded audio blocks or video
//! frames, one read at a time.
//!
//! ## Overview
//!
//! This module handles:
//! - Decoder selection with ordered fallback across candidates
//! - Clear and encrypted sources, through a decrypting decoder or a
//!   decrypting source wrapper
//! - Read-driven decoding with bounded in-flight work
//! - Mid-stream configuration changes (flush, reinitialize, fall back)
//! - Reset, end-of-stream and decode-error handling
//!
//! The same pipeline serves audio and video; per-type behavior lives in
//! [`StreamTraits`] implementations ([`AudioStreamTraits`],
//! [`VideoStreamTraits`]).

pub mod config;
pub mod decoder_stream;
pub mod decrypting_demuxer_stream;
pub mod error;
pub mod selector;
pub mod stream_traits;
pub mod traits;
pub mod types;

pub use config::{DecoderStreamConfig, PipelineState, PipelineStatistics};
pub use decoder_stream::{
    AudioDecoderStream, DecoderStream, DecoderStreamBuilder, ReadOutcome, VideoDecoderStream,
};
pub use decrypting_demuxer_stream::DecryptingDemuxerStream;
pub use error::{DecodeStreamError, Result};
pub use selector::{DecoderSelector, SelectedDecoder};
pub use stream_traits::{AudioStreamTraits, StreamTraits, VideoStreamTraits};
pub use traits::{
    CdmContext, ConfigChangeObserver, DecodeStatus, Decoder, DecryptStatus,
    DecryptingDecoderFactory, Decryptor, DemuxerRead, DemuxerStream, OutputSink, SpliceObserver,
    StatisticsCallback, WaitingForKeyCallback,
};
pub use types::{
    AudioBuffer, AudioCodec, AudioDecoderConfig, DecodedOutput, DecoderConfig, DecryptConfig,
    EncodedBuffer, MediaConfig, StreamType, SubsampleEntry, VideoCodec, VideoDecoderConfig,
    VideoFrame,
};

//! # Stream Traits
//!
//! Stateless policy types that specialize [`DecoderStream`](crate::DecoderStream)
//! for audio or video. Everything that differs between the two pipelines lives
//! here; the state machine itself is shared.

use crate::config::PipelineStatistics;
use crate::traits::{Decoder, StatisticsCallback};
use crate::types::{
    AudioBuffer, AudioDecoderConfig, DecodedOutput, DecoderConfig, MediaConfig, StreamType,
    VideoDecoderConfig, VideoFrame,
};

/// Per-media-type policy for the decoder stream.
pub trait StreamTraits: Send + Sync + Sized + 'static {
    /// Decoded unit handed to the consumer.
    type Output: DecodedOutput;

    /// Configuration the decoder is initialized with.
    type Config: MediaConfig;

    const STREAM_TYPE: StreamType;

    /// Number of outputs a replacement decoder must produce before the decoder
    /// it replaced is released.
    const PREVIOUS_DECODER_RELEASE_OUTPUTS: usize;

    /// Extract this stream's configuration, or `None` on a media type mismatch.
    fn extract_config(config: &DecoderConfig) -> Option<Self::Config>;

    /// Returns `true` if the source must convert its bitstream for `decoder`.
    fn needs_bitstream_conversion(decoder: &dyn Decoder<Self>) -> bool {
        decoder.needs_bitstream_conversion()
    }

    /// Attribute `bytes_decoded` to this stream's statistics and report them.
    fn report_statistics(callback: &StatisticsCallback, bytes_decoded: usize);

    /// Output returned to reads once the stream has ended.
    fn create_eos_output() -> Self::Output;

    fn can_read_without_stalling(decoder: &dyn Decoder<Self>) -> bool;

    fn max_decode_requests(decoder: &dyn Decoder<Self>) -> usize;
}

// ============================================================================
// Audio
// ============================================================================

/// Audio pipeline policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioStreamTraits;

impl StreamTraits for AudioStreamTraits {
    type Output = AudioBuffer;
    type Config = AudioDecoderConfig;

    const STREAM_TYPE: StreamType = StreamType::Audio;
    const PREVIOUS_DECODER_RELEASE_OUTPUTS: usize = 0;

    fn extract_config(config: &DecoderConfig) -> Option<Self::Config> {
        match config {
            DecoderConfig::Audio(audio) => Some(audio.clone()),
            DecoderConfig::Video(_) => None,
        }
    }

    fn report_statistics(callback: &StatisticsCallback, bytes_decoded: usize) {
        callback(PipelineStatistics {
            audio_bytes_decoded: bytes_decoded as u64,
            ..Default::default()
        });
    }

    fn create_eos_output() -> Self::Output {
        AudioBuffer::end_of_stream()
    }

    // Audio decoders never hold source buffers hostage.
    fn can_read_without_stalling(_decoder: &dyn Decoder<Self>) -> bool {
        true
    }

    fn max_decode_requests(_decoder: &dyn Decoder<Self>) -> usize {
        1
    }
}

// ============================================================================
// Video
// ============================================================================

/// Video pipeline policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoStreamTraits;

impl StreamTraits for VideoStreamTraits {
    type Output = VideoFrame;
    type Config = VideoDecoderConfig;

    const STREAM_TYPE: StreamType = StreamType::Video;
    const PREVIOUS_DECODER_RELEASE_OUTPUTS: usize = 4;

    fn extract_config(config: &DecoderConfig) -> Option<Self::Config> {
        match config {
            DecoderConfig::Video(video) => Some(video.clone()),
            DecoderConfig::Audio(_) => None,
        }
    }

    fn report_statistics(callback: &StatisticsCallback, bytes_decoded: usize) {
        callback(PipelineStatistics {
            video_bytes_decoded: bytes_decoded as u64,
            video_frames_decoded: 1,
            ..Default::default()
        });
    }

    fn create_eos_output() -> Self::Output {
        VideoFrame::end_of_stream()
    }

    fn can_read_without_stalling(decoder: &dyn Decoder<Self>) -> bool {
        decoder.can_read_without_stalling()
    }

    fn max_decode_requests(decoder: &dyn Decoder<Self>) -> usize {
        decoder.max_decode_requests().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioCodec, VideoCodec};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn capture() -> (StatisticsCallback, Arc<Mutex<Vec<PipelineStatistics>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: StatisticsCallback = Arc::new(move |stats| sink.lock().push(stats));
        (callback, seen)
    }

    #[test]
    fn audio_statistics_count_bytes_only() {
        let (callback, seen) = capture();
        AudioStreamTraits::report_statistics(&callback, 512);
        let stats = seen.lock()[0];
        assert_eq!(stats.audio_bytes_decoded, 512);
        assert_eq!(stats.video_bytes_decoded, 0);
        assert_eq!(stats.video_frames_decoded, 0);
    }

    #[test]
    fn video_statistics_count_one_frame_per_decode() {
        let (callback, seen) = capture();
        VideoStreamTraits::report_statistics(&callback, 2048);
        let stats = seen.lock()[0];
        assert_eq!(stats.video_bytes_decoded, 2048);
        assert_eq!(stats.video_frames_decoded, 1);
        assert_eq!(stats.audio_bytes_decoded, 0);
    }

    #[test]
    fn config_extraction_rejects_other_media() {
        let audio: DecoderConfig = AudioDecoderConfig::new(AudioCodec::Aac, 44100, 2).into();
        let video: DecoderConfig = VideoDecoderConfig::new(VideoCodec::Vp9, 320, 240).into();

        assert!(AudioStreamTraits::extract_config(&audio).is_some());
        assert!(AudioStreamTraits::extract_config(&video).is_none());
        assert!(VideoStreamTraits::extract_config(&video).is_some());
        assert!(VideoStreamTraits::extract_config(&audio).is_none());
    }

    #[test]
    fn eos_outputs_are_marked() {
        assert!(AudioStreamTraits::create_eos_output().is_end_of_stream());
        assert!(VideoStreamTraits::create_eos_output().is_end_of_stream());
    }
}

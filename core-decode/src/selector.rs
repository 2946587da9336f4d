//! # Decoder Selector
//!
//! Chooses and initializes a working decoder for a source stream.
//!
//! ## Overview
//!
//! Candidates are tried front to back. A candidate that fails to initialize is
//! dropped for good, so a later selection (after a mid-stream config change)
//! continues where the previous one stopped. This gives hardware → software
//! fallback across a playback session.
//!
//! Encrypted streams take one of two routes:
//!
//! 1. A combined decrypt-and-decode decoder from the installed
//!    [`DecryptingDecoderFactory`], when enabled.
//! 2. A [`DecryptingDemuxerStream`] wrapped around the source, with the
//!    ordinary candidates decoding its clear output.

use crate::config::DecoderStreamConfig;
use crate::decrypting_demuxer_stream::DecryptingDemuxerStream;
use crate::stream_traits::StreamTraits;
use crate::traits::{
    CdmContext, Decoder, DecryptingDecoderFactory, DemuxerStream, OutputSink,
    WaitingForKeyCallback,
};
use core_runtime::events::{DecodeEvent, EventBus};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A decoder that initialized successfully.
pub struct SelectedDecoder<T: StreamTraits> {
    pub decoder: Arc<dyn Decoder<T>>,
    /// Present when the decoder reads clear buffers from a decrypting wrapper
    /// around the original source.
    pub decrypting_stream: Option<Arc<DecryptingDemuxerStream>>,
}

impl<T: StreamTraits> fmt::Debug for SelectedDecoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedDecoder")
            .field("decoder", &self.decoder.name())
            .field("decrypting_stream", &self.decrypting_stream.is_some())
            .finish()
    }
}

/// Picks the first working decoder from an ordered candidate list.
pub struct DecoderSelector<T: StreamTraits> {
    decoders: VecDeque<Arc<dyn Decoder<T>>>,
    decrypting_decoder_factory: Option<Arc<dyn DecryptingDecoderFactory<T>>>,
    config: DecoderStreamConfig,
    waiting_for_key: Option<WaitingForKeyCallback>,
    event_bus: Option<EventBus>,
}

impl<T: StreamTraits> DecoderSelector<T> {
    /// Create a selector over `decoders`, in order of preference.
    pub fn new(decoders: Vec<Arc<dyn Decoder<T>>>) -> Self {
        Self {
            decoders: decoders.into(),
            decrypting_decoder_factory: None,
            config: DecoderStreamConfig::default(),
            waiting_for_key: None,
            event_bus: None,
        }
    }

    pub fn with_decrypting_decoder_factory(
        mut self,
        factory: Arc<dyn DecryptingDecoderFactory<T>>,
    ) -> Self {
        self.decrypting_decoder_factory = Some(factory);
        self
    }

    pub fn with_config(mut self, config: DecoderStreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Callback handed to decrypting streams created by this selector.
    pub fn set_waiting_for_key(&mut self, callback: Option<WaitingForKeyCallback>) {
        self.waiting_for_key = callback;
    }

    /// Number of candidates not yet tried.
    pub fn remaining_candidates(&self) -> usize {
        self.decoders.len()
    }

    /// Select and initialize a decoder for `stream`.
    ///
    /// Resolves with `None` when the configuration is invalid, when an
    /// encrypted stream has no CDM, or when every candidate has failed.
    #[instrument(skip_all, fields(stream_type = %T::STREAM_TYPE, has_cdm = cdm.is_some()))]
    pub async fn select_decoder(
        &mut self,
        stream: Arc<dyn DemuxerStream>,
        cdm: Option<Arc<dyn CdmContext>>,
        output: OutputSink<T::Output>,
    ) -> Option<SelectedDecoder<T>> {
        let config = stream.decoder_config();
        if !config.is_valid() {
            warn!(?config, "Invalid decoder configuration");
            return None;
        }

        if !config.is_encrypted() {
            let decoder = self.initialize_candidates(stream, output).await?;
            return Some(SelectedDecoder {
                decoder,
                decrypting_stream: None,
            });
        }

        let Some(cdm) = cdm else {
            warn!("Encrypted stream without a CDM context");
            return None;
        };

        if let Some(decoder) = self
            .initialize_decrypting_decoder(&stream, Arc::clone(&cdm), output.clone())
            .await
        {
            return Some(SelectedDecoder {
                decoder,
                decrypting_stream: None,
            });
        }

        let decrypting_stream = Arc::new(DecryptingDemuxerStream::new(
            self.waiting_for_key.clone(),
        ));
        if let Err(e) = decrypting_stream.initialize(stream, cdm).await {
            warn!(error = %e, "Decrypting demuxer stream failed to initialize");
            return None;
        }

        let clear_stream: Arc<dyn DemuxerStream> = decrypting_stream.clone();
        let decoder = self.initialize_candidates(clear_stream, output).await?;
        Some(SelectedDecoder {
            decoder,
            decrypting_stream: Some(decrypting_stream),
        })
    }

    async fn initialize_decrypting_decoder(
        &self,
        stream: &Arc<dyn DemuxerStream>,
        cdm: Arc<dyn CdmContext>,
        output: OutputSink<T::Output>,
    ) -> Option<Arc<dyn Decoder<T>>> {
        if !self.config.enable_decrypting_decoder {
            return None;
        }
        let factory = self.decrypting_decoder_factory.as_ref()?;
        let config = T::extract_config(&stream.decoder_config())?;

        let decoder = factory.create(cdm);
        match decoder
            .initialize(config, self.config.low_delay, output)
            .await
        {
            Ok(()) => {
                info!(decoder = decoder.name(), "Decrypting decoder selected");
                Some(decoder)
            }
            Err(e) => {
                warn!(decoder = decoder.name(), error = %e, "Decrypting decoder failed to initialize");
                self.emit_fallback(decoder.name(), &e.to_string());
                None
            }
        }
    }

    async fn initialize_candidates(
        &mut self,
        stream: Arc<dyn DemuxerStream>,
        output: OutputSink<T::Output>,
    ) -> Option<Arc<dyn Decoder<T>>> {
        let Some(config) = T::extract_config(&stream.decoder_config()) else {
            warn!("Stream configuration does not match the stream type");
            return None;
        };

        while let Some(decoder) = self.decoders.pop_front() {
            debug!(decoder = decoder.name(), "Trying decoder");
            match decoder
                .initialize(config.clone(), self.config.low_delay, output.clone())
                .await
            {
                Ok(()) => {
                    info!(
                        decoder = decoder.name(),
                        platform = decoder.is_platform_decoder(),
                        "Decoder selected"
                    );
                    return Some(decoder);
                }
                Err(e) => {
                    warn!(decoder = decoder.name(), error = %e, "Decoder failed to initialize");
                    self.emit_fallback(decoder.name(), &e.to_string());
                }
            }
        }

        warn!("No decoder candidates left");
        None
    }

    fn emit_fallback(&self, decoder: &str, reason: &str) {
        if let Some(bus) = &self.event_bus {
            bus.emit(DecodeEvent::DecoderFallback {
                stream_type: T::STREAM_TYPE.to_string(),
                failed_decoder: decoder.to_string(),
                reason: reason.to_string(),
            })
            .ok();
        }
    }
}

impl<T: StreamTraits> fmt::Debug for DecoderSelector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderSelector")
            .field("stream_type", &T::STREAM_TYPE)
            .field("remaining_candidates", &self.decoders.len())
            .field(
                "has_decrypting_decoder_factory",
                &self.decrypting_decoder_factory.is_some(),
            )
            .finish()
    }
}

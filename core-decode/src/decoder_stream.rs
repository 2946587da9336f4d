//! # Decoder Stream
//!
//! A read-driven pipeline that pulls encoded buffers from a [`DemuxerStream`],
//! feeds them to the selected [`Decoder`] and hands decoded outputs to the
//! consumer one at a time.
//!
//! ## Architecture
//!
//! ```text
//!  consumer ──read/reset──> DecoderStream ──commands──> ┌─────────────┐
//!                                                       │    actor    │
//!  demuxer read ─┐                                      │ (all state) │
//!  decoder init ─┼──spawned tasks──events──────────────>│             │
//!  decode pump ──┤                                      └─────────────┘
//!  outputs ──────┘
//! ```
//!
//! All pipeline state is owned by a single actor task. Every collaborator call
//! runs in its own task and reports back as an event on the actor's channel, so
//! no completion is ever handled reentrantly. Dropping the [`DecoderStream`]
//! cancels a shared [`CancellationToken`]; in-flight collaborator calls are
//! dropped and no further completions are processed.
//!
//! ## Read Contract
//!
//! - At most one `read` outstanding; no `read` while a `reset` is outstanding.
//! - Once the stream has ended every read returns an end-of-stream output until
//!   the stream is reset.
//! - After a decode error every read returns [`ReadOutcome::DecodeError`] until
//!   the stream is reset.
//!
//! ## Backpressure
//!
//! Decodes in flight plus ready outputs never exceed the decoder's
//! `max_decode_requests`, and at most one source read is outstanding.

use crate::config::{DecoderStreamConfig, PipelineState, PipelineStatistics};
use crate::decrypting_demuxer_stream::DecryptingDemuxerStream;
use crate::error::{DecodeStreamError, Result};
use crate::selector::{DecoderSelector, SelectedDecoder};
use crate::stream_traits::{AudioStreamTraits, StreamTraits, VideoStreamTraits};
use crate::traits::{
    CdmContext, ConfigChangeObserver, DecodeStatus, Decoder, DecryptingDecoderFactory,
    DemuxerRead, DemuxerStream, OutputSink, SpliceObserver, StatisticsCallback,
    WaitingForKeyCallback,
};
use crate::types::{DecodedOutput, EncodedBuffer, MediaConfig, StreamType};
use core_runtime::events::{DecodeEvent, EventBus, EventStream};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Audio pipeline.
pub type AudioDecoderStream = DecoderStream<AudioStreamTraits>;

/// Video pipeline.
pub type VideoDecoderStream = DecoderStream<VideoStreamTraits>;

/// Result of a successful [`DecoderStream::read`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<O> {
    /// A decoded output, possibly the end-of-stream marker.
    Ok(O),
    /// The read was cancelled by a reset or by the source.
    Aborted,
    /// Decoding failed; the stream must be reset before it decodes again.
    DecodeError,
}

impl<O: DecodedOutput> ReadOutcome<O> {
    /// Returns `true` for an end-of-stream output.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ReadOutcome::Ok(output) if output.is_end_of_stream())
    }

    /// The decoded output, if any.
    pub fn into_output(self) -> Option<O> {
        match self {
            ReadOutcome::Ok(output) => Some(output),
            _ => None,
        }
    }
}

// ============================================================================
// Public Handle
// ============================================================================

/// Handle to a decoder stream.
///
/// Created through [`DecoderStreamBuilder`]. All methods forward to the actor
/// task; they fail with [`DecodeStreamError::Shutdown`] if the actor is gone.
///
/// # Example
///
/// ```rust,no_run
/// use core_decode::{
///     AudioDecoderStream, AudioStreamTraits, DecodedOutput, Decoder, DemuxerStream,
///     PipelineStatistics, ReadOutcome,
/// };
/// use std::sync::Arc;
///
/// async fn play(
///     decoders: Vec<Arc<dyn Decoder<AudioStreamTraits>>>,
///     source: Arc<dyn DemuxerStream>,
/// ) -> core_decode::Result<()> {
///     let stream = AudioDecoderStream::builder(decoders).build()?;
///     stream
///         .initialize(source, None, Arc::new(|_stats: PipelineStatistics| {}), None)
///         .await?;
///
///     loop {
///         match stream.read().await? {
///             ReadOutcome::Ok(buffer) if buffer.is_end_of_stream() => break,
///             ReadOutcome::Ok(buffer) => println!("{} frames", buffer.frames),
///             ReadOutcome::Aborted => continue,
///             ReadOutcome::DecodeError => break,
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct DecoderStream<T: StreamTraits> {
    commands: mpsc::UnboundedSender<Command<T>>,
    event_bus: EventBus,
    cancel: CancellationToken,
}

impl<T: StreamTraits> DecoderStream<T> {
    /// Start building a stream that will choose among `decoders`, in order of
    /// preference.
    pub fn builder(decoders: Vec<Arc<dyn Decoder<T>>>) -> DecoderStreamBuilder<T> {
        DecoderStreamBuilder::new(decoders)
    }

    /// Select a decoder for `stream` and prepare to decode.
    ///
    /// # Arguments
    ///
    /// * `stream` - Source of encoded buffers
    /// * `cdm` - Content decryption module, required for encrypted streams
    /// * `statistics` - Receives per-decode statistics deltas
    /// * `waiting_for_key` - Invoked when decryption stalls on a missing key
    ///
    /// # Errors
    ///
    /// - [`DecodeStreamError::AlreadyInitialized`] if called twice
    /// - [`DecodeStreamError::NoDecoderSelected`] if no decoder could be initialized
    pub async fn initialize(
        &self,
        stream: Arc<dyn DemuxerStream>,
        cdm: Option<Arc<dyn CdmContext>>,
        statistics: StatisticsCallback,
        waiting_for_key: Option<WaitingForKeyCallback>,
    ) -> Result<()> {
        self.request(|reply| Command::Initialize {
            stream,
            cdm,
            statistics,
            waiting_for_key,
            reply,
        })
        .await?
    }

    /// Read the next decoded output.
    ///
    /// # Errors
    ///
    /// - [`DecodeStreamError::NotInitialized`] before a decoder is selected
    /// - [`DecodeStreamError::ReadAlreadyPending`] if another read is outstanding
    /// - [`DecodeStreamError::ResetPending`] while a reset is outstanding
    pub async fn read(&self) -> Result<ReadOutcome<T::Output>> {
        self.request(Command::Read).await?
    }

    /// Abort the pending read, drop buffered outputs and reset the decoder.
    ///
    /// Resolves once the decoder has been reset. A reset issued while the
    /// decoder is being reinitialized resolves after reinitialization.
    ///
    /// # Errors
    ///
    /// - [`DecodeStreamError::NotInitialized`] before a decoder is selected
    /// - [`DecodeStreamError::ResetPending`] if another reset is outstanding
    pub async fn reset(&self) -> Result<()> {
        self.request(Command::Reset).await?
    }

    /// Returns `false` if issuing more reads could stall the source.
    pub async fn can_read_without_stalling(&self) -> Result<bool> {
        self.request(Command::CanReadWithoutStalling).await
    }

    /// Maximum number of decodes the current decoder accepts at once.
    pub async fn max_decode_requests(&self) -> Result<usize> {
        self.request(Command::MaxDecodeRequests).await
    }

    /// Current pipeline state, for diagnostics.
    pub async fn state(&self) -> Result<PipelineState> {
        self.request(Command::State).await
    }

    /// Observe splice timestamps ahead of decoding the buffers that carry them.
    pub fn set_splice_observer(&self, observer: Option<SpliceObserver>) -> Result<()> {
        self.send(Command::SetSpliceObserver(observer))
    }

    /// Observe configuration changes reported by the source.
    pub fn set_config_change_observer(&self, observer: Option<ConfigChangeObserver>) -> Result<()> {
        self.send(Command::SetConfigChangeObserver(observer))
    }

    /// Whether this handle drives an audio or a video pipeline.
    pub fn stream_type(&self) -> StreamType {
        T::STREAM_TYPE
    }

    /// Subscribe to this pipeline's events.
    ///
    /// Only events for this stream type are returned, even when the bus is
    /// shared with other pipelines. Events emitted before subscribing are not
    /// replayed.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.event_bus.subscribe()).for_stream(&T::STREAM_TYPE.to_string())
    }

    fn send(&self, command: Command<T>) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DecodeStreamError::Shutdown)
    }

    async fn request<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command<T>) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| DecodeStreamError::Shutdown)
    }
}

impl<T: StreamTraits> Drop for DecoderStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T: StreamTraits> fmt::Debug for DecoderStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderStream")
            .field("stream_type", &T::STREAM_TYPE)
            .field("shut_down", &self.cancel.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`DecoderStream`].
pub struct DecoderStreamBuilder<T: StreamTraits> {
    decoders: Vec<Arc<dyn Decoder<T>>>,
    decrypting_decoder_factory: Option<Arc<dyn DecryptingDecoderFactory<T>>>,
    config: DecoderStreamConfig,
    event_bus: Option<EventBus>,
}

impl<T: StreamTraits> DecoderStreamBuilder<T> {
    pub fn new(decoders: Vec<Arc<dyn Decoder<T>>>) -> Self {
        Self {
            decoders,
            decrypting_decoder_factory: None,
            config: DecoderStreamConfig::default(),
            event_bus: None,
        }
    }

    pub fn with_config(mut self, config: DecoderStreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_decrypting_decoder_factory(
        mut self,
        factory: Arc<dyn DecryptingDecoderFactory<T>>,
    ) -> Self {
        self.decrypting_decoder_factory = Some(factory);
        self
    }

    /// Publish pipeline milestones on a shared `event_bus`.
    ///
    /// Without one, the stream creates its own bus sized by
    /// [`DecoderStreamConfig::event_bus_capacity`].
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Spawn the actor and return its handle.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeStreamError::InvalidPipelineConfig`] if the
    /// configuration fails validation.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn build(self) -> Result<DecoderStream<T>> {
        self.config
            .validate()
            .map_err(DecodeStreamError::InvalidPipelineConfig)?;

        let event_bus = self
            .event_bus
            .unwrap_or_else(|| EventBus::new(self.config.event_bus_capacity));

        let mut selector = DecoderSelector::new(self.decoders)
            .with_config(self.config.clone())
            .with_event_bus(event_bus.clone());
        if let Some(factory) = self.decrypting_decoder_factory {
            selector = selector.with_decrypting_decoder_factory(factory);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (decode_tx, decode_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(
            run_decode_pump::<T>(decode_rx, event_tx.clone(), cancel.clone())
                .instrument(info_span!("decode_pump", stream_type = %T::STREAM_TYPE)),
        );

        let actor = Actor::new(
            selector,
            self.config,
            event_bus.clone(),
            event_tx,
            decode_tx,
            cancel.clone(),
        );
        tokio::spawn(
            actor
                .run(command_rx, event_rx)
                .instrument(info_span!("decoder_stream", stream_type = %T::STREAM_TYPE)),
        );

        Ok(DecoderStream {
            commands: command_tx,
            event_bus,
            cancel,
        })
    }
}

// ============================================================================
// Messages
// ============================================================================

enum Command<T: StreamTraits> {
    Initialize {
        stream: Arc<dyn DemuxerStream>,
        cdm: Option<Arc<dyn CdmContext>>,
        statistics: StatisticsCallback,
        waiting_for_key: Option<WaitingForKeyCallback>,
        reply: oneshot::Sender<Result<()>>,
    },
    Read(oneshot::Sender<Result<ReadOutcome<T::Output>>>),
    Reset(oneshot::Sender<Result<()>>),
    CanReadWithoutStalling(oneshot::Sender<bool>),
    MaxDecodeRequests(oneshot::Sender<usize>),
    State(oneshot::Sender<PipelineState>),
    SetSpliceObserver(Option<SpliceObserver>),
    SetConfigChangeObserver(Option<ConfigChangeObserver>),
}

enum Event<T: StreamTraits> {
    SelectionDone {
        selector: DecoderSelector<T>,
        selected: Option<SelectedDecoder<T>>,
    },
    DecoderReinitialized(Result<()>),
    BufferReady(DemuxerRead),
    DecodeDone {
        status: DecodeStatus,
        end_of_stream: bool,
        bytes: usize,
    },
    Output(T::Output),
    DecoderResetDone,
    DecryptingStreamResetDone,
}

struct DecodeJob<T: StreamTraits> {
    decoder: Arc<dyn Decoder<T>>,
    buffer: EncodedBuffer,
}

/// Runs decodes concurrently while starting them in submission order.
async fn run_decode_pump<T: StreamTraits>(
    mut jobs: mpsc::UnboundedReceiver<DecodeJob<T>>,
    events: mpsc::UnboundedSender<Event<T>>,
    cancel: CancellationToken,
) {
    let mut in_flight: FuturesUnordered<BoxFuture<'static, Event<T>>> = FuturesUnordered::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => {
                let Some(DecodeJob { decoder, buffer }) = job else { break };
                let end_of_stream = buffer.is_end_of_stream();
                let bytes = buffer.data_size();
                in_flight.push(Box::pin(async move {
                    let status = decoder.decode(buffer).await;
                    Event::DecodeDone { status, end_of_stream, bytes }
                }));
            }
            Some(event) = in_flight.next(), if !in_flight.is_empty() => {
                if events.send(event).is_err() {
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderResetPhase {
    Idle,
    InFlight,
    /// `Decoder::reset` resolved; waiting for outstanding decodes to drain.
    Done,
}

struct Actor<T: StreamTraits> {
    state: PipelineState,
    config: DecoderStreamConfig,

    selector: Option<DecoderSelector<T>>,
    decoder: Option<Arc<dyn Decoder<T>>>,
    previous_decoder: Option<Arc<dyn Decoder<T>>>,
    outputs_since_fallback: usize,

    stream: Option<Arc<dyn DemuxerStream>>,
    decrypting_stream: Option<Arc<DecryptingDemuxerStream>>,

    statistics: Option<StatisticsCallback>,
    splice_observer: Option<SpliceObserver>,
    config_change_observer: Option<ConfigChangeObserver>,
    event_bus: EventBus,

    init_reply: Option<oneshot::Sender<Result<()>>>,
    read_reply: Option<oneshot::Sender<Result<ReadOutcome<T::Output>>>>,
    reset_reply: Option<oneshot::Sender<Result<()>>>,

    ready_outputs: VecDeque<T::Output>,
    pending_decode_requests: usize,
    decoding_eos: bool,
    active_splice: bool,
    demuxer_read_in_flight: bool,
    decrypting_reset_pending: bool,
    decoder_reset: DecoderResetPhase,

    events: mpsc::UnboundedSender<Event<T>>,
    decodes: mpsc::UnboundedSender<DecodeJob<T>>,
    cancel: CancellationToken,
}

impl<T: StreamTraits> Actor<T> {
    fn new(
        selector: DecoderSelector<T>,
        config: DecoderStreamConfig,
        event_bus: EventBus,
        events: mpsc::UnboundedSender<Event<T>>,
        decodes: mpsc::UnboundedSender<DecodeJob<T>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: PipelineState::Uninitialized,
            config,
            selector: Some(selector),
            decoder: None,
            previous_decoder: None,
            outputs_since_fallback: 0,
            stream: None,
            decrypting_stream: None,
            statistics: None,
            splice_observer: None,
            config_change_observer: None,
            event_bus,
            init_reply: None,
            read_reply: None,
            reset_reply: None,
            ready_outputs: VecDeque::new(),
            pending_decode_requests: 0,
            decoding_eos: false,
            active_splice: false,
            demuxer_read_in_flight: false,
            decrypting_reset_pending: false,
            decoder_reset: DecoderResetPhase::Idle,
            events,
            decodes,
            cancel,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<T>>,
        mut events: mpsc::UnboundedReceiver<Event<T>>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = events.recv() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        debug!("Decoder stream stopped");
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, command: Command<T>) {
        match command {
            Command::Initialize {
                stream,
                cdm,
                statistics,
                waiting_for_key,
                reply,
            } => self.initialize(stream, cdm, statistics, waiting_for_key, reply),
            Command::Read(reply) => self.read(reply),
            Command::Reset(reply) => self.reset(reply),
            Command::CanReadWithoutStalling(reply) => {
                let answer = self
                    .decoder
                    .as_deref()
                    .map_or(true, |decoder| T::can_read_without_stalling(decoder));
                reply.send(answer).ok();
            }
            Command::MaxDecodeRequests(reply) => {
                reply.send(self.max_decode_requests()).ok();
            }
            Command::State(reply) => {
                reply.send(self.state).ok();
            }
            Command::SetSpliceObserver(observer) => self.splice_observer = observer,
            Command::SetConfigChangeObserver(observer) => self.config_change_observer = observer,
        }
    }

    fn handle_event(&mut self, event: Event<T>) {
        match event {
            Event::SelectionDone { selector, selected } => self.on_decoder_selected(selector, selected),
            Event::DecoderReinitialized(result) => self.on_decoder_reinitialized(result),
            Event::BufferReady(result) => self.on_buffer_ready(result),
            Event::DecodeDone {
                status,
                end_of_stream,
                bytes,
            } => self.on_decode_done(status, end_of_stream, bytes),
            Event::Output(output) => self.on_output(output),
            Event::DecoderResetDone => {
                self.decoder_reset = DecoderResetPhase::Done;
                self.maybe_finish_decoder_reset();
            }
            Event::DecryptingStreamResetDone => self.on_decrypting_stream_reset(),
        }
    }

    /// Run `operation` on its own task and post its result back as an event.
    fn spawn_operation<F>(&self, operation: F)
    where
        F: Future<Output = Event<T>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let events = self.events.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    event = operation => {
                        events.send(event).ok();
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn output_sink(&self) -> OutputSink<T::Output> {
        let events = self.events.clone();
        OutputSink::new(move |output| {
            events.send(Event::Output(output)).ok();
        })
    }

    fn active_stream(&self) -> Option<Arc<dyn DemuxerStream>> {
        match &self.decrypting_stream {
            Some(decrypting) => Some(decrypting.clone() as Arc<dyn DemuxerStream>),
            None => self.stream.clone(),
        }
    }

    fn emit(&self, event: DecodeEvent) {
        self.event_bus.emit(event).ok();
    }

    fn stream_type_name() -> String {
        T::STREAM_TYPE.to_string()
    }

    fn max_decode_requests(&self) -> usize {
        self.decoder
            .as_deref()
            .map_or(1, |decoder| T::max_decode_requests(decoder))
    }

    fn can_decode_more(&self) -> bool {
        !self.decoding_eos
            && self.ready_outputs.len() + self.pending_decode_requests < self.max_decode_requests()
    }

    fn reject<R>(&self, reply: oneshot::Sender<Result<R>>, error: DecodeStreamError) {
        warn!(state = ?self.state, error = %error, "Decoder stream contract violation");
        reply.send(Err(error)).ok();
    }

    // ------------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------------

    fn initialize(
        &mut self,
        stream: Arc<dyn DemuxerStream>,
        cdm: Option<Arc<dyn CdmContext>>,
        statistics: StatisticsCallback,
        waiting_for_key: Option<WaitingForKeyCallback>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.state != PipelineState::Uninitialized {
            self.reject(reply, DecodeStreamError::AlreadyInitialized);
            return;
        }
        let Some(mut selector) = self.selector.take() else {
            reply
                .send(Err(DecodeStreamError::Internal("selector unavailable".to_string())))
                .ok();
            return;
        };

        debug!("Initializing decoder stream");
        self.state = PipelineState::Initializing;
        self.stream = Some(Arc::clone(&stream));
        self.statistics = Some(statistics);
        self.init_reply = Some(reply);

        selector.set_waiting_for_key(waiting_for_key);
        let output = self.output_sink();
        self.spawn_operation(async move {
            let selected = selector.select_decoder(stream, cdm, output).await;
            Event::SelectionDone { selector, selected }
        });
    }

    fn on_decoder_selected(
        &mut self,
        selector: DecoderSelector<T>,
        selected: Option<SelectedDecoder<T>>,
    ) {
        self.selector = Some(selector);

        match self.state {
            PipelineState::Initializing => self.complete_initialization(selected),
            PipelineState::ReinitializingDecoder => self.complete_fallback(selected),
            state => warn!(?state, "Ignoring decoder selection in unexpected state"),
        }
    }

    fn complete_initialization(&mut self, selected: Option<SelectedDecoder<T>>) {
        let Some(reply) = self.init_reply.take() else {
            return;
        };

        let Some(SelectedDecoder {
            decoder,
            decrypting_stream,
        }) = selected
        else {
            warn!("No decoder selected");
            self.state = PipelineState::Uninitialized;
            self.stream = None;
            self.statistics = None;
            reply
                .send(Err(DecodeStreamError::NoDecoderSelected(
                    Self::stream_type_name(),
                )))
                .ok();
            return;
        };

        info!(
            decoder = decoder.name(),
            decrypting = decrypting_stream.is_some(),
            "Decoder stream initialized"
        );
        self.emit(DecodeEvent::DecoderSelected {
            stream_type: Self::stream_type_name(),
            decoder: decoder.name().to_string(),
            platform_decoder: decoder.is_platform_decoder(),
            decrypting_stream: decrypting_stream.is_some(),
        });

        self.decrypting_stream = decrypting_stream;
        if T::needs_bitstream_conversion(decoder.as_ref()) {
            if let Some(stream) = self.active_stream() {
                stream.enable_bitstream_converter();
            }
        }
        self.decoder = Some(decoder);
        self.state = PipelineState::Normal;

        if let Some(statistics) = &self.statistics {
            statistics(PipelineStatistics::default());
        }
        reply.send(Ok(())).ok();
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    fn read(&mut self, reply: oneshot::Sender<Result<ReadOutcome<T::Output>>>) {
        if !self.state.is_initialized() {
            self.reject(reply, DecodeStreamError::NotInitialized);
            return;
        }
        // A reader that gave up on its read no longer holds the slot.
        if self.read_reply.as_ref().is_some_and(oneshot::Sender::is_closed) {
            debug!("Discarding abandoned read");
            self.read_reply = None;
        }
        if self.read_reply.is_some() {
            self.reject(reply, DecodeStreamError::ReadAlreadyPending);
            return;
        }
        if self.reset_reply.is_some() {
            self.reject(reply, DecodeStreamError::ResetPending);
            return;
        }

        if self.state == PipelineState::Error {
            reply.send(Ok(ReadOutcome::DecodeError)).ok();
            return;
        }

        if self.state == PipelineState::EndOfStream && self.ready_outputs.is_empty() {
            reply.send(Ok(ReadOutcome::Ok(T::create_eos_output()))).ok();
            return;
        }

        match self.ready_outputs.pop_front() {
            Some(output) => {
                reply.send(Ok(ReadOutcome::Ok(output))).ok();
            }
            None => self.read_reply = Some(reply),
        }

        if self.state == PipelineState::Normal && self.can_decode_more() {
            self.read_from_demuxer();
        }
    }

    fn satisfy_read(&mut self, outcome: ReadOutcome<T::Output>) {
        let Some(reply) = self.read_reply.take() else {
            return;
        };
        // Outputs meant for an abandoned read go back to the front of the queue.
        if let Err(Ok(ReadOutcome::Ok(output))) = reply.send(Ok(outcome)) {
            debug!("Read was abandoned, keeping its output");
            self.ready_outputs.push_front(output);
        }
    }

    fn read_from_demuxer(&mut self) {
        if self.demuxer_read_in_flight {
            return;
        }
        let Some(stream) = self.active_stream() else {
            return;
        };

        self.state = PipelineState::PendingDemuxerRead;
        self.demuxer_read_in_flight = true;
        self.spawn_operation(async move { Event::BufferReady(stream.read().await) });
    }

    fn on_buffer_ready(&mut self, result: DemuxerRead) {
        self.demuxer_read_in_flight = false;

        if self.state == PipelineState::Error {
            if self.reset_reply.is_some() && !self.decrypting_reset_pending {
                self.reset_decoder();
            }
            return;
        }

        self.state = PipelineState::Normal;

        let buffer = match result {
            DemuxerRead::ConfigChanged => {
                info!("Stream configuration changed");
                if let Some(observer) = &self.config_change_observer {
                    observer();
                }
                self.emit(DecodeEvent::ConfigChanged {
                    stream_type: Self::stream_type_name(),
                });

                self.state = PipelineState::FlushingDecoder;
                if self.reset_reply.is_some() {
                    // Reinitialization continues once the reset has gone through.
                    if !self.decrypting_reset_pending {
                        self.reset_decoder();
                    }
                } else {
                    self.decode(EncodedBuffer::end_of_stream());
                }
                return;
            }
            _ if self.reset_reply.is_some() => {
                if !self.decrypting_reset_pending {
                    self.reset_decoder();
                }
                return;
            }
            DemuxerRead::Aborted => {
                debug!("Source read aborted");
                self.satisfy_read(ReadOutcome::Aborted);
                return;
            }
            DemuxerRead::Ok(buffer) => buffer,
        };

        if !buffer.is_end_of_stream() {
            if let Some(observer) = &self.splice_observer {
                let splice_timestamp = buffer.splice_timestamp();
                if self.active_splice || splice_timestamp.is_some() {
                    observer(splice_timestamp);
                    self.active_splice = splice_timestamp.is_some();
                }
            }
        }

        let end_of_stream = buffer.is_end_of_stream();
        self.decode(buffer);

        if !end_of_stream && self.can_decode_more() {
            self.read_from_demuxer();
        }
    }

    // ------------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------------

    fn decode(&mut self, buffer: EncodedBuffer) {
        let Some(decoder) = self.decoder.clone() else {
            return;
        };

        if buffer.is_end_of_stream() {
            self.decoding_eos = true;
        }
        self.pending_decode_requests += 1;

        if self.decodes.send(DecodeJob { decoder, buffer }).is_err() {
            warn!("Decode pump stopped");
        }
    }

    fn on_decode_done(&mut self, status: DecodeStatus, end_of_stream: bool, bytes: usize) {
        self.pending_decode_requests = self.pending_decode_requests.saturating_sub(1);
        if end_of_stream {
            self.decoding_eos = false;
        }

        // Results of decodes racing a reset are dropped.
        if self.reset_reply.is_some() {
            self.maybe_finish_decoder_reset();
            return;
        }
        if self.state == PipelineState::Error {
            return;
        }

        match status {
            DecodeStatus::DecodeError => {
                error!(end_of_stream, "Decode failed");
                self.enter_error_state("decoder reported a decode error");
                self.satisfy_read(ReadOutcome::DecodeError);
            }
            DecodeStatus::Aborted => {
                debug!(end_of_stream, "Decode aborted");
                self.satisfy_read(ReadOutcome::Aborted);
                if self.state == PipelineState::FlushingDecoder
                    && self.pending_decode_requests == 0
                {
                    self.reinitialize_decoder();
                }
            }
            DecodeStatus::Ok => {
                if bytes > 0 {
                    if let Some(statistics) = &self.statistics {
                        T::report_statistics(statistics, bytes);
                    }
                }

                match self.state {
                    PipelineState::Normal if end_of_stream => {
                        debug!("End of stream decoded");
                        self.state = PipelineState::EndOfStream;
                        self.emit(DecodeEvent::EndOfStream {
                            stream_type: Self::stream_type_name(),
                        });
                        if self.ready_outputs.is_empty() {
                            self.satisfy_read(ReadOutcome::Ok(T::create_eos_output()));
                        }
                    }
                    PipelineState::Normal => {
                        if self.can_decode_more() {
                            self.read_from_demuxer();
                        }
                    }
                    PipelineState::FlushingDecoder if self.pending_decode_requests == 0 => {
                        self.reinitialize_decoder();
                    }
                    _ => {}
                }
            }
        }
    }

    fn on_output(&mut self, output: T::Output) {
        if self.state == PipelineState::Error || self.reset_reply.is_some() {
            return;
        }

        self.outputs_since_fallback += 1;
        if self.previous_decoder.is_some()
            && self.outputs_since_fallback >= T::PREVIOUS_DECODER_RELEASE_OUTPUTS
        {
            debug!("Releasing previous decoder");
            self.previous_decoder = None;
        }

        if self.read_reply.is_some() {
            self.satisfy_read(ReadOutcome::Ok(output));
        } else {
            self.ready_outputs.push_back(output);
        }
    }

    fn enter_error_state(&mut self, message: &str) {
        self.state = PipelineState::Error;
        self.ready_outputs.clear();
        self.emit(DecodeEvent::DecodeError {
            stream_type: Self::stream_type_name(),
            message: message.to_string(),
        });
    }

    // ------------------------------------------------------------------------
    // Reinitialization
    // ------------------------------------------------------------------------

    fn reinitialize_decoder(&mut self) {
        let Some(decoder) = self.decoder.clone() else {
            self.complete_reinitialization(false);
            return;
        };

        self.state = PipelineState::ReinitializingDecoder;
        let config = self
            .active_stream()
            .and_then(|stream| T::extract_config(&stream.decoder_config()))
            .filter(|config| config.is_valid());
        let low_delay = self.config.low_delay;
        let output = self.output_sink();

        debug!(decoder = decoder.name(), "Reinitializing decoder");
        self.spawn_operation(async move {
            let result = match config {
                Some(config) => decoder.initialize(config, low_delay, output).await,
                None => Err(DecodeStreamError::InvalidConfig(
                    "new stream configuration is invalid".to_string(),
                )),
            };
            Event::DecoderReinitialized(result)
        });
    }

    fn on_decoder_reinitialized(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                if let Some(decoder) = &self.decoder {
                    info!(decoder = decoder.name(), "Decoder reinitialized");
                    self.emit(DecodeEvent::DecoderReinitialized {
                        stream_type: Self::stream_type_name(),
                        decoder: decoder.name().to_string(),
                        replaced: false,
                    });
                }
                self.complete_reinitialization(true);
            }
            Err(e) => {
                warn!(error = %e, "Decoder reinitialization failed, selecting a replacement");
                self.select_replacement_decoder();
            }
        }
    }

    /// Fall back to the remaining candidates. Decrypting paths are not retried.
    fn select_replacement_decoder(&mut self) {
        let Some(stream) = self.active_stream() else {
            self.complete_reinitialization(false);
            return;
        };
        let Some(mut selector) = self.selector.take() else {
            self.complete_reinitialization(false);
            return;
        };

        let output = self.output_sink();
        self.spawn_operation(async move {
            let selected = selector.select_decoder(stream, None, output).await;
            Event::SelectionDone { selector, selected }
        });
    }

    fn complete_fallback(&mut self, selected: Option<SelectedDecoder<T>>) {
        let Some(SelectedDecoder {
            decoder,
            decrypting_stream,
        }) = selected
        else {
            error!("No replacement decoder available");
            self.complete_reinitialization(false);
            return;
        };

        info!(decoder = decoder.name(), "Switched to replacement decoder");
        self.emit(DecodeEvent::DecoderReinitialized {
            stream_type: Self::stream_type_name(),
            decoder: decoder.name().to_string(),
            replaced: true,
        });

        if decrypting_stream.is_some() {
            self.decrypting_stream = decrypting_stream;
        }
        self.previous_decoder = self.decoder.replace(decoder);
        self.outputs_since_fallback = 0;
        self.complete_reinitialization(true);
    }

    fn complete_reinitialization(&mut self, success: bool) {
        if success {
            self.state = PipelineState::Normal;
        } else {
            self.enter_error_state("no decoder could be reinitialized");
        }

        if self.reset_reply.is_some() {
            self.finish_reset();
            return;
        }
        if self.read_reply.is_none() {
            return;
        }

        if self.state == PipelineState::Error {
            self.satisfy_read(ReadOutcome::DecodeError);
            return;
        }
        if self.can_decode_more() {
            self.read_from_demuxer();
        }
    }

    // ------------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------------

    fn reset(&mut self, reply: oneshot::Sender<Result<()>>) {
        if !self.state.is_initialized() {
            self.reject(reply, DecodeStreamError::NotInitialized);
            return;
        }
        if self.reset_reply.is_some() {
            self.reject(reply, DecodeStreamError::ResetPending);
            return;
        }

        debug!(state = ?self.state, "Resetting decoder stream");
        self.reset_reply = Some(reply);
        self.satisfy_read(ReadOutcome::Aborted);
        self.ready_outputs.clear();

        // The decoder cannot be reset mid-reinitialization; the reset completes
        // when reinitialization does.
        if self.state == PipelineState::ReinitializingDecoder {
            return;
        }

        if let Some(decrypting) = self.decrypting_stream.clone() {
            self.decrypting_reset_pending = true;
            self.spawn_operation(async move {
                decrypting.reset().await;
                Event::DecryptingStreamResetDone
            });
            return;
        }

        // The decoder is reset once the outstanding source read returns.
        if self.demuxer_read_in_flight {
            return;
        }

        self.reset_decoder();
    }

    fn on_decrypting_stream_reset(&mut self) {
        self.decrypting_reset_pending = false;
        if self.reset_reply.is_none() || self.demuxer_read_in_flight {
            return;
        }
        self.reset_decoder();
    }

    fn reset_decoder(&mut self) {
        let Some(decoder) = self.decoder.clone() else {
            self.on_decoder_reset();
            return;
        };

        self.decoder_reset = DecoderResetPhase::InFlight;
        self.spawn_operation(async move {
            decoder.reset().await;
            Event::DecoderResetDone
        });
    }

    fn maybe_finish_decoder_reset(&mut self) {
        if self.decoder_reset == DecoderResetPhase::Done && self.pending_decode_requests == 0 {
            self.decoder_reset = DecoderResetPhase::Idle;
            self.on_decoder_reset();
        }
    }

    fn on_decoder_reset(&mut self) {
        self.decoding_eos = false;

        if self.state == PipelineState::FlushingDecoder {
            // Reset raced a config change; pick up the new config now.
            self.reinitialize_decoder();
            return;
        }

        self.state = PipelineState::Normal;
        self.active_splice = false;
        self.finish_reset();
    }

    fn finish_reset(&mut self) {
        if let Some(reply) = self.reset_reply.take() {
            debug!("Decoder stream reset complete");
            self.emit(DecodeEvent::Reset {
                stream_type: Self::stream_type_name(),
            });
            reply.send(Ok(())).ok();
        }
    }
}

//! Shared fakes for decoder stream integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use core_decode::{
    AudioBuffer, AudioCodec, AudioDecoderConfig, AudioStreamTraits, CdmContext, DecodeStatus,
    DecodeStreamError, Decoder, DecoderConfig, DecryptStatus, Decryptor, DemuxerRead,
    DemuxerStream, EncodedBuffer, OutputSink, PipelineStatistics, Result, StatisticsCallback,
    StreamTraits, StreamType, VideoCodec, VideoDecoderConfig, VideoFrame, VideoStreamTraits,
};
use mockall::mock;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};

pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

pub fn buffer(timestamp_ms: u64) -> EncodedBuffer {
    EncodedBuffer::new(vec![0u8; 100], ms(timestamp_ms), ms(10))
}

pub fn aac_config() -> DecoderConfig {
    AudioDecoderConfig::new(AudioCodec::Aac, 44_100, 2).into()
}

pub fn h264_config() -> DecoderConfig {
    VideoDecoderConfig::new(VideoCodec::H264, 1280, 720).into()
}

/// Poll `condition` until it holds, failing the test after one second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within one second"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Statistics callback that sums every report.
pub fn statistics_recorder() -> (StatisticsCallback, Arc<Mutex<PipelineStatistics>>) {
    let totals = Arc::new(Mutex::new(PipelineStatistics::default()));
    let sink = Arc::clone(&totals);
    let callback: StatisticsCallback = Arc::new(move |delta: PipelineStatistics| {
        sink.lock().accumulate(&delta)
    });
    (callback, totals)
}

// ============================================================================
// Scripted Demuxer
// ============================================================================

pub enum ScriptItem {
    Read(DemuxerRead),
    /// Switch to `config` and report a configuration change.
    ChangeConfig(DecoderConfig),
}

#[derive(Default)]
struct DemuxerState {
    script: VecDeque<ScriptItem>,
    reads_started: usize,
    reads_in_flight: usize,
    reads_cancelled: usize,
    bitstream_converter_enabled: bool,
}

/// A source that answers reads from a script and blocks when the script runs dry.
pub struct ScriptedDemuxer {
    stream_type: StreamType,
    config: Mutex<DecoderConfig>,
    state: Mutex<DemuxerState>,
    wakeup: Notify,
}

impl ScriptedDemuxer {
    pub fn new(config: DecoderConfig) -> Arc<Self> {
        Arc::new(Self {
            stream_type: config.stream_type(),
            config: Mutex::new(config),
            state: Mutex::new(DemuxerState::default()),
            wakeup: Notify::new(),
        })
    }

    pub fn push(&self, item: ScriptItem) {
        self.state.lock().script.push_back(item);
        self.wakeup.notify_one();
    }

    pub fn push_buffer(&self, buffer: EncodedBuffer) {
        self.push(ScriptItem::Read(DemuxerRead::Ok(buffer)));
    }

    pub fn push_end_of_stream(&self) {
        self.push_buffer(EncodedBuffer::end_of_stream());
    }

    pub fn reads_started(&self) -> usize {
        self.state.lock().reads_started
    }

    pub fn reads_in_flight(&self) -> usize {
        self.state.lock().reads_in_flight
    }

    pub fn reads_cancelled(&self) -> usize {
        self.state.lock().reads_cancelled
    }

    pub fn script_len(&self) -> usize {
        self.state.lock().script.len()
    }

    pub fn bitstream_converter_enabled(&self) -> bool {
        self.state.lock().bitstream_converter_enabled
    }

    fn next_item(&self) -> Option<DemuxerRead> {
        let item = self.state.lock().script.pop_front()?;
        Some(match item {
            ScriptItem::Read(read) => read,
            ScriptItem::ChangeConfig(config) => {
                *self.config.lock() = config;
                DemuxerRead::ConfigChanged
            }
        })
    }
}

/// Tracks whether a read future was dropped before completing.
struct ReadGuard<'a> {
    demuxer: &'a ScriptedDemuxer,
    completed: bool,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.demuxer.state.lock();
        state.reads_in_flight -= 1;
        if !self.completed {
            state.reads_cancelled += 1;
        }
    }
}

#[async_trait]
impl DemuxerStream for ScriptedDemuxer {
    async fn read(&self) -> DemuxerRead {
        {
            let mut state = self.state.lock();
            state.reads_started += 1;
            state.reads_in_flight += 1;
        }
        let mut guard = ReadGuard {
            demuxer: self,
            completed: false,
        };

        loop {
            if let Some(read) = self.next_item() {
                guard.completed = true;
                return read;
            }
            self.wakeup.notified().await;
        }
    }

    fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    fn decoder_config(&self) -> DecoderConfig {
        self.config.lock().clone()
    }

    fn supports_config_changes(&self) -> bool {
        true
    }

    fn enable_bitstream_converter(&self) {
        self.state.lock().bitstream_converter_enabled = true;
    }
}

// ============================================================================
// Fake Decoder
// ============================================================================

#[derive(Default)]
struct DecoderState {
    initialize_calls: usize,
    configs: Vec<DecoderConfig>,
    decode_calls: usize,
    decoded_timestamps: Vec<Duration>,
    decodes_in_flight: usize,
    max_decodes_in_flight: usize,
    reset_calls: usize,
}

/// Decoder that emits one output per non end-of-stream buffer.
pub struct FakeDecoder<T: StreamTraits> {
    name: String,
    /// Initialization attempts at or beyond this number (1-based) fail.
    fail_initialize_from: Option<usize>,
    /// The n-th decode call (1-based) reports a decode error.
    fail_decode_at: Option<usize>,
    /// The n-th decode call (1-based) reports an abort.
    abort_decode_at: Option<usize>,
    /// Initialization attempts at or beyond this number wait for
    /// [`release_initialize`](FakeDecoder::release_initialize).
    hold_initialize_from: Option<usize>,
    init_gate: Semaphore,
    max_decode_requests: usize,
    needs_bitstream_conversion: bool,
    gate: Option<Semaphore>,
    make_output: fn(&EncodedBuffer) -> T::Output,
    wrap_config: fn(T::Config) -> DecoderConfig,
    sink: Mutex<Option<OutputSink<T::Output>>>,
    state: Mutex<DecoderState>,
}

impl FakeDecoder<AudioStreamTraits> {
    pub fn audio(name: &str) -> Self {
        Self::with_hooks(
            name,
            |buffer| AudioBuffer::new(vec![0.0; 2048], 1024, 2, 44_100, buffer.timestamp()),
            DecoderConfig::Audio,
        )
    }
}

impl FakeDecoder<VideoStreamTraits> {
    pub fn video(name: &str) -> Self {
        Self::with_hooks(
            name,
            |buffer| VideoFrame::new(1280, 720, Vec::new(), buffer.timestamp()),
            DecoderConfig::Video,
        )
    }
}

impl<T: StreamTraits> FakeDecoder<T> {
    fn with_hooks(
        name: &str,
        make_output: fn(&EncodedBuffer) -> T::Output,
        wrap_config: fn(T::Config) -> DecoderConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            fail_initialize_from: None,
            fail_decode_at: None,
            abort_decode_at: None,
            hold_initialize_from: None,
            init_gate: Semaphore::new(0),
            max_decode_requests: 1,
            needs_bitstream_conversion: false,
            gate: None,
            make_output,
            wrap_config,
            sink: Mutex::new(None),
            state: Mutex::new(DecoderState::default()),
        }
    }

    pub fn failing_initialize(self) -> Self {
        self.failing_initialize_from(1)
    }

    pub fn failing_initialize_from(mut self, attempt: usize) -> Self {
        self.fail_initialize_from = Some(attempt);
        self
    }

    pub fn failing_decode_at(mut self, call: usize) -> Self {
        self.fail_decode_at = Some(call);
        self
    }

    pub fn aborting_decode_at(mut self, call: usize) -> Self {
        self.abort_decode_at = Some(call);
        self
    }

    pub fn holding_initialize_from(mut self, attempt: usize) -> Self {
        self.hold_initialize_from = Some(attempt);
        self
    }

    pub fn release_initialize(&self) {
        self.init_gate.add_permits(1);
    }

    pub fn with_max_decode_requests(mut self, max: usize) -> Self {
        self.max_decode_requests = max;
        self
    }

    pub fn needing_bitstream_conversion(mut self) -> Self {
        self.needs_bitstream_conversion = true;
        self
    }

    /// Hold every decode until [`release_decodes`](Self::release_decodes).
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release_decodes(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn initialize_calls(&self) -> usize {
        self.state.lock().initialize_calls
    }

    pub fn last_config(&self) -> Option<DecoderConfig> {
        self.state.lock().configs.last().cloned()
    }

    pub fn decode_calls(&self) -> usize {
        self.state.lock().decode_calls
    }

    pub fn decoded_timestamps(&self) -> Vec<Duration> {
        self.state.lock().decoded_timestamps.clone()
    }

    pub fn max_decodes_in_flight(&self) -> usize {
        self.state.lock().max_decodes_in_flight
    }

    pub fn reset_calls(&self) -> usize {
        self.state.lock().reset_calls
    }
}

#[async_trait]
impl<T: StreamTraits> Decoder<T> for FakeDecoder<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(
        &self,
        config: T::Config,
        _low_delay: bool,
        output: OutputSink<T::Output>,
    ) -> Result<()> {
        let attempt = {
            let mut state = self.state.lock();
            state.initialize_calls += 1;
            state.configs.push((self.wrap_config)(config));
            state.initialize_calls
        };

        if self.hold_initialize_from.is_some_and(|from| attempt >= from) {
            if let Ok(permit) = self.init_gate.acquire().await {
                permit.forget();
            }
        }

        if self.fail_initialize_from.is_some_and(|from| attempt >= from) {
            return Err(DecodeStreamError::DecoderInitFailed {
                decoder: self.name.clone(),
                reason: "unsupported configuration".to_string(),
            });
        }

        *self.sink.lock() = Some(output);
        Ok(())
    }

    async fn decode(&self, buffer: EncodedBuffer) -> DecodeStatus {
        let call = {
            let mut state = self.state.lock();
            state.decode_calls += 1;
            state.decodes_in_flight += 1;
            state.max_decodes_in_flight = state.max_decodes_in_flight.max(state.decodes_in_flight);
            if !buffer.is_end_of_stream() {
                state.decoded_timestamps.push(buffer.timestamp());
            }
            state.decode_calls
        };

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let status = if self.fail_decode_at == Some(call) {
            DecodeStatus::DecodeError
        } else if self.abort_decode_at == Some(call) {
            DecodeStatus::Aborted
        } else {
            if !buffer.is_end_of_stream() {
                let sink = self.sink.lock().clone();
                if let Some(sink) = sink {
                    sink.deliver((self.make_output)(&buffer));
                }
            }
            DecodeStatus::Ok
        };

        self.state.lock().decodes_in_flight -= 1;
        status
    }

    async fn reset(&self) {
        self.state.lock().reset_calls += 1;
    }

    fn max_decode_requests(&self) -> usize {
        self.max_decode_requests
    }

    fn needs_bitstream_conversion(&self) -> bool {
        self.needs_bitstream_conversion
    }
}

// ============================================================================
// Content Decryption
// ============================================================================

mock! {
    pub Decryptor {}

    #[async_trait]
    impl Decryptor for Decryptor {
        async fn decrypt(&self, stream_type: StreamType, buffer: EncodedBuffer) -> DecryptStatus;
        fn cancel_decrypt(&self, stream_type: StreamType);
        fn new_key_watch(&self) -> watch::Receiver<u64>;
    }
}

mock! {
    pub Cdm {}

    #[async_trait]
    impl CdmContext for Cdm {
        async fn decryptor(&self) -> Option<Arc<dyn Decryptor>>;
    }
}

/// CDM whose decryptor is `decryptor`.
pub fn cdm_with(decryptor: Arc<dyn Decryptor>) -> Arc<dyn CdmContext> {
    let mut cdm = MockCdm::new();
    cdm.expect_decryptor()
        .returning(move || Some(Arc::clone(&decryptor)));
    Arc::new(cdm)
}

/// CDM that cannot decrypt.
pub fn cdm_without_decryptor() -> Arc<dyn CdmContext> {
    let mut cdm = MockCdm::new();
    cdm.expect_decryptor().returning(|| None);
    Arc::new(cdm)
}

/// Decryptor that strips the decrypt config from every buffer.
pub fn passthrough_decryptor() -> MockDecryptor {
    let (keys, _) = watch::channel(0u64);
    let mut decryptor = MockDecryptor::new();
    decryptor.expect_decrypt().returning(|_, buffer| {
        DecryptStatus::Success(EncodedBuffer::new(
            buffer.data().clone(),
            Duration::ZERO,
            Duration::ZERO,
        ))
    });
    decryptor.expect_cancel_decrypt().returning(|_| ());
    decryptor
        .expect_new_key_watch()
        .returning(move || keys.subscribe());
    decryptor
}

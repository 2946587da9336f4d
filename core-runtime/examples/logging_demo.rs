//! Logging and event bus demonstration
//!
//! Run with:
//! ```bash
//! # Pretty format (default in debug)
//! cargo run --example logging_demo
//!
//! # JSON format with a custom filter
//! cargo run --example logging_demo -- json "core_runtime=trace"
//! ```

use core_runtime::events::{DecodeEvent, EventBus, EventSeverity, EventStream};
use core_runtime::logging::{init_logging, redact_key_id, LogFormat, LogLevel, LoggingConfig};
use std::env;
use tracing::{info, info_span, warn};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    let format = match args.get(1).map(String::as_str) {
        Some("json") => LogFormat::Json,
        Some("compact") => LogFormat::Compact,
        Some("pretty") => LogFormat::Pretty,
        _ => LogFormat::default(),
    };

    let mut config = LoggingConfig::default()
        .with_format(format)
        .with_level(LogLevel::Debug)
        .with_spans(true);
    if let Some(filter) = args.get(2) {
        config = config.with_filter(filter.clone());
    }

    if let Err(e) = init_logging(config) {
        eprintln!("Failed to initialize logging: {e}");
        return;
    }

    let bus = EventBus::default();
    let mut warnings = EventStream::new(bus.subscribe())
        .filter(|event| event.severity() >= EventSeverity::Warning);

    let span = info_span!("decoder_stream", stream_type = "video");
    let _guard = span.enter();

    bus.emit(DecodeEvent::DecoderFallback {
        stream_type: "video".to_string(),
        failed_decoder: "hardware-h264".to_string(),
        reason: "unsupported profile".to_string(),
    })
    .ok();
    bus.emit(DecodeEvent::DecoderSelected {
        stream_type: "video".to_string(),
        decoder: "software-h264".to_string(),
        platform_decoder: false,
        decrypting_stream: true,
    })
    .ok();

    let key_id = [0x9f, 0x12, 0x44, 0x07, 0xaa, 0xbb, 0xcc, 0xdd];
    info!(key_id = %redact_key_id(&key_id), "Waiting for decryption key");

    while let Some(Ok(event)) = warnings.try_recv() {
        warn!(severity = ?event.severity(), "{}", event.description());
    }
}

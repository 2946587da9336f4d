//! Integration tests for logging system

use async_trait::async_trait;
use core_runtime::Error;
use core_runtime::logging::{
    init_logging, redact_key_id, LogEntry, LogFormat, LogLevel, LoggerSink, LoggingConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct RecordingSink {
    entries: Mutex<Vec<LogEntry>>,
}

#[async_trait]
impl LoggerSink for RecordingSink {
    async fn log(&self, entry: LogEntry) -> core_runtime::Result<()> {
        self.entries.lock().push(entry);
        Ok(())
    }

    fn min_level(&self) -> LogLevel {
        LogLevel::Warn
    }
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn)
        .with_spans(false)
        .with_target(false)
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Compact);
    assert_eq!(config.level, LogLevel::Warn);
    assert!(!config.enable_spans);
    assert!(!config.display_target);
    assert!(config.display_thread_info);
}

#[test]
fn test_format_selection() {
    let config = LoggingConfig::default();

    #[cfg(debug_assertions)]
    assert_eq!(config.format, LogFormat::Pretty);

    #[cfg(not(debug_assertions))]
    assert_eq!(config.format, LogFormat::Json);
}

#[test]
fn test_key_id_redaction() {
    let key_id = b"0123456789abcdef";
    let redacted = redact_key_id(key_id);
    assert!(redacted.starts_with("30313233"));
    assert!(redacted.ends_with("(16 bytes)"));
    assert!(!redacted.contains("abcdef"));
}

#[test]
fn test_log_entry_builder() {
    let entry = LogEntry::new(LogLevel::Error, "core_decode::decoder_stream", "Decode failed")
        .with_field("stream_type", "video")
        .with_span_id("select_decoder");

    assert_eq!(entry.level, LogLevel::Error);
    assert_eq!(entry.fields.get("stream_type"), Some(&"video".to_string()));
    assert_eq!(entry.span_id.as_deref(), Some("select_decoder"));
}

#[test]
fn test_invalid_filter_is_rejected_before_install() {
    let config = LoggingConfig::default().with_filter("core_decode=loud");

    match init_logging(config) {
        Err(Error::InvalidFilter { filter, .. }) => assert_eq!(filter, "core_decode=loud"),
        other => panic!("expected an invalid filter error, got {other:?}"),
    }
}

// Only one global subscriber per process, so initialization is exercised once.
#[test]
fn test_init_logging_forwards_to_sink_and_rejects_second_init() {
    let sink = Arc::new(RecordingSink::default());
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_filter("warn")
        .with_logger_sink(sink.clone());

    init_logging(config).unwrap();

    tracing::warn!(target: "core_decode::selector", "Falling back to next decoder");
    tracing::info!(target: "core_decode::selector", "filtered out");

    let entries = sink.entries.lock();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "Falling back to next decoder");
    drop(entries);

    assert!(init_logging(LoggingConfig::default()).is_err());
}

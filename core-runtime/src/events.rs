//! # Event Bus System
//!
//! Provides an event-driven view of decode pipeline milestones using
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: [`DecodeEvent`] describing decoder selection, fallback,
//!   reinitialization, end of stream, decode errors and resets
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   emit    ┌───────────┐
//! │ Audio pipeline   ├──────────>│           │   subscribe   ┌────────────┐
//! └──────────────────┘           │ EventBus  ├──────────────>│ Subscriber │
//! ┌──────────────────┐   emit    │ (broadcast│               └────────────┘
//! │ Video pipeline   ├──────────>│  channel) │
//! └──────────────────┘           └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{DecodeEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(64);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(DecodeEvent::EndOfStream {
//!         stream_type: "audio".to_string(),
//!     })
//!     .ok();
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.description(), "End of stream reached");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Publishers ignore the error returned when nobody is subscribed.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 64;

// ============================================================================
// Decode Events
// ============================================================================

/// Milestones published by a decoder stream.
///
/// `stream_type` is `"audio"` or `"video"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DecodeEvent {
    /// A decoder was selected and initialized.
    DecoderSelected {
        stream_type: String,
        decoder: String,
        /// Whether the decoder is a hardware/OS decoder.
        platform_decoder: bool,
        /// Whether buffers are decrypted before reaching the decoder.
        decrypting_stream: bool,
    },
    /// A decoder failed to initialize and the next candidate will be tried.
    DecoderFallback {
        stream_type: String,
        failed_decoder: String,
        reason: String,
    },
    /// The source reported a new configuration.
    ConfigChanged { stream_type: String },
    /// The decoder was reinitialized (or replaced) after a config change.
    DecoderReinitialized {
        stream_type: String,
        decoder: String,
        /// `true` if a different decoder took over.
        replaced: bool,
    },
    /// The end-of-stream buffer finished decoding.
    EndOfStream { stream_type: String },
    /// Decoding failed; the stream stays in error until reset.
    DecodeError {
        stream_type: String,
        message: String,
    },
    /// A reset completed.
    Reset { stream_type: String },
}

impl DecodeEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            DecodeEvent::DecoderSelected { .. } => "Decoder selected",
            DecodeEvent::DecoderFallback { .. } => "Falling back to next decoder",
            DecodeEvent::ConfigChanged { .. } => "Stream configuration changed",
            DecodeEvent::DecoderReinitialized { .. } => "Decoder reinitialized",
            DecodeEvent::EndOfStream { .. } => "End of stream reached",
            DecodeEvent::DecodeError { .. } => "Decode error",
            DecodeEvent::Reset { .. } => "Decoder stream reset",
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            DecodeEvent::DecodeError { .. } => EventSeverity::Error,
            DecodeEvent::DecoderFallback { .. } => EventSeverity::Warning,
            DecodeEvent::DecoderSelected { .. } | DecodeEvent::DecoderReinitialized { .. } => {
                EventSeverity::Info
            }
            _ => EventSeverity::Debug,
        }
    }

    /// The stream the event belongs to.
    pub fn stream_type(&self) -> &str {
        match self {
            DecodeEvent::DecoderSelected { stream_type, .. }
            | DecodeEvent::DecoderFallback { stream_type, .. }
            | DecodeEvent::ConfigChanged { stream_type }
            | DecodeEvent::DecoderReinitialized { stream_type, .. }
            | DecodeEvent::EndOfStream { stream_type }
            | DecodeEvent::DecodeError { stream_type, .. }
            | DecodeEvent::Reset { stream_type } => stream_type,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DecodeEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///   When a subscriber falls behind by more than this amount, it will
    ///   receive a `RecvError::Lagged` error.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: DecodeEvent) -> Result<usize, SendError<DecodeEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<DecodeEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&DecodeEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{EventBus, EventSeverity, EventStream};
///
/// let event_bus = EventBus::new(16);
/// let warnings = EventStream::new(event_bus.subscribe())
///     .filter(|event| event.severity() >= EventSeverity::Warning);
/// ```
pub struct EventStream {
    receiver: Receiver<DecodeEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<DecodeEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    ///
    /// Filters compose: an event must pass every filter applied so far.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DecodeEvent) -> bool + Send + Sync + 'static,
    {
        let combined: EventFilter = match self.filter.take() {
            Some(previous) => {
                Box::new(move |event: &DecodeEvent| previous(event) && predicate(event))
            }
            None => Box::new(predicate),
        };
        self.filter = Some(combined);
        self
    }

    /// Keep only events for one stream type.
    pub fn for_stream(self, stream_type: &str) -> Self {
        let stream_type = stream_type.to_string();
        self.filter(move |event| event.stream_type() == stream_type)
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<DecodeEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<DecodeEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    fn matches(&self, event: &DecodeEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

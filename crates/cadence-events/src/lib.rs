//! Core event system traits and types for cadence
//!
//! This crate provides the foundational types for the event system, allowing the
//! host crate and the applications embedding it to share one event vocabulary
//! without depending on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

pub mod value;

pub use value::{FunctionRef, ScriptValue};

// ============================================================================
// Event Source and Context
// ============================================================================

/// Source of the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Event originated from the script itself (print, load, errors)
    Script,
    /// Event originated from the host's run loop or lifecycle
    Host,
    /// Event originated from fetching script contents
    Loader,
}

/// Context information attached to all events
#[derive(Debug, Clone)]
pub struct EventContext {
    /// ID of the host that generated this event
    pub host_id: u64,
    /// Sequence number for this event, relative to the host
    pub host_sequence: u64,
    /// Additional metadata
    pub metadata: HashMap<String, String>,
}

impl EventContext {
    pub fn new(host_id: u64, host_sequence: u64) -> Self {
        Self {
            host_id,
            host_sequence,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Everything a script host announces to the outside world
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Script contents were loaded from a file or URL
    ScriptLoaded { origin: String },
    /// Script contents could not be loaded
    ErrorLoadingScript { origin: String },
    /// An evaluate call completed (emitted even during shutdown)
    EvaluationFinished {
        result: ScriptValue,
        had_exception: bool,
    },
    /// An uncaught script exception, formatted for display
    ErrorMessage { message: String },
    /// The running/finished state of the host changed
    RunningStateChanged,
    /// One tick completed; `delta_time` is in seconds
    Update { delta_time: f32 },
    /// The run loop is exiting, timers are already cancelled
    ScriptEnding,
    /// The run loop has exited
    Finished { origin: String },
    /// Emitted last, after the running flag is cleared
    DoneRunning,
    /// Output from the script's print()
    PrintedMessage { message: String },
    /// The script asked the application to load another standalone script
    LoadScriptRequest { url: String, is_user_loaded: bool },
}

impl HostEvent {
    /// Short name used for logging and statistics
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::ScriptLoaded { .. } => "script-loaded",
            HostEvent::ErrorLoadingScript { .. } => "error-loading-script",
            HostEvent::EvaluationFinished { .. } => "evaluation-finished",
            HostEvent::ErrorMessage { .. } => "error-message",
            HostEvent::RunningStateChanged => "running-state-changed",
            HostEvent::Update { .. } => "update",
            HostEvent::ScriptEnding => "script-ending",
            HostEvent::Finished { .. } => "finished",
            HostEvent::DoneRunning => "done-running",
            HostEvent::PrintedMessage { .. } => "printed-message",
            HostEvent::LoadScriptRequest { .. } => "load-script-request",
        }
    }
}

// ============================================================================
// Event Envelope
// ============================================================================

/// Complete event envelope
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: HostEvent,
    pub context: EventContext,
    pub timestamp: Instant,
    pub source: EventSource,
}

impl EventEnvelope {
    pub fn new(event: HostEvent, context: EventContext, source: EventSource) -> Self {
        Self {
            event,
            context,
            timestamp: Instant::now(),
            source,
        }
    }

    pub fn host_id(&self) -> u64 {
        self.context.host_id
    }
}

// ============================================================================
// Event Consumer Trait
// ============================================================================

/// Trait for consuming host events - lets applications plug in logging, stats, UIs
pub trait EventConsumer: Send + 'static {
    /// Handle an event envelope
    fn handle_event(&mut self, envelope: EventEnvelope);
}

// ============================================================================
// Event Bus
// ============================================================================

/// Event sender that a single host uses to publish events
///
/// Once detached the sender silently drops everything it is asked to publish;
/// stop-all uses this to cut a host off from the application while it unwinds.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: broadcast::Sender<EventEnvelope>,
    host_id: u64,
    sequence: Arc<AtomicU64>,
    detached: Arc<AtomicBool>,
}

impl EventSender {
    pub fn new(sender: broadcast::Sender<EventEnvelope>, host_id: u64) -> Self {
        Self {
            sender,
            host_id,
            sequence: Arc::new(AtomicU64::new(0)),
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish an event on behalf of this sender's host
    pub fn publish(&self, event: HostEvent, source: EventSource) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let context = EventContext::new(self.host_id, sequence);
        // No subscribers is not an error
        let _ = self.sender.send(EventEnvelope::new(event, context, source));
    }

    /// Stop delivering events from this host to any subscriber
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Resume delivery after a [`detach`](Self::detach)
    pub fn attach(&self) {
        self.detached.store(false, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub fn host_id(&self) -> u64 {
        self.host_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

/// Central event bus shared by every host the application owns
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<EventEnvelope>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (EventBus { sender }, receiver)
    }

    pub fn create_sender(&self, host_id: u64) -> EventSender {
        EventSender::new(self.sender.clone(), host_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

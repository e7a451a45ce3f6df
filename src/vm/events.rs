//! Lifecycle event notification.
//!
//! Delivery is fire-and-forget: an event reaches the subscribers that exist
//! when it is published and is lost otherwise. Nothing is replayed. Log
//! lines are stored in the [`LogBuffer`](super::logs::LogBuffer) before they
//! are published, so a lost event never loses captured output.

use super::state::Phase;
use serde::{Deserialize, Serialize};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// Per-subscriber queue depth. Slow subscribers skip what they missed.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A notification about the supervised VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The lifecycle phase changed.
    Transition {
        /// Phase before.
        from: Phase,
        /// Phase after.
        to: Phase,
        /// Human-readable context, e.g. why the VM stopped.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A line of output was captured.
    Log {
        /// The line, without terminator.
        line: String,
    },
}

impl LifecycleEvent {
    /// Create a transition event.
    pub fn transition(from: Phase, to: Phase, message: Option<String>) -> Self {
        Self::Transition { from, to, message }
    }

    /// Create a log event.
    pub fn log(line: impl Into<String>) -> Self {
        Self::Log { line: line.into() }
    }

    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Transition { .. } => EventKind::Transition,
            LifecycleEvent::Log { .. } => EventKind::Log,
        }
    }
}

/// Event kinds a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Phase changes.
    Transition,
    /// Captured output lines.
    Log,
}

impl EventKind {
    /// Wire name, as used in filters and SSE event names.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Transition => "transition",
            EventKind::Log => "log",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transition" => Ok(EventKind::Transition),
            "log" => Ok(EventKind::Log),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// Broadcasts events to all current subscribers.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNotifier {
    /// Create a notifier with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to everyone subscribed right now. Never blocks or fails.
    pub fn publish(&self, event: LifecycleEvent) {
        // No receivers is the normal case, not an error.
        let _ = self.tx.send(event);
    }

    /// Subscribe to one kind of event, or all of them with `None`.
    pub fn subscribe(&self, kind: Option<EventKind>) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kind,
        }
    }

    /// Run `callback` on a dedicated thread for every matching event until
    /// the returned handle is cancelled or dropped.
    pub fn subscribe_with<F>(&self, kind: Option<EventKind>, callback: F) -> CallbackSubscription
    where
        F: FnMut(LifecycleEvent) + Send + 'static,
    {
        let mut sub = self.subscribe(kind);
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        let mut callback = callback;

        let handle = std::thread::Builder::new()
            .name("dockvm-events".into())
            .spawn(move || {
                let rt = match current_thread_runtime() {
                    Some(rt) => rt,
                    None => return,
                };
                loop {
                    // The callback runs outside the runtime so it may block freely.
                    let next = rt.block_on(async {
                        tokio::select! {
                            biased;
                            _ = &mut cancelled => None,
                            event = sub.recv() => event,
                        }
                    });
                    match next {
                        Some(event) => callback(event),
                        None => break,
                    }
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn event callback thread");
                None
            }
        };

        CallbackSubscription {
            cancel: Some(cancel),
            handle,
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

fn current_thread_runtime() -> Option<tokio::runtime::Runtime> {
    match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => Some(rt),
        Err(e) => {
            tracing::warn!(error = %e, "failed to build event runtime");
            None
        }
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<LifecycleEvent>,
    kind: Option<EventKind>,
}

impl Subscription {
    fn matches(&self, event: &LifecycleEvent) -> bool {
        self.kind.map_or(true, |k| event.kind() == k)
    }

    /// Next already-queued event, if any.
    pub fn try_next(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    /// Block up to `timeout` for the next matching event.
    ///
    /// Returns `None` on timeout or once the notifier is gone. Like
    /// `blocking_recv`, this must not be called from async code; use
    /// [`recv`](Self::recv) there.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<LifecycleEvent> {
        let rt = current_thread_runtime()?;
        rt.block_on(tokio::time::timeout(timeout, self.recv()))
            .ok()
            .flatten()
    }

    /// Await the next matching event from async code.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Callback subscription; stops delivering once cancelled or dropped.
#[derive(Debug)]
pub struct CallbackSubscription {
    cancel: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CallbackSubscription {
    /// Stop delivery and wait for an in-progress callback to return.
    pub fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the callback thread.
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

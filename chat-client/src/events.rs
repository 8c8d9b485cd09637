//! Typed event bus.
//!
//! Listeners register for one [`EventKind`] and are called in registration
//! order. The bus never holds its lock while a listener runs, so listeners
//! may register or remove listeners themselves.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chat_core::StatusChange;
use chat_types::{ChatMessage, LocalId, MessageDeleted, ReadReceipt, StatusUpdate, TypingNotification};

use crate::error::ErrorKind;

/// Something the application may want to react to.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// The connection changed state.
    ConnectionStatus(StatusChange),
    /// A reconnection attempt was scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Attempt cap.
        max_attempts: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Automatic reconnection gave up; only a manual retry helps now.
    MaxAttemptsReached {
        /// Attempts made.
        attempts: u32,
    },
    /// A message to show. `replaces` is set when it confirms an optimistic entry.
    NewMessage {
        /// Authoritative message.
        message: ChatMessage,
        /// Optimistic entry this message replaces.
        replaces: Option<LocalId>,
    },
    /// An optimistic message failed to send or was never confirmed.
    MessageFailed {
        /// Failed entry.
        local_id: LocalId,
        /// What went wrong.
        error: String,
    },
    /// Typing indicator.
    Typing(TypingNotification),
    /// Read receipt.
    ReadReceipt(ReadReceipt),
    /// Message deletion.
    MessageDeleted(MessageDeleted),
    /// Presence update.
    StatusUpdate(StatusUpdate),
    /// Error worth surfacing (server notice, malformed payload, exhaustion).
    Error {
        /// Classification.
        kind: ErrorKind,
        /// Description.
        message: String,
    },
}

impl ChatEvent {
    /// Kind used for listener routing.
    pub fn kind(&self) -> EventKind {
        match self {
            ChatEvent::ConnectionStatus(_) => EventKind::ConnectionStatus,
            ChatEvent::Reconnecting { .. } => EventKind::Reconnecting,
            ChatEvent::MaxAttemptsReached { .. } => EventKind::MaxAttemptsReached,
            ChatEvent::NewMessage { .. } => EventKind::NewMessage,
            ChatEvent::MessageFailed { .. } => EventKind::MessageFailed,
            ChatEvent::Typing(_) => EventKind::Typing,
            ChatEvent::ReadReceipt(_) => EventKind::ReadReceipt,
            ChatEvent::MessageDeleted(_) => EventKind::MessageDeleted,
            ChatEvent::StatusUpdate(_) => EventKind::StatusUpdate,
            ChatEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`ChatEvent::ConnectionStatus`]
    ConnectionStatus,
    /// [`ChatEvent::Reconnecting`]
    Reconnecting,
    /// [`ChatEvent::MaxAttemptsReached`]
    MaxAttemptsReached,
    /// [`ChatEvent::NewMessage`]
    NewMessage,
    /// [`ChatEvent::MessageFailed`]
    MessageFailed,
    /// [`ChatEvent::Typing`]
    Typing,
    /// [`ChatEvent::ReadReceipt`]
    ReadReceipt,
    /// [`ChatEvent::MessageDeleted`]
    MessageDeleted,
    /// [`ChatEvent::StatusUpdate`]
    StatusUpdate,
    /// [`ChatEvent::Error`]
    Error,
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

/// Ordered listener registry.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<(ListenerId, EventKind, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, EventKind, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener for one kind of event.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().push((id, kind, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deliver an event to every listener of its kind.
    pub fn emit(&self, event: &ChatEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        for listener in targets {
            listener(event);
        }
    }

    /// Number of listeners for one kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().iter().filter(|(_, k, _)| *k == kind).count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn typing() -> ChatEvent {
        ChatEvent::Typing(TypingNotification {
            sender_id: chat_types::UserId::new(2),
            receiver_id: None,
            typing: true,
        })
    }

    #[test]
    fn listeners_receive_their_kind_only() {
        let bus = EventBus::new();
        let typing_calls = Arc::new(AtomicUsize::new(0));
        let error_calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&typing_calls);
        bus.on(EventKind::Typing, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&error_calls);
        bus.on(EventKind::Error, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&typing());
        assert_eq!(typing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(error_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            bus.on(EventKind::Typing, move |_| order.lock().unwrap().push(n));
        }
        bus.emit(&typing());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = bus.on(EventKind::Typing, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&typing());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(EventKind::Typing), 0);
    }

    #[test]
    fn listener_may_unregister_itself() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let bus_ref = Arc::clone(&bus);
        let slot_ref = Arc::clone(&slot);
        let id = bus.on(EventKind::Typing, move |_| {
            if let Some(id) = *slot_ref.lock().unwrap() {
                bus_ref.off(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        bus.emit(&typing());
        assert_eq!(bus.listener_count(EventKind::Typing), 0);
    }
}

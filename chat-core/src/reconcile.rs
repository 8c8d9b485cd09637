//! Optimistic message reconciliation.
//!
//! A sent message is shown immediately under a client-chosen [`LocalId`].
//! The server never echoes that id, so its authoritative copy is matched
//! back heuristically: same counterparty, identical content, and arriving
//! within a tolerance of the local send. When several pending entries
//! qualify, the earliest one wins. This is best effort: two identical rapid
//! sends may pair in either order, but never twice.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chat_types::{ChatMessage, LocalId, UserId};

/// Lifecycle of an optimistic entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingStatus {
    /// Waiting for the server copy.
    Pending,
    /// Matched with a server message.
    Confirmed {
        /// When it was matched.
        at: Instant,
    },
    /// Send failed or confirmation never arrived.
    Failed {
        /// What went wrong.
        error: String,
        /// When it failed.
        at: Instant,
    },
}

/// A client-side message not yet (or just) confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Client-chosen identifier.
    pub local_id: LocalId,
    /// Message text.
    pub content: String,
    /// Recipient.
    pub counterparty: UserId,
    /// When the send was (last) attempted.
    pub created_at: Instant,
    /// Current status.
    pub status: PendingStatus,
    /// Authoritative copy once confirmed.
    pub server_message: Option<ChatMessage>,
}

impl PendingMessage {
    /// Whether the entry still waits for a server copy.
    pub fn is_pending(&self) -> bool {
        self.status == PendingStatus::Pending
    }

    /// Whether the entry failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.status, PendingStatus::Failed { .. })
    }
}

/// Outcome of reconciling one server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The server message confirms this optimistic entry.
    Confirmed {
        /// Entry that was confirmed.
        local_id: LocalId,
    },
    /// No optimistic entry matches; the message is new.
    New,
}

/// Matching and retention windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Maximum age of a pending entry that may still match.
    pub match_tolerance: Duration,
    /// How long confirmed and failed entries are kept.
    pub grace_period: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            match_tolerance: Duration::from_secs(10),
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Ledger of optimistic messages.
#[derive(Debug, Default)]
pub struct Reconciler {
    policy: ReconcilePolicy,
    entries: VecDeque<PendingMessage>,
}

impl Reconciler {
    /// Create an empty ledger.
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self {
            policy,
            entries: VecDeque::new(),
        }
    }

    /// Record a freshly sent message.
    pub fn record_pending(
        &mut self,
        local_id: LocalId,
        content: &str,
        counterparty: UserId,
        now: Instant,
    ) {
        self.entries.push_back(PendingMessage {
            local_id,
            content: content.to_string(),
            counterparty,
            created_at: now,
            status: PendingStatus::Pending,
            server_message: None,
        });
    }

    /// Match a server message sent by the local user against pending entries.
    pub fn reconcile(&mut self, message: &ChatMessage, now: Instant) -> Reconciliation {
        let tolerance = self.policy.match_tolerance;
        let candidate = self
            .entries
            .iter_mut()
            .filter(|e| {
                e.is_pending()
                    && e.counterparty == message.receiver_id
                    && e.content == message.content
                    && now.saturating_duration_since(e.created_at) <= tolerance
            })
            .min_by_key(|e| e.created_at);

        match candidate {
            Some(entry) => {
                entry.status = PendingStatus::Confirmed { at: now };
                entry.server_message = Some(message.clone());
                Reconciliation::Confirmed {
                    local_id: entry.local_id,
                }
            }
            None => Reconciliation::New,
        }
    }

    /// Mark a pending entry as failed. Returns false if it is not pending.
    pub fn mark_failed(&mut self, local_id: LocalId, error: &str, now: Instant) -> bool {
        match self.entry_mut(local_id) {
            Some(entry) if entry.is_pending() => {
                entry.status = PendingStatus::Failed {
                    error: error.to_string(),
                    at: now,
                };
                true
            }
            _ => false,
        }
    }

    /// Turn a failed entry back into a pending one with a fresh timestamp.
    ///
    /// Returns the entry to republish, or `None` if it is not failed.
    pub fn retry(&mut self, local_id: LocalId, now: Instant) -> Option<PendingMessage> {
        let entry = self.entry_mut(local_id)?;
        if !entry.is_failed() {
            return None;
        }
        entry.status = PendingStatus::Pending;
        entry.created_at = now;
        Some(entry.clone())
    }

    /// Expire stale entries.
    ///
    /// Pending entries older than the match tolerance fail with
    /// "confirmation timeout" (their ids are returned). Confirmed and failed
    /// entries are dropped once older than the grace period.
    pub fn sweep(&mut self, now: Instant) -> Vec<LocalId> {
        let tolerance = self.policy.match_tolerance;
        let grace = self.policy.grace_period;
        let mut timed_out = Vec::new();

        for entry in self.entries.iter_mut() {
            if entry.is_pending() && now.saturating_duration_since(entry.created_at) > tolerance {
                entry.status = PendingStatus::Failed {
                    error: "confirmation timeout".into(),
                    at: now,
                };
                timed_out.push(entry.local_id);
            }
        }

        self.entries.retain(|entry| match entry.status {
            PendingStatus::Pending => true,
            PendingStatus::Confirmed { at } | PendingStatus::Failed { at, .. } => {
                now.saturating_duration_since(at) < grace
            }
        });

        timed_out
    }

    /// Look up an entry.
    pub fn get(&self, local_id: LocalId) -> Option<&PendingMessage> {
        self.entries.iter().find(|e| e.local_id == local_id)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &PendingMessage> {
        self.entries.iter()
    }

    /// Number of entries still waiting for confirmation.
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    /// Number of entries of any status.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, local_id: LocalId) -> Option<&mut PendingMessage> {
        self.entries.iter_mut().find(|e| e.local_id == local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_types::{MessageId, MessageKind};

    const ME: UserId = UserId::new(1);
    const FIVE: UserId = UserId::new(5);

    fn server_message(id: u64, receiver: UserId, content: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(id),
            content: content.into(),
            sender_id: ME,
            receiver_id: receiver,
            timestamp: 0,
            attachment_url: None,
            read: false,
            delivered: false,
            message_type: MessageKind::Text,
        }
    }

    #[test]
    fn matching_server_message_confirms_entry() {
        let mut rec = Reconciler::default();
        let t0 = Instant::now();
        let local = LocalId::new();
        rec.record_pending(local, "hi", FIVE, t0);

        let outcome = rec.reconcile(&server_message(42, FIVE, "hi"), t0 + Duration::from_millis(300));
        assert_eq!(outcome, Reconciliation::Confirmed { local_id: local });

        let entry = rec.get(local).unwrap();
        assert!(matches!(entry.status, PendingStatus::Confirmed { .. }));
        assert_eq!(entry.server_message.as_ref().unwrap().id, MessageId::new(42));
        assert_eq!(rec.pending_count(), 0);
    }

    #[test]
    fn different_content_or_counterparty_is_new() {
        let mut rec = Reconciler::default();
        let t0 = Instant::now();
        rec.record_pending(LocalId::new(), "hi", FIVE, t0);
        assert_eq!(rec.reconcile(&server_message(1, FIVE, "hello"), t0), Reconciliation::New);
        assert_eq!(rec.reconcile(&server_message(2, UserId::new(6), "hi"), t0), Reconciliation::New);
        assert_eq!(rec.pending_count(), 1);
    }

    #[test]
    fn entry_outside_tolerance_does_not_match() {
        let mut rec = Reconciler::default();
        let t0 = Instant::now();
        rec.record_pending(LocalId::new(), "hi", FIVE, t0);
        let late = t0 + Duration::from_secs(11);
        assert_eq!(rec.reconcile(&server_message(1, FIVE, "hi"), late), Reconciliation::New);
    }

    #[test]
    fn identical_rapid_sends_pair_fifo() {
        let mut rec = Reconciler::default();
        let t0 = Instant::now();
        let first = LocalId::new();
        let second = LocalId::new();
        rec.record_pending(first, "hi", FIVE, t0);
        rec.record_pending(second, "hi", FIVE, t0 + Duration::from_millis(10));

        let now = t0 + Duration::from_millis(500);
        assert_eq!(
            rec.reconcile(&server_message(1, FIVE, "hi"), now),
            Reconciliation::Confirmed { local_id: first }
        );
        assert_eq!(
            rec.reconcile(&server_message(2, FIVE, "hi"), now),
            Reconciliation::Confirmed { local_id: second }
        );
        // a third copy has nothing left to confirm
        assert_eq!(rec.reconcile(&server_message(3, FIVE, "hi"), now), Reconciliation::New);
    }

    #[test]
    fn failed_entries_do_not_match() {
        let mut rec = Reconciler::default();
        let t0 = Instant::now();
        let local = LocalId::new();
        rec.record_pending(local, "hi", FIVE, t0);
        assert!(rec.mark_failed(local, "not connected", t0));
        assert!(!rec.mark_failed(local, "again", t0));
        assert_eq!(rec.reconcile(&server_message(1, FIVE, "hi"), t0), Reconciliation::New);
    }

    #[test]
    fn retry_restores_pending_with_fresh_timestamp() {
        let mut rec = Reconciler::default();
        let t0 = Instant::now();
        let local = LocalId::new();
        rec.record_pending(local, "hi", FIVE, t0);
        rec.mark_failed(local, "offline", t0);

        let later = t0 + Duration::from_secs(30);
        let entry = rec.retry(local, later).unwrap();
        assert!(entry.is_pending());
        assert_eq!(entry.created_at, later);
        assert_eq!(
            rec.reconcile(&server_message(9, FIVE, "hi"), later + Duration::from_secs(1)),
            Reconciliation::Confirmed { local_id: local }
        );
    }

    #[test]
    fn retry_of_pending_entry_is_refused() {
        let mut rec = Reconciler::default();
        let local = LocalId::new();
        rec.record_pending(local, "hi", FIVE, Instant::now());
        assert!(rec.retry(local, Instant::now()).is_none());
        assert!(rec.retry(LocalId::new(), Instant::now()).is_none());
    }

    #[test]
    fn sweep_times_out_unconfirmed_entries() {
        let mut rec = Reconciler::default();
        let t0 = Instant::now();
        let local = LocalId::new();
        rec.record_pending(local, "hi", FIVE, t0);

        assert!(rec.sweep(t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(rec.sweep(t0 + Duration::from_secs(11)), vec![local]);
        match &rec.get(local).unwrap().status {
            PendingStatus::Failed { error, .. } => assert_eq!(error, "confirmation timeout"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn sweep_evicts_settled_entries_after_grace() {
        let mut rec = Reconciler::default();
        let t0 = Instant::now();
        let local = LocalId::new();
        rec.record_pending(local, "hi", FIVE, t0);
        rec.reconcile(&server_message(1, FIVE, "hi"), t0);

        rec.sweep(t0 + Duration::from_secs(59));
        assert!(rec.get(local).is_some());
        rec.sweep(t0 + Duration::from_secs(60));
        assert!(rec.get(local).is_none());
        assert!(rec.is_empty());
    }
}

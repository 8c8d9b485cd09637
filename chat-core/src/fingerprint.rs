//! Duplicate suppression for outbound sends and inbound deliveries.
//!
//! Two independent stores:
//! - outbound fingerprints `(sha256(content), counterparty)` remembered for a
//!   short window, so a double tap or an eager retry publishes once;
//! - a bounded set of processed server message ids, so redeliveries and
//!   overlapping channels reach the application once.
//!
//! Check and record happen in one `&mut self` call, so callers holding the
//! store behind a lock get an atomic check-then-record.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chat_types::{MessageId, UserId};

/// Default outbound suppression window.
pub const DEFAULT_OUTBOUND_WINDOW: Duration = Duration::from_secs(3);

/// Default number of remembered inbound message ids.
pub const DEFAULT_PROCESSED_CAPACITY: usize = 200;

/// Identity of an outbound send for dedup purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    digest: String,
    counterparty: UserId,
}

impl Fingerprint {
    /// Compute the fingerprint of `content` sent to `counterparty`.
    pub fn new(content: &str, counterparty: UserId) -> Self {
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        Self {
            digest,
            counterparty,
        }
    }

    /// Hex-encoded content digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Recipient of the send.
    pub fn counterparty(&self) -> UserId {
        self.counterparty
    }
}

/// Outbound and inbound dedup state.
#[derive(Debug)]
pub struct FingerprintStore {
    window: Duration,
    outbound: HashMap<Fingerprint, Instant>,
    capacity: usize,
    processed_order: VecDeque<MessageId>,
    processed: HashSet<MessageId>,
}

impl Default for FingerprintStore {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_WINDOW, DEFAULT_PROCESSED_CAPACITY)
    }
}

impl FingerprintStore {
    /// Create a store with the given outbound window and processed-id capacity.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            outbound: HashMap::new(),
            capacity: capacity.max(1),
            processed_order: VecDeque::new(),
            processed: HashSet::new(),
        }
    }

    /// Returns true if the same content went to the same counterparty within
    /// the window; otherwise records the send and returns false.
    pub fn should_suppress_outbound(
        &mut self,
        content: &str,
        counterparty: UserId,
        now: Instant,
    ) -> bool {
        self.prune(now);
        let fingerprint = Fingerprint::new(content, counterparty);
        if self.outbound.contains_key(&fingerprint) {
            return true;
        }
        self.outbound.insert(fingerprint, now);
        false
    }

    /// Forget an outbound fingerprint, e.g. after its publish failed.
    pub fn forget_outbound(&mut self, content: &str, counterparty: UserId) -> bool {
        self.outbound
            .remove(&Fingerprint::new(content, counterparty))
            .is_some()
    }

    /// Drop outbound fingerprints older than the window.
    pub fn prune(&mut self, now: Instant) -> usize {
        let window = self.window;
        let before = self.outbound.len();
        self.outbound
            .retain(|_, recorded| now.saturating_duration_since(*recorded) < window);
        before - self.outbound.len()
    }

    /// Returns true if `id` was already processed; otherwise remembers it,
    /// evicting the oldest id once the capacity is exceeded.
    pub fn should_suppress_inbound(&mut self, id: MessageId) -> bool {
        if !self.processed.insert(id) {
            return true;
        }
        self.processed_order.push_back(id);
        while self.processed_order.len() > self.capacity {
            if let Some(oldest) = self.processed_order.pop_front() {
                self.processed.remove(&oldest);
            }
        }
        false
    }

    /// Whether `id` is currently remembered as processed.
    pub fn was_processed(&self, id: MessageId) -> bool {
        self.processed.contains(&id)
    }

    /// Number of live outbound fingerprints.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Number of remembered inbound ids.
    pub fn processed_len(&self) -> usize {
        self.processed_order.len()
    }

    /// Outbound suppression window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

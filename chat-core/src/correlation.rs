//! Pending request table for pseudo request/response.
//!
//! The server answers every request of one type on a single reply channel,
//! so a reply cannot name the request it answers. Two resolution modes:
//!
//! - **Latest wins** (reply without a correlation id): the most recently
//!   issued request of that type is resolved. Issuing a request displaces
//!   the previous one of the same type, which can then only expire.
//! - **Exact** (reply echoing a correlation id): the request with that id is
//!   resolved, regardless of issue order.
//!
//! Entries never resolve twice: every accessor removes the entry it returns.

use std::collections::HashMap;
use std::time::Instant;

/// Identifier of one pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// One outstanding request.
#[derive(Debug)]
pub struct PendingEntry<R> {
    /// Request type (one reply channel per type).
    pub request_type: String,
    /// Client-generated correlation id, when the protocol carries one.
    pub correlation_id: Option<String>,
    /// When the request was issued.
    pub created_at: Instant,
    /// Completion handle owned by the caller's runtime.
    pub responder: R,
}

/// Table of outstanding requests, generic over the completion handle.
#[derive(Debug)]
pub struct PendingRequests<R> {
    entries: HashMap<RequestId, PendingEntry<R>>,
    latest: HashMap<String, RequestId>,
    next_id: u64,
}

impl<R> Default for PendingRequests<R> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            latest: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<R> PendingRequests<R> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request; it becomes the latest of its type.
    pub fn insert(
        &mut self,
        request_type: &str,
        correlation_id: Option<String>,
        responder: R,
        now: Instant,
    ) -> RequestId {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        self.entries.insert(
            id,
            PendingEntry {
                request_type: request_type.to_string(),
                correlation_id,
                created_at: now,
                responder,
            },
        );
        self.latest.insert(request_type.to_string(), id);
        id
    }

    /// Take the request a reply of `request_type` resolves.
    ///
    /// With a correlation id only the matching request qualifies; without one
    /// the latest request of the type does. Returns `None` when the reply
    /// answers nothing still pending.
    pub fn take_for_response(
        &mut self,
        request_type: &str,
        correlation_id: Option<&str>,
    ) -> Option<(RequestId, PendingEntry<R>)> {
        let id = match correlation_id {
            Some(cid) => self
                .entries
                .iter()
                .find(|(_, e)| {
                    e.request_type == request_type && e.correlation_id.as_deref() == Some(cid)
                })
                .map(|(id, _)| *id)?,
            None => *self.latest.get(request_type)?,
        };
        self.remove(id).map(|entry| (id, entry))
    }

    /// Remove a request (timeout, publish failure).
    pub fn remove(&mut self, id: RequestId) -> Option<PendingEntry<R>> {
        let entry = self.entries.remove(&id)?;
        if self.latest.get(&entry.request_type) == Some(&id) {
            self.latest.remove(&entry.request_type);
        }
        Some(entry)
    }

    /// Remove every request (connection loss).
    pub fn drain(&mut self) -> Vec<(RequestId, PendingEntry<R>)> {
        self.latest.clear();
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    /// Whether a request is still pending.
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of pending requests of a type, displaced ones included.
    pub fn count_of_type(&self, request_type: &str) -> usize {
        self.entries
            .values()
            .filter(|e| e.request_type == request_type)
            .count()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Logical subscription bookkeeping.
//!
//! The registry separates what the application wants to hear (registrations,
//! which live until explicitly removed) from what the current connection is
//! actually subscribed to (activations, which die with the connection).
//!
//! One live transport subscription per channel fans out to every handler
//! registered on that channel, in registration order. Activation is a
//! two-step protocol so the caller can perform the transport round trip
//! outside any lock:
//!
//! 1. [`SubscriptionRegistry::begin_activation`] marks channels as activating
//!    for an epoch and returns the ones that need a transport subscription.
//! 2. [`SubscriptionRegistry::complete_activation`] records the handle, or
//!    reports it as stale if the channel was dropped or the epoch moved on
//!    in the meantime.

use std::collections::{BTreeMap, HashMap};

use chat_types::{SubscriptionId, TransportHandle};

use crate::state::SessionEpoch;

/// Live state of one channel on the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Not subscribed on the transport.
    Inactive,
    /// Transport subscription in flight.
    Activating {
        /// Epoch the activation belongs to.
        epoch: SessionEpoch,
    },
    /// Subscribed on the transport.
    Active {
        /// Transport handle of the live subscription.
        handle: TransportHandle,
        /// Epoch the handle belongs to.
        epoch: SessionEpoch,
    },
}

/// Result of completing an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The handle is now the channel's live subscription.
    Active,
    /// Nobody wants this handle any more; the caller should unsubscribe it.
    Stale(TransportHandle),
}

/// Result of removing a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    /// Channel the registration was on.
    pub channel: String,
    /// Live handle to release, set when the last handler left an active channel.
    pub released: Option<TransportHandle>,
}

#[derive(Debug)]
struct Channel<H> {
    activation: Activation,
    subscribers: Vec<(SubscriptionId, H)>,
}

/// Registry of logical subscriptions, generic over the handler type.
#[derive(Debug)]
pub struct SubscriptionRegistry<H> {
    channels: BTreeMap<String, Channel<H>>,
    index: HashMap<SubscriptionId, String>,
    next_id: u64,
}

impl<H> Default for SubscriptionRegistry<H> {
    fn default() -> Self {
        Self {
            channels: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<H: Clone> SubscriptionRegistry<H> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler on a channel.
    ///
    /// The registration starts inactive unless the channel already has a live
    /// (or in-flight) transport subscription.
    pub fn register(&mut self, channel: &str, handler: H) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId::new(self.next_id);
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| Channel {
                activation: Activation::Inactive,
                subscribers: Vec::new(),
            })
            .subscribers
            .push((id, handler));
        self.index.insert(id, channel.to_string());
        id
    }

    /// Remove a registration. Returns `None` for unknown ids.
    pub fn unregister(&mut self, id: SubscriptionId) -> Option<Unregistered> {
        let channel_name = self.index.remove(&id)?;
        let mut released = None;

        if let Some(channel) = self.channels.get_mut(&channel_name) {
            channel.subscribers.retain(|(sub, _)| *sub != id);
            if channel.subscribers.is_empty() {
                if let Activation::Active { handle, .. } = channel.activation {
                    released = Some(handle);
                }
                self.channels.remove(&channel_name);
            }
        }

        Some(Unregistered {
            channel: channel_name,
            released,
        })
    }

    /// Mark every registered channel that is not already live (or activating)
    /// in `epoch` as activating, and return those channels.
    ///
    /// Calling this twice for the same epoch returns nothing the second time.
    pub fn begin_activation(&mut self, epoch: SessionEpoch) -> Vec<String> {
        let mut pending = Vec::new();
        for (name, channel) in self.channels.iter_mut() {
            if needs_activation(channel.activation, epoch) {
                channel.activation = Activation::Activating { epoch };
                pending.push(name.clone());
            }
        }
        pending
    }

    /// Single-channel variant of [`Self::begin_activation`].
    pub fn begin_channel_activation(&mut self, channel: &str, epoch: SessionEpoch) -> bool {
        match self.channels.get_mut(channel) {
            Some(entry) if needs_activation(entry.activation, epoch) => {
                entry.activation = Activation::Activating { epoch };
                true
            }
            _ => false,
        }
    }

    /// Record the transport handle for an activation started in `epoch`.
    pub fn complete_activation(
        &mut self,
        channel: &str,
        epoch: SessionEpoch,
        handle: TransportHandle,
    ) -> Completion {
        match self.channels.get_mut(channel) {
            Some(entry) if entry.activation == (Activation::Activating { epoch }) => {
                entry.activation = Activation::Active { handle, epoch };
                Completion::Active
            }
            _ => Completion::Stale(handle),
        }
    }

    /// Undo an activation that failed on the transport.
    pub fn abort_activation(&mut self, channel: &str, epoch: SessionEpoch) {
        if let Some(entry) = self.channels.get_mut(channel) {
            if entry.activation == (Activation::Activating { epoch }) {
                entry.activation = Activation::Inactive;
            }
        }
    }

    /// Mark every channel inactive, returning the handles that were live.
    ///
    /// Registrations are kept.
    pub fn deactivate_all(&mut self) -> Vec<TransportHandle> {
        let mut handles = Vec::new();
        for channel in self.channels.values_mut() {
            if let Activation::Active { handle, .. } = channel.activation {
                handles.push(handle);
            }
            channel.activation = Activation::Inactive;
        }
        handles
    }

    /// Handlers registered on a channel, in registration order.
    pub fn handlers(&self, channel: &str) -> Vec<H> {
        self.channels
            .get(channel)
            .map(|entry| entry.subscribers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Live state of a channel, `None` if nothing is registered on it.
    pub fn activation(&self, channel: &str) -> Option<Activation> {
        self.channels.get(channel).map(|entry| entry.activation)
    }

    /// Whether the channel has a live transport subscription.
    pub fn is_active(&self, channel: &str) -> bool {
        matches!(self.activation(channel), Some(Activation::Active { .. }))
    }

    /// Whether a registration id is known.
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.index.contains_key(&id)
    }

    /// Channel a registration is on.
    pub fn channel_of(&self, id: SubscriptionId) -> Option<&str> {
        self.index.get(&id).map(String::as_str)
    }

    /// Registered channel names.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn needs_activation(activation: Activation, epoch: SessionEpoch) -> bool {
    match activation {
        Activation::Inactive => true,
        Activation::Activating { epoch: current } | Activation::Active { epoch: current, .. } => {
            current != epoch
        }
    }
}

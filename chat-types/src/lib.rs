//! # chat-types
//!
//! Payload and routing types for the chatsync messaging engine.
//!
//! This crate provides the foundational types used across all chatsync crates:
//! - [`UserId`], [`MessageId`], [`LocalId`], [`SubscriptionId`], [`TransportHandle`] - identity types
//! - [`ChatMessage`], [`Conversation`], [`TypingNotification`] and friends - payload schemas
//! - [`InboundFrame`] - a message received on a named destination
//! - [`RequestRoute`] and the `destinations` constants - where things are published
//! - [`WireError`] - encode/decode errors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod destinations;
mod error;
mod frame;
mod ids;
mod messages;

pub use destinations::RequestRoute;
pub use error::WireError;
pub use frame::{decode_body, encode_body, InboundFrame};
pub use ids::{LocalId, MessageId, SubscriptionId, TransportHandle, UserId};
pub use messages::{
    ChatMessage, Conversation, HistoryQuery, MessageDeleted, MessageKind, OutgoingMessage,
    ReadReceipt, ServerError, StatusUpdate, TypingNotification, UnreadCount,
};

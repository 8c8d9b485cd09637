//! Destination names used on the transport.
//!
//! `/app/...` destinations are publish targets handled by the server.
//! `/user/queue/...` destinations are per-user queues the server pushes to,
//! `/topic/...` destinations are broadcast.

/// Inbound chat messages for the local user.
pub const MESSAGES: &str = "/user/queue/messages";
/// Inbound typing indicators.
pub const TYPING: &str = "/user/queue/typing";
/// Inbound read receipts.
pub const READ_RECEIPTS: &str = "/user/queue/read-receipts";
/// Inbound deletion notices.
pub const MESSAGE_DELETED: &str = "/user/queue/message-deleted";
/// Broadcast presence updates.
pub const STATUS: &str = "/topic/status";
/// Server error notices for the local user.
pub const ERRORS: &str = "/user/queue/errors";

/// Publish target for outgoing chat messages.
pub const SEND_MESSAGE: &str = "/app/chat.send";
/// Publish target for typing indicators.
pub const SEND_TYPING: &str = "/app/chat.typing";
/// Publish target for mark-read requests.
pub const MARK_READ: &str = "/app/chat.markRead";
/// Publish target for delete requests.
pub const DELETE_MESSAGE: &str = "/app/chat.delete";

/// A pseudo request/response route.
///
/// The server answers every request of one type on a single reply
/// destination, so the reply is not tied to an individual request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestRoute {
    /// Request type; at most one request of a type is resolved per reply
    pub request_type: String,
    /// Destination the request body is published to
    pub send_to: String,
    /// Destination the server replies on
    pub reply_on: String,
}

impl RequestRoute {
    /// Create a custom route.
    pub fn new(
        request_type: impl Into<String>,
        send_to: impl Into<String>,
        reply_on: impl Into<String>,
    ) -> Self {
        Self {
            request_type: request_type.into(),
            send_to: send_to.into(),
            reply_on: reply_on.into(),
        }
    }

    /// Conversation list.
    pub fn conversations() -> Self {
        Self::new(
            "conversations",
            "/app/chat.getConversations",
            "/user/queue/conversations",
        )
    }

    /// Message history of one conversation.
    pub fn history() -> Self {
        Self::new("history", "/app/chat.getHistory", "/user/queue/history")
    }

    /// Total unread count.
    pub fn unread_count() -> Self {
        Self::new(
            "unread-count",
            "/app/chat.getUnreadCount",
            "/user/queue/unread-count",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_routes_are_distinct() {
        let routes = [
            RequestRoute::conversations(),
            RequestRoute::history(),
            RequestRoute::unread_count(),
        ];
        for (i, a) in routes.iter().enumerate() {
            for b in routes.iter().skip(i + 1) {
                assert_ne!(a.request_type, b.request_type);
                assert_ne!(a.reply_on, b.reply_on);
            }
        }
    }

    #[test]
    fn replies_arrive_on_user_queues() {
        assert!(RequestRoute::history().reply_on.starts_with("/user/queue/"));
        assert!(RequestRoute::history().send_to.starts_with("/app/"));
    }
}

//! Request/response over reply channels.
//!
//! The server answers each request type on one reply destination and the
//! reply does not name the request it answers. By default the most recent
//! request of a type wins: a newer request displaces the older one, which
//! can then only time out or be rejected when the connection drops.
//!
//! With `requests.correlation_ids` enabled, object payloads are tagged with
//! a `correlationId`. A reply echoing a known id resolves exactly that
//! request; a reply without one falls back to latest-wins.
//!
//! Reply destinations are registered lazily, on the first request of a
//! route, as durable subscriptions so they are replayed after a reconnect.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use chat_types::{
    encode_body, ChatMessage, Conversation, HistoryQuery, InboundFrame, RequestRoute, UnreadCount,
    UserId, WireError,
};

use crate::client::{now, ChatClient, Route};
use crate::error::ClientError;
use crate::transport::Transport;

/// Payload field carrying the correlation id.
pub const CORRELATION_FIELD: &str = "correlationId";

impl<T: Transport> ChatClient<T> {
    /// Publish a request and wait for the reply on the route's reply channel.
    ///
    /// `timeout` defaults to `requests.timeout_ms`. Fails with
    /// [`ClientError::TransportUnavailable`] when not connected,
    /// [`ClientError::Timeout`] when no reply arrives in time and
    /// [`ClientError::ConnectionLost`] when the connection drops first.
    pub async fn request(
        &self,
        route: &RequestRoute,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::TransportUnavailable);
        }
        self.ensure_reply_channel(route).await?;

        let mut payload = payload;
        let correlation_id = match &mut payload {
            Value::Object(fields) if self.inner.config.requests.correlation_ids => {
                let id = uuid::Uuid::new_v4().to_string();
                fields.insert(CORRELATION_FIELD.to_string(), Value::String(id.clone()));
                Some(id)
            }
            _ => None,
        };
        let body = encode_body(&payload)?;

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut engine = self.engine();
            // The connection may have dropped while the reply channel was set up.
            if !engine.session.state().is_connected() {
                return Err(ClientError::ConnectionLost(
                    "connection lost before the request was sent".to_string(),
                ));
            }
            engine
                .requests
                .insert(&route.request_type, correlation_id, tx, now())
        };

        if let Err(e) = self.inner.transport.publish(&route.send_to, &body).await {
            self.engine().requests.remove(id);
            return Err(ClientError::from_publish(e));
        }

        let timeout = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionLost("request abandoned".to_string())),
            Err(_) => {
                self.engine().requests.remove(id);
                tracing::debug!(
                    "Request {} ({}) timed out after {:?}",
                    id.value(),
                    route.request_type,
                    timeout
                );
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// [`ChatClient::request`] with the reply decoded into `R`.
    pub async fn request_as<R: DeserializeOwned>(
        &self,
        route: &RequestRoute,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<R, ClientError> {
        let value = self.request(route, payload, timeout).await?;
        serde_json::from_value(value).map_err(|e| ClientError::MalformedResponse {
            destination: route.reply_on.clone(),
            reason: e.to_string(),
        })
    }

    /// Fetch the conversation list.
    pub async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        self.request_as(&RequestRoute::conversations(), json!({}), None)
            .await
    }

    /// Fetch one page of the conversation with `counterparty`.
    pub async fn fetch_history(
        &self,
        counterparty: UserId,
        page: u32,
        size: u32,
    ) -> Result<Vec<ChatMessage>, ClientError> {
        let query = HistoryQuery {
            other_user_id: counterparty,
            page,
            size,
        };
        let payload = serde_json::to_value(&query).map_err(WireError::Serialization)?;
        self.request_as(&RequestRoute::history(), payload, None)
            .await
    }

    /// Fetch the total unread count.
    pub async fn fetch_unread_count(&self) -> Result<u64, ClientError> {
        let unread: UnreadCount = self
            .request_as(&RequestRoute::unread_count(), json!({}), None)
            .await?;
        Ok(unread.count)
    }

    async fn ensure_reply_channel(&self, route: &RequestRoute) -> Result<(), ClientError> {
        let activation = {
            let mut engine = self.engine();
            let key = (route.reply_on.clone(), route.request_type.clone());
            if engine.reply_routes.insert(key) {
                engine
                    .registry
                    .register(&route.reply_on, Route::Reply(route.request_type.clone()));
            }
            let epoch = engine.session.epoch();
            let activate = engine.session.state().is_connected()
                && engine
                    .registry
                    .begin_channel_activation(&route.reply_on, epoch);
            activate.then_some(epoch)
        };
        if let Some(epoch) = activation {
            self.activate_channel(&route.reply_on, epoch).await?;
        }
        Ok(())
    }

    pub(crate) fn resolve_reply(&self, request_type: &str, frame: &InboundFrame) {
        let parsed: Result<Value, serde_json::Error> = serde_json::from_str(&frame.body);
        let correlation_id = if self.inner.config.requests.correlation_ids {
            parsed
                .as_ref()
                .ok()
                .and_then(|v| v.get(CORRELATION_FIELD))
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        };

        let taken = self
            .engine()
            .requests
            .take_for_response(request_type, correlation_id.as_deref());
        let Some((id, entry)) = taken else {
            tracing::debug!("Dropping unmatched {} response on {}", request_type, frame.destination);
            return;
        };

        let result = parsed.map_err(|e| {
            tracing::warn!("Malformed {} response: {}", request_type, e);
            ClientError::MalformedResponse {
                destination: frame.destination.clone(),
                reason: e.to_string(),
            }
        });
        if entry.responder.send(result).is_err() {
            tracing::debug!("Request {} was abandoned before its reply", id.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{connected, gated_client, settle, test_config, BOB};
    use crate::transport::MockTransport;
    use chat_core::ConnectionState;

    const HISTORY_REPLY: &str = "/user/queue/history";

    fn spawn_request(
        client: &ChatClient<MockTransport>,
        payload: Value,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<Result<Value, ClientError>> {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request(&RequestRoute::history(), payload, Some(timeout))
                .await
        })
    }

    // ===========================================
    // Latest-wins resolution
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn reply_resolves_request() {
        let (client, transport) = connected(test_config()).await;
        transport.respond_with("/app/chat.getUnreadCount", |_| {
            vec![("/user/queue/unread-count".to_string(), r#"{"count":4}"#.to_string())]
        });

        assert_eq!(client.fetch_unread_count().await.unwrap(), 4);
        assert_eq!(client.pending_request_count(), 0);
        assert_eq!(transport.subscription_count("/user/queue/unread-count"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn history_request_carries_query() {
        let (client, transport) = connected(test_config()).await;
        transport.respond_with("/app/chat.getHistory", |_| {
            vec![(
                HISTORY_REPLY.to_string(),
                r#"[{"id":1,"content":"a","senderId":7,"receiverId":1}]"#.to_string(),
            )]
        });

        let history = client.fetch_history(BOB, 2, 20).await.unwrap();

        assert_eq!(history.len(), 1);
        let sent: Value = serde_json::from_str(&transport.published_to("/app/chat.getHistory")[0]).unwrap();
        assert_eq!(sent, json!({"otherUserId": 7, "page": 2, "size": 20}));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_displaces_older() {
        let (client, transport) = connected(test_config()).await;

        let first = spawn_request(&client, json!({"page": 0}), Duration::from_secs(1));
        settle().await;
        let second = spawn_request(&client, json!({"page": 1}), Duration::from_secs(1));
        settle().await;

        assert!(transport.deliver(HISTORY_REPLY, r#"["second"]"#));

        assert_eq!(second.await.unwrap().unwrap(), json!(["second"]));
        assert!(matches!(first.await.unwrap(), Err(ClientError::Timeout(_))));
        assert_eq!(client.pending_request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_does_not_resolve_next_request() {
        let (client, transport) = connected(test_config()).await;

        let result = client
            .request(&RequestRoute::history(), json!({}), Some(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(d)) if d == Duration::from_secs(1)));
        assert_eq!(client.pending_request_count(), 0);

        // Reply to the timed-out request arrives with nobody waiting.
        transport.deliver(HISTORY_REPLY, r#"["stale"]"#);
        settle().await;

        let next = spawn_request(&client, json!({}), Duration::from_secs(5));
        settle().await;
        transport.deliver(HISTORY_REPLY, r#"["fresh"]"#);
        assert_eq!(next.await.unwrap().unwrap(), json!(["fresh"]));
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_comes_from_config() {
        let config = test_config().with_request_timeout(Duration::from_secs(2));
        let (client, _transport) = connected(config).await;

        let started = tokio::time::Instant::now();
        let result = client.request(&RequestRoute::history(), json!({}), None).await;

        assert!(matches!(result, Err(ClientError::Timeout(_))));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
    }

    // ===========================================
    // Correlation ids
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn correlation_ids_resolve_exact_request() {
        let (client, transport) = connected(test_config().with_correlation_ids(true)).await;

        let first = spawn_request(&client, json!({"page": 0}), Duration::from_secs(5));
        settle().await;
        let second = spawn_request(&client, json!({"page": 1}), Duration::from_secs(5));
        settle().await;

        let ids: Vec<String> = transport
            .published_to("/app/chat.getHistory")
            .iter()
            .map(|body| {
                let value: Value = serde_json::from_str(body).unwrap();
                value[CORRELATION_FIELD].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        // Answer the older request first.
        transport.deliver(
            HISTORY_REPLY,
            &json!({"correlationId": ids[0], "page": 0}).to_string(),
        );
        transport.deliver(
            HISTORY_REPLY,
            &json!({"correlationId": ids[1], "page": 1}).to_string(),
        );

        assert_eq!(first.await.unwrap().unwrap()["page"], 0);
        assert_eq!(second.await.unwrap().unwrap()["page"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_correlation_id_is_dropped() {
        let (client, transport) = connected(test_config().with_correlation_ids(true)).await;

        let pending = spawn_request(&client, json!({}), Duration::from_secs(1));
        settle().await;
        transport.deliver(
            HISTORY_REPLY,
            &json!({"correlationId": "someone-else"}).to_string(),
        );

        assert!(matches!(pending.await.unwrap(), Err(ClientError::Timeout(_))));
    }

    // ===========================================
    // Failures
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_is_reported_to_caller() {
        let (client, transport) = connected(test_config()).await;

        let pending = spawn_request(&client, json!({}), Duration::from_secs(5));
        settle().await;
        transport.deliver(HISTORY_REPLY, "<html>oops</html>");

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(
            &err,
            ClientError::MalformedResponse { destination, .. } if destination == HISTORY_REPLY
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_rejects_pending_requests() {
        let (client, transport) = connected(test_config()).await;

        let pending = spawn_request(&client, json!({}), Duration::from_secs(20));
        settle().await;
        transport.drop_connection("server restart");

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionLost(reason) if reason == "server restart"));
        assert_eq!(client.pending_request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_during_reply_setup_rejects_request() {
        let (client, transport) = gated_client();
        assert!(client.connect().await.unwrap());
        transport.hold_subscribes(true);

        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.fetch_unread_count().await })
        };
        settle().await;
        assert!(!request.is_finished());

        transport.mock.refuse_connections(true);
        transport.mock.drop_connection("network gone");
        settle().await;
        assert!(!client.is_connected());

        transport.hold_subscribes(false);
        assert!(matches!(
            request.await.unwrap(),
            Err(ClientError::ConnectionLost(_))
        ));
        assert_eq!(client.pending_request_count(), 0);
        assert!(transport
            .mock
            .published_to(&RequestRoute::unread_count().send_to)
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_while_disconnected_fails_fast() {
        let (client, transport) = connected(test_config()).await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let result = client.fetch_conversations().await;

        assert!(matches!(result, Err(ClientError::TransportUnavailable)));
        assert!(transport.published_to("/app/chat.getConversations").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_removes_pending_entry() {
        let (client, transport) = connected(test_config()).await;
        transport.fail_next_publish("broker full");

        let result = client
            .request(&RequestRoute::history(), json!({}), None)
            .await;

        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(client.pending_request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_channel_is_replayed_after_reconnect() {
        let (client, transport) = connected(test_config()).await;
        let _ = client
            .request(&RequestRoute::history(), json!({}), Some(Duration::from_millis(10)))
            .await;
        assert_eq!(transport.subscription_count(HISTORY_REPLY), 1);

        transport.drop_connection("blip");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(client.is_connected());
        assert_eq!(transport.subscription_count(HISTORY_REPLY), 1);
    }
}

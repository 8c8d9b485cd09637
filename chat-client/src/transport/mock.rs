//! Mock transport for testing.
//!
//! An in-memory broker: captures publishes, tracks live subscriptions,
//! delivers frames only to subscribed destinations, and can script server
//! replies with [`MockTransport::respond_with`]. Failure injection follows
//! the `fail_next_*` pattern.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use chat_types::{InboundFrame, TransportHandle};

use super::{ConnectOptions, Transport, TransportError, TransportEvent};

type Responder = Arc<dyn Fn(&str) -> Vec<(String, String)> + Send + Sync>;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one handle while the client owns
/// another.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    connected: bool,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    connect_attempts: u32,
    last_token: Option<String>,
    refuse_connections: bool,
    fail_next_connect: Option<String>,
    fail_next_publish: Option<String>,
    fail_next_subscribe: Option<String>,
    stall_heartbeats: bool,
    heartbeats_sent: u32,
    published: Vec<(String, String)>,
    subscriptions: BTreeMap<TransportHandle, String>,
    next_handle: u64,
    responders: Vec<(String, Responder)>,
}

impl MockTransportInner {
    fn deliver(&self, destination: &str, body: &str) -> bool {
        if !self.connected || !self.subscriptions.values().any(|d| d == destination) {
            return false;
        }
        match &self.events {
            Some(tx) => tx
                .send(TransportEvent::Frame(InboundFrame::new(destination, body)))
                .is_ok(),
            None => false,
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.subscriptions.clear();
        self.events = None;
    }
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.lock().fail_next_connect = Some(error.to_string());
    }

    /// Refuse every connect() until turned off.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Cause the next publish() to fail with the given error.
    pub fn fail_next_publish(&self, error: &str) {
        self.lock().fail_next_publish = Some(error.to_string());
    }

    /// Cause the next subscribe() to fail with the given error.
    pub fn fail_next_subscribe(&self, error: &str) {
        self.lock().fail_next_subscribe = Some(error.to_string());
    }

    /// Stop answering heartbeats (simulates a half-open connection).
    pub fn stall_heartbeats(&self, stall: bool) {
        self.lock().stall_heartbeats = stall;
    }

    /// Script a server reply: whenever something is published to `trigger`,
    /// `reply` maps its body to `(destination, body)` pairs to deliver.
    pub fn respond_with<F>(&self, trigger: &str, reply: F)
    where
        F: Fn(&str) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.lock()
            .responders
            .push((trigger.to_string(), Arc::new(reply)));
    }

    /// Deliver a server message. Returns false unless the destination is
    /// subscribed on a live connection.
    pub fn deliver(&self, destination: &str, body: &str) -> bool {
        self.lock().deliver(destination, body)
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self, reason: &str) {
        let mut inner = self.lock();
        if let Some(tx) = inner.events.take() {
            let _ = tx.send(TransportEvent::Closed {
                reason: reason.to_string(),
            });
        }
        inner.disconnect();
    }

    /// Number of connect() calls, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Number of heartbeats sent.
    pub fn heartbeats_sent(&self) -> u32 {
        self.lock().heartbeats_sent
    }

    /// Token presented on the last connect().
    pub fn last_token(&self) -> Option<String> {
        self.lock().last_token.clone()
    }

    /// All published `(destination, body)` pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.lock().published.clone()
    }

    /// Bodies published to one destination.
    pub fn published_to(&self, destination: &str) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Destinations with a live subscription, one entry per subscription.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self.lock().subscriptions.values().cloned().collect();
        destinations.sort();
        destinations
    }

    /// Number of live subscriptions on one destination.
    pub fn subscription_count(&self, destination: &str) -> usize {
        self.lock()
            .subscriptions
            .values()
            .filter(|d| *d == destination)
            .count()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("MockTransport")
            .field("connected", &inner.connected)
            .field("connect_attempts", &inner.connect_attempts)
            .field("published", &inner.published.len())
            .field("subscriptions", &inner.subscriptions.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let mut inner = self.lock();
        inner.connect_attempts += 1;

        if inner.refuse_connections {
            return Err(TransportError::ConnectionFailed("connection refused".into()));
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        if options.credential.token().is_empty() {
            return Err(TransportError::Rejected("empty token".into()));
        }

        inner.disconnect();
        let (tx, rx) = mpsc::unbounded_channel();
        inner.connected = true;
        inner.events = Some(tx);
        inner.last_token = Some(options.credential.token().to_string());
        Ok(rx)
    }

    async fn publish(&self, destination: &str, body: &str) -> Result<(), TransportError> {
        let responders: Vec<Responder> = {
            let mut inner = self.lock();

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }

            // Check for forced failure
            if let Some(error) = inner.fail_next_publish.take() {
                return Err(TransportError::SendFailed(error));
            }

            inner
                .published
                .push((destination.to_string(), body.to_string()));
            inner
                .responders
                .iter()
                .filter(|(trigger, _)| trigger == destination)
                .map(|(_, responder)| Arc::clone(responder))
                .collect()
        };

        // Responders run unlocked so they may inspect the mock.
        let replies: Vec<(String, String)> = responders.iter().flat_map(|r| r(body)).collect();
        if !replies.is_empty() {
            let inner = self.lock();
            for (reply_to, reply) in replies {
                inner.deliver(&reply_to, &reply);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<TransportHandle, TransportError> {
        let mut inner = self.lock();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        if let Some(error) = inner.fail_next_subscribe.take() {
            return Err(TransportError::SubscribeFailed(error));
        }

        inner.next_handle += 1;
        let handle = TransportHandle::new(inner.next_handle);
        inner.subscriptions.insert(handle, destination.to_string());
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        inner.subscriptions.remove(&handle);
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        inner.heartbeats_sent += 1;
        if !inner.stall_heartbeats {
            if let Some(tx) = &inner.events {
                let _ = tx.send(TransportEvent::Heartbeat);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lock().disconnect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use chat_types::UserId;
    use std::time::Duration;

    fn options() -> ConnectOptions {
        ConnectOptions {
            endpoint: "ws://test".into(),
            credential: Credential::new("token-1", UserId::new(1)),
            heartbeat: Duration::from_secs(10),
        }
    }

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect(&options()).await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(transport.last_token().as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn mock_transport_rejects_empty_token() {
        let transport = MockTransport::new();
        let mut opts = options();
        opts.credential = Credential::new("", UserId::new(1));
        let result = transport.connect(&opts).await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn mock_transport_captures_publishes() {
        let transport = MockTransport::new();
        transport.connect(&options()).await.unwrap();

        transport.publish("/app/a", "1").await.unwrap();
        transport.publish("/app/b", "2").await.unwrap();
        transport.publish("/app/a", "3").await.unwrap();

        assert_eq!(transport.published().len(), 3);
        assert_eq!(transport.published_to("/app/a"), vec!["1", "3"]);
    }

    #[tokio::test]
    async fn delivery_requires_subscription() {
        let transport = MockTransport::new();
        let mut rx = transport.connect(&options()).await.unwrap();

        assert!(!transport.deliver("/topic/x", "{}"));
        let handle = transport.subscribe("/topic/x").await.unwrap();
        assert!(transport.deliver("/topic/x", "{}"));

        match rx.recv().await {
            Some(TransportEvent::Frame(frame)) => assert_eq!(frame.destination, "/topic/x"),
            other => panic!("expected frame, got {:?}", other),
        }

        transport.unsubscribe(handle).await.unwrap();
        assert!(!transport.deliver("/topic/x", "{}"));
    }

    #[tokio::test]
    async fn responder_replies_to_subscribed_destination() {
        let transport = MockTransport::new();
        let mut rx = transport.connect(&options()).await.unwrap();
        transport.subscribe("/user/queue/echo").await.unwrap();
        transport.respond_with("/app/echo", |body| {
            vec![("/user/queue/echo".to_string(), body.to_string())]
        });

        transport.publish("/app/echo", r#"{"x":1}"#).await.unwrap();

        match rx.recv().await {
            Some(TransportEvent::Frame(frame)) => assert_eq!(frame.body, r#"{"x":1}"#),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    // ===========================================
    // Failure injection
    // ===========================================

    #[tokio::test]
    async fn connect_failure_is_one_shot() {
        let transport = MockTransport::new();
        transport.fail_next_connect("refused");
        assert!(transport.connect(&options()).await.is_err());
        assert!(transport.connect(&options()).await.is_ok());
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn refuse_connections_persists() {
        let transport = MockTransport::new();
        transport.refuse_connections(true);
        assert!(transport.connect(&options()).await.is_err());
        assert!(transport.connect(&options()).await.is_err());
        transport.refuse_connections(false);
        assert!(transport.connect(&options()).await.is_ok());
    }

    #[tokio::test]
    async fn publish_without_connect_fails() {
        let transport = MockTransport::new();
        let result = transport.publish("/app/a", "{}").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn drop_connection_closes_stream() {
        let transport = MockTransport::new();
        let mut rx = transport.connect(&options()).await.unwrap();
        transport.subscribe("/topic/x").await.unwrap();

        transport.drop_connection("server restart");

        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Closed { reason }) if reason == "server restart"
        ));
        assert!(rx.recv().await.is_none());
        assert!(!transport.is_connected());
        assert!(transport.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn heartbeats_are_answered_unless_stalled() {
        let transport = MockTransport::new();
        let mut rx = transport.connect(&options()).await.unwrap();

        transport.heartbeat().await.unwrap();
        assert!(matches!(rx.recv().await, Some(TransportEvent::Heartbeat)));

        transport.stall_heartbeats(true);
        transport.heartbeat().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.heartbeats_sent(), 2);
    }
}

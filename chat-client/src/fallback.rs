//! Polling fallback while the live connection is down.
//!
//! Runs periodically while the client is trying to get back online
//! (connecting, reconnecting or failed) and pulls recent messages from an
//! external [`HistorySource`], typically a REST endpoint. Results go through
//! [`ChatClient::ingest`], so a message seen by polling is not delivered again
//! when the live connection replays it. Polling stops after `max_duration`
//! of one outage and starts over with the next outage.

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use chat_core::ConnectionState;
use chat_types::ChatMessage;

use crate::client::ChatClient;
use crate::config::FallbackConfig;
use crate::error::ClientError;
use crate::transport::Transport;

/// Out-of-band source of recent messages.
#[async_trait]
pub trait HistorySource: Send + Sync + 'static {
    /// Fetch messages received recently, newest last.
    async fn fetch_recent(&self) -> Result<Vec<ChatMessage>, ClientError>;
}

/// Spawn a background polling task for `client`.
///
/// Returns `None` when the fallback is disabled. The task ends on its own
/// once every client handle is dropped.
pub fn spawn_fallback_poller<T, S>(
    client: &ChatClient<T>,
    source: S,
    config: &FallbackConfig,
) -> Option<JoinHandle<()>>
where
    T: Transport,
    S: HistorySource,
{
    if !config.enabled {
        tracing::info!("Polling fallback disabled");
        return None;
    }

    let weak = client.downgrade();
    let period = config.poll_interval().max(Duration::from_millis(1));
    let max_duration = config.max_duration();

    Some(tokio::spawn(async move {
        tracing::info!(
            "Polling fallback started (interval: {:?}, limit: {:?})",
            period,
            max_duration
        );

        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut outage_started: Option<Instant> = None;
        let mut gave_up = false;

        loop {
            timer.tick().await;
            let Some(client) = ChatClient::upgrade(&weak) else {
                return;
            };

            let offline = matches!(
                client.state(),
                ConnectionState::Connecting | ConnectionState::Reconnecting | ConnectionState::Failed
            );
            if !offline {
                outage_started = None;
                gave_up = false;
                continue;
            }

            let started = *outage_started.get_or_insert_with(Instant::now);
            if started.elapsed() >= max_duration {
                if !gave_up {
                    tracing::info!("Polling fallback paused after {:?}", max_duration);
                    gave_up = true;
                }
                continue;
            }

            match source.fetch_recent().await {
                Ok(messages) => {
                    let delivered = client.ingest(messages);
                    if delivered > 0 {
                        tracing::info!("Polling fallback delivered {} messages", delivered);
                    } else {
                        tracing::debug!("Polling fallback: nothing new");
                    }
                }
                Err(e) => {
                    tracing::warn!("Polling fallback error: {}", e);
                }
            }
        }
    }))
}

impl<T: Transport> ChatClient<T> {
    /// Start the polling fallback with the client's own `[fallback]` settings.
    pub fn spawn_fallback<S: HistorySource>(&self, source: S) -> Option<JoinHandle<()>> {
        spawn_fallback_poller(self, source, &self.config().fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{client_with, connected, message_json, record, test_config, BOB, ME};
    use crate::events::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct CannedHistory {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HistorySource for CannedHistory {
        async fn fetch_recent(&self) -> Result<Vec<ChatMessage>, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                serde_json::from_str(&message_json(11, BOB, ME, "while you were away")).unwrap(),
            ])
        }
    }

    fn fallback(poll_secs: u64, max_secs: u64) -> FallbackConfig {
        FallbackConfig {
            enabled: true,
            poll_interval_ms: poll_secs * 1_000,
            max_duration_ms: max_secs * 1_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_while_offline_and_dedups() {
        let (client, transport) = client_with(test_config());
        let seen = record(&client, EventKind::NewMessage);
        transport.refuse_connections(true);
        client.connect().await.unwrap();

        let source = CannedHistory::default();
        let poller = spawn_fallback_poller(&client, source.clone(), &fallback(1, 60)).unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert!(source.calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(seen.lock().unwrap().len(), 1);
        poller.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn polling_is_time_boxed_per_outage() {
        let (client, transport) = client_with(test_config());
        transport.refuse_connections(true);
        client.connect().await.unwrap();

        let source = CannedHistory::default();
        let poller = spawn_fallback_poller(&client, source.clone(), &fallback(1, 5)).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
        poller.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn no_polling_while_connected() {
        let (client, _transport) = connected(test_config()).await;

        let source = CannedHistory::default();
        let poller = client
            .spawn_fallback(source.clone())
            .expect("fallback is enabled by default");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        poller.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_fallback_spawns_nothing() {
        let (client, _transport) = client_with(test_config());
        let config = FallbackConfig {
            enabled: false,
            ..FallbackConfig::default()
        };
        assert!(spawn_fallback_poller(&client, CannedHistory::default(), &config).is_none());
    }
}

//! End-to-end round trip over a loopback mock transport.
//!
//! A scripted server echoes every sent message back on the user's message
//! queue with a fresh server id and answers unread-count requests. The
//! client must reconcile the echo with its optimistic entry.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use chat_client::{
    ChatClient, ChatEvent, ClientConfig, EventKind, MemoryCredentials, MockTransport, SendOutcome,
};
use chat_types::destinations::{MESSAGES, SEND_MESSAGE};
use chat_types::{ChatMessage, MessageId, OutgoingMessage, RequestRoute, UnreadCount, UserId};

/// How long to wait for the server copy of the message.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the client to come back after a dropped connection.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Run the demo command.
pub async fn run(
    config: ClientConfig,
    user_id: u64,
    receiver: u64,
    content: &str,
    simulate_drop: bool,
) -> Result<()> {
    let me = UserId::new(user_id);
    let receiver = UserId::new(receiver);

    let transport = MockTransport::new();
    script_server(&transport, me);
    tracing::debug!("Scripted server ready for user {}", me);

    let client = ChatClient::new(
        config,
        transport.clone(),
        MemoryCredentials::new("demo-token", me),
    )
    .context("Failed to create client")?;

    client.on_connection_status(|change| {
        println!("  [status] {} -> {}", change.from, change.to);
    });
    client.on(EventKind::Reconnecting, |event| {
        if let ChatEvent::Reconnecting {
            attempt,
            max_attempts,
            delay,
        } = event
        {
            println!("  [retry]  attempt {}/{} in {:?}", attempt, max_attempts, delay);
        }
    });

    let (confirmed_tx, mut confirmed_rx) = mpsc::unbounded_channel();
    client.on(EventKind::NewMessage, move |event| {
        if let ChatEvent::NewMessage { message, replaces } = event {
            let _ = confirmed_tx.send((message.clone(), *replaces));
        }
    });

    println!("Connecting to {}...", client.config().connection.endpoint);
    if !client.connect().await? {
        anyhow::bail!("Connection failed");
    }

    if simulate_drop {
        println!("Dropping the connection...");
        transport.drop_connection("simulated network loss");
        let mut state = client.watch_state();
        let recovery = async {
            state.wait_for(|s| !s.is_connected()).await?;
            state.wait_for(|s| s.is_connected()).await.map(|_| ())
        };
        tokio::time::timeout(RECOVERY_TIMEOUT, recovery)
            .await
            .context("Client did not reconnect in time")?
            .context("Client stopped")?;
        println!("Recovered at epoch {}", client.epoch());
    }

    println!("Sending {:?} to user {}...", content, receiver);
    let local_id = match client.send_message(receiver, content).await {
        SendOutcome::Pending(local_id) => local_id,
        SendOutcome::Suppressed => anyhow::bail!("Send was suppressed as a duplicate"),
        SendOutcome::Failed { local_id, error } => {
            anyhow::bail!("Send {} failed: {}", local_id, error)
        }
    };
    println!("  Pending as {}", local_id);

    let (message, replaces) = tokio::time::timeout(CONFIRM_TIMEOUT, confirmed_rx.recv())
        .await
        .context("No confirmation from server")?
        .context("Event stream closed")?;

    if replaces == Some(local_id) {
        println!("Confirmed: {} is server message {}", local_id, message.id);
    } else {
        println!("Received unrelated message {}", message.id);
    }

    let unread = client
        .fetch_unread_count()
        .await
        .context("Unread count request failed")?;
    println!("Unread messages: {}", unread);

    println!(
        "Still pending: {}, reconnect attempts: {}",
        client
            .pending_messages()
            .iter()
            .filter(|m| m.is_pending())
            .count(),
        client.reconnect_attempts()
    );

    client.shutdown().await;
    println!("Disconnected.");
    Ok(())
}

/// Echo sends back as server messages and answer unread-count requests.
fn script_server(transport: &MockTransport, me: UserId) {
    let next_id = AtomicU64::new(1);
    transport.respond_with(SEND_MESSAGE, move |body| {
        let Ok(sent) = serde_json::from_str::<OutgoingMessage>(body) else {
            return Vec::new();
        };
        let echoed = ChatMessage {
            id: MessageId::new(next_id.fetch_add(1, Ordering::Relaxed)),
            content: sent.content,
            sender_id: me,
            receiver_id: sent.receiver_id,
            timestamp: unix_millis(),
            attachment_url: None,
            read: false,
            delivered: true,
            message_type: sent.message_type,
        };
        match serde_json::to_string(&echoed) {
            Ok(json) => vec![(MESSAGES.to_string(), json)],
            Err(_) => Vec::new(),
        }
    });

    let route = RequestRoute::unread_count();
    let reply_on = route.reply_on.clone();
    transport.respond_with(&route.send_to, move |_| {
        match serde_json::to_string(&UnreadCount { count: 3 }) {
            Ok(json) => vec![(reply_on.clone(), json)],
            Err(_) => Vec::new(),
        }
    });
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

//! ChatClient - the real-time messaging engine.
//!
//! [`ChatClient`] owns one logical session with the chat server. It drives
//! the pure state machines from chat-core and performs the I/O they ask for
//! through the [`Transport`] trait.
//!
//! # Architecture
//!
//! ```text
//! Application → ChatClient → Transport → Network
//!                   ↓
//!              chat-core (state machine, registry, dedup, reconciler)
//! ```
//!
//! All mutable engine state sits behind one mutex and is only touched in
//! short synchronous sections; no lock is held across an `.await`. Work that
//! outlives a call runs in background tasks:
//!
//! - the **driver** receives transport-loss reports and retry timers,
//! - a **pump** and a **heartbeat** task per connection epoch,
//! - a **maintenance** task that prunes fingerprints and expires
//!   unconfirmed messages.
//!
//! Background tasks hold weak references, so dropping the last
//! `ChatClient` handle stops everything.
//!
//! # Example
//!
//! ```ignore
//! use chat_client::{ChatClient, ClientConfig, MemoryCredentials, MockTransport};
//! use chat_types::UserId;
//!
//! let client = ChatClient::new(
//!     ClientConfig::default(),
//!     MockTransport::new(),
//!     MemoryCredentials::new("token", UserId::new(1)),
//! )?;
//! client.connect().await?;
//! client.send_message(UserId::new(7), "ping").await;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use chat_core::{
    Action, Completion, ConnectionState, Event, FingerprintStore, PendingMessage,
    PendingRequests, Reconciler, Reconciliation, ReconnectScheduler, ReconnectionAttempt,
    Schedule, Session, SessionEpoch, StatusChange, SubscriptionRegistry,
};
use chat_types::destinations::{
    DELETE_MESSAGE, ERRORS, MARK_READ, MESSAGES, MESSAGE_DELETED, READ_RECEIPTS, SEND_MESSAGE,
    SEND_TYPING, STATUS, TYPING,
};
use chat_types::{
    encode_body, ChatMessage, InboundFrame, LocalId, MessageDeleted, MessageId, MessageKind,
    OutgoingMessage, ReadReceipt, ServerError, SubscriptionId, TypingNotification, UserId,
};

use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::{ClientError, ErrorKind};
use crate::events::{ChatEvent, EventBus, EventKind, ListenerId};
use crate::transport::{ConnectOptions, Transport, TransportEvent};

/// Handler for frames on an application channel.
pub(crate) type AppHandler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

/// Completion handle of one pending request.
pub(crate) type Responder = oneshot::Sender<Result<Value, ClientError>>;

/// Built-in inbound channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SystemRoute {
    Messages,
    Typing,
    ReadReceipts,
    MessageDeleted,
    Status,
    Errors,
}

/// What a registration on a channel does with a frame.
#[derive(Clone)]
pub(crate) enum Route {
    System(SystemRoute),
    /// Reply channel of a request type.
    Reply(String),
    App(AppHandler),
}

/// Mutable engine state, guarded by one mutex.
pub(crate) struct Engine {
    pub(crate) session: Session,
    pub(crate) self_id: Option<UserId>,
    pub(crate) registry: SubscriptionRegistry<Route>,
    pub(crate) requests: PendingRequests<Responder>,
    /// `(reply channel, request type)` pairs with a registered reply route.
    pub(crate) reply_routes: HashSet<(String, String)>,
    pub(crate) fingerprints: FingerprintStore,
    pub(crate) reconciler: Reconciler,
    pub(crate) scheduler: ReconnectScheduler,
    connect_seq: u64,
    last_inbound: Instant,
}

enum Command {
    TransportLost { epoch: SessionEpoch, reason: String },
    RetryTimer(ReconnectionAttempt),
}

#[derive(Default)]
struct Tasks {
    background: Vec<JoinHandle<()>>,
    epoch: Vec<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_epoch(&mut self) {
        for task in self.epoch.drain(..) {
            task.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_epoch();
        if let Some(task) = self.retry.take() {
            task.abort();
        }
        for task in self.background.drain(..) {
            task.abort();
        }
    }
}

/// Shared state behind every [`ChatClient`] handle.
pub(crate) struct Inner<T: Transport> {
    pub(crate) config: ClientConfig,
    pub(crate) transport: T,
    credentials: Arc<dyn CredentialStore>,
    pub(crate) engine: Mutex<Engine>,
    events: EventBus,
    state_tx: watch::Sender<ConnectionState>,
    /// Latest epoch whose registered channels have all been through activation.
    ready_tx: watch::Sender<SessionEpoch>,
    commands: mpsc::UnboundedSender<Command>,
    tasks: Mutex<Tasks>,
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        self.tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

/// Outcome of [`ChatClient::send_message`].
#[derive(Debug)]
pub enum SendOutcome {
    /// Published; waiting for the server copy.
    Pending(LocalId),
    /// Identical message to the same recipient inside the duplicate window.
    Suppressed,
    /// Publish failed; the entry can be retried with [`ChatClient::retry_message`].
    Failed {
        /// Failed entry.
        local_id: LocalId,
        /// Why the publish failed.
        error: ClientError,
    },
}

impl SendOutcome {
    /// Local id of the optimistic entry, if one was created.
    pub fn local_id(&self) -> Option<LocalId> {
        match self {
            SendOutcome::Pending(id) | SendOutcome::Failed { local_id: id, .. } => Some(*id),
            SendOutcome::Suppressed => None,
        }
    }
}

enum Opened {
    Live(SessionEpoch, Vec<Action>),
    Superseded { close: bool },
}

/// The messaging engine.
///
/// Cheap to clone; clones share one session.
pub struct ChatClient<T: Transport> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ChatClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for ChatClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine = self.engine();
        f.debug_struct("ChatClient")
            .field("state", &engine.session.state())
            .field("epoch", &engine.session.epoch())
            .field("subscriptions", &engine.registry.len())
            .field("pending_requests", &engine.requests.len())
            .finish()
    }
}

/// Engine clock. Follows tokio's clock so paused-time tests are deterministic.
pub(crate) fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl<T: Transport> ChatClient<T> {
    /// Create a client and start its background tasks.
    ///
    /// Must be called inside a Tokio runtime. The client starts
    /// disconnected; call [`ChatClient::connect`].
    pub fn new<C: CredentialStore>(
        config: ClientConfig,
        transport: T,
        credentials: C,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let mut registry = SubscriptionRegistry::new();
        registry.register(MESSAGES, Route::System(SystemRoute::Messages));
        for channel in &config.connection.extra_message_channels {
            registry.register(channel, Route::System(SystemRoute::Messages));
        }
        for (channel, route) in [
            (TYPING, SystemRoute::Typing),
            (READ_RECEIPTS, SystemRoute::ReadReceipts),
            (MESSAGE_DELETED, SystemRoute::MessageDeleted),
            (STATUS, SystemRoute::Status),
            (ERRORS, SystemRoute::Errors),
        ] {
            registry.register(channel, Route::System(route));
        }

        let engine = Engine {
            session: Session::new(),
            self_id: None,
            registry,
            requests: PendingRequests::new(),
            reply_routes: HashSet::new(),
            fingerprints: FingerprintStore::new(
                config.outbound_window(),
                config.dedup.processed_capacity,
            ),
            reconciler: Reconciler::new(config.reconcile_policy()),
            scheduler: ReconnectScheduler::new(config.backoff_policy()),
            connect_seq: 0,
            last_inbound: Instant::now(),
        };

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (ready_tx, _) = watch::channel(SessionEpoch::default());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let client = Self {
            inner: Arc::new(Inner {
                config,
                transport,
                credentials: Arc::new(credentials),
                engine: Mutex::new(engine),
                events: EventBus::new(),
                state_tx,
                ready_tx,
                commands,
                tasks: Mutex::new(Tasks::default()),
            }),
        };

        let driver = client.spawn_driver(command_rx);
        let maintenance = client.spawn_maintenance();
        client.tasks().background = vec![driver, maintenance];

        Ok(client)
    }

    pub(crate) fn engine(&self) -> MutexGuard<'_, Engine> {
        self.inner
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner<T>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<Inner<T>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn emit(&self, event: ChatEvent) {
        self.inner.events.emit(&event);
    }

    fn apply_locked(&self, engine: &mut Engine, event: Event) -> Vec<Action> {
        let actions = engine.session.apply(event);
        self.inner.state_tx.send_replace(engine.session.state());
        actions
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Connect to the server.
    ///
    /// Returns `Ok(true)` once connected and every registered channel has
    /// been through activation, and `Ok(false)` if the attempt failed
    /// (automatic reconnection then takes over). Fails fast with
    /// [`ClientError::MissingCredential`] when no credential is available.
    /// If an attempt is already in flight, waits for it instead of starting
    /// another. Connecting from `Failed` starts over with a fresh attempt
    /// counter.
    pub async fn connect(&self) -> Result<bool, ClientError> {
        self.connect_with(false).await
    }

    /// Cancel any scheduled retry and attempt immediately, even after the
    /// automatic attempts are exhausted.
    pub async fn force_reconnect(&self) -> Result<bool, ClientError> {
        self.connect_with(true).await
    }

    async fn connect_with(&self, force: bool) -> Result<bool, ClientError> {
        if self.inner.credentials.credential().await.is_none() {
            return Err(ClientError::MissingCredential);
        }

        let actions = {
            let mut engine = self.engine();
            match engine.session.state() {
                ConnectionState::Connected | ConnectionState::Connecting => Vec::new(),
                _ => {
                    if force {
                        engine.scheduler.force();
                    }
                    self.apply_locked(&mut engine, Event::ConnectRequested)
                }
            }
        };
        self.run_actions(actions).await;

        let mut state = self.inner.state_tx.subscribe();
        let connected = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| s.is_connected())
            .unwrap_or(false);
        if !connected {
            return Ok(false);
        }

        // Another caller may still be replaying subscriptions for this epoch.
        let epoch = self.epoch();
        let mut ready = self.inner.ready_tx.subscribe();
        tokio::select! {
            _ = ready.wait_for(|done| *done >= epoch) => {}
            _ = state.wait_for(|s| !s.is_connected()) => {}
        }
        Ok(self.is_connected())
    }

    /// Disconnect. Registrations survive and are replayed on the next
    /// connect; pending requests are rejected. Calling this while already
    /// disconnected does nothing.
    pub async fn disconnect(&self) {
        let actions = {
            let mut engine = self.engine();
            self.apply_locked(&mut engine, Event::DisconnectRequested)
        };
        self.run_actions(actions).await;
    }

    /// Leave `Failed` and restart automatic reconnection with a fresh
    /// attempt counter. Does nothing in any other state.
    pub async fn reset_attempts(&self) {
        let actions = {
            let mut engine = self.engine();
            self.apply_locked(&mut engine, Event::ResetRequested)
        };
        self.run_actions(actions).await;
    }

    /// Disconnect and stop every background task. The client is inert
    /// afterwards.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.tasks().abort_all();
    }

    async fn run_actions(&self, actions: Vec<Action>) {
        let mut batch = actions;
        while !batch.is_empty() {
            // Opening the transport goes last so status events of the
            // transition are out before the attempt starts.
            let (open, rest): (Vec<Action>, Vec<Action>) = batch
                .into_iter()
                .partition(|a| matches!(a, Action::OpenTransport));

            let mut next = Vec::new();
            for action in rest.into_iter().chain(open) {
                next.extend(self.perform(action).await);
            }
            batch = next;
        }
    }

    async fn perform(&self, action: Action) -> Vec<Action> {
        match action {
            Action::OpenTransport => return self.open_transport().await,
            Action::CloseTransport => {
                self.tasks().abort_epoch();
                if let Err(e) = self.inner.transport.close().await {
                    tracing::debug!("Transport close failed: {}", e);
                }
            }
            Action::ResubscribeAll => self.resubscribe_all().await,
            Action::DeactivateSubscriptions => {
                let handles = self.engine().registry.deactivate_all();
                for handle in handles {
                    if let Err(e) = self.inner.transport.unsubscribe(handle).await {
                        tracing::debug!("Unsubscribe of {:?} skipped: {}", handle, e);
                    }
                }
            }
            Action::RejectPendingRequests { reason } => {
                let drained = self.engine().requests.drain();
                if !drained.is_empty() {
                    tracing::info!("Rejecting {} pending requests: {}", drained.len(), reason);
                }
                for (_, entry) in drained {
                    let _ = entry
                        .responder
                        .send(Err(ClientError::ConnectionLost(reason.clone())));
                }
            }
            Action::StartReconnection => return self.start_reconnection(),
            Action::CancelReconnection => {
                self.engine().scheduler.cancel();
                if let Some(timer) = self.tasks().retry.take() {
                    timer.abort();
                }
            }
            Action::ResetAttempts => self.engine().scheduler.reset(),
            Action::ReportExhausted => {
                let attempts = self.engine().scheduler.attempts();
                tracing::warn!("Reconnection gave up after {} attempts", attempts);
                self.emit(ChatEvent::MaxAttemptsReached { attempts });
                self.emit(ChatEvent::Error {
                    kind: ErrorKind::ExhaustedRetries,
                    message: ClientError::ExhaustedRetries { attempts }.to_string(),
                });
            }
            Action::EmitStatus(change) => {
                match &change.detail {
                    Some(detail) => tracing::info!(
                        "Connection {} -> {} (epoch {}): {}",
                        change.from,
                        change.to,
                        change.epoch,
                        detail
                    ),
                    None => tracing::info!(
                        "Connection {} -> {} (epoch {})",
                        change.from,
                        change.to,
                        change.epoch
                    ),
                }
                self.emit(ChatEvent::ConnectionStatus(change));
            }
        }
        Vec::new()
    }

    async fn open_transport(&self) -> Vec<Action> {
        let seq = {
            let mut engine = self.engine();
            engine.connect_seq += 1;
            engine.connect_seq
        };

        // Re-read on every attempt so a refreshed token is used.
        let Some(credential) = self.inner.credentials.credential().await else {
            return self.connect_failed(seq, ClientError::MissingCredential.to_string());
        };
        let user_id = credential.user_id();
        let options = ConnectOptions {
            endpoint: self.inner.config.connection.endpoint.clone(),
            credential,
            heartbeat: self.inner.config.heartbeat_interval(),
        };

        tracing::debug!("Connecting to {} (attempt seq {})", options.endpoint, seq);
        let events = match self.inner.transport.connect(&options).await {
            Ok(events) => events,
            Err(e) => return self.connect_failed(seq, e.to_string()),
        };

        let opened = {
            let mut engine = self.engine();
            if engine.connect_seq != seq
                || engine.session.state() != ConnectionState::Connecting
            {
                Opened::Superseded {
                    close: engine.connect_seq == seq,
                }
            } else {
                engine.self_id = Some(user_id);
                engine.last_inbound = Instant::now();
                let actions = self.apply_locked(&mut engine, Event::ConnectSucceeded);
                Opened::Live(engine.session.epoch(), actions)
            }
        };

        match opened {
            Opened::Live(epoch, actions) => {
                self.spawn_epoch_tasks(epoch, events);
                actions
            }
            Opened::Superseded { close } => {
                tracing::debug!("Discarding superseded connection (seq {})", seq);
                if close {
                    let _ = self.inner.transport.close().await;
                }
                Vec::new()
            }
        }
    }

    fn connect_failed(&self, seq: u64, error: String) -> Vec<Action> {
        let mut engine = self.engine();
        if engine.connect_seq != seq || engine.session.state() != ConnectionState::Connecting {
            return Vec::new();
        }
        tracing::warn!("Connection attempt failed: {}", error);
        let retries_left = engine.scheduler.has_retries_left();
        self.apply_locked(
            &mut engine,
            Event::ConnectFailed {
                error,
                retries_left,
            },
        )
    }

    fn start_reconnection(&self) -> Vec<Action> {
        let (schedule, max_attempts) = {
            let mut engine = self.engine();
            let epoch = engine.session.epoch();
            let jitter = engine.scheduler.policy().sample_jitter();
            let schedule = engine.scheduler.schedule(epoch, jitter);
            (schedule, engine.scheduler.max_attempts())
        };

        match schedule {
            Schedule::Scheduled(attempt) => {
                let delay = attempt.scheduled_delay;
                tracing::info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay,
                    attempt.attempt_number,
                    max_attempts
                );
                self.emit(ChatEvent::Reconnecting {
                    attempt: attempt.attempt_number,
                    max_attempts,
                    delay,
                });

                let commands = self.inner.commands.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = commands.send(Command::RetryTimer(attempt));
                });
                if let Some(previous) = self.tasks().retry.replace(timer) {
                    previous.abort();
                }
                Vec::new()
            }
            Schedule::AlreadyScheduled => Vec::new(),
            Schedule::Exhausted { attempts } => {
                tracing::debug!("No reconnection left after {} attempts", attempts);
                let mut engine = self.engine();
                self.apply_locked(&mut engine, Event::RetriesExhausted)
            }
        }
    }

    fn spawn_driver(&self, mut commands: mpsc::UnboundedReceiver<Command>) -> JoinHandle<()> {
        let weak = self.downgrade();
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let Some(client) = Self::upgrade(&weak) else {
                    break;
                };
                client.handle_command(command).await;
            }
        })
    }

    async fn handle_command(&self, command: Command) {
        let actions = match command {
            Command::TransportLost { epoch, reason } => {
                let mut engine = self.engine();
                if engine.session.epoch() != epoch || !engine.session.state().is_connected() {
                    tracing::debug!("Ignoring loss report for epoch {}: {}", epoch, reason);
                    Vec::new()
                } else {
                    tracing::warn!("Connection lost: {}", reason);
                    self.apply_locked(&mut engine, Event::TransportLost { reason })
                }
            }
            Command::RetryTimer(attempt) => {
                let mut engine = self.engine();
                let epoch = engine.session.epoch();
                if engine.scheduler.fire(&attempt, epoch) {
                    self.apply_locked(&mut engine, Event::RetryTimerFired)
                } else {
                    tracing::debug!("Ignoring stale timer for attempt {}", attempt.attempt_number);
                    Vec::new()
                }
            }
        };
        self.run_actions(actions).await;
    }

    fn report_lost(&self, epoch: SessionEpoch, reason: String) {
        let _ = self
            .inner
            .commands
            .send(Command::TransportLost { epoch, reason });
    }

    fn touch(&self, epoch: SessionEpoch) {
        let mut engine = self.engine();
        if engine.session.epoch() == epoch {
            engine.last_inbound = Instant::now();
        }
    }

    fn spawn_epoch_tasks(
        &self,
        epoch: SessionEpoch,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let weak = self.downgrade();
        let pump = tokio::spawn(async move {
            let reason = loop {
                let Some(event) = events.recv().await else {
                    break "connection closed".to_string();
                };
                let Some(client) = Self::upgrade(&weak) else {
                    return;
                };
                match event {
                    TransportEvent::Frame(frame) => {
                        client.touch(epoch);
                        client.handle_frame(epoch, frame);
                    }
                    TransportEvent::Heartbeat => client.touch(epoch),
                    TransportEvent::Closed { reason } => break reason,
                }
            };
            if let Some(client) = Self::upgrade(&weak) {
                client.report_lost(epoch, reason);
            }
        });

        let weak = self.downgrade();
        let interval = self
            .inner
            .config
            .heartbeat_interval()
            .max(Duration::from_millis(1));
        let timeout = self.inner.config.heartbeat_timeout();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(client) = Self::upgrade(&weak) else {
                    return;
                };
                let silence = {
                    let engine = client.engine();
                    if engine.session.epoch() != epoch {
                        return;
                    }
                    engine.last_inbound.elapsed()
                };
                if silence >= timeout {
                    tracing::warn!("No traffic for {:?}, declaring connection lost", silence);
                    client.report_lost(epoch, "heartbeat timeout".to_string());
                    return;
                }
                if let Err(e) = client.inner.transport.heartbeat().await {
                    tracing::debug!("Heartbeat failed: {}", e);
                }
            }
        });

        let previous = std::mem::replace(&mut self.tasks().epoch, vec![pump, heartbeat]);
        for task in previous {
            task.abort();
        }
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak = self.downgrade();
        let period = self
            .inner
            .config
            .sweep_interval()
            .max(Duration::from_millis(1));
        tokio::spawn(async move {
            tracing::debug!("Maintenance task started (interval: {:?})", period);
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                let Some(client) = Self::upgrade(&weak) else {
                    return;
                };
                client.run_maintenance();
            }
        })
    }

    fn run_maintenance(&self) {
        let (expired, pruned) = {
            let mut engine = self.engine();
            let now = now();
            (
                engine.reconciler.sweep(now),
                engine.fingerprints.prune(now),
            )
        };
        if pruned > 0 {
            tracing::debug!("Maintenance: pruned {} outbound fingerprints", pruned);
        }
        for local_id in expired {
            tracing::warn!("Message {} was never confirmed", local_id);
            self.emit(ChatEvent::MessageFailed {
                local_id,
                error: "confirmation timeout".to_string(),
            });
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a handler for frames on `channel`.
    ///
    /// The registration is durable: it is activated now if connected and
    /// replayed after every reconnect until [`ChatClient::unsubscribe`]. A
    /// failed activation emits [`ChatEvent::Error`] and is retried after the
    /// base reconnect delay while the connection lasts.
    pub async fn subscribe<F>(&self, channel: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        let (id, activation) = {
            let mut engine = self.engine();
            let id = engine
                .registry
                .register(channel, Route::App(Arc::new(handler)));
            let epoch = engine.session.epoch();
            let activate = engine.session.state().is_connected()
                && engine.registry.begin_channel_activation(channel, epoch);
            (id, activate.then_some(epoch))
        };
        if let Some(epoch) = activation {
            let _ = self.activate_channel(channel, epoch).await;
        }
        tracing::debug!("Registered {} on {}", id, channel);
        id
    }

    /// Remove a registration. The live transport subscription is released
    /// when its last handler goes. Returns false for unknown ids.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.engine().registry.unregister(id);
        let Some(removed) = removed else {
            return false;
        };
        if let Some(handle) = removed.released {
            if let Err(e) = self.inner.transport.unsubscribe(handle).await {
                tracing::debug!("Unsubscribe from {} skipped: {}", removed.channel, e);
            }
        }
        true
    }

    pub(crate) async fn activate_channel(
        &self,
        channel: &str,
        epoch: SessionEpoch,
    ) -> Result<(), ClientError> {
        match self.inner.transport.subscribe(channel).await {
            Ok(handle) => {
                let completion = self
                    .engine()
                    .registry
                    .complete_activation(channel, epoch, handle);
                if let Completion::Stale(stale) = completion {
                    tracing::debug!("Releasing stale subscription on {}", channel);
                    let _ = self.inner.transport.unsubscribe(stale).await;
                }
                Ok(())
            }
            Err(e) => {
                self.engine().registry.abort_activation(channel, epoch);
                tracing::warn!("Subscribe to {} failed: {}", channel, e);
                let error = ClientError::from(e);
                self.emit(ChatEvent::Error {
                    kind: error.kind(),
                    message: format!("subscribe to {} failed: {}", channel, error),
                });
                self.spawn_reactivation(channel, epoch);
                Err(error)
            }
        }
    }

    /// Retry a failed activation after the base reconnect delay, as long as
    /// the channel is still registered and `epoch` is still live.
    fn spawn_reactivation(&self, channel: &str, epoch: SessionEpoch) {
        let weak = self.downgrade();
        let channel = channel.to_string();
        let delay = self.inner.config.backoff_policy().delay_for_attempt(1, 1.0);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(client) = Self::upgrade(&weak) else {
                return;
            };
            let retry = {
                let mut engine = client.engine();
                engine.session.epoch() == epoch
                    && engine.session.state().is_connected()
                    && engine.registry.begin_channel_activation(&channel, epoch)
            };
            if retry {
                tracing::debug!("Retrying subscribe to {}", channel);
                let _ = client.activate_channel(&channel, epoch).await;
            }
        });
        let mut tasks = self.tasks();
        tasks.epoch.retain(|t| !t.is_finished());
        tasks.epoch.push(task);
    }

    async fn resubscribe_all(&self) {
        let (channels, epoch) = {
            let mut engine = self.engine();
            if !engine.session.state().is_connected() {
                self.inner.ready_tx.send_replace(engine.session.epoch());
                return;
            }
            let epoch = engine.session.epoch();
            (engine.registry.begin_activation(epoch), epoch)
        };
        let total = channels.len();
        let mut failed = 0;
        for channel in channels {
            if self.activate_channel(&channel, epoch).await.is_err() {
                failed += 1;
            }
        }
        tracing::info!(
            "Subscribed {} channels for epoch {} ({} failed)",
            total - failed,
            epoch,
            failed
        );
        self.inner.ready_tx.send_replace(epoch);
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn handle_frame(&self, epoch: SessionEpoch, frame: InboundFrame) {
        let routes = {
            let engine = self.engine();
            if engine.session.epoch() != epoch || !engine.session.state().is_connected() {
                return;
            }
            engine.registry.handlers(&frame.destination)
        };
        if routes.is_empty() {
            tracing::debug!("No handler for frame on {}", frame.destination);
            return;
        }

        // A duplicate message is dropped before any handler on its channel runs.
        let mut message = None;
        if routes
            .iter()
            .any(|r| matches!(r, Route::System(SystemRoute::Messages)))
        {
            match frame.decode::<ChatMessage>() {
                Ok(decoded) => {
                    let duplicate = self.engine().fingerprints.should_suppress_inbound(decoded.id);
                    if duplicate {
                        tracing::debug!("Suppressing duplicate message {}", decoded.id);
                        return;
                    }
                    message = Some(decoded);
                }
                Err(e) => self.report_malformed(&frame, e.to_string()),
            }
        }

        for route in routes {
            match route {
                Route::System(SystemRoute::Messages) => {
                    if let Some(message) = message.take() {
                        self.deliver_message(message);
                    }
                }
                Route::System(SystemRoute::Typing) => {
                    self.decode_and_emit(&frame, ChatEvent::Typing)
                }
                Route::System(SystemRoute::ReadReceipts) => {
                    self.decode_and_emit(&frame, ChatEvent::ReadReceipt)
                }
                Route::System(SystemRoute::MessageDeleted) => {
                    self.decode_and_emit(&frame, ChatEvent::MessageDeleted)
                }
                Route::System(SystemRoute::Status) => {
                    self.decode_and_emit(&frame, ChatEvent::StatusUpdate)
                }
                Route::System(SystemRoute::Errors) => {
                    let message = frame
                        .decode::<ServerError>()
                        .map(|e| e.message)
                        .unwrap_or_else(|_| frame.body.clone());
                    tracing::warn!("Server error: {}", message);
                    self.emit(ChatEvent::Error {
                        kind: ErrorKind::Server,
                        message,
                    });
                }
                Route::Reply(request_type) => self.resolve_reply(&request_type, &frame),
                Route::App(handler) => handler(&frame),
            }
        }
    }

    fn decode_and_emit<P: DeserializeOwned>(&self, frame: &InboundFrame, wrap: fn(P) -> ChatEvent) {
        match frame.decode::<P>() {
            Ok(payload) => self.emit(wrap(payload)),
            Err(e) => self.report_malformed(frame, e.to_string()),
        }
    }

    fn report_malformed(&self, frame: &InboundFrame, reason: String) {
        tracing::warn!("Malformed payload on {}: {}", frame.destination, reason);
        self.emit(ChatEvent::Error {
            kind: ErrorKind::MalformedResponse,
            message: ClientError::MalformedResponse {
                destination: frame.destination.clone(),
                reason,
            }
            .to_string(),
        });
    }

    fn deliver_message(&self, message: ChatMessage) {
        let replaces = {
            let mut engine = self.engine();
            if engine.self_id == Some(message.sender_id) {
                match engine.reconciler.reconcile(&message, now()) {
                    Reconciliation::Confirmed { local_id } => Some(local_id),
                    Reconciliation::New => None,
                }
            } else {
                None
            }
        };
        if let Some(local_id) = replaces {
            tracing::debug!("Message {} confirms {}", message.id, local_id);
        }
        self.emit(ChatEvent::NewMessage { message, replaces });
    }

    /// Feed messages obtained outside the live connection (history polling,
    /// a REST fetch) through duplicate suppression and reconciliation.
    ///
    /// Returns how many were new and delivered.
    pub fn ingest(&self, messages: Vec<ChatMessage>) -> usize {
        let mut delivered = 0;
        for message in messages {
            let duplicate = self.engine().fingerprints.should_suppress_inbound(message.id);
            if duplicate {
                continue;
            }
            self.deliver_message(message);
            delivered += 1;
        }
        delivered
    }

    /// Whether a server message id was already delivered.
    pub fn was_processed(&self, id: MessageId) -> bool {
        self.engine().fingerprints.was_processed(id)
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Send a chat message optimistically.
    ///
    /// The message is recorded as pending before it is published and
    /// confirmed when the server's copy arrives. An identical message to the
    /// same recipient inside the duplicate window is suppressed.
    pub async fn send_message(&self, receiver: UserId, content: &str) -> SendOutcome {
        let local_id = LocalId::new();
        {
            let mut engine = self.engine();
            let now = now();
            if engine
                .fingerprints
                .should_suppress_outbound(content, receiver, now)
            {
                tracing::debug!("Suppressing duplicate send to {}", receiver);
                return SendOutcome::Suppressed;
            }
            engine
                .reconciler
                .record_pending(local_id, content, receiver, now);
        }
        self.publish_pending(local_id, receiver, content).await
    }

    /// Republish a failed message under its original local id.
    pub async fn retry_message(&self, local_id: LocalId) -> Result<SendOutcome, ClientError> {
        let entry = self.engine().reconciler.retry(local_id, now());
        let Some(entry) = entry else {
            return Err(ClientError::UnknownMessage(local_id));
        };
        Ok(self
            .publish_pending(local_id, entry.counterparty, &entry.content)
            .await)
    }

    async fn publish_pending(&self, local_id: LocalId, receiver: UserId, content: &str) -> SendOutcome {
        let payload = OutgoingMessage {
            receiver_id: receiver,
            content: content.to_string(),
            message_type: MessageKind::Text,
        };
        match self.send(SEND_MESSAGE, &payload).await {
            Ok(()) => SendOutcome::Pending(local_id),
            Err(error) => {
                {
                    let mut engine = self.engine();
                    engine.fingerprints.forget_outbound(content, receiver);
                    engine
                        .reconciler
                        .mark_failed(local_id, &error.to_string(), now());
                }
                tracing::warn!("Send of {} failed: {}", local_id, error);
                self.emit(ChatEvent::MessageFailed {
                    local_id,
                    error: error.to_string(),
                });
                SendOutcome::Failed { local_id, error }
            }
        }
    }

    /// Tell `receiver` the local user started or stopped typing.
    pub async fn send_typing(&self, receiver: UserId, typing: bool) -> Result<(), ClientError> {
        let sender = self.engine().self_id;
        let Some(sender_id) = sender else {
            return Err(ClientError::TransportUnavailable);
        };
        self.send(
            SEND_TYPING,
            &TypingNotification {
                sender_id,
                receiver_id: Some(receiver),
                typing,
            },
        )
        .await
    }

    /// Mark a message as read.
    pub async fn mark_read(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.send(
            MARK_READ,
            &ReadReceipt {
                message_id,
                reader_id: None,
            },
        )
        .await
    }

    /// Ask the server to delete a message.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.send(DELETE_MESSAGE, &MessageDeleted { message_id }).await
    }

    /// Publish a JSON payload to a destination.
    pub async fn send<P: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &P,
    ) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::TransportUnavailable);
        }
        let body = encode_body(payload)?;
        self.inner
            .transport
            .publish(destination, &body)
            .await
            .map_err(ClientError::from_publish)
    }

    // =========================================================================
    // Events and introspection
    // =========================================================================

    /// Register an event listener.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    /// Remove an event listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Listen for connection state changes only.
    pub fn on_connection_status<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.on(EventKind::ConnectionStatus, move |event| {
            if let ChatEvent::ConnectionStatus(change) = event {
                listener(change);
            }
        })
    }

    /// Watch channel of the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.engine().session.state()
    }

    /// Current session epoch.
    pub fn epoch(&self) -> SessionEpoch {
        self.engine().session.epoch()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Automatic reconnection attempts in the current outage.
    pub fn reconnect_attempts(&self) -> u32 {
        self.engine().scheduler.attempts()
    }

    /// Requests waiting for a response.
    pub fn pending_request_count(&self) -> usize {
        self.engine().requests.len()
    }

    /// One optimistic message.
    pub fn pending_message(&self, local_id: LocalId) -> Option<PendingMessage> {
        self.engine().reconciler.get(local_id).cloned()
    }

    /// All tracked optimistic messages, oldest first.
    pub fn pending_messages(&self) -> Vec<PendingMessage> {
        self.engine().reconciler.entries().cloned().collect()
    }

    /// Local user, known once connected.
    pub fn user_id(&self) -> Option<UserId> {
        self.engine().self_id
    }

    /// Effective configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }
}

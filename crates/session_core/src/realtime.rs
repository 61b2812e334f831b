use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
    time::Duration,
};

use shared::{
    domain::{ConversationId, MessageId},
    protocol::{ChatMessage, ClientFrame, ConversationUpdate, ServerEvent},
};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    error::ChannelError,
    session::CredentialStore,
    settings::ClientSettings,
    transport::{LinkEvent, RealtimeConnector, RealtimeLink, WebSocketConnector},
};

const DEDUP_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectEvent {
    pub reconnected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientRequested,
    Transport(ChannelError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub reason: DisconnectReason,
    pub will_reconnect: bool,
    /// Frames accepted by `join_conversation`, `leave_conversation` or `send_message`
    /// that the link closed before writing, oldest first. They are never re-sent.
    pub undelivered: Vec<ClientFrame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RealtimeOptions {
    pub connect_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            backoff: Backoff::default(),
        }
    }
}

impl RealtimeOptions {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            backoff: Backoff {
                initial: settings.reconnect_initial(),
                max: settings.reconnect_max(),
            },
        }
    }
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct HandlerEntry<T> {
    active: Arc<AtomicBool>,
    handler: Handler<T>,
}

trait HandlerRegistry: Send + Sync {
    fn remove(&self, id: u64);
}

/// Fan-out set of subscribers, invoked in registration order.
struct HandlerSet<T> {
    next_id: AtomicU64,
    entries: StdMutex<BTreeMap<u64, HandlerEntry<T>>>,
}

impl<T: 'static> HandlerSet<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            entries: StdMutex::new(BTreeMap::new()),
        })
    }

    fn subscribe(self: &Arc<Self>, handler: Handler<T>) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.lock_entries().insert(
            id,
            HandlerEntry {
                active: Arc::clone(&active),
                handler,
            },
        );
        let weak: Weak<Self> = Arc::downgrade(self);
        let registry: Weak<dyn HandlerRegistry> = weak;
        Unsubscribe {
            id,
            active,
            registry,
        }
    }

    fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<(Arc<AtomicBool>, Handler<T>)> = self
            .lock_entries()
            .values()
            .map(|entry| (Arc::clone(&entry.active), Arc::clone(&entry.handler)))
            .collect();
        let mut delivered = 0;
        for (active, handler) in snapshot {
            // Unsubscribed by an earlier handler in this same pass.
            if !active.load(Ordering::Acquire) {
                continue;
            }
            handler(value);
            delivered += 1;
        }
        delivered
    }

    fn len(&self) -> usize {
        self.lock_entries().len()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, HandlerEntry<T>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: 'static> HandlerRegistry for HandlerSet<T> {
    fn remove(&self, id: u64) {
        self.lock_entries().remove(&id);
    }
}

/// Handle returned by every `on_*` registration.
#[must_use = "dropping an Unsubscribe keeps the handler registered"]
pub struct Unsubscribe {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<dyn HandlerRegistry>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct RecentMessageIds {
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl RecentMessageIds {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(DEDUP_WINDOW),
            seen: HashSet::with_capacity(DEDUP_WINDOW),
        }
    }

    fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > DEDUP_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    exit: watch::Receiver<Option<ChannelError>>,
    task: JoinHandle<()>,
}

impl Supervisor {
    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            if err.is_panic() {
                warn!("realtime: connection supervisor panicked");
            }
        }
    }
}

enum LinkEnd {
    Shutdown,
    Lost(ChannelError),
}

struct OutboundLink {
    frames: mpsc::UnboundedSender<ClientFrame>,
    // Queued on the link but not yet confirmed written by the transport.
    unflushed: VecDeque<ClientFrame>,
}

pub struct ChannelManager {
    connector: Arc<dyn RealtimeConnector>,
    credentials: Arc<CredentialStore>,
    url: Url,
    options: RealtimeOptions,
    state: watch::Sender<ConnectionState>,
    outbound: StdMutex<Option<OutboundLink>>,
    supervisor: Mutex<Option<Supervisor>>,
    recent_messages: StdMutex<RecentMessageIds>,
    message_handlers: Arc<HandlerSet<ChatMessage>>,
    update_handlers: Arc<HandlerSet<ConversationUpdate>>,
    connect_handlers: Arc<HandlerSet<ConnectEvent>>,
    disconnect_handlers: Arc<HandlerSet<DisconnectEvent>>,
}

impl ChannelManager {
    pub fn new(credentials: Arc<CredentialStore>, url: Url, options: RealtimeOptions) -> Arc<Self> {
        Self::new_with_connector(credentials, url, options, Arc::new(WebSocketConnector))
    }

    pub fn new_with_connector(
        credentials: Arc<CredentialStore>,
        url: Url,
        options: RealtimeOptions,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            connector,
            credentials,
            url,
            options,
            state,
            outbound: StdMutex::new(None),
            supervisor: Mutex::new(None),
            recent_messages: StdMutex::new(RecentMessageIds::new()),
            message_handlers: HandlerSet::new(),
            update_handlers: HandlerSet::new(),
            connect_handlers: HandlerSet::new(),
            disconnect_handlers: HandlerSet::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Opens the connection unless one is already live.
    ///
    /// Resolves once the first attempt opens or fails; after a failure the
    /// supervisor keeps retrying in the background with backoff. A call made
    /// while it retries waits for the link or for the supervisor to give up.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ChannelError> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(Supervisor::is_stopping) {
            if let Some(stopping) = supervisor.take() {
                stopping.stop().await;
            }
        }
        if self.is_connected() {
            return Ok(());
        }

        let running_exit = supervisor
            .as_ref()
            .filter(|running| !running.task.is_finished())
            .map(|running| running.exit.clone());
        if let Some(mut exit) = running_exit {
            drop(supervisor);
            let mut state = self.state.subscribe();
            let connected = async {
                state
                    .wait_for(|state| *state == ConnectionState::Connected)
                    .await
                    .is_ok()
            };
            let exited = async {
                exit.wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|reason| (*reason).clone())
            };
            let outcome = timeout(self.options.connect_timeout, async {
                tokio::select! {
                    connected = connected => {
                        if connected {
                            Ok(())
                        } else {
                            Err(ChannelError::Closed("channel manager dropped".into()))
                        }
                    }
                    reason = exited => Err(reason.unwrap_or_else(|| {
                        ChannelError::Closed("connection supervisor stopped".into())
                    })),
                }
            })
            .await;
            return outcome.unwrap_or(Err(ChannelError::ConnectTimeout));
        }

        if !self.credentials.is_authenticated() {
            return Err(ChannelError::NoSession);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (first_tx, first_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let reason = manager.supervise(shutdown_rx, first_tx).await;
            exit_tx.send_replace(Some(reason));
        });
        *supervisor = Some(Supervisor {
            shutdown: shutdown_tx,
            exit: exit_rx,
            task,
        });
        drop(supervisor);

        first_rx.await.unwrap_or_else(|_| {
            Err(ChannelError::Closed(
                "connection supervisor stopped before connecting".into(),
            ))
        })
    }

    /// Closes the connection and stops reconnecting until the next `connect()`.
    pub async fn disconnect(&self) {
        let mut supervisor = self.supervisor.lock().await;
        let Some(running) = supervisor.take() else {
            return;
        };
        running.stop().await;
        self.lock_outbound().take();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Signals the supervisor to close the link without waiting for it.
    ///
    /// Returns `false` when another `connect()` or `disconnect()` holds the
    /// supervisor; the caller should fall back to `disconnect()`.
    pub(crate) fn request_shutdown(&self) -> bool {
        let Ok(supervisor) = self.supervisor.try_lock() else {
            return false;
        };
        if let Some(running) = supervisor.as_ref() {
            running.shutdown.send_replace(true);
        }
        true
    }

    pub fn join_conversation(&self, conversation_id: &ConversationId) -> Result<(), ChannelError> {
        self.send_frame(
            "join conversation",
            ClientFrame::JoinConversation {
                conversation_id: conversation_id.clone(),
            },
        )
    }

    pub fn leave_conversation(&self, conversation_id: &ConversationId) -> Result<(), ChannelError> {
        self.send_frame(
            "leave conversation",
            ClientFrame::LeaveConversation {
                conversation_id: conversation_id.clone(),
            },
        )
    }

    /// Publishes on the open connection and returns the client message id carried by the frame.
    pub fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: impl Into<String>,
    ) -> Result<Uuid, ChannelError> {
        let client_message_id = Uuid::new_v4();
        self.send_frame(
            "send message",
            ClientFrame::Message {
                conversation_id: conversation_id.clone(),
                content: content.into(),
                client_message_id,
            },
        )?;
        Ok(client_message_id)
    }

    pub fn on_message<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.message_handlers.subscribe(Arc::new(handler))
    }

    pub fn on_conversation_update<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&ConversationUpdate) + Send + Sync + 'static,
    {
        self.update_handlers.subscribe(Arc::new(handler))
    }

    pub fn on_connect<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&ConnectEvent) + Send + Sync + 'static,
    {
        self.connect_handlers.subscribe(Arc::new(handler))
    }

    pub fn on_disconnect<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&DisconnectEvent) + Send + Sync + 'static,
    {
        self.disconnect_handlers.subscribe(Arc::new(handler))
    }

    pub fn message_subscriber_count(&self) -> usize {
        self.message_handlers.len()
    }

    fn send_frame(&self, operation: &'static str, frame: ClientFrame) -> Result<(), ChannelError> {
        let mut guard = self.lock_outbound();
        let Some(link) = guard.as_mut().filter(|_| self.is_connected()) else {
            return Err(ChannelError::NotConnected { operation });
        };
        link.frames
            .send(frame.clone())
            .map_err(|_| ChannelError::NotConnected { operation })?;
        debug!(conversation_id = %frame.conversation_id(), operation, "realtime: frame queued");
        link.unflushed.push_back(frame);
        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        first_attempt: oneshot::Sender<Result<(), ChannelError>>,
    ) -> ChannelError {
        let mut first_attempt = Some(first_attempt);
        let mut failures: u32 = 0;
        let mut has_connected = false;

        let exit = loop {
            self.set_state(ConnectionState::Connecting);
            let Some(token) = self.credentials.access_token() else {
                info!("realtime: no session, stopping reconnection");
                if let Some(tx) = first_attempt.take() {
                    let _ = tx.send(Err(ChannelError::NoSession));
                }
                break ChannelError::NoSession;
            };

            let attempt = tokio::select! {
                _ = shutdown.changed() => break client_stop(),
                attempt = timeout(
                    self.options.connect_timeout,
                    self.connector.connect(&self.url, &token),
                ) => attempt.unwrap_or(Err(ChannelError::ConnectTimeout)),
            };

            match attempt {
                Ok(link) => {
                    failures = 0;
                    let (end, undelivered) = self
                        .run_link(link, &mut shutdown, &mut first_attempt, has_connected)
                        .await;
                    has_connected = true;
                    match end {
                        LinkEnd::Shutdown => {
                            info!("realtime: disconnected by client");
                            self.disconnect_handlers.emit(&DisconnectEvent {
                                reason: DisconnectReason::ClientRequested,
                                will_reconnect: false,
                                undelivered,
                            });
                            break client_stop();
                        }
                        LinkEnd::Lost(err) => {
                            warn!(error = %err, "realtime: connection lost");
                            self.disconnect_handlers.emit(&DisconnectEvent {
                                reason: DisconnectReason::Transport(err),
                                will_reconnect: true,
                                undelivered,
                            });
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        attempt = failures + 1,
                        error = %err,
                        "realtime: connect attempt failed"
                    );
                    if let Some(tx) = first_attempt.take() {
                        let _ = tx.send(Err(err));
                    }
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            let delay = self.options.backoff.delay(failures);
            failures = failures.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "realtime: scheduling reconnect");
            tokio::select! {
                _ = shutdown.changed() => break client_stop(),
                _ = sleep(delay) => {}
            }
        };

        self.lock_outbound().take();
        self.set_state(ConnectionState::Disconnected);
        exit
    }

    async fn run_link(
        &self,
        link: RealtimeLink,
        shutdown: &mut watch::Receiver<bool>,
        first_attempt: &mut Option<oneshot::Sender<Result<(), ChannelError>>>,
        reconnected: bool,
    ) -> (LinkEnd, Vec<ClientFrame>) {
        let RealtimeLink {
            outbound,
            mut inbound,
        } = link;
        *self.lock_outbound() = Some(OutboundLink {
            frames: outbound,
            unflushed: VecDeque::new(),
        });
        self.set_state(ConnectionState::Connected);
        info!(reconnected, "realtime: connected");
        if let Some(tx) = first_attempt.take() {
            let _ = tx.send(Ok(()));
        }
        self.connect_handlers.emit(&ConnectEvent { reconnected });

        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => break LinkEnd::Shutdown,
                event = inbound.recv() => match event {
                    Some(LinkEvent::Event(event)) => self.dispatch(event),
                    Some(LinkEvent::Flushed) => self.mark_flushed(),
                    Some(LinkEvent::Closed(err)) => break LinkEnd::Lost(err),
                    None => break LinkEnd::Lost(ChannelError::Closed(
                        "transport dropped the link".into(),
                    )),
                },
            }
        };

        // Unacknowledged frames go down with the link and are never re-sent.
        let undelivered: Vec<ClientFrame> = self
            .lock_outbound()
            .take()
            .map(|link| link.unflushed.into())
            .unwrap_or_default();
        if !undelivered.is_empty() {
            warn!(
                count = undelivered.len(),
                "realtime: frames dropped with the closed link"
            );
        }
        self.set_state(ConnectionState::Disconnected);
        (end, undelivered)
    }

    fn mark_flushed(&self) {
        if let Some(link) = self.lock_outbound().as_mut() {
            link.unflushed.pop_front();
        }
    }

    fn dispatch(&self, event: ServerEvent) {
        match event {
            ServerEvent::Message { message } => {
                let fresh = self
                    .recent_messages
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(message.message_id);
                if !fresh {
                    debug!(
                        message_id = message.message_id.0,
                        "realtime: dropping duplicate message"
                    );
                    return;
                }
                self.message_handlers.emit(&message);
            }
            ServerEvent::ConversationUpdate { update } => {
                self.update_handlers.emit(&update);
            }
            ServerEvent::Error(err) => {
                warn!(
                    code = ?err.code,
                    detail = %err.detail,
                    "realtime: server reported an error"
                );
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Option<OutboundLink>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn client_stop() -> ChannelError {
    ChannelError::Closed("disconnected by client".into())
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;

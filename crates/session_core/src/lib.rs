use std::sync::{Arc, Mutex as StdMutex, Weak};

use shared::domain::{Role, UserId};
use tracing::info;

pub mod error;
pub mod gateway;
pub mod realtime;
pub mod session;
pub mod settings;
pub mod transport;
pub mod unread;

pub use error::{
    AuthError, BusinessError, ChannelError, GatewayError, TransportError, TransportErrorCode,
};
pub use gateway::{ApiRequest, ApiResponse, RequestGateway};
pub use realtime::{
    Backoff, ChannelManager, ConnectEvent, ConnectionState, DisconnectEvent, DisconnectReason,
    RealtimeOptions, Unsubscribe,
};
pub use session::{CredentialStore, Session, SessionError, SessionObserver};
pub use settings::{load_settings, ClientSettings};
pub use transport::{LinkEvent, RealtimeConnector, RealtimeLink, WebSocketConnector};
pub use unread::{UnreadReconciler, UnreadSnapshot, UnreadSource};

/// Tears the realtime channel down whenever the session goes away or changes hands.
///
/// A refresh for the same user keeps the link; the next reconnect picks up the new token.
struct ChannelTeardown {
    channel: Weak<ChannelManager>,
    user: StdMutex<Option<UserId>>,
}

impl ChannelTeardown {
    fn new(channel: &Arc<ChannelManager>, credentials: &CredentialStore) -> Self {
        Self {
            channel: Arc::downgrade(channel),
            user: StdMutex::new(credentials.snapshot().map(|session| session.user_id)),
        }
    }

    fn swap_user(&self, user: Option<UserId>) -> Option<UserId> {
        let mut current = self
            .user
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *current, user)
    }

    fn close_channel(&self) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if channel.request_shutdown() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                channel.disconnect().await;
            });
        }
    }
}

impl SessionObserver for ChannelTeardown {
    fn on_session_replaced(&self, session: &Session) {
        let previous = self.swap_user(Some(session.user_id));
        if let Some(previous) = previous.filter(|previous| *previous != session.user_id) {
            info!(
                previous = previous.0,
                user_id = session.user_id.0,
                "session: user changed, closing realtime channel"
            );
            self.close_channel();
        }
    }

    fn on_session_cleared(&self) {
        self.swap_user(None);
        self.close_channel();
    }
}

/// Explicit per-login lifecycle for the credential store, gateway and realtime channel.
pub struct SessionContext {
    settings: ClientSettings,
    credentials: Arc<CredentialStore>,
    gateway: Arc<RequestGateway>,
    channel: Arc<ChannelManager>,
    unread: StdMutex<Option<Arc<UnreadReconciler>>>,
}

impl SessionContext {
    pub fn new(settings: ClientSettings) -> Result<Self, ChannelError> {
        Self::new_with_connector(settings, Arc::new(WebSocketConnector))
    }

    pub fn new_with_connector(
        settings: ClientSettings,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Result<Self, ChannelError> {
        let credentials = CredentialStore::new();
        let gateway = RequestGateway::new(
            settings.api_url.clone(),
            Arc::clone(&credentials),
            settings.request_timeout(),
        );
        let channel = ChannelManager::new_with_connector(
            Arc::clone(&credentials),
            settings.realtime_url()?,
            RealtimeOptions::from_settings(&settings),
            connector,
        );
        credentials.add_observer(Arc::new(ChannelTeardown::new(&channel, &credentials)));
        Ok(Self {
            settings,
            credentials,
            gateway,
            channel,
            unread: StdMutex::new(None),
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    pub fn channel(&self) -> &Arc<ChannelManager> {
        &self.channel
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, GatewayError> {
        self.gateway.execute(request).await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, GatewayError> {
        self.gateway.login(username, password).await
    }

    /// Starts unread reconciliation for `role`, or the session's own role when `None`.
    pub fn start_unread(&self, role: Option<Role>) -> Option<Arc<UnreadReconciler>> {
        let role = role.or_else(|| self.credentials.snapshot().map(|session| session.role))?;
        let reconciler = UnreadReconciler::new(
            role,
            self.settings.unread_path.clone(),
            Arc::clone(&self.gateway),
        );
        reconciler.start(&self.channel, self.settings.unread_poll_interval());
        let previous = self
            .lock_unread()
            .replace(Arc::clone(&reconciler));
        if let Some(previous) = previous {
            previous.stop();
        }
        Some(reconciler)
    }

    pub async fn logout(&self) {
        if let Some(reconciler) = self.lock_unread().take() {
            reconciler.stop();
        }
        self.channel.disconnect().await;
        self.gateway.logout().await;
        info!("session: logged out");
    }

    fn lock_unread(&self) -> std::sync::MutexGuard<'_, Option<Arc<UnreadReconciler>>> {
        self.unread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/context_tests.rs"]
mod tests;

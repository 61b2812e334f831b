use std::{
    sync::{Arc, Mutex as StdMutex, Weak},
    time::Duration,
};

use shared::{
    domain::Role,
    protocol::{UnreadCountResponse, UnreadCounts},
};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::{
    error::GatewayError,
    gateway::{ApiRequest, RequestGateway},
    realtime::{ChannelManager, Unsubscribe},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadSource {
    Initial,
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub count: u64,
    pub source: UnreadSource,
}

/// Eventually-consistent unread badge for one viewer role.
///
/// Push events update the value as they arrive; every poll overwrites it with
/// the authoritative count from the API.
pub struct UnreadReconciler {
    role: Role,
    path: String,
    gateway: Arc<RequestGateway>,
    value: watch::Sender<UnreadSnapshot>,
    subscriptions: StdMutex<Vec<Unsubscribe>>,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

impl UnreadReconciler {
    pub fn new(role: Role, path: impl Into<String>, gateway: Arc<RequestGateway>) -> Arc<Self> {
        let (value, _) = watch::channel(UnreadSnapshot {
            count: 0,
            source: UnreadSource::Initial,
        });
        Arc::new(Self {
            role,
            path: path.into(),
            gateway,
            value,
            subscriptions: StdMutex::new(Vec::new()),
            poller: StdMutex::new(None),
        })
    }

    /// Subscribes to push events and starts the periodic pull.
    pub fn start(self: &Arc<Self>, channel: &ChannelManager, poll_interval: Duration) {
        self.attach(channel);
        self.spawn_poller(poll_interval);
    }

    pub fn attach(self: &Arc<Self>, channel: &ChannelManager) {
        let weak = Arc::downgrade(self);
        let on_message = {
            let weak = Weak::clone(&weak);
            channel.on_message(move |message| {
                if let Some(reconciler) = weak.upgrade() {
                    reconciler.apply_push(message.unread_counts.as_ref());
                }
            })
        };
        let on_update = {
            let weak = Weak::clone(&weak);
            channel.on_conversation_update(move |update| {
                if let Some(reconciler) = weak.upgrade() {
                    reconciler.apply_push(update.unread_counts.as_ref());
                }
            })
        };
        // Pushes may have been missed while the link was down.
        let on_connect = channel.on_connect(move |_| {
            if let Some(reconciler) = weak.upgrade() {
                tokio::spawn(async move {
                    let _ = reconciler.refresh_now().await;
                });
            }
        });
        self.lock_subscriptions()
            .extend([on_message, on_update, on_connect]);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current(&self) -> u64 {
        self.value.borrow().count
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        *self.value.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<UnreadSnapshot> {
        self.value.subscribe()
    }

    pub fn apply_push(&self, counts: Option<&UnreadCounts>) {
        let Some(count) = counts.and_then(|counts| counts.get(&self.role)).copied() else {
            return;
        };
        debug!(role = %self.role, count, "unread: push update");
        self.set(count, UnreadSource::Push);
    }

    /// Pulls the authoritative count. Failures keep the previous value.
    pub async fn refresh_now(&self) -> Result<u64, GatewayError> {
        let request = ApiRequest::get(self.path.clone()).query("role", self.role.as_str());
        match self
            .gateway
            .execute_json::<UnreadCountResponse>(request)
            .await
        {
            Ok(response) => {
                self.set(response.unread_count, UnreadSource::Pull);
                Ok(response.unread_count)
            }
            Err(err) => {
                warn!(role = %self.role, error = %err, "unread: pull failed, keeping last value");
                Err(err)
            }
        }
    }

    pub fn stop(&self) {
        for subscription in self.lock_subscriptions().drain(..) {
            subscription.unsubscribe();
        }
        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            poller.abort();
        }
    }

    fn spawn_poller(self: &Arc<Self>, poll_interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(reconciler) = weak.upgrade() else {
                    return;
                };
                let _ = reconciler.refresh_now().await;
            }
        });
        let previous = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn set(&self, count: u64, source: UnreadSource) {
        self.value.send_replace(UnreadSnapshot { count, source });
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Unsubscribe>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for UnreadReconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use shared::{
    domain::{ConversationId, MessageId, Role, UserId},
    protocol::{ChatMessage, ClientFrame, ConversationUpdate, ServerEvent, UnreadCounts},
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use url::Url;

use crate::{
    error::ChannelError,
    session::Session,
    transport::{LinkEvent, RealtimeConnector, RealtimeLink},
};

#[derive(Serialize)]
struct TestClaims {
    user_id: i64,
    role: Role,
    exp: i64,
    jti: String,
}

pub fn mint_access_token(user_id: i64, role: Role, generation: &str) -> String {
    let claims = TestClaims {
        user_id,
        role,
        exp: chrono::Utc::now().timestamp() + 300,
        jti: generation.to_string(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"server-side-secret"),
    )
    .expect("encode token")
}

pub fn session_for(user_id: i64, role: Role, generation: &str) -> Session {
    Session::from_tokens(
        mint_access_token(user_id, role, generation),
        format!("refresh-{generation}"),
    )
    .expect("session from tokens")
}

pub fn chat_message(id: i64, conversation: &str, unread: &[(Role, u64)]) -> ServerEvent {
    ServerEvent::Message {
        message: ChatMessage {
            message_id: MessageId(id),
            conversation_id: ConversationId::new(conversation),
            sender_id: UserId(900),
            sender_role: Some(Role::Consultant),
            content: format!("message {id}"),
            sent_at: chrono::Utc::now(),
            client_message_id: None,
            unread_counts: counts(unread),
        },
    }
}

pub fn conversation_update(conversation: &str, unread: &[(Role, u64)]) -> ServerEvent {
    ServerEvent::ConversationUpdate {
        update: ConversationUpdate {
            conversation_id: ConversationId::new(conversation),
            last_message_preview: Some("preview".to_string()),
            last_message_at: Some(chrono::Utc::now()),
            unread_counts: counts(unread),
        },
    }
}

fn counts(unread: &[(Role, u64)]) -> Option<UnreadCounts> {
    if unread.is_empty() {
        return None;
    }
    Some(unread.iter().copied().collect())
}

pub async fn spawn_server(app: Router) -> anyhow::Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

/// Server end of an in-memory realtime link.
pub struct ServerEnd {
    pub access_token: String,
    pub frames: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl ServerEnd {
    pub fn push(&self, event: ServerEvent) {
        self.events
            .send(LinkEvent::Event(event))
            .expect("client end alive");
    }

    pub fn drop_link(self, reason: &str) {
        let _ = self
            .events
            .send(LinkEvent::Closed(ChannelError::Closed(reason.to_string())));
    }

    /// Takes every frame written so far and acknowledges each as flushed.
    pub fn drain_frames(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            let _ = self.events.send(LinkEvent::Flushed);
            frames.push(frame);
        }
        frames
    }
}

pub struct MemoryConnector {
    attempts: AtomicUsize,
    planned_failures: Mutex<VecDeque<ChannelError>>,
    accepted_tx: mpsc::UnboundedSender<ServerEnd>,
    accepted_rx: Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            planned_failures: Mutex::new(VecDeque::new()),
            accepted_tx,
            accepted_rx: Mutex::new(accepted_rx),
        })
    }

    pub async fn fail_next(&self, err: ChannelError) {
        self.planned_failures.lock().await.push_back(err);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn next_link(&self) -> ServerEnd {
        tokio::time::timeout(Duration::from_secs(2), async {
            self.accepted_rx.lock().await.recv().await
        })
        .await
        .expect("link accepted in time")
        .expect("connector alive")
    }
}

#[async_trait]
impl RealtimeConnector for MemoryConnector {
    async fn connect(&self, _url: &Url, access_token: &str) -> Result<RealtimeLink, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.planned_failures.lock().await.pop_front() {
            return Err(err);
        }
        let (outbound, frames) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        let _ = self.accepted_tx.send(ServerEnd {
            access_token: access_token.to_string(),
            frames,
            events,
        });
        Ok(RealtimeLink { outbound, inbound })
    }
}

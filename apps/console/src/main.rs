use anyhow::{Context, Result};
use clap::Parser;
use session_core::{load_settings, DisconnectReason, SessionContext};
use shared::domain::ConversationId;
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long, env = "ESG_PASSWORD")]
    password: String,
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long, requires = "conversation")]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }

    let context = SessionContext::new(settings)?;
    let session = context
        .login(&args.username, &args.password)
        .await
        .context("login failed")?;
    println!("Logged in as user_id={} role={}", session.user_id, session.role);

    let channel = context.channel();
    let _messages = channel.on_message(|message| {
        println!(
            "[{}] user {}: {}",
            message.conversation_id, message.sender_id, message.content
        );
    });
    let _drops = channel.on_disconnect(|event| {
        if let DisconnectReason::Transport(err) = &event.reason {
            println!("Connection lost ({err}); reconnecting={}", event.will_reconnect);
        }
    });

    let conversation = args.conversation.map(ConversationId::new);
    // Rooms are not restored by the channel after a reconnect.
    let _rejoin = conversation.clone().map(|conversation| {
        let rejoin_channel = std::sync::Arc::downgrade(channel);
        channel.on_connect(move |event| {
            if !event.reconnected {
                return;
            }
            if let Some(channel) = rejoin_channel.upgrade() {
                if let Err(err) = channel.join_conversation(&conversation) {
                    warn!(error = %err, "console: rejoin failed");
                }
            }
        })
    });

    channel.connect().await.context("realtime connect failed")?;
    if let Some(conversation) = &conversation {
        channel.join_conversation(conversation)?;
        if let Some(content) = &args.message {
            let client_message_id = channel.send_message(conversation, content.as_str())?;
            println!("Sent message client_message_id={client_message_id}");
        }
    }

    if let Some(unread) = context.start_unread(None) {
        let mut badge = unread.watch();
        tokio::spawn(async move {
            while badge.changed().await.is_ok() {
                let snapshot = *badge.borrow_and_update();
                println!("Unread: {} ({:?})", snapshot.count, snapshot.source);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    context.logout().await;
    Ok(())
}

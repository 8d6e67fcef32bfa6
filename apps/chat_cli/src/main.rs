use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    load_config, AttachmentUpload, ChatDependencies, ConversationSession, ConversationTarget,
    OutgoingDraft, SendOutcome, SessionEvent, StaticTokenProvider,
};
use shared::domain::{ConversationId, PartyId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Terminal chat over an existing or new conversation.
///
/// Lines typed on stdin are sent as messages. `/attach <path> [text]` sends a
/// file, `/older` loads the previous history page.
#[derive(Parser, Debug)]
struct Args {
    /// TOML config file (defaults to ./chat.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    hub_url: Option<String>,
    /// Bearer token; falls back to CHAT_ACCESS_TOKEN
    #[arg(long, env = "CHAT_ACCESS_TOKEN")]
    token: String,
    #[arg(long, conflicts_with = "participant")]
    conversation: Option<String>,
    /// Opens (or creates) the conversation with this user
    #[arg(long)]
    participant: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(api_url) = args.api_url {
        config.api_base_url = api_url;
    }
    if let Some(hub_url) = args.hub_url {
        config.hub_url = hub_url;
    }

    let target = match (args.conversation, args.participant) {
        (Some(id), _) => ConversationTarget::Existing(ConversationId::new(id)),
        (None, Some(participant)) => ConversationTarget::WithParticipant(PartyId::new(participant)),
        (None, None) => bail!("pass --conversation or --participant"),
    };

    let auth = Arc::new(StaticTokenProvider::new(args.token));
    let deps = ChatDependencies::from_config(&config, auth);
    let session = ConversationSession::open(&config, deps, target).await?;
    info!(
        conversation_id = %session.conversation_id(),
        state = ?session.connection_state().await,
        "chat_cli: conversation open"
    );

    for message in session.messages().await {
        print_message(&message);
    }

    let printer = tokio::spawn(print_events(session.subscribe()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(rest) = line.strip_prefix("/older") {
            if !rest.trim().is_empty() {
                warn!("chat_cli: /older takes no arguments");
                continue;
            }
            match session.load_older().await {
                Ok(0) => println!("-- no older messages"),
                Ok(_) => {
                    for message in session.messages().await {
                        print_message(&message);
                    }
                }
                Err(err) => warn!("chat_cli: failed to load older messages: {err:#}"),
            }
            continue;
        }

        session.input_changed().await;
        let draft = match line.strip_prefix("/attach ") {
            Some(rest) => match attachment_draft(rest).await {
                Ok(draft) => draft,
                Err(err) => {
                    warn!("chat_cli: {err:#}");
                    continue;
                }
            },
            None => OutgoingDraft::text(line),
        };
        if let SendOutcome::Dispatched { path, .. } = session.send(draft).await {
            info!(?path, "chat_cli: message dispatched");
        }
    }

    session.close().await;
    printer.abort();
    Ok(())
}

async fn attachment_draft(rest: &str) -> Result<OutgoingDraft> {
    let (path, text) = match rest.trim().split_once(' ') {
        Some((path, text)) => (path, Some(text.to_string())),
        None => (rest.trim(), None),
    };
    let path = PathBuf::from(path);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read attachment '{}'", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("attachment path has no file name")?
        .to_string();
    let mime_type = match path.extension().and_then(|ext| ext.to_str()) {
        Some("jpg" | "jpeg") => Some("image/jpeg".to_string()),
        Some("png") => Some("image/png".to_string()),
        Some("gif") => Some("image/gif".to_string()),
        Some("webp") => Some("image/webp".to_string()),
        _ => None,
    };
    Ok(OutgoingDraft {
        text,
        attachments: vec![AttachmentUpload {
            filename,
            mime_type,
            bytes,
        }],
    })
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ProvisionalInserted(message)) => print_message(&message),
            Ok(SessionEvent::MessageMerged { message, .. }) => print_message(&message),
            Ok(SessionEvent::PeerTyping(true)) => println!("-- typing..."),
            Ok(SessionEvent::PeerTyping(false)) => {}
            Ok(SessionEvent::ConnectionDegraded { reason }) => {
                println!("-- live updates unavailable: {reason}");
            }
            Ok(SessionEvent::Error(message)) => println!("-- error: {message}"),
            Ok(SessionEvent::HistoryLoaded { .. } | SessionEvent::ScrollToLatest) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "chat_cli: dropped session events"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_message(message: &shared::protocol::ChatMessage) {
    let marker = if message.provisional { "…" } else { " " };
    let text = message.text.as_deref().unwrap_or_default();
    if message.image_refs.is_empty() {
        println!(
            "{marker} [{}] {}: {text}",
            message.created_at.format("%H:%M"),
            message.sender_id
        );
    } else {
        println!(
            "{marker} [{}] {}: {text} ({} image(s))",
            message.created_at.format("%H:%M"),
            message.sender_id,
            message.attachment_count()
        );
    }
}

use super::*;

use axum::{
    extract::{
        ws::{Message as HubMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use shared::{
    domain::{MessageId, PartyId},
    protocol::ChatMessage,
};
use tokio::net::TcpListener;

use crate::auth::StaticTokenProvider;

#[derive(Clone, Default)]
struct HubState {
    connections: Arc<Mutex<u32>>,
    joins: Arc<Mutex<Vec<(u32, String)>>>,
    tokens: Arc<Mutex<Vec<String>>>,
    drop_first_connection_after_join: bool,
}

fn hub_message(conversation_id: &ConversationId, id: &str, text: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        conversation_id: conversation_id.clone(),
        sender_id: PartyId::from("me"),
        text: Some(text.to_string()),
        image_refs: Vec::new(),
        created_at: Utc::now(),
        provisional: false,
    }
}

async fn send_frame(socket: &mut WebSocket, frame: ServerFrame) {
    let text = serde_json::to_string(&frame).expect("encode frame");
    let _ = socket.send(HubMessage::Text(text)).await;
}

fn completion(invocation_id: u64) -> ServerFrame {
    ServerFrame::Completion {
        invocation_id,
        result: None,
        error: None,
    }
}

async fn hub_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<HubState>,
) -> impl IntoResponse {
    state
        .tokens
        .lock()
        .await
        .push(query.get("access_token").cloned().unwrap_or_default());
    ws.on_upgrade(move |socket| serve_hub_socket(socket, state))
}

async fn serve_hub_socket(mut socket: WebSocket, state: HubState) {
    let connection = {
        let mut connections = state.connections.lock().await;
        *connections += 1;
        *connections
    };

    while let Some(Ok(message)) = socket.recv().await {
        let HubMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        match frame.invocation {
            HubInvocation::JoinConversation { conversation_id } => {
                state
                    .joins
                    .lock()
                    .await
                    .push((connection, conversation_id.0.clone()));
                send_frame(&mut socket, completion(frame.invocation_id)).await;
                if connection == 1 && state.drop_first_connection_after_join {
                    let _ = socket.send(HubMessage::Close(None)).await;
                    return;
                }
                if connection > 1 {
                    let message = hub_message(&conversation_id, "after-reconnect", "still here");
                    send_frame(
                        &mut socket,
                        ServerFrame::Event(HubEvent::MessageReceived { message }),
                    )
                    .await;
                }
            }
            HubInvocation::SendMessage {
                conversation_id,
                text,
            } => {
                let message = hub_message(&conversation_id, "srv-1", &text);
                send_frame(
                    &mut socket,
                    ServerFrame::Completion {
                        invocation_id: frame.invocation_id,
                        result: Some(serde_json::to_value(&message).expect("encode message")),
                        error: None,
                    },
                )
                .await;
                send_frame(
                    &mut socket,
                    ServerFrame::Event(HubEvent::MessageReceived { message }),
                )
                .await;
            }
            HubInvocation::LeaveConversation { .. } => {
                send_frame(
                    &mut socket,
                    ServerFrame::Completion {
                        invocation_id: frame.invocation_id,
                        result: None,
                        error: Some(ApiError::new(ErrorCode::Forbidden, "not a member")),
                    },
                )
                .await;
            }
            HubInvocation::StartTyping { .. } | HubInvocation::StopTyping { .. } => {
                send_frame(&mut socket, completion(frame.invocation_id)).await;
            }
        }
    }
}

async fn spawn_hub(state: HubState) -> Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/hubs/chat", get(hub_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}/hubs/chat"))
}

#[tokio::test]
async fn send_message_completion_carries_authoritative_record() {
    let state = HubState::default();
    let hub_url = spawn_hub(state.clone()).await.expect("spawn hub");
    let channel = WsPushChannel::connect(
        &hub_url,
        Arc::new(StaticTokenProvider::new("hub-token")),
        vec![Duration::ZERO],
    )
    .await
    .expect("connect");
    let mut events = channel.subscribe();
    let conversation_id = ConversationId::from("c-1");

    channel
        .invoke(HubInvocation::JoinConversation {
            conversation_id: conversation_id.clone(),
        })
        .await
        .expect("join");
    let result = channel
        .invoke(HubInvocation::SendMessage {
            conversation_id: conversation_id.clone(),
            text: "hello".into(),
        })
        .await
        .expect("send")
        .expect("result payload");

    let confirmed: ChatMessage = serde_json::from_value(result).expect("decode result");
    assert_eq!(confirmed.text.as_deref(), Some("hello"));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("echo in time")
        .expect("echo");
    assert!(matches!(event, HubEvent::MessageReceived { message } if message.id == confirmed.id));
    assert_eq!(
        state.tokens.lock().await.clone(),
        vec!["hub-token".to_string()]
    );
}

#[tokio::test]
async fn reconnects_and_rejoins_without_caller_involvement() {
    let state = HubState {
        drop_first_connection_after_join: true,
        ..HubState::default()
    };
    let hub_url = spawn_hub(state.clone()).await.expect("spawn hub");
    let channel = WsPushChannel::connect(
        &hub_url,
        Arc::new(StaticTokenProvider::new("hub-token")),
        vec![Duration::ZERO, Duration::from_millis(50)],
    )
    .await
    .expect("connect");
    let mut events = channel.subscribe();

    channel
        .invoke(HubInvocation::JoinConversation {
            conversation_id: ConversationId::from("c-7"),
        })
        .await
        .expect("join");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event after reconnect")
        .expect("event");
    match event {
        HubEvent::MessageReceived { message } => {
            assert_eq!(message.id, MessageId::from("after-reconnect"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert_eq!(
        state.joins.lock().await.clone(),
        vec![(1, "c-7".to_string()), (2, "c-7".to_string())]
    );
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(state.tokens.lock().await.len(), 2);
}

#[tokio::test]
async fn rejected_invocation_reports_hub_error() {
    let hub_url = spawn_hub(HubState::default()).await.expect("spawn hub");
    let channel = WsPushChannel::connect(
        &hub_url,
        Arc::new(StaticTokenProvider::new("hub-token")),
        Vec::new(),
    )
    .await
    .expect("connect");

    let err = channel
        .invoke(HubInvocation::LeaveConversation {
            conversation_id: ConversationId::from("c-1"),
        })
        .await
        .expect_err("must fail");

    match err.downcast_ref::<ChatClientError>() {
        Some(ChatClientError::InvocationRejected { method, source }) => {
            assert_eq!(*method, "LeaveConversation");
            assert_eq!(source.code, ErrorCode::Forbidden);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn stop_disconnects_and_rejects_further_invocations() {
    let hub_url = spawn_hub(HubState::default()).await.expect("spawn hub");
    let channel = WsPushChannel::connect(
        &hub_url,
        Arc::new(StaticTokenProvider::new("hub-token")),
        vec![Duration::ZERO],
    )
    .await
    .expect("connect");
    let mut states = channel.state_changes();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    channel.stop().await;
    channel.stop().await;

    assert_eq!(channel.state(), ConnectionState::Disconnected);
    let err = channel
        .invoke(HubInvocation::StartTyping {
            conversation_id: ConversationId::from("c-1"),
        })
        .await
        .expect_err("must fail");
    assert!(matches!(
        err.downcast_ref::<ChatClientError>(),
        Some(ChatClientError::NotConnected)
    ));
}

#[tokio::test]
async fn connect_fails_when_hub_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let result = WsPushChannel::connect(
        &format!("ws://{addr}/hubs/chat"),
        Arc::new(StaticTokenProvider::new("hub-token")),
        vec![Duration::ZERO],
    )
    .await;

    assert!(result.is_err());
}

#[test]
fn hub_url_normalization_rewrites_http_schemes() {
    assert_eq!(
        normalize_hub_url("https://shop.example/hubs/chat")
            .expect("https")
            .as_str(),
        "wss://shop.example/hubs/chat"
    );
    assert_eq!(
        normalize_hub_url("http://127.0.0.1:5000/hubs/chat")
            .expect("http")
            .scheme(),
        "ws"
    );
    assert!(normalize_hub_url("ftp://shop.example/hub").is_err());
    assert!(normalize_hub_url("not a url").is_err());
}

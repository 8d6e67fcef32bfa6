use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{
    domain::{ConnectionState, ConversationId},
    error::{ApiError, ErrorCode},
    protocol::{ClientFrame, HubEvent, HubInvocation, ServerFrame},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{auth::AuthTokenProvider, error::ChatClientError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type InvocationResult = std::result::Result<Option<Value>, ApiError>;

const EVENT_BUFFER: usize = 256;
const STOP_GRACE: Duration = Duration::from_secs(1);

/// A started push-channel connection.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Calls a hub method and waits for its completion.
    async fn invoke(&self, invocation: HubInvocation) -> Result<Option<Value>>;
    fn subscribe(&self) -> broadcast::Receiver<HubEvent>;
    fn state(&self) -> ConnectionState;
    async fn stop(&self);
}

#[async_trait]
pub trait PushChannelFactory: Send + Sync {
    async fn connect(&self, auth: Arc<dyn AuthTokenProvider>) -> Result<Arc<dyn PushChannel>>;
}

pub struct WsPushChannelFactory {
    hub_url: String,
    reconnect_delays: Vec<Duration>,
}

impl WsPushChannelFactory {
    pub fn new(hub_url: impl Into<String>, reconnect_delays: Vec<Duration>) -> Self {
        Self {
            hub_url: hub_url.into(),
            reconnect_delays,
        }
    }
}

#[async_trait]
impl PushChannelFactory for WsPushChannelFactory {
    async fn connect(&self, auth: Arc<dyn AuthTokenProvider>) -> Result<Arc<dyn PushChannel>> {
        let channel =
            WsPushChannel::connect(&self.hub_url, auth, self.reconnect_delays.clone()).await?;
        Ok(channel)
    }
}

enum Outbound {
    Frame(ClientFrame),
    Close,
}

enum ReconnectOutcome {
    Resumed(WsStream),
    Stopped,
    Exhausted,
}

struct ChannelShared {
    hub_url: Url,
    auth: Arc<dyn AuthTokenProvider>,
    reconnect_delays: Vec<Duration>,
    events: broadcast::Sender<HubEvent>,
    state: watch::Sender<ConnectionState>,
    pending: Mutex<HashMap<u64, oneshot::Sender<InvocationResult>>>,
    joined: Mutex<HashSet<ConversationId>>,
    next_invocation_id: AtomicU64,
}

/// Websocket hub connection that reconnects on its own and re-joins every
/// conversation joined through it.
pub struct WsPushChannel {
    shared: Arc<ChannelShared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl WsPushChannel {
    pub async fn connect(
        hub_url: &str,
        auth: Arc<dyn AuthTokenProvider>,
        reconnect_delays: Vec<Duration>,
    ) -> Result<Arc<Self>> {
        let hub_url = normalize_hub_url(hub_url)?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(ChannelShared {
            hub_url,
            auth,
            reconnect_delays,
            events,
            state,
            pending: Mutex::new(HashMap::new()),
            joined: Mutex::new(HashSet::new()),
            next_invocation_id: AtomicU64::new(1),
        });

        let socket = match shared.open_socket().await {
            Ok(socket) => socket,
            Err(err) => {
                shared.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        shared.set_state(ConnectionState::Connected);
        info!(hub = %shared.hub_url, "push channel: connected");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(Arc::clone(&shared), socket, outbound_rx));
        Ok(Arc::new(Self {
            shared,
            outbound,
            driver: Mutex::new(Some(driver)),
        }))
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    async fn track_membership(&self, invocation: &HubInvocation) {
        let mut joined = self.shared.joined.lock().await;
        match invocation {
            HubInvocation::JoinConversation { conversation_id } => {
                joined.insert(conversation_id.clone());
            }
            HubInvocation::LeaveConversation { conversation_id } => {
                joined.remove(conversation_id);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn invoke(&self, invocation: HubInvocation) -> Result<Option<Value>> {
        let method = invocation.method_name();
        if self.state() != ConnectionState::Connected {
            return Err(ChatClientError::NotConnected.into());
        }

        // Recorded before sending so a reconnect racing the completion still
        // replays the join.
        self.track_membership(&invocation).await;
        let join_target = match &invocation {
            HubInvocation::JoinConversation { conversation_id } => Some(conversation_id.clone()),
            _ => None,
        };

        let invocation_id = self.shared.next_invocation_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(invocation_id, tx);
        let frame = ClientFrame {
            invocation_id,
            invocation,
        };
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            self.shared.pending.lock().await.remove(&invocation_id);
            return Err(ChatClientError::NotConnected.into());
        }

        let outcome = match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(source)) => Err(ChatClientError::InvocationRejected { method, source }),
            Err(_) => Err(ChatClientError::ConnectionLost { method }),
        };
        if let (Err(ChatClientError::InvocationRejected { .. }), Some(conversation_id)) =
            (&outcome, join_target)
        {
            self.shared.joined.lock().await.remove(&conversation_id);
        }
        Ok(outcome?)
    }

    fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.shared.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    async fn stop(&self) {
        let _ = self.outbound.send(Outbound::Close);
        let driver = self.driver.lock().await.take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(STOP_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl ChannelShared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn open_socket(&self) -> Result<WsStream> {
        let token = self
            .auth
            .access_token()
            .await
            .context("failed to obtain access token for push channel")?;
        let mut url = self.hub_url.clone();
        url.query_pairs_mut().append_pair("access_token", &token);
        let (socket, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect push channel: {}", self.hub_url))?;
        Ok(socket)
    }

    async fn replay_joins(&self, socket: &mut WsStream) -> Result<()> {
        let joined: Vec<ConversationId> = self.joined.lock().await.iter().cloned().collect();
        for conversation_id in joined {
            let frame = ClientFrame {
                invocation_id: self.next_invocation_id.fetch_add(1, Ordering::Relaxed),
                invocation: HubInvocation::JoinConversation {
                    conversation_id: conversation_id.clone(),
                },
            };
            socket
                .send(Message::Text(serde_json::to_string(&frame)?))
                .await
                .with_context(|| format!("failed to re-join conversation {conversation_id}"))?;
            debug!(conversation_id = %conversation_id, "push channel: re-joined after reconnect");
        }
        Ok(())
    }

    async fn complete(&self, invocation_id: u64, result: InvocationResult) {
        if let Some(tx) = self.pending.lock().await.remove(&invocation_id) {
            let _ = tx.send(result);
        }
    }

    async fn fail_pending(&self) {
        // Dropping the senders resolves each waiter with `ConnectionLost`.
        self.pending.lock().await.clear();
    }

    async fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::Completion {
                invocation_id,
                result,
                error,
            }) => {
                let outcome = match error {
                    Some(error) => Err(error),
                    None => Ok(result),
                };
                self.complete(invocation_id, outcome).await;
            }
            Ok(ServerFrame::Event(event)) => {
                let _ = self.events.send(event);
            }
            Err(err) => warn!("push channel: ignoring invalid server frame: {err}"),
        }
    }
}

async fn drive(
    shared: Arc<ChannelShared>,
    mut socket: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        let stopped = pump(&shared, socket, &mut outbound).await;
        shared.fail_pending().await;
        if stopped {
            shared.set_state(ConnectionState::Disconnected);
            info!(hub = %shared.hub_url, "push channel: closed");
            return;
        }

        shared.set_state(ConnectionState::Reconnecting);
        warn!(hub = %shared.hub_url, "push channel: connection lost, reconnecting");
        match reconnect(&shared, &mut outbound).await {
            ReconnectOutcome::Resumed(next) => socket = next,
            ReconnectOutcome::Stopped => {
                shared.set_state(ConnectionState::Disconnected);
                info!(hub = %shared.hub_url, "push channel: closed while reconnecting");
                return;
            }
            ReconnectOutcome::Exhausted => {
                shared.set_state(ConnectionState::Disconnected);
                warn!(
                    hub = %shared.hub_url,
                    attempts = shared.reconnect_delays.len(),
                    "push channel: giving up after reconnect attempts"
                );
                return;
            }
        }
    }
}

/// Moves frames until the socket drops or the owner asks to close. Returns
/// `true` for an owner-requested close.
async fn pump(
    shared: &ChannelShared,
    socket: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> bool {
    let (mut writer, mut reader) = socket.split();
    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    let invocation_id = frame.invocation_id;
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            shared
                                .complete(
                                    invocation_id,
                                    Err(ApiError::new(ErrorCode::Validation, err.to_string())),
                                )
                                .await;
                            continue;
                        }
                    };
                    if let Err(err) = writer.send(Message::Text(text)).await {
                        warn!("push channel: send failed: {err}");
                        return false;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = writer.send(Message::Close(None)).await;
                    return true;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text).await,
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("push channel: receive failed: {err}");
                    return false;
                }
            },
        }
    }
}

async fn reconnect(
    shared: &ChannelShared,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> ReconnectOutcome {
    for (attempt, delay) in shared.reconnect_delays.iter().enumerate() {
        let sleep = tokio::time::sleep(*delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = outbound.recv() => match command {
                    Some(Outbound::Frame(frame)) => {
                        shared
                            .complete(
                                frame.invocation_id,
                                Err(ApiError::new(ErrorCode::Internal, "push channel reconnecting")),
                            )
                            .await;
                    }
                    Some(Outbound::Close) | None => return ReconnectOutcome::Stopped,
                },
            }
        }

        match shared.open_socket().await {
            Ok(mut socket) => {
                if let Err(err) = shared.replay_joins(&mut socket).await {
                    warn!(attempt = attempt + 1, "push channel: re-join failed: {err:#}");
                    continue;
                }
                shared.set_state(ConnectionState::Connected);
                info!(
                    hub = %shared.hub_url,
                    attempt = attempt + 1,
                    "push channel: reconnected"
                );
                return ReconnectOutcome::Resumed(socket);
            }
            Err(err) => {
                warn!(attempt = attempt + 1, "push channel: reconnect failed: {err:#}");
            }
        }
    }
    ReconnectOutcome::Exhausted
}

fn normalize_hub_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let rewritten = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        raw.to_string()
    };
    let url = Url::parse(&rewritten).map_err(|err| ChatClientError::InvalidHubUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ChatClientError::InvalidHubUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        }
        .into());
    }
    Ok(url)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;

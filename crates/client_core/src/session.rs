use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ConnectionState, ConversationId, MessageId, PartyId},
    protocol::{ChatMessage, HubEvent, HubInvocation},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::{AttachmentUpload, ChatApi, HttpChatApi},
    auth::{decode_identity, AuthTokenProvider},
    config::ChatClientConfig,
    connection::{ConnectionManager, HubEventHandler},
    error::ChatClientError,
    store::{MergeOutcome, MessageStore},
    transport::{PushChannel, PushChannelFactory, WsPushChannelFactory},
    typing::{TypingRelay, TypingSink},
};

const EVENT_BUFFER: usize = 256;
const LOCAL_ATTACHMENT_SCHEME: &str = "local://";

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct ChatDependencies {
    pub api: Arc<dyn ChatApi>,
    pub channels: Arc<dyn PushChannelFactory>,
    pub auth: Arc<dyn AuthTokenProvider>,
}

impl ChatDependencies {
    pub fn from_config(config: &ChatClientConfig, auth: Arc<dyn AuthTokenProvider>) -> Self {
        Self {
            api: Arc::new(HttpChatApi::new(
                config.api_base_url.clone(),
                Arc::clone(&auth),
            )),
            channels: Arc::new(WsPushChannelFactory::new(
                config.hub_url.clone(),
                config.reconnect_delays.clone(),
            )),
            auth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationTarget {
    Existing(ConversationId),
    /// Creates (or resumes) the conversation with this participant first.
    WithParticipant(PartyId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    HistoryLoaded { added: usize },
    ProvisionalInserted(ChatMessage),
    MessageMerged {
        message: ChatMessage,
        outcome: MergeOutcome,
    },
    ScrollToLatest,
    PeerTyping(bool),
    ConnectionDegraded { reason: String },
    Error(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingDraft {
    pub text: Option<String>,
    pub attachments: Vec<AttachmentUpload>,
}

impl OutgoingDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentUpload) -> Self {
        self.attachments.push(attachment);
        self
    }

    fn trimmed_text(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }

    pub fn is_empty(&self) -> bool {
        self.trimmed_text().is_none() && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    Multipart,
    Realtime,
    Rest,
}

#[derive(Debug)]
pub enum SendOutcome {
    /// Nothing to send; no record inserted and no request made.
    Rejected,
    Dispatched {
        provisional_id: MessageId,
        path: DeliveryPath,
        /// Background delivery; awaiting it is optional.
        task: JoinHandle<()>,
    },
}

enum Route {
    Multipart(Vec<AttachmentUpload>),
    Realtime(Arc<dyn PushChannel>),
    Rest,
}

struct SessionShared {
    conversation_id: ConversationId,
    own_party: Option<PartyId>,
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
    store: Mutex<MessageStore>,
    events: broadcast::Sender<SessionEvent>,
    next_page: Mutex<u32>,
    page_size: u32,
    closed: AtomicBool,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn merge(&self, message: ChatMessage) -> Option<MergeOutcome> {
        if self.is_closed() {
            debug!(message_id = %message.id, "session: ignoring message after close");
            return None;
        }
        if message.conversation_id != self.conversation_id {
            debug!(
                conversation_id = %message.conversation_id,
                "session: ignoring message for another conversation"
            );
            return None;
        }

        let outcome = self
            .store
            .lock()
            .await
            .merge_authoritative(message.clone(), self.own_party.as_ref());
        if outcome != MergeOutcome::Duplicate {
            self.emit(SessionEvent::MessageMerged {
                message,
                outcome: outcome.clone(),
            });
            self.emit(SessionEvent::ScrollToLatest);
        }
        Some(outcome)
    }

    async fn deliver(&self, route: Route, text: Option<String>) {
        let result = match route {
            Route::Multipart(attachments) => self
                .api
                .post_message_with_files(&self.conversation_id, text.as_deref(), &attachments)
                .await
                .map(Some),
            Route::Realtime(channel) => channel
                .invoke(HubInvocation::SendMessage {
                    conversation_id: self.conversation_id.clone(),
                    text: text.unwrap_or_default(),
                })
                .await
                .and_then(|result| {
                    result
                        .map(serde_json::from_value::<ChatMessage>)
                        .transpose()
                        .map_err(|err| {
                            anyhow::Error::from(ChatClientError::UnexpectedResponse {
                                endpoint: "SendMessage".into(),
                                reason: err.to_string(),
                            })
                        })
                }),
            Route::Rest => self
                .api
                .post_message(&self.conversation_id, text.as_deref(), &[])
                .await
                .map(Some),
        };

        match result {
            Ok(Some(message)) => {
                self.merge(message).await;
            }
            Ok(None) => {
                debug!(
                    conversation_id = %self.conversation_id,
                    "session: send acknowledged, waiting for hub echo"
                );
            }
            Err(err) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    "session: message delivery failed: {err:#}"
                );
                if !self.is_closed() {
                    self.emit(SessionEvent::Error(format!("message delivery failed: {err:#}")));
                }
            }
        }
    }
}

/// Routes hub events into the session without keeping it alive.
struct InboundRelay {
    shared: Weak<SessionShared>,
    typing: Weak<TypingRelay>,
}

#[async_trait]
impl HubEventHandler for InboundRelay {
    async fn on_event(&self, event: HubEvent) {
        match event {
            HubEvent::MessageReceived { message } => {
                if let Some(shared) = self.shared.upgrade() {
                    shared.merge(message).await;
                }
            }
            HubEvent::UserTyping {
                conversation_id,
                user_id,
            } => {
                if let Some(typing) = self.typing.upgrade() {
                    typing.peer_signal(&conversation_id, &user_id, true).await;
                }
            }
            HubEvent::UserStoppedTyping {
                conversation_id,
                user_id,
            } => {
                if let Some(typing) = self.typing.upgrade() {
                    typing.peer_signal(&conversation_id, &user_id, false).await;
                }
            }
        }
    }
}

/// Sends typing signals over the live channel, or through REST without one.
struct SessionTypingSink {
    conversation_id: ConversationId,
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
}

impl SessionTypingSink {
    async fn signal(&self, typing: bool) {
        let result = match self.connection.live_channel().await {
            Some(channel) => {
                let conversation_id = self.conversation_id.clone();
                let invocation = if typing {
                    HubInvocation::StartTyping { conversation_id }
                } else {
                    HubInvocation::StopTyping { conversation_id }
                };
                channel.invoke(invocation).await.map(|_| ())
            }
            None => self.api.send_typing(&self.conversation_id, typing).await,
        };
        if let Err(err) = result {
            debug!(
                conversation_id = %self.conversation_id,
                typing,
                "session: typing signal dropped: {err:#}"
            );
        }
    }
}

#[async_trait]
impl TypingSink for SessionTypingSink {
    async fn typing_started(&self) {
        self.signal(true).await;
    }

    async fn typing_stopped(&self) {
        self.signal(false).await;
    }
}

/// Live context of one open chat view.
pub struct ConversationSession {
    shared: Arc<SessionShared>,
    typing: Arc<TypingRelay>,
    poller: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Option<Duration>,
}

impl ConversationSession {
    /// Resolves the conversation, loads the newest page and connects the push
    /// channel. Only a failure to resolve the conversation is an error; the
    /// rest degrades and is reported through [`SessionEvent`]s and logs.
    pub async fn open(
        config: &ChatClientConfig,
        deps: ChatDependencies,
        target: ConversationTarget,
    ) -> Result<Self> {
        let conversation_id = match target {
            ConversationTarget::Existing(id) => id,
            ConversationTarget::WithParticipant(participant_id) => {
                deps.api
                    .create_conversation(&participant_id)
                    .await
                    .with_context(|| {
                        format!("failed to open conversation with {participant_id}")
                    })?
                    .id
            }
        };

        let own_party = match deps.auth.access_token().await {
            Ok(token) => decode_identity(&token),
            Err(err) => {
                warn!("session: no access token available: {err:#}");
                None
            }
        };
        if own_party.is_none() {
            warn!(
                conversation_id = %conversation_id,
                "session: could not decode own identity from token"
            );
        }

        let connection = Arc::new(ConnectionManager::new(
            Arc::clone(&deps.channels),
            Arc::clone(&deps.auth),
        ));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(SessionShared {
            conversation_id: conversation_id.clone(),
            own_party: own_party.clone(),
            api: Arc::clone(&deps.api),
            connection: Arc::clone(&connection),
            store: Mutex::new(MessageStore::new()),
            events: events.clone(),
            next_page: Mutex::new(1),
            page_size: config.page_size,
            closed: AtomicBool::new(false),
        });

        let typing = Arc::new(TypingRelay::new(
            conversation_id,
            own_party,
            Arc::new(SessionTypingSink {
                conversation_id: shared.conversation_id.clone(),
                api: Arc::clone(&deps.api),
                connection,
            }),
            config.typing_idle,
            config.peer_typing_timeout,
            Arc::new(move |typing: bool| {
                let _ = events.send(SessionEvent::PeerTyping(typing));
            }),
        ));

        let session = Self {
            shared,
            typing,
            poller: Mutex::new(None),
            poll_interval: config.poll_interval,
        };
        if let Err(err) = session.load_older().await {
            warn!(
                conversation_id = %session.shared.conversation_id,
                "session: initial history load failed: {err:#}"
            );
            session
                .shared
                .emit(SessionEvent::Error(format!("failed to load messages: {err:#}")));
        }
        session.connect().await;
        Ok(session)
    }

    async fn connect(&self) {
        let handler = Arc::new(InboundRelay {
            shared: Arc::downgrade(&self.shared),
            typing: Arc::downgrade(&self.typing),
        });
        match self
            .shared
            .connection
            .open(&self.shared.conversation_id, handler)
            .await
        {
            Ok(()) => info!(
                conversation_id = %self.shared.conversation_id,
                "session: live updates enabled"
            ),
            Err(err) => {
                warn!(
                    conversation_id = %self.shared.conversation_id,
                    "session: running without live updates: {err:#}"
                );
                self.shared.emit(SessionEvent::ConnectionDegraded {
                    reason: format!("{err:#}"),
                });
                self.start_polling().await;
            }
        }
    }

    async fn start_polling(&self) {
        let Some(interval) = self.poll_interval else {
            return;
        };
        let shared = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if shared.is_closed() {
                    break;
                }
                match shared
                    .api
                    .list_messages(&shared.conversation_id, 1, shared.page_size)
                    .await
                {
                    Ok(page) => {
                        for message in page {
                            shared.merge(message).await;
                        }
                    }
                    Err(err) => debug!(
                        conversation_id = %shared.conversation_id,
                        "session: poll failed: {err:#}"
                    ),
                }
            }
        });
        if let Some(previous) = self.poller.lock().await.replace(task) {
            previous.abort();
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.shared.conversation_id
    }

    pub fn own_party(&self) -> Option<&PartyId> {
        self.shared.own_party.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.shared.store.lock().await.messages().to_vec()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state().await
    }

    pub async fn is_peer_typing(&self) -> bool {
        self.typing.is_peer_typing().await
    }

    /// Forwards a composer change to the typing relay.
    pub async fn input_changed(&self) {
        if !self.shared.is_closed() {
            self.typing.input_changed().await;
        }
    }

    /// Inserts a provisional record right away and delivers in the background
    /// over exactly one path: multipart when files are attached, the live
    /// channel when connected, plain REST otherwise.
    pub async fn send(&self, draft: OutgoingDraft) -> SendOutcome {
        if draft.is_empty() || self.shared.is_closed() {
            debug!(
                conversation_id = %self.shared.conversation_id,
                "session: ignoring empty send"
            );
            return SendOutcome::Rejected;
        }

        let text = draft.trimmed_text();
        let provisional = ChatMessage {
            id: MessageId::provisional(),
            conversation_id: self.shared.conversation_id.clone(),
            sender_id: self
                .shared
                .own_party
                .clone()
                .unwrap_or_else(PartyId::unknown),
            text: text.clone(),
            image_refs: draft
                .attachments
                .iter()
                .map(|attachment| format!("{LOCAL_ATTACHMENT_SCHEME}{}", attachment.filename))
                .collect(),
            created_at: Utc::now(),
            provisional: true,
        };
        let provisional_id = provisional.id.clone();
        self.shared
            .store
            .lock()
            .await
            .insert_provisional(provisional.clone());
        self.shared
            .emit(SessionEvent::ProvisionalInserted(provisional));
        self.shared.emit(SessionEvent::ScrollToLatest);

        let route = if !draft.attachments.is_empty() {
            Route::Multipart(draft.attachments)
        } else if let Some(channel) = self.shared.connection.live_channel().await {
            Route::Realtime(channel)
        } else {
            Route::Rest
        };
        let path = match &route {
            Route::Multipart(_) => DeliveryPath::Multipart,
            Route::Realtime(_) => DeliveryPath::Realtime,
            Route::Rest => DeliveryPath::Rest,
        };
        debug!(
            conversation_id = %self.shared.conversation_id,
            provisional_id = %provisional_id,
            ?path,
            "session: dispatching message"
        );

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move { shared.deliver(route, text).await });
        SendOutcome::Dispatched {
            provisional_id,
            path,
            task,
        }
    }

    /// Fetches the next older page and puts it ahead of the loaded messages.
    /// Returns how many new records were added.
    pub async fn load_older(&self) -> Result<usize> {
        let mut next_page = self.shared.next_page.lock().await;
        let page = self
            .shared
            .api
            .list_messages(&self.shared.conversation_id, *next_page, self.shared.page_size)
            .await?;
        let fetched = page.len();
        let added = self.shared.store.lock().await.prepend_history(page);
        if fetched > 0 {
            *next_page += 1;
        }
        self.shared.emit(SessionEvent::HistoryLoaded { added });
        Ok(added)
    }

    /// Tears down listeners, timers and the connection. Safe to call twice.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(poller) = self.poller.lock().await.take() {
            poller.abort();
        }
        self.typing.shutdown().await;
        self.shared.connection.close().await;
        info!(conversation_id = %self.shared.conversation_id, "session: closed");
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Ok(mut poller) = self.poller.try_lock() {
            if let Some(task) = poller.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;

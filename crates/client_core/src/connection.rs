use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConnectionState, ConversationId},
    protocol::{HubEvent, HubInvocation},
};
use tokio::{
    sync::{broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    auth::AuthTokenProvider,
    transport::{PushChannel, PushChannelFactory},
};

/// Receives hub events in arrival order on the connection's listener task.
#[async_trait]
pub trait HubEventHandler: Send + Sync {
    async fn on_event(&self, event: HubEvent);
}

/// Live connection bound to one conversation.
struct ConnectionHandle {
    conversation_id: ConversationId,
    channel: Arc<dyn PushChannel>,
    listener: JoinHandle<()>,
}

/// Keeps at most one push-channel connection for the open conversation.
pub struct ConnectionManager {
    factory: Arc<dyn PushChannelFactory>,
    auth: Arc<dyn AuthTokenProvider>,
    handle: Mutex<Option<ConnectionHandle>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn PushChannelFactory>, auth: Arc<dyn AuthTokenProvider>) -> Self {
        Self {
            factory,
            auth,
            handle: Mutex::new(None),
        }
    }

    /// Connects, starts delivering hub events to `handler`, and joins the
    /// conversation. A previous handle is closed first.
    pub async fn open(
        &self,
        conversation_id: &ConversationId,
        handler: Arc<dyn HubEventHandler>,
    ) -> Result<()> {
        self.close().await;

        let channel = self
            .factory
            .connect(Arc::clone(&self.auth))
            .await
            .with_context(|| format!("push channel unavailable for {conversation_id}"))?;

        let mut events = channel.subscribe();
        let listener_conversation = conversation_id.clone();
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => handler.on_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            conversation_id = %listener_conversation,
                            skipped,
                            "connection: listener lagged behind hub events"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Err(err) = channel
            .invoke(HubInvocation::JoinConversation {
                conversation_id: conversation_id.clone(),
            })
            .await
        {
            listener.abort();
            channel.stop().await;
            return Err(err.context(format!("failed to join conversation {conversation_id}")));
        }

        info!(conversation_id = %conversation_id, "connection: joined conversation");
        *self.handle.lock().await = Some(ConnectionHandle {
            conversation_id: conversation_id.clone(),
            channel,
            listener,
        });
        Ok(())
    }

    /// Releases the handle: stop listening, leave (best effort), disconnect.
    /// Safe to call repeatedly or when `open` never succeeded.
    pub async fn close(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };
        handle.listener.abort();
        if let Err(err) = handle
            .channel
            .invoke(HubInvocation::LeaveConversation {
                conversation_id: handle.conversation_id.clone(),
            })
            .await
        {
            debug!(
                conversation_id = %handle.conversation_id,
                "connection: leave failed during close: {err:#}"
            );
        }
        handle.channel.stop().await;
        info!(conversation_id = %handle.conversation_id, "connection: closed");
    }

    /// The channel, but only while it is connected.
    pub async fn live_channel(&self) -> Option<Arc<dyn PushChannel>> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref()?;
        (handle.channel.state() == ConnectionState::Connected).then(|| Arc::clone(&handle.channel))
    }

    pub async fn state(&self) -> ConnectionState {
        match self.handle.lock().await.as_ref() {
            Some(handle) => handle.channel.state(),
            None => ConnectionState::Disconnected,
        }
    }
}

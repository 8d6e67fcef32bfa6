use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::domain::{ConversationId, PartyId};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::debug;

/// Outbound side of the typing indicator.
#[async_trait]
pub trait TypingSink: Send + Sync {
    async fn typing_started(&self);
    async fn typing_stopped(&self);
}

pub type PeerTypingCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// One-shot delayed task; restarting or dropping it cancels the pending run.
#[derive(Default)]
pub struct CancellableTimer {
    task: Option<JoinHandle<()>>,
}

impl CancellableTimer {
    pub fn restart<F>(&mut self, delay: Duration, on_elapsed: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_elapsed.await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Default)]
struct RelayState {
    idle_timer: CancellableTimer,
    peer_timer: CancellableTimer,
    peer_typing: bool,
}

pub struct TypingRelay {
    conversation_id: ConversationId,
    own_party: Option<PartyId>,
    sink: Arc<dyn TypingSink>,
    idle_delay: Duration,
    peer_timeout: Duration,
    on_peer_typing: PeerTypingCallback,
    state: Arc<Mutex<RelayState>>,
}

impl TypingRelay {
    pub fn new(
        conversation_id: ConversationId,
        own_party: Option<PartyId>,
        sink: Arc<dyn TypingSink>,
        idle_delay: Duration,
        peer_timeout: Duration,
        on_peer_typing: PeerTypingCallback,
    ) -> Self {
        Self {
            conversation_id,
            own_party,
            sink,
            idle_delay,
            peer_timeout,
            on_peer_typing,
            state: Arc::new(Mutex::new(RelayState::default())),
        }
    }

    /// Local composer changed: announce typing and push back the idle stop.
    pub async fn input_changed(&self) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move { sink.typing_started().await });

        let sink = Arc::clone(&self.sink);
        self.state
            .lock()
            .await
            .idle_timer
            .restart(self.idle_delay, async move { sink.typing_stopped().await });
    }

    /// Applies a typing signal from the hub. Returns `false` when the signal
    /// was ignored (own echo or another conversation).
    pub async fn peer_signal(
        &self,
        conversation_id: &ConversationId,
        sender: &PartyId,
        started: bool,
    ) -> bool {
        if conversation_id != &self.conversation_id || self.own_party.as_ref() == Some(sender) {
            debug!(
                conversation_id = %conversation_id,
                sender = %sender,
                "typing: ignoring signal"
            );
            return false;
        }

        let mut state = self.state.lock().await;
        if !started {
            state.peer_timer.cancel();
            if std::mem::replace(&mut state.peer_typing, false) {
                (self.on_peer_typing)(false);
            }
            return true;
        }

        let was_typing = std::mem::replace(&mut state.peer_typing, true);
        let shared = Arc::clone(&self.state);
        let notify = Arc::clone(&self.on_peer_typing);
        state.peer_timer.restart(self.peer_timeout, async move {
            let mut state = shared.lock().await;
            if std::mem::replace(&mut state.peer_typing, false) {
                drop(state);
                notify(false);
            }
        });
        if !was_typing {
            (self.on_peer_typing)(true);
        }
        true
    }

    pub async fn is_peer_typing(&self) -> bool {
        self.state.lock().await.peer_typing
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.idle_timer.cancel();
        state.peer_timer.cancel();
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;

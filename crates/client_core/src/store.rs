use std::collections::HashSet;

use shared::{
    domain::{MessageId, PartyId},
    protocol::ChatMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A record with this id is already present; nothing changed.
    Duplicate,
    /// No provisional record matched; the message was appended as new.
    Appended,
    /// The matching provisional record was removed and the message appended.
    Reconciled { replaced: MessageId },
}

/// Ordered messages of one open conversation.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn latest(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn provisional_count(&self) -> usize {
        self.messages.iter().filter(|m| m.provisional).count()
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|message| &message.id == id)
    }

    pub fn insert_provisional(&mut self, message: ChatMessage) {
        debug_assert!(message.provisional);
        self.messages.push(message);
    }

    /// Merges a server-confirmed message.
    ///
    /// The first provisional record whose text equals the message's text, or
    /// whose attachment count equals its non-zero attachment count, is treated
    /// as the local copy of this message and dropped. Matching is content
    /// based, so two quick sends with identical text may pair up crosswise.
    /// When `own_party` is known, messages from other senders never replace a
    /// provisional record.
    pub fn merge_authoritative(
        &mut self,
        mut message: ChatMessage,
        own_party: Option<&PartyId>,
    ) -> MergeOutcome {
        if self.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }
        message.provisional = false;

        let from_self = own_party.map_or(true, |own| own == &message.sender_id);
        let matched = if from_self {
            self.messages
                .iter()
                .position(|candidate| is_local_copy_of(candidate, &message))
        } else {
            None
        };

        let outcome = match matched {
            Some(index) => {
                let removed = self.messages.remove(index);
                MergeOutcome::Reconciled {
                    replaced: removed.id,
                }
            }
            None => MergeOutcome::Appended,
        };
        self.messages.push(message);
        outcome
    }

    /// Replaces the contents with a freshly loaded page, dropping duplicate ids.
    pub fn replace_all(&mut self, records: Vec<ChatMessage>) {
        let mut seen = HashSet::new();
        self.messages = records
            .into_iter()
            .filter(|record| seen.insert(record.id.clone()))
            .collect();
    }

    /// Inserts an older page ahead of the current records. Returns how many
    /// records were actually added.
    pub fn prepend_history(&mut self, page: Vec<ChatMessage>) -> usize {
        let mut seen: HashSet<MessageId> = self.messages.iter().map(|m| m.id.clone()).collect();
        let older: Vec<ChatMessage> = page
            .into_iter()
            .filter(|record| seen.insert(record.id.clone()))
            .collect();
        let added = older.len();
        self.messages.splice(0..0, older);
        added
    }
}

fn is_local_copy_of(candidate: &ChatMessage, confirmed: &ChatMessage) -> bool {
    if !candidate.provisional {
        return false;
    }
    let text_matches = match (candidate.text.as_deref(), confirmed.text.as_deref()) {
        (Some(local), Some(remote)) => !local.is_empty() && local == remote,
        _ => false,
    };
    let attachments_match = confirmed.attachment_count() > 0
        && candidate.attachment_count() == confirmed.attachment_count();
    text_matches || attachments_match
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;

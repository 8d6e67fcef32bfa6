pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod store;
pub mod transport;
pub mod typing;

pub use api::{AttachmentUpload, ChatApi, HttpChatApi};
pub use auth::{decode_identity, AuthTokenProvider, StaticTokenProvider};
pub use config::{load_config, ChatClientConfig, DEFAULT_CONFIG_FILE};
pub use connection::{ConnectionManager, HubEventHandler};
pub use error::ChatClientError;
pub use session::{
    ChatDependencies, ConversationSession, ConversationTarget, DeliveryPath, OutgoingDraft,
    SendOutcome, SessionEvent,
};
pub use store::{MergeOutcome, MessageStore};
pub use transport::{PushChannel, PushChannelFactory, WsPushChannel, WsPushChannelFactory};
pub use typing::{CancellableTimer, TypingRelay, TypingSink};

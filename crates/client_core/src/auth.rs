use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::Value;
use shared::domain::PartyId;
use tokio::sync::RwLock;

/// Claim URI that ASP.NET-style issuers use for the user id.
const NAME_IDENTIFIER_CLAIM: &str =
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/nameidentifier";
const IDENTITY_CLAIMS: [&str; 3] = [NAME_IDENTIFIER_CLAIM, "nameid", "sub"];

/// Source of the bearer token shared by the REST client and the push channel.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
    /// Called once after a `401`; returns the token to retry with.
    async fn refresh(&self) -> Result<String>;
}

pub struct StaticTokenProvider {
    token: RwLock<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(token.into()),
        }
    }

    pub async fn replace(&self, token: impl Into<String>) {
        *self.token.write().await = token.into();
    }
}

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.read().await.clone())
    }

    async fn refresh(&self) -> Result<String> {
        self.access_token().await
    }
}

/// Reads the caller's party id out of a JWT payload.
///
/// This only parses the token. The signature is not checked here; the server
/// is the party that trusts or rejects the token.
pub fn decode_identity(token: &str) -> Option<PartyId> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;

    IDENTITY_CLAIMS.iter().find_map(|claim| {
        match claims.get(*claim)? {
            Value::String(value) if !value.is_empty() => Some(PartyId::new(value.clone())),
            Value::Number(value) => Some(PartyId::new(value.to_string())),
            _ => None,
        }
    })
}

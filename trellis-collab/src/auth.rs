//! Connection authentication.
//!
//! The gateway only needs one thing from an identity service: turn a bearer
//! token into a `UserIdentity`. `StaticTokenProvider` serves the token table
//! from the config file; other deployments plug in their own provider.

use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::TokenEntry;
use crate::model::UserIdentity;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `None` means the token is not accepted.
    async fn authenticate(&self, token: &str) -> Option<UserIdentity>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    tokens: HashMap<String, UserIdentity>,
}

impl StaticTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[TokenEntry]) -> Self {
        let tokens = entries
            .iter()
            .map(|e| (e.token.clone(), e.identity()))
            .collect();
        Self { tokens }
    }

    pub fn with(mut self, token: impl Into<String>, identity: UserIdentity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn authenticate(&self, token: &str) -> Option<UserIdentity> {
        self.tokens.get(token).cloned()
    }
}

/// Diagram id from a request path of the form `/diagrams/<uuid>`.
pub fn diagram_from_path(path: &str) -> Option<Uuid> {
    let rest = path.strip_prefix("/diagrams/")?;
    let id = rest.trim_end_matches('/');
    if id.contains('/') {
        return None;
    }
    Uuid::parse_str(id).ok()
}

/// Bearer token from the `token` query parameter, falling back to an
/// `Authorization: Bearer` header.
pub fn extract_token(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    let from_query = query.and_then(|q| {
        q.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token" && !value.is_empty()).then(|| value.to_string())
        })
    });

    from_query.or_else(|| {
        authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}

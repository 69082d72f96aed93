//! Bearer token lifecycle for the remote mirror
//!
//! Tokens live only in memory. Validity is a pure comparison against the clock, so
//! checking it never touches the network.

use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::error::{MirrorError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Access token with its absolute expiry (epoch ms)
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    pub expiry: i64,
}

impl Token {
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.expiry > now_ms
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// What the identity provider hands back for a successful grant
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in_seconds: u64,
    /// Account identifier to pass back on the next silent attempt
    pub account_hint: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// May show a consent flow to the user.
    async fn grant_interactive(&self, hint: Option<&str>) -> Result<TokenGrant>;

    /// Must never show UI; fails when a grant cannot be completed silently.
    async fn grant_silent(&self, hint: Option<&str>) -> Result<TokenGrant>;
}

/// Caches the current token and account hint, and acquires new tokens on demand
pub struct TokenManager {
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    silent_timeout: Duration,
    interactive_timeout: Duration,
    cached: RwLock<Option<Token>>,
    account_hint: RwLock<Option<String>>,
}

impl TokenManager {
    pub fn new(identity: Arc<dyn IdentityProvider>, clock: Arc<dyn Clock>, config: &AuthConfig) -> Self {
        Self {
            identity,
            clock,
            silent_timeout: config.silent_timeout(),
            interactive_timeout: config.interactive_timeout(),
            cached: RwLock::new(None),
            account_hint: RwLock::new(None),
        }
    }

    /// Cached token if it has not expired yet
    pub fn valid_token(&self) -> Option<Token> {
        let now = self.clock.now_ms();
        self.cached
            .read()
            .as_ref()
            .filter(|t| t.is_valid_at(now))
            .cloned()
    }

    pub fn has_valid_token(&self) -> bool {
        self.valid_token().is_some()
    }

    pub fn account_hint(&self) -> Option<String> {
        self.account_hint.read().clone()
    }

    /// Return the cached token, or acquire a new one.
    ///
    /// A silent attempt is bounded by the silent timeout and fails rather than
    /// falling back to an interactive flow.
    pub async fn authorize(&self, interactive: bool) -> Result<Token> {
        if let Some(token) = self.valid_token() {
            debug!("Reusing cached token");
            return Ok(token);
        }

        let hint = self.account_hint();
        let limit = if interactive {
            self.interactive_timeout
        } else {
            self.silent_timeout
        };

        let attempt = if interactive {
            tokio::time::timeout(limit, self.identity.grant_interactive(hint.as_deref())).await
        } else {
            tokio::time::timeout(limit, self.identity.grant_silent(hint.as_deref())).await
        };

        let grant = match attempt {
            Ok(Ok(grant)) => grant,
            Ok(Err(e)) => {
                warn!("Token acquisition failed (interactive: {}): {}", interactive, e);
                return Err(MirrorError::TokenAcquisition {
                    interactive,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(
                    "Token acquisition timed out after {:?} (interactive: {})",
                    limit, interactive
                );
                return Err(MirrorError::TokenAcquisition {
                    interactive,
                    message: format!("timed out after {limit:?}"),
                });
            }
        };

        let expires_in_ms = i64::try_from(grant.expires_in_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        let token = Token {
            access_token: grant.access_token,
            expiry: self.clock.now_ms().saturating_add(expires_in_ms),
        };
        *self.cached.write() = Some(token.clone());
        if let Some(hint) = grant.account_hint {
            *self.account_hint.write() = Some(hint);
        }

        info!(
            "Authorized {} (expires in {}s)",
            if interactive { "interactively" } else { "silently" },
            grant.expires_in_seconds
        );
        Ok(token)
    }

    /// Forget the cached token, keeping the account hint for a silent retry.
    pub fn invalidate(&self) {
        if self.cached.write().take().is_some() {
            debug!("Cached token invalidated");
        }
    }

    /// Forget the token and the remembered account.
    pub fn disconnect(&self) {
        *self.cached.write() = None;
        *self.account_hint.write() = None;
        info!("Disconnected from remote mirror");
    }
}

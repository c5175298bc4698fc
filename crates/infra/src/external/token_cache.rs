//! Cached bearer token for a third-party API.
//!
//! The cache is an ordinary value owned by whoever builds the client; share it
//! with an `Arc`. Refreshes are serialized through an async mutex so a burst of
//! callers with a stale token triggers one fetch, not one per caller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Tokens are refreshed this long before they actually expire.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Token valid for `expires_in` from `now` (OAuth `expires_in` style).
    pub fn expiring_in(value: impl Into<String>, expires_in: Duration, now: DateTime<Utc>) -> Self {
        let expires_in = chrono::Duration::from_std(expires_in).unwrap_or(chrono::Duration::MAX);
        Self {
            value: value.into(),
            expires_at: now.checked_add_signed(expires_in).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Whether the token is still usable at `now`, keeping `skew` in reserve.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::MAX);
        match self.expires_at.checked_sub_signed(skew) {
            Some(refresh_at) => now < refresh_at,
            None => false,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(String),
    #[error("token endpoint returned an already expired token")]
    Expired,
}

/// Something that can mint a new access token (an OAuth client-credentials call, usually).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken, TokenError>;
}

#[derive(Debug)]
pub struct TokenCache {
    current: Mutex<Option<AccessToken>>,
    refresh_skew: Duration,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            refresh_skew: DEFAULT_REFRESH_SKEW,
        }
    }

    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    /// The cached token, or a freshly fetched one when it is missing or about to expire.
    ///
    /// A failed fetch leaves the previous token in place.
    pub async fn get<S>(&self, source: &S) -> Result<AccessToken, TokenError>
    where
        S: TokenSource + ?Sized,
    {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if token.is_fresh_at(Utc::now(), self.refresh_skew) {
                return Ok(token.clone());
            }
            debug!(expires_at = %token.expires_at, "access token stale; refreshing");
        }

        let token = source.fetch_token().await?;
        if token.expires_at <= Utc::now() {
            return Err(TokenError::Expired);
        }
        info!(expires_at = %token.expires_at, "fetched new access token");
        *current = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token so the next `get` fetches, e.g. after a 401.
    pub async fn invalidate(&self) {
        self.current.lock().await.take();
    }
}

//! Claude (Anthropic) refresh adapter.
//!
//! Per the open-question resolution, Claude token refresh stays
//! permanently disabled: the endpoint is speculative and unverified,
//! so this adapter never makes a network call and always returns
//! [`RefreshError::Unsupported`]. Callers (the pool, the daemon) treat
//! this as "skipped", not a failure worth counting against health.

use async_trait::async_trait;

use crate::error::RefreshError;
use crate::provider::Provider;

use super::{Refresher, TokenResponse};

#[derive(Default)]
pub struct ClaudeRefresher;

#[async_trait]
impl Refresher for ClaudeRefresher {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    async fn refresh(
        &self,
        _client: &reqwest::Client,
        _refresh_token: &str,
        _allowlist: &[String],
    ) -> Result<TokenResponse, RefreshError> {
        Err(RefreshError::Unsupported(Provider::Claude.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_is_always_unsupported() {
        let refresher = ClaudeRefresher;
        let client = reqwest::Client::new();
        let err = refresher.refresh(&client, "rt", &[]).await.unwrap_err();
        assert!(matches!(err, RefreshError::Unsupported(p) if p == "claude"));
    }
}

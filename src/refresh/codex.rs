//! Codex (OpenAI) refresh adapter.
//!
//! Grounded in `refresh_access_token` from the OpenAI OAuth flow: form-
//! encoded POST to the token endpoint, same response shape, same
//! error-body-first-then-status-text fallback.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::error::RefreshError;
use crate::provider::Provider;

use super::{allowlist::validate_token_endpoint, map_transport_error, Refresher, TokenResponse};

pub const DEFAULT_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

pub struct CodexRefresher {
    token_url: String,
}

impl Default for CodexRefresher {
    fn default() -> Self {
        Self { token_url: DEFAULT_TOKEN_URL.to_string() }
    }
}

impl CodexRefresher {
    #[cfg(test)]
    fn with_token_url(token_url: impl Into<String>) -> Self {
        Self { token_url: token_url.into() }
    }
}

#[async_trait]
impl Refresher for CodexRefresher {
    fn provider(&self) -> Provider {
        Provider::Codex
    }

    async fn refresh(
        &self,
        client: &reqwest::Client,
        refresh_token: &str,
        allowlist: &[String],
    ) -> Result<TokenResponse, RefreshError> {
        validate_token_endpoint(&self.token_url, allowlist)?;

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", CLIENT_ID),
        ];

        let response = client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RefreshError::HttpStatus(status.as_u16()));
        }

        let parsed: RawTokenResponse =
            serde_json::from_str(&body).map_err(|e| RefreshError::Decode(e.to_string()))?;

        Ok(TokenResponse {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: parsed.expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            token_type: parsed.token_type.or_else(|| Some("Bearer".to_string())),
            scope: parsed.scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn refresh_parses_success_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-token",
                "refresh_token": "new-refresh",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let refresher = CodexRefresher::with_token_url(format!("{}/token", server.uri()));
        let client = reqwest::Client::new();
        let allow = vec!["127.0.0.1".to_string()];
        let resp = refresher.refresh(&client, "old-refresh", &allow).await.unwrap();
        assert_eq!(resp.access_token, "new-token");
        assert_eq!(resp.refresh_token.as_deref(), Some("new-refresh"));
        assert!(resp.expires_at.is_some());
    }

    #[tokio::test]
    async fn refresh_surfaces_non_200_as_http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let refresher = CodexRefresher::with_token_url(format!("{}/token", server.uri()));
        let client = reqwest::Client::new();
        let err = refresher.refresh(&client, "bad", &[]).await.unwrap_err();
        assert!(matches!(err, RefreshError::HttpStatus(401)));
    }

    #[tokio::test]
    async fn refresh_rejects_non_allowlisted_endpoint_before_any_network_call() {
        let refresher = CodexRefresher::with_token_url("https://evil.example.com/token");
        let client = reqwest::Client::new();
        let err = refresher.refresh(&client, "r", &["openai.com".to_string()]).await.unwrap_err();
        assert!(matches!(err, RefreshError::EndpointNotAllowed(_)));
    }

    #[test]
    fn provider_is_codex() {
        assert_eq!(CodexRefresher::default().provider(), Provider::Codex);
    }
}

//! Gemini (Google) refresh adapter.
//!
//! Grounded in `refresh_access_token` from the Google OAuth flow: same
//! form fields, same error-body-first fallback, same optional
//! `id_token` passthrough (unused by refresh itself, kept only when
//! present so identity extraction still works after a refresh).

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::error::RefreshError;
use crate::provider::Provider;

use super::{allowlist::validate_token_endpoint, map_transport_error, Refresher, TokenResponse};

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

fn client_id() -> Result<String, RefreshError> {
    std::env::var("GEMINI_OAUTH_CLIENT_ID")
        .map_err(|_| RefreshError::MissingConfig("GEMINI_OAUTH_CLIENT_ID is not set".to_string()))
}

fn client_secret() -> Result<String, RefreshError> {
    std::env::var("GEMINI_OAUTH_CLIENT_SECRET")
        .map_err(|_| RefreshError::MissingConfig("GEMINI_OAUTH_CLIENT_SECRET is not set".to_string()))
}

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

pub struct GeminiRefresher {
    token_url: String,
}

impl Default for GeminiRefresher {
    fn default() -> Self {
        Self { token_url: DEFAULT_TOKEN_URL.to_string() }
    }
}

impl GeminiRefresher {
    #[cfg(test)]
    fn with_token_url(token_url: impl Into<String>) -> Self {
        Self { token_url: token_url.into() }
    }
}

#[async_trait]
impl Refresher for GeminiRefresher {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn refresh(
        &self,
        client: &reqwest::Client,
        refresh_token: &str,
        allowlist: &[String],
    ) -> Result<TokenResponse, RefreshError> {
        validate_token_endpoint(&self.token_url, allowlist)?;

        let client_id = client_id()?;
        let client_secret = client_secret()?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
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
                "access_token": "gtoken",
                "expires_in": 1800
            })))
            .mount(&server)
            .await;

        let refresher = GeminiRefresher::with_token_url(format!("{}/token", server.uri()));
        let client = reqwest::Client::new();
        let resp = refresher.refresh(&client, "rt", &[]).await.unwrap();
        assert_eq!(resp.access_token, "gtoken");
    }

    #[test]
    fn provider_is_gemini() {
        assert_eq!(GeminiRefresher::default().provider(), Provider::Gemini);
    }

    #[tokio::test]
    async fn refresh_errors_when_client_credentials_are_unset() {
        // SAFETY: tests in this module run single-threaded per-process
        // under the default test harness; no other test reads these vars.
        std::env::remove_var("GEMINI_OAUTH_CLIENT_ID");
        std::env::remove_var("GEMINI_OAUTH_CLIENT_SECRET");

        let refresher = GeminiRefresher::with_token_url("http://127.0.0.1:1/token");
        let client = reqwest::Client::new();
        let err = refresher.refresh(&client, "rt", &[]).await.unwrap_err();
        assert!(matches!(err, RefreshError::MissingConfig(_)));
    }
}

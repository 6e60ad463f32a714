//! Per-provider token-refresh adapters and the shared `UpdateAuthFile`
//! logic that writes a new token response back into a provider's
//! credential file without disturbing unknown keys.

pub mod allowlist;
pub mod claude;
pub mod codex;
pub mod gemini;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{CaamError, RefreshError, StorageError};
use crate::provider::Provider;
use crate::util::atomic_write;

pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

/// Per-provider refresh contract. Implementations own their token
/// endpoint URL and allowlist; `refresh` must call
/// [`allowlist::validate_token_endpoint`] before any network I/O.
#[async_trait]
pub trait Refresher: Send + Sync {
    fn provider(&self) -> Provider;

    async fn refresh(
        &self,
        client: &reqwest::Client,
        refresh_token: &str,
        allowlist: &[String],
    ) -> Result<TokenResponse, RefreshError>;
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REFRESH_TIMEOUT)
        .build()
        .expect("reqwest client builds with static config")
}

fn map_transport_error(e: reqwest::Error) -> RefreshError {
    if e.is_timeout() {
        RefreshError::Timeout
    } else {
        RefreshError::Network(e.to_string())
    }
}

/// What key style a provider's credential JSON uses, so a rewritten
/// field matches the surrounding file instead of introducing a mixed
/// style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyStyle {
    SnakeCase,
    CamelCase,
    ClaudeNested,
}

fn detect_key_style(raw: &Value) -> KeyStyle {
    if raw.get("claudeAiOauth").is_some() {
        return KeyStyle::ClaudeNested;
    }
    if raw.get("accessToken").is_some() || raw.get("refreshToken").is_some() {
        return KeyStyle::CamelCase;
    }
    KeyStyle::SnakeCase
}

/// Read the existing credential JSON at `path`, preserve every unknown
/// key, update the access/refresh/expiry fields in place using the
/// file's own key style, and write back atomically. If `resp` carries
/// no refresh token, the existing one is preserved. Expiry falls back
/// to leaving the field unchanged if `resp.expires_at` is `None`.
pub fn update_auth_file(path: &Path, resp: &TokenResponse) -> Result<(), CaamError> {
    let raw = std::fs::read_to_string(path).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
    let mut value: Value =
        serde_json::from_str(&raw).map_err(|e| CaamError::Storage(StorageError::Corrupted(path.to_path_buf(), e.to_string())))?;

    let style = detect_key_style(&value);
    let target = if style == KeyStyle::ClaudeNested {
        value
            .get_mut("claudeAiOauth")
            .and_then(Value::as_object_mut)
    } else {
        value.as_object_mut()
    };
    let Some(obj) = target else {
        return Err(CaamError::Storage(StorageError::Corrupted(
            path.to_path_buf(),
            "expected a JSON object".to_string(),
        )));
    };

    let (access_key, refresh_key, expiry_key, type_key) = match style {
        KeyStyle::SnakeCase => ("access_token", "refresh_token", "expires_at", "token_type"),
        KeyStyle::CamelCase | KeyStyle::ClaudeNested => {
            ("accessToken", "refreshToken", "expiresAt", "tokenType")
        }
    };

    obj.insert(access_key.to_string(), Value::String(resp.access_token.clone()));
    if let Some(refresh) = &resp.refresh_token {
        obj.insert(refresh_key.to_string(), Value::String(refresh.clone()));
    }
    if let Some(expires_at) = resp.expires_at {
        obj.insert(expiry_key.to_string(), Value::String(expires_at.to_rfc3339()));
    }
    if let Some(token_type) = &resp.token_type {
        obj.insert(type_key.to_string(), Value::String(token_type.clone()));
    }

    let body = serde_json::to_vec_pretty(&value)
        .map_err(|e| CaamError::Other(anyhow::anyhow!("encoding credential file: {e}")))?;
    atomic_write(path, &body, 0o600).map_err(|e| CaamError::Storage(StorageError::Io(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &tempfile::TempDir, name: &str, value: &Value) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, serde_json::to_string(value).unwrap()).unwrap();
        path
    }

    #[test]
    fn update_preserves_unknown_keys_snake_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "auth.json", &json!({
            "access_token": "old",
            "refresh_token": "r1",
            "weird_extra_field": 42
        }));

        update_auth_file(&path, &TokenResponse {
            access_token: "new".into(),
            refresh_token: None,
            expires_at: None,
            token_type: None,
            scope: None,
        }).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["access_token"], "new");
        assert_eq!(raw["refresh_token"], "r1");
        assert_eq!(raw["weird_extra_field"], 42);
    }

    #[test]
    fn update_preserves_claude_nested_style() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "creds.json", &json!({
            "claudeAiOauth": {
                "accessToken": "old",
                "email": "alice@example.com"
            }
        }));

        update_auth_file(&path, &TokenResponse {
            access_token: "new".into(),
            refresh_token: Some("r2".into()),
            expires_at: None,
            token_type: None,
            scope: None,
        }).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["claudeAiOauth"]["accessToken"], "new");
        assert_eq!(raw["claudeAiOauth"]["refreshToken"], "r2");
        assert_eq!(raw["claudeAiOauth"]["email"], "alice@example.com");
    }

    #[test]
    fn update_keeps_existing_refresh_token_when_response_has_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "auth.json", &json!({"access_token": "a", "refresh_token": "keep-me"}));
        update_auth_file(&path, &TokenResponse {
            access_token: "new".into(),
            refresh_token: None,
            expires_at: None,
            token_type: None,
            scope: None,
        }).unwrap();
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["refresh_token"], "keep-me");
    }
}

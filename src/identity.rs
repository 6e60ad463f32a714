//! Identity extraction: best-effort parsing of email/account-id out of
//! a provider's credential file. Never fails the overall flow — a
//! parse failure just means the profile has no identity metadata.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::Provider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: Option<String>,
    pub account_id: Option<String>,
}

impl Identity {
    fn is_empty(&self) -> bool {
        self.email.is_none() && self.account_id.is_none()
    }
}

/// Decode the unverified payload segment of a JWT. Identity extraction
/// is best-effort metadata, not an auth decision, so signature
/// verification is intentionally out of scope here.
fn decode_jwt_payload(token: &str) -> Option<Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1])
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn extract_from_codex(raw: &Value) -> Identity {
    let access_token = raw.get("access_token").or_else(|| raw.get("tokens").and_then(|t| t.get("access_token")));
    let Some(token) = access_token.and_then(Value::as_str) else {
        return Identity {
            email: None,
            account_id: None,
        };
    };
    let Some(payload) = decode_jwt_payload(token) else {
        return Identity {
            email: None,
            account_id: None,
        };
    };
    let email = payload.get("email").and_then(Value::as_str).map(String::from);
    let account_id = payload
        .get("https://api.openai.com/auth")
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| payload.get("sub").and_then(Value::as_str).map(String::from));
    Identity { email, account_id }
}

fn extract_from_claude(raw: &Value) -> Identity {
    let oauth = raw.get("claudeAiOauth").unwrap_or(raw);
    let email = oauth
        .get("email")
        .or_else(|| oauth.get("account").and_then(|a| a.get("email")))
        .and_then(Value::as_str)
        .map(String::from);
    let account_id = oauth
        .get("accountId")
        .or_else(|| oauth.get("account").and_then(|a| a.get("uuid")))
        .and_then(Value::as_str)
        .map(String::from);
    Identity { email, account_id }
}

fn extract_from_gemini(raw: &Value) -> Identity {
    if let Some(id_token) = raw.get("id_token").and_then(Value::as_str) {
        if let Some(payload) = decode_jwt_payload(id_token) {
            let email = payload.get("email").and_then(Value::as_str).map(String::from);
            let account_id = payload.get("sub").and_then(Value::as_str).map(String::from);
            if email.is_some() || account_id.is_some() {
                return Identity { email, account_id };
            }
        }
    }
    let email = raw
        .get("email")
        .or_else(|| raw.get("account").and_then(|a| a.get("email")))
        .and_then(Value::as_str)
        .map(String::from);
    Identity {
        email,
        account_id: None,
    }
}

/// Parse an `Identity` out of a provider's raw credential JSON. Returns
/// `None` when nothing recognisable could be extracted; never an error.
pub fn extract_identity(provider: Provider, raw: &Value) -> Option<Identity> {
    let identity = match provider {
        Provider::Codex => extract_from_codex(raw),
        Provider::Claude => extract_from_claude(raw),
        Provider::Gemini => extract_from_gemini(raw),
    };
    if identity.is_empty() {
        None
    } else {
        Some(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fake_jwt(payload: Value) -> String {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn extracts_codex_identity_from_jwt_access_token() {
        let token = fake_jwt(json!({
            "email": "dev@example.com",
            "https://api.openai.com/auth": {"chatgpt_account_id": "acct-123"}
        }));
        let raw = json!({ "access_token": token });
        let identity = extract_identity(Provider::Codex, &raw).unwrap();
        assert_eq!(identity.email.as_deref(), Some("dev@example.com"));
        assert_eq!(identity.account_id.as_deref(), Some("acct-123"));
    }

    #[test]
    fn extracts_claude_identity_from_nested_oauth() {
        let raw = json!({
            "claudeAiOauth": {
                "email": "alice@example.com",
                "accountId": "uuid-1"
            }
        });
        let identity = extract_identity(Provider::Claude, &raw).unwrap();
        assert_eq!(identity.email.as_deref(), Some("alice@example.com"));
        assert_eq!(identity.account_id.as_deref(), Some("uuid-1"));
    }

    #[test]
    fn extracts_gemini_identity_from_id_token() {
        let token = fake_jwt(json!({"email": "bob@example.com", "sub": "sub-1"}));
        let raw = json!({ "id_token": token });
        let identity = extract_identity(Provider::Gemini, &raw).unwrap();
        assert_eq!(identity.email.as_deref(), Some("bob@example.com"));
    }

    #[test]
    fn returns_none_when_nothing_recognisable() {
        let raw = json!({ "unrelated": true });
        assert!(extract_identity(Provider::Codex, &raw).is_none());
        assert!(extract_identity(Provider::Claude, &raw).is_none());
        assert!(extract_identity(Provider::Gemini, &raw).is_none());
    }

    #[test]
    fn malformed_jwt_does_not_panic() {
        let raw = json!({ "access_token": "not-a-jwt" });
        assert!(extract_identity(Provider::Codex, &raw).is_none());
    }
}

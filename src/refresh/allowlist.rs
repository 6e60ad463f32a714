//! Endpoint allowlist validation for token-refresh requests.
//!
//! Adapted from a wildcard host-pattern domain matcher: the category
//! presets and prompt-injection-guard specifics don't apply here, but
//! the suffix-matching and scheme rules are exactly what the refresh
//! adapters need before making any network call.

use std::net::IpAddr;

use crate::error::RefreshError;

/// Enforce: the URL parses and has a host; the scheme is `https`, or
/// `http` with a loopback host; the host matches an allowlisted entry
/// exactly or as a subdomain (suffix `.<allowed>`); comparisons are
/// case-insensitive; empty allowlist entries are skipped. Loopback is
/// always allowed, for tests and local mocking.
pub fn validate_token_endpoint(url: &str, allowlist: &[String]) -> Result<(), RefreshError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| RefreshError::EndpointNotAllowed(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| RefreshError::EndpointNotAllowed(url.to_string()))?
        .to_ascii_lowercase();

    let is_loopback = is_loopback_host(&host);

    match parsed.scheme() {
        "https" => {}
        "http" if is_loopback => {}
        _ => return Err(RefreshError::EndpointNotAllowed(url.to_string())),
    }

    if is_loopback {
        return Ok(());
    }

    for entry in allowlist {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let entry = entry.to_ascii_lowercase();
        if host == entry || host.ends_with(&format!(".{entry}")) {
            return Ok(());
        }
    }

    Err(RefreshError::EndpointNotAllowed(url.to_string()))
}

/// A host is loopback only when it is the literal name `localhost` or
/// parses as an IP address in `127.0.0.0/8` or `::1`. A hostname that
/// merely starts with a number that looks like `127` (e.g.
/// `127.attacker.example`) is an ordinary DNS name and must go through
/// the allowlist like any other host.
fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_exact_and_subdomain_matches() {
        let allow = vec!["openai.com".to_string()];
        assert!(validate_token_endpoint("https://openai.com/token", &allow).is_ok());
        assert!(validate_token_endpoint("https://auth.openai.com/token", &allow).is_ok());
    }

    #[test]
    fn rejects_non_allowlisted_host() {
        let allow = vec!["openai.com".to_string()];
        assert!(matches!(
            validate_token_endpoint("https://evil.example.com/token", &allow),
            Err(RefreshError::EndpointNotAllowed(_))
        ));
    }

    #[test]
    fn rejects_plain_http_for_non_loopback() {
        let allow = vec!["openai.com".to_string()];
        assert!(validate_token_endpoint("http://openai.com/token", &allow).is_err());
    }

    #[test]
    fn allows_http_loopback_always() {
        assert!(validate_token_endpoint("http://127.0.0.1:1234/token", &[]).is_ok());
        assert!(validate_token_endpoint("http://localhost:1234/token", &[]).is_ok());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let allow = vec!["OpenAI.com".to_string()];
        assert!(validate_token_endpoint("https://OPENAI.COM/token", &allow).is_ok());
    }

    #[test]
    fn suffix_match_does_not_allow_lookalike_domains() {
        let allow = vec!["openai.com".to_string()];
        assert!(validate_token_endpoint("https://notopenai.com/token", &allow).is_err());
    }

    #[test]
    fn a_hostname_starting_with_127_is_not_loopback() {
        let allow = vec!["openai.com".to_string()];
        // Not an IP literal, just a DNS name that starts with a digit
        // group that looks like a loopback octet — must not bypass
        // either the HTTPS-only rule or the allowlist.
        assert!(validate_token_endpoint("http://127.attacker.example/token", &allow).is_err());
        assert!(validate_token_endpoint("https://127.attacker.example/token", &allow).is_err());
    }

    #[test]
    fn ipv6_loopback_literal_is_allowed() {
        assert!(validate_token_endpoint("http://[::1]:1234/token", &[]).is_ok());
    }
}

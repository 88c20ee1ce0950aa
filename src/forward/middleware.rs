//! Request authentication and metadata extraction.
//!
//! Replaces the teacher's static `forward_token` comparison with a real
//! API-key lookup: the caller's token is hashed and matched against the
//! seeded `ApiKey` table, carrying along the group it belongs to.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use super::context::RequestMeta;
use super::error::{ForwardError, ForwardResult};
use crate::domain::{ApiKey, Group};
use crate::server::AppState;

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

pub fn hash_api_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract the caller's raw token, preferring `Authorization: Bearer`, then
/// `x-api-key`, then `x-goog-api-key` for Gemini-native clients.
pub fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim().to_string());
    }
    if let Some(key) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim().to_string());
    }
    None
}

pub fn extract_request_meta(headers: &HeaderMap) -> RequestMeta {
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("")
        .trim()
        .to_string();
    let user_agent = headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
    let privileged_user_id = headers.get("x-privileged-user-id").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    let tmp_dir_hash = headers.get("x-tmp-dir-hash").and_then(|v| v.to_str().ok()).map(|s| s.to_string());

    RequestMeta { client_ip, user_agent, privileged_user_id, tmp_dir_hash }
}

pub fn is_streaming_request(body: &serde_json::Value) -> bool {
    matches!(body.get("stream"), Some(serde_json::Value::Bool(true)))
}

/// Authenticates one request: hashes the presented token, finds the
/// matching `ApiKey` and its `Group`, and checks expiry/status/quota/IP
/// policy that do not require a billing datasource round-trip (those live
/// in the billing gate).
pub fn authenticate(state: &AppState, headers: &HeaderMap, client_ip: &str) -> ForwardResult<(ApiKey, Group)> {
    let token = extract_request_token(headers).ok_or_else(|| ForwardError::Unauthorized("missing credentials".into()))?;
    let hash = hash_api_key(&token);

    let api_key = state
        .api_keys
        .get(&hash)
        .cloned()
        .ok_or_else(|| ForwardError::Unauthorized("unknown api key".into()))?;

    if api_key.status != crate::domain::api_key::ApiKeyStatus::Active {
        return Err(ForwardError::Unauthorized("api key disabled".into()));
    }
    if api_key.is_expired(now()) {
        return Err(ForwardError::Unauthorized("api key expired".into()));
    }
    if !api_key.ip_allowed(client_ip) {
        return Err(ForwardError::Unauthorized("ip not permitted for this api key".into()));
    }
    if !api_key.within_quota() {
        return Err(ForwardError::BillingError("USAGE_LIMIT_EXCEEDED".into()));
    }

    let group = state
        .groups
        .get(&api_key.group_id)
        .cloned()
        .ok_or_else(|| ForwardError::Internal(format!("api key references unknown group {}", api_key.group_id)))?;

    Ok((api_key, group))
}

/// The client-facing model name passes through unchanged; `group.model_routing`
/// only narrows which accounts the scheduler prefers for it, and each
/// account's own `model_mapping` (via `Account::resolve_upstream_model`) does
/// the actual upstream rename. This function exists so callers have one place
/// to look even though today it is the identity.
pub fn resolve_requested_model(_group: &Group, requested_model: &str) -> String {
    requested_model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_api_key_is_deterministic() {
        assert_eq!(hash_api_key("sk-test"), hash_api_key("sk-test"));
        assert_ne!(hash_api_key("sk-test"), hash_api_key("sk-other"));
    }

    #[test]
    fn extract_request_token_prefers_bearer_then_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "from-header".parse().unwrap());
        assert_eq!(extract_request_token(&headers), Some("from-header".to_string()));

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer from-bearer".parse().unwrap());
        assert_eq!(extract_request_token(&headers), Some("from-bearer".to_string()));
    }

    #[test]
    fn resolve_requested_model_falls_back_to_identity() {
        let group = Group::default();
        assert_eq!(resolve_requested_model(&group, "claude-3"), "claude-3");
    }
}

//! Gemini provider handler.

use reqwest::header::HeaderMap;
use serde_json::Value;

use super::ProviderHandlerImpl;
use crate::domain::Account;
use crate::failover::UpstreamFailure;
use crate::forward::context::ForwardContext;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Mirrors antigravity.rs's cooldown default — Gemini reports the same
/// `MODEL_CAPACITY_EXHAUSTED` reason in its error body.
const MODEL_LIMIT_COOLDOWN_SECS: i64 = 600;

pub struct GeminiHandler;

impl ProviderHandlerImpl for GeminiHandler {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn base_url(&self, _ctx: &ForwardContext) -> String {
        DEFAULT_BASE_URL.to_string()
    }

    fn path(&self, ctx: &ForwardContext) -> String {
        let method = if ctx.is_streaming { "streamGenerateContent" } else { "generateContent" };
        format!("/v1beta/models/{}:{}", ctx.upstream_model, method)
    }

    fn build_headers(&self, ctx: &ForwardContext) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        if let Ok(value) = ctx.account.credentials.parse() {
            headers.insert("x-goog-api-key", value);
        }
        headers
    }

    fn prepare_body(&self, _ctx: &ForwardContext, payload: &Value) -> Value {
        payload.clone()
    }

    /// Gemini reports capacity exhaustion as a 429/503 with a
    /// `MODEL_CAPACITY_EXHAUSTED` reason embedded in the error body rather
    /// than a distinct HTTP status.
    fn classify_failure(&self, ctx: &ForwardContext, status: u16, body: &Value) -> Option<UpstreamFailure> {
        let reason = body.pointer("/error/status").and_then(|v| v.as_str()).unwrap_or("");
        if reason == "MODEL_CAPACITY_EXHAUSTED" || reason == "RESOURCE_EXHAUSTED" {
            let scope = Account::model_scope(&ctx.requested_model, ctx.thinking);
            return Some(UpstreamFailure::ModelLimited { scope, reset_at: super::now() + MODEL_LIMIT_COOLDOWN_SECS });
        }
        match status {
            429 => Some(UpstreamFailure::RateLimited { reset_at: 0 }),
            503 => Some(UpstreamFailure::Overloaded { until: 0 }),
            401 | 403 => Some(UpstreamFailure::TransientNetwork),
            400 => Some(UpstreamFailure::InvalidRequest { too_large: false }),
            s if (500..600).contains(&s) => Some(UpstreamFailure::TransientNetwork),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_capacity_exhausted_maps_to_model_limited() {
        let handler = GeminiHandler;
        let body = serde_json::json!({"error": {"status": "MODEL_CAPACITY_EXHAUSTED"}});
        let ctx = test_ctx(false);
        match handler.classify_failure(&ctx, 429, &body) {
            Some(UpstreamFailure::ModelLimited { scope, reset_at }) => {
                assert_eq!(scope, "gemini-1.5-pro");
                assert!(reset_at > crate::forward::handlers::now());
            }
            other => panic!("expected ModelLimited, got {other:?}"),
        }
    }

    #[test]
    fn path_switches_on_streaming_flag() {
        let handler = GeminiHandler;
        assert!(handler.path(&test_ctx(false)).ends_with(":generateContent"));
        assert!(handler.path(&test_ctx(true)).ends_with(":streamGenerateContent"));
    }

    fn test_ctx(streaming: bool) -> ForwardContext {
        ForwardContext {
            account: crate::domain::Account::default(),
            group: crate::domain::Group::default(),
            api_key: crate::domain::ApiKey {
                id: "k".into(),
                key_hash: "h".into(),
                user_id: "u".into(),
                group_id: "g".into(),
                status: crate::domain::api_key::ApiKeyStatus::Active,
                ip_allow: vec![],
                ip_deny: vec![],
                quota_usd: None,
                quota_used_usd: 0.0,
                expires_at: None,
            },
            requested_model: "gemini-1.5-pro".into(),
            upstream_model: "gemini-1.5-pro".into(),
            thinking: false,
            is_streaming: streaming,
            session_key: "s".into(),
            meta: Default::default(),
        }
    }
}

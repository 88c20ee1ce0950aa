//! Antigravity provider handler.
//!
//! Antigravity accounts speak the same request/response schema as Gemini;
//! the distinguishing behavior is a typed prompt-too-long error that the
//! failover controller treats as a non-failover fallback-group retarget
//! rather than an account switch (§4.6).

use reqwest::header::HeaderMap;
use serde_json::Value;

use super::ProviderHandlerImpl;
use crate::domain::Account;
use crate::failover::UpstreamFailure;
use crate::forward::context::ForwardContext;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// How long a model-capacity-exhausted account sits out before the
/// scheduler reconsiders it for this model scope, absent the caller's own
/// `gateway.overload_cooldown_minutes` override (applied by the failover
/// controller when it actually records the cooldown).
const MODEL_LIMIT_COOLDOWN_SECS: i64 = 600;

pub struct AntigravityHandler;

impl ProviderHandlerImpl for AntigravityHandler {
    fn name(&self) -> &'static str {
        "antigravity"
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
            headers.insert("authorization", value);
        }
        headers
    }

    fn prepare_body(&self, _ctx: &ForwardContext, payload: &Value) -> Value {
        payload.clone()
    }

    fn classify_failure(&self, ctx: &ForwardContext, status: u16, body: &Value) -> Option<UpstreamFailure> {
        let reason = body.pointer("/error/status").and_then(|v| v.as_str()).unwrap_or("");
        let message = body.pointer("/error/message").and_then(|v| v.as_str()).unwrap_or("");
        if reason == "INVALID_ARGUMENT" && message.to_ascii_lowercase().contains("too long") {
            return Some(UpstreamFailure::InvalidRequest { too_large: true });
        }
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
    fn prompt_too_long_is_a_typed_invalid_request() {
        let handler = AntigravityHandler;
        let ctx = crate::forward::context::test_context("gemini-2.5-pro", false);
        let body = serde_json::json!({"error": {"status": "INVALID_ARGUMENT", "message": "prompt is too long"}});
        assert!(matches!(
            handler.classify_failure(&ctx, 400, &body),
            Some(UpstreamFailure::InvalidRequest { too_large: true })
        ));
    }

    #[test]
    fn model_capacity_exhausted_carries_the_requested_models_scope_and_a_future_reset() {
        let handler = AntigravityHandler;
        let ctx = crate::forward::context::test_context("gemini-2.5-pro", true);
        let body = serde_json::json!({"error": {"status": "RESOURCE_EXHAUSTED", "message": "no capacity"}});
        match handler.classify_failure(&ctx, 429, &body) {
            Some(UpstreamFailure::ModelLimited { scope, reset_at }) => {
                assert_eq!(scope, "gemini-2.5-pro-thinking");
                assert!(reset_at > crate::forward::handlers::now());
            }
            other => panic!("expected ModelLimited, got {other:?}"),
        }
    }
}

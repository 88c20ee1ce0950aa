//! Anthropic provider handler.

use reqwest::header::HeaderMap;
use serde_json::Value;

use super::ProviderHandlerImpl;
use crate::failover::UpstreamFailure;
use crate::forward::context::ForwardContext;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicHandler;

impl ProviderHandlerImpl for AnthropicHandler {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn base_url(&self, _ctx: &ForwardContext) -> String {
        DEFAULT_BASE_URL.to_string()
    }

    fn path(&self, _ctx: &ForwardContext) -> String {
        "/v1/messages".to_string()
    }

    fn build_headers(&self, ctx: &ForwardContext) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("anthropic-version", ANTHROPIC_VERSION.parse().unwrap());
        if let Ok(value) = ctx.account.credentials.parse() {
            headers.insert("x-api-key", value);
        }
        // API-key-typed accounts sometimes need beta headers the caller
        // didn't send; inject the one extended thinking relies on if
        // missing.
        if ctx.thinking && !headers.contains_key("anthropic-beta") {
            headers.insert("anthropic-beta", "output-128k-2025-02-19".parse().unwrap());
        }
        headers
    }

    fn prepare_body(&self, ctx: &ForwardContext, payload: &Value) -> Value {
        let mut body = payload.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(ctx.upstream_model.clone()));
            obj.insert("stream".to_string(), Value::Bool(ctx.is_streaming));
        }
        body
    }

    fn classify_failure(&self, _ctx: &ForwardContext, status: u16, body: &Value) -> Option<UpstreamFailure> {
        let error_type = body.pointer("/error/type").and_then(|v| v.as_str()).unwrap_or("");
        match status {
            429 => Some(UpstreamFailure::RateLimited { reset_at: 0 }),
            529 | 503 => Some(UpstreamFailure::Overloaded { until: 0 }),
            401 | 403 => Some(UpstreamFailure::TransientNetwork),
            400 => Some(UpstreamFailure::InvalidRequest {
                too_large: error_type == "request_too_large" || error_type == "invalid_request_error",
            }),
            s if (500..600).contains(&s) => Some(UpstreamFailure::TransientNetwork),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_status_classifies_as_retryable() {
        let handler = AnthropicHandler;
        let ctx = crate::forward::context::test_context("claude-3", false);
        assert!(matches!(
            handler.classify_failure(&ctx, 429, &serde_json::json!({})),
            Some(UpstreamFailure::RateLimited { .. })
        ));
    }

    #[test]
    fn success_status_has_no_failure() {
        let handler = AnthropicHandler;
        let ctx = crate::forward::context::test_context("claude-3", false);
        assert!(handler.classify_failure(&ctx, 200, &serde_json::json!({})).is_none());
    }
}

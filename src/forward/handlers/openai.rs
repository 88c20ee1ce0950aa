//! OpenAI-compatible provider handler.

use reqwest::header::HeaderMap;
use serde_json::Value;

use super::ProviderHandlerImpl;
use crate::failover::UpstreamFailure;
use crate::forward::context::ForwardContext;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAIHandler;

impl ProviderHandlerImpl for OpenAIHandler {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn base_url(&self, _ctx: &ForwardContext) -> String {
        DEFAULT_BASE_URL.to_string()
    }

    fn path(&self, _ctx: &ForwardContext) -> String {
        "/v1/chat/completions".to_string()
    }

    fn build_headers(&self, ctx: &ForwardContext) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        if let Ok(value) = format!("Bearer {}", ctx.account.credentials).parse() {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        headers
    }

    fn prepare_body(&self, ctx: &ForwardContext, payload: &Value) -> Value {
        let mut body = payload.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(ctx.upstream_model.clone()));
            obj.insert("stream".to_string(), Value::Bool(ctx.is_streaming));
            // Passthrough headers some OpenAI-compatible proxies reject;
            // stainless client hints are request-header scoped, not body,
            // so nothing to strip here beyond the stream flag normalization.
        }
        body
    }

    fn classify_failure(&self, _ctx: &ForwardContext, status: u16, _body: &Value) -> Option<UpstreamFailure> {
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
    fn server_error_is_transient() {
        let handler = OpenAIHandler;
        let ctx = crate::forward::context::test_context("gpt-4", false);
        assert!(matches!(
            handler.classify_failure(&ctx, 502, &serde_json::json!({})),
            Some(UpstreamFailure::TransientNetwork)
        ));
    }
}

//! Sora provider handler.
//!
//! Sora always streams (configurable `force` vs `error` on a non-streaming
//! request is enforced in `forward/mod.rs`, not here); its soft-error mode
//! is a Cloudflare interstitial challenge returned as HTML instead of JSON,
//! which is treated as a transient upstream hiccup rather than a fatal
//! parse error.

use reqwest::header::HeaderMap;
use serde_json::Value;

use super::ProviderHandlerImpl;
use crate::failover::UpstreamFailure;
use crate::forward::context::ForwardContext;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct SoraHandler;

impl ProviderHandlerImpl for SoraHandler {
    fn name(&self) -> &'static str {
        "sora"
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
            obj.insert("stream".to_string(), Value::Bool(true));
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

/// True when the body looks like a Cloudflare interstitial challenge page
/// rather than a JSON error payload.
pub fn is_cloudflare_challenge(body_text: &str) -> bool {
    let lowered = body_text.to_ascii_lowercase();
    lowered.contains("cf-browser-verification") || lowered.contains("checking your browser")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cloudflare_challenge_markup() {
        assert!(is_cloudflare_challenge("<div class=\"cf-browser-verification\">...</div>"));
        assert!(!is_cloudflare_challenge("{\"error\": \"nope\"}"));
    }
}

//! Forward handlers module
//!
//! Per-provider request shaping and failure classification. Protocol
//! translation is intentionally thin here: the gateway forwards the
//! caller's payload close to verbatim (minimal envelope adjustments —
//! stream-flag forcing, header stripping) rather than rewriting it between
//! vendor wire formats.

pub mod anthropic;
pub mod antigravity;
pub mod gemini;
pub mod openai;
pub mod sora;

use reqwest::header::HeaderMap;
use serde_json::Value;

use super::context::ForwardContext;
use crate::domain::Platform;
use crate::failover::UpstreamFailure;

/// Per-provider request shaping and response classification. Each
/// implementation knows its own base URL scheme, auth header convention,
/// and vendor-specific soft-error payloads (§4.5); the HTTP mechanics
/// (client reuse, retries-are-not-ours, SSE draining) live in `client.rs`
/// and are shared across all of them.
pub trait ProviderHandlerImpl: Send + Sync {
    fn name(&self) -> &'static str;

    /// Base URL for this account (its configured credentials carry the
    /// endpoint for upstream-typed accounts; otherwise the vendor default).
    fn base_url(&self, ctx: &ForwardContext) -> String;

    /// Path suffix appended to the base URL for this request.
    fn path(&self, ctx: &ForwardContext) -> String;

    /// Build outbound headers: auth, content type, and any
    /// account-required extras (e.g. missing `anthropic-beta`).
    fn build_headers(&self, ctx: &ForwardContext) -> HeaderMap;

    /// Adjust the caller's payload minimally: force the upstream model
    /// name and the stream flag, but do not rewrite the vendor schema.
    fn prepare_body(&self, ctx: &ForwardContext, payload: &Value) -> Value;

    /// Map a non-2xx response (or a recognized vendor soft-error embedded
    /// in a 2xx body) to a typed failure the failover controller can act
    /// on. Returns `None` when the response should be treated as success.
    /// `ctx` gives model-scoped failures (e.g. `ModelLimited`) access to
    /// the requested model and thinking flag so they can name their own
    /// per-model scope instead of the caller guessing it.
    fn classify_failure(&self, ctx: &ForwardContext, status: u16, body: &Value) -> Option<UpstreamFailure>;
}

/// Unix-seconds helper for handlers that need to stamp a cooldown window
/// onto a classified failure.
fn now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

pub enum ProviderHandler {
    OpenAI(openai::OpenAIHandler),
    Anthropic(anthropic::AnthropicHandler),
    Gemini(gemini::GeminiHandler),
    Antigravity(antigravity::AntigravityHandler),
    Sora(sora::SoraHandler),
}

macro_rules! dispatch {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match $self {
            ProviderHandler::OpenAI(h) => h.$method($($arg),*),
            ProviderHandler::Anthropic(h) => h.$method($($arg),*),
            ProviderHandler::Gemini(h) => h.$method($($arg),*),
            ProviderHandler::Antigravity(h) => h.$method($($arg),*),
            ProviderHandler::Sora(h) => h.$method($($arg),*),
        }
    };
}

impl ProviderHandler {
    pub fn name(&self) -> &'static str {
        dispatch!(self, name)
    }

    pub fn base_url(&self, ctx: &ForwardContext) -> String {
        dispatch!(self, base_url, ctx)
    }

    pub fn path(&self, ctx: &ForwardContext) -> String {
        dispatch!(self, path, ctx)
    }

    pub fn build_headers(&self, ctx: &ForwardContext) -> HeaderMap {
        dispatch!(self, build_headers, ctx)
    }

    pub fn prepare_body(&self, ctx: &ForwardContext, payload: &Value) -> Value {
        dispatch!(self, prepare_body, ctx, payload)
    }

    pub fn classify_failure(&self, ctx: &ForwardContext, status: u16, body: &Value) -> Option<UpstreamFailure> {
        dispatch!(self, classify_failure, ctx, status, body)
    }

    pub fn url(&self, ctx: &ForwardContext) -> String {
        format!("{}{}", self.base_url(ctx).trim_end_matches('/'), self.path(ctx))
    }
}

pub fn get_handler(platform: Platform) -> ProviderHandler {
    match platform {
        Platform::OpenAI => ProviderHandler::OpenAI(openai::OpenAIHandler),
        Platform::Anthropic => ProviderHandler::Anthropic(anthropic::AnthropicHandler),
        Platform::Gemini => ProviderHandler::Gemini(gemini::GeminiHandler),
        Platform::Antigravity => ProviderHandler::Antigravity(antigravity::AntigravityHandler),
        Platform::Sora => ProviderHandler::Sora(sora::SoraHandler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_handler_dispatches_by_platform() {
        assert_eq!(get_handler(Platform::OpenAI).name(), "openai");
        assert_eq!(get_handler(Platform::Anthropic).name(), "anthropic");
        assert_eq!(get_handler(Platform::Gemini).name(), "gemini");
        assert_eq!(get_handler(Platform::Antigravity).name(), "antigravity");
        assert_eq!(get_handler(Platform::Sora).name(), "sora");
    }
}

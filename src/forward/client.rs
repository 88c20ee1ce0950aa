//! HTTP client utilities for forwarding requests
//!
//! Provides common functionality for making HTTP requests to upstream
//! providers, plus the isolation-mode-keyed client cache C5 uses to avoid
//! building a fresh connection pool per request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{header::HeaderMap, Client, NoProxy, Proxy, Response};
use serde_json::Value;

use super::context::TokenUsage;
use super::error::{ForwardError, ForwardResult};
use crate::config::{self, IsolationMode};

#[derive(Default)]
struct SystemProxySettings {
    http: Option<String>,
    https: Option<String>,
    bypass: Option<String>,
}

fn normalize_proxy_url(raw: &str, default_scheme: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", default_scheme, trimmed)
    }
}

fn push_no_proxy_entry(entries: &mut Vec<String>, entry: &str) {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return;
    }
    if trimmed.eq_ignore_ascii_case("<local>") {
        entries.push("localhost".to_string());
        entries.push("127.0.0.1".to_string());
        entries.push("::1".to_string());
        return;
    }
    entries.push(trimmed.to_string());
}

fn build_no_proxy(cfg: &config::ProxyConfig, extra_bypass: Option<&str>) -> Option<NoProxy> {
    let mut entries = Vec::new();

    if let Some(bypass) = cfg.bypass.as_ref() {
        for item in bypass {
            push_no_proxy_entry(&mut entries, item);
        }
    }

    if let Some(extra) = extra_bypass {
        for item in extra.split(&[';', ','][..]) {
            push_no_proxy_entry(&mut entries, item);
        }
    }

    if entries.is_empty() {
        None
    } else {
        NoProxy::from_string(&entries.join(","))
    }
}

fn system_proxy_from_env() -> Option<SystemProxySettings> {
    let http = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")).ok();
    let https = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy")).ok();
    let bypass = std::env::var("NO_PROXY").or_else(|_| std::env::var("no_proxy")).ok();

    if http.is_none() && https.is_none() {
        return None;
    }

    Some(SystemProxySettings { http, https, bypass })
}

fn create_proxies(cfg: &config::ProxyConfig) -> Vec<Proxy> {
    if !cfg.enabled {
        return Vec::new();
    }

    match cfg.proxy_type.as_str() {
        "none" => Vec::new(),
        "custom" => {
            let Some(url) = cfg.url.as_ref().map(|u| u.trim()).filter(|u| !u.is_empty()) else {
                crate::logger::warn("client", "proxy type is 'custom' but no url configured, ignoring proxy");
                return Vec::new();
            };
            let mut proxy = match Proxy::all(normalize_proxy_url(url, "http")) {
                Ok(proxy) => proxy,
                Err(_) => {
                    crate::logger::warn("client", "failed to parse custom proxy url, ignoring proxy");
                    return Vec::new();
                }
            };

            if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
                proxy = proxy.basic_auth(username, password);
            }

            if let Some(no_proxy) = build_no_proxy(cfg, None) {
                proxy = proxy.no_proxy(Some(no_proxy));
            }

            vec![proxy]
        }
        _ => {
            let Some(settings) = system_proxy_from_env() else {
                return Vec::new();
            };

            let no_proxy = build_no_proxy(cfg, settings.bypass.as_deref());
            let mut proxies = Vec::new();

            if let Some(http) = settings.http.as_ref() {
                if let Ok(proxy) = Proxy::http(normalize_proxy_url(http, "http")) {
                    proxies.push(proxy);
                }
            }
            if let Some(https) = settings.https.as_ref() {
                if let Ok(proxy) = Proxy::https(normalize_proxy_url(https, "http")) {
                    proxies.push(proxy);
                }
            }
            if proxies.is_empty() {
                if let Some(url) = settings.https.as_ref().or(settings.http.as_ref()) {
                    if let Ok(proxy) = Proxy::all(normalize_proxy_url(url, "http")) {
                        proxies.push(proxy);
                    }
                }
            }
            if let Some(no_proxy) = no_proxy {
                proxies = proxies.into_iter().map(|p| p.no_proxy(Some(no_proxy.clone()))).collect();
            }
            proxies
        }
    }
}

/// Build a client for one upstream attempt, honoring configured proxy and
/// response-header-wait vs. body-stream timeout discipline.
pub fn create_client(header_timeout_secs: u64, proxy_cfg: Option<&config::ProxyConfig>) -> ForwardResult<Client> {
    let builder = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(header_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(8);

    let builder = if let Some(proxy_cfg) = proxy_cfg {
        let proxies = create_proxies(proxy_cfg);
        if proxies.is_empty() && proxy_cfg.enabled {
            crate::logger::warn(
                "client",
                &format!("proxy enabled but no proxy could be resolved (type: {})", proxy_cfg.proxy_type),
            );
        }
        proxies.into_iter().fold(builder, |b, p| b.proxy(p))
    } else {
        builder
    };

    builder.build().map_err(|e| ForwardError::Internal(format!("failed to create http client: {e}")))
}

/// Isolation-mode-keyed LRU client cache, idle-evicted after
/// `client_idle_ttl`. The teacher builds one ad hoc client per call; a
/// multi-tenant gateway instead needs pool reuse scoped to whatever the
/// isolation mode says should not share connections (a proxy, an account,
/// or both).
pub struct ClientCache {
    clients: Mutex<HashMap<String, (Client, Instant)>>,
    max_clients: usize,
    idle_ttl: Duration,
    header_timeout_secs: u64,
}

impl ClientCache {
    pub fn new(max_clients: usize, idle_ttl: Duration, header_timeout_secs: u64) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            max_clients,
            idle_ttl,
            header_timeout_secs,
        }
    }

    pub fn isolation_key(mode: IsolationMode, account_id: &str, proxy_fingerprint: &str) -> String {
        match mode {
            IsolationMode::Proxy => format!("proxy:{proxy_fingerprint}"),
            IsolationMode::Account => format!("account:{account_id}"),
            IsolationMode::AccountProxy => format!("account:{account_id}|proxy:{proxy_fingerprint}"),
        }
    }

    pub fn get_or_create(&self, key: &str, proxy_cfg: Option<&config::ProxyConfig>) -> ForwardResult<Client> {
        let mut clients = self.clients.lock().unwrap();
        if let Some((client, last_used)) = clients.get_mut(key) {
            *last_used = Instant::now();
            return Ok(client.clone());
        }

        if clients.len() >= self.max_clients {
            if let Some(lru_key) = clients
                .iter()
                .min_by_key(|(_, (_, last_used))| *last_used)
                .map(|(k, _)| k.clone())
            {
                clients.remove(&lru_key);
            }
        }

        let client = create_client(self.header_timeout_secs, proxy_cfg)?;
        clients.insert(key.to_string(), (client.clone(), Instant::now()));
        Ok(client)
    }

    /// Evict entries idle past `client_idle_ttl`. Run periodically by the
    /// background sweeper alongside the concurrency-slot janitor.
    pub fn sweep_idle(&self) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|_, (_, last_used)| last_used.elapsed() < self.idle_ttl);
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

/// Determine if an HTTP status code is retryable per C6's rule table
/// (401/403/429/5xx/529; 400 only when `failover_on_400` is set, handled by
/// the caller).
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 500 | 502 | 503 | 504 | 529)
}

pub struct RequestAttemptResult {
    pub response: Response,
    pub latency_ms: u64,
}

/// Make a single POST request attempt.
pub async fn make_request(client: &Client, url: &str, headers: HeaderMap, body: &Value) -> ForwardResult<RequestAttemptResult> {
    let start = Instant::now();

    crate::logger::debug("client", &format!("sending request to: {url}"));

    let response = client.post(url).headers(headers).json(body).send().await.map_err(|e| {
        if e.is_timeout() {
            ForwardError::Timeout("request timeout".to_string())
        } else if e.is_connect() {
            ForwardError::UpstreamError(format!("connection failed: {e}"))
        } else {
            ForwardError::UpstreamError(format!("request error: {e}"))
        }
    })?;

    let latency_ms = start.elapsed().as_millis() as u64;
    crate::logger::debug("client", &format!("response status: {} ({latency_ms}ms)", response.status()));

    Ok(RequestAttemptResult { response, latency_ms })
}

/// Extract a best-effort token usage from a vendor JSON payload's `usage`
/// object, accepting the OpenAI/Anthropic/Gemini field name variants.
pub fn extract_usage(body: &Value) -> TokenUsage {
    let usage = body.get("usage").or_else(|| body.get("usageMetadata"));
    let Some(usage) = usage else { return TokenUsage::default() };

    let get = |keys: &[&str]| -> i64 {
        keys.iter().find_map(|k| usage.get(*k)).and_then(|v| v.as_i64()).unwrap_or(0)
    };

    TokenUsage {
        prompt_tokens: get(&["prompt_tokens", "input_tokens", "promptTokenCount"]),
        completion_tokens: get(&["completion_tokens", "output_tokens", "candidatesTokenCount"]),
        cache_creation_tokens_5m: get(&["cache_creation_input_tokens_5m"]),
        cache_creation_tokens_1h: get(&["cache_creation_input_tokens_1h"]),
        cache_read_tokens: get(&["cache_read_input_tokens", "cached_content_token_count"]),
        image_count: get(&["image_count"]),
    }
}

/// Parse SSE `data:` line content.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

/// Check if SSE line indicates stream end.
pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Normalize a request body's `stream` flag to a boolean if present.
pub fn normalize_stream_flag(payload: &mut Value) -> bool {
    let Some(obj) = payload.as_object_mut() else { return false };

    let is_streaming = match obj.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    };

    if obj.contains_key("stream") {
        obj.insert("stream".to_string(), Value::Bool(is_streaming));
    }

    is_streaming
}

/// Parse JSON response text with a fallback for SSE-trailing-line payloads.
pub fn parse_json_response(response_text: &str) -> Result<Value, serde_json::Error> {
    let trimmed = response_text.trim();
    let parse_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    if response_text.contains("data:") {
        let mut last_value = None;
        for line in response_text.lines() {
            if let Some(data) = parse_sse_data(line) {
                let data = data.trim();
                if data.is_empty() || is_sse_done(data) {
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    last_value = Some(value);
                }
            }
        }
        if let Some(value) = last_value {
            return Ok(value);
        }
    }

    Err(parse_err)
}

/// Drain complete SSE lines from a byte buffer bounded by `max_line_size`,
/// handling reads that split a line across chunk boundaries.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8], max_line_size: usize) -> ForwardResult<Vec<String>> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }
    if buffer.len() > max_line_size && !buffer.contains(&b'\n') {
        return Err(ForwardError::InvalidRequest("sse line exceeded max_line_size".into()));
    }

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else { break };

        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        lines.push(String::from_utf8_lossy(&line).to_string());
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_failover_rule_table() {
        assert!(is_retryable_status(401));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(529));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn parse_sse_data_strips_prefix() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("event: message"), None);
    }

    #[test]
    fn is_sse_done_detects_sentinel() {
        assert!(is_sse_done("[DONE]"));
        assert!(!is_sse_done("{}"));
    }

    #[test]
    fn drain_sse_lines_handles_partial_reads() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: {\"id\":", 1024 * 1024).unwrap();
        assert!(lines.is_empty());
        let lines = drain_sse_lines(&mut buffer, b"1}\n", 1024 * 1024).unwrap();
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
    }

    #[test]
    fn client_cache_evicts_lru_past_capacity() {
        let cache = ClientCache::new(1, Duration::from_secs(600), 60);
        let a = cache.get_or_create("a", None).unwrap();
        let _b = cache.get_or_create("b", None).unwrap();
        assert_eq!(cache.len(), 1);
        drop(a);
    }

    #[test]
    fn extract_usage_reads_openai_and_anthropic_field_names() {
        let body = serde_json::json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}});
        let usage = extract_usage(&body);
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);

        let body = serde_json::json!({"usage": {"input_tokens": 7, "output_tokens": 3}});
        let usage = extract_usage(&body);
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
    }
}

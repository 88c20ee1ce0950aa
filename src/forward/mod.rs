//! Request forwarding (component C5) and its axum route handlers.
//!
//! Ties C1 (concurrency), C3 (scheduler), C6 (failover), C7 (billing) and
//! C8 (usage) around a single upstream call per `ProviderHandler`. Routes
//! are thin: they extract the caller's intent (model, streaming flag,
//! thinking mode) and hand off to `handle_forward`, which is the one place
//! the whole pipeline is assembled.

pub mod client;
pub mod context;
pub mod error;
pub mod handlers;
pub mod media;
pub mod middleware;
pub mod stream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::billing::BillingDecision;
use crate::concurrency::{derive_max_wait, Scope, StreamWait};
use crate::config::GatewaySettings;
use crate::domain::group::SubscriptionType;
use crate::domain::{Account, ApiKey, Group, Platform};
use crate::failover::{AttemptOutcome, FailoverController, UpstreamFailure};
use crate::forward::client::ClientCache;
use crate::forward::context::{estimate_tokens, ForwardContext, RequestMeta, TokenUsage, LONG_CONTEXT_THRESHOLD_TOKENS};
use crate::forward::error::ForwardError;
use crate::forward::handlers::{get_handler, ProviderHandler};
use crate::forward::stream::StreamProtocol;
use crate::pricing;
use crate::server::AppState;
use crate::sticky;
use crate::usage_recorder::UsageTask;

/// The outcome of one successful upstream attempt. For a buffered request
/// `response` carries the HTTP response built for the caller; for a
/// streaming request the response was already handed to axum before the
/// failover loop ran, so `response` is `None` and the body bytes were
/// pushed through the stream's channel as they arrived. Either way C8
/// gets what it needs without a second round-trip through the upstream
/// body.
struct Attempt {
    response: Option<Response>,
    usage: TokenUsage,
    duration_ms: i64,
    upstream_model: String,
    stream: bool,
}

/// Shared pipeline for every inbound chat-style route. `force_stream`
/// overrides the caller's `stream` flag (Sora always streams); `thinking`
/// is detected from the body (an Anthropic `thinking` block).
///
/// Buffered requests run start to finish before a response is built.
/// Streaming requests split here: the SSE response is built and handed to
/// axum immediately, and the rest of the pipeline (user slot, billing
/// post-check, failover) runs in a background task that feeds the
/// response's channel. Once that channel exists the HTTP status is
/// committed at 200 — any failure from here on is written into the stream
/// as a vendor `error` event instead of a fresh response (no post-stream
/// status rewrite).
async fn handle_forward(state: &Arc<AppState>, headers: &HeaderMap, mut payload: Value, force_stream: Option<bool>) -> Response {
    let client_ip = middleware::extract_request_meta(headers).client_ip;
    let (api_key, group) = match middleware::authenticate(state, headers, &client_ip) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    match state.billing.pre_check(&group, &api_key.user_id) {
        BillingDecision::Allowed => {}
        other => return ForwardError::from(other).into_response(),
    }

    let requested_model = payload.get("model").and_then(|v| v.as_str()).unwrap_or("").to_string();
    if requested_model.is_empty() {
        return ForwardError::InvalidRequest("request body is missing \"model\"".into()).into_response();
    }
    let requested_model = middleware::resolve_requested_model(&group, &requested_model);

    let meta = middleware::extract_request_meta(headers);
    let is_streaming = force_stream.unwrap_or_else(|| middleware::is_streaming_request(&payload));
    client::normalize_stream_flag(&mut payload);
    let thinking = payload.get("thinking").map(|v| !v.is_null()).unwrap_or(false);

    let session_key = match group.platform {
        Platform::Gemini | Platform::Antigravity => {
            sticky::gemini_session_key(meta.privileged_user_id.as_deref().unwrap_or(""), meta.tmp_dir_hash.as_deref().unwrap_or(""))
        }
        _ => sticky::generic_session_key(&api_key.id, &meta.client_ip, &meta.user_agent),
    };

    if !is_streaming {
        return run_buffered(state, api_key, group, requested_model, thinking, session_key, meta, payload).await;
    }

    let protocol = StreamProtocol::for_platform(group.platform);
    let (response, tx) = start_stream_response();
    let started = Arc::new(AtomicBool::new(false));

    let state = Arc::clone(state);
    tokio::spawn(async move {
        run_streaming(state, api_key, group, requested_model, thinking, session_key, meta, payload, protocol, tx, started).await;
    });
    response
}

/// The non-streaming pipeline: user slot -> billing post-check -> failover,
/// then a single synchronous response.
async fn run_buffered(
    state: &Arc<AppState>,
    api_key: ApiKey,
    group: Group,
    requested_model: String,
    thinking: bool,
    session_key: String,
    meta: RequestMeta,
    payload: Value,
) -> Response {
    let cfg = state.gateway.clone();
    let max_wait = derive_max_wait(cfg.user_max_concurrency, cfg.user_max_wait_cap);
    if !state.user_arbiter.try_enter_wait_line(Scope::User, &api_key.user_id, max_wait).await {
        return ForwardError::Overloaded("too many requests already waiting for this user".into()).into_response();
    }
    let user_guard = match state
        .user_arbiter
        .acquire_slot_with_wait(
            Scope::User,
            &api_key.user_id,
            cfg.user_max_concurrency,
            Some(Duration::from_secs(cfg.fallback_wait_timeout_secs)),
            false,
            None,
        )
        .await
    {
        Ok(g) => g,
        Err(_) => return ForwardError::Overloaded("user concurrency limit reached".into()).into_response(),
    };

    // C7 post-check, right after the user slot is acquired and before an
    // account is even chosen (ordering: C7-pre -> C1-user -> C7-post -> C3).
    match state.billing.post_check(&group, &api_key.user_id, 1.0) {
        BillingDecision::Allowed => {}
        other => {
            drop(user_guard);
            return ForwardError::from(other).into_response();
        }
    }

    let fallback_group = group.fallback_group_id_on_invalid_request.as_ref().and_then(|id| state.groups.get(id)).cloned();
    let is_gemini = matches!(group.platform, Platform::Gemini | Platform::Antigravity);
    let controller = FailoverController::new(&state.scheduler, &cfg);

    let outcome = controller
        .run(&group, fallback_group.as_ref(), &session_key, &requested_model, thinking, is_gemini, |account, attempt_group| {
            let api_key = &api_key;
            let requested_model = &requested_model;
            let session_key = &session_key;
            let meta = &meta;
            let payload = &payload;
            let state = &state;
            let cfg = &cfg;
            async move {
                attempt_once_buffered(
                    &account,
                    &attempt_group,
                    api_key,
                    requested_model,
                    thinking,
                    session_key,
                    meta,
                    payload,
                    &state.client_cache,
                    state.proxy.as_ref(),
                    cfg,
                )
                .await
            }
        })
        .await;

    drop(user_guard);

    match outcome {
        Ok(success) => {
            enqueue_usage(state, &api_key, &success.group, &success.account, &success.result, success.force_cache_billing);
            success
                .result
                .response
                .unwrap_or_else(|| ForwardError::Internal("buffered attempt produced no response".into()).into_response())
        }
        Err(e) => ForwardError::from(e).into_response(),
    }
}

/// The streaming pipeline, run in a background task after the SSE response
/// has already been returned to the caller. A failure anywhere here is
/// written into `tx` as a vendor error event rather than returned as a
/// fresh HTTP response, since the status is already committed.
#[allow(clippy::too_many_arguments)]
async fn run_streaming(
    state: Arc<AppState>,
    api_key: ApiKey,
    group: Group,
    requested_model: String,
    thinking: bool,
    session_key: String,
    meta: RequestMeta,
    payload: Value,
    protocol: StreamProtocol,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    started: Arc<AtomicBool>,
) {
    let cfg = state.gateway.clone();
    let max_wait = derive_max_wait(cfg.user_max_concurrency, cfg.user_max_wait_cap);
    if !state.user_arbiter.try_enter_wait_line(Scope::User, &api_key.user_id, max_wait).await {
        send_stream_error(&tx, ForwardError::Overloaded("too many requests already waiting for this user".into()), protocol);
        return;
    }

    let started_ref: &AtomicBool = started.as_ref();
    let stream_wait = StreamWait {
        interval: Duration::from_secs(cfg.stream_keepalive_interval_secs.max(1)),
        frame: protocol.keepalive_frame(),
        sender: &tx,
        started: started_ref,
    };
    let user_guard = match state
        .user_arbiter
        .acquire_slot_with_wait(
            Scope::User,
            &api_key.user_id,
            cfg.user_max_concurrency,
            Some(Duration::from_secs(cfg.fallback_wait_timeout_secs)),
            true,
            Some(stream_wait),
        )
        .await
    {
        Ok(g) => g,
        Err(_) => {
            send_stream_error(&tx, ForwardError::Overloaded("user concurrency limit reached".into()), protocol);
            return;
        }
    };

    match state.billing.post_check(&group, &api_key.user_id, 1.0) {
        BillingDecision::Allowed => {}
        other => {
            drop(user_guard);
            send_stream_error(&tx, ForwardError::from(other), protocol);
            return;
        }
    }

    let fallback_group = group.fallback_group_id_on_invalid_request.as_ref().and_then(|id| state.groups.get(id)).cloned();
    let is_gemini = matches!(group.platform, Platform::Gemini | Platform::Antigravity);
    let controller = FailoverController::new(&state.scheduler, &cfg);

    let outcome = controller
        .run(&group, fallback_group.as_ref(), &session_key, &requested_model, thinking, is_gemini, |account, attempt_group| {
            let api_key = &api_key;
            let requested_model = &requested_model;
            let session_key = &session_key;
            let meta = &meta;
            let payload = &payload;
            let state = &state;
            let cfg = &cfg;
            let tx = &tx;
            async move {
                attempt_once_streaming(
                    &account,
                    &attempt_group,
                    api_key,
                    requested_model,
                    thinking,
                    session_key,
                    meta,
                    payload,
                    &state.client_cache,
                    state.proxy.as_ref(),
                    cfg,
                    tx,
                    started_ref,
                )
                .await
            }
        })
        .await;

    drop(user_guard);

    match outcome {
        Ok(success) => {
            enqueue_usage(&state, &api_key, &success.group, &success.account, &success.result, success.force_cache_billing);
        }
        Err(e) => {
            send_stream_error(&tx, ForwardError::from(e), protocol);
        }
    }
}

/// Builds the SSE response handed to axum immediately, and the channel the
/// background pipeline feeds as bytes and keepalives become available.
fn start_stream_response() -> (Response, mpsc::UnboundedSender<Vec<u8>>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let body_stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx).map(|opt| opt.map(|chunk| Ok::<_, std::io::Error>(axum::body::Bytes::from(chunk)))));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| ForwardError::Internal("failed to build streaming response".into()).into_response());
    (response, tx)
}

fn send_stream_error(tx: &mpsc::UnboundedSender<Vec<u8>>, err: ForwardError, protocol: StreamProtocol) {
    let _ = tx.send(err.to_sse_frame(protocol));
}

/// Shapes and sends one upstream HTTP request for `account`. Shared by the
/// buffered and streaming attempt paths; what differs between them is only
/// how a 2xx response body is consumed.
#[allow(clippy::too_many_arguments)]
async fn send_upstream_request(
    handler: &ProviderHandler,
    account: &Account,
    group: &Group,
    api_key: &ApiKey,
    requested_model: &str,
    thinking: bool,
    is_streaming: bool,
    session_key: &str,
    meta: &RequestMeta,
    payload: &Value,
    client_cache: &Arc<ClientCache>,
    proxy_cfg: Option<&crate::config::ProxyConfig>,
    cfg: &GatewaySettings,
) -> Result<(reqwest::Response, i64, ForwardContext, Value), UpstreamFailure> {
    let upstream_model = account.resolve_upstream_model(requested_model).to_string();
    let ctx = ForwardContext {
        account: account.clone(),
        group: group.clone(),
        api_key: api_key.clone(),
        requested_model: requested_model.to_string(),
        upstream_model,
        thinking,
        is_streaming,
        session_key: session_key.to_string(),
        meta: meta.clone(),
    };

    let body = handler.prepare_body(&ctx, payload);
    let headers = handler.build_headers(&ctx);
    let url = handler.url(&ctx);

    let proxy_fingerprint = proxy_cfg.and_then(|p| p.url.as_deref()).unwrap_or("");
    let isolation_key = ClientCache::isolation_key(cfg.connection_pool_isolation, &account.id, proxy_fingerprint);
    let client = client_cache
        .get_or_create(&isolation_key, proxy_cfg)
        .map_err(|e| UpstreamFailure::Fatal(format!("failed to build upstream client: {e:?}")))?;

    let attempt = client::make_request(&client, &url, headers, &body).await.map_err(|_| UpstreamFailure::TransientNetwork)?;

    Ok((attempt.response, attempt.latency_ms as i64, ctx, body))
}

/// Classifies a non-2xx upstream response into a typed failure. Shared by
/// both attempt paths; generic in `T` since it never produces a success.
async fn classify_non_success<T>(ctx: &ForwardContext, handler: &ProviderHandler, status: u16, response: reqwest::Response, cfg: &GatewaySettings) -> AttemptOutcome<T> {
    let max_bytes = cfg.upstream_response_read_max_bytes;
    let raw = response.bytes().await.unwrap_or_default();
    let bound = raw.len().min(max_bytes);
    let body_text = String::from_utf8_lossy(&raw[..bound]).to_string();

    if ctx.account.platform == Platform::Sora && handlers::sora::is_cloudflare_challenge(&body_text) {
        return AttemptOutcome::Failure(UpstreamFailure::TransientNetwork);
    }

    let parsed_body = serde_json::from_str::<Value>(&body_text).unwrap_or(Value::Null);
    match handler.classify_failure(ctx, status, &parsed_body) {
        Some(failure) => AttemptOutcome::Failure(failure),
        None if client::is_retryable_status(status) => AttemptOutcome::Failure(UpstreamFailure::TransientNetwork),
        None => AttemptOutcome::Failure(UpstreamFailure::Fatal(format!("upstream returned unmapped status {status}"))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn attempt_once_buffered(
    account: &Account,
    group: &Group,
    api_key: &ApiKey,
    requested_model: &str,
    thinking: bool,
    session_key: &str,
    meta: &RequestMeta,
    payload: &Value,
    client_cache: &Arc<ClientCache>,
    proxy_cfg: Option<&crate::config::ProxyConfig>,
    cfg: &GatewaySettings,
) -> AttemptOutcome<Attempt> {
    let handler = get_handler(account.platform);
    let (response, duration_ms, ctx, _body) =
        match send_upstream_request(&handler, account, group, api_key, requested_model, thinking, false, session_key, meta, payload, client_cache, proxy_cfg, cfg).await {
            Ok(v) => v,
            Err(f) => return AttemptOutcome::Failure(f),
        };

    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        let text = match response.text().await {
            Ok(t) => t,
            Err(_) => return AttemptOutcome::Failure(UpstreamFailure::TransientNetwork),
        };
        let parsed = client::parse_json_response(&text).unwrap_or_else(|_| json!({"raw": text}));
        let usage = client::extract_usage(&parsed);
        let http_response = (StatusCode::from_u16(status).unwrap_or(StatusCode::OK), Json(parsed)).into_response();
        return AttemptOutcome::Success(Attempt { response: Some(http_response), usage, duration_ms, upstream_model: ctx.upstream_model, stream: false });
    }

    classify_non_success(&ctx, &handler, status, response, cfg).await
}

/// Runs one streaming attempt. A 2xx response is forwarded to the client
/// chunk by chunk as it arrives. If the upstream connection breaks after
/// bytes have already reached the client, the attempt is not retried
/// (a new account can't resume a half-sent generation) — it fails fatally
/// so the caller surfaces a single SSE error event and stops. A break
/// before any byte went out is still a plain transient failure the
/// failover loop can retry.
#[allow(clippy::too_many_arguments)]
async fn attempt_once_streaming(
    account: &Account,
    group: &Group,
    api_key: &ApiKey,
    requested_model: &str,
    thinking: bool,
    session_key: &str,
    meta: &RequestMeta,
    payload: &Value,
    client_cache: &Arc<ClientCache>,
    proxy_cfg: Option<&crate::config::ProxyConfig>,
    cfg: &GatewaySettings,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    started: &AtomicBool,
) -> AttemptOutcome<Attempt> {
    let handler = get_handler(account.platform);
    let (response, duration_ms, ctx, body) =
        match send_upstream_request(&handler, account, group, api_key, requested_model, thinking, true, session_key, meta, payload, client_cache, proxy_cfg, cfg).await {
            Ok(v) => v,
            Err(f) => return AttemptOutcome::Failure(f),
        };

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return classify_non_success(&ctx, &handler, status, response, cfg).await;
    }
    let upstream_model = ctx.upstream_model.clone();

    let mut byte_stream = response.bytes_stream();
    let mut forwarded_any = false;
    while let Some(chunk) = byte_stream.next().await {
        match chunk {
            Ok(bytes) => {
                forwarded_any = true;
                started.store(true, Ordering::SeqCst);
                if tx.send(bytes.to_vec()).is_err() {
                    return AttemptOutcome::Failure(UpstreamFailure::Fatal("client disconnected mid-stream".into()));
                }
            }
            Err(e) => {
                return if forwarded_any {
                    AttemptOutcome::Failure(UpstreamFailure::Fatal(format!("upstream connection lost mid-stream: {e}")))
                } else {
                    AttemptOutcome::Failure(UpstreamFailure::TransientNetwork)
                };
            }
        }
    }

    // A passthrough stream can't be re-parsed for exact token counts
    // without buffering it (defeating the point of streaming); bill on a
    // prompt-side estimate and let C8's completion-token gap show up as a
    // known undercount.
    let usage = TokenUsage { prompt_tokens: estimate_tokens(&body.to_string()), ..Default::default() };
    AttemptOutcome::Success(Attempt { response: None, usage, duration_ms, upstream_model, stream: true })
}

fn enqueue_usage(state: &Arc<AppState>, api_key: &ApiKey, group: &Group, account: &Account, attempt: &Attempt, force_cache_billing: bool) {
    let long_context_crossed = attempt.usage.prompt_tokens > LONG_CONTEXT_THRESHOLD_TOKENS;
    let price = pricing::price_for(&attempt.upstream_model);
    let tokens = pricing::UsageTokens {
        prompt_tokens: attempt.usage.prompt_tokens,
        completion_tokens: attempt.usage.completion_tokens,
        cache_creation_tokens_5m: attempt.usage.cache_creation_tokens_5m,
        cache_creation_tokens_1h: attempt.usage.cache_creation_tokens_1h,
        cache_read_tokens: attempt.usage.cache_read_tokens,
        image_count: attempt.usage.image_count,
    };
    let cost_usd = pricing::cost_usd(
        &tokens,
        &price,
        group.rate_multiplier,
        account.rate_multiplier,
        pricing::long_context_multiplier(long_context_crossed),
        force_cache_billing,
    );
    let billing_type = match group.subscription_type {
        SubscriptionType::Standard => "standard",
        SubscriptionType::Subscription => "subscription",
    };

    let task = UsageTask {
        api_key_id: api_key.id.clone(),
        user_id: api_key.user_id.clone(),
        account_id: account.id.clone(),
        group_id: group.id.clone(),
        platform: account.platform.as_str().to_string(),
        model: attempt.upstream_model.clone(),
        prompt_tokens: attempt.usage.prompt_tokens,
        completion_tokens: attempt.usage.completion_tokens,
        cache_creation_tokens_5m: attempt.usage.cache_creation_tokens_5m,
        cache_creation_tokens_1h: attempt.usage.cache_creation_tokens_1h,
        cache_read_tokens: attempt.usage.cache_read_tokens,
        image_count: attempt.usage.image_count,
        cost_usd,
        billing_type: billing_type.to_string(),
        rate_multiplier: group.rate_multiplier * account.rate_multiplier,
        force_cache_billing,
        long_context_crossed,
        stream: attempt.stream,
        duration_ms: attempt.duration_ms,
        first_token_ms: None,
    };

    let recorder = Arc::clone(&state.usage_recorder);
    tokio::spawn(async move {
        recorder.enqueue(task).await;
    });
}

// ---- Routes ----

pub async fn anthropic_messages(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    handle_forward(&state, &headers, payload, None).await
}

pub async fn count_tokens(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    let client_ip = middleware::extract_request_meta(&headers).client_ip;
    let (api_key, group) = match middleware::authenticate(&state, &headers, &client_ip) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    if let BillingDecision::Denied(reason) = state.billing.pre_check(&group, &api_key.user_id) {
        return ForwardError::from(BillingDecision::Denied(reason)).into_response();
    }
    let text = payload.to_string();
    Json(json!({ "input_tokens": estimate_tokens(&text) })).into_response()
}

pub async fn gemini_generate(State(state): State<Arc<AppState>>, Path(model): Path<String>, headers: HeaderMap, Json(mut payload): Json<Value>) -> Response {
    let stream = model.ends_with(":streamGenerateContent");
    let model_name = model.split(':').next().unwrap_or(&model).to_string();
    if let Some(obj) = payload.as_object_mut() {
        obj.entry("model").or_insert(Value::String(model_name));
    }
    handle_forward(&state, &headers, payload, Some(stream)).await
}

pub async fn antigravity_generate(State(state): State<Arc<AppState>>, Path(model): Path<String>, headers: HeaderMap, Json(mut payload): Json<Value>) -> Response {
    let stream = model.ends_with(":streamGenerateContent");
    let model_name = model.split(':').next().unwrap_or(&model).to_string();
    if let Some(obj) = payload.as_object_mut() {
        obj.entry("model").or_insert(Value::String(model_name));
    }
    handle_forward(&state, &headers, payload, Some(stream)).await
}

/// Sora always streams; a non-streaming request is forced to stream rather
/// than rejected, matching the "force" side of the configurable
/// force|error enforcement named in the external interface table.
pub async fn sora_chat_completions(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    handle_forward(&state, &headers, payload, Some(true)).await
}

pub async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    models_for_caller(&state, &headers).await
}

pub async fn list_models_v1beta(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    models_for_caller(&state, &headers).await
}

pub async fn get_model(State(state): State<Arc<AppState>>, Path(model): Path<String>, headers: HeaderMap) -> Response {
    let client_ip = middleware::extract_request_meta(&headers).client_ip;
    let (_api_key, group) = match middleware::authenticate(&state, &headers, &client_ip) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let accounts = state.scheduler.accounts.list_for_group(&group.id).await;
    let supported = accounts.iter().any(|a| a.supports_model(&model));
    if supported {
        Json(json!({ "name": model, "platform": group.platform.as_str() })).into_response()
    } else {
        ForwardError::InvalidRequest(format!("model {model} is not available for this api key")).into_response()
    }
}

async fn models_for_caller(state: &Arc<AppState>, headers: &HeaderMap) -> Response {
    let client_ip = middleware::extract_request_meta(headers).client_ip;
    let (_api_key, group) = match middleware::authenticate(state, headers, &client_ip) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let accounts = state.scheduler.accounts.list_for_group(&group.id).await;
    let mut models: Vec<String> = accounts.into_iter().flat_map(|a| a.model_mapping.keys().cloned().collect::<Vec<_>>()).collect();
    models.sort();
    models.dedup();
    Json(json!({ "models": models })).into_response()
}

#[derive(serde::Deserialize)]
pub struct SignedMediaParams {
    sig: String,
    expires: i64,
}

/// `/sora/media/*path` — api-key authenticated pass-through of a Sora
/// media asset, not gated by signature (the caller already proved
/// identity via their api key).
pub async fn sora_media(State(state): State<Arc<AppState>>, Path(path): Path<String>, headers: HeaderMap) -> Response {
    let client_ip = middleware::extract_request_meta(&headers).client_ip;
    if let Err(e) = middleware::authenticate(&state, &headers, &client_ip) {
        return e.into_response();
    }
    proxy_media(&state, &path).await
}

/// `/sora/media-signed/*path` — unauthenticated, gated by `sig`+`expires`
/// query params signed with `gateway.media_signing_secret`.
pub async fn sora_media_signed(State(state): State<Arc<AppState>>, Path(path): Path<String>, Query(params): Query<SignedMediaParams>) -> Response {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    if !media::verify(&state.gateway.media_signing_secret, &path, params.expires, now, &params.sig) {
        return ForwardError::Unauthorized("invalid or expired media signature".into()).into_response();
    }
    proxy_media(&state, &path).await
}

async fn proxy_media(state: &Arc<AppState>, path: &str) -> Response {
    let client = match state.client_cache.get_or_create("sora-media", state.proxy.as_ref()) {
        Ok(c) => c,
        Err(e) => return ForwardError::Internal(format!("failed to build media client: {e:?}")).into_response(),
    };
    let url = media::media_url(path);
    let upstream = match client.get(&url).send().await {
        Ok(r) => r,
        Err(_) => return ForwardError::UpstreamError("failed to reach media host".into()).into_response(),
    };
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream.headers().get(axum::http::header::CONTENT_TYPE).cloned();
    let byte_stream = upstream.bytes_stream().map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(axum::http::header::CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from_stream(byte_stream))
        .unwrap_or_else(|_| ForwardError::Internal("failed to build media response".into()).into_response())
}

pub async fn usage_summary(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let client_ip = middleware::extract_request_meta(&headers).client_ip;
    let (api_key, _group) = match middleware::authenticate(&state, &headers, &client_ip) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    Json(json!({
        "api_key_id": api_key.id,
        "quota_usd": api_key.quota_usd,
        "quota_used_usd": api_key.quota_used_usd,
        "within_quota": api_key.within_quota(),
    }))
    .into_response()
}

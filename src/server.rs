//! Server wiring: `AppState` construction and the axum route table.
//!
//! Mirrors the teacher's `app()`/`serve()` split (a pure `Router` builder
//! plus a thin binder), but `AppState` now owns the whole component graph
//! (C1-C9) instead of the teacher's handful of `once_cell::Lazy` globals.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, routing::post, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::billing::BillingGate;
use crate::concurrency::ConcurrencyArbiter;
use crate::config::{GatewaySettings, ProxyConfig, Settings};
use crate::db;
use crate::domain::{Account, ApiKey, Group};
use crate::forward::client::ClientCache;
use crate::idempotency::IdempotencyCoordinator;
use crate::logger;
use crate::scheduler::{AccountStore, Scheduler};
use crate::sticky::StickySessionCache;
use crate::usage_recorder::UsageRecorder;

/// Shared application state, constructed once at startup and cloned as an
/// `Arc` into every handler via axum's `State` extractor.
pub struct AppState {
    pub gateway: GatewaySettings,
    pub proxy: Option<ProxyConfig>,
    pub groups: HashMap<String, Group>,
    /// Keyed by `hash_api_key(raw_token)`, never the raw key.
    pub api_keys: HashMap<String, ApiKey>,
    pub scheduler: Arc<Scheduler>,
    pub user_arbiter: Arc<ConcurrencyArbiter>,
    pub billing: Arc<BillingGate>,
    pub usage_recorder: Arc<UsageRecorder>,
    pub idempotency: Arc<IdempotencyCoordinator>,
    pub client_cache: Arc<ClientCache>,
}

impl AppState {
    pub fn new(settings: Settings) -> Arc<Self> {
        let groups = settings.groups.iter().cloned().map(|g| (g.id.clone(), g)).collect();
        let api_keys: HashMap<String, ApiKey> =
            settings.api_keys.iter().cloned().map(|k| (k.key_hash.clone(), k)).collect();

        for sub in &settings.subscriptions {
            db::upsert_subscription(sub);
        }
        let seed_accounts: Vec<Account> = settings.accounts.clone();
        for acc in &seed_accounts {
            db::upsert_account(acc);
        }

        let accounts = AccountStore::new(seed_accounts);
        let sticky = StickySessionCache::new(Duration::from_secs(settings.gateway.sticky_session_idle_timeout_secs));
        let arbiter = ConcurrencyArbiter::new(Duration::from_secs(settings.gateway.concurrency_slot_ttl_minutes * 60));
        let scheduler = Scheduler::new(accounts, sticky, Arc::clone(&arbiter), settings.gateway.db_fallback_qps);

        Arc::new(Self {
            gateway: settings.gateway.clone(),
            proxy: settings.proxy.clone(),
            groups,
            api_keys,
            scheduler,
            user_arbiter: arbiter,
            billing: Arc::new(BillingGate::new()),
            usage_recorder: UsageRecorder::start(settings.gateway.usage_record.clone()),
            idempotency: Arc::new(IdempotencyCoordinator::new(settings.gateway.idempotency.clone())),
            client_cache: Arc::new(ClientCache::new(
                settings.gateway.max_upstream_clients,
                Duration::from_secs(settings.gateway.client_idle_ttl_secs),
                settings.gateway.response_header_timeout_secs,
            )),
        })
    }

    /// Periodic maintenance: reclaims leaked concurrency slots, drops
    /// expired sticky bindings and idle upstream clients. Intended to run
    /// from a `tokio::time::interval` loop spawned in `main`.
    pub async fn run_maintenance_sweep(&self) {
        self.scheduler.arbiter.sweep_expired_slots().await;
        self.scheduler.sticky.sweep_expired().await;
        db::sweep_expired_sticky_bindings(now());
        self.client_cache.sweep_idle();
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn api_health(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "billing_circuit": format!("{:?}", state.billing.circuit_state()),
        "usage_queue_depth": state.usage_recorder.queue_depth(),
    }))
}

pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::permissive();

    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(api_health))
        .route("/v1/messages", post(crate::forward::anthropic_messages))
        .route("/v1/messages/count_tokens", post(crate::forward::count_tokens))
        .route("/v1/models", get(crate::forward::list_models))
        .route("/v1/usage", get(crate::forward::usage_summary))
        .route(
            "/v1beta/models/:model",
            get(crate::forward::get_model).post(crate::forward::gemini_generate),
        )
        .route("/v1beta/models", get(crate::forward::list_models_v1beta))
        .route("/sora/v1/chat/completions", post(crate::forward::sora_chat_completions))
        .route("/sora/media/*path", get(crate::forward::sora_media))
        .route("/sora/media-signed/*path", get(crate::forward::sora_media_signed))
        .route(
            "/antigravity/v1beta/models/:model",
            get(crate::forward::get_model).post(crate::forward::antigravity_generate),
        )
        .route("/antigravity/v1beta/models", get(crate::forward::list_models_v1beta))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) {
    let addr: SocketAddr = state
        .gateway
        .bind_addr
        .parse()
        .unwrap_or_else(|_| "0.0.0.0:8787".parse().unwrap());
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    logger::info("server", &format!("listening on {addr}"));
    let router = app(state);
    axum::serve(listener, router).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.groups.push(Group { id: "g1".into(), ..Default::default() });
        s
    }

    #[tokio::test]
    async fn health_ok() {
        let state = AppState::new(settings());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state);
        let h = tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        let url = format!("http://{addr}");
        let r = reqwest::get(format!("{url}/health")).await.unwrap();
        let body = r.json::<serde_json::Value>().await.unwrap();
        assert_eq!(body["status"], "ok");
        drop(h);
    }

    #[tokio::test]
    async fn api_keys_are_indexed_by_precomputed_hash() {
        let mut s = settings();
        s.api_keys.push(ApiKey {
            id: "k1".into(),
            key_hash: "deadbeef".into(),
            user_id: "u1".into(),
            group_id: "g1".into(),
            status: crate::domain::api_key::ApiKeyStatus::Active,
            ip_allow: vec![],
            ip_deny: vec![],
            quota_usd: None,
            quota_used_usd: 0.0,
            expires_at: None,
        });
        let state = AppState::new(s);
        assert!(state.api_keys.contains_key("deadbeef"));
    }
}

//! Runtime configuration.
//!
//! Loaded once from `<data_dir>/relay-gateway/settings.toml`, following the
//! teacher's read-or-default / persist-on-first-run shape. Holds the
//! gateway's own tunables plus the seed accounts/groups/API keys used ahead
//! of the (out-of-scope) admin CRUD surface.

use dirs::data_dir;
use std::{fs, path::PathBuf};

use crate::domain::{Account, ApiKey, Group, UserSubscription};

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub accounts: Vec<Account>,
    pub groups: Vec<Group>,
    pub api_keys: Vec<ApiKey>,
    pub subscriptions: Vec<UserSubscription>,
    pub gateway: GatewaySettings,
    pub proxy: Option<ProxyConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            groups: Vec::new(),
            api_keys: Vec::new(),
            subscriptions: Vec::new(),
            gateway: GatewaySettings::default(),
            proxy: None,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct GatewaySettings {
    pub bind_addr: String,
    pub stream_keepalive_interval_secs: u64,
    pub stream_data_interval_timeout_secs: u64,
    pub max_line_size_bytes: usize,
    pub response_header_timeout_secs: u64,
    pub upstream_response_read_max_bytes: usize,
    pub max_account_switches: u32,
    pub max_account_switches_gemini: u32,
    pub single_account_retry_budget_secs: u64,
    pub connection_pool_isolation: IsolationMode,
    pub max_upstream_clients: usize,
    pub client_idle_ttl_secs: u64,
    pub concurrency_slot_ttl_minutes: u64,
    pub user_max_concurrency: u32,
    pub user_max_wait_cap: u32,
    pub sticky_session_max_waiting: u32,
    pub sticky_session_wait_timeout_secs: u64,
    pub sticky_session_idle_timeout_secs: u64,
    pub fallback_wait_timeout_secs: u64,
    pub fallback_max_waiting: u32,
    pub fallback_selection_mode: FallbackSelectionMode,
    pub db_fallback_enabled: bool,
    pub db_fallback_qps: u32,
    pub failover_on_400: bool,
    pub overload_cooldown_minutes: i64,
    pub usage_record: UsageRecordSettings,
    pub idempotency: IdempotencySettings,
    /// HMAC key for `/sora/media-signed/*` query-param signatures (`sig`+`expires`).
    pub media_signing_secret: String,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    Proxy,
    Account,
    AccountProxy,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FallbackSelectionMode {
    LastUsed,
    Random,
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct UsageRecordSettings {
    pub worker_count: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub task_timeout_secs: u64,
    pub overflow_policy: OverflowPolicy,
    pub overflow_sample_percent: u8,
    pub auto_scale_enabled: bool,
    pub auto_scale_check_interval_secs: u64,
    pub auto_scale_up_queue_percent: u8,
    pub auto_scale_down_queue_percent: u8,
    pub auto_scale_up_step: usize,
    pub auto_scale_down_step: usize,
    pub auto_scale_cooldown_secs: u64,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    Drop,
    Sample,
    Sync,
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct IdempotencySettings {
    pub default_ttl_secs: i64,
    pub system_operation_ttl_secs: i64,
    pub processing_timeout_secs: i64,
    pub failed_retry_backoff_secs: i64,
    pub max_stored_response_len: usize,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 86400,
            system_operation_ttl_secs: 3600,
            processing_timeout_secs: 30,
            failed_retry_backoff_secs: 5,
            max_stored_response_len: 64 * 1024,
        }
    }
}

impl Default for UsageRecordSettings {
    fn default() -> Self {
        Self {
            worker_count: 2,
            min_workers: 1,
            max_workers: 16,
            queue_size: 1024,
            task_timeout_secs: 30,
            overflow_policy: OverflowPolicy::Sample,
            overflow_sample_percent: 10,
            auto_scale_enabled: true,
            auto_scale_check_interval_secs: 5,
            auto_scale_up_queue_percent: 80,
            auto_scale_down_queue_percent: 20,
            auto_scale_up_step: 2,
            auto_scale_down_step: 1,
            auto_scale_cooldown_secs: 15,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8787".to_string(),
            stream_keepalive_interval_secs: 10,
            stream_data_interval_timeout_secs: 180,
            max_line_size_bytes: 1024 * 1024,
            response_header_timeout_secs: 600,
            upstream_response_read_max_bytes: 8 * 1024 * 1024,
            max_account_switches: 10,
            max_account_switches_gemini: 3,
            single_account_retry_budget_secs: 30,
            connection_pool_isolation: IsolationMode::Account,
            max_upstream_clients: 256,
            client_idle_ttl_secs: 600,
            concurrency_slot_ttl_minutes: 30,
            user_max_concurrency: 5,
            user_max_wait_cap: 100,
            sticky_session_max_waiting: 3,
            sticky_session_wait_timeout_secs: 120,
            sticky_session_idle_timeout_secs: 300,
            fallback_wait_timeout_secs: 30,
            fallback_max_waiting: 100,
            fallback_selection_mode: FallbackSelectionMode::LastUsed,
            db_fallback_enabled: true,
            db_fallback_qps: 5,
            failover_on_400: false,
            overload_cooldown_minutes: 10,
            usage_record: UsageRecordSettings::default(),
            idempotency: IdempotencySettings::default(),
            media_signing_secret: String::new(),
        }
    }
}

/// Proxy configuration for the upstream HTTP client, kept from the teacher
/// verbatim (system/custom/none + bypass list + basic auth).
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bypass: Option<Vec<String>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_type: "system".to_string(),
            url: None,
            username: None,
            password: None,
            bypass: None,
        }
    }
}

fn settings_path() -> PathBuf {
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("relay-gateway");
    fs::create_dir_all(&p).ok();
    p.push("settings.toml");
    p
}

/// Clamp a tunable to its valid bound, logging a warning rather than
/// failing startup over one bad value.
fn clamp_range(name: &str, value: u64, zero_ok: bool, min: u64, max: u64) -> u64 {
    if zero_ok && value == 0 {
        return 0;
    }
    if value < min || value > max {
        crate::logger::warn(
            "config",
            &format!("{name}={value} out of range [{min},{max}], clamping"),
        );
        return value.clamp(min, max);
    }
    value
}

fn validate(cfg: &mut GatewaySettings) {
    cfg.stream_data_interval_timeout_secs = clamp_range(
        "gateway.stream_data_interval_timeout_secs",
        cfg.stream_data_interval_timeout_secs,
        true,
        30,
        300,
    );
    cfg.stream_keepalive_interval_secs = clamp_range(
        "gateway.stream_keepalive_interval_secs",
        cfg.stream_keepalive_interval_secs,
        true,
        5,
        30,
    );
    if cfg.max_line_size_bytes < 1024 * 1024 {
        crate::logger::warn("config", "gateway.max_line_size_bytes below 1MiB floor, clamping");
        cfg.max_line_size_bytes = 1024 * 1024;
    }
}

pub fn load() -> Settings {
    let p = settings_path();
    let mut cfg = if p.exists() {
        let s = fs::read_to_string(&p).unwrap_or_default();
        toml::from_str(&s).unwrap_or_else(|e| {
            eprintln!("failed to parse config, using defaults: {e}");
            Settings::default()
        })
    } else {
        Settings::default()
    };

    validate(&mut cfg.gateway);
    cfg
}

pub fn save(cfg: &Settings) -> Result<(), String> {
    let p = settings_path();
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config directory: {e}"))?;
    }
    let s = toml::to_string_pretty(cfg).map_err(|e| format!("failed to serialize config: {e}"))?;
    fs::write(&p, &s).map_err(|e| format!("failed to write config file to {p:?}: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation_unchanged() {
        let mut gw = GatewaySettings::default();
        let before = gw.stream_data_interval_timeout_secs;
        validate(&mut gw);
        assert_eq!(before, gw.stream_data_interval_timeout_secs);
    }

    #[test]
    fn out_of_range_tunable_is_clamped_not_rejected() {
        let mut gw = GatewaySettings::default();
        gw.stream_data_interval_timeout_secs = 5;
        validate(&mut gw);
        assert_eq!(gw.stream_data_interval_timeout_secs, 30);
    }

    #[test]
    fn zero_is_a_valid_disable_sentinel() {
        let mut gw = GatewaySettings::default();
        gw.stream_keepalive_interval_secs = 0;
        validate(&mut gw);
        assert_eq!(gw.stream_keepalive_interval_secs, 0);
    }
}

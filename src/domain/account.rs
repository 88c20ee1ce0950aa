//! Account records and the account state machine.
//!
//! An account wraps a single upstream credential. Its schedulability is
//! governed by a handful of orthogonal expiry timers rather than a single
//! enum, because a real account can be simultaneously rate-limited on one
//! model and perfectly healthy on another.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Anthropic,
    OpenAI,
    Gemini,
    Antigravity,
    Sora,
}

impl Platform {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Platform::Anthropic),
            "openai" => Some(Platform::OpenAI),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            "sora" => Some(Platform::Sora),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::OpenAI => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
            Platform::Sora => "sora",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    OAuth,
    SetupToken,
    ApiKey,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
    Error,
}

/// Input events that drive the account's timers. Mirrors the upstream
/// failure taxonomy the forwarder classifies responses into.
#[derive(Debug, Clone)]
pub enum AccountStateEvent {
    RateLimited { reset_at: i64 },
    Overloaded { until: i64 },
    ModelLimited { scope: String, reset_at: i64 },
    TempUnschedulable { until: i64, reason: String },
    SessionWindowExpired,
    AdminClear,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A single upstream credential and its scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub group_id: String,
    pub platform: Platform,
    pub account_type: AccountType,
    pub status: AccountStatus,
    pub schedulable: bool,
    pub concurrency: u32,
    pub priority: i32,
    pub last_used_at: i64,
    pub rate_limit_reset_at: Option<i64>,
    pub overloaded_until: Option<i64>,
    pub temp_unschedulable_until: Option<i64>,
    pub temp_unschedulable_reason: Option<String>,
    pub session_window_start: Option<i64>,
    pub session_window_end: Option<i64>,
    /// model-scope (including "-thinking" suffixed scopes) -> reset_at epoch seconds
    #[serde(default)]
    pub model_rate_limits: HashMap<String, i64>,
    /// client-facing model glob -> upstream model name. Empty means "accept
    /// any model, forward unchanged".
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    pub credentials: String,
    pub rate_multiplier: f64,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            id: String::new(),
            group_id: String::new(),
            platform: Platform::Anthropic,
            account_type: AccountType::ApiKey,
            status: AccountStatus::Active,
            schedulable: true,
            concurrency: 1,
            priority: 100,
            last_used_at: 0,
            rate_limit_reset_at: None,
            overloaded_until: None,
            temp_unschedulable_until: None,
            temp_unschedulable_reason: None,
            session_window_start: None,
            session_window_end: None,
            model_rate_limits: HashMap::new(),
            model_mapping: HashMap::new(),
            credentials: String::new(),
            rate_multiplier: 1.0,
        }
    }
}

/// Built-in Antigravity model whitelist used when an account has no explicit
/// `model_mapping` configured. Antigravity is a Gemini-derived platform whose
/// model catalogue the gateway knows ahead of time.
const DEFAULT_ANTIGRAVITY_MODELS: &[&str] = &[
    "antigravity-flash*",
    "antigravity-pro*",
];

fn glob_match(pattern: &str, value: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == value,
        Some((prefix, suffix)) => {
            value.len() >= prefix.len() + suffix.len()
                && value.starts_with(prefix)
                && value.ends_with(suffix)
        }
    }
}

impl Account {
    /// `now` is injected so state-machine decisions are deterministic in tests.
    pub fn is_schedulable(&self, now_ts: i64) -> bool {
        if self.status != AccountStatus::Active || !self.schedulable {
            return false;
        }
        if self.rate_limit_reset_at.map(|t| t > now_ts).unwrap_or(false) {
            return false;
        }
        if self.overloaded_until.map(|t| t > now_ts).unwrap_or(false) {
            return false;
        }
        if self
            .temp_unschedulable_until
            .map(|t| t > now_ts)
            .unwrap_or(false)
        {
            return false;
        }
        if let Some(end) = self.session_window_end {
            if end <= now_ts {
                return false;
            }
        }
        true
    }

    /// Scope key for per-model rate limits. Thinking-enabled requests get a
    /// distinct scope so a thinking-mode rate limit does not also block
    /// plain completions on the same model.
    pub fn model_scope(model: &str, thinking: bool) -> String {
        if thinking {
            format!("{model}-thinking")
        } else {
            model.to_string()
        }
    }

    pub fn model_scope_limited(&self, scope: &str, now_ts: i64) -> bool {
        self.model_rate_limits
            .get(scope)
            .map(|reset_at| *reset_at > now_ts)
            .unwrap_or(false)
    }

    /// Whether this account's credential is permitted to serve `model`.
    pub fn supports_model(&self, model: &str) -> bool {
        if !self.model_mapping.is_empty() {
            return self.model_mapping.keys().any(|pat| glob_match(pat, model));
        }
        if self.platform == Platform::Antigravity {
            return DEFAULT_ANTIGRAVITY_MODELS
                .iter()
                .any(|pat| glob_match(pat, model));
        }
        true
    }

    /// Resolve the upstream model name to forward, honoring `model_mapping`.
    pub fn resolve_upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        for (pat, upstream) in &self.model_mapping {
            if glob_match(pat, model) {
                return upstream;
            }
        }
        model
    }

    pub fn apply_event(&mut self, event: AccountStateEvent) {
        match event {
            AccountStateEvent::RateLimited { reset_at } => {
                self.rate_limit_reset_at = Some(reset_at);
            }
            AccountStateEvent::Overloaded { until } => {
                self.overloaded_until = Some(until);
            }
            AccountStateEvent::ModelLimited { scope, reset_at } => {
                self.model_rate_limits.insert(scope, reset_at);
            }
            AccountStateEvent::TempUnschedulable { until, reason } => {
                self.temp_unschedulable_until = Some(until);
                self.temp_unschedulable_reason = Some(reason);
            }
            AccountStateEvent::SessionWindowExpired => {
                self.session_window_end = Some(now() - 1);
            }
            AccountStateEvent::AdminClear => {
                self.rate_limit_reset_at = None;
                self.overloaded_until = None;
                self.temp_unschedulable_until = None;
                self.temp_unschedulable_reason = None;
                self.model_rate_limits.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_account() -> Account {
        Account {
            id: "acc-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn active_account_with_no_timers_is_schedulable() {
        let acc = base_account();
        assert!(acc.is_schedulable(1000));
    }

    #[test]
    fn rate_limited_account_is_unschedulable_until_reset() {
        let mut acc = base_account();
        acc.apply_event(AccountStateEvent::RateLimited { reset_at: 2000 });
        assert!(!acc.is_schedulable(1000));
        assert!(acc.is_schedulable(2001));
    }

    #[test]
    fn model_scope_limit_does_not_block_other_models() {
        let mut acc = base_account();
        acc.apply_event(AccountStateEvent::ModelLimited {
            scope: Account::model_scope("claude-3-opus", false),
            reset_at: 2000,
        });
        assert!(acc.is_schedulable(1000));
        assert!(acc.model_scope_limited(&Account::model_scope("claude-3-opus", false), 1000));
        assert!(!acc.model_scope_limited(&Account::model_scope("claude-3-sonnet", false), 1000));
    }

    #[test]
    fn thinking_mode_uses_distinct_scope_key() {
        assert_eq!(
            Account::model_scope("claude-3-opus", true),
            "claude-3-opus-thinking"
        );
        assert_ne!(
            Account::model_scope("claude-3-opus", true),
            Account::model_scope("claude-3-opus", false)
        );
    }

    #[test]
    fn session_window_expiry_filters_account() {
        let mut acc = base_account();
        acc.session_window_end = Some(500);
        assert!(!acc.is_schedulable(1000));
    }

    #[test]
    fn model_mapping_glob_matches() {
        let mut acc = base_account();
        acc.model_mapping
            .insert("claude-3-*".to_string(), "claude-3-opus-20240229".to_string());
        assert!(acc.supports_model("claude-3-haiku"));
        assert!(!acc.supports_model("gpt-4"));
        assert_eq!(acc.resolve_upstream_model("claude-3-haiku"), "claude-3-opus-20240229");
    }

    #[test]
    fn antigravity_falls_back_to_default_whitelist() {
        let mut acc = base_account();
        acc.platform = Platform::Antigravity;
        assert!(acc.supports_model("antigravity-pro-1"));
        assert!(!acc.supports_model("gpt-4"));
    }

    #[test]
    fn admin_clear_resets_all_timers() {
        let mut acc = base_account();
        acc.apply_event(AccountStateEvent::RateLimited { reset_at: 5000 });
        acc.apply_event(AccountStateEvent::Overloaded { until: 5000 });
        acc.apply_event(AccountStateEvent::AdminClear);
        assert!(acc.is_schedulable(1000));
    }
}

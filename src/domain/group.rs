use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::account::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    Standard,
    Subscription,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionLimits {
    pub daily_usd: Option<f64>,
    pub weekly_usd: Option<f64>,
    pub monthly_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub platform: Platform,
    pub subscription_type: SubscriptionType,
    pub rate_multiplier: f64,
    #[serde(default)]
    pub limits: SubscriptionLimits,
    /// A group whose accounts are only used when this group rejects a
    /// request as structurally too large (e.g. a prompt that exceeds an
    /// Antigravity context window).
    pub fallback_group_id_on_invalid_request: Option<String>,
    /// model glob -> preferred account ids, consulted before plain priority.
    #[serde(default)]
    pub model_routing: HashMap<String, Vec<String>>,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            id: String::new(),
            platform: Platform::Anthropic,
            subscription_type: SubscriptionType::Standard,
            rate_multiplier: 1.0,
            limits: SubscriptionLimits::default(),
            fallback_group_id_on_invalid_request: None,
            model_routing: HashMap::new(),
        }
    }
}

impl Group {
    /// A fallback group must be Anthropic, non-subscription, and must not
    /// itself chain to another fallback, per the failover controller's
    /// single-hop rule.
    pub fn valid_invalid_request_fallback(&self) -> bool {
        self.platform == Platform::Anthropic
            && self.subscription_type == SubscriptionType::Standard
            && self.fallback_group_id_on_invalid_request.is_none()
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSubscription {
    pub user_id: String,
    pub group_id: String,
    pub status: SubscriptionStatus,
    pub daily_window_start: i64,
    pub daily_spent_usd: f64,
    pub weekly_window_start: i64,
    pub weekly_spent_usd: f64,
    pub monthly_window_start: i64,
    pub monthly_spent_usd: f64,
}

#[derive(Debug, Clone, Copy)]
pub enum BillingIneligibleReason {
    InsufficientBalance,
    UsageLimitExceeded,
    SubscriptionNotFound,
    SubscriptionInvalid,
}

impl BillingIneligibleReason {
    pub fn code(&self) -> &'static str {
        match self {
            BillingIneligibleReason::InsufficientBalance => "INSUFFICIENT_BALANCE",
            BillingIneligibleReason::UsageLimitExceeded => "USAGE_LIMIT_EXCEEDED",
            BillingIneligibleReason::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            BillingIneligibleReason::SubscriptionInvalid => "SUBSCRIPTION_INVALID",
        }
    }
}

impl UserSubscription {
    /// All configured windows must have remaining budget for the
    /// subscription to authorize a request.
    pub fn has_remaining_budget(
        &self,
        daily_limit: Option<f64>,
        weekly_limit: Option<f64>,
        monthly_limit: Option<f64>,
    ) -> Result<(), BillingIneligibleReason> {
        if self.status != SubscriptionStatus::Active {
            return Err(BillingIneligibleReason::SubscriptionInvalid);
        }
        let exceeded = |limit: Option<f64>, spent: f64| limit.map(|l| spent >= l).unwrap_or(false);
        if exceeded(daily_limit, self.daily_spent_usd)
            || exceeded(weekly_limit, self.weekly_spent_usd)
            || exceeded(monthly_limit, self.monthly_spent_usd)
        {
            return Err(BillingIneligibleReason::UsageLimitExceeded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub() -> UserSubscription {
        UserSubscription {
            user_id: "u1".into(),
            group_id: "g1".into(),
            status: SubscriptionStatus::Active,
            daily_window_start: 0,
            daily_spent_usd: 0.0,
            weekly_window_start: 0,
            weekly_spent_usd: 0.0,
            monthly_window_start: 0,
            monthly_spent_usd: 0.0,
        }
    }

    #[test]
    fn exhausted_daily_window_blocks_request() {
        let mut s = sub();
        s.daily_spent_usd = 10.0;
        let res = s.has_remaining_budget(Some(10.0), None, None);
        assert!(matches!(res, Err(BillingIneligibleReason::UsageLimitExceeded)));
    }

    #[test]
    fn inactive_subscription_is_invalid() {
        let mut s = sub();
        s.status = SubscriptionStatus::Expired;
        let res = s.has_remaining_budget(None, None, None);
        assert!(matches!(res, Err(BillingIneligibleReason::SubscriptionInvalid)));
    }

    #[test]
    fn within_all_windows_is_ok() {
        let s = sub();
        assert!(s.has_remaining_budget(Some(10.0), Some(50.0), Some(200.0)).is_ok());
    }
}

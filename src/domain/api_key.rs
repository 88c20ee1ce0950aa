use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key_hash: String,
    pub user_id: String,
    pub group_id: String,
    pub status: ApiKeyStatus,
    pub ip_allow: Vec<String>,
    pub ip_deny: Vec<String>,
    pub quota_usd: Option<f64>,
    pub quota_used_usd: f64,
    pub expires_at: Option<i64>,
}

impl ApiKey {
    pub fn is_expired(&self, now_ts: i64) -> bool {
        self.expires_at.map(|t| t <= now_ts).unwrap_or(false)
    }

    pub fn within_quota(&self) -> bool {
        match self.quota_usd {
            Some(limit) => self.quota_used_usd < limit,
            None => true,
        }
    }

    pub fn ip_allowed(&self, ip: &str) -> bool {
        if self.ip_deny.iter().any(|d| d == ip) {
            return false;
        }
        if self.ip_allow.is_empty() {
            return true;
        }
        self.ip_allow.iter().any(|a| a == ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ApiKey {
        ApiKey {
            id: "key-1".into(),
            key_hash: "hash".into(),
            user_id: "user-1".into(),
            group_id: "group-1".into(),
            status: ApiKeyStatus::Active,
            ip_allow: vec![],
            ip_deny: vec![],
            quota_usd: None,
            quota_used_usd: 0.0,
            expires_at: None,
        }
    }

    #[test]
    fn quota_exhaustion_blocks_key() {
        let mut k = key();
        k.quota_usd = Some(1.0);
        k.quota_used_usd = 1.0;
        assert!(!k.within_quota());
    }

    #[test]
    fn ip_allowlist_restricts_access() {
        let mut k = key();
        k.ip_allow = vec!["10.0.0.1".to_string()];
        assert!(k.ip_allowed("10.0.0.1"));
        assert!(!k.ip_allowed("10.0.0.2"));
    }

    #[test]
    fn ip_denylist_overrides_allow() {
        let mut k = key();
        k.ip_deny = vec!["10.0.0.1".to_string()];
        assert!(!k.ip_allowed("10.0.0.1"));
    }
}

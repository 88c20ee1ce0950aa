//! Sticky Session Cache (component C4)
//!
//! Binds a session fingerprint to the account that served it, so a
//! multi-turn conversation keeps talking to the same upstream credential
//! (important for providers that cache conversation state server-side).
//!
//! The teacher has no direct analogue (its accounts are single-user local
//! credentials with no session affinity); this is grounded on the same
//! `Arc<Mutex<HashMap<..>>>` shared-state idiom `forward/limits.rs` uses for
//! its process-wide counters, generalized to carry a TTL per entry so it can
//! later be swapped for a cross-replica KV store without changing callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

struct Binding {
    account_id: String,
    expires_at: Instant,
}

pub struct StickySessionCache {
    bindings: Mutex<HashMap<String, Binding>>,
    ttl: Duration,
}

impl StickySessionCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            bindings: Mutex::new(HashMap::new()),
            ttl,
        })
    }

    fn key(group_id: &str, session_key: &str) -> String {
        format!("{group_id}\u{0}{session_key}")
    }

    pub async fn get(&self, group_id: &str, session_key: &str) -> Option<String> {
        if session_key.is_empty() {
            return None;
        }
        let key = Self::key(group_id, session_key);
        let bindings = self.bindings.lock().await;
        let binding = bindings.get(&key)?;
        if binding.expires_at <= Instant::now() {
            return None;
        }
        Some(binding.account_id.clone())
    }

    pub async fn bind(&self, group_id: &str, session_key: &str, account_id: &str) {
        if session_key.is_empty() {
            return;
        }
        let key = Self::key(group_id, session_key);
        let mut bindings = self.bindings.lock().await;
        bindings.insert(
            key,
            Binding {
                account_id: account_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub async fn invalidate(&self, group_id: &str, session_key: &str) {
        let key = Self::key(group_id, session_key);
        self.bindings.lock().await.remove(&key);
    }

    /// Drop expired entries; intended for a periodic background sweep.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        self.bindings.lock().await.retain(|_, b| b.expires_at > now);
    }
}

/// Gemini CLI session key: `SHA256(privileged_user_id ":" tmp_dir_hash)`,
/// namespaced so it cannot collide with a generic session key.
pub fn gemini_session_key(privileged_user_id: &str, tmp_dir_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(privileged_user_id.as_bytes());
    hasher.update(b":");
    hasher.update(tmp_dir_hash.as_bytes());
    format!("gemini:{:x}", hasher.finalize())
}

/// Generic session key derived from request identity when the caller has no
/// provider-native session concept.
pub fn generic_session_key(api_key_id: &str, client_ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key_id.as_bytes());
    hasher.update(b"|");
    hasher.update(client_ip.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_then_get_round_trips() {
        let cache = StickySessionCache::new(Duration::from_secs(60));
        cache.bind("group-1", "session-a", "acc-1").await;
        assert_eq!(cache.get("group-1", "session-a").await, Some("acc-1".to_string()));
    }

    #[tokio::test]
    async fn expired_binding_is_not_returned() {
        let cache = StickySessionCache::new(Duration::from_millis(10));
        cache.bind("group-1", "session-a", "acc-1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("group-1", "session-a").await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_binding() {
        let cache = StickySessionCache::new(Duration::from_secs(60));
        cache.bind("group-1", "session-a", "acc-1").await;
        cache.invalidate("group-1", "session-a").await;
        assert_eq!(cache.get("group-1", "session-a").await, None);
    }

    #[tokio::test]
    async fn empty_session_key_never_binds() {
        let cache = StickySessionCache::new(Duration::from_secs(60));
        cache.bind("group-1", "", "acc-1").await;
        assert_eq!(cache.get("group-1", "").await, None);
    }

    #[test]
    fn gemini_session_key_is_namespaced_and_deterministic() {
        let a = gemini_session_key("user-1", "tmphash");
        let b = gemini_session_key("user-1", "tmphash");
        assert_eq!(a, b);
        assert!(a.starts_with("gemini:"));
    }
}

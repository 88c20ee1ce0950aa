//! Idempotency Coordinator (component C9)
//!
//! Gives an `Idempotency-Key` request header at-most-once semantics across
//! retried client calls: a first call with a key marks it `processing`; a
//! concurrent or retried call with the same key is told to wait (409 +
//! `Retry-After`) or replays the stored response once the first completes.
//!
//! Grounded on `db.rs`'s `idempotency_*` functions, which hold the actual
//! state machine storage; this module only derives the record key and
//! interprets the lookup result into a caller-facing outcome.

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::IdempotencySettings;
use crate::db::{self, IdempotencyLookup};

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Derives the storage key from actor scope, method, route and the caller's
/// idempotency key, so the same raw key from two different users/routes
/// never collides.
pub fn record_key(actor_scope: &str, method: &str, route: &str, idempotency_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(actor_scope.as_bytes());
    hasher.update(b"|");
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(route.as_bytes());
    hasher.update(b"|");
    hasher.update(idempotency_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub enum Outcome {
    /// No prior attempt found (or its record expired); proceed and call
    /// `complete`/`fail` when done.
    Proceed,
    /// A completed response is stored; replay it verbatim.
    Replay { status: u16, body: String },
    /// Another attempt is in flight; tell the caller to back off.
    InProgress { retry_after_secs: i64 },
    /// The prior attempt failed; a short backoff is enforced before retry.
    RecentlyFailed { retry_after_secs: i64 },
}

pub struct IdempotencyCoordinator {
    cfg: IdempotencySettings,
}

impl IdempotencyCoordinator {
    pub fn new(cfg: IdempotencySettings) -> Self {
        Self { cfg }
    }

    pub fn begin(&self, actor_scope: &str, method: &str, route: &str, idempotency_key: &str, is_system_operation: bool) -> (String, Outcome) {
        let key = record_key(actor_scope, method, route, idempotency_key);
        let now_ts = now();
        let ttl = if is_system_operation {
            self.cfg.system_operation_ttl_secs
        } else {
            self.cfg.processing_timeout_secs
        };

        let outcome = match db::idempotency_begin(&key, now_ts, ttl) {
            IdempotencyLookup::Absent => Outcome::Proceed,
            IdempotencyLookup::Processing { expires_at } => Outcome::InProgress {
                retry_after_secs: (expires_at - now_ts).max(1),
            },
            IdempotencyLookup::Completed { status, body } => Outcome::Replay {
                status: status as u16,
                body,
            },
            IdempotencyLookup::Failed { retry_after } => Outcome::RecentlyFailed {
                retry_after_secs: (retry_after - now_ts).max(1),
            },
        };
        (key, outcome)
    }

    pub fn complete(&self, key: &str, status: u16, body: &str) {
        let body = if body.len() > self.cfg.max_stored_response_len {
            &body[..self.cfg.max_stored_response_len]
        } else {
            body
        };
        db::idempotency_complete(key, status as i64, body, now(), self.cfg.default_ttl_secs);
    }

    pub fn fail(&self, key: &str) {
        db::idempotency_fail(key, now(), self.cfg.failed_retry_backoff_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_key_is_scoped_per_route_and_actor() {
        let a = record_key("user:1", "POST", "/v1/messages", "abc");
        let b = record_key("user:2", "POST", "/v1/messages", "abc");
        let c = record_key("user:1", "POST", "/v1/other", "abc");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn same_inputs_produce_same_key() {
        let a = record_key("user:1", "POST", "/v1/messages", "abc");
        let b = record_key("user:1", "POST", "/v1/messages", "abc");
        assert_eq!(a, b);
    }

    #[test]
    fn fresh_key_proceeds_then_replays_after_completion() {
        let dir = std::env::temp_dir().join(format!("relay-gateway-idem-test-{}", std::process::id()));
        std::env::set_var("HOME", &dir);
        crate::db::init();
        let coordinator = IdempotencyCoordinator::new(IdempotencySettings::default());
        let (key, outcome) = coordinator.begin("user:1", "POST", "/v1/messages", "k1", false);
        assert!(matches!(outcome, Outcome::Proceed));
        coordinator.complete(&key, 200, "{\"ok\":true}");
        let (_, replay) = coordinator.begin("user:1", "POST", "/v1/messages", "k1", false);
        assert!(matches!(replay, Outcome::Replay { status: 200, .. }));
        std::fs::remove_dir_all(&dir).ok();
    }
}

//! Scheduler (component C3)
//!
//! Given a group, a requested model, a session key and an excluded-account
//! set, selects a schedulable account honoring sticky affinity, priority
//! ordering and load, with a bounded-wait fallback and a rate-limited
//! direct-DB sweep as a last resort.
//!
//! Grounded on the teacher's `forward/routing.rs` `ModelRouter` (priority
//! ordering + fallback list) and the account-pool `get_available` pattern
//! from the corpus's `AccountPool`/`AccountSelectionStrategy` examples,
//! generalized with the sticky layer and bounded waiting the teacher itself
//! does not need (its accounts are single-user local credentials).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::concurrency::{ArbiterError, ConcurrencyArbiter, Scope, SlotGuard};
use crate::config::{FallbackSelectionMode, GatewaySettings};
use crate::db;
use crate::domain::{Account, AccountStateEvent};
use crate::logger;
use crate::sticky::StickySessionCache;

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// In-memory account index, backed by `db` for the rate-limited fallback
/// sweep and for durability across restarts.
pub struct AccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl AccountStore {
    pub fn new(seed: Vec<Account>) -> Arc<Self> {
        let mut map = HashMap::new();
        for acc in seed {
            map.insert(acc.id.clone(), acc);
        }
        Arc::new(Self {
            accounts: RwLock::new(map),
        })
    }

    pub async fn get(&self, id: &str) -> Option<Account> {
        self.accounts.read().await.get(id).cloned()
    }

    pub async fn list_for_group(&self, group_id: &str) -> Vec<Account> {
        self.accounts
            .read()
            .await
            .values()
            .filter(|a| a.group_id == group_id)
            .cloned()
            .collect()
    }

    pub async fn apply_event(&self, account_id: &str, event: AccountStateEvent) {
        let mut accounts = self.accounts.write().await;
        if let Some(acc) = accounts.get_mut(account_id) {
            acc.apply_event(event);
            db::upsert_account(acc);
        }
    }

    pub async fn touch_last_used(&self, account_id: &str) {
        let mut accounts = self.accounts.write().await;
        if let Some(acc) = accounts.get_mut(account_id) {
            acc.last_used_at = now();
        }
    }

    pub async fn merge_from_db(&self, fetched: Vec<Account>) {
        let mut accounts = self.accounts.write().await;
        for acc in fetched {
            accounts.entry(acc.id.clone()).or_insert(acc);
        }
    }
}

#[derive(Debug)]
pub enum SchedulerError {
    NoAvailableAccounts,
    WaitTimeout,
}

pub struct Selection {
    pub account: Account,
    pub sticky_bound: bool,
    pub slot_guard: SlotGuard,
}

/// Token-bucket-ish QPS gate for the db-fallback layer so a thundering herd
/// of exhausted requests cannot turn into a sqlite storm.
pub struct DbFallbackLimiter {
    last_allowed_ms: AtomicI64,
    min_interval_ms: i64,
}

impl DbFallbackLimiter {
    pub fn new(qps: u32) -> Self {
        let min_interval_ms = if qps == 0 { i64::MAX } else { 1000 / qps as i64 };
        Self {
            last_allowed_ms: AtomicI64::new(0),
            min_interval_ms,
        }
    }

    fn try_acquire(&self, now_ms: i64) -> bool {
        let last = self.last_allowed_ms.load(Ordering::Relaxed);
        if now_ms - last >= self.min_interval_ms {
            self.last_allowed_ms.store(now_ms, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

pub struct Scheduler {
    pub accounts: Arc<AccountStore>,
    pub sticky: Arc<StickySessionCache>,
    pub arbiter: Arc<ConcurrencyArbiter>,
    pub db_fallback_limiter: DbFallbackLimiter,
}

fn rank(accounts: &[Account]) -> Vec<Account> {
    let mut ranked = accounts.to_vec();
    ranked.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.last_used_at.cmp(&b.last_used_at)));
    ranked
}

impl Scheduler {
    pub fn new(
        accounts: Arc<AccountStore>,
        sticky: Arc<StickySessionCache>,
        arbiter: Arc<ConcurrencyArbiter>,
        db_fallback_qps: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            sticky,
            arbiter,
            db_fallback_limiter: DbFallbackLimiter::new(db_fallback_qps),
        })
    }

    /// Select and acquire a concurrency slot on a schedulable account. Binds
    /// the sticky cache after a successful slot acquisition.
    pub async fn select_and_acquire(
        &self,
        group_id: &str,
        session_key: &str,
        requested_model: &str,
        thinking: bool,
        excluded: &HashSet<String>,
        cfg: &GatewaySettings,
    ) -> Result<Selection, SchedulerError> {
        let now_ts = now();
        let model_scope = Account::model_scope(requested_model, thinking);

        // 1. Sticky layer.
        if let Some(account_id) = self.sticky.get(group_id, session_key).await {
            if !excluded.contains(&account_id) {
                if let Some(acc) = self.accounts.get(&account_id).await {
                    if acc.is_schedulable(now_ts)
                        && !acc.model_scope_limited(&model_scope, now_ts)
                        && acc.supports_model(requested_model)
                    {
                        if let Ok(guard) = self.try_acquire_only(&acc).await {
                            self.accounts.touch_last_used(&acc.id).await;
                            self.sticky.bind(group_id, session_key, &acc.id).await;
                            return Ok(Selection { account: acc, sticky_bound: true, slot_guard: guard });
                        }
                        // At capacity: wait briefly in the sticky-specific
                        // bounded line rather than immediately falling
                        // through to a different account.
                        if self
                            .arbiter
                            .try_enter_wait_line(Scope::Account, &acc.id, cfg.sticky_session_max_waiting)
                            .await
                        {
                            let waited = self
                                .arbiter
                                .acquire_slot_with_wait(
                                    Scope::Account,
                                    &acc.id,
                                    acc.concurrency,
                                    Some(Duration::from_secs(cfg.sticky_session_wait_timeout_secs)),
                                    false,
                                    None,
                                )
                                .await;
                            if let Ok(guard) = waited {
                                self.accounts.touch_last_used(&acc.id).await;
                                self.sticky.bind(group_id, session_key, &acc.id).await;
                                return Ok(Selection { account: acc, sticky_bound: true, slot_guard: guard });
                            }
                        }
                    }
                }
            }
        }

        // 2. Primary layer: schedulable candidates supporting the model.
        let candidates = self.accounts.list_for_group(group_id).await;
        let primary: Vec<Account> = candidates
            .iter()
            .filter(|a| {
                !excluded.contains(&a.id)
                    && a.is_schedulable(now_ts)
                    && !a.model_scope_limited(&model_scope, now_ts)
                    && a.supports_model(requested_model)
            })
            .cloned()
            .collect();

        for acc in rank(&primary) {
            if let Ok(guard) = self.try_acquire_only(&acc).await {
                self.accounts.touch_last_used(&acc.id).await;
                self.sticky.bind(group_id, session_key, &acc.id).await;
                return Ok(Selection { account: acc, sticky_bound: false, slot_guard: guard });
            }
        }

        // 3. Fallback layer: broader sweep including temporarily busy
        // accounts, selection by last_used or random, with a bounded wait.
        if !primary.is_empty() {
            let chosen = match cfg.fallback_selection_mode {
                FallbackSelectionMode::LastUsed => {
                    primary.iter().min_by_key(|a| a.last_used_at).cloned()
                }
                FallbackSelectionMode::Random => {
                    use rand::seq::SliceRandom;
                    primary.choose(&mut rand::thread_rng()).cloned()
                }
            };
            if let Some(acc) = chosen {
                if self
                    .arbiter
                    .try_enter_wait_line(Scope::Account, &acc.id, cfg.fallback_max_waiting)
                    .await
                {
                    let waited = self
                        .arbiter
                        .acquire_slot_with_wait(
                            Scope::Account,
                            &acc.id,
                            acc.concurrency,
                            Some(Duration::from_secs(cfg.fallback_wait_timeout_secs)),
                            false,
                            None,
                        )
                        .await;
                    if let Ok(guard) = waited {
                        self.accounts.touch_last_used(&acc.id).await;
                        self.sticky.bind(group_id, session_key, &acc.id).await;
                        return Ok(Selection { account: acc, sticky_bound: false, slot_guard: guard });
                    }
                }
            }
        }

        // 4. DB fallback: one rate-limited direct read bypassing the cache.
        if cfg.db_fallback_enabled && self.db_fallback_limiter.try_acquire(now_ts * 1000) {
            logger::info("scheduler", &format!("db-fallback sweep for group {group_id}"));
            let fetched = db::query_accounts_for_group(group_id);
            self.accounts.merge_from_db(fetched.clone()).await;
            let db_candidates: Vec<Account> = fetched
                .into_iter()
                .filter(|a| {
                    !excluded.contains(&a.id)
                        && a.is_schedulable(now_ts)
                        && !a.model_scope_limited(&model_scope, now_ts)
                        && a.supports_model(requested_model)
                })
                .collect();
            for acc in rank(&db_candidates) {
                if let Ok(guard) = self.try_acquire_only(&acc).await {
                    self.accounts.touch_last_used(&acc.id).await;
                    self.sticky.bind(group_id, session_key, &acc.id).await;
                    return Ok(Selection { account: acc, sticky_bound: false, slot_guard: guard });
                }
            }
        }

        Err(SchedulerError::NoAvailableAccounts)
    }

    /// Whether any schedulable candidate other than `excluded` exists for
    /// this group/model, ignoring current concurrency load. Used by the
    /// failover controller to tell a genuinely single-account group (retry
    /// the same account on a fixed backoff) apart from a multi-account
    /// group that is merely saturated (switch accounts).
    pub async fn has_alternative(
        &self,
        group_id: &str,
        excluded: &HashSet<String>,
        requested_model: &str,
        thinking: bool,
    ) -> bool {
        let now_ts = now();
        let model_scope = Account::model_scope(requested_model, thinking);
        self.accounts
            .list_for_group(group_id)
            .await
            .iter()
            .any(|a| {
                !excluded.contains(&a.id)
                    && a.is_schedulable(now_ts)
                    && !a.model_scope_limited(&model_scope, now_ts)
                    && a.supports_model(requested_model)
            })
    }

    async fn try_acquire_only(&self, acc: &Account) -> Result<SlotGuard, ArbiterError> {
        self.arbiter
            .acquire_slot_with_wait(Scope::Account, &acc.id, acc.concurrency, Some(Duration::from_millis(1)), false, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, group: &str, priority: i32) -> Account {
        Account {
            id: id.to_string(),
            group_id: group.to_string(),
            priority,
            concurrency: 1,
            ..Default::default()
        }
    }

    fn cfg() -> GatewaySettings {
        GatewaySettings::default()
    }

    #[tokio::test]
    async fn primary_layer_picks_lowest_priority() {
        let store = AccountStore::new(vec![account("a", "g1", 50), account("b", "g1", 10)]);
        let sticky = StickySessionCache::new(Duration::from_secs(60));
        let arbiter = ConcurrencyArbiter::new(Duration::from_secs(1800));
        let scheduler = Scheduler::new(store, sticky, arbiter, 5);

        let sel = scheduler
            .select_and_acquire("g1", "sess-1", "any-model", false, &HashSet::new(), &cfg())
            .await
            .unwrap();
        assert_eq!(sel.account.id, "b");
    }

    #[tokio::test]
    async fn sticky_binding_is_respected_on_repeat_selection() {
        let store = AccountStore::new(vec![account("a", "g1", 50), account("b", "g1", 10)]);
        let sticky = StickySessionCache::new(Duration::from_secs(60));
        let arbiter = ConcurrencyArbiter::new(Duration::from_secs(1800));
        let scheduler = Scheduler::new(store, sticky, arbiter, 5);

        let first = scheduler
            .select_and_acquire("g1", "sess-1", "any-model", false, &HashSet::new(), &cfg())
            .await
            .unwrap();
        assert_eq!(first.account.id, "b");

        let second = scheduler
            .select_and_acquire("g1", "sess-1", "any-model", false, &HashSet::new(), &cfg())
            .await
            .unwrap();
        assert_eq!(second.account.id, "b");
        assert!(second.sticky_bound);
    }

    #[tokio::test]
    async fn excluded_accounts_are_skipped() {
        let store = AccountStore::new(vec![account("a", "g1", 50), account("b", "g1", 10)]);
        let sticky = StickySessionCache::new(Duration::from_secs(60));
        let arbiter = ConcurrencyArbiter::new(Duration::from_secs(1800));
        let scheduler = Scheduler::new(store, sticky, arbiter, 5);

        let mut excluded = HashSet::new();
        excluded.insert("b".to_string());
        let sel = scheduler
            .select_and_acquire("g1", "sess-2", "any-model", false, &excluded, &cfg())
            .await
            .unwrap();
        assert_eq!(sel.account.id, "a");
    }

    #[tokio::test]
    async fn no_available_accounts_errors() {
        let store = AccountStore::new(vec![]);
        let sticky = StickySessionCache::new(Duration::from_secs(60));
        let arbiter = ConcurrencyArbiter::new(Duration::from_secs(1800));
        let mut c = cfg();
        c.db_fallback_enabled = false;
        let scheduler = Scheduler::new(store, sticky, arbiter, 5);
        let res = scheduler
            .select_and_acquire("g1", "sess-3", "any-model", false, &HashSet::new(), &c)
            .await;
        assert!(matches!(res, Err(SchedulerError::NoAvailableAccounts)));
    }
}

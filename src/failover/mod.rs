//! Failover Controller (component C6)
//!
//! Drives the retry loop around a single forwarded request: on a
//! retryable upstream failure it marks the failing account via
//! `AccountStateEvent`, excludes it, and asks the scheduler for a
//! replacement — up to a bounded number of switches. A single-account
//! group (no replacement exists) instead retries the same account on a
//! fixed backoff bounded by `single_account_retry_budget_secs`. A request
//! that fails because the prompt itself is structurally invalid for the
//! group's platform (not because of account state) may re-target a
//! configured fallback group instead of switching accounts.
//!
//! Grounded on the teacher's `forward/mod.rs::handle_request_with_fallback`
//! retry-with-backoff shape, generalized from "next endpoint in a static
//! list" to "next account the scheduler hands back".

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::GatewaySettings;
use crate::domain::{Account, AccountStateEvent, Group};
use crate::logger;
use crate::scheduler::{Scheduler, SchedulerError, Selection};

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    RateLimited { reset_at: i64 },
    Overloaded { until: i64 },
    ModelLimited { scope: String, reset_at: i64 },
    InvalidRequest { too_large: bool },
    TransientNetwork,
    Fatal(String),
}

pub enum AttemptOutcome<T> {
    Success(T),
    Failure(UpstreamFailure),
}

#[derive(Debug)]
pub enum FailoverError {
    NoAvailableAccounts,
    SwitchBudgetExhausted,
    FallbackGroupUnusable,
    Fatal(String),
}

pub struct FailoverOutcome<T> {
    pub result: T,
    pub account: Account,
    /// The group the successful attempt actually ran against — the
    /// original group, or a fallback group if one was retargeted into.
    pub group: Group,
    /// Set when the final successful attempt landed on a *different*
    /// account than a previously sticky-bound one — the forwarder should
    /// bill the now-cold prompt as cache-read per the force_cache_billing
    /// resolution.
    pub force_cache_billing: bool,
    pub switches: u32,
}

pub struct FailoverController<'a> {
    pub scheduler: &'a Scheduler,
    pub cfg: &'a GatewaySettings,
}

impl<'a> FailoverController<'a> {
    pub fn new(scheduler: &'a Scheduler, cfg: &'a GatewaySettings) -> Self {
        Self { scheduler, cfg }
    }

    /// Runs `attempt` against successive accounts until it succeeds, the
    /// switch budget is exhausted, or no accounts remain. `attempt` is
    /// given the selected account and returns either a success payload or
    /// a classified failure.
    pub async fn run<T, F, Fut>(
        &self,
        group: &Group,
        fallback_group: Option<&Group>,
        session_key: &str,
        requested_model: &str,
        thinking: bool,
        is_gemini: bool,
        mut attempt: F,
    ) -> Result<FailoverOutcome<T>, FailoverError>
    where
        F: FnMut(Account, Group) -> Fut,
        Fut: std::future::Future<Output = AttemptOutcome<T>>,
    {
        let max_switches = if is_gemini {
            self.cfg.max_account_switches_gemini
        } else {
            self.cfg.max_account_switches
        };

        let mut excluded: HashSet<String> = HashSet::new();
        let mut switches = 0u32;
        let mut sticky_bound_initially: Option<bool> = None;
        let single_account_deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.cfg.single_account_retry_budget_secs);

        // The fallback group is a single-hop retarget: once consumed
        // (successfully or not), it is never offered again.
        let mut current_group: &Group = group;
        let mut remaining_fallback: Option<&Group> = fallback_group;

        loop {
            let selection = self
                .scheduler
                .select_and_acquire(&current_group.id, session_key, requested_model, thinking, &excluded, self.cfg)
                .await;

            let Selection { account, sticky_bound, slot_guard } = match selection {
                Ok(s) => s,
                Err(SchedulerError::NoAvailableAccounts) => match remaining_fallback.take() {
                    Some(fb) if fb.valid_invalid_request_fallback() => {
                        logger::info(
                            "failover",
                            &format!("group {} exhausted, retargeting to fallback group {}", current_group.id, fb.id),
                        );
                        current_group = fb;
                        excluded.clear();
                        continue;
                    }
                    Some(_) => return Err(FailoverError::FallbackGroupUnusable),
                    None => return Err(FailoverError::NoAvailableAccounts),
                },
                Err(SchedulerError::WaitTimeout) => return Err(FailoverError::NoAvailableAccounts),
            };

            if sticky_bound_initially.is_none() {
                sticky_bound_initially = Some(sticky_bound);
            }

            let account_id = account.id.clone();
            let outcome = attempt(account.clone(), current_group.clone()).await;
            drop(slot_guard);

            match outcome {
                AttemptOutcome::Success(value) => {
                    let force_cache_billing =
                        sticky_bound_initially == Some(true) && !sticky_bound && switches > 0;
                    return Ok(FailoverOutcome {
                        result: value,
                        account,
                        group: current_group.clone(),
                        force_cache_billing,
                        switches,
                    });
                }
                AttemptOutcome::Failure(failure) => {
                    logger::warn(
                        "failover",
                        &format!("account {account_id} failed: {failure:?}, switch {switches}/{max_switches}"),
                    );
                    // ModelLimited is applied further down, gated on
                    // has_alternative: a single-account group must not be
                    // excluded from its only account over a model-scope
                    // limit, it just retries in place.
                    if !matches!(failure, UpstreamFailure::ModelLimited { .. }) {
                        self.apply_failure(&account_id, &failure).await;
                    }

                    match failure {
                        UpstreamFailure::InvalidRequest { too_large: true } if self.cfg.failover_on_400 => {
                            match remaining_fallback.take() {
                                Some(fb) if fb.valid_invalid_request_fallback() => {
                                    logger::info(
                                        "failover",
                                        &format!("prompt too large for group {}, retargeting to fallback group {}", current_group.id, fb.id),
                                    );
                                    current_group = fb;
                                    excluded.clear();
                                    continue;
                                }
                                Some(_) => return Err(FailoverError::FallbackGroupUnusable),
                                None => return Err(FailoverError::Fatal("prompt too large for group".into())),
                            }
                        }
                        UpstreamFailure::InvalidRequest { .. } => {
                            return Err(FailoverError::Fatal("invalid request".into()));
                        }
                        UpstreamFailure::Fatal(msg) => return Err(FailoverError::Fatal(msg)),
                        UpstreamFailure::TransientNetwork
                        | UpstreamFailure::RateLimited { .. }
                        | UpstreamFailure::Overloaded { .. }
                        | UpstreamFailure::ModelLimited { .. } => {
                            let mut probe = excluded.clone();
                            probe.insert(account_id.clone());
                            let has_alternative = self
                                .scheduler
                                .has_alternative(&current_group.id, &probe, requested_model, thinking)
                                .await;

                            if !has_alternative {
                                // No replacement account exists for this
                                // group: retry the same account on a fixed
                                // backoff, bounded by the dedicated budget
                                // rather than the switch counter.
                                if tokio::time::Instant::now() >= single_account_deadline {
                                    return Err(FailoverError::SwitchBudgetExhausted);
                                }
                                tokio::time::sleep(Duration::from_secs(2)).await;
                                continue;
                            }

                            if let UpstreamFailure::ModelLimited { scope, .. } = &failure {
                                self.apply_model_limit(&account_id, scope).await;
                            }

                            excluded.insert(account_id.clone());
                            switches += 1;
                            if switches > max_switches {
                                return Err(FailoverError::SwitchBudgetExhausted);
                            }
                            let backoff = Duration::from_millis(200 * switches.min(10) as u64);
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }
    }

    async fn apply_failure(&self, account_id: &str, failure: &UpstreamFailure) {
        let event = match failure {
            UpstreamFailure::RateLimited { reset_at } => Some(AccountStateEvent::RateLimited { reset_at: *reset_at }),
            UpstreamFailure::Overloaded { until } => Some(AccountStateEvent::Overloaded { until: *until }),
            _ => None,
        };
        if let Some(event) = event {
            self.scheduler.accounts.apply_event(account_id, event).await;
        }
    }

    /// Excludes the account from further scheduling for the model scope it
    /// just failed on (not the whole account), per the §4.2 MODEL_CAPACITY
    /// transition. `scope` comes from the handler that classified the
    /// failure (it has the requested model and thinking flag on hand);
    /// `reset_at` is derived from the configured overload cooldown rather
    /// than trusting the upstream's own estimate, which gives no usable
    /// reset hint.
    async fn apply_model_limit(&self, account_id: &str, scope: &str) {
        let reset_at = now() + self.cfg.overload_cooldown_minutes * 60;
        self.scheduler
            .accounts
            .apply_event(account_id, AccountStateEvent::ModelLimited { scope: scope.to_string(), reset_at })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyArbiter;
    use crate::scheduler::AccountStore;
    use crate::sticky::StickySessionCache;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn account(id: &str, group: &str) -> Account {
        Account {
            id: id.to_string(),
            group_id: group.to_string(),
            concurrency: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn succeeds_immediately_on_healthy_account() {
        let store = AccountStore::new(vec![account("a", "g1")]);
        let sticky = StickySessionCache::new(Duration::from_secs(60));
        let arbiter = ConcurrencyArbiter::new(Duration::from_secs(1800));
        let scheduler = Scheduler::new(store, sticky, arbiter, 0);
        let cfg = GatewaySettings::default();
        let controller = FailoverController::new(&scheduler, &cfg);
        let group = Group { id: "g1".into(), ..Default::default() };

        let result = controller
            .run(&group, None, "sess-1", "model", false, false, |acc, _g| async move {
                AttemptOutcome::<String>::Success(acc.id)
            })
            .await
            .unwrap();
        assert_eq!(result.result, "a");
        assert_eq!(result.switches, 0);
    }

    #[tokio::test]
    async fn switches_account_after_transient_failure() {
        let store = AccountStore::new(vec![account("a", "g1"), account("b", "g1")]);
        let sticky = StickySessionCache::new(Duration::from_secs(60));
        let arbiter = ConcurrencyArbiter::new(Duration::from_secs(1800));
        let scheduler = Scheduler::new(store, sticky, arbiter, 0);
        let cfg = GatewaySettings::default();
        let controller = FailoverController::new(&scheduler, &cfg);
        let group = Group { id: "g1".into(), ..Default::default() };

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result = controller
            .run(&group, None, "sess-2", "model", false, false, move |acc, _g| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        AttemptOutcome::Failure(UpstreamFailure::TransientNetwork)
                    } else {
                        AttemptOutcome::Success(acc.id)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result.switches, 1);
    }

    #[tokio::test]
    async fn exhausts_switch_budget_and_errors() {
        let store = AccountStore::new(vec![account("a", "g1")]);
        let sticky = StickySessionCache::new(Duration::from_secs(60));
        let arbiter = ConcurrencyArbiter::new(Duration::from_secs(1800));
        let scheduler = Scheduler::new(store, sticky, arbiter, 0);
        let mut cfg = GatewaySettings::default();
        cfg.max_account_switches = 1;
        cfg.single_account_retry_budget_secs = 0;
        let controller = FailoverController::new(&scheduler, &cfg);
        let group = Group { id: "g1".into(), ..Default::default() };

        let result = controller
            .run(&group, None, "sess-3", "model", false, false, |_acc, _g| async move {
                AttemptOutcome::<String>::Failure(UpstreamFailure::TransientNetwork)
            })
            .await;
        assert!(matches!(result, Err(FailoverError::SwitchBudgetExhausted)));
    }
}

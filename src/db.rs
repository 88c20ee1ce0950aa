//! SQLite persistence: accounts, groups, API keys, subscriptions, sticky
//! bindings (durable fallback for the in-memory cache), usage logs and
//! idempotency records.
//!
//! Schema and connection tuning follow the teacher's `db.rs`: WAL mode,
//! `prepare_cached` on the hot paths, upsert-on-conflict for rolling
//! aggregates.

use dirs::data_dir;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

use crate::domain::account::{Account, AccountStatus, AccountType, Platform};
use crate::domain::subscription::{SubscriptionStatus, UserSubscription};

fn db_path() -> PathBuf {
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("relay-gateway");
    std::fs::create_dir_all(&p).ok();
    p.push("gateway.db");
    p
}

fn open_conn() -> Connection {
    Connection::open(db_path()).unwrap()
}

fn optimize_connection(conn: &Connection) {
    conn.pragma_update(None, "journal_mode", &"WAL").ok();
    conn.pragma_update(None, "synchronous", &"NORMAL").ok();
    conn.pragma_update(None, "cache_size", &"-64000").ok();
    conn.pragma_update(None, "temp_store", &"MEMORY").ok();
}

pub fn init() {
    let conn = open_conn();
    optimize_connection(&conn);

    conn.execute(
        "create table if not exists accounts (
            id text primary key,
            group_id text not null,
            platform text not null,
            account_type text not null,
            status text not null,
            schedulable integer not null default 1,
            concurrency integer not null default 1,
            priority integer not null default 100,
            last_used_at integer not null default 0,
            rate_limit_reset_at integer,
            overloaded_until integer,
            temp_unschedulable_until integer,
            temp_unschedulable_reason text,
            session_window_start integer,
            session_window_end integer,
            model_rate_limits text not null default '{}',
            model_mapping text not null default '{}',
            credentials text not null default '',
            rate_multiplier real not null default 1.0
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create table if not exists sticky_bindings (
            group_id text not null,
            session_key text not null,
            account_id text not null,
            expires_at integer not null,
            primary key (group_id, session_key)
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create table if not exists usage_logs (
            id integer primary key autoincrement,
            timestamp integer,
            api_key_id text,
            user_id text,
            account_id text,
            group_id text,
            platform text,
            model text,
            prompt_tokens integer,
            completion_tokens integer,
            cache_creation_tokens_5m integer default 0,
            cache_creation_tokens_1h integer default 0,
            cache_read_tokens integer default 0,
            image_count integer default 0,
            cost_usd real,
            billing_type text,
            rate_multiplier real default 1.0,
            force_cache_billing integer default 0,
            long_context_crossed integer default 0,
            stream integer default 0,
            duration_ms integer default 0,
            first_token_ms integer
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create table if not exists usage_daily (bucket text primary key, requests integer, tokens integer, cost_usd real)",
        [],
    )
    .ok();
    conn.execute(
        "create table if not exists usage_weekly (bucket text primary key, requests integer, tokens integer, cost_usd real)",
        [],
    )
    .ok();
    conn.execute(
        "create table if not exists usage_monthly (bucket text primary key, requests integer, tokens integer, cost_usd real)",
        [],
    )
    .ok();

    conn.execute(
        "create table if not exists idempotency_records (
            record_key text primary key,
            status text not null,
            stored_status integer,
            stored_body text,
            created_at integer not null,
            expires_at integer not null
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create index if not exists idx_usage_logs_timestamp on usage_logs(timestamp desc)",
        [],
    )
    .ok();
    conn.execute(
        "create index if not exists idx_usage_logs_account on usage_logs(account_id, timestamp desc)",
        [],
    )
    .ok();
    conn.execute(
        "create index if not exists idx_accounts_group on accounts(group_id)",
        [],
    )
    .ok();

    conn.execute(
        "create table if not exists subscriptions (
            user_id text not null,
            group_id text not null,
            status text not null,
            daily_window_start integer not null default 0,
            daily_spent_usd real not null default 0,
            weekly_window_start integer not null default 0,
            weekly_spent_usd real not null default 0,
            monthly_window_start integer not null default 0,
            monthly_spent_usd real not null default 0,
            primary key (user_id, group_id)
        )",
        [],
    )
    .unwrap();
}

fn platform_str(p: Platform) -> &'static str {
    p.as_str()
}

fn account_type_str(t: AccountType) -> &'static str {
    match t {
        AccountType::OAuth => "oauth",
        AccountType::SetupToken => "setup-token",
        AccountType::ApiKey => "apikey",
        AccountType::Upstream => "upstream",
    }
}

fn parse_account_type(s: &str) -> AccountType {
    match s {
        "oauth" => AccountType::OAuth,
        "setup-token" => AccountType::SetupToken,
        "upstream" => AccountType::Upstream,
        _ => AccountType::ApiKey,
    }
}

fn status_str(s: AccountStatus) -> &'static str {
    match s {
        AccountStatus::Active => "active",
        AccountStatus::Disabled => "disabled",
        AccountStatus::Error => "error",
    }
}

fn parse_status(s: &str) -> AccountStatus {
    match s {
        "disabled" => AccountStatus::Disabled,
        "error" => AccountStatus::Error,
        _ => AccountStatus::Active,
    }
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    let platform_s: String = row.get(2)?;
    let type_s: String = row.get(3)?;
    let status_s: String = row.get(4)?;
    let model_rate_limits: String = row.get(11)?;
    let model_mapping: String = row.get(12)?;
    Ok(Account {
        id: row.get(0)?,
        group_id: row.get(1)?,
        platform: Platform::from_str(&platform_s).unwrap_or(Platform::Anthropic),
        account_type: parse_account_type(&type_s),
        status: parse_status(&status_s),
        schedulable: row.get::<_, i64>(5)? != 0,
        concurrency: row.get::<_, i64>(6)? as u32,
        priority: row.get::<_, i64>(7)? as i32,
        last_used_at: row.get(8)?,
        rate_limit_reset_at: row.get(9)?,
        overloaded_until: row.get(10)?,
        temp_unschedulable_until: row.get(13)?,
        temp_unschedulable_reason: row.get(14)?,
        session_window_start: row.get(15)?,
        session_window_end: row.get(16)?,
        model_rate_limits: serde_json::from_str(&model_rate_limits).unwrap_or_default(),
        model_mapping: serde_json::from_str(&model_mapping).unwrap_or_default(),
        credentials: row.get(17)?,
        rate_multiplier: row.get(18)?,
    })
}

const ACCOUNT_COLUMNS: &str = "id, group_id, platform, account_type, status, schedulable, \
    concurrency, priority, last_used_at, rate_limit_reset_at, overloaded_until, \
    model_rate_limits, model_mapping, temp_unschedulable_until, temp_unschedulable_reason, \
    session_window_start, session_window_end, credentials, rate_multiplier";

pub fn upsert_account(acc: &Account) {
    let conn = open_conn();
    conn.execute(
        &format!(
            "insert into accounts ({cols}) values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
             on conflict(id) do update set group_id=excluded.group_id, platform=excluded.platform,
                account_type=excluded.account_type, status=excluded.status, schedulable=excluded.schedulable,
                concurrency=excluded.concurrency, priority=excluded.priority, last_used_at=excluded.last_used_at,
                rate_limit_reset_at=excluded.rate_limit_reset_at, overloaded_until=excluded.overloaded_until,
                model_rate_limits=excluded.model_rate_limits, model_mapping=excluded.model_mapping,
                temp_unschedulable_until=excluded.temp_unschedulable_until,
                temp_unschedulable_reason=excluded.temp_unschedulable_reason,
                session_window_start=excluded.session_window_start, session_window_end=excluded.session_window_end,
                credentials=excluded.credentials, rate_multiplier=excluded.rate_multiplier",
            cols = ACCOUNT_COLUMNS
        ),
        params![
            acc.id,
            acc.group_id,
            platform_str(acc.platform),
            account_type_str(acc.account_type),
            status_str(acc.status),
            acc.schedulable as i64,
            acc.concurrency as i64,
            acc.priority as i64,
            acc.last_used_at,
            acc.rate_limit_reset_at,
            acc.overloaded_until,
            serde_json::to_string(&acc.model_rate_limits).unwrap_or_else(|_| "{}".into()),
            serde_json::to_string(&acc.model_mapping).unwrap_or_else(|_| "{}".into()),
            acc.temp_unschedulable_until,
            acc.temp_unschedulable_reason,
            acc.session_window_start,
            acc.session_window_end,
            acc.credentials,
            acc.rate_multiplier,
        ],
    )
    .unwrap();
}

/// Direct DB read bypassing the in-memory account cache, used by the
/// scheduler's rate-limited db-fallback layer.
pub fn query_accounts_for_group(group_id: &str) -> Vec<Account> {
    let conn = open_conn();
    let mut stmt = conn
        .prepare_cached(&format!(
            "select {cols} from accounts where group_id = ?1",
            cols = ACCOUNT_COLUMNS
        ))
        .unwrap();
    let rows = stmt.query_map(params![group_id], row_to_account).unwrap();
    rows.filter_map(|r| r.ok()).collect()
}

pub fn load_all_accounts() -> Vec<Account> {
    let conn = open_conn();
    let mut stmt = conn
        .prepare_cached(&format!("select {cols} from accounts", cols = ACCOUNT_COLUMNS))
        .unwrap();
    let rows = stmt.query_map([], row_to_account).unwrap();
    rows.filter_map(|r| r.ok()).collect()
}

pub fn bind_sticky_session(group_id: &str, session_key: &str, account_id: &str, expires_at: i64) {
    let conn = open_conn();
    conn.execute(
        "insert into sticky_bindings (group_id, session_key, account_id, expires_at) values (?1,?2,?3,?4)
         on conflict(group_id, session_key) do update set account_id=excluded.account_id, expires_at=excluded.expires_at",
        params![group_id, session_key, account_id, expires_at],
    ).ok();
}

pub fn sweep_expired_sticky_bindings(now_ts: i64) {
    let conn = open_conn();
    conn.execute("delete from sticky_bindings where expires_at <= ?1", params![now_ts])
        .ok();
}

#[allow(clippy::too_many_arguments)]
pub struct UsageLogRow<'a> {
    pub api_key_id: &'a str,
    pub user_id: &'a str,
    pub account_id: &'a str,
    pub group_id: &'a str,
    pub platform: &'a str,
    pub model: &'a str,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_creation_tokens_5m: i64,
    pub cache_creation_tokens_1h: i64,
    pub cache_read_tokens: i64,
    pub image_count: i64,
    pub cost_usd: f64,
    pub billing_type: &'a str,
    pub rate_multiplier: f64,
    pub force_cache_billing: bool,
    pub long_context_crossed: bool,
    pub stream: bool,
    pub duration_ms: i64,
    pub first_token_ms: Option<i64>,
}

pub fn log_usage(row: &UsageLogRow) {
    let conn = open_conn();
    let ts = chrono::Utc::now().timestamp();
    conn.execute(
        "insert into usage_logs (timestamp, api_key_id, user_id, account_id, group_id, platform, model,
            prompt_tokens, completion_tokens, cache_creation_tokens_5m, cache_creation_tokens_1h,
            cache_read_tokens, image_count, cost_usd, billing_type, rate_multiplier, force_cache_billing,
            long_context_crossed, stream, duration_ms, first_token_ms)
         values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
        params![
            ts,
            row.api_key_id,
            row.user_id,
            row.account_id,
            row.group_id,
            row.platform,
            row.model,
            row.prompt_tokens,
            row.completion_tokens,
            row.cache_creation_tokens_5m,
            row.cache_creation_tokens_1h,
            row.cache_read_tokens,
            row.image_count,
            row.cost_usd,
            row.billing_type,
            row.rate_multiplier,
            row.force_cache_billing as i64,
            row.long_context_crossed as i64,
            row.stream as i64,
            row.duration_ms,
            row.first_token_ms,
        ],
    )
    .unwrap();

    let total_tokens = row.prompt_tokens + row.completion_tokens;
    fn upsert(conn: &Connection, table: &str, bucket: &str, tokens: i64, cost: f64) {
        let sql = format!(
            "insert into {table} (bucket, requests, tokens, cost_usd) values (?1,1,?2,?3) \
             on conflict(bucket) do update set requests=requests+1, tokens=tokens+excluded.tokens, cost_usd=cost_usd+excluded.cost_usd"
        );
        let _ = conn.execute(&sql, params![bucket, tokens, cost]);
    }
    let now = chrono::Utc::now();
    upsert(&conn, "usage_daily", &now.format("%Y-%m-%d").to_string(), total_tokens, row.cost_usd);
    upsert(&conn, "usage_monthly", &now.format("%Y-%m").to_string(), total_tokens, row.cost_usd);
}

pub fn summary_since(days: i64) -> (i64, i64, f64) {
    let conn = open_conn();
    let mut stmt = conn
        .prepare_cached(
            "select count(*), ifnull(sum(prompt_tokens+completion_tokens),0), ifnull(sum(cost_usd),0) \
             from usage_logs where timestamp >= strftime('%s','now','-'||?1||' day')",
        )
        .unwrap();
    stmt.query_row(params![days], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
}

pub fn summary_for_account(account_id: &str, days: i64) -> (i64, i64, f64) {
    let conn = open_conn();
    let mut stmt = conn
        .prepare_cached(
            "select count(*), ifnull(sum(prompt_tokens+completion_tokens),0), ifnull(sum(cost_usd),0) \
             from usage_logs where account_id = ?1 and timestamp >= strftime('%s','now','-'||?2||' day')",
        )
        .unwrap();
    stmt.query_row(params![account_id, days], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
}

fn subscription_status_str(s: SubscriptionStatus) -> &'static str {
    match s {
        SubscriptionStatus::Active => "active",
        SubscriptionStatus::Expired => "expired",
        SubscriptionStatus::Invalid => "invalid",
    }
}

fn parse_subscription_status(s: &str) -> SubscriptionStatus {
    match s {
        "expired" => SubscriptionStatus::Expired,
        "invalid" => SubscriptionStatus::Invalid,
        _ => SubscriptionStatus::Active,
    }
}

/// Loads a user's subscription state for a group. The billing gate's
/// datasource lookup; failures here trip its circuit breaker.
pub fn load_subscription(user_id: &str, group_id: &str) -> rusqlite::Result<Option<UserSubscription>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(
        "select user_id, group_id, status, daily_window_start, daily_spent_usd,
            weekly_window_start, weekly_spent_usd, monthly_window_start, monthly_spent_usd
         from subscriptions where user_id = ?1 and group_id = ?2",
    )?;
    stmt.query_row(params![user_id, group_id], |row| {
        let status_s: String = row.get(2)?;
        Ok(UserSubscription {
            user_id: row.get(0)?,
            group_id: row.get(1)?,
            status: parse_subscription_status(&status_s),
            daily_window_start: row.get(3)?,
            daily_spent_usd: row.get(4)?,
            weekly_window_start: row.get(5)?,
            weekly_spent_usd: row.get(6)?,
            monthly_window_start: row.get(7)?,
            monthly_spent_usd: row.get(8)?,
        })
    })
    .optional()
}

pub fn upsert_subscription(sub: &UserSubscription) {
    let conn = open_conn();
    conn.execute(
        "insert into subscriptions (user_id, group_id, status, daily_window_start, daily_spent_usd,
            weekly_window_start, weekly_spent_usd, monthly_window_start, monthly_spent_usd)
         values (?1,?2,?3,?4,?5,?6,?7,?8,?9)
         on conflict(user_id, group_id) do update set status=excluded.status,
            daily_window_start=excluded.daily_window_start, daily_spent_usd=excluded.daily_spent_usd,
            weekly_window_start=excluded.weekly_window_start, weekly_spent_usd=excluded.weekly_spent_usd,
            monthly_window_start=excluded.monthly_window_start, monthly_spent_usd=excluded.monthly_spent_usd",
        params![
            sub.user_id,
            sub.group_id,
            subscription_status_str(sub.status),
            sub.daily_window_start,
            sub.daily_spent_usd,
            sub.weekly_window_start,
            sub.weekly_spent_usd,
            sub.monthly_window_start,
            sub.monthly_spent_usd,
        ],
    )
    .ok();
}

pub enum IdempotencyLookup {
    Absent,
    Processing { expires_at: i64 },
    Completed { status: i64, body: String },
    Failed { retry_after: i64 },
}

pub fn idempotency_begin(record_key: &str, now_ts: i64, processing_ttl: i64) -> IdempotencyLookup {
    let conn = open_conn();
    let mut stmt = conn
        .prepare_cached("select status, stored_status, stored_body, expires_at from idempotency_records where record_key = ?1")
        .unwrap();
    let existing = stmt
        .query_row(params![record_key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .ok();

    if let Some((status, stored_status, stored_body, expires_at)) = existing {
        if expires_at > now_ts {
            return match status.as_str() {
                "processing" => IdempotencyLookup::Processing { expires_at },
                "completed" => IdempotencyLookup::Completed {
                    status: stored_status.unwrap_or(200),
                    body: stored_body.unwrap_or_default(),
                },
                "failed" => IdempotencyLookup::Failed { retry_after: expires_at },
                _ => IdempotencyLookup::Absent,
            };
        }
    }

    conn.execute(
        "insert into idempotency_records (record_key, status, created_at, expires_at) values (?1,'processing',?2,?3)
         on conflict(record_key) do update set status='processing', created_at=excluded.created_at, expires_at=excluded.expires_at",
        params![record_key, now_ts, now_ts + processing_ttl],
    )
    .unwrap();
    IdempotencyLookup::Absent
}

pub fn idempotency_complete(record_key: &str, status: i64, body: &str, now_ts: i64, ttl: i64) {
    let conn = open_conn();
    conn.execute(
        "update idempotency_records set status='completed', stored_status=?2, stored_body=?3, expires_at=?4 where record_key=?1",
        params![record_key, status, body, now_ts + ttl],
    )
    .ok();
}

pub fn idempotency_fail(record_key: &str, now_ts: i64, retry_backoff: i64) {
    let conn = open_conn();
    conn.execute(
        "update idempotency_records set status='failed', expires_at=?2 where record_key=?1",
        params![record_key, now_ts + retry_backoff],
    )
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_round_trips_through_sqlite_json_columns() {
        let dir = std::env::temp_dir().join(format!("relay-gateway-test-{}", std::process::id()));
        std::env::set_var("HOME", &dir);
        init();
        let mut acc = Account::default();
        acc.id = "acc-rt".into();
        acc.group_id = "group-rt".into();
        acc.model_mapping.insert("gpt-4*".into(), "gpt-4-turbo".into());
        upsert_account(&acc);
        let loaded = query_accounts_for_group("group-rt");
        assert!(loaded.iter().any(|a| a.id == "acc-rt"));
        std::fs::remove_dir_all(&dir).ok();
    }
}

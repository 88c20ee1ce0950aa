//! Library crate for the gateway: the scheduling/forwarding core (C1-C9)
//! plus the ambient stack (config, db, logging) that makes it a runnable
//! binary. `main.rs` is a thin shim over `server::serve`.

pub mod billing;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod failover;
pub mod forward;
pub mod idempotency;
pub mod logger;
pub mod pricing;
pub mod scheduler;
pub mod server;
pub mod sticky;
pub mod usage_recorder;

//! Domain model
//!
//! Accounts, groups, API keys and subscriptions that the scheduler, billing
//! gate and forwarder operate on.

pub mod account;
pub mod api_key;
pub mod group;
pub mod subscription;

pub use account::{Account, AccountStateEvent, Platform};
pub use api_key::ApiKey;
pub use group::Group;
pub use subscription::UserSubscription;

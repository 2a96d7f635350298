//! Shared types and database plumbing for Promptmeter.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{
    QuotaCheckResult, Subscription, SubscriptionStatus, SubscriptionTier, UsageRecord, User,
};

// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PromptMeter Billing Module
//!
//! Quota enforcement and subscription reconciliation for the metered
//! completion proxy.
//!
//! ## Features
//!
//! - **Quota Admission**: Pure check of estimated cost against the remaining
//!   balance of the user's active subscription
//! - **Usage Metering**: Post-completion commit of actual token cost through
//!   a versioned conditional update, plus immutable audit records
//! - **Subscription Reconciliation**: Folds the provider's at-least-once
//!   lifecycle event stream into locally mirrored subscription state
//! - **Webhooks**: Signature verification and exactly-once event processing
//!   backed by a persistent event journal
//! - **Invariants**: Runnable consistency checks over billing state
//! - **Plans**: Provider price id to tier/quota mapping

pub mod error;
pub mod invariants;
pub mod plans;
pub mod quota;
pub mod reconciler;
pub mod store;
pub mod usage;
pub mod webhooks;


// Error
pub use error::{BillingError, BillingResult};

// Plans
pub use plans::{plan_for_price, Plan};

// Quota
pub use quota::check_quota;

// Store
pub use store::{BillingStore, SubscriptionUpsert};

// Usage
pub use usage::UsageMeter;

// Reconciler
pub use reconciler::{LifecycleEvent, SubscriptionReconciler};

// Webhooks
pub use webhooks::{verify_signature, WebhookEvent, WebhookHandler};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub store: BillingStore,
    pub usage: UsageMeter,
    pub reconciler: SubscriptionReconciler,
    pub webhooks: WebhookHandler,
    /// Present only for the Postgres backend; the checks are SQL queries.
    pub invariants: Option<InvariantChecker>,
}

impl BillingService {
    /// Create a billing service backed by Postgres
    pub fn new(pool: PgPool, webhook_secret: String) -> Self {
        let store = BillingStore::new(pool.clone());
        let reconciler = SubscriptionReconciler::new(store.clone());
        Self {
            usage: UsageMeter::new(store.clone()),
            webhooks: WebhookHandler::new(store.clone(), reconciler.clone(), webhook_secret),
            invariants: Some(InvariantChecker::new(pool)),
            reconciler,
            store,
        }
    }

    /// Create a billing service backed by process-local state, for tests
    /// and local development without a database
    pub fn new_in_memory(webhook_secret: String) -> Self {
        let store = BillingStore::new_in_memory();
        let reconciler = SubscriptionReconciler::new(store.clone());
        Self {
            usage: UsageMeter::new(store.clone()),
            webhooks: WebhookHandler::new(store.clone(), reconciler.clone(), webhook_secret),
            invariants: None,
            reconciler,
            store,
        }
    }
}

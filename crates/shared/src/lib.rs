#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Storefront shared types
//!
//! Domain enums and database helpers used by the billing engine and the worker.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations, DbConfig};
pub use types::{CheckoutMode, EntitlementFeature, ParseEnumError, SubscriptionStatus};

//! Pricing catalog, quote engine, and billing service.
//!
//! This crate composes the storage layer into the billing engine proper:
//!
//! - [`PricingCatalog`] — tenant-override-aware unit price resolution.
//! - [`quote`] — pure, side-effect-free pricing of usage items.
//! - [`BillingService`] — usage-event lifecycle and wallet orchestration:
//!   quote → create event → charge (atomic debit + ledger append + status
//!   transition).
//! - [`FeatureFlags`] — config-driven gating of the platform's metered
//!   features.
//!
//! The service is an explicit object constructed with an injected
//! [`LedgerStore`](creditmeter_core::LedgerStore); tests substitute an
//! in-memory store.

pub mod catalog;
pub mod flags;
pub mod quote;
pub mod service;

pub use catalog::PricingCatalog;
pub use flags::{Environment, FeatureFlag, FeatureFlags};
pub use quote::{quote, round_cost, validate_items};
pub use service::BillingService;

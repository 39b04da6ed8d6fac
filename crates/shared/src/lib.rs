#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Inkwell shared types
//!
//! Catalog types (plans, credit packages, billing cycles) and database
//! helpers used by the billing engine, the API server and the worker.

pub mod db;
pub mod plans;

pub use db::{create_pool, run_migrations};
pub use plans::{BillingCycle, CatalogError, CreditPackage, Plan, PlanCatalog, PlanFeatures};

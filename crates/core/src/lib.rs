//! `erpbus-core` — identifiers and error primitives shared by the bus crates.
//!
//! This crate has no runtime concerns (no async, no locks).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{
    CorrelationId, EventId, HandlerId, OrganizationId, SubscriptionId, TenantId, UserId,
};

//! HTTP handlers for vault-service.

pub mod audit;
pub mod health;
pub mod identity;
pub mod member;
pub mod metrics;
pub mod org;
pub mod project;
pub mod secret;

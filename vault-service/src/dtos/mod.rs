//! Request and response bodies for the HTTP surface.

pub mod audit;
pub mod identity;
pub mod member;
pub mod org;
pub mod project;
pub mod secret;

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub version: String,
    pub database: &'static str,
    pub cache: &'static str,
}

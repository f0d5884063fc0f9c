pub mod admin;
pub mod auth;
pub mod context;

pub use admin::admin_auth_middleware;
pub use auth::{auth_middleware, AuthUser};

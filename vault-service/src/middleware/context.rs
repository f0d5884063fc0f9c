use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use service_core::middleware::tracing::RequestId;
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::services::RequestContext;

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let request_id = parts.extensions.get::<RequestId>().map(|id| id.0.clone());

        Ok(RequestContext::from_parts(&parts.headers, peer, request_id))
    }
}

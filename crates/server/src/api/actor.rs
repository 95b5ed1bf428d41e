use axum::{extract::FromRequestParts, http::request::Parts};
use std::convert::Infallible;

pub const ACTOR_HEADER: &str = "x-actor-id";

const ANONYMOUS: &str = "anonymous";

/// Caller identity taken from the `X-Actor-Id` header.
///
/// Identity is asserted by the caller; authentication belongs to the fronting proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub String);

impl Actor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(ANONYMOUS);

        Ok(Actor(actor.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Actor {
        let (mut parts, _) = request.into_parts();
        Actor::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn test_actor_from_header() {
        let request = Request::builder()
            .header(ACTOR_HEADER, "alice")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await, Actor("alice".to_string()));
    }

    #[tokio::test]
    async fn test_missing_or_blank_header_is_anonymous() {
        let blank = Request::builder().header(ACTOR_HEADER, "  ").body(()).unwrap();
        assert_eq!(extract(blank).await.as_str(), "anonymous");

        let missing = Request::builder().body(()).unwrap();
        assert_eq!(extract(missing).await.as_str(), "anonymous");
    }
}

use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::auth::AllowList;

/// Rejects calls whose `authorization` metadata is not on the allow-list.
#[derive(Debug, Clone)]
pub struct TokenCheck {
    tokens: AllowList,
}

impl TokenCheck {
    pub fn new(tokens: AllowList) -> Self {
        Self { tokens }
    }
}

impl Interceptor for TokenCheck {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let allowed = request
            .metadata()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|token| self.tokens.allows(token));

        if allowed {
            Ok(request)
        } else {
            Err(Status::unauthenticated("Invalid or missing token"))
        }
    }
}

//! Shared application state handed to every request handler.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::engine::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    api_token: Arc<str>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, api_token: &str) -> Self {
        Self {
            engine,
            api_token: Arc::from(api_token),
        }
    }

    /// Check an `Authorization` header value against the admin token.
    ///
    /// Digests are compared in constant time, so neither the token's
    /// contents nor its length leak through response timing.
    pub fn is_admin(&self, authorization: Option<&str>) -> bool {
        let Some(token) = authorization.and_then(|value| value.strip_prefix("Bearer ")) else {
            return false;
        };
        let presented = Sha256::digest(token.trim().as_bytes());
        let expected = Sha256::digest(self.api_token.as_bytes());
        presented.as_slice().ct_eq(expected.as_slice()).into()
    }
}

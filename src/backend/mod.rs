//! Container backend seam.
//!
//! The runner talks to one or more container-management endpoints. Every
//! call names the endpoint it targets; session tokens for those endpoints
//! live in a [`SessionCache`] refreshed in the background.

pub mod portainer;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

pub use portainer::PortainerBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} answered {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("no session token for {0}")]
    NoSession(String),

    #[error("unexpected response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

/// A single published container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub internal_port: u16,
    pub external_port: u16,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Log in and return a fresh session token.
    async fn authenticate(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
    ) -> Result<String, BackendError>;

    /// Create and start a container, returning its id.
    async fn create_container(
        &self,
        endpoint: &str,
        spec: &ContainerSpec,
    ) -> Result<String, BackendError>;

    /// Deploy a compose stack, returning its id.
    async fn create_stack(
        &self,
        endpoint: &str,
        name: &str,
        compose: &str,
    ) -> Result<String, BackendError>;

    async fn delete_container(&self, endpoint: &str, id: &str) -> Result<(), BackendError>;

    async fn delete_stack(&self, endpoint: &str, id: &str) -> Result<(), BackendError>;
}

/// Endpoint -> current session token.
///
/// Replacing a token never invalidates the previous one at the backend, so
/// requests already holding an older token keep working.
#[derive(Debug, Default)]
pub struct SessionCache {
    tokens: RwLock<HashMap<String, String>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint: &str) -> Option<String> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
    }

    pub fn set(&self, endpoint: &str, token: String) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_string(), token);
    }
}

/// Backend resource name: `<challenge>_<discriminant>`, restricted to the
/// characters container and stack names accept.
pub fn resource_name(challenge_name: &str, discriminant: i64) -> String {
    let mut name: String = challenge_name
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        name.insert(0, 'c');
    }
    format!("{name}_{discriminant}")
}

//! Portainer implementation of the container backend.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Backend, BackendError, ContainerSpec, SessionCache};

/// Portainer environment (docker endpoint) id used when none is configured.
pub const DEFAULT_ENVIRONMENT_ID: u32 = 2;

// Request/Response types
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    jwt: String,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    host_port: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    port_bindings: HashMap<String, Vec<PortBinding>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerRequest<'a> {
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    cmd: &'a [String],
    image: &'a str,
    exposed_ports: HashMap<String, Empty>,
    host_config: HostConfig,
}

impl<'a> CreateContainerRequest<'a> {
    fn new(spec: &'a ContainerSpec) -> Self {
        let port_key = format!("{}/tcp", spec.internal_port);
        Self {
            cmd: &spec.cmd,
            image: &spec.image,
            exposed_ports: HashMap::from([(port_key.clone(), Empty {})]),
            host_config: HostConfig {
                port_bindings: HashMap::from([(
                    port_key,
                    vec![PortBinding {
                        host_port: spec.external_port.to_string(),
                    }],
                )]),
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCreated {
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateStackRequest<'a> {
    name: &'a str,
    stack_file_content: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackCreated {
    id: u64,
}

/// Talks to Portainer's REST API with bearer tokens from a shared
/// [`SessionCache`].
pub struct PortainerBackend {
    client: Client,
    sessions: Arc<SessionCache>,
    environment_id: u32,
}

impl PortainerBackend {
    pub fn new(
        sessions: Arc<SessionCache>,
        environment_id: u32,
        accept_invalid_certs: bool,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            sessions,
            environment_id,
        })
    }

    fn docker_url(&self, endpoint: &str, path: &str) -> String {
        format!(
            "{}/api/endpoints/{}/docker/{}",
            endpoint.trim_end_matches('/'),
            self.environment_id,
            path
        )
    }

    fn authorized(
        &self,
        method: Method,
        endpoint: &str,
        url: String,
    ) -> Result<RequestBuilder, BackendError> {
        let token = self
            .sessions
            .get(endpoint)
            .ok_or_else(|| BackendError::NoSession(endpoint.to_string()))?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn send(endpoint: &str, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request.send().await.map_err(|source| BackendError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(status_error(endpoint, response).await)
    }

    /// Like [`Self::send`], but a 404 means the resource is already gone.
    async fn send_delete(endpoint: &str, request: RequestBuilder) -> Result<(), BackendError> {
        let response = request.send().await.map_err(|source| BackendError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error(endpoint, response).await)
    }

    async fn decode<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T, BackendError> {
        response.json().await.map_err(|e| BackendError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    async fn start_container(&self, endpoint: &str, id: &str) -> Result<(), BackendError> {
        let url = self.docker_url(endpoint, &format!("containers/{id}/start"));
        let request = self.authorized(Method::POST, endpoint, url)?.json(&Empty {});
        Self::send(endpoint, request).await?;
        Ok(())
    }
}

async fn status_error(endpoint: &str, response: Response) -> BackendError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    BackendError::Status {
        endpoint: endpoint.to_string(),
        status,
        body,
    }
}

#[async_trait]
impl Backend for PortainerBackend {
    async fn authenticate(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
    ) -> Result<String, BackendError> {
        let url = format!("{}/api/auth", endpoint.trim_end_matches('/'));
        let request = self
            .client
            .post(url)
            .json(&AuthRequest { username, password });
        let response = Self::send(endpoint, request).await?;
        let auth: AuthResponse = Self::decode(endpoint, response).await?;
        if auth.jwt.is_empty() {
            return Err(BackendError::Decode {
                endpoint: endpoint.to_string(),
                message: "empty session token".into(),
            });
        }
        Ok(auth.jwt)
    }

    async fn create_container(
        &self,
        endpoint: &str,
        spec: &ContainerSpec,
    ) -> Result<String, BackendError> {
        let url = self.docker_url(endpoint, "containers/create");
        let request = self
            .authorized(Method::POST, endpoint, url)?
            .query(&[("name", spec.name.as_str())])
            .json(&CreateContainerRequest::new(spec));
        let response = Self::send(endpoint, request).await?;
        let created: ContainerCreated = Self::decode(endpoint, response).await?;
        debug!(endpoint = %endpoint, id = %created.id, "container created");

        if let Err(err) = self.start_container(endpoint, &created.id).await {
            // Nobody else knows the id yet, so the container would be orphaned.
            if let Err(delete_err) = self.delete_container(endpoint, &created.id).await {
                warn!(
                    endpoint = %endpoint,
                    id = %created.id,
                    error = %delete_err,
                    "failed to delete container that did not start"
                );
            }
            return Err(err);
        }
        info!(endpoint = %endpoint, id = %created.id, name = %spec.name, "container started");
        Ok(created.id)
    }

    async fn create_stack(
        &self,
        endpoint: &str,
        name: &str,
        compose: &str,
    ) -> Result<String, BackendError> {
        let url = format!("{}/api/stacks", endpoint.trim_end_matches('/'));
        let environment_id = self.environment_id.to_string();
        let request = self
            .authorized(Method::POST, endpoint, url)?
            .query(&[
                ("type", "2"),
                ("method", "string"),
                ("endpointId", environment_id.as_str()),
            ])
            .json(&CreateStackRequest {
                name,
                stack_file_content: compose,
            });
        let response = Self::send(endpoint, request).await?;
        let created: StackCreated = Self::decode(endpoint, response).await?;
        info!(endpoint = %endpoint, id = created.id, name = %name, "stack deployed");
        Ok(created.id.to_string())
    }

    async fn delete_container(&self, endpoint: &str, id: &str) -> Result<(), BackendError> {
        let url = self.docker_url(endpoint, &format!("containers/{id}"));
        let request = self
            .authorized(Method::DELETE, endpoint, url)?
            .query(&[("force", "true")]);
        Self::send_delete(endpoint, request).await?;
        info!(endpoint = %endpoint, id = %id, "container deleted");
        Ok(())
    }

    async fn delete_stack(&self, endpoint: &str, id: &str) -> Result<(), BackendError> {
        let url = format!("{}/api/stacks/{}", endpoint.trim_end_matches('/'), id);
        let environment_id = self.environment_id.to_string();
        let request = self
            .authorized(Method::DELETE, endpoint, url)?
            .query(&[("endpointId", environment_id.as_str())]);
        Self::send_delete(endpoint, request).await?;
        info!(endpoint = %endpoint, id = %id, "stack deleted");
        Ok(())
    }
}

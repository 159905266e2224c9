use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use sqimg_domain::Artifact;
use tracing::{debug, info};
use url::Url;

use crate::config::RegistryConfig;
use crate::error::BuildError;

/// Where finished artifacts are registered and dependency artifacts fetched.
pub trait ArtifactRegistry: Send + Sync {
    /// Register `artifact` and return it as the registry stored it.
    fn create_artifact(&self, artifact: &Artifact) -> Result<Artifact>;

    fn get_artifact(&self, id: &str) -> Result<Artifact>;
}

/// HTTP client for the controller's artifact API.
#[derive(Clone, Debug)]
pub struct ControllerClient {
    client: Client,
    base: Url,
    key: Option<String>,
}

impl ControllerClient {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(base: Url, key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("sqimg/", env!("CARGO_PKG_VERSION")))
            .timeout(None)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, base, key })
    }

    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        Self::new(config.base_url.clone(), config.key.clone())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base.as_str().trim_end_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.key {
            Some(key) => request.basic_auth("", Some(key)),
            None => request,
        }
    }

    fn accepted(url: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(BuildError::RegistryRejected {
            url: url.to_string(),
            status: status.as_u16(),
            body: body.trim().to_string(),
        }
        .into())
    }
}

impl ArtifactRegistry for ControllerClient {
    fn create_artifact(&self, artifact: &Artifact) -> Result<Artifact> {
        let url = self.endpoint("artifacts");
        let response = self
            .authorized(self.client.post(&url).json(artifact))
            .send()
            .with_context(|| format!("failed to POST {url}"))?;
        let body = Self::accepted(&url, response)?
            .bytes()
            .with_context(|| format!("failed to read response from {url}"))?;
        let created = if body.iter().all(u8::is_ascii_whitespace) {
            artifact.clone()
        } else {
            serde_json::from_slice(&body)
                .with_context(|| format!("failed to decode artifact from {url}"))?
        };
        info!(id = %created.id, uri = %created.uri, "artifact registered");
        Ok(created)
    }

    fn get_artifact(&self, id: &str) -> Result<Artifact> {
        let url = self.endpoint(&format!("artifacts/{id}"));
        debug!(%url, "fetching artifact");
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .with_context(|| format!("failed to GET {url}"))?;
        Self::accepted(&url, response)?
            .json()
            .with_context(|| format!("failed to decode artifact from {url}"))
    }
}

//! Content-addressed publishing to the blob store.

use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use reqwest::blocking::{Body, Client};
use reqwest::StatusCode;
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{RetryDecision, RetryPolicy};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BlobStoreConfig;
use crate::error::BuildError;
use crate::hash::content_address;

const USER_AGENT: &str = concat!("sqimg/", env!("CARGO_PKG_VERSION"));
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Declared type of an uploaded payload. It decides the file extension of the
/// destination and the request content type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Squashfs,
    Manifest,
}

impl ContentKind {
    pub fn extension(self) -> &'static str {
        match self {
            ContentKind::Squashfs => "squashfs",
            ContentKind::Manifest => "json",
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            ContentKind::Squashfs => "application/octet-stream",
            ContentKind::Manifest => "application/json",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    File(&'a Path),
}

/// Destination of content-addressed writes.
pub trait BlobStore: Send + Sync {
    /// Store `payload` at `url`. Writing the same bytes twice is harmless.
    fn put(&self, url: &Url, payload: Payload<'_>, kind: ContentKind) -> Result<()>;
}

/// Blob store spoken to over HTTP `PUT`.
///
/// Only connection failures are retried, up to `connect_attempts` tries in
/// total, with exponential backoff between tries. Requests have no timeout.
#[derive(Clone, Debug)]
pub struct HttpBlobStore {
    client: Client,
    connect_attempts: u32,
    retry_policy: ExponentialBackoff,
}

impl HttpBlobStore {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(connect_attempts: u32) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(None)
            .build()
            .context("failed to build HTTP client")?;
        let connect_attempts = connect_attempts.max(1);
        Ok(Self {
            client,
            connect_attempts,
            retry_policy: retry_policy(connect_attempts, CONNECT_BACKOFF),
        })
    }

    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn from_config(config: &BlobStoreConfig) -> Result<Self> {
        Self::new(config.connect_attempts)
    }

    /// Replace the shortest wait between connection attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.retry_policy = retry_policy(self.connect_attempts, backoff);
        self
    }

    fn body(payload: Payload<'_>) -> Result<Body> {
        match payload {
            Payload::Bytes(bytes) => Ok(Body::from(bytes.to_vec())),
            Payload::File(path) => {
                let file = File::open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                Ok(Body::from(file))
            }
        }
    }
}

impl BlobStore for HttpBlobStore {
    fn put(&self, url: &Url, payload: Payload<'_>, kind: ContentKind) -> Result<()> {
        let started = SystemTime::now();
        let mut past_retries = 0;
        let response = loop {
            let request = self
                .client
                .put(url.clone())
                .header(reqwest::header::CONTENT_TYPE, kind.media_type())
                .body(Self::body(payload)?);
            match request.send() {
                Ok(response) => break response,
                Err(err) if err.is_connect() => {
                    let RetryDecision::Retry { execute_after } =
                        self.retry_policy.should_retry(started, past_retries)
                    else {
                        return Err(err).with_context(|| format!("failed to PUT {url}"));
                    };
                    let wait = execute_after
                        .duration_since(SystemTime::now())
                        .unwrap_or_default();
                    past_retries += 1;
                    warn!(
                        %url,
                        attempt = past_retries,
                        %err,
                        ?wait,
                        "blob store connection failed; retrying"
                    );
                    thread::sleep(wait);
                }
                Err(err) => return Err(err).with_context(|| format!("failed to PUT {url}")),
            }
        };
        let status = response.status();
        if status != StatusCode::OK {
            return Err(BuildError::UploadRejected {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        debug!(%url, "blob stored");
        Ok(())
    }
}

fn retry_policy(connect_attempts: u32, backoff: Duration) -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .retry_bounds(backoff, backoff.max(CONNECT_BACKOFF_MAX))
        .build_with_max_retries(connect_attempts - 1)
}

/// Publishes payloads under `{base}/{prefix}/{namespace}/{address}.{ext}`.
pub struct Uploader<'a> {
    store: &'a dyn BlobStore,
    base: Url,
    prefix: String,
}

impl<'a> Uploader<'a> {
    pub fn new(store: &'a dyn BlobStore, base: Url, prefix: impl Into<String>) -> Self {
        Self {
            store,
            base,
            prefix: prefix.into(),
        }
    }

    /// Destination of content `address` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error when the pieces do not form a valid URL.
    pub fn location(&self, namespace: &str, address: &str, kind: ContentKind) -> Result<Url> {
        let raw = format!(
            "{}/{}/{namespace}/{address}.{}",
            self.base.as_str().trim_end_matches('/'),
            self.prefix.trim_matches('/'),
            kind.extension()
        );
        Url::parse(&raw).with_context(|| format!("invalid blob URL {raw}"))
    }

    /// Hash `bytes` and store them at their content address.
    ///
    /// # Errors
    ///
    /// Transport failures and non-OK answers are returned as is.
    pub fn upload_bytes(&self, namespace: &str, bytes: &[u8], kind: ContentKind) -> Result<Url> {
        let url = self.location(namespace, &content_address(bytes), kind)?;
        self.store.put(&url, Payload::Bytes(bytes), kind)?;
        info!(%url, length = bytes.len(), "uploaded");
        Ok(url)
    }

    /// Store the file at `path` under an address the caller already knows.
    ///
    /// # Errors
    ///
    /// Transport failures and non-OK answers are returned as is.
    pub fn upload_file(
        &self,
        namespace: &str,
        path: &Path,
        sha512: &str,
        kind: ContentKind,
    ) -> Result<Url> {
        let url = self.location(namespace, sha512, kind)?;
        self.store.put(&url, Payload::File(path), kind)?;
        info!(%url, path = %path.display(), "uploaded");
        Ok(url)
    }
}

//! Backend forwarding interface.
//!
//! The gateway does not implement any backend logic. Admitted calls are
//! handed to a [`Backend`] by backend id; the payload is forwarded opaquely.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::Grant;
use crate::permissions::Transport;
use crate::{Error, Result};

/// Header telling the backend which capabilities the caller holds.
pub const CAPABILITIES_HEADER: &str = "x-lightgate-capabilities";

/// Header telling the backend which credential kind admitted the call.
pub const CREDENTIAL_HEADER: &str = "x-lightgate-credential";

/// How the payload bytes are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// Serialized protobuf message (native / web-framed RPC, tunnel).
    Protobuf,
    /// JSON document (JSON transport).
    Json,
}

impl PayloadEncoding {
    /// Content type used when forwarding.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Protobuf => "application/x-protobuf",
            Self::Json => "application/json",
        }
    }
}

/// An admitted call on its way to a backend.
#[derive(Debug, Clone)]
pub struct BackendCall {
    /// Admission result (method, backend, capabilities).
    pub grant: Grant,
    /// Transport the call arrived on.
    pub transport: Transport,
    /// Payload encoding.
    pub encoding: PayloadEncoding,
    /// Request message.
    pub payload: Bytes,
}

/// Backend call failure, mapped to an RPC status by the codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// No backend registered under this id.
    #[error("backend '{0}' is not configured")]
    NotConfigured(String),

    /// Backend unreachable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Backend did not answer in time.
    #[error("backend timed out")]
    Timeout,

    /// Backend answered with an error.
    #[error("backend error {code}: {message}")]
    Status {
        /// gRPC status code.
        code: u16,
        /// Error message from the backend.
        message: String,
    },
}

impl BackendError {
    /// gRPC status code for this failure.
    #[must_use]
    pub fn grpc_status(&self) -> u16 {
        match self {
            Self::NotConfigured(_) => 12, // UNIMPLEMENTED
            Self::Unavailable(_) => 14,   // UNAVAILABLE
            Self::Timeout => 4,           // DEADLINE_EXCEEDED
            Self::Status { code, .. } => *code,
        }
    }

    /// Message shown to callers. Connection detail such as the backend
    /// address only goes to the logs.
    #[must_use]
    pub fn external_message(&self) -> String {
        match self {
            Self::Unavailable(_) => "backend unavailable".to_string(),
            other => other.to_string(),
        }
    }

    /// HTTP status for the JSON transport.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self.grpc_status() {
            3 => 400,
            4 => 504,
            5 => 404,
            7 => 403,
            12 => 501,
            14 => 503,
            _ => 500,
        }
    }
}

/// A service the gateway forwards admitted calls to.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute `call` and return the response message.
    async fn invoke(&self, call: BackendCall) -> std::result::Result<Bytes, BackendError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP backend
// ─────────────────────────────────────────────────────────────────────────────

/// Backend reached by POSTing the payload to `{url}{method}`.
pub struct HttpBackend {
    id: String,
    url: String,
    client: Client,
}

impl fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBackend")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    /// Create a backend client.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(id: &str, url: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Config(format!("Backend '{id}' has invalid URL '{url}': {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Config(format!("Backend '{id}' client: {e}")))?;

        Ok(Self {
            id: id.to_string(),
            url: parsed.as_str().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn invoke(&self, call: BackendCall) -> std::result::Result<Bytes, BackendError> {
        let target = format!("{}{}", self.url, call.grant.method);
        let capabilities = call
            .grant
            .capabilities
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        debug!(backend = %self.id, url = %target, "Forwarding call");

        let response = self
            .client
            .post(&target)
            .header("content-type", call.encoding.content_type())
            .header(CAPABILITIES_HEADER, capabilities)
            .header(CREDENTIAL_HEADER, call.grant.credential.to_string())
            .body(call.payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Unavailable(e.to_string())
            }
        })?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(BackendError::Status {
                code: grpc_code_for_http(status.as_u16()),
                message: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

fn grpc_code_for_http(status: u16) -> u16 {
    match status {
        400 => 3,
        401 => 16,
        403 => 7,
        404 => 12,
        429 | 502..=504 => 14,
        _ => 2,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Backends by id.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.backends.keys()).finish()
    }
}

impl BackendRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under `id`, replacing any previous entry.
    pub fn insert(&mut self, id: impl Into<String>, backend: Arc<dyn Backend>) {
        self.backends.insert(id.into(), backend);
    }

    /// Forward an admitted call to its backend.
    ///
    /// # Errors
    ///
    /// `NotConfigured` if the grant names an unknown backend, otherwise
    /// whatever the backend returns.
    pub async fn forward(&self, call: BackendCall) -> std::result::Result<Bytes, BackendError> {
        let backend = self
            .backends
            .get(&call.grant.backend)
            .cloned()
            .ok_or_else(|| BackendError::NotConfigured(call.grant.backend.clone()))?;
        let id = call.grant.backend.clone();
        backend.invoke(call).await.inspect_err(|e| {
            warn!(backend = %id, error = %e, "Backend call failed");
        })
    }

    /// Registered ids.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

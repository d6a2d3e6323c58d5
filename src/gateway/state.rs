//! Shared per-process state reached from every connection.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::auth::{Admission, AuthError, GRPC_STATUS_UNAUTHENTICATED, Grant};
use crate::backend::{BackendCall, BackendError, BackendRegistry, PayloadEncoding};
use crate::credentials::{Credential, VerifyContext};
use crate::permissions::Transport;

/// Connection-level knobs.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Upper bound for the TLS handshake, connection sniffing and the tunnel
    /// handshake.
    pub handshake_timeout: Duration,
    /// Maximum request body size.
    pub request_body_limit: usize,
    /// Static UI bundle.
    pub static_dir: Option<PathBuf>,
    /// Tunnel pairing secret; `None` disables the tunnel transport.
    pub tunnel_secret: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_body_limit: 4 * 1024 * 1024,
            static_dir: None,
            tunnel_secret: None,
        }
    }
}

/// Failure of an admitted-then-forwarded call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Admission refused the call; the backend was not contacted.
    #[error(transparent)]
    Rejected(#[from] AuthError),
    /// The backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CallError {
    /// gRPC status code.
    #[must_use]
    pub fn grpc_status(&self) -> u16 {
        match self {
            Self::Rejected(_) => GRPC_STATUS_UNAUTHENTICATED,
            Self::Backend(e) => e.grpc_status(),
        }
    }

    /// Message shown to the caller. Rejections never carry detail.
    #[must_use]
    pub fn external_message(&self) -> String {
        match self {
            Self::Rejected(e) => e.external_message().to_string(),
            Self::Backend(e) => e.external_message(),
        }
    }

    /// HTTP status for the JSON transport.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Rejected(_) => 401,
            Self::Backend(e) => e.http_status(),
        }
    }
}

/// Admission chain, backends and settings.
#[derive(Debug)]
pub struct GatewayState {
    /// Admission chain.
    pub admission: Admission,
    /// Backend forwarding.
    pub backends: BackendRegistry,
    /// Connection settings.
    pub settings: GatewaySettings,
}

impl GatewayState {
    /// Bundle the pieces.
    #[must_use]
    pub fn new(admission: Admission, backends: BackendRegistry, settings: GatewaySettings) -> Self {
        Self {
            admission,
            backends,
            settings,
        }
    }

    /// Admit a call.
    ///
    /// # Errors
    ///
    /// See [`Admission::admit`].
    pub fn admit(
        &self,
        method: &str,
        transport: Transport,
        credential: Option<&Credential>,
        ctx: &VerifyContext,
    ) -> Result<Grant, AuthError> {
        self.admission.admit(method, transport, credential, ctx)
    }

    /// Forward an admitted call.
    ///
    /// # Errors
    ///
    /// Whatever the backend returns.
    pub async fn forward(
        &self,
        grant: Grant,
        transport: Transport,
        encoding: PayloadEncoding,
        payload: Bytes,
    ) -> Result<Bytes, BackendError> {
        self.backends
            .forward(BackendCall {
                grant,
                transport,
                encoding,
                payload,
            })
            .await
    }

    /// Admit, then forward.
    ///
    /// # Errors
    ///
    /// `Rejected` before any backend contact, or `Backend`.
    pub async fn call(
        &self,
        method: &str,
        transport: Transport,
        credential: Option<&Credential>,
        ctx: &VerifyContext,
        encoding: PayloadEncoding,
        payload: Bytes,
    ) -> Result<Bytes, CallError> {
        let grant = self.admit(method, transport, credential, ctx)?;
        Ok(self.forward(grant, transport, encoding, payload).await?)
    }
}

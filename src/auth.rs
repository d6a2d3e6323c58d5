//! Admission chain for every transport.
//!
//! Per request:
//! 1. extract the presented credential from headers / tunnel metadata
//! 2. classify it by shape into a [`Credential`] variant
//! 3. consult the [`PermissionRegistry`] with `(endpoint, transport, kind)`
//! 4. validate via the [`CredentialStore`] or the [`SessionManager`]
//!
//! Every failure is an [`AuthError`]. The variant is logged; callers only
//! ever show [`REJECTION_MESSAGE`], so a caller cannot tell a wrong
//! credential from a closed door.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{Credential, CredentialStore, SessionSecret, VerifyContext};
use crate::macaroon::Macaroon;
use crate::permissions::{Capability, CredentialKind, PermissionRegistry, Transport};
use crate::session::SessionManager;

/// Header carrying a hex macaroon on native and web-framed RPC.
pub const MACAROON_HEADER: &str = "macaroon";

/// Header carrying a hex macaroon on JSON requests.
pub const GRPC_METADATA_MACAROON_HEADER: &str = "grpc-metadata-macaroon";

/// Cookie holding the UI session token.
pub const SESSION_COOKIE: &str = "lightgate_session";

/// The only message a rejected caller ever sees.
pub const REJECTION_MESSAGE: &str = "authentication required";

/// gRPC status code used for every rejection (`UNAUTHENTICATED`).
pub const GRPC_STATUS_UNAUTHENTICATED: u16 = 16;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Why a request was not admitted. Internal detail only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential, or a session credential that did not validate.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Macaroon signature chain broken or signed by an unknown key.
    #[error("invalid signature")]
    InvalidSignature,

    /// A macaroon caveat does not hold for this request.
    #[error("caveat unsatisfied: {0}")]
    CaveatUnsatisfied(String),

    /// The macaroon's capability set lacks what the endpoint requires.
    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    /// The registry does not open this endpoint for this transport and
    /// credential kind.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The presented value has no recognisable credential shape.
    #[error("malformed credential: {0}")]
    MalformedCredential(String),
}

impl AuthError {
    /// Externally visible message, identical for every variant.
    #[must_use]
    pub fn external_message(&self) -> &'static str {
        REJECTION_MESSAGE
    }

    /// Short label for logs and metrics fields.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::InvalidSignature => "invalid_signature",
            Self::CaveatUnsatisfied(_) => "caveat_unsatisfied",
            Self::CapabilityDenied(_) => "capability_denied",
            Self::PermissionDenied(_) => "permission_denied",
            Self::MalformedCredential(_) => "malformed_credential",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction / classification
// ─────────────────────────────────────────────────────────────────────────────

/// Classify a macaroon header value.
///
/// # Errors
///
/// Returns `MalformedCredential` if the value is not a hex macaroon.
pub fn classify_macaroon(value: &str) -> Result<Credential, AuthError> {
    Macaroon::decode(value.trim())
        .map(Credential::from_macaroon)
        .map_err(|e| AuthError::MalformedCredential(e.to_string()))
}

/// Extract the credential from HTTP request headers.
///
/// Precedence: macaroon header, then `Authorization: Basic`, then the
/// session cookie. `Ok(None)` means nothing was presented.
///
/// # Errors
///
/// Returns `MalformedCredential` for a value that is present but unusable.
pub fn extract_from_headers(
    headers: &HeaderMap,
    transport: Transport,
) -> Result<Option<Credential>, AuthError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    // JSON clients use the grpc-gateway spelling first
    let macaroon = match transport {
        Transport::JsonHttp => {
            header(GRPC_METADATA_MACAROON_HEADER).or_else(|| header(MACAROON_HEADER))
        }
        _ => header(MACAROON_HEADER).or_else(|| header(GRPC_METADATA_MACAROON_HEADER)),
    };
    if let Some(value) = macaroon {
        return classify_macaroon(value).map(Some);
    }

    if let Some(value) = header("authorization") {
        return classify_authorization(value).map(Some);
    }

    Ok(headers
        .get_all("cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(session_cookie)
        .map(|token| Credential::Session(SessionSecret::Token(token.to_string()))))
}

/// Extract the credential for a call that arrived through a tunnel session.
///
/// An embedded macaroon takes precedence; otherwise the tunnel session
/// itself is the credential.
///
/// # Errors
///
/// Returns `MalformedCredential` if the embedded macaroon cannot be decoded.
pub fn extract_from_tunnel(
    metadata: &std::collections::BTreeMap<String, String>,
    session_id: &str,
) -> Result<Credential, AuthError> {
    match metadata.get(MACAROON_HEADER) {
        Some(value) => classify_macaroon(value),
        None => Ok(Credential::Tunnel {
            session_id: session_id.to_string(),
        }),
    }
}

fn classify_authorization(value: &str) -> Result<Credential, AuthError> {
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))
        .ok_or_else(|| AuthError::MalformedCredential("unsupported authorization scheme".into()))?;
    let decoded = BASE64
        .decode(encoded.trim())
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(|| AuthError::MalformedCredential("invalid basic credentials".into()))?;
    let password = decoded
        .split_once(':')
        .map_or(decoded.as_str(), |(_, password)| password);
    Ok(Credential::Session(SessionSecret::Password(
        password.to_string(),
    )))
}

fn session_cookie(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then_some(value)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission
// ─────────────────────────────────────────────────────────────────────────────

/// An admitted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Endpoint method.
    pub method: String,
    /// Backend the call goes to.
    pub backend: String,
    /// Kind of credential that opened the door.
    pub credential: CredentialKind,
    /// Verified capability set, attached to the forwarded call.
    pub capabilities: BTreeSet<Capability>,
}

/// The admission chain shared by all connections.
#[derive(Debug, Clone)]
pub struct Admission {
    registry: Arc<PermissionRegistry>,
    credentials: Arc<CredentialStore>,
    sessions: Arc<SessionManager>,
    session_capabilities: BTreeSet<Capability>,
}

impl Admission {
    /// Build the chain.
    #[must_use]
    pub fn new(
        registry: Arc<PermissionRegistry>,
        credentials: Arc<CredentialStore>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        let session_capabilities = registry
            .endpoints()
            .filter(|e| e.accepts_session_on_gateway_port)
            .map(|e| e.capability.clone())
            .collect();
        Self {
            registry,
            credentials,
            sessions,
            session_capabilities,
        }
    }

    /// Endpoint registry.
    #[must_use]
    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    /// UI session manager.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Decide whether `credential` may call `method` over `transport`.
    ///
    /// The decision is recomputed for every call; nothing is cached.
    ///
    /// # Errors
    ///
    /// Any [`AuthError`]. The caller must not reach the backend on error.
    pub fn admit(
        &self,
        method: &str,
        transport: Transport,
        credential: Option<&Credential>,
        ctx: &VerifyContext,
    ) -> Result<Grant, AuthError> {
        let result = self.decide(method, transport, credential, ctx);
        let kind = credential.map_or("none".to_string(), |c| c.kind().to_string());
        match &result {
            Ok(grant) => debug!(
                endpoint = %method,
                transport = %transport,
                credential = %kind,
                capabilities = grant.capabilities.len(),
                "Request admitted"
            ),
            Err(e) => warn!(
                endpoint = %method,
                transport = %transport,
                credential = %kind,
                reason = e.reason(),
                detail = %e,
                "Request rejected"
            ),
        }
        result
    }

    fn decide(
        &self,
        method: &str,
        transport: Transport,
        credential: Option<&Credential>,
        ctx: &VerifyContext,
    ) -> Result<Grant, AuthError> {
        let credential =
            credential.ok_or_else(|| AuthError::Unauthenticated("no credential".into()))?;
        let kind = credential.kind();

        let endpoint = self
            .registry
            .get(method)
            .ok_or_else(|| AuthError::PermissionDenied(format!("unknown endpoint {method}")))?;
        if !self.registry.is_allowed(method, transport, kind) {
            return Err(AuthError::PermissionDenied(format!(
                "{kind} not accepted over {transport}"
            )));
        }

        let capabilities = match credential {
            Credential::ScopedMacaroon(mac) => {
                if mac.location() != endpoint.backend {
                    return Err(AuthError::PermissionDenied(format!(
                        "macaroon for '{}' presented to '{}'",
                        mac.location(),
                        endpoint.backend
                    )));
                }
                self.credentials
                    .verify(mac, &endpoint.backend, &endpoint.capability, ctx)?
            }
            Credential::SuperMacaroon(mac) => {
                self.credentials
                    .verify(mac, &endpoint.backend, &endpoint.capability, ctx)?
            }
            Credential::Session(secret) => {
                let valid = match secret {
                    SessionSecret::Password(password) => self.sessions.validate(password),
                    SessionSecret::Token(token) => self.sessions.validate_token(token),
                };
                if !valid {
                    return Err(AuthError::Unauthenticated("session credential rejected".into()));
                }
                self.session_capabilities.clone()
            }
            Credential::Tunnel { .. } => BTreeSet::from([endpoint.capability.clone()]),
        };

        Ok(Grant {
            method: endpoint.method.clone(),
            backend: endpoint.backend.clone(),
            credential: kind,
            capabilities,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Constraints;
    use axum::http::HeaderValue;

    const PASSWORD: &str = "hunter2hunter2";
    const GET_INFO: &str = "/noderpc.Node/GetInfo";
    const BAKE: &str = "/noderpc.Node/BakeMacaroon";
    const SUB_SERVER_STATUS: &str = "/gatewayrpc.Status/SubServerStatus";

    fn admission() -> Admission {
        let registry = Arc::new(PermissionRegistry::with_extra(&[]).unwrap());
        let credentials = Arc::new(CredentialStore::ephemeral(
            registry.capabilities_by_backend(),
        ));
        let sessions = Arc::new(SessionManager::new(PASSWORD, None));
        Admission::new(registry, credentials, sessions)
    }

    fn ctx() -> VerifyContext {
        VerifyContext::now(None)
    }

    fn scoped(a: &Admission, backend: &str, caps: &[&str]) -> Credential {
        let caps = caps.iter().map(|c| c.parse().unwrap()).collect();
        a.credentials
            .bake_scoped(backend, &caps, &Constraints::default())
            .unwrap()
    }

    fn password(p: &str) -> Credential {
        Credential::Session(SessionSecret::Password(p.to_string()))
    }

    #[test]
    fn missing_credential_is_unauthenticated() {
        let a = admission();
        let err = a.admit(GET_INFO, Transport::NativeRpc, None, &ctx()).unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)));
    }

    #[test]
    fn scoped_macaroon_admitted_for_own_backend() {
        let a = admission();
        let cred = scoped(&a, "node", &["info:read"]);
        let grant = a
            .admit(GET_INFO, Transport::NativeRpc, Some(&cred), &ctx())
            .unwrap();
        assert_eq!(grant.backend, "node");
        assert_eq!(grant.credential, CredentialKind::Macaroon);
    }

    #[test]
    fn scoped_macaroon_for_other_backend_is_permission_denied() {
        // GIVEN: a valid swap macaroon
        let a = admission();
        let cred = scoped(&a, "swap", &["swap:read"]);
        // WHEN: calling a node endpoint
        let err = a
            .admit(GET_INFO, Transport::NativeRpc, Some(&cred), &ctx())
            .unwrap_err();
        // THEN
        assert!(matches!(err, AuthError::PermissionDenied(_)));
    }

    #[test]
    fn session_on_macaroon_only_endpoint_rejected_like_missing_credential() {
        let a = admission();
        let cred = password(PASSWORD);
        let denied = a
            .admit(BAKE, Transport::NativeRpc, Some(&cred), &ctx())
            .unwrap_err();
        let missing = a.admit(BAKE, Transport::NativeRpc, None, &ctx()).unwrap_err();
        assert!(matches!(denied, AuthError::PermissionDenied(_)));
        assert_eq!(denied.external_message(), missing.external_message());
        // Registry denial happens before validation; the session stays inactive
        assert!(!a.sessions().is_active());
    }

    #[test]
    fn session_password_admitted_and_activates_session() {
        let a = admission();
        let grant = a
            .admit(GET_INFO, Transport::WebRpc, Some(&password(PASSWORD)), &ctx())
            .unwrap();
        assert_eq!(grant.credential, CredentialKind::Session);
        assert!(a.sessions().is_active());
    }

    #[test]
    fn wrong_password_is_unauthenticated() {
        let a = admission();
        let err = a
            .admit(GET_INFO, Transport::WebRpc, Some(&password("nope")), &ctx())
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)));
        assert!(!a.sessions().is_active());
    }

    #[test]
    fn macaroon_rejected_where_only_sessions_are_accepted() {
        let a = admission();
        let cred = a
            .credentials
            .bake_super(false, &Constraints::default())
            .unwrap();
        let err = a
            .admit(SUB_SERVER_STATUS, Transport::NativeRpc, Some(&cred), &ctx())
            .unwrap_err();
        assert!(matches!(err, AuthError::PermissionDenied(_)));
    }

    #[test]
    fn tunnel_credential_only_over_tunnel() {
        let a = admission();
        let cred = Credential::Tunnel {
            session_id: "t1".into(),
        };
        assert!(a.admit(GET_INFO, Transport::Tunnel, Some(&cred), &ctx()).is_ok());
        assert!(matches!(
            a.admit(GET_INFO, Transport::NativeRpc, Some(&cred), &ctx()),
            Err(AuthError::PermissionDenied(_))
        ));
    }

    #[test]
    fn tunnel_rejects_non_tunnel_endpoint_even_with_valid_macaroon() {
        let a = admission();
        let cred = scoped(&a, "node", &["macaroon:generate"]);
        assert!(a.admit(BAKE, Transport::NativeRpc, Some(&cred), &ctx()).is_ok());
        assert!(matches!(
            a.admit(BAKE, Transport::Tunnel, Some(&cred), &ctx()),
            Err(AuthError::PermissionDenied(_))
        ));
    }

    #[test]
    fn unknown_endpoint_is_permission_denied() {
        let a = admission();
        let cred = scoped(&a, "node", &["info:read"]);
        assert!(matches!(
            a.admit("/x.Y/Z", Transport::NativeRpc, Some(&cred), &ctx()),
            Err(AuthError::PermissionDenied(_))
        ));
    }

    #[test]
    fn all_errors_share_one_external_message() {
        let errors = [
            AuthError::Unauthenticated("x".into()),
            AuthError::InvalidSignature,
            AuthError::CaveatUnsatisfied("x".into()),
            AuthError::CapabilityDenied("x".into()),
            AuthError::PermissionDenied("x".into()),
            AuthError::MalformedCredential("x".into()),
        ];
        for e in &errors {
            assert_eq!(e.external_message(), REJECTION_MESSAGE);
        }
    }

    #[test]
    fn extracts_macaroon_header() {
        let a = admission();
        let cred = scoped(&a, "node", &["info:read"]);
        let mut headers = HeaderMap::new();
        headers.insert(
            MACAROON_HEADER,
            HeaderValue::from_str(&cred.macaroon().unwrap().encode()).unwrap(),
        );
        let got = extract_from_headers(&headers, Transport::NativeRpc)
            .unwrap()
            .unwrap();
        assert_eq!(got.kind(), CredentialKind::Macaroon);
    }

    #[test]
    fn extracts_basic_password_and_cookie() {
        let mut headers = HeaderMap::new();
        let basic = format!("Basic {}", BASE64.encode(format!("admin:{PASSWORD}")));
        headers.insert("authorization", HeaderValue::from_str(&basic).unwrap());
        match extract_from_headers(&headers, Transport::JsonHttp).unwrap() {
            Some(Credential::Session(SessionSecret::Password(p))) => assert_eq!(p, PASSWORD),
            other => panic!("unexpected {other:?}"),
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_static("theme=dark; lightgate_session=abc123"),
        );
        match extract_from_headers(&headers, Transport::WebRpc).unwrap() {
            Some(Credential::Session(SessionSecret::Token(t))) => assert_eq!(t, "abc123"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_macaroon_is_malformed() {
        let mut headers = HeaderMap::new();
        headers.insert(MACAROON_HEADER, HeaderValue::from_static("zzzz"));
        assert!(matches!(
            extract_from_headers(&headers, Transport::NativeRpc),
            Err(AuthError::MalformedCredential(_))
        ));
    }

    #[test]
    fn no_headers_means_no_credential() {
        assert!(
            extract_from_headers(&HeaderMap::new(), Transport::NativeRpc)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn tunnel_metadata_prefers_embedded_macaroon() {
        let a = admission();
        let cred = scoped(&a, "node", &["info:read"]);
        let mut metadata = std::collections::BTreeMap::new();
        assert_eq!(
            extract_from_tunnel(&metadata, "t1").unwrap().kind(),
            CredentialKind::Tunnel
        );
        metadata.insert(MACAROON_HEADER.to_string(), cred.macaroon().unwrap().encode());
        assert_eq!(
            extract_from_tunnel(&metadata, "t1").unwrap().kind(),
            CredentialKind::Macaroon
        );
    }
}

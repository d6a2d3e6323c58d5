//! Per-request framing classification.

use axum::http::{HeaderMap, header::CONTENT_TYPE};

use crate::permissions::PermissionRegistry;

/// How a request body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebEncoding {
    /// `application/grpc-web[+proto]`
    Binary,
    /// `application/grpc-web-text[+proto]`
    Text,
}

/// The codec path a request takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// HTTP/2 gRPC; the path is the method.
    NativeRpc,
    /// gRPC-web at an endpoint's web URI.
    WebRpc(WebEncoding),
    /// JSON at an endpoint's JSON URI.
    Json,
    /// Anything else: static UI.
    Fallback,
}

impl Framing {
    /// Classify by content type first, then by registered JSON path.
    #[must_use]
    pub fn classify(headers: &HeaderMap, path: &str, registry: &PermissionRegistry) -> Self {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        // Most specific prefix first
        if content_type.starts_with("application/grpc-web-text") {
            Self::WebRpc(WebEncoding::Text)
        } else if content_type.starts_with("application/grpc-web") {
            Self::WebRpc(WebEncoding::Binary)
        } else if content_type.starts_with("application/grpc") {
            Self::NativeRpc
        } else if registry.by_json_uri(path).is_some() {
            Self::Json
        } else {
            Self::Fallback
        }
    }
}

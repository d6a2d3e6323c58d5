//! HTTP router and handlers

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes, to_bytes},
    extract::{Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{ALLOW, CONTENT_TYPE, SET_COOKIE, WWW_AUTHENTICATE},
    },
    response::{Html, IntoResponse, Response},
    routing::post,
};
use http_body_util::StreamBody;
use hyper::body::Frame;
use serde::Deserialize;
use serde_json::json;
use tower::ServiceExt;
use tower_http::{
    catch_panic::CatchPanicLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use super::framing::{Framing, WebEncoding};
use super::grpc;
use crate::auth::{
    AuthError, GRPC_STATUS_UNAUTHENTICATED, REJECTION_MESSAGE, SESSION_COOKIE,
    extract_from_headers,
};
use crate::backend::PayloadEncoding;
use crate::credentials::{Credential, SessionSecret, VerifyContext};
use crate::gateway::{CallError, GatewayState};
use crate::permissions::Transport;

/// Peer address of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Built-in index document used when no UI bundle is configured.
const BUILTIN_INDEX: &str = "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>lightgate</title></head>\n<body><div id=\"root\">lightgate</div></body></html>\n";

static GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
static GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");

/// Router state: gateway plus the static UI service.
#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
    assets: Option<ServeDir<ServeFile>>,
}

/// Create the router
pub fn create_router(gateway: Arc<GatewayState>) -> Router {
    let assets = gateway.settings.static_dir.as_ref().map(|dir| {
        ServeDir::new(dir)
            .call_fallback_on_method_not_allowed(true)
            .fallback(ServeFile::new(dir.join("index.html")))
    });

    Router::new()
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler))
        .fallback(dispatch_handler)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { gateway, assets })
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Classify, admit, decode, forward.
async fn dispatch_handler(State(app): State<AppState>, request: Request) -> Response {
    let framing = Framing::classify(
        request.headers(),
        request.uri().path(),
        app.gateway.admission.registry(),
    );
    let client_ip = request
        .extensions()
        .get::<ClientAddr>()
        .map(|ClientAddr(addr)| addr.ip());
    let ctx = VerifyContext::now(client_ip);

    match framing {
        Framing::NativeRpc => native_rpc(&app.gateway, request, &ctx).await,
        Framing::WebRpc(encoding) => web_rpc(&app.gateway, request, encoding, &ctx).await,
        Framing::Json => json_call(&app.gateway, request, &ctx).await,
        Framing::Fallback => serve_ui(app.assets, request).await,
    }
}

/// Body bytes within the configured limit.
async fn read_body(gateway: &GatewayState, body: Body) -> Result<Bytes, Response> {
    to_bytes(body, gateway.settings.request_body_limit)
        .await
        .map_err(|e| {
            debug!(error = %e, "Request body rejected");
            StatusCode::PAYLOAD_TOO_LARGE.into_response()
        })
}

/// Unusable credential values are rejected like any admission failure.
fn log_extraction_failure(method: &str, transport: Transport, e: &AuthError) {
    warn!(
        endpoint = %method,
        transport = %transport,
        reason = e.reason(),
        detail = %e,
        "Request rejected"
    );
}

async fn native_rpc(gateway: &GatewayState, request: Request, ctx: &VerifyContext) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.uri.path().to_string();

    let grant = match extract_from_headers(&parts.headers, Transport::NativeRpc)
        .inspect_err(|e| log_extraction_failure(&method, Transport::NativeRpc, e))
        .and_then(|cred| gateway.admit(&method, Transport::NativeRpc, cred.as_ref(), ctx))
    {
        Ok(grant) => grant,
        Err(_) => {
            return grpc_trailers_only(
                "application/grpc",
                GRPC_STATUS_UNAUTHENTICATED,
                REJECTION_MESSAGE,
            );
        }
    };

    let body = match read_body(gateway, body).await {
        Ok(b) => b,
        Err(response) => return response,
    };
    let message = match grpc::decode_unary(&body) {
        Ok(m) => m,
        Err(e) => return framing_error(&e),
    };

    match gateway
        .forward(grant, Transport::NativeRpc, PayloadEncoding::Protobuf, message)
        .await
    {
        Ok(reply) => {
            let frames = vec![
                Ok::<_, Infallible>(Frame::data(grpc::encode_message(&reply))),
                Ok(Frame::trailers(grpc_status_headers(grpc::STATUS_OK, ""))),
            ];
            let mut response = Response::new(Body::new(StreamBody::new(futures::stream::iter(
                frames,
            ))));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
            response
        }
        Err(e) => {
            let e = CallError::from(e);
            grpc_trailers_only("application/grpc", e.grpc_status(), &e.external_message())
        }
    }
}

async fn web_rpc(
    gateway: &GatewayState,
    request: Request,
    encoding: WebEncoding,
    ctx: &VerifyContext,
) -> Response {
    let content_type = match encoding {
        WebEncoding::Binary => "application/grpc-web+proto",
        WebEncoding::Text => "application/grpc-web-text+proto",
    };
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    // Unknown web paths are rejected like closed doors
    let method = gateway
        .admission
        .registry()
        .by_web_uri(&path)
        .map_or(path, |e| e.method.clone());

    let grant = match extract_from_headers(&parts.headers, Transport::WebRpc)
        .inspect_err(|e| log_extraction_failure(&method, Transport::WebRpc, e))
        .and_then(|cred| gateway.admit(&method, Transport::WebRpc, cred.as_ref(), ctx))
    {
        Ok(grant) => grant,
        Err(_) => {
            return grpc_trailers_only(content_type, GRPC_STATUS_UNAUTHENTICATED, REJECTION_MESSAGE);
        }
    };

    let body = match read_body(gateway, body).await {
        Ok(b) => b,
        Err(response) => return response,
    };
    let decoded = match encoding {
        WebEncoding::Binary => Ok(body.to_vec()),
        WebEncoding::Text => grpc::decode_text(&body),
    };
    let message = match decoded.and_then(|raw| grpc::decode_unary(&raw)) {
        Ok(m) => m,
        Err(e) => return framing_error(&e),
    };

    let (status, message_text, reply) = match gateway
        .forward(grant, Transport::WebRpc, PayloadEncoding::Protobuf, message)
        .await
    {
        Ok(reply) => (grpc::STATUS_OK, String::new(), Some(reply)),
        Err(e) => {
            let e = CallError::from(e);
            (e.grpc_status(), e.external_message(), None)
        }
    };

    let mut binary = Vec::new();
    if let Some(reply) = reply {
        binary.extend_from_slice(&grpc::encode_message(&reply));
    }
    binary.extend_from_slice(&grpc::encode_web_trailers(status, &message_text));
    let body = match encoding {
        WebEncoding::Binary => Bytes::from(binary),
        WebEncoding::Text => grpc::encode_text(&binary),
    };

    ([(CONTENT_TYPE, content_type)], body).into_response()
}

async fn json_call(gateway: &GatewayState, request: Request, ctx: &VerifyContext) -> Response {
    let (parts, body) = request.into_parts();
    let Some(method) = gateway
        .admission
        .registry()
        .by_json_uri(parts.uri.path())
        .map(|e| e.method.clone())
    else {
        return json_rejection();
    };
    let is_get = match parts.method {
        Method::POST => false,
        Method::GET => true,
        _ => {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                [(ALLOW, "GET, POST")],
                Json(json!({ "message": "use POST, or GET without a body" })),
            )
                .into_response();
        }
    };

    let grant = match extract_from_headers(&parts.headers, Transport::JsonHttp)
        .inspect_err(|e| log_extraction_failure(&method, Transport::JsonHttp, e))
        .and_then(|cred| gateway.admit(&method, Transport::JsonHttp, cred.as_ref(), ctx))
    {
        Ok(grant) => grant,
        Err(_) => return json_rejection(),
    };

    let body = match read_body(gateway, body).await {
        Ok(b) => b,
        Err(response) => return response,
    };
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Bytes::from_static(b"{}")
    } else if is_get {
        return framing_error(&crate::Error::Framing("GET request with a body".into()));
    } else if serde_json::from_slice::<serde_json::Value>(&body).is_ok() {
        body
    } else {
        return framing_error(&crate::Error::Framing("request body is not JSON".into()));
    };

    match gateway
        .forward(grant, Transport::JsonHttp, PayloadEncoding::Json, payload)
        .await
    {
        Ok(reply) => ([(CONTENT_TYPE, "application/json")], reply).into_response(),
        Err(e) => {
            let e = CallError::from(e);
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(json!({ "code": e.grpc_status(), "message": e.external_message() })),
            )
                .into_response()
        }
    }
}

async fn serve_ui(assets: Option<ServeDir<ServeFile>>, request: Request) -> Response {
    match assets {
        Some(dir) => match dir.oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        },
        None => Html(BUILTIN_INDEX).into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session login / logout
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

/// POST /auth/login
async fn login_handler(State(app): State<AppState>, body: Bytes) -> Response {
    let Ok(login) = serde_json::from_slice::<LoginRequest>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "expected {\"password\": \"...\"}" })),
        )
            .into_response();
    };

    let sessions = app.gateway.admission.sessions();
    if !sessions.validate(&login.password) {
        warn!(reason = "unauthenticated", "UI login rejected");
        return json_rejection();
    }

    let token = sessions.issue_token();
    info!("UI login");
    (
        [(
            SET_COOKIE,
            format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; Secure; SameSite=Strict"),
        )],
        Json(json!({ "token": token })),
    )
        .into_response()
}

/// POST /auth/logout
async fn logout_handler(State(app): State<AppState>, headers: HeaderMap) -> Response {
    let sessions = app.gateway.admission.sessions();
    let authorized = match extract_from_headers(&headers, Transport::JsonHttp) {
        Ok(Some(Credential::Session(SessionSecret::Token(token)))) => {
            sessions.validate_token(&token)
        }
        Ok(Some(Credential::Session(SessionSecret::Password(password)))) => {
            sessions.validate(&password)
        }
        _ => false,
    };
    if !authorized {
        warn!(reason = "unauthenticated", "UI logout rejected");
        return json_rejection();
    }

    sessions.logout();
    (
        StatusCode::NO_CONTENT,
        [(
            SET_COOKIE,
            format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0"),
        )],
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Response helpers
// ─────────────────────────────────────────────────────────────────────────────

fn grpc_status_headers(status: u16, message: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(GRPC_STATUS.clone(), HeaderValue::from(status));
    if !message.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&grpc::percent_encode(message)) {
            headers.insert(GRPC_MESSAGE.clone(), value);
        }
    }
    headers
}

/// Trailers-only gRPC response: status in the headers, no body.
fn grpc_trailers_only(content_type: &'static str, status: u16, message: &str) -> Response {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.extend(grpc_status_headers(status, message));
    response
}

fn json_rejection() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, "Basic realm=\"lightgate\"")],
        Json(json!({ "code": GRPC_STATUS_UNAUTHENTICATED, "message": REJECTION_MESSAGE })),
    )
        .into_response()
}

fn framing_error(e: &crate::Error) -> Response {
    debug!(error = %e, "Malformed request");
    (StatusCode::BAD_REQUEST, "malformed request").into_response()
}

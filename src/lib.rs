//! lightgate library
//!
//! Single-port TLS gateway that fronts several RPC backends.
//!
//! # Features
//!
//! - **One port**: native gRPC, gRPC-web, JSON and an encrypted tunnel share
//!   a single TLS listener with an auto-generated certificate
//! - **Macaroons**: per-backend and gateway-level tokens with expiry, IP and
//!   capability caveats; revocation by root key rotation
//! - **UI sessions**: password login with a session cookie
//! - **Permission table**: every method declares which credentials and
//!   transports may reach it
//! - **Tunnel**: X25519 + ChaCha20-Poly1305 channel keyed by a pairing secret

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod backend;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod macaroon;
pub mod mux;
pub mod permissions;
pub mod session;
pub mod tls;
pub mod tunnel;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns `Error::Internal` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Tracing already initialised: {e}")))
}

//! Tunnel transport: encrypted RPC calls multiplexed over the gateway port.
//!
//! A client opens TLS to the gateway port, writes [`TUNNEL_PREAMBLE`] and
//! then runs the [`SecureChannel`] handshake keyed by the pairing secret.
//! Afterwards each message is one JSON [`TunnelCall`] or [`TunnelReply`].

mod bridge;
mod channel;
mod client;

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use bridge::TunnelBridge;
pub use channel::{MAX_PLAINTEXT_LEN, SecureChannel};
pub use client::TunnelClient;

/// First bytes of a tunnel connection after TLS.
pub const TUNNEL_PREAMBLE: &[u8; 8] = b"LGTUNNEL";

/// One RPC call sent through the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCall {
    /// Correlates the reply.
    pub id: u64,
    /// Fully-qualified RPC method.
    pub method: String,
    /// Call metadata; `macaroon` overrides the tunnel session credential.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Protobuf request message.
    #[serde(with = "base64_bytes", default)]
    pub payload: Bytes,
}

/// The reply to a [`TunnelCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelReply {
    /// Id of the call this answers.
    pub id: u64,
    /// gRPC status code; 0 on success.
    pub status: u16,
    /// Status message; empty on success.
    #[serde(default)]
    pub message: String,
    /// Protobuf response message.
    #[serde(with = "base64_bytes", default)]
    pub payload: Bytes,
}

impl TunnelReply {
    /// `true` for status 0.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

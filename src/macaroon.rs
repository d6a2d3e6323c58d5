//! Macaroon bearer tokens.
//!
//! A macaroon is an identifier plus an ordered list of first-party caveats,
//! chained together with HMAC-SHA256:
//!
//! ```text
//! sig₀ = HMAC(root_key, identifier)
//! sigₙ = HMAC(sigₙ₋₁, caveatₙ)
//! ```
//!
//! Anyone holding a macaroon can append caveats (attenuate it) but nobody
//! without the root key can remove one or forge a new signature. Verifying a
//! token is therefore a pure function of the token and the root key.
//!
//! Wire form: hex of a JSON envelope. The same representation is used in the
//! `macaroon` request header and in macaroon files written by the CLI.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, KeyInit, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::permissions::Capability;

type HmacSha256 = Hmac<Sha256>;

/// Identifier format version.
pub const MACAROON_VERSION: u8 = 1;

/// Location stamped on macaroons signed by the gateway-level root key.
pub const SUPER_LOCATION: &str = "gateway";

/// Macaroon decoding / caveat parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacaroonError {
    /// Token bytes are not a valid envelope
    #[error("malformed macaroon: {0}")]
    Malformed(String),

    /// Caveat text not understood by this gateway
    #[error("unknown caveat: {0}")]
    UnknownCaveat(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Identifier
// ─────────────────────────────────────────────────────────────────────────────

/// Parsed macaroon identifier: `v<version>:<root_key_id>:<nonce>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacaroonId {
    /// Format version.
    pub version: u8,
    /// Name of the root key that signed the token.
    pub root_key_id: String,
    /// Random per-token nonce (hex).
    pub nonce: String,
}

impl MacaroonId {
    /// New identifier with a fresh random nonce.
    #[must_use]
    pub fn generate(root_key_id: &str) -> Self {
        use rand::RngExt;
        let nonce: [u8; 16] = rand::rng().random();
        Self {
            version: MACAROON_VERSION,
            root_key_id: root_key_id.to_string(),
            nonce: hex::encode(nonce),
        }
    }

    /// Parse the textual form.
    pub fn parse(s: &str) -> Result<Self, MacaroonError> {
        let mut parts = s.splitn(3, ':');
        let (Some(version), Some(root_key_id), Some(nonce)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(MacaroonError::Malformed(format!("identifier '{s}'")));
        };
        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u8>().ok())
            .ok_or_else(|| MacaroonError::Malformed(format!("identifier version '{version}'")))?;
        if root_key_id.is_empty() {
            return Err(MacaroonError::Malformed("empty root key id".to_string()));
        }
        Ok(Self {
            version,
            root_key_id: root_key_id.to_string(),
            nonce: nonce.to_string(),
        })
    }
}

impl fmt::Display for MacaroonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}:{}", self.version, self.root_key_id, self.nonce)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Caveats
// ─────────────────────────────────────────────────────────────────────────────

/// First-party caveats understood by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caveat {
    /// `permissions <cap> <cap> ...`: the capability set.
    Permissions(BTreeSet<Capability>),
    /// `time-before <RFC3339>`: expiry.
    TimeBefore(DateTime<Utc>),
    /// `ipaddr <ip>`: only valid from this client address.
    IpAddr(IpAddr),
}

impl Caveat {
    /// Canonical text fed into the signature chain.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Permissions(caps) => {
                let caps: Vec<String> = caps.iter().map(ToString::to_string).collect();
                format!("permissions {}", caps.join(" "))
            }
            Self::TimeBefore(t) => {
                format!("time-before {}", t.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            Self::IpAddr(ip) => format!("ipaddr {ip}"),
        }
    }

    /// Parse caveat text. Unknown conditions fail closed.
    pub fn parse(s: &str) -> Result<Self, MacaroonError> {
        let (condition, value) = s.split_once(' ').unwrap_or((s, ""));
        match condition {
            "permissions" => {
                let caps = value
                    .split_whitespace()
                    .map(str::parse::<Capability>)
                    .collect::<Result<BTreeSet<_>, _>>()
                    .map_err(|e| MacaroonError::Malformed(e.to_string()))?;
                Ok(Self::Permissions(caps))
            }
            "time-before" => DateTime::parse_from_rfc3339(value)
                .map(|t| Self::TimeBefore(t.with_timezone(&Utc)))
                .map_err(|e| MacaroonError::Malformed(format!("time-before '{value}': {e}"))),
            "ipaddr" => value
                .parse()
                .map(Self::IpAddr)
                .map_err(|e| MacaroonError::Malformed(format!("ipaddr '{value}': {e}"))),
            _ => Err(MacaroonError::UnknownCaveat(condition.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Macaroon
// ─────────────────────────────────────────────────────────────────────────────

/// A macaroon token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macaroon {
    location: String,
    identifier: String,
    caveats: Vec<String>,
    signature: String,
}

impl Macaroon {
    /// Mint a caveat-free macaroon under `root_key`.
    #[must_use]
    pub fn mint(root_key: &[u8], location: &str, id: &MacaroonId) -> Self {
        let identifier = id.to_string();
        let signature = hmac(root_key, identifier.as_bytes());
        Self {
            location: location.to_string(),
            identifier,
            caveats: Vec::new(),
            signature: hex::encode(signature),
        }
    }

    /// Append a first-party caveat, extending the signature chain.
    pub fn add_caveat(&mut self, caveat: &Caveat) {
        let text = caveat.encode();
        let key = self.signature_bytes().unwrap_or_default();
        self.signature = hex::encode(hmac(&key, text.as_bytes()));
        self.caveats.push(text);
    }

    /// Location (backend id, or [`SUPER_LOCATION`]).
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Parsed identifier.
    pub fn id(&self) -> Result<MacaroonId, MacaroonError> {
        MacaroonId::parse(&self.identifier)
    }

    /// Raw caveat strings in chain order.
    #[must_use]
    pub fn caveats(&self) -> &[String] {
        &self.caveats
    }

    /// Whether the token was signed by the gateway-level root key.
    #[must_use]
    pub fn is_super(&self) -> bool {
        self.location == SUPER_LOCATION
    }

    /// Recompute the chain under `root_key` and compare in constant time.
    #[must_use]
    pub fn verify_signature(&self, root_key: &[u8]) -> bool {
        let Some(presented) = self.signature_bytes() else {
            return false;
        };
        let mut sig = hmac(root_key, self.identifier.as_bytes());
        for caveat in &self.caveats {
            sig = hmac(&sig, caveat.as_bytes());
        }
        sig.as_slice().ct_eq(presented.as_slice()).into()
    }

    /// Hex wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing a struct of strings cannot fail.
        hex::encode(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Decode the hex wire form.
    pub fn decode(s: &str) -> Result<Self, MacaroonError> {
        let bytes = hex::decode(s.trim()).map_err(|e| MacaroonError::Malformed(e.to_string()))?;
        let mac: Self =
            serde_json::from_slice(&bytes).map_err(|e| MacaroonError::Malformed(e.to_string()))?;
        if mac.signature_bytes().is_none() {
            return Err(MacaroonError::Malformed("signature".to_string()));
        }
        Ok(mac)
    }

    fn signature_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.signature).ok()?;
        bytes.try_into().ok()
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

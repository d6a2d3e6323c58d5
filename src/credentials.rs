//! Credential store: macaroon root keys, baking and stateless verification.
//!
//! The store exclusively owns one root key per backend plus a gateway-level
//! key used for super macaroons. Issued tokens are handed to callers by value
//! and forgotten: there is no server-side token table. Verification is a pure
//! function of `(token, root key, request context)`, so it is safe to call
//! from any number of connections at once.
//!
//! Revocation happens only through [`CredentialStore::rotate`], which
//! replaces a root key and thereby invalidates every token baked with it.
//!
//! # Root key file
//!
//! ```json
//! { "version": 1, "root_keys": { "node": "<hex>", "super": "<hex>" } }
//! ```
//!
//! Created with mode `0600` on first start; missing keys are added (never
//! replaced) on subsequent starts.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::AuthError;
use crate::macaroon::{Caveat, Macaroon, MacaroonId, SUPER_LOCATION};
use crate::permissions::{Capability, CredentialKind};
use crate::tls::write_private_file;
use crate::{Error, Result};

/// Root key id of the gateway-level key signing super macaroons.
pub const SUPER_ROOT_KEY_ID: &str = "super";

const ROOT_KEY_FILE_VERSION: u8 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Credential sum type
// ─────────────────────────────────────────────────────────────────────────────

/// A typed credential.
///
/// The variant is decided from the credential's *shape* when it is presented
/// (see [`crate::auth::classify_macaroon`]); each variant has exactly one validation
/// path.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Macaroon bound to one backend's root key.
    ScopedMacaroon(Macaroon),
    /// Macaroon signed by the gateway-level root key.
    SuperMacaroon(Macaroon),
    /// UI password or the session token derived from it.
    Session(SessionSecret),
    /// The tunnel session the call arrived on.
    Tunnel {
        /// Tunnel session id, for logs.
        session_id: String,
    },
}

/// The two shapes a session credential can take.
#[derive(Clone, PartialEq, Eq)]
pub enum SessionSecret {
    /// The configured UI password itself.
    Password(String),
    /// The opaque token issued by `/auth/login`.
    Token(String),
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

impl Credential {
    /// Wrap a decoded macaroon in the matching variant.
    #[must_use]
    pub fn from_macaroon(mac: Macaroon) -> Self {
        if mac.is_super() {
            Self::SuperMacaroon(mac)
        } else {
            Self::ScopedMacaroon(mac)
        }
    }

    /// Registry-level kind of this credential.
    #[must_use]
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::ScopedMacaroon(_) => CredentialKind::Macaroon,
            Self::SuperMacaroon(_) => CredentialKind::SuperMacaroon,
            Self::Session(_) => CredentialKind::Session,
            Self::Tunnel { .. } => CredentialKind::Tunnel,
        }
    }

    /// The macaroon inside, if any.
    #[must_use]
    pub fn macaroon(&self) -> Option<&Macaroon> {
        match self {
            Self::ScopedMacaroon(m) | Self::SuperMacaroon(m) => Some(m),
            Self::Session(_) | Self::Tunnel { .. } => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Constraints / verification context
// ─────────────────────────────────────────────────────────────────────────────

/// Optional restrictions baked into a token.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    /// Token invalid at or after this instant.
    pub expiry: Option<DateTime<Utc>>,
    /// Token only valid from this client address.
    pub client_ip: Option<IpAddr>,
}

impl Constraints {
    fn caveats(&self) -> Vec<Caveat> {
        let mut out = Vec::new();
        if let Some(expiry) = self.expiry {
            out.push(Caveat::TimeBefore(expiry));
        }
        if let Some(ip) = self.client_ip {
            out.push(Caveat::IpAddr(ip));
        }
        out
    }
}

/// Facts about the current request that caveats are checked against.
#[derive(Debug, Clone, Copy)]
pub struct VerifyContext {
    /// Current time.
    pub now: DateTime<Utc>,
    /// Client address, when known.
    pub client_ip: Option<IpAddr>,
}

impl VerifyContext {
    /// Context for a request arriving now from `client_ip`.
    #[must_use]
    pub fn now(client_ip: Option<IpAddr>) -> Self {
        Self {
            now: Utc::now(),
            client_ip,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct RootKeyFile {
    version: u8,
    root_keys: BTreeMap<String, String>,
}

/// Macaroon root keys and the capability sets they may grant.
pub struct CredentialStore {
    path: Option<PathBuf>,
    root_keys: RwLock<BTreeMap<String, [u8; 32]>>,
    capabilities: BTreeMap<String, BTreeSet<Capability>>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("root_keys", &self.root_key_ids())
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// In-memory store with freshly generated keys.
    #[must_use]
    pub fn ephemeral(capabilities: BTreeMap<String, BTreeSet<Capability>>) -> Self {
        let mut keys = BTreeMap::new();
        for backend in capabilities.keys() {
            keys.insert(backend.clone(), generate_root_key());
        }
        keys.insert(SUPER_ROOT_KEY_ID.to_string(), generate_root_key());
        Self {
            path: None,
            root_keys: RwLock::new(keys),
            capabilities,
        }
    }

    /// Load the root key file at `path`, creating it (or adding missing
    /// keys) as needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialStore` if the file exists but cannot be
    /// parsed, or if it cannot be written.
    pub fn open(path: &Path, capabilities: BTreeMap<String, BTreeSet<Capability>>) -> Result<Self> {
        let mut keys = if path.exists() {
            read_root_key_file(path)?
        } else {
            BTreeMap::new()
        };

        let mut changed = false;
        for id in capabilities
            .keys()
            .map(String::as_str)
            .chain(std::iter::once(SUPER_ROOT_KEY_ID))
        {
            if !keys.contains_key(id) {
                keys.insert(id.to_string(), generate_root_key());
                changed = true;
                debug!(root_key = %id, "Generated macaroon root key");
            }
        }

        let store = Self {
            path: Some(path.to_path_buf()),
            root_keys: RwLock::new(keys),
            capabilities,
        };
        if changed {
            store.persist()?;
            info!(path = %path.display(), "Macaroon root keys written");
        }
        Ok(store)
    }

    /// Known root key ids.
    #[must_use]
    pub fn root_key_ids(&self) -> Vec<String> {
        self.root_keys.read().keys().cloned().collect()
    }

    /// Capability set a scoped macaroon for `backend` may carry.
    #[must_use]
    pub fn backend_capabilities(&self, backend: &str) -> Option<&BTreeSet<Capability>> {
        self.capabilities.get(backend)
    }

    /// Bake a macaroon bound to one backend's root key.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialStore` for an unknown backend, an empty
    /// capability set, or a capability the backend does not expose.
    pub fn bake_scoped(
        &self,
        backend: &str,
        capabilities: &BTreeSet<Capability>,
        constraints: &Constraints,
    ) -> Result<Credential> {
        let allowed = self
            .capabilities
            .get(backend)
            .ok_or_else(|| Error::CredentialStore(format!("Unknown backend '{backend}'")))?;
        if capabilities.is_empty() {
            return Err(Error::CredentialStore(
                "A macaroon needs at least one capability".to_string(),
            ));
        }
        if let Some(foreign) = capabilities.iter().find(|c| !allowed.contains(*c)) {
            return Err(Error::CredentialStore(format!(
                "Backend '{backend}' does not expose capability '{foreign}'"
            )));
        }

        let mac = self.bake(backend, backend, capabilities.clone(), constraints)?;
        Ok(Credential::ScopedMacaroon(mac))
    }

    /// Bake a gateway-level macaroon: union of every backend's capability set,
    /// restricted to read capabilities when `read_only` is set.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialStore` if the gateway root key is missing.
    pub fn bake_super(&self, read_only: bool, constraints: &Constraints) -> Result<Credential> {
        let caps: BTreeSet<Capability> = self
            .capabilities
            .values()
            .flatten()
            .filter(|c| !read_only || c.is_read_only())
            .cloned()
            .collect();

        let mac = self.bake(SUPER_ROOT_KEY_ID, SUPER_LOCATION, caps, constraints)?;
        Ok(Credential::SuperMacaroon(mac))
    }

    fn bake(
        &self,
        root_key_id: &str,
        location: &str,
        capabilities: BTreeSet<Capability>,
        constraints: &Constraints,
    ) -> Result<Macaroon> {
        let root_key = self
            .root_keys
            .read()
            .get(root_key_id)
            .copied()
            .ok_or_else(|| Error::CredentialStore(format!("No root key '{root_key_id}'")))?;

        let mut mac = Macaroon::mint(&root_key, location, &MacaroonId::generate(root_key_id));
        mac.add_caveat(&Caveat::Permissions(capabilities));
        for caveat in constraints.caveats() {
            mac.add_caveat(&caveat);
        }
        Ok(mac)
    }

    /// Verify `token` for a call to `backend` needing `required`.
    ///
    /// Returns the token's effective capability set on success.
    ///
    /// # Errors
    ///
    /// * `InvalidSignature`: unknown root key or broken signature chain.
    /// * `CaveatUnsatisfied`: expired, wrong client address, unknown caveat.
    /// * `CapabilityDenied`: token bound to another backend, or the required
    ///   capability is not in its set.
    pub fn verify(
        &self,
        token: &Macaroon,
        backend: &str,
        required: &Capability,
        ctx: &VerifyContext,
    ) -> std::result::Result<BTreeSet<Capability>, AuthError> {
        let id = token
            .id()
            .map_err(|e| AuthError::MalformedCredential(e.to_string()))?;

        let expected_key_id = if token.is_super() {
            SUPER_ROOT_KEY_ID
        } else if token.location() == backend {
            backend
        } else {
            return Err(AuthError::CapabilityDenied(format!(
                "token bound to '{}', endpoint served by '{backend}'",
                token.location()
            )));
        };
        if id.root_key_id != expected_key_id {
            return Err(AuthError::InvalidSignature);
        }

        let root_key = self
            .root_keys
            .read()
            .get(expected_key_id)
            .copied()
            .ok_or(AuthError::InvalidSignature)?;
        if !token.verify_signature(&root_key) {
            return Err(AuthError::InvalidSignature);
        }

        let granted = evaluate_caveats(token, ctx)?;
        if granted.contains(required) {
            Ok(granted)
        } else {
            Err(AuthError::CapabilityDenied(format!(
                "'{required}' not granted"
            )))
        }
    }

    /// Replace the root key `root_key_id`, revoking every token it signed.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialStore` for an unknown id or if the key file
    /// cannot be written.
    pub fn rotate(&self, root_key_id: &str) -> Result<()> {
        {
            let mut keys = self.root_keys.write();
            let slot = keys
                .get_mut(root_key_id)
                .ok_or_else(|| Error::CredentialStore(format!("No root key '{root_key_id}'")))?;
            *slot = generate_root_key();
        }
        self.persist()?;
        info!(root_key = %root_key_id, "Rotated macaroon root key");
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let file = RootKeyFile {
            version: ROOT_KEY_FILE_VERSION,
            root_keys: self
                .root_keys
                .read()
                .iter()
                .map(|(id, key)| (id.clone(), hex::encode(key)))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        write_private_file(path, &json).map_err(|e| {
            Error::CredentialStore(format!("Cannot write '{}': {e}", path.display()))
        })
    }
}

/// Walk the caveat list; every caveat must hold. Multiple permission
/// caveats intersect, so attenuation can only shrink the set.
fn evaluate_caveats(
    token: &Macaroon,
    ctx: &VerifyContext,
) -> std::result::Result<BTreeSet<Capability>, AuthError> {
    let mut granted: Option<BTreeSet<Capability>> = None;

    for raw in token.caveats() {
        let caveat =
            Caveat::parse(raw).map_err(|e| AuthError::CaveatUnsatisfied(e.to_string()))?;
        match caveat {
            Caveat::Permissions(caps) => {
                granted = Some(match granted {
                    Some(prev) => prev.intersection(&caps).cloned().collect(),
                    None => caps,
                });
            }
            Caveat::TimeBefore(expiry) => {
                if ctx.now >= expiry {
                    return Err(AuthError::CaveatUnsatisfied("token expired".to_string()));
                }
            }
            Caveat::IpAddr(ip) => {
                if ctx.client_ip != Some(ip) {
                    return Err(AuthError::CaveatUnsatisfied(format!(
                        "token bound to client {ip}"
                    )));
                }
            }
        }
    }

    granted.ok_or_else(|| AuthError::CapabilityDenied("token carries no permissions".to_string()))
}

fn generate_root_key() -> [u8; 32] {
    rand::rng().random()
}

fn read_root_key_file(path: &Path) -> Result<BTreeMap<String, [u8; 32]>> {
    let raw = fs::read(path)
        .map_err(|e| Error::CredentialStore(format!("Cannot read '{}': {e}", path.display())))?;
    let file: RootKeyFile = serde_json::from_slice(&raw)
        .map_err(|e| Error::CredentialStore(format!("Cannot parse '{}': {e}", path.display())))?;
    if file.version != ROOT_KEY_FILE_VERSION {
        return Err(Error::CredentialStore(format!(
            "Unsupported root key file version {}",
            file.version
        )));
    }

    file.root_keys
        .into_iter()
        .map(|(id, hex_key)| {
            let key: [u8; 32] = hex::decode(&hex_key)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| Error::CredentialStore(format!("Root key '{id}' is not 32 bytes")))?;
            Ok((id, key))
        })
        .collect()
}

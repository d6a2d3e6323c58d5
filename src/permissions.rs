//! Endpoint permission registry.
//!
//! A static table mapping every exposed RPC method to the transports and
//! credential kinds it accepts. The table is compiled once at startup into
//! a [`PermissionRegistry`] and never mutated afterwards, so lookups need
//! no synchronisation.
//!
//! The registry answers *which door is open for which key*. It never looks
//! at credential contents: capability checks belong to
//! [`crate::credentials::CredentialStore`].
//!
//! # Decision table
//!
//! | Transport | Credential | Allowed when |
//! |-----------|------------|--------------|
//! | native RPC | macaroon / super macaroon | `accepts_macaroon_on_gateway_port` |
//! | native RPC | session | `accepts_session_on_gateway_port` |
//! | web-framed RPC | any non-tunnel | `web_framing_uri` set *and* the native rule |
//! | JSON | any non-tunnel | `json_uri` set *and* the native rule |
//! | tunnel | macaroon / super macaroon / tunnel session | `reachable_via_tunnel` |
//! | non-tunnel | tunnel session | never |

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::credentials::SUPER_ROOT_KEY_ID;
use crate::macaroon::SUPER_LOCATION;
use crate::{Error, Result};

/// Ids a backend may not take: they name the gateway-level root key and
/// the super macaroon location.
pub const RESERVED_BACKEND_IDS: [&str; 2] = [SUPER_LOCATION, SUPER_ROOT_KEY_ID];

/// Reject backend ids that collide with [`RESERVED_BACKEND_IDS`].
///
/// # Errors
///
/// Returns `Error::Config` naming the reserved id.
pub fn check_backend_id(id: &str) -> Result<()> {
    if RESERVED_BACKEND_IDS.contains(&id) {
        return Err(Error::Config(format!("Backend id '{id}' is reserved")));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport / credential kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Wire surface a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Native gRPC over HTTP/2.
    NativeRpc,
    /// gRPC-web (binary or text framing) over plain HTTP semantics.
    WebRpc,
    /// JSON body posted to the endpoint's JSON URI.
    JsonHttp,
    /// Call decrypted from the encrypted tunnel transport.
    Tunnel,
}

impl Transport {
    /// All transports, in table order.
    pub const ALL: [Self; 4] = [Self::NativeRpc, Self::WebRpc, Self::JsonHttp, Self::Tunnel];
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NativeRpc => "grpc",
            Self::WebRpc => "grpc-web",
            Self::JsonHttp => "json",
            Self::Tunnel => "tunnel",
        })
    }
}

/// Credential type presented with a call, classified by shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Macaroon bound to one backend's root key.
    Macaroon,
    /// Macaroon signed by the gateway-level root key.
    SuperMacaroon,
    /// UI password or the session token derived from it.
    Session,
    /// The authenticated tunnel session itself.
    Tunnel,
}

impl CredentialKind {
    /// All credential kinds, in table order.
    pub const ALL: [Self; 4] = [Self::Macaroon, Self::SuperMacaroon, Self::Session, Self::Tunnel];
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Macaroon => "macaroon",
            Self::SuperMacaroon => "super-macaroon",
            Self::Session => "session",
            Self::Tunnel => "tunnel",
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability
// ─────────────────────────────────────────────────────────────────────────────

/// An operation capability in `entity:action` form (e.g. `info:read`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability {
    entity: String,
    action: String,
}

impl Capability {
    /// Build a capability from its parts.
    #[must_use]
    pub fn new(entity: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            action: action.into(),
        }
    }

    /// The entity part.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The action part.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Read-only capabilities are those whose action is `read`.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.action == "read"
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.action)
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (entity, action) = s
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("Capability '{s}' is not entity:action")))?;
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !valid(entity) || !valid(action) {
            return Err(Error::Config(format!("Invalid capability '{s}'")));
        }
        Ok(Self::new(entity, action))
    }
}

impl TryFrom<String> for Capability {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// One exposed RPC method and the doors it opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Fully-qualified gRPC method path (`/package.Service/Method`).
    pub method: String,
    /// Backend the call is forwarded to.
    pub backend: String,
    /// Capability a macaroon must carry to call this method.
    pub capability: Capability,
    /// Macaroons accepted on the gateway port.
    #[serde(default)]
    pub accepts_macaroon_on_gateway_port: bool,
    /// UI session credential accepted on the gateway port.
    #[serde(default)]
    pub accepts_session_on_gateway_port: bool,
    /// Path served over gRPC-web; `None` means not exposed there.
    #[serde(default)]
    pub web_framing_uri: Option<String>,
    /// Path served over JSON; `None` means not exposed there.
    #[serde(default)]
    pub json_uri: Option<String>,
    /// Reachable through the tunnel transport.
    #[serde(default)]
    pub reachable_via_tunnel: bool,
}

impl Endpoint {
    /// Pure table lookup: does this endpoint accept `kind` over `transport`?
    #[must_use]
    pub fn permits(&self, transport: Transport, kind: CredentialKind) -> bool {
        let gateway_port_rule = || match kind {
            CredentialKind::Macaroon | CredentialKind::SuperMacaroon => {
                self.accepts_macaroon_on_gateway_port
            }
            CredentialKind::Session => self.accepts_session_on_gateway_port,
            CredentialKind::Tunnel => false,
        };

        match transport {
            Transport::NativeRpc => gateway_port_rule(),
            Transport::WebRpc => self.web_framing_uri.is_some() && gateway_port_rule(),
            Transport::JsonHttp => self.json_uri.is_some() && gateway_port_rule(),
            Transport::Tunnel => {
                self.reachable_via_tunnel
                    && matches!(
                        kind,
                        CredentialKind::Macaroon
                            | CredentialKind::SuperMacaroon
                            | CredentialKind::Tunnel
                    )
            }
        }
    }
}

/// One row of the built-in table.
struct Row {
    method: &'static str,
    backend: &'static str,
    capability: (&'static str, &'static str),
    macaroon: bool,
    session: bool,
    web: bool,
    json: Option<&'static str>,
    tunnel: bool,
}

/// The endpoints this gateway fronts out of the box.
const BUILTIN_TABLE: &[Row] = &[
    Row {
        method: "/noderpc.Node/GetInfo",
        backend: "node",
        capability: ("info", "read"),
        macaroon: true,
        session: true,
        web: true,
        json: Some("/v1/getinfo"),
        tunnel: true,
    },
    Row {
        method: "/noderpc.Node/ListChannels",
        backend: "node",
        capability: ("offchain", "read"),
        macaroon: true,
        session: true,
        web: true,
        json: Some("/v1/channels"),
        tunnel: true,
    },
    Row {
        method: "/noderpc.Node/SendCoins",
        backend: "node",
        capability: ("onchain", "write"),
        macaroon: true,
        session: true,
        web: true,
        json: Some("/v1/transactions"),
        tunnel: true,
    },
    Row {
        method: "/noderpc.Node/BakeMacaroon",
        backend: "node",
        capability: ("macaroon", "generate"),
        macaroon: true,
        session: false,
        web: true,
        json: Some("/v1/macaroon"),
        tunnel: false,
    },
    Row {
        method: "/acctrpc.Accounting/RevenueReport",
        backend: "accounting",
        capability: ("report", "read"),
        macaroon: true,
        session: true,
        web: true,
        json: Some("/v1/accounting/revenue"),
        tunnel: true,
    },
    Row {
        method: "/swaprpc.SwapClient/ListSwaps",
        backend: "swap",
        capability: ("swap", "read"),
        macaroon: true,
        session: true,
        web: true,
        json: Some("/v1/swaps"),
        tunnel: true,
    },
    Row {
        method: "/swaprpc.SwapClient/SwapOut",
        backend: "swap",
        capability: ("swap", "execute"),
        macaroon: true,
        session: true,
        web: true,
        json: Some("/v1/swap/out"),
        tunnel: true,
    },
    Row {
        method: "/marketrpc.Trader/GetInfo",
        backend: "market",
        capability: ("account", "read"),
        macaroon: true,
        session: true,
        web: true,
        json: None,
        tunnel: true,
    },
    Row {
        method: "/gatewayrpc.Sessions/ListSessions",
        backend: "sessions",
        capability: ("session", "read"),
        macaroon: true,
        session: true,
        web: true,
        json: Some("/v1/sessions"),
        tunnel: false,
    },
    Row {
        method: "/gatewayrpc.Status/SubServerStatus",
        backend: "sessions",
        capability: ("status", "read"),
        macaroon: false,
        session: true,
        web: true,
        json: None,
        tunnel: false,
    },
];

impl Row {
    fn to_endpoint(&self) -> Endpoint {
        Endpoint {
            method: self.method.to_string(),
            backend: self.backend.to_string(),
            capability: Capability::new(self.capability.0, self.capability.1),
            accepts_macaroon_on_gateway_port: self.macaroon,
            accepts_session_on_gateway_port: self.session,
            web_framing_uri: self.web.then(|| self.method.to_string()),
            json_uri: self.json.map(str::to_string),
            reachable_via_tunnel: self.tunnel,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable endpoint table indexed by method, web URI and JSON URI.
#[derive(Debug, Clone)]
pub struct PermissionRegistry {
    endpoints: BTreeMap<String, Endpoint>,
    by_web_uri: HashMap<String, String>,
    by_json_uri: HashMap<String, String>,
}

impl PermissionRegistry {
    /// Compile a registry from a declarative table.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for duplicate methods or duplicate URIs, and
    /// for endpoints bound to a reserved backend id.
    pub fn from_table(rows: impl IntoIterator<Item = Endpoint>) -> Result<Self> {
        let mut endpoints = BTreeMap::new();
        let mut by_web_uri = HashMap::new();
        let mut by_json_uri = HashMap::new();

        for endpoint in rows {
            check_backend_id(&endpoint.backend)?;
            if let Some(ref uri) = endpoint.web_framing_uri {
                if by_web_uri
                    .insert(uri.clone(), endpoint.method.clone())
                    .is_some()
                {
                    return Err(Error::Config(format!("Duplicate web URI '{uri}'")));
                }
            }
            if let Some(ref uri) = endpoint.json_uri {
                if by_json_uri
                    .insert(uri.clone(), endpoint.method.clone())
                    .is_some()
                {
                    return Err(Error::Config(format!("Duplicate JSON URI '{uri}'")));
                }
            }
            let method = endpoint.method.clone();
            if endpoints.insert(method.clone(), endpoint).is_some() {
                return Err(Error::Config(format!("Duplicate endpoint '{method}'")));
            }
        }

        Ok(Self {
            endpoints,
            by_web_uri,
            by_json_uri,
        })
    }

    /// The built-in endpoint table.
    #[must_use]
    pub fn builtin_endpoints() -> Vec<Endpoint> {
        BUILTIN_TABLE.iter().map(Row::to_endpoint).collect()
    }

    /// Registry holding the built-in table plus `extra` declarations.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if an extra declaration collides with the
    /// built-in table.
    pub fn with_extra(extra: &[Endpoint]) -> Result<Self> {
        Self::from_table(
            Self::builtin_endpoints()
                .into_iter()
                .chain(extra.iter().cloned()),
        )
    }

    /// Does `method` accept `kind` over `transport`?
    ///
    /// Unknown methods are never allowed.
    #[must_use]
    pub fn is_allowed(&self, method: &str, transport: Transport, kind: CredentialKind) -> bool {
        self.endpoints
            .get(method)
            .is_some_and(|e| e.permits(transport, kind))
    }

    /// Look up an endpoint by gRPC method path.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<&Endpoint> {
        self.endpoints.get(method)
    }

    /// Look up an endpoint by its gRPC-web path.
    #[must_use]
    pub fn by_web_uri(&self, path: &str) -> Option<&Endpoint> {
        self.by_web_uri
            .get(path)
            .and_then(|m| self.endpoints.get(m))
    }

    /// Look up an endpoint by its JSON path.
    #[must_use]
    pub fn by_json_uri(&self, path: &str) -> Option<&Endpoint> {
        self.by_json_uri
            .get(path)
            .and_then(|m| self.endpoints.get(m))
    }

    /// All endpoints, ordered by method.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// Endpoints reachable through the tunnel.
    pub fn tunnel_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values().filter(|e| e.reachable_via_tunnel)
    }

    /// Names of all backends referenced by the table.
    #[must_use]
    pub fn backends(&self) -> BTreeSet<String> {
        self.endpoints.values().map(|e| e.backend.clone()).collect()
    }

    /// Capability set of each backend, derived from its endpoints.
    #[must_use]
    pub fn capabilities_by_backend(&self) -> BTreeMap<String, BTreeSet<Capability>> {
        let mut out: BTreeMap<String, BTreeSet<Capability>> = BTreeMap::new();
        for endpoint in self.endpoints.values() {
            out.entry(endpoint.backend.clone())
                .or_default()
                .insert(endpoint.capability.clone());
        }
        out
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PermissionRegistry {
        PermissionRegistry::with_extra(&[]).unwrap()
    }

    #[test]
    fn capability_parses_entity_and_action() {
        let cap: Capability = "info:read".parse().unwrap();
        assert_eq!(cap.entity(), "info");
        assert_eq!(cap.action(), "read");
        assert!(cap.is_read_only());
        assert_eq!(cap.to_string(), "info:read");
    }

    #[test]
    fn capability_rejects_malformed_strings() {
        assert!("info".parse::<Capability>().is_err());
        assert!(":read".parse::<Capability>().is_err());
        assert!("info:re ad".parse::<Capability>().is_err());
    }

    #[test]
    fn write_capability_is_not_read_only() {
        assert!(!Capability::new("onchain", "write").is_read_only());
    }

    #[test]
    fn table_rows_on_reserved_backend_ids_are_rejected() {
        for reserved in RESERVED_BACKEND_IDS {
            let mut row = PermissionRegistry::builtin_endpoints()[0].clone();
            row.method = "/gw.Svc/Get".to_string();
            row.backend = reserved.to_string();
            row.web_framing_uri = None;
            row.json_uri = None;

            let result = PermissionRegistry::with_extra(&[row]);

            assert!(matches!(result, Err(Error::Config(_))), "{reserved}");
        }
    }

    #[test]
    fn builtin_table_uses_no_reserved_backend_id() {
        for endpoint in registry().endpoints() {
            assert!(check_backend_id(&endpoint.backend).is_ok());
        }
    }

    #[test]
    fn builtin_table_compiles_without_collisions() {
        let reg = registry();
        assert_eq!(reg.len(), BUILTIN_TABLE.len());
    }

    #[test]
    fn decisions_are_deterministic_for_every_combination() {
        // GIVEN: the built-in registry
        let reg = registry();
        // THEN: every (endpoint, transport, kind) triple answers the same
        // twice and matches the per-endpoint rule
        for endpoint in reg.endpoints() {
            for transport in Transport::ALL {
                for kind in CredentialKind::ALL {
                    let first = reg.is_allowed(&endpoint.method, transport, kind);
                    let second = reg.is_allowed(&endpoint.method, transport, kind);
                    assert_eq!(first, second);
                    assert_eq!(first, endpoint.permits(transport, kind));
                }
            }
        }
    }

    #[test]
    fn session_rejected_where_flag_is_off() {
        let reg = registry();
        assert!(!reg.is_allowed(
            "/noderpc.Node/BakeMacaroon",
            Transport::NativeRpc,
            CredentialKind::Session
        ));
        assert!(reg.is_allowed(
            "/noderpc.Node/BakeMacaroon",
            Transport::NativeRpc,
            CredentialKind::Macaroon
        ));
    }

    #[test]
    fn macaroon_rejected_where_flag_is_off() {
        let reg = registry();
        for kind in [CredentialKind::Macaroon, CredentialKind::SuperMacaroon] {
            assert!(!reg.is_allowed(
                "/gatewayrpc.Status/SubServerStatus",
                Transport::NativeRpc,
                kind
            ));
        }
    }

    #[test]
    fn json_absent_means_not_exposed() {
        let reg = registry();
        let ep = reg.get("/marketrpc.Trader/GetInfo").unwrap();
        assert!(ep.json_uri.is_none());
        assert!(!reg.is_allowed(&ep.method, Transport::JsonHttp, CredentialKind::Macaroon));
        assert!(reg.is_allowed(&ep.method, Transport::NativeRpc, CredentialKind::Macaroon));
    }

    #[test]
    fn tunnel_credential_only_works_through_tunnel() {
        let reg = registry();
        for transport in [Transport::NativeRpc, Transport::WebRpc, Transport::JsonHttp] {
            assert!(!reg.is_allowed("/noderpc.Node/GetInfo", transport, CredentialKind::Tunnel));
        }
        assert!(reg.is_allowed(
            "/noderpc.Node/GetInfo",
            Transport::Tunnel,
            CredentialKind::Tunnel
        ));
    }

    #[test]
    fn tunnel_set_is_a_strict_subset() {
        let reg = registry();
        let tunnel: BTreeSet<_> = reg.tunnel_endpoints().map(|e| e.method.clone()).collect();
        let all: BTreeSet<_> = reg.endpoints().map(|e| e.method.clone()).collect();
        assert!(tunnel.is_subset(&all));
        assert!(tunnel.len() < all.len());
        assert!(!tunnel.contains("/gatewayrpc.Sessions/ListSessions"));
    }

    #[test]
    fn non_tunnel_endpoint_refuses_every_kind_over_tunnel() {
        let reg = registry();
        for kind in CredentialKind::ALL {
            assert!(!reg.is_allowed(
                "/gatewayrpc.Sessions/ListSessions",
                Transport::Tunnel,
                kind
            ));
        }
    }

    #[test]
    fn session_never_allowed_through_tunnel() {
        let reg = registry();
        assert!(!reg.is_allowed(
            "/noderpc.Node/GetInfo",
            Transport::Tunnel,
            CredentialKind::Session
        ));
    }

    #[test]
    fn unknown_method_is_denied() {
        let reg = registry();
        assert!(!reg.is_allowed(
            "/noderpc.Node/StopDaemon",
            Transport::NativeRpc,
            CredentialKind::SuperMacaroon
        ));
    }

    #[test]
    fn uri_indices_resolve_to_endpoints() {
        let reg = registry();
        assert_eq!(
            reg.by_json_uri("/v1/getinfo").unwrap().method,
            "/noderpc.Node/GetInfo"
        );
        assert_eq!(
            reg.by_web_uri("/swaprpc.SwapClient/ListSwaps")
                .unwrap()
                .backend,
            "swap"
        );
        assert!(reg.by_json_uri("/v1/nope").is_none());
    }

    #[test]
    fn duplicate_method_is_rejected() {
        let mut rows = PermissionRegistry::builtin_endpoints();
        let mut dup = rows[0].clone();
        dup.json_uri = None;
        dup.web_framing_uri = None;
        rows.push(dup);
        let err = PermissionRegistry::from_table(rows).unwrap_err();
        assert!(err.to_string().contains("Duplicate endpoint"));
    }

    #[test]
    fn duplicate_json_uri_is_rejected() {
        let extra = Endpoint {
            method: "/noderpc.Node/GetInfo2".to_string(),
            backend: "node".to_string(),
            capability: Capability::new("info", "read"),
            accepts_macaroon_on_gateway_port: true,
            accepts_session_on_gateway_port: true,
            web_framing_uri: None,
            json_uri: Some("/v1/getinfo".to_string()),
            reachable_via_tunnel: false,
        };
        assert!(PermissionRegistry::with_extra(&[extra]).is_err());
    }

    #[test]
    fn capabilities_grouped_by_backend() {
        let caps = registry().capabilities_by_backend();
        let node = &caps["node"];
        assert!(node.contains(&Capability::new("info", "read")));
        assert!(node.contains(&Capability::new("onchain", "write")));
        assert!(!caps["swap"].contains(&Capability::new("info", "read")));
    }

    #[test]
    fn endpoint_deserialises_with_optional_fields_defaulted() {
        let yaml = "method: /x.Y/Z\nbackend: node\ncapability: info:read\n";
        let ep: Endpoint = serde_yaml::from_str(yaml).unwrap();
        assert!(!ep.accepts_macaroon_on_gateway_port);
        assert!(ep.json_uri.is_none());
        assert_eq!(ep.capability, Capability::new("info", "read"));
    }
}

//! Configuration management

use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::permissions::{Endpoint, PermissionRegistry, check_backend_id};
use crate::tls::{DEFAULT_ORGANIZATION, DEFAULT_VALIDITY_DAYS, IdentityParams};
use crate::{Error, Result};

/// Minimum accepted UI password length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Gateway TLS identity
    pub tls: TlsConfig,
    /// UI password session and static bundle
    pub ui: UiConfig,
    /// Macaroon root keys
    pub macaroons: MacaroonConfig,
    /// Tunnel transport
    pub tunnel: TunnelConfig,
    /// Backend services by id
    pub backends: BTreeMap<String, BackendConfig>,
    /// Endpoint declarations appended to the built-in table
    pub endpoints: Vec<Endpoint>,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Gateway port address
    pub listen: SocketAddr,
    /// Upper bound for TLS + tunnel handshakes and connection sniffing
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Maximum request body size in bytes
    pub request_body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8443)),
            handshake_timeout: Duration::from_secs(10),
            request_body_limit: 4 * 1024 * 1024,
        }
    }
}

/// TLS identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate path
    pub cert_path: PathBuf,
    /// PEM private key path
    pub key_path: PathBuf,
    /// Extra DNS names for a generated certificate
    pub extra_domains: Vec<String>,
    /// Extra IP addresses for a generated certificate
    pub extra_ips: Vec<IpAddr>,
    /// Validity of a generated certificate
    pub validity_days: u32,
    /// Issuer organisation of a generated certificate
    pub organization: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        let dir = default_data_dir();
        Self {
            cert_path: dir.join("tls.cert"),
            key_path: dir.join("tls.key"),
            extra_domains: Vec::new(),
            extra_ips: Vec::new(),
            validity_days: DEFAULT_VALIDITY_DAYS,
            organization: DEFAULT_ORGANIZATION.to_string(),
        }
    }
}

impl TlsConfig {
    /// Generation parameters for the certificate manager
    #[must_use]
    pub fn identity_params(&self) -> IdentityParams {
        IdentityParams {
            organization: self.organization.clone(),
            extra_domains: self.extra_domains.clone(),
            extra_ips: self.extra_ips.clone(),
            validity_days: self.validity_days,
        }
    }
}

/// UI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// UI password (supports `env:VAR_NAME`)
    pub password: Option<String>,
    /// Session lifetime since last validation (`0s` = until logout)
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// Directory holding the static UI bundle
    pub static_dir: Option<PathBuf>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            password: None,
            session_timeout: Duration::from_secs(24 * 60 * 60),
            static_dir: None,
        }
    }
}

impl UiConfig {
    /// Resolve the password (expand `env:` references)
    #[must_use]
    pub fn resolve_password(&self) -> Option<String> {
        self.password.as_deref().and_then(resolve_secret)
    }

    /// Session lifetime, `None` when sessions only end on logout
    #[must_use]
    pub fn session_lifetime(&self) -> Option<Duration> {
        (!self.session_timeout.is_zero()).then_some(self.session_timeout)
    }
}

/// Macaroon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacaroonConfig {
    /// Root key file
    pub root_key_path: PathBuf,
    /// Expiry applied to baked macaroons (`0s` = none)
    #[serde(with = "humantime_serde")]
    pub default_expiry: Duration,
}

impl Default for MacaroonConfig {
    fn default() -> Self {
        Self {
            root_key_path: default_data_dir().join("root_keys.json"),
            default_expiry: Duration::ZERO,
        }
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Accept tunnel connections on the gateway port
    pub enabled: bool,
    /// Pairing secret shared with tunnel clients (supports `env:VAR_NAME`)
    pub pairing_secret: Option<String>,
}

impl TunnelConfig {
    /// Resolve the pairing secret (expand `env:` references)
    #[must_use]
    pub fn resolve_pairing_secret(&self) -> Option<String> {
        self.pairing_secret.as_deref().and_then(resolve_secret)
    }
}

/// Backend service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL calls are POSTed to
    pub url: String,
    /// Per-call timeout
    #[serde(default = "default_backend_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_backend_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // LIGHTGATE_UI__PASSWORD -> ui.password
        figment = figment.merge(Env::prefixed("LIGHTGATE_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let password = self
            .ui
            .resolve_password()
            .ok_or_else(|| Error::Config("ui.password is required".to_string()))?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::Config(format!(
                "ui.password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        if self.tunnel.enabled
            && self
                .tunnel
                .resolve_pairing_secret()
                .is_none_or(|s| s.is_empty())
        {
            return Err(Error::Config(
                "tunnel.enabled requires tunnel.pairing_secret".to_string(),
            ));
        }

        for id in self
            .backends
            .keys()
            .chain(self.endpoints.iter().map(|e| &e.backend))
        {
            check_backend_id(id)?;
        }

        let known: BTreeSet<String> = PermissionRegistry::builtin_endpoints()
            .into_iter()
            .map(|e| e.backend)
            .chain(self.backends.keys().cloned())
            .collect();
        if let Some(endpoint) = self.endpoints.iter().find(|e| !known.contains(&e.backend)) {
            return Err(Error::Config(format!(
                "Endpoint '{}' names unknown backend '{}'",
                endpoint.method, endpoint.backend
            )));
        }

        self.registry().map(|_| ())
    }

    /// Compile the endpoint registry (built-in table plus `endpoints`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for duplicate methods or URIs.
    pub fn registry(&self) -> Result<PermissionRegistry> {
        PermissionRegistry::with_extra(&self.endpoints)
    }
}

/// Default directory for generated state (certificate, root keys)
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lightgate")
}

/// `env:NAME` reads the variable; anything else is a literal.
fn resolve_secret(value: &str) -> Option<String> {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).ok(),
        None => Some(value.to_string()),
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "24h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    /// Parse `100ms`, `30s`, `5m`, `24h`, `7d` or a bare number of seconds.
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for anything else.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" before "s"/"m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            // Assume seconds
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> Config {
        let mut config = Config::default();
        config.ui.password = Some("correct horse battery".to_string());
        config
    }

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.server.listen.port(), 8443);
        assert_eq!(config.server.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.tls.organization, DEFAULT_ORGANIZATION);
        assert!(!config.tunnel.enabled);
        assert_eq!(config.ui.session_lifetime(), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn yaml_sections_deserialize() {
        let yaml = r#"
server:
  listen: "0.0.0.0:9443"
  handshake_timeout: 5s
ui:
  password: "correct horse battery"
  session_timeout: 0s
tunnel:
  enabled: true
  pairing_secret: "pair-me"
backends:
  node:
    url: "http://127.0.0.1:10009"
    timeout: 2m
endpoints:
  - method: /noderpc.Node/WalletBalance
    backend: node
    capability: onchain:read
    accepts_macaroon_on_gateway_port: true
    json_uri: /v1/balance/blockchain
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.listen.port(), 9443);
        assert_eq!(config.server.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.ui.session_lifetime(), None);
        assert_eq!(config.backends["node"].timeout, Duration::from_secs(120));
        assert_eq!(config.endpoints.len(), 1);
        assert!(!config.endpoints[0].reachable_via_tunnel);
        assert!(config.validate().is_ok());
        assert!(config.registry().unwrap().by_json_uri("/v1/balance/blockchain").is_some());
    }

    #[test]
    fn missing_password_rejected() {
        assert!(matches!(Config::default().validate(), Err(Error::Config(_))));
    }

    #[test]
    fn short_password_rejected() {
        let mut config = valid();
        config.ui.password = Some("short".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn tunnel_requires_pairing_secret() {
        let mut config = valid();
        config.tunnel.enabled = true;
        assert!(config.validate().is_err());
        config.tunnel.pairing_secret = Some("s3cret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_backend_rejected() {
        let mut config = valid();
        let mut endpoint = PermissionRegistry::builtin_endpoints()[0].clone();
        endpoint.method = "/x.Y/Z".to_string();
        endpoint.backend = "nowhere".to_string();
        endpoint.web_framing_uri = None;
        endpoint.json_uri = None;
        config.endpoints.push(endpoint);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("nowhere"), "{err}");
    }

    #[test]
    fn reserved_backend_ids_rejected() {
        for reserved in ["gateway", "super"] {
            // GIVEN: a backend named like the super macaroon root
            let mut config = valid();
            config.backends.insert(
                reserved.to_string(),
                BackendConfig {
                    url: "http://127.0.0.1:10009".to_string(),
                    timeout: std::time::Duration::from_secs(5),
                },
            );

            // THEN: validation refuses it
            let err = config.validate().unwrap_err().to_string();
            assert!(err.contains("reserved"), "{err}");
        }
    }

    #[test]
    fn endpoint_on_reserved_backend_rejected() {
        let mut config = valid();
        let mut endpoint = PermissionRegistry::builtin_endpoints()[0].clone();
        endpoint.method = "/gw.Svc/Get".to_string();
        endpoint.backend = "gateway".to_string();
        endpoint.web_framing_uri = None;
        endpoint.json_uri = None;
        config.endpoints.push(endpoint);

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("reserved"), "{err}");
    }

    #[test]
    fn duplicate_builtin_method_rejected() {
        let mut config = valid();
        config
            .endpoints
            .push(PermissionRegistry::builtin_endpoints()[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_secret_resolution() {
        // Unique name; edition 2024 makes set_var unsafe, so only the
        // missing-variable path is exercised here.
        let mut config = valid();
        config.ui.password = Some("env:LIGHTGATE_TEST_UNSET_PASSWORD_VAR".to_string());
        assert_eq!(config.ui.resolve_password(), None);
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/lightgate.yaml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lightgate.yaml");
        std::fs::write(&path, "ui:\n  password: \"abcdefgh\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.ui.resolve_password().as_deref(), Some("abcdefgh"));
    }

    #[test]
    fn duration_units() {
        #[derive(Deserialize)]
        struct D {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        for (raw, expected) in [
            ("100ms", Duration::from_millis(100)),
            ("30s", Duration::from_secs(30)),
            ("5m", Duration::from_secs(300)),
            ("24h", Duration::from_secs(86_400)),
            ("2d", Duration::from_secs(172_800)),
            ("7", Duration::from_secs(7)),
        ] {
            let d: D = serde_yaml::from_str(&format!("d: {raw}")).unwrap();
            assert_eq!(d.d, expected, "{raw}");
        }
    }
}

//! Gateway server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::state::{GatewaySettings, GatewayState};
use crate::auth::Admission;
use crate::backend::{BackendRegistry, HttpBackend};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::mux::Multiplexer;
use crate::session::SessionManager;
use crate::tls::{IdentityInfo, TlsIdentity, build_server_config, ensure_identity};
use crate::{Error, Result};

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The assembled gateway: identity, admission chain and multiplexer.
pub struct Gateway {
    listen: SocketAddr,
    identity: TlsIdentity,
    credentials: Arc<CredentialStore>,
    state: Arc<GatewayState>,
    mux: Arc<Multiplexer>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("listen", &self.listen)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build the gateway with HTTP backends from `config.backends`.
    ///
    /// # Errors
    ///
    /// Any startup failure: invalid configuration, certificate or root-key
    /// files that cannot be read or created, invalid backend URLs.
    pub fn new(config: &Config) -> Result<Self> {
        let mut backends = BackendRegistry::new();
        for (id, backend) in &config.backends {
            let client = HttpBackend::new(id, &backend.url, backend.timeout)?;
            backends.insert(id.clone(), Arc::new(client));
            info!(backend = %id, url = %backend.url, "Registered backend");
        }
        Self::with_backends(config, backends)
    }

    /// Build the gateway around an existing backend registry.
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::new`].
    pub fn with_backends(config: &Config, backends: BackendRegistry) -> Result<Self> {
        config.validate()?;

        let identity = ensure_identity(
            &config.tls.cert_path,
            &config.tls.key_path,
            &config.tls.identity_params(),
        )?;
        let tls_config = Arc::new(build_server_config(&identity)?);

        let registry = Arc::new(config.registry()?);
        let credentials = Arc::new(CredentialStore::open(
            &config.macaroons.root_key_path,
            registry.capabilities_by_backend(),
        )?);

        let password = config
            .ui
            .resolve_password()
            .ok_or_else(|| Error::Config("ui.password is required".to_string()))?;
        let sessions = Arc::new(SessionManager::new(&password, config.ui.session_lifetime()));

        for backend in registry.backends() {
            if !backends.ids().any(|id| id == backend) {
                warn!(backend = %backend, "No backend configured; its endpoints will fail");
            }
        }

        let settings = GatewaySettings {
            handshake_timeout: config.server.handshake_timeout,
            request_body_limit: config.server.request_body_limit,
            static_dir: config.ui.static_dir.clone(),
            tunnel_secret: if config.tunnel.enabled {
                config.tunnel.resolve_pairing_secret()
            } else {
                None
            },
        };

        let admission = Admission::new(registry, Arc::clone(&credentials), sessions);
        let state = Arc::new(GatewayState::new(admission, backends, settings));
        let mux = Arc::new(Multiplexer::new(Arc::clone(&state), tls_config));

        Ok(Self {
            listen: config.server.listen,
            identity,
            credentials,
            state,
            mux,
        })
    }

    /// The TLS identity presented on the gateway port.
    #[must_use]
    pub fn identity(&self) -> &TlsIdentity {
        &self.identity
    }

    /// Shared per-process state.
    #[must_use]
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Root keys used to bake and verify macaroons.
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.listen).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    ///
    /// Open connections are dropped once the accept loop stops.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener address cannot be read.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local = listener.local_addr()?;
        self.log_banner(local);

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let mux = Arc::clone(&self.mux);
                        connections.spawn(async move {
                            let terminal = mux.serve_connection(stream, peer).await;
                            debug!(%peer, ?terminal, "Connection finished");
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(open = connections.len(), "Stopping; dropping open connections");
        connections.shutdown().await;
        Ok(())
    }

    fn log_banner(&self, local: SocketAddr) {
        info!("============================================================");
        info!("LIGHTGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(address = %local, "Listening (TLS)");
        match IdentityInfo::from_identity(&self.identity) {
            Ok(cert) => info!(fingerprint = %cert.fingerprint, "Certificate"),
            Err(e) => warn!(error = %e, "Cannot inspect certificate"),
        }
        let registry = self.state.admission.registry();
        info!(
            endpoints = registry.len(),
            tunnel = registry.tunnel_endpoints().count(),
            "Endpoints registered"
        );
        info!(backends = ?self.state.backends.ids().collect::<Vec<_>>(), "Backends");
        if self.state.settings.tunnel_secret.is_some() {
            info!("TUNNEL transport enabled");
        }
        if let Some(dir) = &self.state.settings.static_dir {
            info!(dir = %dir.display(), "Serving UI bundle");
        }
        info!("============================================================");
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Config};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.tls.cert_path = dir.path().join("tls.cert");
        config.tls.key_path = dir.path().join("tls.key");
        config.macaroons.root_key_path = dir.path().join("root_keys.json");
        config.ui.password = Some("long enough password".into());
        config
    }

    #[test]
    fn startup_creates_identity_and_root_keys() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let gateway = Gateway::new(&config).unwrap();

        assert!(config.tls.cert_path.exists());
        assert!(config.macaroons.root_key_path.exists());
        assert!(!gateway.credentials().root_key_ids().is_empty());
        assert!(gateway.state().settings.tunnel_secret.is_none());
    }

    #[test]
    fn restart_keeps_the_same_certificate() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let first = Gateway::new(&config).unwrap().identity().clone();
        let second = Gateway::new(&config).unwrap().identity().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_backend_url_aborts_startup() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.backends.insert(
            "node".into(),
            BackendConfig {
                url: "not a url".into(),
                timeout: Duration::from_secs(1),
            },
        );
        assert!(matches!(Gateway::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn tunnel_secret_only_when_enabled() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.tunnel.pairing_secret = Some("pairing".into());
        let gateway = Gateway::new(&config).unwrap();
        assert!(gateway.state().settings.tunnel_secret.is_none());

        config.tunnel.enabled = true;
        let gateway = Gateway::new(&config).unwrap();
        assert_eq!(
            gateway.state().settings.tunnel_secret.as_deref(),
            Some("pairing")
        );
    }

    #[tokio::test]
    async fn serve_stops_when_shutdown_resolves() {
        let dir = TempDir::new().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            gateway.serve(listener, async {}),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}

//! lightgate - single-port TLS gateway
//!
//! Native gRPC, gRPC-web, JSON and an encrypted tunnel on one listener,
//! with macaroon and session authentication in front of every backend.

use std::collections::BTreeSet;
use std::process::ExitCode;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use lightgate::{
    cli::{Cli, Command, ConstraintArgs},
    config::Config,
    credentials::{Constraints, CredentialStore},
    gateway::Gateway,
    permissions::{Capability, PermissionRegistry},
    setup_tracing,
    tls::{IdentityInfo, ensure_identity, regenerate_identity},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(listen) = cli.listen {
                config.server.listen = listen;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.command {
        Some(Command::Serve) | None => return run_server(&config).await,
        Some(Command::Bake {
            backend,
            capabilities,
            constraints,
        }) => bake(&config, &backend, capabilities, &constraints),
        Some(Command::BakeSuper {
            read_only,
            constraints,
        }) => bake_super(&config, read_only, &constraints),
        Some(Command::RotateKey { root }) => rotate_key(&config, &root),
        Some(Command::Cert { regenerate }) => cert(&config, regenerate),
        Some(Command::Endpoints { format }) => endpoints(&config, &format),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(config: &Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen,
        backends = config.backends.len(),
        tunnel = config.tunnel.enabled,
        "Starting lightgate"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

fn open_store(config: &Config) -> anyhow::Result<CredentialStore> {
    let registry = config.registry()?;
    let store = CredentialStore::open(
        &config.macaroons.root_key_path,
        registry.capabilities_by_backend(),
    )
    .with_context(|| {
        format!(
            "opening root keys at {}",
            config.macaroons.root_key_path.display()
        )
    })?;
    Ok(store)
}

fn constraints(config: &Config, args: &ConstraintArgs) -> anyhow::Result<Constraints> {
    let lifetime = args
        .expiry
        .or_else(|| Some(config.macaroons.default_expiry).filter(|d| !d.is_zero()));
    let expiry = lifetime
        .map(|d| chrono::Duration::from_std(d).map(|d| Utc::now() + d))
        .transpose()
        .context("expiry out of range")?;
    Ok(Constraints {
        expiry,
        client_ip: args.ip,
    })
}

fn bake(
    config: &Config,
    backend: &str,
    capabilities: Vec<Capability>,
    args: &ConstraintArgs,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let capabilities: BTreeSet<Capability> = if capabilities.is_empty() {
        store
            .backend_capabilities(backend)
            .cloned()
            .with_context(|| format!("unknown backend '{backend}'"))?
    } else {
        capabilities.into_iter().collect()
    };

    let credential = store.bake_scoped(backend, &capabilities, &constraints(config, args)?)?;
    print_macaroon(&credential)
}

fn bake_super(config: &Config, read_only: bool, args: &ConstraintArgs) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let credential = store.bake_super(read_only, &constraints(config, args)?)?;
    print_macaroon(&credential)
}

fn print_macaroon(credential: &lightgate::credentials::Credential) -> anyhow::Result<()> {
    let Some(mac) = credential.macaroon() else {
        bail!("baked credential is not a macaroon");
    };
    println!("{}", mac.encode());
    Ok(())
}

fn rotate_key(config: &Config, root: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    store.rotate(root)?;
    println!("✅ Rotated root key '{root}'; macaroons it signed are now invalid");
    Ok(())
}

fn cert(config: &Config, regenerate: bool) -> anyhow::Result<()> {
    let tls = &config.tls;
    let identity = if regenerate {
        regenerate_identity(&tls.cert_path, &tls.key_path, &tls.identity_params())?
    } else {
        ensure_identity(&tls.cert_path, &tls.key_path, &tls.identity_params())?
    };
    let info = IdentityInfo::from_identity(&identity)?;

    let remaining = info.not_after - Utc::now().timestamp();
    println!("Certificate: {}", tls.cert_path.display());
    println!("  Issuer:      {}", info.issuer_organizations.join(", "));
    println!("  SHA-256:     {}", info.fingerprint);
    println!("  Expires in:  {} days", remaining.max(0) / 86_400);
    Ok(())
}

fn endpoints(config: &Config, format: &str) -> anyhow::Result<()> {
    let registry: PermissionRegistry = config.registry()?;

    if format == "json" {
        let rows: Vec<_> = registry.endpoints().collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let flag = |b: bool| if b { "yes" } else { "-" };
    println!(
        "{:<40} {:<12} {:<20} {:<4} {:<4} {:<4} {:<24}",
        "METHOD", "BACKEND", "CAPABILITY", "MAC", "UI", "TUN", "JSON"
    );
    for e in registry.endpoints() {
        println!(
            "{:<40} {:<12} {:<20} {:<4} {:<4} {:<4} {:<24}",
            e.method,
            e.backend,
            e.capability.to_string(),
            flag(e.accepts_macaroon_on_gateway_port),
            flag(e.accepts_session_on_gateway_port),
            flag(e.reachable_via_tunnel),
            e.json_uri.as_deref().unwrap_or("-"),
        );
    }
    println!("\n{} endpoint(s)", registry.len());
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use keyward_core::config::KeywardConfig;
use keyward_keys::{CacheMode, KeyKind, ManagedKeyRef, PolicyStore, StaticSystemView};
use keyward_listener::{Listener, ListenerRegistry};
use keyward_storage::local::LocalBackend;

#[derive(Parser)]
#[command(name = "keyward-server")]
#[command(about = "Keyward — versioned key lifecycle and hot-reloadable TLS")]
struct Cli {
    /// Path to the configuration file (TOML)
    #[arg(long, short, env = "KEYWARD_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keyward=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!("Loading configuration from {}", cli.config.display());
    let config = KeywardConfig::load(&cli.config)?;

    let backend = Arc::new(LocalBackend::new(
        Path::new(&config.keyward.storage_path),
        "local",
    )?);

    let system_view = Arc::new(build_system_view(&config).await?);

    let cache_mode = if config.keyward.cache_disabled {
        tracing::warn!("Policy cache disabled; overlapping rotations are last-write-wins");
        CacheMode::Disabled
    } else {
        CacheMode::Shared
    };
    let store = Arc::new(PolicyStore::new(
        backend,
        system_view,
        cache_mode,
        &config.keyward.backend_id,
    ));

    // Ensure configured key policies exist. Creation is an upsert, so
    // restarting never touches an existing rotation history.
    for key in &config.keys {
        let kind: KeyKind = key.kind.parse()?;
        let managed_ref = (key.managed_name.is_some() || key.managed_id.is_some()).then(|| {
            ManagedKeyRef {
                name: key.managed_name.clone(),
                id: key.managed_id.clone(),
            }
        });
        let policy = store.create(&key.name, kind, managed_ref.as_ref()).await?;
        tracing::info!(
            name = %key.name,
            kind = %policy.kind,
            latest_version = policy.latest_version,
            "Key policy ready"
        );
    }

    // Build every configured listener before serving anything: a bad
    // listener section aborts startup instead of half-listening.
    let registry = ListenerRegistry::builtin();
    let mut listeners = Vec::new();
    for listener_config in &config.listeners {
        let listener = Arc::new(registry.build(listener_config).await?);
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            tls = if listener.is_tls() { "enabled" } else { "disabled" },
            "Listener ready"
        );
        listeners.push(listener);
    }
    if listeners.is_empty() {
        anyhow::bail!("No listeners configured");
    }

    for listener in &listeners {
        spawn_accept_loop(listener.clone());
    }

    #[cfg(unix)]
    spawn_reload_on_sighup(listeners.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}

async fn build_system_view(config: &KeywardConfig) -> anyhow::Result<StaticSystemView> {
    #[cfg(feature = "aws-custodian")]
    if let Some(region) = &config.keyward.aws_region {
        let custodian = keyward_keys::aws::AwsCustodian::new(
            region,
            config.keyward.secret_prefix.as_deref(),
        )
        .await?;
        tracing::info!(region = %region, "Managed-key custodian: AWS Secrets Manager");
        return Ok(StaticSystemView::new(Some(Arc::new(custodian))));
    }

    #[cfg(not(feature = "aws-custodian"))]
    if config.keyward.aws_region.is_some() {
        anyhow::bail!(
            "aws_region is set but the aws-custodian feature is not enabled. \
             Recompile with --features aws-custodian"
        );
    }

    Ok(StaticSystemView::bare())
}

fn spawn_accept_loop(listener: Arc<Listener>) {
    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept error: {e}");
                    continue;
                }
            };
            let listener = listener.clone();
            tokio::spawn(async move {
                // Request handling is mounted by the embedding service; the
                // listener's job ends once the connection is established.
                match listener.secure(stream).await {
                    Ok(_connection) => tracing::debug!(peer = %addr, "Connection established"),
                    Err(e) => tracing::error!(peer = %addr, "Connection error: {e}"),
                }
            });
        }
    });
}

#[cfg(unix)]
fn spawn_reload_on_sighup(listeners: Vec<Arc<Listener>>) {
    tokio::spawn(async move {
        let mut hangups = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!("Cannot install SIGHUP handler: {e}");
                return;
            }
        };
        while hangups.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading TLS certificates");
            for listener in &listeners {
                if let Err(e) = listener.reload() {
                    // The previous certificate stays in service.
                    tracing::error!("Certificate reload failed: {e}");
                }
            }
        }
    });
}

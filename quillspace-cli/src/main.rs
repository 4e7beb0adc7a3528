//! QuillSpace sync CLI
//!
//! Local-first notes vault with peer-to-peer encrypted synchronization.
//! The vault never leaves the device unencrypted; peers on the local
//! network exchange sealed mutation batches directly over TCP.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quillspace_core::database::TrustLevel;
use quillspace_core::platform;
use quillspace_core::sync::discovery::Discovery;
use quillspace_core::sync::models::{EntityDiff, MutationRecord};
use quillspace_core::sync::Resolution;
use quillspace_core::{ReplicaSeed, SyncEngine, VaultContext};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Peer-to-peer encrypted notes synchronization
#[derive(Parser)]
#[command(name = "quillspace", version, about = "Peer-to-peer encrypted notes sync")]
struct Cli {
    /// Path to the vault database
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault on this device
    Init {
        /// Device name; defaults to the hostname
        #[arg(long)]
        name: Option<String>,

        /// Replica seed from `quillspace seed` on an existing device
        #[arg(long)]
        join: Option<String>,
    },

    /// Show vault, device, and sync status
    Status,

    /// Print the seed another device needs to join this vault's sync space
    Seed,

    /// Browse the local network for advertising peers
    Discover {
        /// Seconds to wait for advertisements
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },

    /// Advertise this vault and serve sync sessions until Ctrl-C
    Listen {
        /// TCP port to bind; 0 picks a free port
        #[arg(long)]
        port: Option<u16>,

        /// Also sync with discovered peers in the background
        #[arg(long)]
        auto: bool,
    },

    /// Run one sync round with a peer
    Sync {
        /// Peer address (host:port) or discovered device id
        peer: String,

        /// Seconds to browse when the peer is given by device id
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },

    /// List paired peer devices
    Peers,

    /// Mark a peer's pinned key as verified
    Verify {
        device_id: Uuid,
    },

    /// Revoke a peer; future sessions are refused
    Revoke {
        device_id: Uuid,
    },

    /// List pending conflicts
    Conflicts,

    /// Resolve a pending conflict
    Resolve {
        conflict_id: i64,

        /// Which side to keep
        #[arg(value_enum)]
        keep: KeepSide,
    },

    /// Show recent sync rounds
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KeepSide {
    Local,
    Remote,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let vault_path = cli.vault.unwrap_or_else(platform::get_default_vault_path);

    match cli.command {
        Commands::Init { name, join } => init(&vault_path, name, join).await,
        Commands::Status => status(&unlock(&vault_path).await?),
        Commands::Seed => seed(&unlock(&vault_path).await?),
        Commands::Discover { wait } => discover(&unlock(&vault_path).await?, wait).await,
        Commands::Listen { port, auto } => listen(unlock(&vault_path).await?, port, auto).await,
        Commands::Sync { peer, wait } => sync(unlock(&vault_path).await?, &peer, wait).await,
        Commands::Peers => peers(&unlock(&vault_path).await?),
        Commands::Verify { device_id } => {
            set_trust(&unlock(&vault_path).await?, &device_id, TrustLevel::Verified)
        }
        Commands::Revoke { device_id } => {
            set_trust(&unlock(&vault_path).await?, &device_id, TrustLevel::Revoked)
        }
        Commands::Conflicts => conflicts(&unlock(&vault_path).await?),
        Commands::Resolve { conflict_id, keep } => {
            resolve(&unlock(&vault_path).await?, conflict_id, keep)
        }
        Commands::History { limit } => history(&unlock(&vault_path).await?, limit),
    }
}

async fn init(vault_path: &Path, name: Option<String>, join: Option<String>) -> Result<()> {
    let device_name = name.unwrap_or_else(platform::default_device_name);
    let passphrase = read_passphrase(true)?;

    let context = match join {
        Some(encoded) => {
            let seed = ReplicaSeed::decode(&encoded).context("invalid replica seed")?;
            VaultContext::create_replica(vault_path, &passphrase, &device_name, &seed).await?
        }
        None => VaultContext::create(vault_path, &passphrase, &device_name).await?,
    };

    println!("Vault created at {}", vault_path.display());
    println!("  device  {}  ({})", context.device_id(), context.device_name());
    println!("  space   {}", context.space_id());
    println!("  key     {}", context.fingerprint());
    Ok(())
}

async fn unlock(vault_path: &Path) -> Result<VaultContext> {
    let passphrase = read_passphrase(false)?;
    VaultContext::unlock(vault_path, &passphrase)
        .await
        .with_context(|| format!("could not unlock vault at {}", vault_path.display()))
}

fn read_passphrase(confirm: bool) -> Result<String> {
    if let Ok(passphrase) = std::env::var("QUILLSPACE_PASSPHRASE") {
        return Ok(passphrase);
    }
    let passphrase = rpassword::prompt_password("Passphrase: ")?;
    if confirm {
        let again = rpassword::prompt_password("Confirm passphrase: ")?;
        if passphrase != again {
            bail!("passphrases do not match");
        }
    }
    Ok(passphrase)
}

fn status(context: &VaultContext) -> Result<()> {
    println!("Device    {}  ({})", context.device_id(), context.device_name());
    println!("Space     {}", context.space_id());
    println!("Key       {}", context.fingerprint());
    println!("Entities  {}", context.entities()?.len());

    let pending = context.pending_conflicts()?;
    if !pending.is_empty() {
        println!("Conflicts {} pending", pending.len());
    }
    match context.settings().last_sync_at {
        Some(ms) => println!("Last sync {}", format_time(ms)),
        None => println!("Last sync never"),
    }
    Ok(())
}

fn seed(context: &VaultContext) -> Result<()> {
    println!("{}", context.replica_seed()?.encode()?);
    eprintln!("Run `quillspace init --join <seed>` on the new device, with the same passphrase.");
    Ok(())
}

async fn discover(context: &VaultContext, wait: u64) -> Result<()> {
    let settings = context.settings();
    let discovery = Arc::new(Discovery::new(
        context.device_id(),
        settings.discovery_stale_secs,
    )?);
    let browse = Arc::clone(&discovery).spawn_browse_task();

    tokio::time::sleep(Duration::from_secs(wait)).await;
    let candidates = discovery.candidates();
    discovery.shutdown();
    let _ = browse.await;

    if candidates.is_empty() {
        println!("No peers found");
        return Ok(());
    }
    let known: HashMap<Uuid, TrustLevel> = context
        .peers()?
        .into_iter()
        .map(|peer| (peer.device_id, peer.trust))
        .collect();
    for candidate in candidates {
        let trust = known
            .get(&candidate.device_id)
            .copied()
            .unwrap_or(TrustLevel::Unknown);
        println!(
            "{}  {}  {:<24}  trust {}",
            candidate.device_id,
            candidate.address,
            candidate.device_name,
            trust.as_str()
        );
    }
    Ok(())
}

async fn listen(context: VaultContext, port: Option<u16>, auto: bool) -> Result<()> {
    let context = Arc::new(context);
    let settings = context.settings();
    let port = port.unwrap_or(settings.listen_port);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let local_port = listener.local_addr()?.port();

    let discovery = Arc::new(Discovery::new(
        context.device_id(),
        settings.discovery_stale_secs,
    )?);
    discovery.advertise(context.device_name(), local_port)?;
    let browse = Arc::clone(&discovery).spawn_browse_task();

    let engine = SyncEngine::new(Arc::clone(&context));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = auto.then(|| engine.spawn_worker(Arc::clone(&discovery), shutdown_rx.clone()));
    let server = {
        let engine = engine.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { engine.serve(listener, shutdown_rx).await })
    };

    println!("Listening on port {local_port}; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("stopping sync listener");

    let _ = shutdown_tx.send(true);
    discovery.shutdown();
    if let Some(worker) = worker {
        let _ = worker.await;
    }
    server.await??;
    let _ = browse.await;
    Ok(())
}

async fn sync(context: VaultContext, peer: &str, wait: u64) -> Result<()> {
    let context = Arc::new(context);
    let addr = resolve_peer(&context, peer, wait).await?;
    let engine = SyncEngine::new(Arc::clone(&context));

    let summary = engine.sync_with(addr).await?;
    println!(
        "Synced with {}: sent {}, received {}, applied {}, skipped {}, conflicts {} ({} ms)",
        summary.peer_device_id,
        summary.sent,
        summary.received,
        summary.applied,
        summary.skipped,
        summary.conflicts,
        summary.duration_ms
    );
    if summary.conflicts > 0 {
        println!("Run `quillspace conflicts` to review them.");
    }
    Ok(())
}

async fn resolve_peer(context: &VaultContext, peer: &str, wait: u64) -> Result<SocketAddr> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let device_id: Uuid = peer
        .parse()
        .context("peer must be a host:port address or a device id")?;

    let settings = context.settings();
    let discovery = Arc::new(Discovery::new(
        context.device_id(),
        settings.discovery_stale_secs,
    )?);
    let browse = Arc::clone(&discovery).spawn_browse_task();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    let found = loop {
        if let Some(candidate) = discovery.candidate(&device_id) {
            break Some(candidate);
        }
        if tokio::time::Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };
    discovery.shutdown();
    let _ = browse.await;

    found
        .map(|c| c.address)
        .ok_or_else(|| anyhow!("peer {device_id} not found on the local network"))
}

fn peers(context: &VaultContext) -> Result<()> {
    let peers = context.peers()?;
    if peers.is_empty() {
        println!("No paired peers");
        return Ok(());
    }
    for peer in peers {
        let last_sync = peer
            .last_sync_at
            .map(format_time)
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {:<24}  trust {:<11}  last sync {}",
            peer.device_id,
            peer.device_name,
            peer.trust.as_str(),
            last_sync
        );
    }
    Ok(())
}

fn set_trust(context: &VaultContext, device_id: &Uuid, trust: TrustLevel) -> Result<()> {
    if !context.set_peer_trust(device_id, trust)? {
        bail!("no paired peer {device_id}");
    }
    match trust {
        TrustLevel::Verified => println!("Peer {device_id} marked verified"),
        TrustLevel::Revoked => println!("Peer {device_id} revoked; future sessions will be refused"),
        _ => println!("Peer {device_id} trust set to {}", trust.as_str()),
    }
    Ok(())
}

fn conflicts(context: &VaultContext) -> Result<()> {
    let pending = context.pending_conflicts()?;
    if pending.is_empty() {
        println!("No pending conflicts");
        return Ok(());
    }
    for conflict in pending {
        println!(
            "#{}  entity {}  detected {}",
            conflict.conflict_id,
            conflict.entity_id,
            format_time(conflict.detected_at)
        );
        println!("  local   {}", summarize(&conflict.local_mutation));
        println!("  remote  {}", summarize(&conflict.remote_mutation));
    }
    println!("Resolve with `quillspace resolve <id> local|remote`");
    Ok(())
}

fn resolve(context: &VaultContext, conflict_id: i64, keep: KeepSide) -> Result<()> {
    let resolution = match keep {
        KeepSide::Local => Resolution::KeepLocal,
        KeepSide::Remote => Resolution::AcceptRemote,
    };
    context.resolve_conflict(conflict_id, resolution)?;
    println!("Conflict #{conflict_id} resolved; the decision propagates on the next sync");
    Ok(())
}

fn history(context: &VaultContext, limit: usize) -> Result<()> {
    let entries = context.sync_history(limit)?;
    if entries.is_empty() {
        println!("No sync rounds recorded");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {:<9}  peer {}  sent {} received {} applied {} skipped {} conflicts {}  {} ms",
            format_time(entry.started_at),
            entry.outcome,
            entry.peer_device_id,
            entry.sent,
            entry.received,
            entry.applied,
            entry.skipped,
            entry.conflicts,
            entry.duration_ms
        );
    }
    Ok(())
}

fn summarize(record: &MutationRecord) -> String {
    let kind = match &record.diff {
        EntityDiff::Snapshot { .. } => "snapshot",
        EntityDiff::Fields(_) => "field edit",
        EntityDiff::Tombstone => "delete",
    };
    format!(
        "{} {} from {} at {}",
        record.entity_type,
        kind,
        record.origin_device_id,
        format_time(record.timestamp_ms)
    )
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

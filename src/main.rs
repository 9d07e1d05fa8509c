//! Courier CLI entry point.
//!
//! `start` runs the daemon (connections plus campaign supervisor). The other
//! subcommands are one-shot operations against the same SQLite store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{info, warn};

use courier::campaign::{Action, CampaignService};
use courier::config::Config;
use courier::connection::{Backoff, ConnectionManager, ConnectionStatus};
use courier::dispatcher::{supervisor, CampaignDispatcher};
use courier::store::campaigns::NewCampaign;
use courier::store::{self, connections};
use courier::transport::bridge::BridgeConnector;

/// How long `connect` waits for the phone to finish pairing.
const PAIRING_TIMEOUT: Duration = Duration::from_secs(300);

/// Courier: tenant connections and drip campaigns over a chat protocol.
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the daemon: restore connections and supervise campaigns.
    Start,
    /// Show connections and campaigns.
    Status,
    /// Pair a tenant interactively and store its credentials.
    Connect {
        /// Tenant identity.
        tenant: String,
        /// Pair with a numeric code for this phone number instead of a QR code.
        #[arg(long)]
        phone: Option<String>,
    },
    /// Log a tenant out and delete its stored credentials.
    Logout {
        /// Tenant identity.
        tenant: String,
    },
    /// Manage campaigns.
    Campaign {
        /// Campaign operation.
        #[command(subcommand)]
        command: CampaignCommand,
    },
}

/// Campaign operations.
#[derive(Subcommand)]
enum CampaignCommand {
    /// List campaigns.
    List,
    /// Show one campaign with its progress.
    Show {
        /// Campaign id.
        id: i64,
    },
    /// Create a draft campaign from a TOML definition.
    Create {
        /// Path to the definition file.
        file: PathBuf,
    },
    /// Start a draft or paused campaign.
    Start {
        /// Campaign id.
        id: i64,
    },
    /// Pause a running campaign.
    Pause {
        /// Campaign id.
        id: i64,
    },
    /// Resume a paused campaign.
    Resume {
        /// Campaign id.
        id: i64,
    },
    /// Move failed recipients back to pending.
    Requeue {
        /// Campaign id.
        id: i64,
    },
    /// Delete a campaign with its recipients and logs.
    Delete {
        /// Campaign id.
        id: i64,
    },
}

/// Shared runtime objects.
struct Runtime {
    db: SqlitePool,
    connections: Arc<ConnectionManager>,
    dispatcher: CampaignDispatcher,
}

impl Runtime {
    async fn build(config: &Config) -> anyhow::Result<Self> {
        if let Some(parent) = config.database.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = store::open(&config.database.path).await?;
        let connector = Arc::new(BridgeConnector::new(&config.bridge));
        let connections = Arc::new(ConnectionManager::new(
            db.clone(),
            connector,
            Backoff::from_config(&config.reconnect),
            config.connection.pairing_wait(),
        ));
        let dispatcher = CampaignDispatcher::new(db.clone(), Arc::clone(&connections));
        Ok(Self {
            db,
            connections,
            dispatcher,
        })
    }

    fn campaigns(&self) -> CampaignService {
        CampaignService::new(self.db.clone(), self.dispatcher.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Command::Start => handle_start(config).await,
        Command::Status => handle_status(config).await,
        Command::Connect { tenant, phone } => handle_connect(config, &tenant, phone).await,
        Command::Logout { tenant } => handle_logout(config, &tenant).await,
        Command::Campaign { command } => handle_campaign(config, command).await,
    }
}

/// Run the daemon until Ctrl-C.
async fn handle_start(config: Config) -> anyhow::Result<()> {
    let _logging_guard = courier::logging::init_daemon(&config.logging)?;
    let runtime = Runtime::build(&config).await?;

    info!(
        db = %config.database.path.display(),
        bridge = %config.bridge.base_url,
        "courier daemon starting"
    );

    let restored = runtime
        .connections
        .restore_all()
        .await
        .context("failed to restore connections")?;
    info!(restored, "stored connections resumed");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor_task = tokio::spawn(supervisor::run_supervisor(
        runtime.dispatcher.clone(),
        Duration::from_secs(config.dispatcher.supervisor_interval_secs),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Err(e) = supervisor_task.await {
        warn!(error = %e, "campaign supervisor ended abnormally");
    }
    runtime.dispatcher.shutdown().await;
    runtime.connections.shutdown().await;
    runtime.db.close().await;
    info!("courier daemon stopped");
    Ok(())
}

/// Print connections and campaigns.
async fn handle_status(config: Config) -> anyhow::Result<()> {
    courier::logging::init_cli(&config.logging.level);
    let runtime = Runtime::build(&config).await?;

    let records = connections::list(&runtime.db).await?;
    println!("connections:");
    if records.is_empty() {
        println!("  (none)");
    }
    for record in records {
        println!(
            "  {:<24} {:<13} phone={} attempts={} updated={}",
            record.id,
            record.status.as_str(),
            record.phone_number.as_deref().unwrap_or("-"),
            record.reconnect_attempts,
            record.updated_at
        );
    }

    let service = runtime.campaigns();
    println!("campaigns:");
    let campaigns = service.list().await?;
    if campaigns.is_empty() {
        println!("  (none)");
    }
    for campaign in campaigns {
        let progress = service.progress(campaign.id).await?;
        println!(
            "  #{:<5} {:<24} {:<9} instance={} recipients={} sent={} failed={}",
            campaign.id,
            campaign.name,
            campaign.status.as_str(),
            campaign.instance_id,
            progress.recipients.total(),
            progress.sent_logs,
            progress.failed_logs
        );
    }
    Ok(())
}

/// Pair a tenant in the foreground, then close the session keeping credentials.
async fn handle_connect(config: Config, tenant: &str, phone: Option<String>) -> anyhow::Result<()> {
    courier::logging::init_cli(&config.logging.level);
    let runtime = Runtime::build(&config).await?;
    let manager = &runtime.connections;

    if let Some(phone) = phone {
        let code = manager
            .request_pairing_code(tenant, &phone)
            .await
            .context("failed to obtain pairing code")?;
        println!("pairing code for {tenant}: {code}");
        println!("enter it on the phone under Linked devices");
    }

    let handle = manager.get_or_create(tenant).await?;
    let mut status_rx = handle.subscribe();
    let mut last_qr: Option<String> = None;
    let deadline = tokio::time::Instant::now()
        .checked_add(PAIRING_TIMEOUT)
        .context("pairing deadline overflow")?;

    loop {
        let status = *status_rx.borrow_and_update();
        match status {
            ConnectionStatus::Connected => {
                let record = connections::get(&runtime.db, tenant).await?;
                let phone = record
                    .and_then(|r| r.phone_number)
                    .unwrap_or_else(|| "unknown number".to_owned());
                println!("{tenant} connected as {phone}");
                break;
            }
            ConnectionStatus::LoggedOut => {
                anyhow::bail!("{tenant} was logged out during pairing");
            }
            ConnectionStatus::QrReady => {
                let qr = connections::get(&runtime.db, tenant)
                    .await?
                    .and_then(|r| r.current_qr);
                if qr.is_some() && qr != last_qr {
                    println!("scan this QR payload with the phone:");
                    println!("{}", qr.as_deref().unwrap_or_default());
                    last_qr = qr;
                }
            }
            other => info!(tenant, status = %other, "waiting for pairing"),
        }

        match tokio::time::timeout_at(deadline, status_rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => anyhow::bail!("session for {tenant} ended"),
            Err(_) => {
                manager.disconnect(tenant).await?;
                anyhow::bail!("pairing {tenant} timed out");
            }
        }
    }

    manager.disconnect(tenant).await?;
    runtime.db.close().await;
    Ok(())
}

/// Log a tenant out remotely when possible, and purge it locally.
async fn handle_logout(config: Config, tenant: &str) -> anyhow::Result<()> {
    courier::logging::init_cli(&config.logging.level);
    let runtime = Runtime::build(&config).await?;
    let manager = &runtime.connections;

    if connections::load_credentials(&runtime.db, tenant)
        .await?
        .is_some()
    {
        let handle = manager.get_or_create(tenant).await?;
        if let Err(e) = handle
            .wait_for(config.connection.pairing_wait(), |s| {
                s == ConnectionStatus::Connected
            })
            .await
        {
            warn!(tenant, error = %e, "could not reach the session, logging out locally");
        }
    }
    manager.logout(tenant).await?;
    println!("{tenant} logged out");
    runtime.db.close().await;
    Ok(())
}

async fn handle_campaign(config: Config, command: CampaignCommand) -> anyhow::Result<()> {
    courier::logging::init_cli(&config.logging.level);
    let runtime = Runtime::build(&config).await?;
    let service = runtime.campaigns();

    match command {
        CampaignCommand::List => {
            for campaign in service.list().await? {
                println!(
                    "#{:<5} {:<24} {:<9} instance={} created={}",
                    campaign.id,
                    campaign.name,
                    campaign.status.as_str(),
                    campaign.instance_id,
                    campaign.created_at
                );
            }
        }
        CampaignCommand::Show { id } => {
            let progress = service.progress(id).await?;
            let json = serde_json::to_string_pretty(&progress)
                .context("failed to serialize campaign progress")?;
            println!("{json}");
        }
        CampaignCommand::Create { file } => {
            let definition = read_definition(&file)?;
            let id = service.create(definition).await?;
            println!("created campaign #{id} (draft)");
        }
        CampaignCommand::Start { id } => {
            service.request_action(id, Action::Start).await?;
            println!("campaign #{id} running; the daemon will pick it up");
        }
        CampaignCommand::Pause { id } => {
            service.request_action(id, Action::Pause).await?;
            println!("campaign #{id} paused");
        }
        CampaignCommand::Resume { id } => {
            service.request_action(id, Action::Resume).await?;
            println!("campaign #{id} running; the daemon will pick it up");
        }
        CampaignCommand::Requeue { id } => {
            let requeued = service.requeue_failed(id).await?;
            println!("requeued {requeued} failed recipient(s) of campaign #{id}");
        }
        CampaignCommand::Delete { id } => {
            service.delete(id).await?;
            println!("deleted campaign #{id}");
        }
    }

    runtime.db.close().await;
    Ok(())
}

/// Read a campaign definition from TOML.
fn read_definition(path: &Path) -> anyhow::Result<NewCampaign> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

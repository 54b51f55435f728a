//! trustgate - temporary firewall trust for enforcement hosts
//!
//! Trusts a client address on its tenant's firewall for a fixed TTL and
//! sweeps expired addresses back off the firewall in the background.
//!
//! # Environment Variables
//!
//! - `TRUSTGATE_CONFIG`: Path to the config file
//! - `RUST_LOG`: Log filter (default `info`)
//! - `RUST_LOG_FORMAT`: `json` for structured logs

mod config;
mod database;
mod firewall;
mod pool;
mod trust;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use config::Config;
use database::models::{CallerId, Tenant};
use database::{Database, DatabaseImpl, initialize_database};
use firewall::{Address, SshFirewallProvider};
use trust::{Clock, Sweeper, SystemClock, TenantRegistry, TrustService};

#[derive(Parser, Debug)]
#[command(name = "trustgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (created with defaults if missing)
    #[arg(short, long, env = "TRUSTGATE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sweeper until interrupted
    Run,
    /// Run a single sweep and print its report
    Sweep,
    /// Trust an address for the configured TTL
    Trust {
        address: Address,
        /// Caller whose account link selects the tenant
        #[arg(long)]
        caller: Option<i64>,
    },
    /// Remove an address from its firewall and the store
    Revoke { address: Address },
    /// Ask the firewall whether an address is trusted
    Check {
        address: Address,
        #[arg(long)]
        caller: Option<i64>,
    },
    /// List stored trust records
    List,
    /// Compare stored records with each firewall's listing
    Audit,
    /// Manage tenants
    #[command(subcommand)]
    Tenant(TenantCommand),
    /// Manage caller account links
    #[command(subcommand)]
    Caller(CallerCommand),
}

#[derive(Subcommand, Debug)]
enum TenantCommand {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "root")]
        user: String,
        /// Private key path handed to the channel
        #[arg(long, default_value = "")]
        credential: String,
    },
    List,
    Remove { id: i64 },
}

#[derive(Subcommand, Debug)]
enum CallerCommand {
    /// Link a caller to a tenant, or unlink it when --tenant is omitted
    Assign {
        caller: i64,
        #[arg(long)]
        tenant: Option<i64>,
    },
}

/// Everything a command needs, wired once at startup.
struct App {
    config: Config,
    database: Arc<dyn Database>,
    registry: Arc<TenantRegistry>,
    clock: Arc<dyn Clock>,
    service: TrustService,
    sweeper: Arc<Sweeper>,
}

impl App {
    async fn start(config: Config) -> Result<Self> {
        let pool = pool::open_local(&config.database.path)
            .await
            .with_context(|| format!("failed to open database {}", config.database.path))?;

        let conn = pool.get().await?;
        initialize_database(&conn).await?;
        drop(conn);

        let database: Arc<dyn Database> = Arc::new(DatabaseImpl::new_from_pool(pool));
        let fallback = config.default_tenant.as_ref().map(|tenant| tenant.to_tenant());
        let registry = Arc::new(TenantRegistry::new(Arc::clone(&database), fallback));
        let firewalls = Arc::new(SshFirewallProvider::new(&config.channel));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let service = TrustService::new(
            Arc::clone(&database),
            Arc::clone(&registry),
            firewalls.clone(),
            Arc::clone(&clock),
            config.trust.ttl(),
        );
        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&database),
            Arc::clone(&registry),
            firewalls,
            Arc::clone(&clock),
            config.sweeper.retain_failed,
        ));

        Ok(Self { config, database, registry, clock, service, sweeper })
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct ListedRecord<'a> {
    #[serde(flatten)]
    record: &'a database::models::TrustedAddress,
    expired: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logger::init();

    let args = Args::parse();
    let config = Config::from_config(args.config.as_ref())?;
    let app = App::start(config).await?;

    match args.command {
        Command::Run => run(app).await?,
        Command::Sweep => match app.sweeper.run_once().await {
            Some(report) => print_json(&report)?,
            None => anyhow::bail!("sweep did not complete, see log"),
        },
        Command::Trust { address, caller } => {
            match app.service.trust(&address, caller.map(CallerId)).await? {
                Some(record) => print_json(&record)?,
                None => println!("No tenant for this caller, nothing trusted"),
            }
        }
        Command::Revoke { address } => {
            let removed = app.service.revoke(&address).await?;
            println!("{address}: {}", if removed { "revoked" } else { "no local record" });
        }
        Command::Check { address, caller } => {
            let trusted = app.service.is_trusted(&address, caller.map(CallerId)).await;
            println!("{address}: {}", if trusted { "trusted" } else { "not trusted" });
        }
        Command::List => {
            let now = app.clock.now();
            let records = app.database.list_trusted().await?;
            let listed: Vec<ListedRecord<'_>> = records
                .iter()
                .map(|record| ListedRecord { record, expired: record.is_expired(now) })
                .collect();
            print_json(&listed)?;
        }
        Command::Audit => {
            let reports = app.service.audit().await?;
            print_json(&reports)?;
            if reports.iter().any(|report| !report.is_consistent()) {
                std::process::exit(2);
            }
        }
        Command::Tenant(command) => tenant_command(&app, command).await?,
        Command::Caller(CallerCommand::Assign { caller, tenant }) => {
            let caller = CallerId(caller);
            app.database.assign_caller(caller, tenant).await?;
            if let Some(link) = app.database.get_caller(caller).await? {
                print_json(&link)?;
            }
        }
    }

    Ok(())
}

async fn run(app: App) -> Result<()> {
    info!(ttl_minutes = app.service.ttl().num_minutes(), "trustgate starting\n{}", app.config);
    if let Some(fallback) = app.registry.fallback() {
        info!(tenant = %fallback.name, host = %fallback.host, "Unlinked callers use the default tenant");
    }

    let handle = Arc::clone(&app.sweeper).start_periodic(app.config.sweeper.interval());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping sweeper");
    handle.abort();
    Ok(())
}

async fn tenant_command(app: &App, command: TenantCommand) -> Result<()> {
    match command {
        TenantCommand::Add { name, host, user, credential } => {
            let id = app.database.create_tenant(&Tenant::new(name, host, user, credential)).await?;
            match app.database.get_tenant(id).await? {
                Some(tenant) => print_json(&tenant)?,
                None => println!("Created tenant {id}"),
            }
        }
        TenantCommand::List => print_json(&app.registry.all_tenants().await?)?,
        TenantCommand::Remove { id } => {
            app.database.delete_tenant(id).await?;
            println!("Removed tenant {id}");
        }
    }
    Ok(())
}

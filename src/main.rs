//! # Chaser: Invoice Chase Scheduler
//!
//! Sends reminder, due and weekly late emails for unpaid invoices under
//! per-plan send limits.
//!
//! Usage:
//!   chaser serve                       # HTTP gateway (cron trigger, manual chase, preview)
//!   chaser serve --interval-secs 300   # ...plus a built-in trigger loop
//!   chaser run-batch --dry-run         # One batch from the command line
//!   chaser preview <invoice_id>        # Timeline and next email for an invoice
//!   chaser init-config                 # Write ~/.chaser/config.toml

use anyhow::{Context, Result};
use chaser_core::ChaserConfig;
use chaser_scheduler::{ChaserDb, Collaborators, Dispatcher};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chaser",
    version,
    about = "📬 Chaser: Invoice Chase Email Scheduler"
)]
struct Cli {
    /// Config file (defaults to ~/.chaser/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        /// Also run batches on this period (overrides dispatch.interval_secs)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Run a single chase batch and print the report
    RunBatch {
        /// Record dry-run events instead of sending
        #[arg(long)]
        dry_run: bool,
        /// Evaluate as of this RFC 3339 instant instead of now
        #[arg(long)]
        now: Option<String>,
    },
    /// Show the schedule for one invoice
    Preview {
        invoice_id: String,
        /// Only show the invoice if it belongs to this tenant
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(path: Option<&Path>) -> Result<ChaserConfig> {
    let mut config = match path {
        Some(p) => ChaserConfig::load_from(p)?,
        None => ChaserConfig::load()?,
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn build_dispatcher(config: &ChaserConfig) -> Result<Arc<Dispatcher>> {
    let db_path = expand_path(&config.store.db_path);
    let db = Arc::new(
        ChaserDb::open(Path::new(&db_path))
            .with_context(|| format!("opening database at {db_path}"))?,
    );
    tracing::info!("🗄️ Database: {}", db_path);

    let mailer = chaser_channels::build_mailer(&config.mailer)?;
    let dispatcher = Dispatcher::from_config(config, Collaborators::from_store(db, mailer))?;
    Ok(Arc::new(dispatcher))
}

fn parse_now(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        Some(s) => Ok(DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("--now '{s}' is not an RFC 3339 timestamp"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "chaser=debug,chaser_core=debug,chaser_scheduler=debug,chaser_channels=debug,chaser_gateway=debug,tower_http=debug"
    } else {
        "chaser=info,chaser_core=info,chaser_scheduler=info,chaser_channels=info,chaser_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match cli.command {
        Command::InitConfig { force } => {
            let path = cli.config.unwrap_or_else(ChaserConfig::default_path);
            if path.exists() && !force {
                println!("⚠️  Config already exists at {} (use --force to overwrite)", path.display());
                return Ok(());
            }
            ChaserConfig::default().save_to(&path)?;
            println!("✅ Wrote default config to {}", path.display());
        }
        Command::Serve { interval_secs } => {
            let config = load_config(cli.config.as_deref())?;
            let dispatcher = build_dispatcher(&config)?;
            let interval = interval_secs.unwrap_or(config.dispatch.interval_secs);

            let ticker = (interval > 0).then(|| {
                tracing::info!("⏱️ Built-in chase loop every {}s", interval);
                chaser_scheduler::spawn_chase_loop(dispatcher.clone(), interval)
            });

            let state = chaser_gateway::AppState::new(
                dispatcher,
                config.environment,
                config.gateway.cron_secret.as_deref(),
            );
            let served = chaser_gateway::start(&config.gateway, state).await;

            if let Some((stop, handle)) = ticker {
                stop.send(true).ok();
                handle.await.ok();
            }
            served?;
        }
        Command::RunBatch { dry_run, now } => {
            let mut config = load_config(cli.config.as_deref())?;
            config.dispatch.dry_run |= dry_run;
            let now = parse_now(now.as_deref())?;
            let dispatcher = build_dispatcher(&config)?;
            let report = dispatcher.run_batch(now).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Preview { invoice_id, tenant } => {
            let config = load_config(cli.config.as_deref())?;
            let dispatcher = build_dispatcher(&config)?;
            match dispatcher.preview(&invoice_id, tenant.as_deref(), Utc::now()).await? {
                Some(preview) => println!("{}", serde_json::to_string_pretty(&preview)?),
                None => anyhow::bail!("invoice {invoice_id} not found"),
            }
        }
    }

    Ok(())
}

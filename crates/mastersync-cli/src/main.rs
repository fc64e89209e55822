use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mastersync_sync::{
    build_scheduler, build_services, load_header_rules, run_pass_with_timeout, ActionResult,
    SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mastersync")]
#[command(about = "Mirror the MASTER sheet into the document store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Sync {
        /// Run even when the sheet has not changed since the last pass.
        #[arg(long)]
        force: bool,
    },
    /// Run passes on MASTERSYNC_SYNC_CRON until interrupted.
    Schedule,
    Serve,
    ApproveBooking { id: String },
    DeleteBooking { id: String },
    /// Print the effective header rules as YAML.
    ShowRules,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("MASTERSYNC_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn report(result: ActionResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        bail!(result.message);
    }
    if !result.sheet_synced {
        warn!("documents updated but the spreadsheet is out of date");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { force: false }) {
        Commands::Sync { force } => {
            let services = build_services(&config).await?;
            let summary =
                run_pass_with_timeout(&services.reconciler, force, config.pass_timeout()).await?;
            println!(
                "sync complete: run_id={} outcome={:?} rows={} rejected={} written={} batches={}",
                summary.run_id,
                summary.outcome,
                summary.rows_read,
                summary.rows_rejected,
                summary.records_written,
                summary.batches_committed
            );
        }
        Commands::Schedule => {
            let services = build_services(&config).await?;
            let mut sched =
                build_scheduler(services.reconciler, &config.sync_cron, config.pass_timeout()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => mastersync_web::serve_from_env().await?,
        Commands::ApproveBooking { id } => {
            let services = build_services(&config).await?;
            report(services.point_sync.approve_booking(&id).await)?;
        }
        Commands::DeleteBooking { id } => {
            let services = build_services(&config).await?;
            report(services.point_sync.delete_booking(&id).await)?;
        }
        Commands::ShowRules => {
            let rules = load_header_rules(config.header_rules_path.as_deref()).await?;
            print!("{}", serde_yaml::to_string(&rules.to_file())?);
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use placeflow_core::ChunkLease;
use placeflow_storage::PlaceStore;
use placeflow_sync::{PipelineConfig, Services};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "placeflow-cli")]
#[command(about = "Place readiness pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drain unfinished places once under the lease lock.
    Run,
    /// Run the cron-driven batch and cleanup jobs until interrupted.
    Schedule,
    /// Fail expired leases so other workers can pick them up.
    Reap,
    /// Delete completed and stale failed leases past the retention window.
    Cleanup,
    /// Print the lease table of the configured job as JSON lines.
    Leases {
        /// Only chunks that exhausted their retries.
        #[arg(long)]
        exhausted: bool,
    },
    /// Make one place ready on demand.
    Process { place_id: i64 },
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PLACEFLOW_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn print_leases(leases: &[ChunkLease]) -> Result<()> {
    for lease in leases {
        println!("{}", serde_json::to_string(lease)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let services = Services::connect(config).await?;
            let summary = services.worker.run_once().await?;
            println!(
                "batch complete: run_id={} completed={} failed={} ready={} retryable={} saturated={}",
                summary.run_id,
                summary.units_completed,
                summary.units_failed,
                summary.places.ready,
                summary.places.retryable,
                summary.saturated
            );
        }
        Commands::Schedule => {
            let config = PipelineConfig {
                scheduler_enabled: true,
                ..config
            };
            let services = Services::connect(config).await?;
            let Some(mut sched) = services.worker.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                batch_cron = %services.config.batch_cron,
                cleanup_cron = %services.config.cleanup_cron,
                "scheduler running; ctrl-c to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Reap => {
            let services = Services::connect(config).await?;
            let reaped = services.worker.reap().await?;
            println!("reaped {reaped} expired leases");
        }
        Commands::Cleanup => {
            let services = Services::connect(config).await?;
            let deleted = services.worker.cleanup().await?;
            println!("deleted {deleted} leases past retention");
        }
        Commands::Leases { exhausted } => {
            let services = Services::connect(config).await?;
            let job = &services.config.job_name;
            let leases = if exhausted {
                services.leases.exhausted_chunks(job).await?
            } else {
                services.leases.leases(job).await?
            };
            print_leases(&leases)?;
        }
        Commands::Process { place_id } => {
            let services = Services::connect(config).await?;
            let place = services
                .places
                .find(place_id)
                .await
                .with_context(|| format!("loading place {place_id}"))?
                .with_context(|| format!("place {place_id} not found"))?;
            let place = services.realtime.process_realtime(place).await;
            println!("{}", serde_json::to_string_pretty(&place)?);
        }
        Commands::Migrate => {
            let pool = placeflow_storage::connect_pool(
                &config.database_url,
                config.database_max_connections,
            )
            .await
            .context("connecting to database")?;
            placeflow_storage::run_migrations(&pool)
                .await
                .context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

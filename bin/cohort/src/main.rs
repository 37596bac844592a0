//! # Cohort Binary
//!
//! Assembles the engine from compile-time selected plugins. `run` starts
//! the trigger scheduler; every other subcommand performs one administrative
//! call and prints its JSON `Outcome` on stdout (logs go to stderr).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cohort_configs::{LogFormat, LogSettings, Settings};
use cohort_core::error::Result as EngineResult;
use cohort_core::models::ProfileFields;
use cohort_core::traits::{Store, SystemClock};
use cohort_core::CycleId;
use cohort_engine::eligibility::{ExpiryReport, SweepReport};
use cohort_engine::{Engine, EngineSettings, InboundCommand, Outcome, Ports, Scheduler, SchedulerConfig};
use cohort_notify_log::LogNotifier;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(feature = "db-sqlite")]
use cohort_db_sqlite::SqliteStore;

#[cfg(all(feature = "store-memory", not(feature = "db-sqlite")))]
use cohort_store_memory::MemoryStore;

#[cfg(not(any(feature = "db-sqlite", feature = "store-memory")))]
compile_error!("enable at least one store feature: db-sqlite or store-memory");

#[derive(Parser, Debug)]
#[command(name = "cohort")]
#[command(about = "Weekly cohort cycles, streaks and invitations")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to ./cohort.toml when present)
    #[arg(long, short, env = "COHORT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Open this week's cycle now
    Open,
    /// Close the open cycle and compile it
    Close,
    /// Compile a cycle left closed by an interrupted close
    Compile {
        /// Cycle identifier, `202405` or `2024-W05`
        cycle: CycleId,
    },
    /// Run the eligibility and invitation-expiry sweeps
    Sweep,
    /// Register a founding member
    Register {
        email: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Re-enable a member
    Activate { email: String },
    /// Stop a member from taking part without deleting them
    Deactivate { email: String },
    /// Accept an invitation on behalf of the invitee
    Accept {
        token: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Dispatch one parsed inbound message given as JSON
    Inbound { json: String },
    /// Delete submissions older than the newest N cycles
    Purge {
        /// Overrides `retention.keep_cycles`
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[derive(Serialize)]
struct SweepSummary {
    eligibility: SweepReport,
    invitations: ExpiryReport,
}

fn init_tracing(log: &LogSettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log.level))?;
    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Pretty => registry.with(fmt::layer().with_writer(std::io::stderr)).try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}

#[cfg(feature = "db-sqlite")]
async fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn Store>> {
    use secrecy::ExposeSecret;
    let store = SqliteStore::connect(settings.database_url.expose_secret())
        .await
        .context("failed to open the sqlite store")?;
    Ok(Arc::new(store))
}

#[cfg(all(feature = "store-memory", not(feature = "db-sqlite")))]
async fn open_store(_settings: &Settings) -> anyhow::Result<Arc<dyn Store>> {
    tracing::warn!("using the in-memory store; nothing survives this process");
    Ok(Arc::new(MemoryStore::new()))
}

fn emit<T: Serialize>(result: EngineResult<T>) -> anyhow::Result<ExitCode> {
    let outcome = Outcome::from(result);
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed.
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    init_tracing(&settings.log)?;

    let ports = Ports {
        store: open_store(&settings).await?,
        notifier: Arc::new(LogNotifier::new()),
        clock: Arc::new(SystemClock),
    };
    let engine = Engine::new(
        ports,
        EngineSettings {
            schedule: settings.cycle_schedule(),
            rules: settings.eligibility_rules(),
        },
    );

    match cli.command {
        Command::Run => {
            let config = SchedulerConfig {
                sweep_hour: settings.schedule.sweep_hour,
                tick: settings.tick(),
            };
            info!(timezone = %settings.schedule.timezone, "cohort scheduler starting");
            Scheduler::new(engine, config).run(shutdown_signal()).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Open => emit(engine.cycles.open_cycle().await),
        Command::Close => emit(engine.cycles.close_cycle().await),
        Command::Compile { cycle } => emit(engine.cycles.manual_compile(cycle).await),
        Command::Sweep => {
            let summary = async {
                EngineResult::Ok(SweepSummary {
                    eligibility: engine.invitations.sweep_eligibility().await?,
                    invitations: engine.invitations.sweep_expired_invitations().await?,
                })
            };
            emit(summary.await)
        }
        Command::Register { email, name } => emit(engine.members.register_member(&email, name).await),
        Command::Activate { email } => emit(engine.members.set_member_active(&email, true).await),
        Command::Deactivate { email } => emit(engine.members.set_member_active(&email, false).await),
        Command::Accept { token, name } => emit(
            engine
                .invitations
                .accept_invitation(&token, ProfileFields { display_name: name })
                .await,
        ),
        Command::Inbound { json } => {
            let command: InboundCommand =
                serde_json::from_str(&json).context("inbound message is not a valid command")?;
            emit(engine.handle_inbound(command).await)
        }
        Command::Purge { keep } => {
            let keep = keep.unwrap_or(settings.retention.keep_cycles);
            emit(engine.retention.purge_submissions(keep).await)
        }
    }
}

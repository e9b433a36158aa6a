//! eventship - ship spooled event files to a collector over mutual TLS
//!
//! Every `--interval` seconds the agent reads every file in `--eventsdir`,
//! POSTs them as one JSON array to `--eventsurl` and removes them once the
//! collector answers 200 or 201. The client identity comes from the device's
//! `sota.toml`, either PEM files or a PKCS#11 token.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use eventship_core::config::{DEFAULT_EVENTS_DIR, DEFAULT_INTERVAL_SECS, DEFAULT_SOTA_TOML};
use eventship_core::{
    AgentConfig, CollectorClient, CycleOutcome, LoggingConfig, SotaConfig, Spool, UnreadablePolicy,
    UploadCycle,
};

#[derive(Parser)]
#[command(name = "eventship")]
#[command(about = "Ship spooled event files to a collector over mutual TLS")]
#[command(version)]
struct Args {
    /// Seconds to sleep between upload cycles
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
    interval: u64,

    /// Directory producers drop event files into
    #[arg(long, default_value = DEFAULT_EVENTS_DIR)]
    eventsdir: PathBuf,

    /// Device configuration holding the TLS credential settings
    #[arg(long, default_value = DEFAULT_SOTA_TOML)]
    sotatoml: PathBuf,

    /// Collector endpoint events are POSTed to (required)
    #[arg(long, default_value = "")]
    eventsurl: String,

    /// Also delete files that could not be read once a batch is acknowledged
    #[arg(long)]
    delete_unreadable: bool,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write rotated log files here instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Run a single cycle without sleeping, then exit
    #[arg(long)]
    once: bool,
}

impl Args {
    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            events_dir: self.eventsdir.clone(),
            events_url: self.eventsurl.clone(),
            interval: Duration::from_secs(self.interval),
            sota_toml: self.sotatoml.clone(),
            unreadable: if self.delete_unreadable {
                UnreadablePolicy::Delete
            } else {
                UnreadablePolicy::Retain
            },
            logging: LoggingConfig {
                level: self.log_level.clone(),
                directory: self.log_dir.clone(),
                ..LoggingConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.agent_config();

    let _log_guard =
        eventship_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("eventship starting");

    config.validate().context("invalid configuration")?;

    let sota = SotaConfig::load_from(&config.sota_toml)
        .with_context(|| format!("failed to load {}", config.sota_toml.display()))?;
    let source = sota
        .credential_source()
        .context("invalid TLS configuration")?;

    tracing::info!(source = source.kind().as_str(), "Loading client credential");
    let credential = source
        .resolve()
        .context("failed to load client credential")?;

    let client = CollectorClient::new(credential, &config.events_url)
        .context("failed to create collector client")?;
    let mut cycle = UploadCycle::new(Spool::new(&config.events_dir), client, config.interval)
        .with_unreadable_policy(config.unreadable);

    if args.once {
        return run_once(&mut cycle).await;
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    cycle.run(&running).await;

    let stats = cycle.stats();
    tracing::info!(
        cycles = stats.cycles,
        events_sent = stats.events_sent,
        uploads_failed = stats.uploads_failed,
        files_deleted = stats.files_deleted,
        delete_failures = stats.delete_failures,
        read_failures = stats.read_failures,
        "eventship stopped"
    );
    Ok(())
}

async fn run_once(cycle: &mut UploadCycle) -> Result<()> {
    match cycle.run_once().await {
        CycleOutcome::Idle => {
            println!("No events to send");
            Ok(())
        }
        CycleOutcome::Uploaded {
            events,
            deleted,
            delete_failures,
        } => {
            println!("Sent {} event(s), deleted {} file(s)", events, deleted);
            if delete_failures > 0 {
                println!("  {} file(s) could not be deleted", delete_failures);
            }
            Ok(())
        }
        CycleOutcome::UploadFailed { events, error } => {
            bail!("upload of {} event(s) failed: {}", events, error)
        }
        CycleOutcome::CollectFailed(error) => Err(error).context("unable to find events"),
    }
}

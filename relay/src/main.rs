use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shardcast::assembly::FileAssembler;
use shardcast::fan::Fan;
use shardcast::jockey::{DrainOptions, Jockey};
use shardcast::orchestrator::Orchestrator;
use shardcast::partition::assignment_of;
use shardcast::storage::DirShardSource;
use shardcast::{Backoff, RelayConfig, RelayError, SlotBuffer};

/// Relays numbered shards from many fan processes to one jockey through a
/// small shared-memory slot buffer.
#[derive(clap::Parser)]
#[clap(version)]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shardcast.toml")]
    config: PathBuf,
    #[clap(long = "log-level", default_value = "info")]
    log_level: String,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start every fan and the jockey, then wait for them (default)
    Run,
    /// Deliver one group of shards; started by `run`
    Fan {
        #[clap(long)]
        id: u32,
        #[clap(long)]
        first: u32,
        #[clap(long)]
        count: u32,
    },
    /// Collect every shard and assemble the result; started by `run`
    Jockey,
}

fn main() {
    let opts: Opts = Opts::parse();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("shardcast={0},shardcast_relay={0}", opts.log_level).into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = dispatch(&opts) {
        error!("{}", e);
        process::exit(1);
    }
}

fn dispatch(opts: &Opts) -> Result<(), Box<dyn Error>> {
    let cfg: RelayConfig = confy::load_path(&opts.config)?;
    cfg.validate()?;
    match opts.command.as_ref().unwrap_or(&Command::Run) {
        Command::Run => run(cfg, opts),
        Command::Fan { id, first, count } => Ok(fan(&cfg, *id, *first, *count)?),
        Command::Jockey => Ok(jockey(&cfg)?),
    }
}

fn run(cfg: RelayConfig, opts: &Opts) -> Result<(), Box<dyn Error>> {
    info!(
        "relaying {} shards from {} fans through {} slots",
        cfg.run.shard_count, cfg.run.fan_count, cfg.shmem.slot_count
    );
    let program = env::current_exe()?;
    let summary = Orchestrator::new(cfg, &opts.config, program).run()?;
    if !summary.failed_fans.is_empty() {
        info!("fans {:?} failed after the jockey had every shard", summary.failed_fans);
    }
    info!("run finished, all shards received: {}", summary.all_received);
    Ok(())
}

fn fan(cfg: &RelayConfig, id: u32, first: u32, count: u32) -> Result<(), RelayError> {
    let end = first.checked_add(count).ok_or_else(|| {
        RelayError::Config(format!("fan {} was given {} shards starting at {}", id, count, first))
    })?;
    let group = first..end;
    let expected = assignment_of(id, cfg.run.shard_count, cfg.run.fan_count)?;
    if group != expected {
        return Err(RelayError::Config(format!(
            "fan {} was given shards {:?} but owns {:?}",
            id, group, expected
        )));
    }

    let buffer = SlotBuffer::open(&cfg.shmem)?;
    buffer.watch_signals()?;
    let source = DirShardSource::from_config(&cfg.storage);
    let mut fan = Fan::new(id, group);
    let report = fan.run(&source, &buffer, &Backoff::new(cfg.run.backoff()))?;
    info!(
        "fan {} finished: {} delivered, {} abandoned, {} probes",
        id,
        report.delivered.len(),
        report.abandoned.len(),
        report.attempts
    );
    Ok(())
}

fn jockey(cfg: &RelayConfig) -> Result<(), RelayError> {
    let buffer = SlotBuffer::open(&cfg.shmem)?;
    buffer.watch_signals()?;
    let mut jockey = Jockey::new(cfg.run.shard_count);
    let opts = DrainOptions {
        backoff: Backoff::new(cfg.run.backoff()),
        timeout: cfg.run.receive_timeout(),
    };
    jockey.drain(&buffer, &opts)?;
    if jockey.duplicates() > 0 {
        info!("{} duplicate shards were discarded", jockey.duplicates());
    }
    info!("*** SUCCESS! jockey has all {} shards ***", jockey.received());

    let assembler = FileAssembler::from_config(&cfg.assembly, &cfg.storage.extension);
    let output = jockey.assemble(&assembler, &cfg.assembly)?;
    info!("assembled {}", output.display());
    Ok(())
}

//! Run a cross-shard collator against simulated neighbors.
//!
//! The node persists its neighbor cursors in a partition of `storage_dir`. If it is stopped
//! (whether cleanly or not), it resumes from the last committed block when restarted.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release -- run --config node.yaml --cycles 100
//! cargo run --release -- inspect --storage-dir /tmp/xshard/1
//! ```

mod config;
mod pipeline;
mod simulation;

use clap::{value_parser, Arg, ArgAction, Command};
use commonware_runtime::{tokio, Clock, Metrics, Runner, Spawner, Storage};
use config::{Config, DEFAULT_PARTITION};
use pipeline::Builder;
use serde::Serialize;
use simulation::Simulation;
use std::{path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{error, info, warn};
use xshard_collator::{
    engine::{self, Engine, Outcome},
    mocks,
    store::{self, Store},
    types::{self, BlockNumber, CollatorState},
};

const RUN_CMD: &str = "run";
const INSPECT_CMD: &str = "inspect";

/// Errors that can occur while running the node.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid state: {0}")]
    State(#[from] types::Error),
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("engine error: {0}")]
    Engine(#[from] engine::Error),
    #[error("no snapshot found")]
    NotFound,
}

/// A committed snapshot, as printed by `inspect`.
#[derive(Serialize)]
struct Snapshot<'a> {
    height: BlockNumber,
    digest: String,
    #[serde(flatten)]
    state: &'a CollatorState,
}

/// Run the engine for `cycles` cycles (or until interrupted), returning the encoded metrics.
async fn run<E: Clock + Spawner + Storage + Metrics>(
    context: E,
    cfg: Config,
    cycles: Option<u64>,
) -> Result<String, Error> {
    let genesis = CollatorState::genesis(cfg.neighbors.iter().copied())?;
    let store = Store::init(
        context.with_label("store"),
        store::Config {
            partition: cfg.partition.clone(),
            retention: cfg.retention,
            pipeline_prefixes: vec![pipeline::BLOCK_PREFIX],
        },
        genesis,
    )
    .await?;
    info!(
        shard = cfg.shard,
        height = store.height(),
        neighbors = store.state().len(),
        "opened cursor store"
    );

    // Start simulated neighbors from the recovered cursors
    let simulation = Simulation::new(
        context.with_label("ledger"),
        cfg.simulation.clone(),
        store.state(),
    );
    let ledger = simulation.ledger();
    let traffic = context
        .with_label("simulation")
        .spawn(|_| simulation.run());

    let pipeline = Builder::new(
        cfg.shard,
        cfg.simulation.abort_probability,
        cfg.simulation.seed,
    );
    let membership = mocks::Membership::new(cfg.neighbors.iter().copied());
    let engine_cfg = engine::Config::from(&cfg.engine);
    let interval = engine_cfg.cycle_interval;
    let mut engine = Engine::new(
        context.with_label("engine"),
        engine_cfg,
        store,
        ledger,
        pipeline,
        membership,
    );

    let result = match cycles {
        Some(cycles) => {
            let mut result = Ok(());
            for _ in 0..cycles {
                match engine.cycle().await {
                    Ok(report) => {
                        if let Outcome::Aborted(reason) = &report.outcome {
                            warn!(%reason, "cycle aborted");
                        }
                        info!(
                            height = engine.store().height(),
                            messages = report.messages,
                            unavailable = ?report.unavailable,
                            unknown = ?report.unknown,
                            halted = ?report.halted,
                            "cycle complete"
                        );
                    }
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
                context.sleep(interval).await;
            }
            result
        }
        None => {
            engine
                .run(async {
                    if let Err(err) = ::tokio::signal::ctrl_c().await {
                        error!(?err, "failed to listen for interrupt");
                    }
                })
                .await
        }
    };
    traffic.abort();
    result?;
    engine.close().await?;

    Ok(context.encode())
}

/// Read the snapshot at `height` (or the latest) from `partition`.
async fn inspect<E: Clock + Storage + Metrics>(
    context: E,
    partition: &str,
    height: Option<BlockNumber>,
) -> Result<String, Error> {
    let (height, state) = store::read(context.with_label("inspect"), partition, height)
        .await?
        .ok_or(Error::NotFound)?;
    let snapshot = Snapshot {
        height,
        digest: commonware_utils::hex(&state.digest()),
        state: &state,
    };
    Ok(serde_json::to_string_pretty(&snapshot)?)
}

fn main() -> ExitCode {
    let matches = Command::new("xshard-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Run a cross-shard collator against simulated neighbors.")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Emit logs as JSON")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(RUN_CMD)
                .about("Produce blocks that consume simulated cross-shard messages.")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .required(true)
                        .help("Path to YAML config file")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("cycles")
                        .long("cycles")
                        .help("Number of cycles to run (runs until interrupted if omitted)")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new(INSPECT_CMD)
                .about("Print a committed collator state as JSON.")
                .arg(
                    Arg::new("storage-dir")
                        .long("storage-dir")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("partition")
                        .long("partition")
                        .default_value(DEFAULT_PARTITION),
                )
                .arg(
                    Arg::new("height")
                        .long("height")
                        .help("Local height to inspect (latest if omitted)")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand_required(true)
        .get_matches();

    // Create logger
    let level = if matches.get_flag("verbose") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    if matches.get_flag("json") {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    let result = match matches.subcommand() {
        Some((RUN_CMD, matches)) => {
            let Some(path) = matches.get_one::<PathBuf>("config") else {
                error!("missing config");
                return ExitCode::FAILURE;
            };
            let cycles = matches.get_one::<u64>("cycles").copied();
            match Config::load(path) {
                Ok(cfg) => {
                    let runtime_cfg =
                        tokio::Config::default().with_storage_directory(cfg.storage_dir.clone());
                    let executor = tokio::Runner::new(runtime_cfg);
                    executor.start(|context| run(context, cfg, cycles))
                }
                Err(err) => Err(err),
            }
        }
        Some((INSPECT_CMD, matches)) => {
            let Some(directory) = matches.get_one::<PathBuf>("storage-dir") else {
                error!("missing storage directory");
                return ExitCode::FAILURE;
            };
            let Some(partition) = matches.get_one::<String>("partition").cloned() else {
                error!("missing partition");
                return ExitCode::FAILURE;
            };
            let height = matches.get_one::<u64>("height").copied();
            let runtime_cfg = tokio::Config::default().with_storage_directory(directory.clone());
            let executor = tokio::Runner::new(runtime_cfg);
            executor.start(|context| async move { inspect(context, &partition, height).await })
        }
        _ => {
            error!("invalid subcommand");
            return ExitCode::FAILURE;
        }
    };
    match result {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "failed");
            ExitCode::FAILURE
        }
    }
}

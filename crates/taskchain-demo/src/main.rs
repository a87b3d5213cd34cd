// taskchain-demo: loads, rewards and saves a batch of fake players through a
// shared chain group on the threaded host, then reports how each chain ended.

mod player;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select, unbounded, Sender};
use player::{player_name, PlayerRecord, PlayerStore};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use taskchain::{ChainOutcome, ChainSettings, StepError, TaskChainFactory};
use taskchain_host::{init_tracing, ThreadedHost};

/// Shared group every player chain runs in.
const PLAYER_GROUP: &str = "player-saves";

/// Every fifth player has no record and its chain aborts.
const MISSING_EVERY: usize = 5;

/// Command-line arguments for the demo.
#[derive(Parser, Debug)]
#[command(name = "taskchain-demo", about = "Run player save chains on a threaded host")]
struct Args {
    /// JSON settings file (CallbackTimeoutTicks, TickMillis, BackgroundWorkers).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Number of player chains to submit.
    #[arg(long, default_value_t = 8)]
    players: usize,

    /// Emit logs as JSON.
    #[arg(long = "json-logs")]
    json_logs: bool,
}

#[derive(Debug, Default)]
struct Summary {
    completed: usize,
    aborted: usize,
    failed: usize,
    interrupted: bool,
}

impl Summary {
    fn record(&mut self, outcome: ChainOutcome) {
        match outcome {
            ChainOutcome::Completed => self.completed += 1,
            ChainOutcome::Aborted => self.aborted += 1,
            ChainOutcome::Failed => self.failed += 1,
        }
    }

    fn finished(&self) -> usize {
        self.completed + self.aborted + self.failed
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} aborted, {} failed",
            self.completed, self.aborted, self.failed
        )?;
        if self.interrupted {
            write!(f, " (interrupted)")?;
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.json_logs);

    match run(&args) {
        Ok(summary) => {
            println!("{}", summary);
            if summary.failed > 0 || summary.interrupted {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            tracing::error!("Demo failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<Summary> {
    let mut settings = match args.settings {
        Some(ref path) => ChainSettings::load(path)?,
        None => ChainSettings::default(),
    };
    settings.apply_env_overrides()?;

    let host = ThreadedHost::start(settings.clone())?;
    let factory = TaskChainFactory::with_settings(host.clone(), settings);
    let store = Arc::new(PlayerStore::seeded(args.players, MISSING_EVERY)?);

    let (cancel_tx, cancel_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = cancel_tx.try_send(());
    })
    .context("Failed to install the Ctrl-C handler")?;

    let (done_tx, done_rx) = unbounded();
    for index in 0..args.players {
        submit_player_chain(&factory, &store, player_name(index), done_tx.clone());
    }
    drop(done_tx);

    tracing::info!(
        players = args.players,
        records = store.len(),
        group = PLAYER_GROUP,
        "Submitted player chains"
    );

    let mut summary = Summary::default();
    while summary.finished() < args.players {
        select! {
            recv(done_rx) -> message => match message {
                Ok((name, outcome)) => {
                    tracing::info!(player = %name, %outcome, "Player chain finished");
                    summary.record(outcome);
                }
                Err(_) => break,
            },
            recv(cancel_rx) -> _ => {
                tracing::warn!(
                    pending = args.players - summary.finished(),
                    "Interrupted before every chain finished"
                );
                summary.interrupted = true;
                break;
            },
        }
    }

    host.shutdown();
    Ok(summary)
}

/// Load the player in the background, reward the login on the main thread,
/// wait a tick, then save in the background.
fn submit_player_chain(
    factory: &TaskChainFactory,
    store: &Arc<PlayerStore>,
    name: String,
    done: Sender<(String, ChainOutcome)>,
) {
    let (load_store, save_store) = (Arc::clone(store), Arc::clone(store));
    let load_name = name.clone();

    factory
        .new_shared_chain(PLAYER_GROUP)
        .background_first(move |_| load_store.load(&load_name).map_err(StepError::fault))
        .label("load")
        .abort_if_none()
        .main(|mut record: PlayerRecord, _| {
            record.reward_login();
            Ok(record)
        })
        .label("reward")
        .delay(1)
        .background_last(move |record, _| save_store.save(&record).map_err(StepError::fault))
        .label("save")
        .execute_with(
            move |outcome| {
                let _ = done.send((name, outcome));
            },
            |error, step| {
                tracing::error!(step = %step, "Player chain failed: {:#}", error);
            },
        );
}

//! Mineur PoW coopératif
//! Recherche de nonce, soumission à l'autorité et suivi des statistiques

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use hash_miner::authority::{display_value, HttpAuthority};
use hash_miner::config::Config;
use hash_miner::engine::{EngineState, LastOutcome, RunOutcome, SearchEngine};
use hash_miner::identity::{InitUser, User, UserId};
use hash_miner::ledger::{BalanceLedger, JsonFileStore};
use hash_miner::poller::StatsPoller;
use hash_miner::session::Session;

#[derive(Parser)]
#[command(name = "miner")]
#[command(about = "Cooperative PoW miner client", long_about = None)]
struct Cli {
    /// Fichier de configuration TOML
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// URL de l'autorité réseau
    #[arg(long, env = "MINER_AUTHORITY_URL")]
    authority: Option<String>,

    /// Timeout des requêtes (secondes)
    #[arg(long, env = "MINER_TIMEOUT_SECS")]
    timeout: Option<u64>,

    /// Période de rafraîchissement des statistiques (ms)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Nombre d'essais entre deux cessions du worker
    #[arg(long)]
    yield_every: Option<u64>,

    /// Fichier JSON des soldes
    #[arg(long, env = "MINER_STORE")]
    store: Option<PathBuf>,

    /// Objet utilisateur JSON, ex: {"id": 1, "first_name": "Ann"}
    #[arg(long, env = "MINER_USER")]
    user: Option<String>,

    /// Identifiant utilisateur (si --user absent)
    #[arg(long, env = "MINER_USER_ID")]
    user_id: Option<UserId>,

    /// Prénom affiché dans les blocs (si --user absent)
    #[arg(long, env = "MINER_FIRST_NAME")]
    first_name: Option<String>,

    /// Lance une recherche dès le démarrage
    #[arg(long)]
    start: bool,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(url) = &self.authority {
            config.authority_url = url.clone();
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        if let Some(interval) = self.poll_interval_ms {
            config.poll_interval_ms = interval;
        }
        if let Some(every) = self.yield_every {
            config.yield_every = every;
        }
        if let Some(store) = &self.store {
            config.store_path = store.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn identity(&self) -> Result<User> {
        let init = match &self.user {
            Some(raw) => InitUser::from_json(raw)?,
            None => InitUser {
                id: self.user_id,
                first_name: self.first_name.clone(),
            },
        };
        Ok(User::bootstrap(init)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    info!("🚀 Miner Starting...");
    info!("   Authority: {}", config.authority_url);

    let user = cli
        .identity()
        .context("Mining requires a user identity (--user or --user-id)")?;
    info!(
        "   User: {} ({})",
        user.id,
        user.display_name().unwrap_or(hash_miner::block::UNKNOWN_NAME)
    );

    let authority = Arc::new(
        HttpAuthority::new(&config.authority_url, config.request_timeout())
            .context("Failed to build HTTP client")?,
    );

    let ledger = Arc::new(BalanceLedger::new(JsonFileStore::new(&config.store_path)));
    match ledger.load(user.id).await {
        Ok(balance) => info!("   Balance: {}", balance),
        Err(e) => warn!("   Balance unavailable: {}", e),
    }

    let (poller, stats) = StatsPoller::new(authority.clone(), config.poll_interval());
    let poller_handle = tokio::spawn(poller.run());

    let session = Session::new(user, stats);
    let engine = SearchEngine::new(authority, ledger.clone(), config.yield_every);

    print_help();
    if cli.start {
        start_mining(&engine, &session);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "start" | "s" => start_mining(&engine, &session),
            "cancel" | "c" => engine.cancel(),
            "status" | "" => print_status(&engine, &session, &ledger),
            "help" | "h" => print_help(),
            "quit" | "q" => break,
            other => warn!("Unknown command: {}", other),
        }
    }

    info!("👋 Shutting down");
    engine.cancel();
    poller_handle.abort();
    Ok(())
}

type Engine = SearchEngine<HttpAuthority, JsonFileStore>;

fn start_mining(engine: &Engine, session: &Session) {
    match engine.start(session) {
        Ok(handle) => {
            tokio::spawn(watch_run(handle));
        }
        Err(e) => warn!("⚠️  {}", e),
    }
}

async fn watch_run(handle: JoinHandle<RunOutcome>) {
    match handle.await {
        Ok(RunOutcome::Mined { record, balance }) => {
            info!("✓ Block #{} mined, reward {}, balance {}", record.block_id, record.reward, balance)
        }
        Ok(RunOutcome::SubmitFailed { record, .. }) => {
            warn!("Block #{} discarded, start again to retry", record.block_id)
        }
        Ok(RunOutcome::LedgerFailed { record, .. }) => {
            error!("Block #{} is on the network but not in the local balance", record.block_id)
        }
        Ok(RunOutcome::Cancelled { attempts }) => info!("Stopped, {} hashes so far", attempts),
        Err(e) => error!("Mining task failed: {}", e),
    }
}

fn print_help() {
    println!("Commands: start (s), cancel (c), status (Enter), help (h), quit (q)");
}

fn print_status(engine: &Engine, session: &Session, ledger: &BalanceLedger<JsonFileStore>) {
    let stats = session.stats();
    let snapshot = engine.snapshot();

    let balance = ledger
        .last_known()
        .map(|b| b.to_string())
        .unwrap_or_else(|| "-".to_string());
    let status = match snapshot.state {
        EngineState::Idle => "Idle",
        EngineState::Searching => "Mining in progress...",
        EngineState::Found => "Submitting block...",
        EngineState::Error => "Error",
    };

    println!("User ID      {}", session.user().id);
    println!("Balance      {}", balance);
    println!("Block        #{}", stats.block_count);
    println!("Difficulty   {}", stats.difficulty);
    println!("Status       {}", status);
    println!("Hashes       {}", snapshot.attempts);
    println!("Mined        {}", snapshot.blocks_submitted);
    if let Some(last) = &snapshot.last_outcome {
        println!("Last run     {}", describe(last));
    }

    println!("Latest blocks");
    if stats.latest_blocks.is_empty() {
        println!("  No blocks mined yet.");
    }
    for block in &stats.latest_blocks {
        let timestamp = display_value(&block.timestamp);
        println!("  Block {}: {}", display_value(&block.id), format_timestamp(&timestamp));
        println!("    {}", display_value(&block.hash));
    }
}

fn describe(outcome: &LastOutcome) -> String {
    match outcome {
        LastOutcome::Mined { block_id, reward, balance } => {
            format!("mined #{} (+{}, balance {})", block_id, reward, balance)
        }
        LastOutcome::SubmitFailed(e) => format!("submission failed: {}", e),
        LastOutcome::LedgerFailed(e) => format!("balance update failed: {}", e),
        LastOutcome::Cancelled => "cancelled".to_string(),
    }
}

/// `dd.mm.yyyy HH:MM:SS` en heure locale; texte brut si illisible
fn format_timestamp(timestamp: &str) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(ts) => ts.with_timezone(&Local).format("%d.%m.%Y %H:%M:%S").to_string(),
        Err(_) => timestamp.to_string(),
    }
}

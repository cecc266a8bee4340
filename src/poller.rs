//! Rafraîchissement périodique des statistiques réseau

use chrono::{DateTime, FixedOffset};
use futures::future::join3;
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::authority::{Authority, BlockSummary, FetchError};

/// Dernières statistiques connues de l'autorité
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub block_count: u64,
    pub difficulty: u32,
    /// Triés par timestamp décroissant
    pub latest_blocks: Vec<BlockSummary>,
}

/// Trie les blocs du plus récent au plus ancien
///
/// Les timestamps illisibles passent en fin de liste. À timestamp égal, l'ordre
/// reçu est conservé, mais l'autorité ne garantit pas cet ordre: ne pas s'y fier.
pub fn sort_latest_blocks(blocks: &mut [BlockSummary]) {
    fn key(block: &BlockSummary) -> Option<DateTime<FixedOffset>> {
        block
            .timestamp_str()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    }
    blocks.sort_by(|a, b| key(b).cmp(&key(a)));
}

/// Interroge l'autorité à période fixe et publie les statistiques
///
/// Les trois endpoints sont indépendants: un échec conserve la dernière valeur
/// connue de cet endpoint sans bloquer les deux autres.
pub struct StatsPoller<A> {
    authority: Arc<A>,
    period: Duration,
    tx: watch::Sender<NetworkStats>,
}

impl<A: Authority> StatsPoller<A> {
    pub fn new(authority: Arc<A>, period: Duration) -> (Self, watch::Receiver<NetworkStats>) {
        let (tx, rx) = watch::channel(NetworkStats::default());
        (Self { authority, period, tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStats> {
        self.tx.subscribe()
    }

    async fn refresh_block_count(&self) -> Option<FetchError> {
        match self.authority.block_count().await {
            Ok(block_count) => {
                self.tx.send_modify(|stats| stats.block_count = block_count);
                None
            }
            Err(e) => Some(e),
        }
    }

    async fn refresh_difficulty(&self) -> Option<FetchError> {
        match self.authority.difficulty().await {
            Ok(difficulty) => {
                self.tx.send_modify(|stats| stats.difficulty = difficulty);
                None
            }
            Err(e) => Some(e),
        }
    }

    async fn refresh_latest_blocks(&self) -> Option<FetchError> {
        match self.authority.latest_blocks().await {
            Ok(mut blocks) => {
                sort_latest_blocks(&mut blocks);
                self.tx.send_modify(|stats| stats.latest_blocks = blocks);
                None
            }
            Err(e) => Some(e),
        }
    }

    /// Un tick: lit les trois endpoints en parallèle; retourne les échecs
    pub async fn poll_once(&self) -> Vec<FetchError> {
        let (count, difficulty, latest) = join3(
            self.refresh_block_count(),
            self.refresh_difficulty(),
            self.refresh_latest_blocks(),
        )
        .await;
        let failures: Vec<FetchError> = [count, difficulty, latest].into_iter().flatten().collect();

        for failure in &failures {
            warn!("⚠️  Stats fetch failed: {}", failure);
        }

        {
            let stats = self.tx.borrow();
            debug!(
                "Stats: blocks={} difficulty={} latest={}",
                stats.block_count,
                stats.difficulty,
                stats.latest_blocks.len()
            );
        }

        failures
    }

    /// Boucle infinie; arrêtée en annulant la tâche
    ///
    /// Chaque endpoint a son propre intervalle: une requête lente ne retarde que
    /// les ticks de son endpoint.
    pub async fn run(self) {
        let this = &self;
        join3(
            every(this.period, move || this.refresh_block_count()),
            every(this.period, move || this.refresh_difficulty()),
            every(this.period, move || this.refresh_latest_blocks()),
        )
        .await;
    }
}

async fn every<F, Fut>(period: Duration, mut refresh: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<FetchError>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Some(failure) = refresh().await {
            warn!("⚠️  Stats fetch failed: {}", failure);
        }
    }
}

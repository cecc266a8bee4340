//! Moteur de recherche de nonce
//!
//! Un seul worker par moteur: la boucle incrémente le nonce, hashe le bloc
//! composé et compare au préfixe cible. Tous les `yield_every` essais, elle
//! vérifie l'annulation puis rend la main au scheduler tokio.

use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::authority::{Authority, SubmitError};
use crate::block::{self, BlockRecord, Clock, SystemClock, PREVIOUS_HASH_PLACEHOLDER};
use crate::identity::User;
use crate::ledger::{BalanceLedger, BalanceStore, LedgerError};
use crate::pow;
use crate::reward::{self, Amount};
use crate::session::Session;

/// Cadence par défaut de la cession du worker
pub const DEFAULT_YIELD_EVERY: u64 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("a search is already running")]
    AlreadySearching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Searching,
    Found,
    Error,
}

/// Paramètres figés au lancement d'une recherche
#[derive(Debug, Clone)]
pub struct SearchJob {
    pub user: User,
    pub difficulty: u32,
    /// Nombre de blocs connu au lancement
    pub block_count: u64,
    pub payload: String,
}

/// Nonce gagnant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub nonce: u64,
    pub hash: String,
    pub timestamp: String,
}

/// Compteurs du worker
///
/// `attempts` n'est jamais remis à zéro: il s'accumule d'une recherche à l'autre
/// et sert de base à la récompense.
#[derive(Debug, Default)]
pub struct SearchControl {
    nonce: AtomicU64,
    attempts: AtomicU64,
    cancelled: AtomicBool,
}

impl SearchControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce.load(Ordering::Relaxed)
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn clear_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Cherche le premier nonce dont le hash commence par `target(difficulty)`
///
/// Le nonce démarre à 1 et avance d'une unité par essai; à `u64::MAX` il repart
/// à 0 (le rebouclage est journalisé). Retourne `None` si annulé.
pub async fn search<C: Clock>(
    difficulty: u32,
    payload: &str,
    clock: &C,
    control: &SearchControl,
    yield_every: u64,
) -> Option<Solution> {
    let target = pow::target(difficulty);
    let yield_every = yield_every.max(1);
    let mut nonce: u64 = 0;

    control.nonce.store(0, Ordering::Relaxed);

    loop {
        let (next, wrapped) = nonce.overflowing_add(1);
        if wrapped {
            warn!("Nonce space exhausted, wrapping to 0");
        }
        nonce = next;
        control.nonce.store(nonce, Ordering::Relaxed);
        control.attempts.fetch_add(1, Ordering::Relaxed);

        let timestamp = clock.now();
        let hash = pow::digest(&block::compose(nonce, payload, &timestamp, PREVIOUS_HASH_PLACEHOLDER));

        if pow::meets_target(&hash, &target) {
            return Some(Solution {
                nonce,
                hash,
                timestamp,
            });
        }

        if nonce % yield_every == 0 {
            if control.is_cancelled() {
                return None;
            }
            tokio::task::yield_now().await;
        }
    }
}

/// Résultat d'une recherche complète
#[derive(Debug)]
pub enum RunOutcome {
    /// Bloc accepté et solde crédité
    Mined { record: BlockRecord, balance: Amount },
    /// Bloc refusé ou non transmis: il est abandonné, solde inchangé
    SubmitFailed { record: BlockRecord, error: SubmitError },
    /// Bloc accepté mais solde non écrit: le ledger diverge de l'autorité
    LedgerFailed { record: BlockRecord, error: LedgerError },
    Cancelled { attempts: u64 },
}

/// Résumé du dernier résultat, pour l'affichage
#[derive(Debug, Clone, PartialEq)]
pub enum LastOutcome {
    Mined { block_id: u64, reward: Amount, balance: Amount },
    SubmitFailed(String),
    LedgerFailed(String),
    Cancelled,
}

impl From<&RunOutcome> for LastOutcome {
    fn from(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Mined { record, balance } => LastOutcome::Mined {
                block_id: record.block_id,
                reward: record.reward,
                balance: *balance,
            },
            RunOutcome::SubmitFailed { error, .. } => LastOutcome::SubmitFailed(error.to_string()),
            RunOutcome::LedgerFailed { error, .. } => LastOutcome::LedgerFailed(error.to_string()),
            RunOutcome::Cancelled { .. } => LastOutcome::Cancelled,
        }
    }
}

/// Vue de l'état du moteur pour l'affichage
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub nonce: u64,
    pub attempts: u64,
    pub blocks_submitted: u64,
    pub last_outcome: Option<LastOutcome>,
}

struct EngineInner<A, S, C> {
    authority: Arc<A>,
    ledger: Arc<BalanceLedger<S>>,
    clock: C,
    yield_every: u64,
    control: SearchControl,
    state: Mutex<EngineState>,
    blocks_submitted: AtomicU64,
    last_outcome: Mutex<Option<LastOutcome>>,
}

/// Remet le moteur en `Idle` en fin de tâche, même si elle panique
struct IdleOnDrop<'a>(&'a Mutex<EngineState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = EngineState::Idle;
    }
}

/// Moteur de minage: au plus une recherche à la fois
pub struct SearchEngine<A, S, C = SystemClock> {
    inner: Arc<EngineInner<A, S, C>>,
}

impl<A, S, C> Clone for SearchEngine<A, S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Authority, S: BalanceStore> SearchEngine<A, S, SystemClock> {
    pub fn new(authority: Arc<A>, ledger: Arc<BalanceLedger<S>>, yield_every: u64) -> Self {
        Self::with_clock(authority, ledger, SystemClock, yield_every)
    }
}

impl<A: Authority, S: BalanceStore, C: Clock> SearchEngine<A, S, C> {
    pub fn with_clock(
        authority: Arc<A>,
        ledger: Arc<BalanceLedger<S>>,
        clock: C,
        yield_every: u64,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                authority,
                ledger,
                clock,
                yield_every: yield_every.max(1),
                control: SearchControl::new(),
                state: Mutex::new(EngineState::Idle),
                blocks_submitted: AtomicU64::new(0),
                last_outcome: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state(),
            nonce: self.inner.control.nonce(),
            attempts: self.inner.control.attempts(),
            blocks_submitted: self.inner.blocks_submitted.load(Ordering::Relaxed),
            last_outcome: self
                .inner
                .last_outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Lance une recherche avec les statistiques courantes de la session
    pub fn start(&self, session: &Session) -> Result<JoinHandle<RunOutcome>, EngineError> {
        self.start_job(session.job())
    }

    /// Lance une recherche; refusée si une autre est en cours
    pub fn start_job(&self, job: SearchJob) -> Result<JoinHandle<RunOutcome>, EngineError> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != EngineState::Idle {
                return Err(EngineError::AlreadySearching);
            }
            *state = EngineState::Searching;
            self.inner.control.clear_cancel();
        }

        if !pow::is_reachable(job.difficulty) {
            warn!(
                "Difficulty {} exceeds the {}-character digest, search cannot succeed",
                job.difficulty,
                pow::DIGEST_HEX_LEN
            );
        }

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move { inner.run(job).await }))
    }

    /// Demande l'arrêt de la recherche en cours (pris en compte à la prochaine cession)
    ///
    /// Le drapeau est posé sous le verrou d'état, comme `start_job` l'efface: une
    /// annulation visant une recherche déjà terminée ne touche pas la suivante.
    pub fn cancel(&self) {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == EngineState::Searching {
            self.inner.control.cancel();
        }
    }
}

impl<A: Authority, S: BalanceStore, C: Clock> EngineInner<A, S, C> {
    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn run(self: Arc<Self>, job: SearchJob) -> RunOutcome {
        let _idle = IdleOnDrop(&self.state);

        info!(
            "⛏️  Mining block #{} at difficulty {}",
            job.block_count.saturating_add(1),
            job.difficulty
        );

        let outcome = self.mine(&job).await;
        *self.last_outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some((&outcome).into());
        outcome
    }

    async fn mine(&self, job: &SearchJob) -> RunOutcome {
        let solution = match search(
            job.difficulty,
            &job.payload,
            &self.clock,
            &self.control,
            self.yield_every,
        )
        .await
        {
            Some(solution) => solution,
            None => {
                let attempts = self.control.attempts();
                info!("⏹  Search cancelled after nonce {}", self.control.nonce());
                return RunOutcome::Cancelled { attempts };
            }
        };

        self.set_state(EngineState::Found);

        let attempts = self.control.attempts();
        let reward = reward::reward(attempts);
        let record = BlockRecord::new(
            job.block_count,
            &job.user,
            solution.hash,
            job.difficulty,
            reward,
            solution.timestamp,
            job.payload.clone(),
        );

        info!("✓ Nonce found: {}", solution.nonce);
        info!("  Hash: {}", record.hash);
        info!("  Attempts: {}", attempts);
        info!("  Reward: {}", reward);

        if let Err(error) = self.authority.submit(&record).await {
            self.set_state(EngineState::Error);
            error!("✗ Block #{} not accepted: {}", record.block_id, error);
            return RunOutcome::SubmitFailed { record, error };
        }

        self.blocks_submitted.fetch_add(1, Ordering::Relaxed);

        match self.ledger.apply(job.user.id, reward).await {
            Ok(balance) => {
                info!("💰 Block #{} accepted, balance: {}", record.block_id, balance);
                RunOutcome::Mined { record, balance }
            }
            Err(error) => {
                self.set_state(EngineState::Error);
                error!(
                    "✗ Block #{} accepted by authority but balance update failed: {}",
                    record.block_id, error
                );
                RunOutcome::LedgerFailed { record, error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::mock::MockAuthority;
    use crate::block::FixedClock;
    use crate::ledger::mock::CountingStore;

    const TS: &str = "2024-01-01T00:00:00.000Z";

    type TestEngine = SearchEngine<MockAuthority, CountingStore, FixedClock>;

    fn user() -> User {
        User::new(77, Some("Ann".to_string()))
    }

    fn job(difficulty: u32) -> SearchJob {
        SearchJob {
            user: user(),
            difficulty,
            block_count: 9,
            payload: block::payload(Some("Ann")),
        }
    }

    fn engine() -> (TestEngine, Arc<MockAuthority>, Arc<BalanceLedger<CountingStore>>) {
        let authority = Arc::new(MockAuthority::default());
        let ledger = Arc::new(BalanceLedger::new(CountingStore::default()));
        let engine = SearchEngine::with_clock(
            authority.clone(),
            ledger.clone(),
            FixedClock(TS.to_string()),
            DEFAULT_YIELD_EVERY,
        );
        (engine, authority, ledger)
    }

    /// Premier nonce valide, calculé indépendamment de la boucle
    fn first_valid_nonce(difficulty: u32, payload: &str) -> u64 {
        let target = pow::target(difficulty);
        (1..)
            .find(|nonce| {
                pow::digest(&block::compose(*nonce, payload, TS, PREVIOUS_HASH_PLACEHOLDER))
                    .starts_with(&target)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_search_finds_first_valid_nonce() {
        let payload = block::payload(Some("Ann"));
        let clock = FixedClock(TS.to_string());

        for difficulty in 1..=2 {
            let control = SearchControl::new();
            let solution = search(difficulty, &payload, &clock, &control, 100).await.unwrap();

            assert_eq!(solution.nonce, first_valid_nonce(difficulty, &payload));
            assert_eq!(control.attempts(), solution.nonce);
            assert!(pow::leading_zeros(&solution.hash) >= difficulty as usize);
            assert_eq!(
                solution.hash,
                pow::digest(&block::compose(solution.nonce, &payload, TS, PREVIOUS_HASH_PLACEHOLDER))
            );
        }
    }

    #[tokio::test]
    async fn test_search_with_system_clock_has_no_false_positive() {
        let control = SearchControl::new();
        let solution = search(2, "payload", &SystemClock, &control, 100).await.unwrap();
        assert!(solution.hash.starts_with("00"));
        assert_eq!(
            solution.hash,
            pow::digest(&block::compose(solution.nonce, "payload", &solution.timestamp, "0"))
        );
    }

    #[tokio::test]
    async fn test_difficulty_zero_matches_immediately() {
        let control = SearchControl::new();
        let solution = search(0, "payload", &SystemClock, &control, 100).await.unwrap();
        assert_eq!(solution.nonce, 1);
        assert_eq!(control.attempts(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_search_returns_none() {
        let control = SearchControl::new();
        let search_fut = search(64, "payload", &SystemClock, &control, 10);
        let cancel_fut = async {
            tokio::task::yield_now().await;
            control.cancel();
        };
        let (solution, ()) = tokio::join!(search_fut, cancel_fut);
        assert!(solution.is_none());
        assert_eq!(control.nonce() % 10, 0);
    }

    #[tokio::test]
    async fn test_end_to_end_mined_block() {
        let (engine, authority, ledger) = engine();
        ledger.load(77).await.unwrap();
        let writes_before = ledger.store().writes();

        let outcome = engine.start_job(job(1)).unwrap().await.unwrap();

        let (record, balance) = match outcome {
            RunOutcome::Mined { record, balance } => (record, balance),
            other => panic!("unexpected outcome: {:?}", other),
        };

        let attempts = engine.snapshot().attempts;
        assert_eq!(attempts, first_valid_nonce(1, &job(1).payload));
        assert_eq!(record.reward, reward::reward(attempts));
        assert_eq!(record.block_id, 10);
        assert_eq!(record.user_id, 77);
        assert_eq!(record.difficulty, 1);
        assert_eq!(record.timestamp, TS);
        assert!(record.hash.starts_with('0'));
        assert_eq!(balance, record.reward);

        // Ledger applied exactly once with delta = reward
        assert_eq!(ledger.store().writes(), writes_before + 1);
        assert_eq!(authority.submissions(), vec![record]);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, EngineState::Idle);
        assert_eq!(snapshot.blocks_submitted, 1);
        assert!(matches!(snapshot.last_outcome, Some(LastOutcome::Mined { block_id: 10, .. })));
    }

    #[tokio::test]
    async fn test_reward_uses_accumulated_attempts() {
        let (engine, _authority, ledger) = engine();
        // Attempts carried over from earlier runs count toward the next reward
        engine.inner.control.attempts.store(199_990, Ordering::Relaxed);

        let outcome = engine.start_job(job(1)).unwrap().await.unwrap();
        let record = match outcome {
            RunOutcome::Mined { record, .. } => record,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let attempts = 199_990 + first_valid_nonce(1, &job(1).payload);
        assert_eq!(record.reward, reward::reward(attempts));
        assert_eq!(record.reward, Amount::from_tenths(10));
        assert_eq!(ledger.last_known(), Some(Amount::from_tenths(10)));
    }

    #[tokio::test]
    async fn test_attempts_accumulate_across_runs() {
        let (engine, _authority, _ledger) = engine();

        engine.start_job(job(1)).unwrap().await.unwrap();
        let first = engine.snapshot().attempts;
        engine.start_job(job(1)).unwrap().await.unwrap();
        let second = engine.snapshot().attempts;

        // Same clock and payload: the second run finds the same nonce again
        assert_eq!(second, first * 2);
        assert_eq!(engine.snapshot().nonce, first);
    }

    #[tokio::test]
    async fn test_rejected_submission_leaves_balance_unchanged() {
        let (engine, authority, ledger) = engine();
        ledger.load(77).await.unwrap();
        let writes_before = ledger.store().writes();
        *authority.reject_status.lock().unwrap() = Some(409);

        let outcome = engine.start_job(job(1)).unwrap().await.unwrap();
        match outcome {
            RunOutcome::SubmitFailed { error, .. } => {
                assert!(matches!(error, SubmitError::Rejected { status: 409, .. }))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(ledger.store().writes(), writes_before);
        assert_eq!(ledger.load(77).await.unwrap(), Amount::ZERO);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, EngineState::Idle);
        assert_eq!(snapshot.blocks_submitted, 0);
        assert!(matches!(snapshot.last_outcome, Some(LastOutcome::SubmitFailed(_))));
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_balance_unchanged() {
        let (engine, authority, ledger) = engine();
        authority.transport_down.store(true, Ordering::SeqCst);

        let outcome = engine.start_job(job(1)).unwrap().await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::SubmitFailed { error: SubmitError::Transport(_), .. }
        ));
        assert_eq!(ledger.store().writes(), 0);
        assert!(authority.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_failure_is_reported_separately() {
        let (engine, authority, ledger) = engine();
        ledger.store().fail_writes.store(true, Ordering::SeqCst);

        let outcome = engine.start_job(job(1)).unwrap().await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::LedgerFailed { error: LedgerError::Write(_), .. }
        ));
        assert_eq!(authority.submissions().len(), 1);
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.snapshot().blocks_submitted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_start_is_rejected() {
        let (engine, authority, _ledger) = engine();

        let handle = engine.start_job(job(64)).unwrap();
        assert_eq!(engine.state(), EngineState::Searching);

        assert_eq!(engine.start_job(job(1)).unwrap_err(), EngineError::AlreadySearching);
        assert_eq!(engine.state(), EngineState::Searching);

        engine.cancel();
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
        assert!(authority.submissions().is_empty());

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, EngineState::Idle);
        assert_eq!(snapshot.last_outcome, Some(LastOutcome::Cancelled));

        // Idle again: a new search is accepted
        let outcome = engine.start_job(job(0)).unwrap().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Mined { .. }));
    }

    #[tokio::test]
    async fn test_cancel_after_finished_run_does_not_reach_next_run() {
        let (engine, _authority, _ledger) = engine();

        engine.start_job(job(0)).unwrap().await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);

        engine.cancel();
        assert!(!engine.inner.control.is_cancelled());

        let outcome = engine.start_job(job(1)).unwrap().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Mined { .. }));
    }

    #[tokio::test]
    async fn test_cancel_flag_set_only_while_searching() {
        let (engine, _authority, _ledger) = engine();

        let handle = engine.start_job(job(64)).unwrap();
        engine.cancel();
        assert!(engine.inner.control.is_cancelled());
        assert!(matches!(handle.await.unwrap(), RunOutcome::Cancelled { .. }));

        // A new start clears the flag left by the previous cancel
        engine.start_job(job(0)).unwrap().await.unwrap();
        assert!(!engine.inner.control.is_cancelled());
    }

    #[tokio::test]
    async fn test_huge_difficulty_searches_until_cancelled() {
        let control = SearchControl::new();
        let search_fut = search(u32::MAX, "payload", &SystemClock, &control, 10);
        let cancel_fut = async {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            control.cancel();
        };
        let (solution, ()) = tokio::join!(search_fut, cancel_fut);
        assert!(solution.is_none());
        assert!(control.attempts() >= 30);
    }

    #[tokio::test]
    async fn test_engine_survives_huge_difficulty() {
        let (engine, authority, _ledger) = engine();

        let handle = engine.start_job(job(u32::MAX)).unwrap();
        tokio::task::yield_now().await;
        engine.cancel();

        assert!(matches!(handle.await.unwrap(), RunOutcome::Cancelled { .. }));
        assert!(authority.submissions().is_empty());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_start_from_session_snapshots_difficulty() {
        let (engine, authority, _ledger) = engine();
        let (tx, rx) = tokio::sync::watch::channel(crate::poller::NetworkStats {
            block_count: 4,
            difficulty: 1,
            latest_blocks: Vec::new(),
        });
        let session = Session::new(user(), rx);

        let handle = engine.start(&session).unwrap();
        // Difficulty change after start does not affect the running search
        tx.send_modify(|stats| stats.difficulty = 64);
        let outcome = handle.await.unwrap();

        assert!(matches!(outcome, RunOutcome::Mined { .. }));
        let submitted = authority.submissions();
        assert_eq!(submitted[0].difficulty, 1);
        assert_eq!(submitted[0].block_id, 5);
    }
}

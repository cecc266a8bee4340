//! Solde de l'utilisateur: stockage clé/document et application des récompenses

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::identity::UserId;
use crate::reward::Amount;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store document is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read balance: {0}")]
    Read(#[source] StoreError),

    /// Le bloc peut déjà être accepté par l'autorité: état divergent
    #[error("failed to write balance: {0}")]
    Write(#[source] StoreError),

    #[error("balance overflow")]
    Overflow,
}

/// Document stocké par utilisateur
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceDoc {
    #[serde(default)]
    pub balance: Amount,
}

/// Stockage externe des soldes, indexé par identifiant utilisateur
pub trait BalanceStore: Send + Sync + 'static {
    fn get(&self, user_id: UserId) -> impl Future<Output = Result<Option<BalanceDoc>, StoreError>> + Send;

    fn put(&self, user_id: UserId, doc: BalanceDoc) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<UserId, BalanceDoc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BalanceStore for MemoryStore {
    async fn get(&self, user_id: UserId) -> Result<Option<BalanceDoc>, StoreError> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(&user_id).cloned())
    }

    async fn put(&self, user_id: UserId, doc: BalanceDoc) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.insert(user_id, doc);
        Ok(())
    }
}

// ============================================================================
// JSON FILE STORE
// ============================================================================

/// Collection de documents dans un fichier JSON: `{"<user id>": {"balance": 1.5}}`
pub struct JsonFileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, BalanceDoc>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, docs: &BTreeMap<String, BalanceDoc>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(docs)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl BalanceStore for JsonFileStore {
    async fn get(&self, user_id: UserId) -> Result<Option<BalanceDoc>, StoreError> {
        let _guard = self.lock.lock().await;
        let docs = self.read_all().await?;
        Ok(docs.get(&user_id.to_string()).cloned())
    }

    async fn put(&self, user_id: UserId, doc: BalanceDoc) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut docs = self.read_all().await?;
        docs.insert(user_id.to_string(), doc);
        self.write_all(&docs).await
    }
}

// ============================================================================
// LEDGER
// ============================================================================

/// Lecture et crédit du solde
///
/// Lecture-modification-écriture sans verrou côté stockage: le dernier écrivain
/// gagne, ce qui suppose une seule session active par utilisateur.
pub struct BalanceLedger<S> {
    store: S,
    last_known: Mutex<Option<Amount>>,
}

impl<S: BalanceStore> BalanceLedger<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            last_known: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Dernier solde lu ou écrit par ce ledger
    pub fn last_known(&self) -> Option<Amount> {
        *self.last_known.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, balance: Amount) {
        *self.last_known.lock().unwrap_or_else(PoisonError::into_inner) = Some(balance);
    }

    /// Lit le solde; crée un document à zéro s'il n'existe pas
    pub async fn load(&self, user_id: UserId) -> Result<Amount, LedgerError> {
        let balance = match self.store.get(user_id).await.map_err(LedgerError::Read)? {
            Some(doc) => doc.balance,
            None => {
                info!("📒 Creating balance record for user {}", user_id);
                self.store
                    .put(user_id, BalanceDoc::default())
                    .await
                    .map_err(LedgerError::Write)?;
                Amount::ZERO
            }
        };
        self.remember(balance);
        Ok(balance)
    }

    /// Ajoute `delta` au solde courant et retourne le nouveau solde
    pub async fn apply(&self, user_id: UserId, delta: Amount) -> Result<Amount, LedgerError> {
        let current = self
            .store
            .get(user_id)
            .await
            .map_err(LedgerError::Read)?
            .map(|doc| doc.balance)
            .unwrap_or_default();

        let balance = current.checked_add(delta).ok_or(LedgerError::Overflow)?;
        self.store
            .put(user_id, BalanceDoc { balance })
            .await
            .map_err(LedgerError::Write)?;

        debug!("Balance for user {}: {} + {} = {}", user_id, current, delta, balance);
        self.remember(balance);
        Ok(balance)
    }
}

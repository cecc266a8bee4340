//! Client de l'autorité réseau: statistiques et soumission des blocs

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::block::BlockRecord;

pub const MINE_PATH: &str = "/mine";
pub const BLOCKS_COUNT_PATH: &str = "/blocks-count";
pub const DIFFICULTY_PATH: &str = "/difficulty";
pub const LATEST_BLOCKS_PATH: &str = "/latest-blocks";

/// Échec de la lecture d'un endpoint de statistiques
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{endpoint}: transport failure: {message}")]
    Transport { endpoint: &'static str, message: String },

    #[error("{endpoint}: HTTP status {status}")]
    Status { endpoint: &'static str, status: u16 },

    #[error("{endpoint}: invalid response: {message}")]
    Decode { endpoint: &'static str, message: String },
}

/// Échec de la soumission d'un bloc
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    /// Pas de réponse (connexion, timeout)
    #[error("transport failure: {0}")]
    Transport(String),

    /// Réponse non 2xx
    #[error("rejected by authority (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Accusé de réception d'un bloc accepté
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: u16,
    pub body: String,
}

/// Résumé d'un bloc récent renvoyé par l'autorité
///
/// Champs d'affichage uniquement: ils sont gardés tels quels (`null`, nombre...)
/// pour qu'une entrée mal formée ne fasse pas rejeter toute la liste.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSummary {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub hash: serde_json::Value,
    #[serde(default)]
    pub timestamp: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BlockSummary {
    /// Timestamp s'il est transmis sous forme de texte
    pub fn timestamp_str(&self) -> Option<&str> {
        self.timestamp.as_str()
    }
}

/// Texte affichable d'une valeur JSON: chaîne sans guillemets, vide pour `null`
pub fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockCountResponse {
    #[serde(default)]
    block_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DifficultyResponse {
    #[serde(default)]
    difficulty: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestBlocksResponse {
    #[serde(default)]
    latest_blocks: Option<Vec<BlockSummary>>,
}

/// Autorité réseau vue comme une boîte noire requête/réponse
///
/// Chaque appel est indépendant; aucun n'est réessayé ici.
pub trait Authority: Send + Sync + 'static {
    fn block_count(&self) -> impl Future<Output = Result<u64, FetchError>> + Send;

    fn difficulty(&self) -> impl Future<Output = Result<u32, FetchError>> + Send;

    fn latest_blocks(&self) -> impl Future<Output = Result<Vec<BlockSummary>, FetchError>> + Send;

    fn submit(&self, record: &BlockRecord) -> impl Future<Output = Result<Ack, SubmitError>> + Send;
}

/// Autorité joignable en HTTP/JSON
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthority {
    /// Crée un client; `timeout` borne chaque requête
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &'static str) -> Result<T, FetchError> {
        let resp = self
            .client
            .get(self.url(endpoint))
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                endpoint,
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }

        resp.json::<T>().await.map_err(|e| FetchError::Decode {
            endpoint,
            message: e.to_string(),
        })
    }
}

impl Authority for HttpAuthority {
    async fn block_count(&self) -> Result<u64, FetchError> {
        let data: BlockCountResponse = self.get_json(BLOCKS_COUNT_PATH).await?;
        Ok(data.block_count.unwrap_or(0))
    }

    async fn difficulty(&self) -> Result<u32, FetchError> {
        let data: DifficultyResponse = self.get_json(DIFFICULTY_PATH).await?;
        Ok(data.difficulty.unwrap_or(0))
    }

    async fn latest_blocks(&self) -> Result<Vec<BlockSummary>, FetchError> {
        let data: LatestBlocksResponse = self.get_json(LATEST_BLOCKS_PATH).await?;
        Ok(data.latest_blocks.unwrap_or_default())
    }

    async fn submit(&self, record: &BlockRecord) -> Result<Ack, SubmitError> {
        debug!("POST {} block #{} {}", MINE_PATH, record.block_id, record.hash);

        let resp = self
            .client
            .post(self.url(MINE_PATH))
            .json(record)
            .send()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        // Body is informational only; a read failure after a 2xx still counts as accepted.
        let body = resp.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            return Err(SubmitError::Rejected { status, body });
        }

        Ok(Ack { status, body })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Autorité en mémoire pour les tests
    #[derive(Default)]
    pub struct MockAuthority {
        pub block_count: Mutex<u64>,
        pub difficulty: Mutex<u32>,
        pub latest_blocks: Mutex<Vec<BlockSummary>>,
        pub fail_block_count: AtomicBool,
        pub fail_difficulty: AtomicBool,
        pub fail_latest_blocks: AtomicBool,
        pub latest_blocks_delay: Mutex<Duration>,
        pub reject_status: Mutex<Option<u16>>,
        pub transport_down: AtomicBool,
        pub submissions: Mutex<Vec<BlockRecord>>,
    }

    impl MockAuthority {
        pub fn submissions(&self) -> Vec<BlockRecord> {
            self.submissions.lock().unwrap().clone()
        }
    }

    fn down(endpoint: &'static str) -> FetchError {
        FetchError::Transport {
            endpoint,
            message: "connection refused".to_string(),
        }
    }

    impl Authority for MockAuthority {
        async fn block_count(&self) -> Result<u64, FetchError> {
            if self.fail_block_count.load(Ordering::SeqCst) {
                return Err(down(BLOCKS_COUNT_PATH));
            }
            Ok(*self.block_count.lock().unwrap())
        }

        async fn difficulty(&self) -> Result<u32, FetchError> {
            if self.fail_difficulty.load(Ordering::SeqCst) {
                return Err(FetchError::Status {
                    endpoint: DIFFICULTY_PATH,
                    status: 500,
                });
            }
            Ok(*self.difficulty.lock().unwrap())
        }

        async fn latest_blocks(&self) -> Result<Vec<BlockSummary>, FetchError> {
            let delay = *self.latest_blocks_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_latest_blocks.load(Ordering::SeqCst) {
                return Err(down(LATEST_BLOCKS_PATH));
            }
            Ok(self.latest_blocks.lock().unwrap().clone())
        }

        async fn submit(&self, record: &BlockRecord) -> Result<Ack, SubmitError> {
            if self.transport_down.load(Ordering::SeqCst) {
                return Err(SubmitError::Transport("connection refused".to_string()));
            }
            self.submissions.lock().unwrap().push(record.clone());
            if let Some(status) = *self.reject_status.lock().unwrap() {
                return Err(SubmitError::Rejected {
                    status,
                    body: "rejected".to_string(),
                });
            }
            Ok(Ack {
                status: 200,
                body: "{}".to_string(),
            })
        }
    }
}

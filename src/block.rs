//! Composition du bloc hashé et de l'enregistrement soumis à l'autorité

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{User, UserId};
use crate::reward::Amount;

/// Hash précédent: constante, pas un vrai chaînage
pub const PREVIOUS_HASH_PLACEHOLDER: &str = "0";

/// Nom affiché quand l'utilisateur n'en a pas
pub const UNKNOWN_NAME: &str = "Unknown";

/// Source d'horodatage ISO-8601 utilisée à chaque essai
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> String;
}

/// Horloge système UTC, précision milliseconde (`2024-01-01T00:00:00.000Z`)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Horloge figée, utile pour rendre une recherche reproductible
#[derive(Debug, Clone)]
pub struct FixedClock(pub String);

impl Clock for FixedClock {
    fn now(&self) -> String {
        self.0.clone()
    }
}

/// Données descriptives du bloc, incluant le nom de l'utilisateur
pub fn payload(display_name: Option<&str>) -> String {
    let name = display_name
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_NAME);
    format!("User-mined block by {}", name)
}

/// Chaîne hashée à chaque essai: nonce || payload || timestamp || previous_hash
pub fn compose(nonce: u64, payload: &str, timestamp: &str, previous_hash: &str) -> String {
    format!("{}{}{}{}", nonce, payload, timestamp, previous_hash)
}

/// Bloc soumis à l'autorité (`POST /mine`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    pub block_id: u64,
    pub user_id: UserId,
    #[serde(rename = "blockHash")]
    pub hash: String,
    pub difficulty: u32,
    pub reward: Amount,
    pub timestamp: String,
    #[serde(rename = "blockData")]
    pub payload: String,
}

impl BlockRecord {
    /// Construit l'enregistrement d'un bloc trouvé
    ///
    /// `block_count` est le nombre de blocs connu au lancement de la recherche;
    /// l'identifiant du bloc est le suivant.
    pub fn new(
        block_count: u64,
        user: &User,
        hash: String,
        difficulty: u32,
        reward: Amount,
        timestamp: String,
        payload: String,
    ) -> Self {
        Self {
            block_id: block_count.saturating_add(1),
            user_id: user.id,
            hash,
            difficulty,
            reward,
            timestamp,
            payload,
        }
    }
}

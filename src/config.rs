//! Configuration du mineur

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::DEFAULT_YIELD_EVERY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// URL de l'autorité réseau
    pub authority_url: String,

    /// Timeout de chaque requête sortante (secondes)
    pub request_timeout_secs: u64,

    /// Période du rafraîchissement des statistiques (millisecondes)
    pub poll_interval_ms: u64,

    /// Nombre d'essais entre deux cessions du worker
    pub yield_every: u64,

    /// Fichier JSON des soldes
    pub store_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            authority_url: "https://serv.sp1project.ru".to_string(),
            request_timeout_secs: 5,
            poll_interval_ms: 1_000,
            yield_every: DEFAULT_YIELD_EVERY,
            store_path: PathBuf::from("balances.json"),
        }
    }
}

impl Config {
    /// Charge un fichier TOML; les clés absentes gardent leur valeur par défaut
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.authority_url)
            .with_context(|| format!("Invalid authority URL: {}", self.authority_url))?;
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be at least 1");
        }
        if self.yield_every == 0 {
            anyhow::bail!("yield_every must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

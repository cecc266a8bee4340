//! Identité de l'utilisateur fournie au démarrage

use serde::Deserialize;
use thiserror::Error;

pub type UserId = i64;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("user identity is not available: {0}")]
    Unavailable(String),
}

/// Objet utilisateur tel que fourni par le client hôte (`{id, first_name}`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitUser {
    #[serde(default)]
    pub id: Option<UserId>,
    #[serde(default)]
    pub first_name: Option<String>,
}

impl InitUser {
    pub fn from_json(raw: &str) -> Result<Self, IdentityError> {
        serde_json::from_str(raw)
            .map_err(|e| IdentityError::Unavailable(format!("malformed user object: {}", e)))
    }
}

/// Utilisateur de la session, immuable après le bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    display_name: Option<String>,
}

impl User {
    pub fn new(id: UserId, display_name: Option<String>) -> Self {
        Self { id, display_name }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Valide l'objet utilisateur: sans identifiant exploitable, pas de minage
    pub fn bootstrap(init: InitUser) -> Result<Self, IdentityError> {
        match init.id {
            Some(id) if id != 0 => Ok(Self::new(id, init.first_name)),
            Some(_) => Err(IdentityError::Unavailable("user id is zero".to_string())),
            None => Err(IdentityError::Unavailable("user id is missing".to_string())),
        }
    }
}

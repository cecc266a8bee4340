//! Politique de récompense et montants à virgule fixe
//!
//! Les montants sont stockés en dixièmes (une décimale) pour que l'arrondi
//! soit identique sur toutes les plateformes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Nombre d'essais correspondant à une récompense de 0.5
pub const ATTEMPTS_PER_HALF_UNIT: u64 = 100_000;

/// Nombre d'essais par dixième de récompense (100 000 / 0.5 / 10)
const ATTEMPTS_PER_TENTH: u64 = ATTEMPTS_PER_HALF_UNIT * 2 / 10;

/// Montant non négatif avec une décimale
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_tenths(tenths: u64) -> Self {
        Amount(tenths)
    }

    pub const fn tenths(self) -> u64 {
        self.0
    }

    /// Convertit un décimal lu depuis un document (arrondi à une décimale)
    ///
    /// Retourne `None` pour une valeur négative, infinie ou NaN.
    pub fn from_decimal(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let tenths = (value * 10.0).round();
        if tenths > u64::MAX as f64 {
            return None;
        }
        Some(Amount(tenths as u64))
    }

    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / 10.0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 / 10, self.0 % 10)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Amount::from_decimal(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {}", value)))
    }
}

/// Récompense pour un nombre d'essais: round(attempts / 100000 * 0.5, 1)
///
/// Arrondi au demi supérieur (half away from zero), calculé en entiers.
pub fn reward(attempts: u64) -> Amount {
    let whole = attempts / ATTEMPTS_PER_TENTH;
    let remainder = attempts % ATTEMPTS_PER_TENTH;
    let round_up = remainder * 2 >= ATTEMPTS_PER_TENTH;
    Amount(whole + u64::from(round_up))
}

//! Logique Proof of Work: hash SHA256 et politique de cible

use sha2::{Digest, Sha256};

/// Symbole que le hash doit répéter en tête
pub const TARGET_SYMBOL: char = '0';

/// Largeur d'un digest SHA256 en hexadécimal
pub const DIGEST_HEX_LEN: usize = 64;

/// Calcule le hash PoW: hex(SHA256(input))
///
/// L'entrée est hashée sous sa forme UTF-8, la sortie est en hexadécimal minuscule.
pub fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Préfixe exigé pour une difficulté donnée
///
/// `difficulty = 0` donne une cible vide: le premier essai est toujours valide.
/// Au-delà de la largeur du digest, le préfixe est plafonné à `DIGEST_HEX_LEN + 1`
/// symboles (toujours inatteignable).
pub fn target(difficulty: u32) -> String {
    let len = (difficulty as usize).min(DIGEST_HEX_LEN + 1);
    std::iter::repeat(TARGET_SYMBOL).take(len).collect()
}

/// Vérifie si un hash commence par la cible
#[inline(always)]
pub fn meets_target(hash: &str, target: &str) -> bool {
    hash.starts_with(target)
}

/// Nombre de symboles cibles consécutifs en tête du hash
pub fn leading_zeros(hash: &str) -> usize {
    hash.chars().take_while(|c| *c == TARGET_SYMBOL).count()
}

/// Une difficulté supérieure à la largeur du digest ne peut jamais être atteinte
pub fn is_reachable(difficulty: u32) -> bool {
    difficulty as usize <= DIGEST_HEX_LEN
}

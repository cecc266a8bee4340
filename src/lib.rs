//! Mineur PoW coopératif: recherche de nonce, soumission à l'autorité réseau,
//! crédit du solde et suivi des statistiques.

pub mod authority;
pub mod block;
pub mod config;
pub mod engine;
pub mod identity;
pub mod ledger;
pub mod poller;
pub mod pow;
pub mod reward;
pub mod session;

pub use authority::{Authority, HttpAuthority};
pub use engine::{RunOutcome, SearchEngine};
pub use identity::User;
pub use session::Session;

//! Contexte de session: utilisateur et statistiques réseau courantes

use tokio::sync::watch;

use crate::block;
use crate::engine::SearchJob;
use crate::identity::User;
use crate::poller::NetworkStats;

/// Contexte passé au moteur à chaque démarrage
#[derive(Debug, Clone)]
pub struct Session {
    user: User,
    stats: watch::Receiver<NetworkStats>,
}

impl Session {
    pub fn new(user: User, stats: watch::Receiver<NetworkStats>) -> Self {
        Self { user, stats }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Copie des dernières statistiques publiées
    pub fn stats(&self) -> NetworkStats {
        self.stats.borrow().clone()
    }

    /// Fige difficulté et nombre de blocs pour une recherche
    pub fn job(&self) -> SearchJob {
        let (difficulty, block_count) = {
            let stats = self.stats.borrow();
            (stats.difficulty, stats.block_count)
        };
        SearchJob {
            user: self.user.clone(),
            difficulty,
            block_count,
            payload: block::payload(self.user.display_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_snapshots_stats() {
        let (tx, rx) = watch::channel(NetworkStats {
            block_count: 12,
            difficulty: 3,
            latest_blocks: Vec::new(),
        });
        let session = Session::new(User::new(1, Some("Ann".to_string())), rx);

        let job = session.job();
        assert_eq!(job.difficulty, 3);
        assert_eq!(job.block_count, 12);
        assert_eq!(job.payload, "User-mined block by Ann");

        // Later updates do not touch a job already taken
        tx.send_modify(|stats| stats.difficulty = 5);
        assert_eq!(job.difficulty, 3);
        assert_eq!(session.job().difficulty, 5);
    }
}

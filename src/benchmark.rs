//! Benchmark de la boucle de recherche (hors réseau, sans soumission)

use std::time::Instant;

use hash_miner::block::{self, SystemClock};
use hash_miner::engine::{search, SearchControl, DEFAULT_YIELD_EVERY};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              HASH MINER - SEARCH BENCHMARK                   ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let payload = block::payload(Some("Benchmark"));
    let difficulties = vec![
        ("Très facile", 1),
        ("Facile", 2),
        ("Moyen", 3),
        ("Difficile", 4),
        ("Très difficile", 5),
    ];

    println!("📊 Single worker, yield every {} attempts\n", DEFAULT_YIELD_EVERY);

    let control = SearchControl::new();

    for (name, difficulty) in &difficulties {
        print!("  {} (diff: {})... ", name, difficulty);

        let attempts_before = control.attempts();
        let start = Instant::now();
        match search(*difficulty, &payload, &SystemClock, &control, DEFAULT_YIELD_EVERY).await {
            Some(solution) => {
                let elapsed = start.elapsed();
                let attempts = control.attempts() - attempts_before;
                let hashrate = attempts as f64 / elapsed.as_secs_f64();
                println!(
                    "✓ {:?} ({} hashes, {:.2} KH/s) nonce {}",
                    elapsed,
                    attempts,
                    hashrate / 1_000.0,
                    solution.nonce
                );
            }
            None => {
                println!("✗ Cancelled");
            }
        }
    }

    println!("\nTotal hashes: {}", control.attempts());
}

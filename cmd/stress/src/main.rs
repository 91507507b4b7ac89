//! Stress test - scavenging pool throughput
//!
//! Runs a tiny action in a self-renewing pool for a few seconds, then
//! resets it and reports throughput and the highest concurrency observed.
//!
//! Usage:
//!     ./target/release/stress [workers] [seconds]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskpool::{scavenging_pool, TaskPoolOptions};

fn main() {
    taskpool::init_logging();
    println!("=== taskpool Stress Test ===\n");

    let workers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(8);
    let seconds: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let completed = Arc::new(AtomicU64::new(0));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (c, cur, pk) = (Arc::clone(&completed), Arc::clone(&current), Arc::clone(&peak));
    let pool = match scavenging_pool(
        move |_token| {
            let now = cur.fetch_add(1, Ordering::Relaxed) + 1;
            pk.fetch_max(now, Ordering::Relaxed);
            // Do a little work
            let mut x = 0u64;
            for i in 0..64 {
                x = x.wrapping_mul(31).wrapping_add(i);
            }
            std::hint::black_box(x);
            cur.fetch_sub(1, Ordering::Relaxed);
            c.fetch_add(1, Ordering::Relaxed);
        },
        TaskPoolOptions::from_env().max_active_workers(workers).name("stress"),
    ) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("stress: {}", e);
            std::process::exit(1);
        }
    };

    println!("Priming {} loops for {}s...", workers, seconds);
    let start = Instant::now();
    match pool.prime(workers) {
        Ok(n) => println!("Started {} loops", n),
        Err(e) => {
            eprintln!("stress: prime failed: {}", e);
            std::process::exit(1);
        }
    }

    while start.elapsed() < Duration::from_secs(seconds) {
        std::thread::sleep(Duration::from_millis(500));
        print!("\rCompleted: {}", completed.load(Ordering::Relaxed));
    }

    let reset_start = Instant::now();
    pool.reset();
    let reset_time = reset_start.elapsed();
    let total_time = start.elapsed();
    let done = completed.load(Ordering::Relaxed);

    println!("\n\n=== Results ===");
    println!("Workers:         {}", workers);
    println!("Completed:       {}", done);
    println!("Peak concurrent: {}", peak.load(Ordering::Relaxed));
    println!("Reset time:      {:?}", reset_time);
    println!("Total time:      {:?}", total_time);
    println!("Throughput:      {:.0} runs/sec", done as f64 / total_time.as_secs_f64());

    assert!(peak.load(Ordering::Relaxed) <= workers, "capacity exceeded");
    println!("\n=== Stress Test Complete ===");
}

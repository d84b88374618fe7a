//! Stress tests for Stasis.
//!
//! These tests verify behavior under heavy load and concurrent access.

use crate::fixtures::{player, Player};
use stasis_core::{ConcurrentCache, Manager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct keys touched by update and cache tests.
    pub key_space: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            key_space: 1_000,
        }
    }
}

fn run_threads<F>(threads: usize, work: F) -> StressTestResult
where
    F: Fn(usize, &AtomicUsize, &AtomicUsize) + Sync,
{
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..threads {
            let (work, successful, failed) = (&work, &successful, &failed);
            scope.spawn(move || work(t, successful, failed));
        }
    });

    StressTestResult::new(
        successful.into_inner(),
        failed.into_inner(),
        start.elapsed(),
    )
}

fn tally<T, E>(result: Result<T, E>, successful: &AtomicUsize, failed: &AtomicUsize) {
    match result {
        Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
    };
}

/// Inserts distinct players from every thread.
///
/// Thread `t` inserts ids `t * operations .. (t + 1) * operations`.
pub fn stress_concurrent_inserts(manager: &Manager<Player>, config: &StressConfig) -> StressTestResult {
    let per_thread = config.operations;
    run_threads(config.threads, |t, successful, failed| {
        let base = (t * per_thread) as u64;
        for i in 0..per_thread as u64 {
            tally(manager.insert(player(base + i)), successful, failed);
        }
    })
}

/// Updates a shared key space from every thread, writing the thread index
/// into `level`.
///
/// Keys are inserted first; only the update phase is timed.
pub fn stress_concurrent_updates(manager: &Manager<Player>, config: &StressConfig) -> StressTestResult {
    for id in 0..config.key_space as u64 {
        let _ = manager.insert(player(id));
    }

    let key_space = config.key_space;
    let operations = config.operations;
    run_threads(config.threads, |t, successful, failed| {
        for i in 0..operations {
            let mut row = player(((t * 7 + i) % key_space) as u64);
            row.level = t as u32 + 1;
            tally(manager.update_all(row), successful, failed);
        }
    })
}

/// Mixes stores, deletes and reads on one cache from every thread.
///
/// Every value stored under key `k` is `k * 10 + t`, so a reader can check
/// that it never observes a value written for another key.
pub fn stress_cache_mixed(cache: &ConcurrentCache<u32, u32>, config: &StressConfig) -> StressTestResult {
    let key_space = config.key_space as u32;
    let operations = config.operations;
    run_threads(config.threads, |t, successful, failed| {
        for i in 0..operations {
            let key = ((t * 31 + i) as u32) % key_space;
            let result = match i % 4 {
                0 | 1 => {
                    cache.store(key, key * 10 + t as u32);
                    Ok(())
                }
                2 => match cache.load(&key) {
                    Some(value) if *value / 10 != key => Err(*value),
                    _ => Ok(()),
                },
                _ => {
                    cache.delete(&key);
                    Ok(())
                }
            };
            tally(result, successful, failed);
        }
    })
}

/// Reads a populated cache from every thread while one extra thread keeps
/// overwriting it. Every read is expected to hit.
pub fn stress_cache_reads(config: &StressConfig) -> StressTestResult {
    let cache = Arc::new(ConcurrentCache::new());
    for key in 0..config.key_space as u32 {
        cache.store(key, key);
    }

    let key_space = config.key_space as u32;
    let operations = config.operations;
    let writer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for i in 0..operations as u32 {
                let key = i % key_space;
                cache.store(key, key);
            }
        })
    };

    let result = run_threads(config.threads, |t, successful, failed| {
        for i in 0..operations {
            let key = ((t + i) as u32) % key_space;
            tally(cache.load(&key).ok_or(key), successful, failed);
        }
    });
    writer.join().expect("Thread panicked");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestManager;

    fn small() -> StressConfig {
        StressConfig {
            operations: 500,
            threads: 4,
            key_space: 50,
        }
    }

    #[test]
    fn test_concurrent_inserts() {
        let test = TestManager::started();
        let config = small();

        let result = stress_concurrent_inserts(&test, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 2_000);

        test.stop().unwrap();
        assert_eq!(test.store.len(), 2_000);
        assert_eq!(test.cache().len(), 2_000);
    }

    #[test]
    fn test_concurrent_updates_converge() {
        let test = TestManager::started();
        let config = small();

        let result = stress_concurrent_updates(&test, &config);
        assert_eq!(result.failed_ops, 0);
        test.stop().unwrap();

        // the store ends with the cache's last write for every key
        for id in 0..config.key_space as u64 {
            let cached = test.get(&id).unwrap();
            assert_eq!(test.store.get(&id).as_ref(), Some(&*cached));
        }
    }

    #[test]
    fn test_cache_mixed() {
        let cache = ConcurrentCache::new();
        let result = stress_cache_mixed(&cache, &small());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.total_ops, 2_000);
        assert!(cache.len() <= 50);
    }

    #[test]
    fn test_cache_reads_always_hit() {
        let result = stress_cache_reads(&small());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 2_000);
    }
}

// src/progress.rs
//! Scan statistics registry.
//!
//! Counters are plain atomics shared by handle; nothing here blocks. The
//! registry replaces process-global tallies: it is constructed once and
//! passed down through the executor options.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Default)]
pub struct StatsRegistry {
    pub total: AtomicU64,
    pub requests: AtomicU64,
    pub matched: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
    pub warnings: AtomicU64,
}

impl StatsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn incr_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_warnings(&self) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic stats line. The task exits when the returned
    /// guard is dropped.
    pub fn spawn_reporter(self: &Arc<Self>, every: Duration) -> StatsReporterGuard {
        let stats = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let s = stats.snapshot();
                let percent = if s.total > 0 {
                    (s.requests + s.skipped) * 100 / s.total
                } else {
                    0
                };
                info!(
                    "progress: {}/{} ({}%) | matched: {} | failed: {} | skipped: {}",
                    s.requests + s.skipped,
                    s.total,
                    percent,
                    s.matched,
                    s.failed,
                    s.skipped
                );
            }
        });
        StatsReporterGuard { handle }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub total: u64,
    pub requests: u64,
    pub matched: u64,
    pub failed: u64,
    pub skipped: u64,
}

pub struct StatsReporterGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for StatsReporterGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = StatsRegistry::new();
        stats.set_total(10);
        stats.incr_requests();
        stats.incr_requests();
        stats.incr_matched();
        stats.incr_skipped();
        let s = stats.snapshot();
        assert_eq!(s.total, 10);
        assert_eq!(s.requests, 2);
        assert_eq!(s.matched, 1);
        assert_eq!(s.skipped, 1);
    }

    #[tokio::test]
    async fn test_reporter_guard_stops_task() {
        let stats = StatsRegistry::new();
        let guard = stats.spawn_reporter(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);
        // nothing to assert beyond not hanging; the abort is immediate
    }
}

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    chain::{FixError, FixErrorType},
    stores::CertFetchCache,
};

/// Best-effort counters describing what the fixer has done so far.
///
/// Every field is updated on its own with `Relaxed` ordering; a snapshot taken
/// while workers are busy may be off by a job or two between fields.
#[derive(Debug, Default)]
pub struct FixerStats {
    pub(crate) active: AtomicU64,
    pub(crate) reconstructed: AtomicU64,
    pub(crate) not_reconstructed: AtomicU64,
    pub(crate) fixed: AtomicU64,
    pub(crate) not_fixed: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) already_done: AtomicU64,
    /// Snapshots logged so far
    pub(crate) reports: AtomicU64,
}

impl FixerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally one completed job from the errors it produced:
    /// no errors is `reconstructed`, `VerifyFailed` alone is `fixed`,
    /// `VerifyFailed` with `FixFailed` is `not_fixed`.
    pub fn record(&self, errors: &[FixError]) {
        let verify_failed = errors
            .iter()
            .any(|err| err.kind == FixErrorType::VerifyFailed);
        let fix_failed = errors
            .iter()
            .any(|err| err.kind == FixErrorType::FixFailed);

        if !verify_failed {
            self.reconstructed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.not_reconstructed.fetch_add(1, Ordering::Relaxed);
        if fix_failed {
            self.not_fixed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fixed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            reconstructed: self.reconstructed.load(Ordering::Relaxed),
            not_reconstructed: self.not_reconstructed.load(Ordering::Relaxed),
            fixed: self.fixed.load(Ordering::Relaxed),
            not_fixed: self.not_fixed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            already_done: self.already_done.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active: u64,
    pub reconstructed: u64,
    pub not_reconstructed: u64,
    pub fixed: u64,
    pub not_fixed: u64,
    pub skipped: u64,
    pub already_done: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fixers: {} active, {} reconstructed, {} not reconstructed, \
             {} fixed, {} not fixed, {} skipped, {} already done",
            self.active,
            self.reconstructed,
            self.not_reconstructed,
            self.fixed,
            self.not_fixed,
            self.skipped,
            self.already_done
        )
    }
}

/// Log a snapshot of the counters
pub(crate) fn log_snapshot(stats: &FixerStats, cache: &CertFetchCache) {
    let snapshot = stats.snapshot();
    let cache = cache.stats();
    stats.reports.fetch_add(1, Ordering::Relaxed);

    tracing::info!(
        active = snapshot.active,
        reconstructed = snapshot.reconstructed,
        not_reconstructed = snapshot.not_reconstructed,
        fixed = snapshot.fixed,
        not_fixed = snapshot.not_fixed,
        skipped = snapshot.skipped,
        already_done = snapshot.already_done,
        cache_hits = cache.hits,
        cache_misses = cache.misses,
        cache_errors = cache.errors,
        "{snapshot}"
    );
}

/// Spawn the periodic reporter. It only reads atomics, so it never waits on
/// a worker and no worker ever waits on it.
pub(crate) fn spawn_reporter(
    stats: Arc<FixerStats>,
    cache: Arc<CertFetchCache>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            log_snapshot(&stats, &cache);
        }
    })
}

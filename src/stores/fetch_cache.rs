use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::services::fetch::{Fetch, FetchError};

/// What a URL resolved to. Written once, then shared by every reader.
pub type FetchOutcome = Result<Bytes, FetchError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

/// Memoizing, single-flight cache over a `Fetch` implementation.
///
/// Each URL owns a `OnceCell`; the first caller drives the fetch and every
/// concurrent or later caller awaits that same cell. Failures are cached as
/// well so a dead URL is only ever requested once.
pub struct CertFetchCache {
    fetcher: Arc<dyn Fetch>,
    entries: DashMap<String, Arc<OnceCell<FetchOutcome>>>,
    log_hits: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl CertFetchCache {
    pub fn new(fetcher: Arc<dyn Fetch>, log_hits: bool) -> Self {
        CertFetchCache {
            fetcher,
            entries: DashMap::new(),
            log_hits,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, url: &str) -> FetchOutcome {
        // Clone the cell out so the shard lock is not held across the fetch
        let cell = self
            .entries
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(outcome) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if self.log_hits {
                tracing::debug!(url, "issuer cache hit");
            }
            return outcome.clone();
        }

        let fetched_here = AtomicBool::new(false);
        let outcome = cell
            .get_or_init(|| async {
                fetched_here.store(true, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                if self.log_hits {
                    tracing::debug!(url, "issuer cache miss");
                }

                let outcome = self.fetcher.fetch(url).await;
                if let Err(err) = &outcome {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(url, error = %err, "failed to fetch issuer certificate");
                }
                outcome
            })
            .await
            .clone();

        // Waited on another caller's fetch
        if !fetched_here.load(Ordering::Relaxed) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        outcome
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

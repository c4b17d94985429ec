use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use anyhow::anyhow;
use arc_swap::ArcSwapOption;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};

use crate::{
    chain::{roots::RootPool, ChainBuilder, FixError, FixJob, OpensslVerifier, Verify},
    services::fetch::Fetch,
    stores::{certificates::Certificate, CertFetchCache},
};

pub mod stats;

pub use stats::{FixerStats, StatsSnapshot};

/// Receives every chain the fixer managed to verify or repair
pub type ChainSink = mpsc::Sender<Vec<Certificate>>;
/// Receives every `VerifyFailed`/`FixFailed` error
pub type ErrorSink = mpsc::Sender<FixError>;

#[derive(Debug, Clone)]
pub struct FixerOptions {
    /// Number of workers; must be at least one
    pub worker_count: usize,
    /// Periodically log counters (and cache hits/misses at debug level)
    pub log_stats: bool,
    pub stats_interval: Duration,
}

impl Default for FixerOptions {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            log_stats: false,
            stats_interval: Duration::from_secs(1),
        }
    }
}

/// A job on its way to a worker. `taken` fires once a worker has claimed it,
/// which is what `submit` waits for.
struct Handoff {
    job: FixJob,
    taken: oneshot::Sender<()>,
}

/// Asynchronous chain fixer: a fixed pool of workers running the
/// construct/fix algorithm over submitted chains and publishing the results
/// to the chain and error sinks.
pub struct Fixer {
    queue: ArcSwapOption<mpsc::Sender<Handoff>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<FixerStats>,
    cache: Arc<CertFetchCache>,
}

impl Fixer {
    /// Start `options.worker_count` workers using OpenSSL for verification.
    /// Must be called from within a tokio runtime.
    pub fn new(
        options: FixerOptions,
        chains: ChainSink,
        errors: ErrorSink,
        fetcher: Arc<dyn Fetch>,
    ) -> Result<Self, anyhow::Error> {
        Self::with_verifier(
            options,
            chains,
            errors,
            fetcher,
            Arc::new(OpensslVerifier::new()),
        )
    }

    pub fn with_verifier(
        options: FixerOptions,
        chains: ChainSink,
        errors: ErrorSink,
        fetcher: Arc<dyn Fetch>,
        verifier: Arc<dyn Verify>,
    ) -> Result<Self, anyhow::Error> {
        if options.worker_count == 0 {
            return Err(anyhow!("worker_count must be greater than 0"));
        }

        if options.log_stats && options.stats_interval.is_zero() {
            return Err(anyhow!("stats_interval must be greater than 0"));
        }

        let stats = Arc::new(FixerStats::new());
        let cache = Arc::new(CertFetchCache::new(fetcher, options.log_stats));
        let builder = Arc::new(ChainBuilder::new(verifier, cache.clone(), stats.clone()));

        // Capacity 1 is the minimum tokio allows; `submit` additionally waits
        // for the `taken` ack, so nothing is ever left waiting in the channel
        // when `submit` returns.
        let (sender, receiver) = mpsc::channel::<Handoff>(1);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..options.worker_count)
            .map(|id| {
                tokio::spawn(fix_worker(
                    id,
                    receiver.clone(),
                    builder.clone(),
                    stats.clone(),
                    chains.clone(),
                    errors.clone(),
                ))
            })
            .collect();

        let reporter = options.log_stats.then(|| {
            stats::spawn_reporter(stats.clone(), cache.clone(), options.stats_interval)
        });

        tracing::info!(workers = options.worker_count, log_stats = options.log_stats, "chain fixer started");

        Ok(Fixer {
            queue: ArcSwapOption::from_pointee(sender),
            workers: Mutex::new(workers),
            reporter: Mutex::new(reporter),
            stats,
            cache,
        })
    }

    /// Queue `cert` and its `chain` for fixing against `roots`.
    ///
    /// Waits until a worker has taken the job, so a busy pool (or a slow sink
    /// consumer) slows submitters down. Fails once `drain` has been called.
    pub async fn submit(
        &self,
        cert: Certificate,
        chain: Vec<Certificate>,
        roots: Arc<RootPool>,
    ) -> Result<(), anyhow::Error> {
        let Some(queue) = self.queue.load_full() else {
            return Err(anyhow!("fixer is draining, no more chains can be submitted"));
        };

        let (taken, claimed) = oneshot::channel();
        queue
            .send(Handoff {
                job: FixJob::new(cert, chain, roots),
                taken,
            })
            .await
            .map_err(|_| anyhow!("fixer workers have stopped"))?;

        claimed
            .await
            .map_err(|_| anyhow!("fixer workers stopped before taking the chain"))
    }

    /// Stop accepting chains and wait for every queued or in-flight job to be
    /// fully published. Returns only after all workers have exited.
    pub async fn drain(&self) {
        // Dropping our sender closes the queue once in-flight submits finish
        drop(self.queue.swap(None));

        // Held across the joins so a concurrent drain waits for them too
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if let Err(err) = worker.await {
                tracing::error!("fixer worker exited abnormally: {err}");
            }
        }
        drop(workers);

        if let Some(reporter) = self.reporter.lock().await.take() {
            reporter.abort();
            stats::log_snapshot(&self.stats, &self.cache);
        }

        tracing::info!("{}", self.stats.snapshot());
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn cache_stats(&self) -> crate::stores::fetch_cache::CacheStats {
        self.cache.stats()
    }
}

impl Drop for Fixer {
    fn drop(&mut self) {
        if let Some(reporter) = self.reporter.get_mut().take() {
            reporter.abort();
        }
    }
}

/// Worker loop: take one job at a time, run it to completion and publish all
/// of its outputs before taking the next. Ends when the queue is closed.
async fn fix_worker(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Handoff>>>,
    builder: Arc<ChainBuilder>,
    stats: Arc<FixerStats>,
    chains: ChainSink,
    errors: ErrorSink,
) {
    tracing::trace!(worker = id, "fixer worker started");

    loop {
        let next = jobs.lock().await.recv().await;
        let Some(Handoff { job, taken }) = next else {
            break;
        };
        // The submitter may have given up waiting; the job still runs
        let _ = taken.send(());

        stats.active.fetch_add(1, Ordering::Relaxed);
        let outcome = builder.handle_chain(&job).await;
        if !outcome.skipped {
            stats.record(&outcome.errors);
        }

        for err in outcome.errors {
            if errors.send(err).await.is_err() {
                tracing::warn!(worker = id, "error sink closed, dropping fix error");
            }
        }

        for chain in outcome.chains {
            if chains.send(chain).await.is_err() {
                tracing::warn!(worker = id, "chain sink closed, dropping fixed chain");
            }
        }
        stats.active.fetch_sub(1, Ordering::Relaxed);
    }

    tracing::trace!(worker = id, "fixer worker stopped");
}

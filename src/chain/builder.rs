use std::{
    collections::HashSet,
    sync::{atomic::Ordering, Arc},
};

use bytes::Bytes;

use super::{
    chain_fingerprint, roots::RootPool, ChainBreak, FixError, FixErrorType, FixJob, Verify,
};
use crate::{
    fixer::stats::FixerStats,
    stores::{
        certificates::{parse_certificates, Certificate},
        CertFetchCache, ProcessedSet,
    },
};

/// Upper bound on issuer URLs tried for one job, on top of the natural bound
/// of distinct URLs discovered
const MAX_ISSUER_URLS: usize = 32;

/// What a single job produced
#[derive(Debug, Default)]
pub struct ChainOutcome {
    pub chains: Vec<Vec<Certificate>>,
    pub errors: Vec<FixError>,
    /// The job was a duplicate and produced nothing
    pub skipped: bool,
}

/// Why the fix attempt gave up
struct FixFailure {
    cause: String,
    url: Option<String>,
    bad: Option<Bytes>,
}

/// Construct/fix algorithm run by each worker
pub struct ChainBuilder {
    verifier: Arc<dyn Verify>,
    cache: Arc<CertFetchCache>,
    processed: ProcessedSet,
    published: ProcessedSet,
    stats: Arc<FixerStats>,
}

impl ChainBuilder {
    pub fn new(
        verifier: Arc<dyn Verify>,
        cache: Arc<CertFetchCache>,
        stats: Arc<FixerStats>,
    ) -> Self {
        ChainBuilder {
            verifier,
            cache,
            processed: ProcessedSet::new(),
            published: ProcessedSet::new(),
            stats,
        }
    }

    pub async fn handle_chain(&self, job: &FixJob) -> ChainOutcome {
        let fingerprint = job.fingerprint();
        // Marks the job as well, so it counts as processed whatever happens next
        if self.processed.check_and_mark(fingerprint) {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%fingerprint, "chain already processed, skipping");
            return ChainOutcome {
                skipped: true,
                ..ChainOutcome::default()
            };
        }

        let broken = match self.construct(job.chain(), job.roots()) {
            Ok(()) => {
                tracing::trace!(%fingerprint, "chain verified as submitted");
                return self.publish(job.chain().to_vec(), vec![]);
            }
            Err(broken) => broken,
        };

        tracing::debug!(%fingerprint, reason = %broken, "chain does not verify, trying to fix it");
        let verify_failed = FixError::new(
            FixErrorType::VerifyFailed,
            job.cert(),
            job.chain(),
            broken.to_string(),
        );

        match self.fix(job).await {
            Ok(chain) => {
                tracing::debug!(%fingerprint, length = chain.len(), "chain fixed");
                self.publish(chain, vec![verify_failed])
            }
            Err(failure) => {
                tracing::debug!(%fingerprint, cause = failure.cause.as_str(), "failed to fix chain");
                let fix_failed =
                    FixError::new(FixErrorType::FixFailed, job.cert(), job.chain(), failure.cause)
                        .with_url(failure.url)
                        .with_bad(failure.bad);

                ChainOutcome {
                    chains: vec![],
                    errors: vec![verify_failed, fix_failed],
                    skipped: false,
                }
            }
        }
    }

    /// Validate `chain` in the order given: every entry must be issued by the
    /// next one, the last must be (or be issued by) a pool root, and the whole
    /// path must pass the verifier's constraint checks.
    pub fn construct(&self, chain: &[Certificate], roots: &RootPool) -> Result<(), ChainBreak> {
        let Some(last) = chain.last() else {
            return Err(ChainBreak::Empty);
        };

        for (position, pair) in chain.windows(2).enumerate() {
            if !self.verifier.issued_by(&pair[0], &pair[1]) {
                return Err(ChainBreak::BrokenLink {
                    position,
                    subject: pair[0].subject(),
                });
            }
        }

        if !roots.contains(last) && self.anchor_for(last, roots).is_none() {
            return Err(ChainBreak::NoPathToRoot {
                subject: last.subject(),
            });
        }

        self.verifier.verify_path(chain, roots)
    }

    async fn fix(&self, job: &FixJob) -> Result<Vec<Certificate>, FixFailure> {
        let roots = job.roots();
        let mut chain = job.chain().to_vec();

        // Misordered chains can be repaired without fetching anything
        if let Some(fixed) = self.retry_relinked(&chain, roots) {
            return Ok(fixed);
        }

        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for cert in &chain {
            push_hints(cert, &mut seen, &mut urls);
        }

        let mut last_url = None;
        let mut bad = None;
        let mut next = 0;

        while next < urls.len() && next < MAX_ISSUER_URLS {
            let url = urls[next].clone();
            next += 1;

            let body = match self.cache.get(&url).await {
                Ok(body) => body,
                Err(err) => {
                    tracing::debug!(url, error = %err, "issuer URL unavailable");
                    last_url = Some(url);
                    continue;
                }
            };

            let fetched = match parse_certificates(&body) {
                Ok(fetched) if !fetched.is_empty() => fetched,
                _ => {
                    tracing::warn!(url, size = body.len(), "issuer URL returned no parseable certificate");
                    bad = Some(body);
                    last_url = Some(url);
                    continue;
                }
            };
            last_url = Some(url);

            for cert in fetched {
                if chain.contains(&cert) {
                    continue;
                }
                push_hints(&cert, &mut seen, &mut urls);
                self.insert_by_issuer(&mut chain, cert);
            }

            if self.construct(&chain, roots).is_ok() {
                return Ok(self.anchored(chain, roots));
            }

            if let Some(fixed) = self.retry_relinked(&chain, roots) {
                return Ok(fixed);
            }
        }

        Err(FixFailure {
            cause: format!(
                "no valid chain after trying {next} of {} issuer URL(s)",
                urls.len()
            ),
            url: last_url,
            bad,
        })
    }

    /// Place `cert` right after the entry it issued, else right before the
    /// entry that issued it, else at the end.
    fn insert_by_issuer(&self, chain: &mut Vec<Certificate>, cert: Certificate) {
        if let Some(child) = chain
            .iter()
            .position(|existing| self.verifier.issued_by(existing, &cert))
        {
            chain.insert(child + 1, cert);
            return;
        }

        if let Some(parent) = chain
            .iter()
            .skip(1)
            .position(|existing| self.verifier.issued_by(&cert, existing))
        {
            chain.insert(parent + 1, cert);
            return;
        }

        chain.push(cert);
    }

    /// Rebuild the chain by walking issuers from the leaf through the
    /// certificates already present. Entries off that path are dropped.
    fn relink(&self, chain: &[Certificate]) -> Vec<Certificate> {
        let Some((leaf, rest)) = chain.split_first() else {
            return vec![];
        };

        let mut pool = rest.to_vec();
        let mut linked = vec![leaf.clone()];

        loop {
            let Some(current) = linked.last() else { break };
            let Some(index) = pool
                .iter()
                .position(|candidate| self.verifier.issued_by(current, candidate))
            else {
                break;
            };
            let next = pool.remove(index);
            // repeated further down the chain
            if linked.contains(&next) {
                break;
            }
            linked.push(next);
        }

        linked
    }

    fn retry_relinked(&self, chain: &[Certificate], roots: &RootPool) -> Option<Vec<Certificate>> {
        let relinked = self.relink(chain);
        if relinked.as_slice() == chain {
            return None;
        }

        self.construct(&relinked, roots)
            .ok()
            .map(|()| self.anchored(relinked, roots))
    }

    fn anchor_for<'a>(&self, cert: &Certificate, roots: &'a RootPool) -> Option<&'a Certificate> {
        roots.iter().find(|root| self.verifier.issued_by(cert, root))
    }

    /// Extend a verified chain with the pool root it hangs off, if missing
    fn anchored(&self, mut chain: Vec<Certificate>, roots: &RootPool) -> Vec<Certificate> {
        let Some(last) = chain.last() else {
            return chain;
        };

        if roots.contains(last) {
            return chain;
        }

        if let Some(root) = self.anchor_for(last, roots) {
            chain.push(root.clone());
        }

        chain
    }

    fn publish(&self, chain: Vec<Certificate>, errors: Vec<FixError>) -> ChainOutcome {
        if self.published.check_and_mark(chain_fingerprint(&chain)) {
            self.stats.already_done.fetch_add(1, Ordering::Relaxed);
        }

        ChainOutcome {
            chains: vec![chain],
            errors,
            skipped: false,
        }
    }
}

fn push_hints(cert: &Certificate, seen: &mut HashSet<String>, urls: &mut Vec<String>) {
    for url in cert.issuer_urls() {
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::OpensslVerifier,
        services::fetch::Fetch,
        testing::{issue, ec_key, MockFetcher, TestPki, INTERMEDIATE_URL, ROOT_URL},
    };

    fn builder(fetcher: Arc<dyn Fetch>) -> (ChainBuilder, Arc<FixerStats>) {
        let stats = Arc::new(FixerStats::new());
        let cache = Arc::new(CertFetchCache::new(fetcher, false));
        let builder = ChainBuilder::new(Arc::new(OpensslVerifier::new()), cache, stats.clone());
        (builder, stats)
    }

    fn serving_intermediate(pki: &TestPki) -> Arc<MockFetcher> {
        Arc::new(MockFetcher::new().with_response(
            INTERMEDIATE_URL,
            Bytes::copy_from_slice(pki.intermediate.der()),
        ))
    }

    fn kinds(outcome: &ChainOutcome) -> Vec<FixErrorType> {
        outcome.errors.iter().map(|err| err.kind).collect()
    }

    #[tokio::test]
    async fn test_valid_chain_is_published_unchanged() {
        let pki = TestPki::new();
        let fetcher = Arc::new(MockFetcher::new());
        let (builder, _) = builder(fetcher.clone());

        let job = FixJob::new(pki.leaf.clone(), pki.full_chain(), pki.roots());
        let outcome = builder.handle_chain(&job).await;

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.chains, vec![pki.full_chain()]);
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_intermediate_is_fetched() {
        let pki = TestPki::new();
        let fetcher = serving_intermediate(&pki);
        let (builder, _) = builder(fetcher.clone());

        let job = FixJob::new(pki.leaf.clone(), vec![pki.leaf.clone()], pki.roots());
        let outcome = builder.handle_chain(&job).await;

        assert_eq!(kinds(&outcome), vec![FixErrorType::VerifyFailed]);
        assert_eq!(outcome.chains, vec![pki.full_chain()]);
        assert_eq!(fetcher.calls_for(INTERMEDIATE_URL), 1);
    }

    #[tokio::test]
    async fn test_intermediate_is_inserted_between_leaf_and_root() {
        let pki = TestPki::new();
        let (builder, _) = builder(serving_intermediate(&pki));

        let job = FixJob::new(
            pki.leaf.clone(),
            vec![pki.leaf.clone(), pki.root.clone()],
            pki.roots(),
        );
        let outcome = builder.handle_chain(&job).await;

        assert_eq!(kinds(&outcome), vec![FixErrorType::VerifyFailed]);
        assert_eq!(outcome.chains, vec![pki.full_chain()]);
    }

    #[tokio::test]
    async fn test_unreachable_issuer_exhausts_fix() {
        let pki = TestPki::new();
        let fetcher = Arc::new(MockFetcher::new());
        let (builder, _) = builder(fetcher.clone());

        let job = FixJob::new(pki.leaf.clone(), vec![pki.leaf.clone()], pki.roots());
        let outcome = builder.handle_chain(&job).await;

        assert_eq!(
            kinds(&outcome),
            vec![FixErrorType::VerifyFailed, FixErrorType::FixFailed]
        );
        assert!(outcome.chains.is_empty());
        assert_eq!(outcome.errors[1].url.as_deref(), Some(INTERMEDIATE_URL));
        assert_eq!(fetcher.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_issuer_is_reported_as_bad() {
        let pki = TestPki::new();
        let fetcher = Arc::new(
            MockFetcher::new().with_response(INTERMEDIATE_URL, Bytes::from_static(b"<html>")),
        );
        let (builder, _) = builder(fetcher);

        let job = FixJob::new(pki.leaf.clone(), vec![pki.leaf.clone()], pki.roots());
        let outcome = builder.handle_chain(&job).await;

        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(
            outcome.errors[1].bad.as_deref(),
            Some(b"<html>".as_slice())
        );
    }

    #[tokio::test]
    async fn test_misordered_chain_is_relinked_without_fetching() {
        let pki = TestPki::new();
        let fetcher = Arc::new(MockFetcher::new());
        let (builder, _) = builder(fetcher.clone());

        let job = FixJob::new(
            pki.leaf.clone(),
            vec![pki.leaf.clone(), pki.root.clone(), pki.intermediate.clone()],
            pki.roots(),
        );
        let outcome = builder.handle_chain(&job).await;

        assert_eq!(kinds(&outcome), vec![FixErrorType::VerifyFailed]);
        assert_eq!(outcome.chains, vec![pki.full_chain()]);
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_fetching_stops_once_chain_verifies() {
        let pki = TestPki::new();
        let fetcher = Arc::new(
            MockFetcher::new()
                .with_response(INTERMEDIATE_URL, Bytes::copy_from_slice(pki.intermediate.der()))
                .with_response(ROOT_URL, Bytes::copy_from_slice(pki.root.der())),
        );
        let (builder, _) = builder(fetcher.clone());

        let roots = Arc::new(RootPool::new(vec![pki.root.clone()]).unwrap());
        let job = FixJob::new(pki.leaf.clone(), vec![pki.leaf.clone()], roots);
        let outcome = builder.handle_chain(&job).await;

        assert_eq!(outcome.chains, vec![pki.full_chain()]);
        assert_eq!(fetcher.calls_for(ROOT_URL), 0);
    }

    #[tokio::test]
    async fn test_duplicate_job_is_skipped() {
        let pki = TestPki::new();
        let (builder, stats) = builder(Arc::new(MockFetcher::new()));
        let roots = pki.roots();

        let first = builder
            .handle_chain(&FixJob::new(pki.leaf.clone(), pki.full_chain(), roots.clone()))
            .await;
        let second = builder
            .handle_chain(&FixJob::new(
                pki.leaf.clone(),
                vec![
                    pki.leaf.clone(),
                    pki.intermediate.clone(),
                    pki.intermediate.clone(),
                    pki.root.clone(),
                ],
                roots,
            ))
            .await;

        assert!(!first.skipped);
        assert_eq!(first.chains.len(), 1);
        assert!(second.skipped);
        assert!(second.chains.is_empty() && second.errors.is_empty());
        assert_eq!(stats.snapshot().skipped, 1);
    }

    #[tokio::test]
    async fn test_failed_job_is_also_skipped_on_resubmission() {
        let pki = TestPki::new();
        let fetcher = Arc::new(MockFetcher::new());
        let (builder, stats) = builder(fetcher.clone());
        let roots = pki.roots();

        let first = builder
            .handle_chain(&FixJob::new(pki.leaf.clone(), vec![], roots.clone()))
            .await;
        let second = builder
            .handle_chain(&FixJob::new(pki.leaf.clone(), vec![], roots))
            .await;

        assert_eq!(first.errors.len(), 2);
        assert!(second.skipped);
        assert_eq!(stats.snapshot().skipped, 1);
        assert_eq!(fetcher.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_same_output_from_different_jobs_counts_already_done() {
        let pki = TestPki::new();
        let (builder, stats) = builder(serving_intermediate(&pki));
        let roots = pki.roots();

        let direct = builder
            .handle_chain(&FixJob::new(pki.leaf.clone(), pki.full_chain(), roots.clone()))
            .await;
        let repaired = builder
            .handle_chain(&FixJob::new(pki.leaf.clone(), vec![pki.leaf.clone()], roots))
            .await;

        assert_eq!(direct.chains, repaired.chains);
        assert_eq!(stats.snapshot().already_done, 1);
    }

    #[test]
    fn test_construct_reports_break_position() {
        let pki = TestPki::new();
        let (builder, _) = builder(Arc::new(MockFetcher::new()));
        let roots = pki.roots();

        let result = builder.construct(&[pki.leaf.clone(), pki.root.clone()], &roots);
        assert!(matches!(result, Err(ChainBreak::BrokenLink { position: 0, .. })));

        let result = builder.construct(&[pki.leaf.clone()], &roots);
        assert!(matches!(result, Err(ChainBreak::NoPathToRoot { .. })));

        assert_eq!(builder.construct(&[], &roots), Err(ChainBreak::Empty));
        assert_eq!(
            builder.construct(&[pki.leaf.clone(), pki.intermediate.clone()], &roots),
            Ok(())
        );
    }

    #[test]
    fn test_construct_rejects_untrusted_self_signed_tail() {
        let pki = TestPki::new();
        let (builder, _) = builder(Arc::new(MockFetcher::new()));
        let stranger = issue("Stranger Root", &ec_key(), None, true, None);
        let roots = Arc::new(RootPool::new(vec![stranger]).unwrap());

        let result = builder.construct(&pki.full_chain(), &roots);
        assert!(matches!(result, Err(ChainBreak::NoPathToRoot { .. })));
    }
}

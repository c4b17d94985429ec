use std::sync::Arc;

use roots::RootPool;

use crate::stores::{certificates::Certificate, Fingerprint};

pub mod builder;
pub mod errors;
pub mod roots;
pub mod verify;

pub use builder::{ChainBuilder, ChainOutcome};
pub use errors::{FixError, FixErrorType};
pub use verify::{ChainBreak, OpensslVerifier, Verify};

/// One unit of work: a leaf, its leaf-first chain and the roots to anchor it to.
/// Immutable once created.
pub struct FixJob {
    cert: Certificate,
    chain: Vec<Certificate>,
    roots: Arc<RootPool>,
}

impl FixJob {
    /// Consecutive duplicates in `chain` collapse to one entry and the leaf is
    /// put in front when the submitter left it out.
    pub fn new(cert: Certificate, chain: Vec<Certificate>, roots: Arc<RootPool>) -> Self {
        let mut chain = dedup_chain(chain);
        if chain.first() != Some(&cert) {
            chain.insert(0, cert.clone());
        }

        FixJob { cert, chain, roots }
    }

    pub fn cert(&self) -> &Certificate {
        &self.cert
    }

    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    pub fn roots(&self) -> &RootPool {
        &self.roots
    }

    /// Identifies the (leaf, deduplicated chain, root pool) triple
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = openssl::sha::Sha256::new();
        hasher.update(b"job");
        hasher.update(self.cert.id());
        hasher.update(&(self.chain.len() as u64).to_be_bytes());
        for cert in &self.chain {
            hasher.update(cert.id());
        }
        hasher.update(self.roots.identity());

        Fingerprint(hasher.finish())
    }
}

/// Collapse runs of identical certificates into a single entry
pub fn dedup_chain(mut chain: Vec<Certificate>) -> Vec<Certificate> {
    chain.dedup();
    chain
}

/// Identifies a chain on its own, used to spot chains that were already published
pub fn chain_fingerprint(chain: &[Certificate]) -> Fingerprint {
    let mut hasher = openssl::sha::Sha256::new();
    hasher.update(b"chain");
    for cert in chain {
        hasher.update(cert.id());
    }

    Fingerprint(hasher.finish())
}

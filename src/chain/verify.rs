use openssl::{
    error::ErrorStack,
    stack::Stack,
    x509::{X509StoreContext, X509VerifyResult, X509},
};
use thiserror::Error;

use crate::{chain::roots::RootPool, stores::certificates::Certificate};

/// Where a chain stops being verifiable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainBreak {
    #[error("empty chain")]
    Empty,
    #[error("certificate at position {position} ({subject}) is not issued by the next certificate in the chain")]
    BrokenLink { position: usize, subject: String },
    #[error("no path from {subject} to a trusted root")]
    NoPathToRoot { subject: String },
    #[error("chain rejected at depth {depth}: {reason}")]
    Rejected { depth: u32, reason: String },
}

/// Certificate verification capability consumed by the chain builder.
pub trait Verify: Send + Sync + 'static {
    /// `issuer` names `subject`'s issuer and its key produced `subject`'s signature
    fn issued_by(&self, subject: &Certificate, issuer: &Certificate) -> bool;

    /// Full path validation of a leaf-first `chain` against `roots`
    /// (signatures, basic constraints, path length, key usage).
    fn verify_path(&self, chain: &[Certificate], roots: &RootPool) -> Result<(), ChainBreak>;
}

/// `Verify` backed by OpenSSL's X509 store
#[derive(Debug, Clone, Default)]
pub struct OpensslVerifier;

impl OpensslVerifier {
    pub fn new() -> Self {
        OpensslVerifier
    }

    fn store_verify(
        chain: &[Certificate],
        roots: &RootPool,
    ) -> Result<Option<(u32, String)>, ErrorStack> {
        let Some((leaf, rest)) = chain.split_first() else {
            return Ok(Some((0, "empty chain".to_string())));
        };

        let mut untrusted = Stack::<X509>::new()?;
        for cert in rest {
            untrusted.push(cert.x509().to_owned())?;
        }

        let mut context = X509StoreContext::new()?;
        context.init(roots.store(), leaf.x509(), &untrusted, |ctx| {
            if ctx.verify_cert()? {
                return Ok(None);
            }

            Ok(Some((
                ctx.error_depth(),
                ctx.error().error_string().to_string(),
            )))
        })
    }
}

impl Verify for OpensslVerifier {
    fn issued_by(&self, subject: &Certificate, issuer: &Certificate) -> bool {
        if issuer.x509().issued(subject.x509()) != X509VerifyResult::OK {
            return false;
        }

        issuer
            .x509()
            .public_key()
            .and_then(|key| subject.x509().verify(&key))
            .unwrap_or(false)
    }

    fn verify_path(&self, chain: &[Certificate], roots: &RootPool) -> Result<(), ChainBreak> {
        match Self::store_verify(chain, roots) {
            Ok(None) => Ok(()),
            Ok(Some((depth, reason))) => Err(ChainBreak::Rejected { depth, reason }),
            Err(err) => Err(ChainBreak::Rejected {
                depth: 0,
                reason: err.to_string(),
            }),
        }
    }
}

use openssl::{
    error::ErrorStack,
    x509::{
        store::{X509Store, X509StoreBuilder, X509StoreRef},
        verify::X509VerifyFlags,
        X509,
    },
};

use crate::stores::certificates::{CertId, Certificate};

/// Immutable set of trust anchors, shared read-only between workers.
pub struct RootPool {
    roots: Vec<Certificate>,
    store: X509Store,
    identity: [u8; 32],
}

impl RootPool {
    pub fn new(mut roots: Vec<Certificate>) -> Result<Self, ErrorStack> {
        roots.sort_by(|a, b| a.id().cmp(b.id()));
        roots.dedup();

        let mut builder = X509StoreBuilder::new()?;
        // Logs accept expired chains, so validity periods are not enforced
        builder.set_flags(X509VerifyFlags::NO_CHECK_TIME)?;
        for root in &roots {
            builder.add_cert(root.x509().to_owned())?;
        }

        let mut hasher = openssl::sha::Sha256::new();
        for root in &roots {
            hasher.update(root.id());
        }

        Ok(RootPool {
            roots,
            store: builder.build(),
            identity: hasher.finish(),
        })
    }

    /// Build a pool from a PEM bundle of root certificates
    pub fn from_pem(pem: &[u8]) -> Result<Self, ErrorStack> {
        let roots = X509::stack_from_pem(pem)?
            .into_iter()
            .map(Certificate::from_x509)
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(roots)
    }

    pub fn store(&self) -> &X509StoreRef {
        &self.store
    }

    /// Digest over the member certificates, independent of insertion order
    pub fn identity(&self) -> &[u8; 32] {
        &self.identity
    }

    pub fn contains(&self, cert: &Certificate) -> bool {
        self.contains_id(cert.id())
    }

    pub fn contains_id(&self, id: &CertId) -> bool {
        self.roots
            .binary_search_by(|root| root.id().cmp(id))
            .is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.roots.iter()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

//! Throwaway PKI and a scripted fetcher shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    x509::{
        extension::{BasicConstraints, KeyUsage},
        X509Builder, X509Extension, X509NameBuilder,
    },
};

use crate::{
    chain::roots::RootPool,
    services::fetch::{Fetch, FetchError},
    stores::certificates::Certificate,
};

pub const ROOT_URL: &str = "http://pki.chainfix.test/root.der";
pub const INTERMEDIATE_URL: &str = "http://pki.chainfix.test/intermediate.der";

static SERIAL: AtomicU32 = AtomicU32::new(1);

pub fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

/// Issue a certificate for `cn`. Self-signed when `issuer` is `None`.
#[allow(deprecated)]
pub fn issue(
    cn: &str,
    key: &PKey<Private>,
    issuer: Option<(&Certificate, &PKey<Private>)>,
    is_ca: bool,
    ca_issuers: Option<&str>,
) -> Certificate {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    name.append_entry_by_text("O", "Chainfix Test").unwrap();
    let name = name.build();

    let serial = BigNum::from_u32(SERIAL.fetch_add(1, Ordering::Relaxed))
        .unwrap()
        .to_asn1_integer()
        .unwrap();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    match issuer {
        Some((cert, _)) => builder.set_issuer_name(cert.x509().subject_name()),
        None => builder.set_issuer_name(&name),
    }
    .unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();

    if is_ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()
                    .unwrap(),
            )
            .unwrap();
    } else {
        builder
            .append_extension(BasicConstraints::new().build().unwrap())
            .unwrap();
        builder
            .append_extension(KeyUsage::new().digital_signature().build().unwrap())
            .unwrap();
    }

    if let Some(url) = ca_issuers {
        let aia = X509Extension::new_nid(
            None,
            None,
            Nid::INFO_ACCESS,
            &format!("caIssuers;URI:{url}"),
        )
        .unwrap();
        builder.append_extension(aia).unwrap();
    }

    let signing_key = issuer.map_or(key, |(_, issuer_key)| issuer_key);
    builder.sign(signing_key, MessageDigest::sha256()).unwrap();

    Certificate::from_x509(builder.build()).unwrap()
}

/// root -> intermediate -> leaf, each pointing at its issuer through AIA
pub struct TestPki {
    pub root: Certificate,
    pub intermediate: Certificate,
    pub intermediate_key: PKey<Private>,
    pub leaf: Certificate,
}

impl TestPki {
    pub fn new() -> Self {
        Self::with_urls(INTERMEDIATE_URL)
    }

    /// Same shape as `new` but the leaf advertises `leaf_hint` as its issuer URL
    pub fn with_urls(leaf_hint: &str) -> Self {
        let root_key = ec_key();
        let root = issue("Chainfix Test Root", &root_key, None, true, None);

        let intermediate_key = ec_key();
        let intermediate = issue(
            "Chainfix Test Intermediate",
            &intermediate_key,
            Some((&root, &root_key)),
            true,
            Some(ROOT_URL),
        );

        let leaf = issue(
            "leaf.chainfix.test",
            &ec_key(),
            Some((&intermediate, &intermediate_key)),
            false,
            Some(leaf_hint),
        );

        TestPki {
            root,
            intermediate,
            intermediate_key,
            leaf,
        }
    }

    /// Another leaf under the same intermediate
    pub fn issue_leaf(&self, cn: &str) -> Certificate {
        issue(
            cn,
            &ec_key(),
            Some((&self.intermediate, &self.intermediate_key)),
            false,
            Some(INTERMEDIATE_URL),
        )
    }

    pub fn roots(&self) -> Arc<RootPool> {
        Arc::new(RootPool::new(vec![self.root.clone()]).unwrap())
    }

    pub fn full_chain(&self) -> Vec<Certificate> {
        vec![
            self.leaf.clone(),
            self.intermediate.clone(),
            self.root.clone(),
        ]
    }
}

/// Serves canned responses and counts how often each URL was requested
#[derive(Default)]
pub struct MockFetcher {
    responses: HashMap<String, Bytes>,
    calls: DashMap<String, usize>,
    total: AtomicUsize,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, url: &str, body: Bytes) -> Self {
        self.responses.insert(url.to_string(), body);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.get(url).map_or(0, |count| *count)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.entry(url.to_string()).or_insert(0) += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

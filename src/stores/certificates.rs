use std::fmt;

use bytes::Bytes;
use openssl::{
    error::ErrorStack,
    nid::Nid,
    pkcs7::Pkcs7,
    x509::{X509Ref, X509},
};

/// SHA-256 over the DER encoding of a certificate
pub type CertId = [u8; 32];

/// A parsed X509 certificate together with its raw encoding and content digest.
/// Cheap to clone: the `X509` handle is reference counted and the DER is `Bytes`.
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
    der: Bytes,
    id: CertId,
}

impl Certificate {
    pub fn from_x509(x509: X509) -> Result<Self, ErrorStack> {
        let der = Bytes::from(x509.to_der()?);
        let id = openssl::sha::sha256(&der);

        Ok(Certificate { x509, der, id })
    }

    pub fn from_der(der: &[u8]) -> Result<Self, ErrorStack> {
        Self::from_x509(X509::from_der(der)?)
    }

    pub fn x509(&self) -> &X509Ref {
        &self.x509
    }

    pub fn der(&self) -> &Bytes {
        &self.der
    }

    pub fn id(&self) -> &CertId {
        &self.id
    }

    /// `caIssuers` URIs from the Authority Information Access extension
    pub fn issuer_urls(&self) -> Vec<String> {
        let Some(descriptions) = self.x509.authority_info() else {
            return vec![];
        };

        descriptions
            .iter()
            .filter(|desc| desc.method().nid() == Nid::AD_CA_ISSUERS)
            .filter_map(|desc| desc.location().uri().map(str::to_string))
            .collect()
    }

    /// One-line subject name used in logs and error descriptions
    pub fn subject(&self) -> String {
        name_to_string(self.x509.subject_name())
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject())
            .field("issuer", &name_to_string(self.x509.issuer_name()))
            .finish()
    }
}

fn name_to_string(name: &openssl::x509::X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = String::from_utf8_lossy(entry.data().as_slice());
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse every certificate found in `data`.
///
/// Issuer URLs in the wild serve a single DER certificate, a PEM bundle or a
/// PKCS#7 (`.p7c`) bundle, so all three are attempted in that order.
pub fn parse_certificates(data: &[u8]) -> Result<Vec<Certificate>, ErrorStack> {
    if let Ok(cert) = Certificate::from_der(data) {
        return Ok(vec![cert]);
    }

    if data.windows(10).any(|w| w == b"-----BEGIN") {
        return X509::stack_from_pem(data)?
            .into_iter()
            .map(Certificate::from_x509)
            .collect();
    }

    let pkcs7 = Pkcs7::from_der(data)?;
    let Some(certs) = pkcs7.signed().and_then(|signed| signed.certificates()) else {
        return Ok(vec![]);
    };

    certs
        .iter()
        .map(|cert| Certificate::from_x509(cert.to_owned()))
        .collect()
}

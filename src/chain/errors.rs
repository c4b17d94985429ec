use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::stores::certificates::Certificate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FixErrorType {
    /// The chain as submitted does not resolve to a trusted root
    VerifyFailed,
    /// Every discoverable issuer URL was tried without producing a valid chain.
    /// Only ever reported together with `VerifyFailed`.
    FixFailed,
}

impl fmt::Display for FixErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixErrorType::VerifyFailed => f.write_str("VerifyFailed"),
            FixErrorType::FixFailed => f.write_str("FixFailed"),
        }
    }
}

/// A classified failure for one submitted chain, published on the error sink.
#[derive(Error, Debug, Clone)]
#[error("{kind} for {}: {cause}", .cert.subject())]
pub struct FixError {
    pub kind: FixErrorType,
    /// The leaf the job was submitted for
    pub cert: Certificate,
    /// The deduplicated chain as submitted
    pub chain: Vec<Certificate>,
    /// Last issuer URL that was tried, if any
    pub url: Option<String>,
    /// Last payload that could not be parsed as certificates
    pub bad: Option<Bytes>,
    pub cause: String,
}

impl FixError {
    pub fn new(
        kind: FixErrorType,
        cert: &Certificate,
        chain: &[Certificate],
        cause: impl Into<String>,
    ) -> Self {
        FixError {
            kind,
            cert: cert.clone(),
            chain: chain.to_vec(),
            url: None,
            bad: None,
            cause: cause.into(),
        }
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    pub fn with_bad(mut self, bad: Option<Bytes>) -> Self {
        self.bad = bad;
        self
    }
}

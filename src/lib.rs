//! Repairs X.509 certificate chains that do not verify against a trusted
//! root pool by downloading missing issuers from AIA `caIssuers` URLs.
//!
//! Chains are submitted to a [`Fixer`], which runs a fixed pool of workers
//! and publishes every verified or repaired chain (and every failure) to
//! the sinks given at construction.

pub mod chain;
pub mod config;
pub mod fixer;
pub mod services;
pub mod stores;

#[cfg(test)]
mod testing;

pub use chain::{roots::RootPool, FixError, FixErrorType};
pub use fixer::{ChainSink, ErrorSink, Fixer, FixerOptions, StatsSnapshot};
pub use services::fetch::{Fetch, FetchError, HttpFetcher};
pub use stores::certificates::{parse_certificates, Certificate};

pub mod certificates;
pub mod fetch_cache;
pub mod processed;

// Re-export stores
pub use fetch_cache::CertFetchCache;
pub use processed::{Fingerprint, ProcessedSet};

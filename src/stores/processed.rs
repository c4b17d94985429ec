use std::{fmt, hash::Hash};

/// Stable identifier of a piece of work (a job, or a published chain)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Set of keys that have already been handled.
/// Entries are never evicted; the set lives as long as its `Fixer`.
pub struct ProcessedSet<K = Fingerprint> {
    inner: papaya::HashMap<K, ()>,
}

impl<K> ProcessedSet<K>
where
    K: Hash + Eq + Send + Sync + 'static,
{
    pub fn new() -> Self {
        ProcessedSet {
            inner: papaya::HashMap::new(),
        }
    }

    /// Marks `key` as processed and reports whether it already was.
    /// The test and the insert are a single map operation, so of any number
    /// of concurrent callers with the same key exactly one sees `false`.
    pub fn check_and_mark(&self, key: K) -> bool {
        self.inner.pin().insert(key, ()).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.pin().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for ProcessedSet<K>
where
    K: Hash + Eq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

//! Keys and storage for the optional persistent compilation cache.
//!
//! The cache maps a digest of (computation, compile options, backend version)
//! to serialized executables. Storage is an external collaborator; only the
//! trait and an in-memory implementation live here.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tj_runtime::{CompileOptions, Computation};

use crate::digest::bytes_to_hex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistentCacheKey {
    pub namespace: &'static str,
    pub digest_hex: String,
}

impl PersistentCacheKey {
    pub fn new(
        computation: &Computation,
        options: &CompileOptions,
        backend_version: &str,
    ) -> Result<Self, serde_json::Error> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(computation)?);
        hasher.update(b"|options=");
        hasher.update(serde_json::to_vec(options)?);
        hasher.update(b"|backend=");
        hasher.update(backend_version.as_bytes());
        Ok(Self {
            namespace: "tjx",
            digest_hex: bytes_to_hex(&hasher.finalize()),
        })
    }

    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

/// Cross-process store of serialized executables.
pub trait PersistentCache: Send + Sync {
    fn get(&self, key: &PersistentCacheKey) -> Option<Vec<u8>>;

    fn put(&self, key: &PersistentCacheKey, executable: Vec<u8>);
}

#[derive(Debug, Default)]
pub struct InMemoryPersistentCache {
    entries: RwLock<FxHashMap<String, Vec<u8>>>,
}

impl InMemoryPersistentCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl PersistentCache for InMemoryPersistentCache {
    fn get(&self, key: &PersistentCacheKey) -> Option<Vec<u8>> {
        self.entries.read().get(&key.as_string()).cloned()
    }

    fn put(&self, key: &PersistentCacheKey, executable: Vec<u8>) {
        self.entries.write().insert(key.as_string(), executable);
    }
}

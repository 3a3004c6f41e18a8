#![forbid(unsafe_code)]

mod digest;
mod memo;
mod persistent;

pub use digest::{bytes_to_hex, program_digest};
pub use memo::{CacheStats, CompilationCache};
pub use persistent::{InMemoryPersistentCache, PersistentCache, PersistentCacheKey};

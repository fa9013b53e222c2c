pub mod key;
pub mod store;

pub use key::{derive_context_hash, derive_query_hash, normalize_query};
pub use store::{CacheEntry, CacheStats, QueryCacheStore};

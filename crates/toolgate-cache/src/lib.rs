//! Two-tier response cache (C5): an in-process LRU fronting a persistent
//! store, so a restart only loses the memory tier's contents.

pub mod cache;

pub use cache::{CacheEntry, CacheInvalidateFilter, PersistentCacheStore, TwoTierCache};

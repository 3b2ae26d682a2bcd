pub mod balance_cache;

pub use balance_cache::{
    BalanceCacheProjection, BalanceCacheStore, CacheEntry, CacheKey, InMemoryBalanceCache,
    ProjectionError,
};

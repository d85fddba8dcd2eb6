//! Short-lived cache of pre-built trade quotes.
//!
//! A quote arrives from an external pricing service with its swap calldata
//! already built. Quotes go stale quickly, so the cache has a hard TTL and
//! capacity; a trade that references an expired quote must be re-quoted.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::execution::Execution;

/// A pre-built trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub id: String,
    pub execution: Execution,
    /// Token debited from the agent's budget. Native value uses
    /// [`NATIVE_TOKEN`](crate::NATIVE_TOKEN).
    pub token_in: Address,
    pub amount_in: U256,
    /// Contract that pulls `token_in`, when an allowance is required.
    #[serde(default)]
    pub spender: Option<Address>,
    #[serde(default)]
    pub token_out: Option<Address>,
    #[serde(default)]
    pub min_amount_out: Option<U256>,
}

/// Bounded TTL cache of quotes, keyed by quote id.
#[derive(Clone)]
pub struct QuoteCache {
    inner: Cache<String, Arc<Quote>>,
}

impl QuoteCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn insert(&self, quote: Quote) {
        self.inner.insert(quote.id.clone(), Arc::new(quote));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Quote>> {
        self.inner.get(id)
    }

    /// Look up a quote for execution.
    pub fn resolve(&self, id: &str) -> Result<Arc<Quote>> {
        self.get(id)
            .ok_or_else(|| Error::QuoteUnavailable(id.to_string()))
    }

    /// Drop a quote once it has been used.
    pub fn invalidate(&self, id: &str) {
        self.inner.invalidate(id);
    }

    /// Evict expired entries now instead of lazily.
    pub fn sweep(&self) {
        self.inner.run_pending_tasks();
    }

    /// Approximate entry count (exact after [`sweep`](Self::sweep)).
    pub fn len(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(id: &str) -> Quote {
        Quote {
            id: id.to_string(),
            execution: Execution::native_transfer(Address::repeat_byte(1), U256::from(1)),
            token_in: crate::NATIVE_TOKEN,
            amount_in: U256::from(1),
            spender: None,
            token_out: None,
            min_amount_out: None,
        }
    }

    #[test]
    fn test_resolve_and_invalidate() {
        let cache = QuoteCache::new(10, Duration::from_secs(60));
        cache.insert(quote("q1"));
        assert_eq!(cache.resolve("q1").unwrap().id, "q1");
        cache.invalidate("q1");
        assert!(matches!(cache.resolve("q1"), Err(Error::QuoteUnavailable(_))));
    }

    #[test]
    fn test_expired_quote_is_unavailable() {
        let cache = QuoteCache::new(10, Duration::from_millis(20));
        cache.insert(quote("q1"));
        std::thread::sleep(Duration::from_millis(60));
        let err = cache.resolve("q1").unwrap_err();
        assert!(err.to_string().contains("re-quote"));
    }

    #[test]
    fn test_sweep_updates_count() {
        let cache = QuoteCache::new(10, Duration::from_secs(60));
        cache.insert(quote("a"));
        cache.insert(quote("b"));
        cache.sweep();
        assert_eq!(cache.len(), 2);
    }
}

//! Manage provider records: which peers can serve the content under a key.

use std::num::NonZeroUsize;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use rand::{thread_rng, Rng};
use tokio::time::Instant;

use crate::common::PeerId;

pub const MAX_PROVIDER_KEYS: usize = 2000;
pub const MAX_PROVIDERS_PER_KEY: usize = 500;

#[derive(Debug)]
/// An LRU cache of providers per key, each remembered for `validity`.
pub struct Providers {
    keys: LruCache<Bytes, LruCache<PeerId, Instant>>,
    max_providers: NonZeroUsize,
    validity: Duration,
}

impl Providers {
    pub fn new(max_keys: NonZeroUsize, max_providers: NonZeroUsize, validity: Duration) -> Self {
        Self {
            keys: LruCache::new(max_keys),
            max_providers,
            validity,
        }
    }

    pub fn add_provider(&mut self, key: Bytes, provider: PeerId) {
        let now = Instant::now();

        if let Some(providers) = self.keys.get_mut(&key) {
            providers.put(provider, now);
        } else {
            let mut providers = LruCache::new(self.max_providers);
            providers.put(provider, now);
            self.keys.put(key, providers);
        };
    }

    /// Up to `limit` providers of `key`, sampled at random if there are more.
    ///
    /// Expired providers are purged on the way.
    pub fn get_providers(&mut self, key: &[u8], limit: usize) -> Vec<PeerId> {
        let Some(providers) = self.keys.get_mut(key) else {
            return Vec::new();
        };

        let expired: Vec<PeerId> = providers
            .iter()
            .filter(|(_, added)| added.elapsed() >= self.validity)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            providers.pop(id);
        }

        let size = providers.len();

        if size == 0 {
            self.keys.pop(key);
            return Vec::new();
        }

        if size <= limit {
            return providers.iter().map(|(id, _)| id.clone()).collect();
        }

        let mut results = Vec::with_capacity(limit);
        let mut rng = thread_rng();

        for (index, (id, _)) in providers.iter().enumerate() {
            // Chance of picking this one given the remaining slots and items.
            let remaining_slots = limit - results.len();
            let remaining_items = size - index;
            let chance = remaining_slots as f64 / remaining_items as f64;

            if rng.gen_bool(chance) {
                results.push(id.clone());
                if results.len() == limit {
                    break;
                }
            }
        }

        results
    }
}

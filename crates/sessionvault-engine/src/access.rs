//! Read-through access path
//!
//! Resolution order for a key: the queue's pending overlay (newest write
//! not yet committed), then the LRU cache, then the backend. Backend reads
//! populate the cache only if no commit happened while the read was in
//! flight.

use crate::cache::LruCache;
use crate::queue::{OverlayValue, PersistenceQueue};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use sessionvault_common::{Error, Result};
use sessionvault_kv::KvBackend;
use std::sync::Arc;

#[derive(Clone)]
pub struct ReadThrough {
    backend: Arc<dyn KvBackend>,
    cache: Arc<LruCache>,
    queue: PersistenceQueue,
}

impl ReadThrough {
    pub fn new(backend: Arc<dyn KvBackend>, cache: Arc<LruCache>, queue: PersistenceQueue) -> Self {
        Self {
            backend,
            cache,
            queue,
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.queue.overlay_get(key) {
            Some(OverlayValue::Put(value)) => return Ok(Some(value)),
            Some(OverlayValue::Tombstone) => return Ok(None),
            None => {}
        }

        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }

        let generation = self.queue.commit_generation();
        let value = self
            .backend
            .get(key)
            .map_err(|e| Error::transient(format!("read {key}: {e}")))?;
        Ok(value.map(|v| {
            let value = Bytes::from(v);
            self.queue.fill_cache(generation, key, value.clone());
            value
        }))
    }

    /// Read and decode a JSON document
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::corruption(format!("undecodable document {key}: {e}")))
            })
            .transpose()
    }

    /// Read and decode a bincode record
    pub fn get_bincode<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?
            .map(|bytes| {
                bincode::deserialize(&bytes)
                    .map_err(|e| Error::corruption(format!("undecodable record {key}: {e}")))
            })
            .transpose()
    }

    pub const fn queue(&self) -> &PersistenceQueue {
        &self.queue
    }

    pub fn cache(&self) -> &LruCache {
        &self.cache
    }
}

/// Encode a JSON document for the queue
pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode a bincode record for the queue
pub fn encode_bincode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(e.to_string()))
}

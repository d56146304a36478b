//! Memoized measurement predictions
//!
//! Predicting measurements maps every particle through the measurement
//! function, which is repeated for the same prior whenever several
//! detections are scored against it. [`MeasurementPredictionCache`] keeps the
//! most recent results keyed by a fingerprint of the prior and the model.
//!
//! Keys hash the prior's contents together with the model's identity and
//! fingerprint: a prior mutated in place between calls hashes differently
//! and simply misses the cache.

use ::core::fmt;
use ::core::hash::Hasher;
use std::collections::{HashMap, VecDeque};
use std::hash::DefaultHasher;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nalgebra::RealField;
use num_traits::Float;

use crate::models::SharedMeasurementModel;
use crate::types::particles::ParticleState;
use crate::Result;

/// Number of predictions kept by default.
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

struct CacheEntry<V> {
    value: Arc<V>,
    /// Kept alive while the entry exists, so its address cannot be reused
    _owner: Option<Box<dyn Send + Sync>>,
}

struct CacheEntries<V> {
    values: HashMap<u64, CacheEntry<V>>,
    /// Insertion order, oldest first
    order: VecDeque<u64>,
}

/// Bounded FIFO cache of shared predictions.
pub struct MeasurementPredictionCache<V> {
    entries: Mutex<CacheEntries<V>>,
    capacity: usize,
}

impl<V> MeasurementPredictionCache<V> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "Cache capacity must be positive");
        Self {
            entries: Mutex::new(CacheEntries {
                values: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheEntries<V>> {
        // Entries are always left consistent, so a panic elsewhere cannot corrupt them
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: u64) -> Option<Arc<V>> {
        self.lock().values.get(&key).map(|entry| Arc::clone(&entry.value))
    }

    /// Returns the cached value for `key`, computing and storing it on a miss.
    ///
    /// `compute` runs without the lock held. If another caller stored a value
    /// for the same key in the meantime, that value is returned and the fresh
    /// one dropped, so every caller observes the same `Arc`. Errors are
    /// returned without caching anything.
    pub fn get_or_compute<F>(&self, key: u64, compute: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        self.lookup_or_insert(key, None, compute)
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but a newly stored
    /// entry holds on to `owner` until it is evicted.
    ///
    /// Keys that include an address (such as a model's `Arc` pointer) pass
    /// the pointee here so the address stays unique while the entry lives.
    pub fn get_or_compute_owned<O, F>(&self, key: u64, owner: O, compute: F) -> Result<Arc<V>>
    where
        O: Send + Sync + 'static,
        F: FnOnce() -> Result<V>,
    {
        self.lookup_or_insert(key, Some(Box::new(owner)), compute)
    }

    fn lookup_or_insert<F>(
        &self,
        key: u64,
        owner: Option<Box<dyn Send + Sync>>,
        compute: F,
    ) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(hit) = self.get(key) {
            log::trace!("measurement prediction cache hit {:016x}", key);
            return Ok(hit);
        }

        let value = Arc::new(compute()?);

        let mut entries = self.lock();
        if let Some(existing) = entries.values.get(&key) {
            return Ok(Arc::clone(&existing.value));
        }
        while entries.order.len() >= self.capacity {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.values.remove(&oldest);
                }
                None => break,
            }
        }
        entries.order.push_back(key);
        entries.values.insert(
            key,
            CacheEntry {
                value: Arc::clone(&value),
                _owner: owner,
            },
        );
        Ok(value)
    }

    /// Drops every cached prediction.
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.values.clear();
        entries.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<V> Default for MeasurementPredictionCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for MeasurementPredictionCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementPredictionCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Fingerprint of a prediction request.
///
/// `salt` separates caches of different updaters that could otherwise share
/// keys for different kinds of result. The key covers the model's
/// [`fingerprint`](crate::models::MeasurementModel::fingerprint) and the
/// identity of its `Arc`, so two distinct model instances never share an
/// entry even when their fingerprints agree.
pub fn prediction_key<T, const N: usize, const M: usize>(
    salt: &str,
    prediction: &ParticleState<T, N>,
    model: &SharedMeasurementModel<T, N, M>,
) -> u64
where
    T: RealField + Float + Copy,
{
    let mut hasher = DefaultHasher::new();
    hasher.write(salt.as_bytes());
    hasher.write_usize(M);
    prediction.hash_bits(&mut hasher);
    hasher.write_usize(Arc::as_ptr(model) as *const () as usize);
    model.fingerprint(&mut hasher);
    hasher.finish()
}

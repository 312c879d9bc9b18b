//! Generation-scoped memoization of kernel shapes
//!
//! Every kernel-building operation is keyed by a hash of its structural
//! inputs. Each evaluation pass bumps the generation; an entry read or
//! written during the pass is marked with it, and everything left unmarked
//! is evicted when the pass ends.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use cadex_kernel::{Shape, ShapeHash};
use glam::DVec3;
use tracing::debug;

/// Builds a structural key from an operation name and its inputs
#[derive(Debug, Clone)]
pub struct StructuralHasher(DefaultHasher);

impl StructuralHasher {
    pub fn new(operation: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        operation.hash(&mut hasher);
        Self(hasher)
    }

    pub fn float(mut self, value: f64) -> Self {
        // 0.0 and -0.0 build the same geometry
        let value = if value == 0.0 { 0.0 } else { value };
        value.to_bits().hash(&mut self.0);
        self
    }

    pub fn vector(self, v: DVec3) -> Self {
        self.float(v.x).float(v.y).float(v.z)
    }

    pub fn flag(mut self, value: bool) -> Self {
        value.hash(&mut self.0);
        self
    }

    pub fn int(mut self, value: i64) -> Self {
        value.hash(&mut self.0);
        self
    }

    pub fn shape(mut self, hash: ShapeHash) -> Self {
        hash.hash(&mut self.0);
        self
    }

    pub fn finish(self) -> ShapeHash {
        ShapeHash(self.0.finish())
    }
}

#[derive(Debug)]
struct CacheEntry {
    shape: Shape,
    generation: u64,
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evicted: u64,
}

/// Memoization cache owned by the execution context
#[derive(Debug, Default)]
pub struct MemoCache {
    entries: HashMap<ShapeHash, CacheEntry>,
    generation: u64,
    stats: CacheStats,
}

impl MemoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new evaluation pass
    pub fn begin_pass(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Evict every entry not touched during the current pass
    pub fn end_pass(&mut self) -> usize {
        let generation = self.generation;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.generation == generation);
        let evicted = before - self.entries.len();
        self.stats.evicted += evicted as u64;
        if evicted > 0 {
            debug!(
                "Cache evicted {} entries, {} live after pass {}",
                evicted,
                self.entries.len(),
                generation
            );
        }
        evicted
    }

    /// Look up a shape, marking it touched
    pub fn get(&mut self, key: ShapeHash) -> Option<Shape> {
        let generation = self.generation;
        let entry = self.entries.get_mut(&key)?;
        entry.generation = generation;
        Some(entry.shape.clone())
    }

    /// Store a shape under its structural key
    pub fn insert(&mut self, key: ShapeHash, shape: Shape) -> Shape {
        let shape = shape.with_hash(key);
        self.entries.insert(
            key,
            CacheEntry {
                shape: shape.clone(),
                generation: self.generation,
            },
        );
        shape
    }

    /// Return the cached shape or build, store and return a new one
    pub fn get_or_try_insert_with<E>(
        &mut self,
        key: ShapeHash,
        build: impl FnOnce() -> Result<Shape, E>,
    ) -> Result<Shape, E> {
        if let Some(shape) = self.get(key) {
            self.stats.hits += 1;
            debug!("Cache hit {}", key);
            return Ok(shape);
        }
        self.stats.misses += 1;
        debug!("Cache miss {}", key);
        let shape = build()?;
        Ok(self.insert(key, shape))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

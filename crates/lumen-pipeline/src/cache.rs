//! Fixed-size, hash-keyed store of intermediate stage outputs.
//!
//! Each line holds one buffer tagged with the hash of the stage chain
//! and region that produced it. Replacement is least-recently-used with
//! a twist: every acquisition ages *every* line by one, and callers may
//! stamp a line with a negative weight so it survives many rounds of
//! aging before it becomes the eviction candidate.
//!
//! The store is not synchronized; the pipeline only touches it while
//! holding its busy lock.

use serde::{Deserialize, Serialize};

use crate::types::CacheError;

/// Index of a cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineId(usize);

impl LineId {
    /// Position of the line in the store.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct CacheLine {
    /// `None` marks the line as holding nothing reusable.
    hash: Option<u64>,
    data: Vec<f32>,
    /// Recency counter. Larger is older; negative is pinned.
    used: i32,
}

/// The outcome of [`CacheStore::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// The line now tagged with the requested hash.
    pub line: LineId,
    /// Whether the line already held a result for that hash.
    pub hit: bool,
}

/// Snapshot of one line for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStats {
    /// Hash tag, if valid.
    pub hash: Option<u64>,
    /// Recency counter.
    pub used: i32,
    /// Allocated capacity in bytes.
    pub capacity_bytes: usize,
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Acquisitions since the store was created.
    pub queries: u64,
    /// Acquisitions that had to hand out a line without a matching result.
    pub misses: u64,
    /// Per-line state.
    pub lines: Vec<LineStats>,
}

impl CacheStats {
    /// Fraction of acquisitions that were hits, or 0 before the first.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            (self.queries - self.misses) as f64 / self.queries as f64
        }
    }
}

/// Fixed number of reusable buffers keyed by content hash.
#[derive(Debug)]
pub struct CacheStore {
    lines: Vec<CacheLine>,
    queries: u64,
    misses: u64,
}

impl CacheStore {
    /// Allocate `lines` buffers of `line_bytes` bytes each, all invalid.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NoLines`] for `lines == 0` and
    /// [`CacheError::Allocation`] if a buffer cannot be reserved.
    pub fn new(lines: usize, line_bytes: usize) -> Result<Self, CacheError> {
        if lines == 0 {
            return Err(CacheError::NoLines);
        }
        let floats = floats_for(line_bytes);
        let mut store = Vec::with_capacity(lines);
        for _ in 0..lines {
            store.push(CacheLine {
                hash: None,
                data: allocate(floats)?,
                used: 0,
            });
        }
        Ok(Self {
            lines: store,
            queries: 0,
            misses: 0,
        })
    }

    /// Number of lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Always `false`; a store has at least one line.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Weight that keeps a line alive for a full round of acquisitions
    /// over every line.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn important_weight(&self) -> i32 {
        -(self.lines.len() as i32)
    }

    /// Whether any line holds a result for `hash`. Does not age lines.
    #[must_use]
    pub fn contains(&self, hash: u64) -> bool {
        self.lines.iter().any(|line| line.hash == Some(hash))
    }

    /// Return the line for `hash`, claiming the oldest line on a miss.
    ///
    /// Every line ages by one. The returned line's recency is set to
    /// `weight` (0 for normal use, [`important_weight`](Self::important_weight)
    /// to pin it).
    ///
    /// A line is only a hit if it is at least `min_bytes` large; a
    /// smaller line holding the hash is invalidated and the request is
    /// treated as a miss.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Allocation`] if the claimed line must grow
    /// and the allocation fails.
    pub fn acquire(&mut self, hash: u64, min_bytes: usize, weight: i32) -> Result<Acquired, CacheError> {
        self.acquire_protecting(hash, min_bytes, weight, None)
    }

    /// Like [`acquire`](Self::acquire), but never evicts `protect`.
    ///
    /// Used while a stage's input still lives in a line and its output
    /// line is being claimed.
    ///
    /// # Errors
    ///
    /// See [`acquire`](Self::acquire).
    pub fn acquire_protecting(
        &mut self,
        hash: u64,
        min_bytes: usize,
        weight: i32,
        protect: Option<LineId>,
    ) -> Result<Acquired, CacheError> {
        self.queries += 1;
        let min_floats = floats_for(min_bytes);

        let mut oldest: Option<usize> = None;
        let mut max_used = -1;
        let mut found: Option<usize> = None;
        for (k, line) in self.lines.iter_mut().enumerate() {
            let protected = protect.is_some_and(|p| p.0 == k);
            if !protected && line.used > max_used {
                max_used = line.used;
                oldest = Some(k);
            }
            line.used = line.used.saturating_add(1);
            if line.hash == Some(hash) {
                found = Some(k);
                line.used = weight;
            }
        }

        if let Some(k) = found {
            if self.lines[k].data.len() >= min_floats {
                return Ok(Acquired {
                    line: LineId(k),
                    hit: true,
                });
            }
            // Too small to reuse; the replacement below takes the hash.
            self.lines[k].hash = None;
        }

        let k = oldest
            .or_else(|| (0..self.lines.len()).find(|&k| protect.is_none_or(|p| p.0 != k)))
            .unwrap_or(0);
        let line = &mut self.lines[k];
        if line.data.len() < min_floats {
            line.hash = None;
            line.data = allocate(min_floats)?;
        }
        line.hash = Some(hash);
        line.used = weight;
        self.misses += 1;
        Ok(Acquired {
            line: LineId(k),
            hit: false,
        })
    }

    /// Set a line's recency counter.
    pub fn reweight(&mut self, id: LineId, weight: i32) {
        if let Some(line) = self.lines.get_mut(id.0) {
            line.used = weight;
        }
    }

    /// Forget the line's content. The buffer stays allocated.
    pub fn invalidate(&mut self, id: LineId) {
        if let Some(line) = self.lines.get_mut(id.0) {
            line.hash = None;
        }
    }

    /// Forget every line's content and reset recency.
    pub fn flush(&mut self) {
        for line in &mut self.lines {
            line.hash = None;
            line.used = 0;
        }
    }

    /// Hash tag of a line.
    #[must_use]
    pub fn hash_of(&self, id: LineId) -> Option<u64> {
        self.lines.get(id.0).and_then(|line| line.hash)
    }

    /// Borrow a line's buffer.
    #[must_use]
    pub fn line(&self, id: LineId) -> &[f32] {
        self.lines.get(id.0).map_or(&[], |line| line.data.as_slice())
    }

    /// Mutably borrow a line's buffer.
    pub fn line_mut(&mut self, id: LineId) -> &mut [f32] {
        self.lines
            .get_mut(id.0)
            .map_or(&mut [], |line| line.data.as_mut_slice())
    }

    /// Borrow one line for reading and another for writing.
    ///
    /// Returns `None` if both ids name the same line.
    pub fn pair_mut(&mut self, read: LineId, write: LineId) -> Option<(&[f32], &mut [f32])> {
        let (r, w) = (read.0, write.0);
        if r == w || r >= self.lines.len() || w >= self.lines.len() {
            return None;
        }
        if r < w {
            let (head, tail) = self.lines.split_at_mut(w);
            Some((head[r].data.as_slice(), tail[0].data.as_mut_slice()))
        } else {
            let (head, tail) = self.lines.split_at_mut(r);
            Some((tail[0].data.as_slice(), head[w].data.as_mut_slice()))
        }
    }

    /// Snapshot the counters and line states.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            queries: self.queries,
            misses: self.misses,
            lines: self
                .lines
                .iter()
                .map(|line| LineStats {
                    hash: line.hash,
                    used: line.used,
                    capacity_bytes: line.data.len() * std::mem::size_of::<f32>(),
                })
                .collect(),
        }
    }
}

fn floats_for(bytes: usize) -> usize {
    bytes.div_ceil(std::mem::size_of::<f32>())
}

fn allocate(floats: usize) -> Result<Vec<f32>, CacheError> {
    let mut data = Vec::new();
    data.try_reserve_exact(floats)
        .map_err(|_| CacheError::Allocation {
            bytes: floats * std::mem::size_of::<f32>(),
        })?;
    data.resize(floats, 0.0);
    Ok(data)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn new_rejects_zero_lines() {
        assert_eq!(CacheStore::new(0, 16).unwrap_err(), CacheError::NoLines);
    }

    #[test]
    fn fresh_store_holds_nothing() {
        let store = CacheStore::new(3, 64).unwrap();
        assert!(!store.contains(0));
        let stats = store.stats();
        assert_eq!(stats.lines.len(), 3);
        assert!(stats.lines.iter().all(|l| l.hash.is_none() && l.used == 0));
        assert!(stats.hit_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn miss_then_hit_returns_same_line() {
        let mut store = CacheStore::new(3, 64).unwrap();
        let first = store.acquire(11, 64, 0).unwrap();
        assert!(!first.hit);
        let second = store.acquire(11, 64, 0).unwrap();
        assert!(second.hit);
        assert_eq!(first.line, second.line);
        let stats = store.stats();
        assert_eq!(stats.queries, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn contains_does_not_age() {
        let mut store = CacheStore::new(2, 16).unwrap();
        store.acquire(1, 16, 0).unwrap();
        let before = store.stats();
        assert!(store.contains(1));
        assert!(!store.contains(2));
        assert_eq!(store.stats(), before);
    }

    #[test]
    fn hits_age_every_other_line() {
        let mut store = CacheStore::new(3, 16).unwrap();
        let a = store.acquire(1, 16, 0).unwrap().line;
        let b = store.acquire(2, 16, 0).unwrap().line;
        // Three hits on `a` age `b` by three.
        for _ in 0..3 {
            assert!(store.acquire(1, 16, 0).unwrap().hit);
        }
        let stats = store.stats();
        assert_eq!(stats.lines[a.index()].used, 0);
        assert_eq!(stats.lines[b.index()].used, 3);
    }

    #[test]
    fn oldest_line_is_evicted_first_wins_ties() {
        let mut store = CacheStore::new(3, 16).unwrap();
        // All lines start at 0: the first line wins the tie.
        assert_eq!(store.acquire(1, 16, 0).unwrap().line.index(), 0);
        assert_eq!(store.acquire(2, 16, 0).unwrap().line.index(), 1);
        assert_eq!(store.acquire(3, 16, 0).unwrap().line.index(), 2);
        // Line 0 is now the oldest.
        let next = store.acquire(4, 16, 0).unwrap();
        assert_eq!(next.line.index(), 0);
        assert!(!store.contains(1));
    }

    #[test]
    fn pinned_line_survives_until_aged_past_zero() {
        let mut store = CacheStore::new(2, 16).unwrap();
        let weight = store.important_weight();
        let pinned = store.acquire(1, 16, weight).unwrap().line;
        // Two further acquisitions age the pinned line from -2 to 0.
        store.acquire(2, 16, 0).unwrap();
        store.acquire(3, 16, 0).unwrap();
        assert!(store.contains(1));
        assert_eq!(store.hash_of(pinned), Some(1));
    }

    #[test]
    fn protected_line_is_never_chosen() {
        let mut store = CacheStore::new(2, 16).unwrap();
        let input = store.acquire(1, 16, 0).unwrap().line;
        store.acquire(2, 16, 0).unwrap();
        // Age the input so it would be the normal victim.
        store.acquire(2, 16, 0).unwrap();
        let out = store.acquire_protecting(3, 16, 0, Some(input)).unwrap();
        assert_ne!(out.line, input);
        assert!(store.contains(1));
    }

    #[test]
    fn undersized_hit_is_a_miss_and_keeps_one_line_per_hash() {
        let mut store = CacheStore::new(3, 16).unwrap();
        store.acquire(5, 16, 0).unwrap();
        let grown = store.acquire(5, 64, 0).unwrap();
        assert!(!grown.hit);
        assert!(store.line(grown.line).len() >= 16);
        let tagged = store.stats().lines.iter().filter(|l| l.hash == Some(5)).count();
        assert_eq!(tagged, 1);
    }

    #[test]
    fn invalidate_and_flush_drop_tags() {
        let mut store = CacheStore::new(2, 16).unwrap();
        let a = store.acquire(1, 16, 0).unwrap().line;
        store.acquire(2, 16, 0).unwrap();
        store.invalidate(a);
        assert!(!store.contains(1));
        assert!(store.contains(2));
        store.flush();
        assert!(!store.contains(2));
        assert!(store.stats().lines.iter().all(|l| l.used == 0));
    }

    #[test]
    fn pair_mut_splits_lines() {
        let mut store = CacheStore::new(2, 16).unwrap();
        let a = store.acquire(1, 16, 0).unwrap().line;
        let b = store.acquire(2, 16, 0).unwrap().line;
        store.line_mut(a)[0] = 3.0;
        let (read, write) = store.pair_mut(a, b).unwrap();
        write[0] = read[0] * 2.0;
        assert!((store.line(b)[0] - 6.0).abs() < f32::EPSILON);
        assert!(store.pair_mut(a, a).is_none());
    }

    proptest! {
        /// Every valid hash tags at most one line, whatever the
        /// sequence of requests.
        #[test]
        fn at_most_one_line_per_hash(
            requests in proptest::collection::vec((0u64..6, 1usize..8, -3i32..2), 1..60),
        ) {
            let mut store = CacheStore::new(4, 16).unwrap();
            for (hash, floats, weight) in requests {
                store.acquire(hash, floats * 4, weight).unwrap();
                let stats = store.stats();
                for h in 0..6 {
                    let count = stats.lines.iter().filter(|l| l.hash == Some(h)).count();
                    prop_assert!(count <= 1);
                }
            }
        }

        /// An acquisition hands back a line tagged with the requested
        /// hash, large enough for the request.
        #[test]
        fn acquired_line_is_tagged_and_sized(
            requests in proptest::collection::vec((0u64..10, 1usize..32), 1..40),
        ) {
            let mut store = CacheStore::new(3, 16).unwrap();
            for (hash, floats) in requests {
                let acquired = store.acquire(hash, floats * 4, 0).unwrap();
                prop_assert_eq!(store.hash_of(acquired.line), Some(hash));
                prop_assert!(store.line(acquired.line).len() >= floats);
            }
        }

        /// Repeating a request immediately is always a hit and leaves
        /// the miss counter alone.
        #[test]
        fn immediate_repeat_hits(
            hashes in proptest::collection::vec(0u64..100, 1..30),
        ) {
            let mut store = CacheStore::new(2, 16).unwrap();
            for hash in hashes {
                store.acquire(hash, 16, 0).unwrap();
                let misses = store.stats().misses;
                prop_assert!(store.acquire(hash, 16, 0).unwrap().hit);
                prop_assert_eq!(store.stats().misses, misses);
            }
        }
    }
}

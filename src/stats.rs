//! Usage statistics for cached pipeline states.
//!
//! Two representations exist. [`PipelineStateStats`] is the live, lock-free
//! counter block the renderer updates every frame through an `Arc` it holds
//! onto; it lives outside the cache lock entirely. [`EntryStats`] is the plain
//! snapshot that travels through the table of contents on disk.

use std::sync::atomic::{AtomicI64, Ordering};

/// Entry flag: the pipeline failed compilation and must be excluded from
/// ordered enumeration and pre-compile fetches.
pub const ENGINE_FLAG_INVALID: u16 = 1 << 0;

/// Persisted usage snapshot for one table-of-contents entry.
///
/// A `total_bind_count` of `-1` marks an entry that is known to the cache but
/// has never been bound by any session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryStats {
    pub first_frame_used: i64,
    pub last_frame_used: i64,
    pub create_count: i64,
    pub total_bind_count: i64,
}

impl Default for EntryStats {
    fn default() -> Self {
        EntryStats {
            first_frame_used: -1,
            last_frame_used: -1,
            create_count: 0,
            total_bind_count: -1,
        }
    }
}

impl EntryStats {
    /// A fresh entry created this session: one creation, nothing bound yet.
    pub fn new_this_session(frame: i64) -> Self {
        EntryStats {
            first_frame_used: frame,
            last_frame_used: frame,
            create_count: 1,
            total_bind_count: 0,
        }
    }

    pub fn was_ever_bound(&self) -> bool {
        self.total_bind_count > 0
    }

    /// Fold a live session delta into this snapshot.
    pub fn accumulate(&mut self, delta: &EntryStats) {
        if delta.first_frame_used >= 0 {
            if self.first_frame_used < 0 || delta.first_frame_used < self.first_frame_used {
                self.first_frame_used = delta.first_frame_used;
            }
        }
        if delta.last_frame_used > self.last_frame_used {
            self.last_frame_used = delta.last_frame_used;
        }
        self.create_count += delta.create_count;
        if delta.total_bind_count > 0 {
            self.total_bind_count = self.total_bind_count.max(0) + delta.total_bind_count;
        }
    }

    /// Merge two independently recorded snapshots of the same pipeline.
    /// Bind and create counts sum; frame stamps take the widest span.
    pub fn merge(&mut self, other: &EntryStats) {
        if other.first_frame_used >= 0 {
            if self.first_frame_used < 0 || other.first_frame_used < self.first_frame_used {
                self.first_frame_used = other.first_frame_used;
            }
        }
        if other.last_frame_used > self.last_frame_used {
            self.last_frame_used = other.last_frame_used;
        }
        self.create_count += other.create_count;
        if other.total_bind_count >= 0 {
            self.total_bind_count = self.total_bind_count.max(0) + other.total_bind_count;
        }
    }
}

/// Live per-pipeline counters, shared with the renderer via `Arc`.
///
/// Every field is independently atomic. Bind recording is wait-free except
/// for the first-frame stamp, which uses a single compare-exchange to claim
/// the unset slot.
#[derive(Debug)]
pub struct PipelineStateStats {
    pub(crate) hash: u32,
    first_frame_used: AtomicI64,
    last_frame_used: AtomicI64,
    create_count: AtomicI64,
    total_bind_count: AtomicI64,
}

impl PipelineStateStats {
    pub(crate) fn new(hash: u32) -> Self {
        PipelineStateStats {
            hash,
            first_frame_used: AtomicI64::new(-1),
            last_frame_used: AtomicI64::new(-1),
            create_count: AtomicI64::new(1),
            total_bind_count: AtomicI64::new(0),
        }
    }

    /// Counter block for a pipeline that was bound without being created
    /// this session, i.e. one restored straight from the cache.
    pub(crate) fn bind_only(hash: u32) -> Self {
        PipelineStateStats {
            create_count: AtomicI64::new(0),
            ..Self::new(hash)
        }
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Record one bind at the given frame number.
    pub fn record_bind(&self, frame: i64) {
        self.last_frame_used.store(frame, Ordering::Relaxed);
        self.total_bind_count.fetch_add(1, Ordering::Relaxed);
        // First writer claims the unset (-1) slot; losers already have a
        // valid earlier stamp in place.
        let _ = self.first_frame_used.compare_exchange(
            -1,
            frame,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Another creation of an already-registered pipeline this session.
    pub(crate) fn record_create(&self) {
        self.create_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters for a save. Values may lag concurrent binds by
    /// design; the next save picks the stragglers up.
    pub fn snapshot(&self) -> EntryStats {
        EntryStats {
            first_frame_used: self.first_frame_used.load(Ordering::Relaxed),
            last_frame_used: self.last_frame_used.load(Ordering::Relaxed),
            create_count: self.create_count.load(Ordering::Relaxed),
            total_bind_count: self.total_bind_count.load(Ordering::Relaxed),
        }
    }

    pub fn total_bind_count(&self) -> i64 {
        self.total_bind_count.load(Ordering::Relaxed)
    }
}

//! Runtime cache manager.
//!
//! [`FileCacheManager`] is the surface the renderer talks to: one explicit
//! context object per cache, no global state. All TOC-touching state sits
//! behind a single `parking_lot::RwLock`; per-pipeline bind counters live on
//! separately allocated [`PipelineStateStats`] blocks so the per-frame bind
//! path never takes the lock at all.
//!
//! `record_use` is the discovery hot path. It takes an upgradable read and
//! only upgrades to a write when something actually changes; the upgrade is
//! atomic, so no other writer can slip in between the check and the
//! mutation.

use crate::codec::SortOrder;
use crate::descriptor::PipelineDescriptor;
use crate::error::{CacheError, Result};
use crate::fetch::{spawn_fetch, FetchJob, FetchStream};
use crate::file::{CacheFile, PendingEntry, SaveMode};
use crate::stats::{EntryStats, PipelineStateStats, ENGINE_FLAG_INVALID};
use ahash::{AHashMap, AHashSet};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decides whether an entry's persisted usage mask satisfies the session
/// mask during ordered enumeration.
pub type UsageMaskComparator = fn(entry_mask: u64, session_mask: u64) -> bool;

/// Default comparator: a zero session mask matches everything, otherwise any
/// overlapping bit qualifies.
pub fn default_mask_comparator(entry_mask: u64, session_mask: u64) -> bool {
    session_mask == 0 || entry_mask & session_mask != 0
}

/// Where a cache lives and what it must match.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Shipped content-tier file, if the title provides one.
    pub content_path: Option<PathBuf>,
    /// Canonical user-tier file; created on first save.
    pub user_path: PathBuf,
    /// Target for [`SaveMode::BoundOnly`] recordings.
    pub recording_path: Option<PathBuf>,
    pub game_version: u32,
    pub platform: u8,
}

struct NewEntry {
    descriptor: PipelineDescriptor,
    usage_mask: u64,
    engine_flags: u16,
}

struct ManagerState {
    file: CacheFile,
    recording_path: Option<PathBuf>,
    /// Pipelines discovered this session, keyed by structural hash, not yet
    /// written to any file.
    new_entries: AHashMap<u32, NewEntry>,
    /// Live counters for every pipeline seen this session.
    registry: AHashMap<u32, Arc<PipelineStateStats>>,
    /// Cheap per-session index: runtime hash to structural hash, with the
    /// descriptor retained to catch runtime-hash collisions by equality.
    runtime_index: AHashMap<u64, (u32, PipelineDescriptor)>,
    /// Stat snapshot as of the last committed save, per hash. Deltas are
    /// computed against this so repeated saves never double-count.
    committed: AHashMap<u32, EntryStats>,
    session_mask: u64,
    mask_cmp: UsageMaskComparator,
}

const COMMIT_BASE: EntryStats = EntryStats {
    first_frame_used: -1,
    last_frame_used: -1,
    create_count: 0,
    total_bind_count: 0,
};

/// One pipeline file cache: open, record, enumerate, fetch, save.
///
/// All methods are callable from any thread. Methods on a closed manager
/// are no-ops rather than errors, so teardown ordering stays forgiving.
pub struct FileCacheManager {
    state: RwLock<Option<ManagerState>>,
    frame: AtomicI64,
}

impl Default for FileCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCacheManager {
    pub fn new() -> Self {
        FileCacheManager {
            state: RwLock::new(None),
            frame: AtomicI64::new(0),
        }
    }

    /// Open the cache described by `config`. Returns the content file's GUID
    /// when a content tier was found and loaded.
    pub fn open(&self, config: CacheConfig) -> Result<Option<u128>> {
        let mut guard = self.state.write();
        if guard.is_some() {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "cache is already open",
            )));
        }

        let file = CacheFile::open(
            config.content_path.as_deref(),
            &config.user_path,
            config.game_version,
            config.platform,
        )?;
        let content_guid = file.content_guid();

        *guard = Some(ManagerState {
            file,
            recording_path: config.recording_path,
            new_entries: AHashMap::new(),
            registry: AHashMap::new(),
            runtime_index: AHashMap::new(),
            committed: AHashMap::new(),
            session_mask: 0,
            mask_cmp: default_mask_comparator,
        });
        Ok(content_guid)
    }

    /// Drop all cache state. Unsaved session data is discarded; callers
    /// wanting it persisted save first.
    pub fn close(&self) {
        if let Some(state) = self.state.write().take() {
            info!(
                entries = state.file.len(),
                unsaved = state.new_entries.len(),
                "closed pipeline cache"
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    /// Pipelines currently known: persisted entries plus this session's
    /// discoveries.
    pub fn pipeline_count(&self) -> usize {
        match self.state.read().as_ref() {
            Some(state) => state.file.len() + state.new_entries.len(),
            None => 0,
        }
    }

    /// Bump the frame counter `record_stats` stamps binds with. Call once
    /// per rendered frame.
    pub fn advance_frame(&self) {
        self.frame.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame(&self) -> i64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// Session mask OR'd into every recorded usage, and the comparator
    /// `request_ordered` filters with.
    pub fn set_usage_mask(&self, mask: u64, cmp: Option<UsageMaskComparator>) {
        if let Some(state) = self.state.write().as_mut() {
            state.session_mask = mask;
            if let Some(cmp) = cmp {
                state.mask_cmp = cmp;
            }
        }
    }

    /// Record that `descriptor` was used to create a pipeline this frame.
    ///
    /// Unknown descriptors are verified and become new cache entries; known
    /// ones get their usage mask widened and their create count bumped. The
    /// common case (seen before, mask unchanged) stays on the read side of
    /// the lock.
    pub fn record_use(&self, descriptor: &PipelineDescriptor, usage_bits: u64) -> Result<()> {
        let runtime_hash = descriptor.runtime_hash();
        let guard = self.state.upgradable_read();
        let state = match guard.as_ref() {
            Some(state) => state,
            None => return Ok(()),
        };

        if let Some((hash, stored)) = state.runtime_index.get(&runtime_hash) {
            if stored == descriptor {
                let hash = *hash;
                let bits = usage_bits | state.session_mask;
                if let Some(stats) = state.registry.get(&hash) {
                    stats.record_create();
                }
                let mask_complete = match state.new_entries.get(&hash) {
                    Some(entry) => entry.usage_mask | bits == entry.usage_mask,
                    None => state
                        .file
                        .lookup(hash)
                        .map(|meta| meta.usage_mask | bits == meta.usage_mask)
                        .unwrap_or(true),
                };
                if !mask_complete {
                    let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
                    if let Some(state) = guard.as_mut() {
                        match state.new_entries.get_mut(&hash) {
                            Some(entry) => entry.usage_mask |= bits,
                            None => {
                                state.file.merge_usage(hash, bits);
                            }
                        }
                    }
                }
                return Ok(());
            }
            // Runtime-hash collision; resolve through the structural hash.
        }

        let hash = descriptor.structural_hash();
        let bits = usage_bits | state.session_mask;
        let known = state.file.contains(hash) || state.new_entries.contains_key(&hash);
        if !known && !descriptor.verify() {
            return Err(CacheError::InvalidDescriptor);
        }

        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return Ok(()),
        };

        if known {
            // First sighting this session of an already persisted pipeline.
            match state.new_entries.get_mut(&hash) {
                Some(entry) => entry.usage_mask |= bits,
                None => {
                    state.file.merge_usage(hash, bits);
                }
            }
            match state.registry.get(&hash) {
                Some(stats) => stats.record_create(),
                None => {
                    state
                        .registry
                        .insert(hash, Arc::new(PipelineStateStats::new(hash)));
                }
            }
        } else {
            debug!(hash, "recording new pipeline state");
            state.new_entries.insert(
                hash,
                NewEntry {
                    descriptor: descriptor.clone(),
                    usage_mask: bits,
                    engine_flags: 0,
                },
            );
            state
                .registry
                .insert(hash, Arc::new(PipelineStateStats::new(hash)));
        }
        state
            .runtime_index
            .insert(runtime_hash, (hash, descriptor.clone()));
        Ok(())
    }

    /// Flag a recorded pipeline as failed-to-compile so it is excluded from
    /// enumeration and fetches. The descriptor must have been recorded
    /// first.
    pub fn record_compile_failure(&self, descriptor: &PipelineDescriptor) -> Result<()> {
        let hash = descriptor.structural_hash();
        let mut guard = self.state.write();
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return Ok(()),
        };
        if let Some(entry) = state.new_entries.get_mut(&hash) {
            entry.engine_flags |= ENGINE_FLAG_INVALID;
            warn!(hash, "pipeline flagged invalid after compile failure");
            return Ok(());
        }
        if state.file.mark_invalid(hash) {
            warn!(hash, "pipeline flagged invalid after compile failure");
            return Ok(());
        }
        Err(CacheError::UnknownPipeline(hash))
    }

    /// Live stats block for a recorded pipeline. The renderer holds the
    /// `Arc` and records binds on it without ever taking the cache lock.
    pub fn register_stats(&self, hash: u32) -> Option<Arc<PipelineStateStats>> {
        self.state.read().as_ref()?.registry.get(&hash).cloned()
    }

    /// Record one bind of `hash` at the current frame. Returns false for
    /// hashes the cache has never heard of.
    pub fn record_stats(&self, hash: u32) -> bool {
        if let Some(stats) = self.register_stats(hash) {
            stats.record_bind(self.frame());
            return true;
        }
        // First bind of a pipeline restored straight from the cache, with
        // no record_use this session.
        let mut guard = self.state.write();
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return false,
        };
        if !state.file.contains(hash) {
            return false;
        }
        let stats = state
            .registry
            .entry(hash)
            .or_insert_with(|| Arc::new(PipelineStateStats::bind_only(hash)));
        stats.record_bind(self.frame());
        true
    }

    /// Whether any persisted or session-recorded pipeline references the
    /// given shader.
    pub fn references_shader(&self, shader: &crate::descriptor::ShaderHash) -> bool {
        match self.state.read().as_ref() {
            Some(state) => {
                state.file.references_shader(shader)
                    || state.new_entries.values().any(|entry| {
                        entry.descriptor.referenced_shaders().contains(shader)
                    })
            }
            None => false,
        }
    }

    /// Persisted hashes in the requested order, filtered by bind count, the
    /// session usage mask, and the caller's exclusion set.
    pub fn request_ordered(
        &self,
        order: SortOrder,
        min_bind_count: i64,
        exclude: &AHashSet<u32>,
    ) -> Vec<u32> {
        let mut guard = self.state.write();
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return Vec::new(),
        };
        let mask = state.session_mask;
        let cmp = state.mask_cmp;
        state
            .file
            .ordered_hashes(order, min_bind_count, &|entry_mask| cmp(entry_mask, mask), exclude)
    }

    /// Start a background fetch of descriptor blobs for `hashes`. Unknown,
    /// invalid-flagged, or unresolvable hashes complete immediately with
    /// `valid == false`.
    pub fn fetch(&self, hashes: &[u32]) -> FetchStream {
        let guard = self.state.read();
        let state = match guard.as_ref() {
            Some(state) => state,
            None => return spawn_fetch(hashes.to_vec(), Vec::new()),
        };

        let mut invalid = Vec::new();
        let mut jobs = Vec::new();
        for &hash in hashes {
            match state.file.lookup(hash) {
                Some(meta) if meta.engine_flags & ENGINE_FLAG_INVALID == 0 => {
                    match state.file.path_for_guid(meta.file_guid) {
                        Some(path) => jobs.push(FetchJob {
                            hash,
                            path: path.to_path_buf(),
                            offset: meta.file_offset,
                            size: meta.file_size,
                        }),
                        None => invalid.push(hash),
                    }
                }
                _ => invalid.push(hash),
            }
        }
        spawn_fetch(invalid, jobs)
    }

    /// Save per `mode`. Returns true when a file was written, false when
    /// there was nothing to do.
    ///
    /// Runs under the write lock, so pipeline discovery briefly blocks;
    /// bind recording does not, since it never takes the lock.
    pub fn save(&self, mode: SaveMode, order: SortOrder) -> Result<bool> {
        let mut guard = self.state.write();
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return Ok(false),
        };

        let mut pending = Vec::with_capacity(state.new_entries.len());
        let mut pending_snaps: AHashMap<u32, EntryStats> = AHashMap::new();
        for (&hash, entry) in &state.new_entries {
            let stats = match state.registry.get(&hash) {
                Some(stats) => stats.snapshot(),
                None => EntryStats::default(),
            };
            pending_snaps.insert(hash, stats);
            pending.push(PendingEntry {
                hash,
                descriptor: entry.descriptor.clone(),
                usage_mask: entry.usage_mask,
                engine_flags: entry.engine_flags,
                stats,
            });
        }

        let mut deltas = Vec::new();
        let mut delta_snaps: AHashMap<u32, EntryStats> = AHashMap::new();
        for (&hash, stats) in &state.registry {
            if state.new_entries.contains_key(&hash) {
                continue;
            }
            let snap = stats.snapshot();
            let base = state.committed.get(&hash).copied().unwrap_or(COMMIT_BASE);
            let bind_delta = snap.total_bind_count - base.total_bind_count;
            let create_delta = snap.create_count - base.create_count;
            if bind_delta <= 0 && create_delta <= 0 {
                continue;
            }
            deltas.push((
                hash,
                EntryStats {
                    first_frame_used: snap.first_frame_used,
                    last_frame_used: snap.last_frame_used,
                    create_count: create_delta,
                    total_bind_count: bind_delta,
                },
            ));
            delta_snaps.insert(hash, snap);
        }

        let outcome = state.file.save(
            mode,
            order,
            &pending,
            &deltas,
            state.recording_path.as_deref(),
        )?;

        // BoundOnly leaves canonical state untouched and consumes nothing.
        if mode != SaveMode::BoundOnly && outcome.wrote {
            for hash in &outcome.consumed {
                state.new_entries.remove(hash);
                if let Some(snap) = pending_snaps.get(hash) {
                    state.committed.insert(*hash, *snap);
                }
            }
            for (hash, snap) in delta_snaps {
                state.committed.insert(hash, snap);
            }
        }
        Ok(outcome.wrote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::test_support::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            content_path: None,
            user_path: dir.path().join("user.pipecache"),
            recording_path: Some(dir.path().join("recording.pipecache")),
            game_version: 1,
            platform: 0,
        }
    }

    fn open_manager(dir: &TempDir) -> FileCacheManager {
        let manager = FileCacheManager::new();
        manager.open(config(dir)).unwrap();
        manager
    }

    #[test]
    fn test_open_twice_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        assert!(manager.open(config(&dir)).is_err());
        manager.close();
        assert!(!manager.is_open());
        assert!(manager.open(config(&dir)).is_ok());
    }

    #[test]
    fn test_closed_manager_noops() {
        let manager = FileCacheManager::new();
        let desc = PipelineDescriptor::compute(shader(0x01));
        assert!(manager.record_use(&desc, 1).is_ok());
        assert_eq!(manager.pipeline_count(), 0);
        assert!(!manager.record_stats(desc.structural_hash()));
        assert!(manager
            .request_ordered(SortOrder::Unsorted, 0, &AHashSet::new())
            .is_empty());
    }

    #[test]
    fn test_record_use_dedups_reordered_vertex_layout() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);

        let a = PipelineDescriptor::graphics(sample_graphics());
        let mut reordered = sample_graphics();
        reordered.vertex_layout.reverse();
        let b = PipelineDescriptor::graphics(reordered);

        manager.record_use(&a, 1).unwrap();
        manager.record_use(&b, 1).unwrap();
        assert_eq!(manager.pipeline_count(), 1);

        let stats = manager.register_stats(a.structural_hash()).unwrap();
        assert_eq!(stats.snapshot().create_count, 2);
    }

    #[test]
    fn test_record_use_rejects_unverifiable_descriptor() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let bad = PipelineDescriptor::compute(crate::descriptor::ShaderHash::ZERO);
        assert!(matches!(
            manager.record_use(&bad, 1),
            Err(CacheError::InvalidDescriptor)
        ));
        assert_eq!(manager.pipeline_count(), 0);
    }

    #[test]
    fn test_compile_failure_requires_prior_record() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let desc = PipelineDescriptor::compute(shader(0x05));
        assert!(matches!(
            manager.record_compile_failure(&desc),
            Err(CacheError::UnknownPipeline(_))
        ));
        manager.record_use(&desc, 1).unwrap();
        assert!(manager.record_compile_failure(&desc).is_ok());
    }

    #[test]
    fn test_invalid_entries_hidden_from_request_ordered() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let good = PipelineDescriptor::compute(shader(0x11));
        let bad = PipelineDescriptor::compute(shader(0x12));
        for desc in [&good, &bad] {
            manager.record_use(desc, 1).unwrap();
            manager.record_stats(desc.structural_hash());
        }
        manager.record_compile_failure(&bad).unwrap();
        manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap();

        let hashes = manager.request_ordered(SortOrder::MostToLeastUsed, 0, &AHashSet::new());
        assert_eq!(hashes, vec![good.structural_hash()]);
    }

    #[test]
    fn test_save_consumes_bound_entries_once() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let desc = PipelineDescriptor::compute(shader(0x21));
        manager.record_use(&desc, 1).unwrap();
        manager.record_stats(desc.structural_hash());

        assert!(manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap());
        // Nothing new happened since; the second save is a no-op.
        assert!(!manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap());
    }

    #[test]
    fn test_save_does_not_double_count_binds() {
        let dir = TempDir::new().unwrap();
        let user_path = dir.path().join("user.pipecache");
        let manager = open_manager(&dir);
        let desc = PipelineDescriptor::compute(shader(0x31));
        let hash = desc.structural_hash();

        manager.record_use(&desc, 1).unwrap();
        manager.record_stats(hash);
        manager.record_stats(hash);
        manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap();

        manager.record_stats(hash);
        manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap();
        manager.close();

        let file = CacheFile::open(None, &user_path, 1, 0).unwrap();
        assert_eq!(file.lookup(hash).unwrap().stats.total_bind_count, 3);
    }

    #[test]
    fn test_usage_mask_ored_into_recordings() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        manager.set_usage_mask(0b100, None);
        let desc = PipelineDescriptor::compute(shader(0x41));
        manager.record_use(&desc, 0b001).unwrap();
        manager.record_stats(desc.structural_hash());
        manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap();
        manager.close();

        let file = CacheFile::open(None, &dir.path().join("user.pipecache"), 1, 0).unwrap();
        assert_eq!(
            file.lookup(desc.structural_hash()).unwrap().usage_mask,
            0b101
        );
    }

    #[test]
    fn test_mask_comparator_filters_enumeration() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let a = PipelineDescriptor::compute(shader(0x51));
        let b = PipelineDescriptor::compute(shader(0x52));
        manager.record_use(&a, 0b01).unwrap();
        manager.record_use(&b, 0b10).unwrap();
        for desc in [&a, &b] {
            manager.record_stats(desc.structural_hash());
        }
        manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap();

        manager.set_usage_mask(0b01, None);
        let hashes = manager.request_ordered(SortOrder::MostToLeastUsed, 0, &AHashSet::new());
        assert_eq!(hashes, vec![a.structural_hash()]);

        // Require every session bit instead of any.
        manager.set_usage_mask(0b11, Some(|entry, session| entry & session == session));
        assert!(manager
            .request_ordered(SortOrder::MostToLeastUsed, 0, &AHashSet::new())
            .is_empty());
    }

    #[test]
    fn test_fetch_round_trips_saved_descriptor() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let desc = PipelineDescriptor::graphics(sample_graphics());
        let hash = desc.structural_hash();
        manager.record_use(&desc, 1).unwrap();
        manager.record_stats(hash);
        manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap();

        let results: Vec<_> = manager.fetch(&[hash, 0xDEAD]).collect();
        assert_eq!(results.len(), 2);
        let hit = results.iter().find(|r| r.hash == hash).unwrap();
        assert!(hit.valid);
        assert_eq!(hit.descriptor.as_ref().unwrap(), &desc);
        let miss = results.iter().find(|r| r.hash == 0xDEAD).unwrap();
        assert!(!miss.valid);
    }

    #[test]
    fn test_bind_without_record_use_still_counts() {
        let dir = TempDir::new().unwrap();
        let desc = PipelineDescriptor::compute(shader(0x65));
        let hash = desc.structural_hash();

        {
            let manager = open_manager(&dir);
            manager.record_use(&desc, 1).unwrap();
            manager.record_stats(hash);
            manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap();
            manager.close();
        }

        // Next session binds the cached pipeline without recreating it.
        let manager = open_manager(&dir);
        assert!(manager.record_stats(hash));
        assert!(manager.save(SaveMode::Incremental, SortOrder::Unsorted).unwrap());
        manager.close();

        let file = CacheFile::open(None, &dir.path().join("user.pipecache"), 1, 0).unwrap();
        let stats = file.lookup(hash).unwrap().stats;
        assert_eq!(stats.total_bind_count, 2);
        // Created once ever, in the first session.
        assert_eq!(stats.create_count, 1);
    }

    #[test]
    fn test_references_shader_covers_session_entries() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let desc = PipelineDescriptor::compute(shader(0x71));
        assert!(!manager.references_shader(&shader(0x71)));
        manager.record_use(&desc, 1).unwrap();
        // Not yet saved, still discoverable.
        assert!(manager.references_shader(&shader(0x71)));
    }

    #[test]
    fn test_advance_frame_stamps_binds() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        let desc = PipelineDescriptor::compute(shader(0x61));
        manager.record_use(&desc, 1).unwrap();

        manager.advance_frame();
        manager.advance_frame();
        manager.record_stats(desc.structural_hash());

        let stats = manager.register_stats(desc.structural_hash()).unwrap();
        assert_eq!(stats.snapshot().first_frame_used, 2);
    }
}

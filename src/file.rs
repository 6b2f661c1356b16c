//! On-disk cache state: two-tier open, merged table of contents, save modes.
//!
//! A cache is the overlay of two physical files. The content tier ships with
//! the title and is read-only; the user tier accumulates pipelines discovered
//! at runtime. Both share one wire format. The merged TOC keeps one entry per
//! structural hash, with user entries winning for shared hashes so live usage
//! masks survive, except that a user entry pointing at a file GUID this
//! session cannot resolve is stale and loses to the content entry (or is
//! dropped when no content entry exists).
//!
//! Saves never write in place. The full output image is built in memory,
//! written to a temp file and renamed over the target, with a journal marker
//! bracketing writes to the canonical user file so a crash mid-save is
//! detected at the next open.

use crate::codec::{CacheHeader, EntryMetadata, SortOrder, Toc};
use crate::descriptor::PipelineDescriptor;
use crate::error::{CacheError, Result};
use crate::stats::{EntryStats, ENGINE_FLAG_INVALID};
use ahash::{AHashMap, AHashSet};
use std::cmp::Reverse;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What a save writes and where.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveMode {
    /// Append newly bound pipelines to the user file and rewrite the TOC.
    /// Existing blob bytes are preserved byte-for-byte.
    Incremental,
    /// Write everything bound this session to a side recording file under a
    /// fresh GUID, stats folded in. The canonical user file is untouched.
    BoundOnly,
    /// Full rebuild of the user file in the requested order, dropping
    /// never-bound and unresolvable entries.
    SortedBound,
}

/// A pipeline recorded this session, not yet written to any file.
#[derive(Clone, Debug)]
pub struct PendingEntry {
    pub hash: u32,
    pub descriptor: PipelineDescriptor,
    pub usage_mask: u64,
    pub engine_flags: u16,
    pub stats: EntryStats,
}

/// Result of a save: whether anything was written, and which pending entries
/// were consumed into the canonical file.
#[derive(Debug, Default)]
pub struct SaveOutcome {
    pub wrote: bool,
    pub consumed: Vec<u32>,
}

struct LoadedTier {
    guid: u128,
    toc_offset: u64,
    sort_order: SortOrder,
    entries: Vec<(u32, EntryMetadata)>,
}

/// Merged two-tier cache state for one game version + platform.
pub struct CacheFile {
    game_version: u32,
    platform: u8,
    user_path: PathBuf,
    user_guid: u128,
    /// End of the user file's blob region, or `None` when no user file
    /// exists on disk yet.
    user_toc_offset: Option<u64>,
    content_guid: Option<u128>,
    /// Shipped baseline, kept aside so save modes can consult it.
    content_entries: AHashMap<u32, EntryMetadata>,
    /// The effective TOC.
    entries: AHashMap<u32, EntryMetadata>,
    order: Vec<u32>,
    sorted_as: SortOrder,
    paths_by_guid: AHashMap<u128, PathBuf>,
    /// Usage masks or flags changed since the last committed save.
    dirty: bool,
}

impl CacheFile {
    /// Open both tiers and build the merged TOC. Returns the content file's
    /// GUID when a content tier was loaded.
    ///
    /// A leftover journal file means the previous save died between journal
    /// creation and rename; the user file's state is unknowable, so it is
    /// discarded. Format mismatches make a tier absent; a corrupt user TOC
    /// additionally deletes the damaged file.
    pub fn open(
        content_path: Option<&Path>,
        user_path: &Path,
        game_version: u32,
        platform: u8,
    ) -> Result<Self> {
        let journal = journal_path(user_path);
        if journal.exists() {
            warn!(path = %user_path.display(), "found save journal, discarding user cache");
            remove_if_present(user_path)?;
            remove_if_present(&journal)?;
        }

        let content = match content_path {
            Some(path) => load_tier(path, game_version, platform, "content")?,
            None => None,
        };

        let user = match load_tier(user_path, game_version, platform, "user")? {
            Some(tier) => Some(tier),
            None => {
                // Absent or unusable. If the file physically exists it failed
                // validation and will be replaced by the next save.
                remove_if_present(user_path)?;
                None
            }
        };

        let content_guid = content.as_ref().map(|tier| tier.guid);
        let user_guid = match &user {
            Some(tier) => tier.guid,
            None => rand::random::<u128>(),
        };

        let mut paths_by_guid = AHashMap::new();
        if let (Some(guid), Some(path)) = (content_guid, content_path) {
            paths_by_guid.insert(guid, path.to_path_buf());
        }
        if user.is_some() {
            paths_by_guid.insert(user_guid, user_path.to_path_buf());
        }

        let content_entries: AHashMap<u32, EntryMetadata> = content
            .as_ref()
            .map(|tier| tier.entries.iter().cloned().collect())
            .unwrap_or_default();

        let mut entries: AHashMap<u32, EntryMetadata> = AHashMap::new();
        let mut order = Vec::new();
        let mut sorted_as = SortOrder::Unsorted;
        let mut stale = 0usize;

        if let Some(tier) = &user {
            sorted_as = tier.sort_order;
            for (hash, meta) in &tier.entries {
                let resolvable = meta.file_guid == user_guid
                    || Some(meta.file_guid) == content_guid;
                if resolvable {
                    entries.insert(*hash, meta.clone());
                    order.push(*hash);
                } else if let Some(shipped) = content_entries.get(hash) {
                    // Stale user record; fall back to the shipped entry.
                    entries.insert(*hash, shipped.clone());
                    order.push(*hash);
                    stale += 1;
                } else {
                    stale += 1;
                }
            }
        }
        if stale > 0 {
            warn!(count = stale, "dropped user entries with unresolvable file GUIDs");
        }

        let mut content_only = 0usize;
        for (hash, meta) in &content_entries {
            if !entries.contains_key(hash) {
                entries.insert(*hash, meta.clone());
                order.push(*hash);
                content_only += 1;
            }
        }
        if content_only > 0 {
            // Appended hashes invalidate whatever order the user TOC carried.
            sorted_as = SortOrder::Unsorted;
        }

        info!(
            entries = entries.len(),
            content = content_entries.len(),
            game_version,
            platform,
            "opened pipeline cache"
        );

        Ok(CacheFile {
            game_version,
            platform,
            user_path: user_path.to_path_buf(),
            user_guid,
            user_toc_offset: user.as_ref().map(|tier| tier.toc_offset),
            content_guid,
            content_entries,
            entries,
            order,
            sorted_as,
            paths_by_guid,
            dirty: false,
        })
    }

    pub fn content_guid(&self) -> Option<u128> {
        self.content_guid
    }

    pub fn user_guid(&self) -> u128 {
        self.user_guid
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn lookup(&self, hash: u32) -> Option<&EntryMetadata> {
        self.entries.get(&hash)
    }

    pub(crate) fn path_for_guid(&self, guid: u128) -> Option<&Path> {
        self.paths_by_guid.get(&guid).map(PathBuf::as_path)
    }

    /// Whether any entry references the given shader. Served from the
    /// denormalized per-entry shader sets, no blob decoding involved.
    pub fn references_shader(&self, shader: &crate::descriptor::ShaderHash) -> bool {
        self.entries
            .values()
            .any(|meta| meta.shaders.contains(shader))
    }

    /// OR usage bits into an existing entry. Returns false for unknown
    /// hashes.
    pub(crate) fn merge_usage(&mut self, hash: u32, usage_bits: u64) -> bool {
        match self.entries.get_mut(&hash) {
            Some(meta) => {
                let merged = meta.usage_mask | usage_bits;
                if merged != meta.usage_mask {
                    meta.usage_mask = merged;
                    self.dirty = true;
                }
                true
            }
            None => false,
        }
    }

    /// Flag an existing entry as failed-to-compile.
    pub(crate) fn mark_invalid(&mut self, hash: u32) -> bool {
        match self.entries.get_mut(&hash) {
            Some(meta) => {
                if meta.engine_flags & ENGINE_FLAG_INVALID == 0 {
                    meta.engine_flags |= ENGINE_FLAG_INVALID;
                    self.dirty = true;
                }
                true
            }
            None => false,
        }
    }

    /// Hashes in the requested order, filtered for pre-compilation.
    ///
    /// Invalid-flagged entries never appear. `min_bind_count` drops rarely
    /// used pipelines, `mask_allows` filters on the persisted usage mask, and
    /// `exclude` removes pipelines the caller already compiled. The sort is
    /// cached; repeated requests with the same order reuse it.
    pub fn ordered_hashes(
        &mut self,
        order: SortOrder,
        min_bind_count: i64,
        mask_allows: &dyn Fn(u64) -> bool,
        exclude: &AHashSet<u32>,
    ) -> Vec<u32> {
        if order != SortOrder::Unsorted && order != self.sorted_as {
            let entries = &self.entries;
            match order {
                SortOrder::FirstToLatestUsed => self.order.sort_by_key(|hash| {
                    let stats = &entries[hash].stats;
                    (stats.first_frame_used, Reverse(stats.total_bind_count))
                }),
                SortOrder::MostToLeastUsed => self.order.sort_by_key(|hash| {
                    let stats = &entries[hash].stats;
                    (Reverse(stats.total_bind_count), stats.first_frame_used)
                }),
                SortOrder::Unsorted => {}
            }
            self.sorted_as = order;
        }

        self.order
            .iter()
            .filter(|hash| {
                let meta = &self.entries[*hash];
                meta.engine_flags & ENGINE_FLAG_INVALID == 0
                    && meta.stats.total_bind_count >= min_bind_count
                    && mask_allows(meta.usage_mask)
                    && !exclude.contains(*hash)
            })
            .copied()
            .collect()
    }

    /// Save per `mode`. `pending` are this session's new pipelines and
    /// `deltas` the per-hash stat changes since the last committed save;
    /// both are the caller's snapshot, taken under its own lock.
    ///
    /// `recording_path` is the BoundOnly target and ignored otherwise.
    pub fn save(
        &mut self,
        mode: SaveMode,
        order: SortOrder,
        pending: &[PendingEntry],
        deltas: &[(u32, EntryStats)],
        recording_path: Option<&Path>,
    ) -> Result<SaveOutcome> {
        match mode {
            SaveMode::BoundOnly => {
                let target = recording_path.ok_or_else(|| {
                    CacheError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "BoundOnly save requires a recording path",
                    ))
                })?;
                self.save_bound_only(target, pending, deltas)
            }
            SaveMode::Incremental => self.save_incremental(order, pending, deltas),
            SaveMode::SortedBound => self.save_sorted(order, pending, deltas),
        }
    }

    fn save_incremental(
        &mut self,
        order: SortOrder,
        pending: &[PendingEntry],
        deltas: &[(u32, EntryStats)],
    ) -> Result<SaveOutcome> {
        let bound: Vec<&PendingEntry> = pending
            .iter()
            .filter(|entry| entry.stats.was_ever_bound())
            .collect();
        let has_deltas = deltas.iter().any(|(hash, _)| self.entries.contains_key(hash));
        let order_changed = order != SortOrder::Unsorted && order != self.sorted_as;

        if bound.is_empty() && !has_deltas && !order_changed && !self.dirty {
            debug!("incremental save skipped, nothing changed");
            return Ok(SaveOutcome::default());
        }

        let mut entries = self.entries.clone();
        apply_deltas(&mut entries, deltas);

        // Preserve the existing blob region byte-for-byte; new blobs go
        // after it.
        let mut image = match self.user_toc_offset {
            Some(toc_offset) => {
                let mut file = File::open(&self.user_path)?;
                let mut prefix = vec![0u8; toc_offset as usize];
                file.read_exact(&mut prefix)?;
                prefix
            }
            None => CacheHeader {
                game_version: self.game_version,
                platform: self.platform,
                guid: self.user_guid,
                toc_offset: 0,
            }
            .to_bytes()
            .to_vec(),
        };

        let mut consumed = Vec::with_capacity(bound.len());
        let mut new_order = self.order.clone();
        for entry in &bound {
            let blob = crate::codec::encode_descriptor(&entry.descriptor);
            let meta = EntryMetadata {
                file_offset: image.len() as u64,
                file_size: blob.len() as u64,
                file_guid: self.user_guid,
                stats: entry.stats,
                shaders: entry.descriptor.referenced_shaders().into_iter().collect(),
                usage_mask: entry.usage_mask,
                engine_flags: entry.engine_flags,
            };
            image.extend_from_slice(&blob);
            if entries.insert(entry.hash, meta).is_none() {
                new_order.push(entry.hash);
            }
            consumed.push(entry.hash);
        }

        let sorted_as = sort_for_save(&mut new_order, &entries, order, self.sorted_as);
        let toc_offset = image.len() as u64;
        let toc = Toc {
            sort_order: sorted_as,
            entries: new_order
                .iter()
                .map(|hash| (*hash, entries[hash].clone()))
                .collect(),
        };
        image.extend_from_slice(&toc.encode(self.user_guid));
        patch_toc_offset(&mut image, toc_offset);

        self.write_canonical(&image)?;

        info!(
            appended = consumed.len(),
            total = entries.len(),
            "incremental cache save"
        );

        self.entries = entries;
        self.order = new_order;
        self.sorted_as = sorted_as;
        self.user_toc_offset = Some(toc_offset);
        self.paths_by_guid
            .insert(self.user_guid, self.user_path.clone());
        self.dirty = false;

        Ok(SaveOutcome {
            wrote: true,
            consumed,
        })
    }

    fn save_sorted(
        &mut self,
        order: SortOrder,
        pending: &[PendingEntry],
        deltas: &[(u32, EntryStats)],
    ) -> Result<SaveOutcome> {
        let mut entries = self.entries.clone();
        apply_deltas(&mut entries, deltas);

        let mut image = CacheHeader {
            game_version: self.game_version,
            platform: self.platform,
            guid: self.user_guid,
            toc_offset: 0,
        }
        .to_bytes()
        .to_vec();

        let mut user_file = match self.user_toc_offset {
            Some(_) => Some(File::open(&self.user_path)?),
            None => None,
        };

        // User-owned blobs are rewritten at fresh offsets; content-owned
        // entries stay references into the shipped file.
        let mut kept: AHashMap<u32, EntryMetadata> = AHashMap::new();
        let mut dropped = 0usize;
        for (hash, meta) in &entries {
            if !meta.stats.was_ever_bound() {
                dropped += 1;
                continue;
            }
            if Some(meta.file_guid) == self.content_guid {
                kept.insert(*hash, meta.clone());
            } else if meta.file_guid == self.user_guid {
                let file = match user_file.as_mut() {
                    Some(file) => file,
                    None => {
                        dropped += 1;
                        continue;
                    }
                };
                let blob = read_blob(file, meta.file_offset, meta.file_size)?;
                let mut meta = meta.clone();
                meta.file_offset = image.len() as u64;
                image.extend_from_slice(&blob);
                kept.insert(*hash, meta);
            } else {
                dropped += 1;
            }
        }

        let mut consumed = Vec::new();
        for entry in pending {
            if !entry.stats.was_ever_bound() {
                continue;
            }
            let blob = crate::codec::encode_descriptor(&entry.descriptor);
            kept.insert(
                entry.hash,
                EntryMetadata {
                    file_offset: image.len() as u64,
                    file_size: blob.len() as u64,
                    file_guid: self.user_guid,
                    stats: entry.stats,
                    shaders: entry.descriptor.referenced_shaders().into_iter().collect(),
                    usage_mask: entry.usage_mask,
                    engine_flags: entry.engine_flags,
                },
            );
            image.extend_from_slice(&blob);
            consumed.push(entry.hash);
        }

        let mut new_order: Vec<u32> = kept.keys().copied().collect();
        let sorted_as = sort_for_save(&mut new_order, &kept, order, SortOrder::Unsorted);

        let toc_offset = image.len() as u64;
        let toc = Toc {
            sort_order: sorted_as,
            entries: new_order
                .iter()
                .map(|hash| (*hash, kept[hash].clone()))
                .collect(),
        };
        image.extend_from_slice(&toc.encode(self.user_guid));
        patch_toc_offset(&mut image, toc_offset);

        self.write_canonical(&image)?;

        info!(
            kept = kept.len(),
            dropped,
            appended = consumed.len(),
            "sorted cache rebuild"
        );

        self.entries = kept;
        self.order = new_order;
        self.sorted_as = sorted_as;
        self.user_toc_offset = Some(toc_offset);
        self.paths_by_guid
            .insert(self.user_guid, self.user_path.clone());
        self.dirty = false;

        Ok(SaveOutcome {
            wrote: true,
            consumed,
        })
    }

    /// Side recording file: everything bound this session, every blob
    /// rewritten under a fresh GUID. Leaves in-memory state untouched so a
    /// later canonical save still commits the session normally.
    fn save_bound_only(
        &self,
        target: &Path,
        pending: &[PendingEntry],
        deltas: &[(u32, EntryStats)],
    ) -> Result<SaveOutcome> {
        let delta_by_hash: AHashMap<u32, EntryStats> = deltas.iter().copied().collect();
        let recording_guid = rand::random::<u128>();

        let mut image = CacheHeader {
            game_version: self.game_version,
            platform: self.platform,
            guid: recording_guid,
            toc_offset: 0,
        }
        .to_bytes()
        .to_vec();

        let mut files: AHashMap<u128, File> = AHashMap::new();
        let mut toc_entries: Vec<(u32, EntryMetadata)> = Vec::new();
        let mut skipped = 0usize;

        for (hash, meta) in &self.entries {
            let delta = match delta_by_hash.get(hash) {
                Some(delta) if delta.total_bind_count > 0 => delta,
                _ => continue,
            };
            let path = match self.paths_by_guid.get(&meta.file_guid) {
                Some(path) => path.clone(),
                None => {
                    skipped += 1;
                    continue;
                }
            };
            let file = match files.entry(meta.file_guid) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(File::open(&path)?)
                }
            };
            let blob = read_blob(file, meta.file_offset, meta.file_size)?;
            let mut meta = meta.clone();
            meta.stats.accumulate(delta);
            meta.file_guid = recording_guid;
            meta.file_offset = image.len() as u64;
            image.extend_from_slice(&blob);
            toc_entries.push((*hash, meta));
        }

        for entry in pending {
            if !entry.stats.was_ever_bound() {
                continue;
            }
            let blob = crate::codec::encode_descriptor(&entry.descriptor);
            toc_entries.push((
                entry.hash,
                EntryMetadata {
                    file_offset: image.len() as u64,
                    file_size: blob.len() as u64,
                    file_guid: recording_guid,
                    stats: entry.stats,
                    shaders: entry.descriptor.referenced_shaders().into_iter().collect(),
                    usage_mask: entry.usage_mask,
                    engine_flags: entry.engine_flags,
                },
            ));
        }

        if toc_entries.is_empty() {
            debug!("bound-only save skipped, nothing bound this session");
            return Ok(SaveOutcome::default());
        }

        let toc_offset = image.len() as u64;
        let toc = Toc {
            sort_order: SortOrder::Unsorted,
            entries: toc_entries,
        };
        image.extend_from_slice(&toc.encode(recording_guid));
        patch_toc_offset(&mut image, toc_offset);

        write_atomic(target, &image)?;
        info!(
            path = %target.display(),
            entries = toc.entries.len(),
            skipped,
            "wrote bound-only recording"
        );

        // Nothing consumed: the canonical state is unchanged.
        Ok(SaveOutcome {
            wrote: true,
            consumed: Vec::new(),
        })
    }

    /// Temp-write, then rename onto the user file with the journal
    /// bracketing only the rename. A crash before the journal exists leaves
    /// the previous file untouched and recoverable; a crash inside the
    /// bracket discards the target at the next open.
    fn write_canonical(&self, image: &[u8]) -> Result<()> {
        let tmp = self.user_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(image)?;
            file.sync_all()?;
        }
        let journal = journal_path(&self.user_path);
        fs::write(&journal, &image[..CacheHeader::SIZE])?;
        fs::rename(&tmp, &self.user_path)?;
        fs::remove_file(&journal)?;
        Ok(())
    }
}

fn apply_deltas(entries: &mut AHashMap<u32, EntryMetadata>, deltas: &[(u32, EntryStats)]) {
    for (hash, delta) in deltas {
        if let Some(meta) = entries.get_mut(hash) {
            meta.stats.accumulate(delta);
        }
    }
}

/// Sort `order` for persistence, returning the tag to record in the TOC.
pub(crate) fn sort_for_save(
    order_vec: &mut [u32],
    entries: &AHashMap<u32, EntryMetadata>,
    requested: SortOrder,
    current: SortOrder,
) -> SortOrder {
    match requested {
        SortOrder::Unsorted => {
            // Appends above may have broken a previously sorted order.
            if current == SortOrder::Unsorted {
                current
            } else {
                SortOrder::Unsorted
            }
        }
        SortOrder::FirstToLatestUsed => {
            order_vec.sort_by_key(|hash| {
                let stats = &entries[hash].stats;
                (stats.first_frame_used, Reverse(stats.total_bind_count))
            });
            requested
        }
        SortOrder::MostToLeastUsed => {
            order_vec.sort_by_key(|hash| {
                let stats = &entries[hash].stats;
                (Reverse(stats.total_bind_count), stats.first_frame_used)
            });
            requested
        }
    }
}

fn patch_toc_offset(image: &mut [u8], toc_offset: u64) {
    // toc_offset is the last header field.
    let at = CacheHeader::SIZE - 8;
    image[at..at + 8].copy_from_slice(&toc_offset.to_le_bytes());
}

fn read_blob(file: &mut File, offset: u64, size: u64) -> Result<Vec<u8>> {
    let len = file.metadata()?.len();
    if offset.checked_add(size).map_or(true, |end| end > len) {
        return Err(CacheError::CorruptToc("blob range past end of file".into()));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut blob = vec![0u8; size as usize];
    file.read_exact(&mut blob)?;
    Ok(blob)
}

fn write_atomic(target: &Path, image: &[u8]) -> Result<()> {
    let tmp = target.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(image)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, target)?;
    Ok(())
}

pub(crate) fn journal_path(user_path: &Path) -> PathBuf {
    let mut name = user_path.as_os_str().to_os_string();
    name.push(".jnl");
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Load one tier. `None` means "treat as absent": missing file, format
/// mismatch, or damage. Damage is logged; validation failures are expected
/// after upgrades and only logged at debug.
fn load_tier(
    path: &Path,
    game_version: u32,
    platform: u8,
    tier: &'static str,
) -> Result<Option<LoadedTier>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if bytes.len() < CacheHeader::SIZE {
        warn!(tier, path = %path.display(), "cache file shorter than header");
        return Ok(None);
    }

    let header = match CacheHeader::from_bytes(&bytes, game_version, platform) {
        Ok(header) => header,
        Err(err) if err.is_format_mismatch() => {
            debug!(tier, path = %path.display(), %err, "cache file fails validation");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    if header.toc_offset as usize >= bytes.len() {
        warn!(tier, path = %path.display(), "TOC offset past end of file");
        return Ok(None);
    }

    match Toc::decode(&bytes[header.toc_offset as usize..]) {
        Ok(toc) => Ok(Some(LoadedTier {
            guid: header.guid,
            toc_offset: header.toc_offset,
            sort_order: toc.sort_order,
            entries: toc.entries,
        })),
        Err(err) => {
            warn!(tier, path = %path.display(), %err, "corrupt cache TOC");
            Ok(None)
        }
    }
}

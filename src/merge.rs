//! Offline cache tooling: whole-file load, cache authoring, two-file merge.
//!
//! These run outside the live cache, typically in a build pipeline. The
//! authoring path produces the content-tier files shipped with a title; the
//! merge path combines recordings gathered from separate sessions or
//! machines into one cache.

use crate::codec::{
    decode_descriptor, encode_descriptor, CacheHeader, EntryMetadata, SortOrder, Toc,
};
use crate::descriptor::PipelineDescriptor;
use crate::error::{CacheError, Result};
use crate::file::sort_for_save;
use crate::stats::{EntryStats, ENGINE_FLAG_INVALID};
use ahash::AHashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// One cache file loaded eagerly: header, TOC, and the descriptor bytes of
/// every entry the file itself owns.
pub struct CacheFileData {
    pub header: CacheHeader,
    pub sort_order: SortOrder,
    pub entries: Vec<(u32, EntryMetadata)>,
    /// Blob bytes by hash. Entries owned by other files, or whose blobs fail
    /// to decode, have no bytes here.
    pub blobs: AHashMap<u32, Vec<u8>>,
}

impl CacheFileData {
    /// Load a cache file without checking game version or platform; callers
    /// that care compare the headers themselves.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let header = CacheHeader::from_bytes_any(&bytes)?;
        if header.toc_offset as usize >= bytes.len() {
            return Err(CacheError::CorruptToc("TOC offset past end of file".into()));
        }
        let toc = Toc::decode(&bytes[header.toc_offset as usize..])?;

        let mut blobs = AHashMap::with_capacity(toc.entries.len());
        let mut undecodable = 0usize;
        for (hash, meta) in &toc.entries {
            if meta.file_guid != header.guid {
                continue;
            }
            let end = match meta.file_offset.checked_add(meta.file_size) {
                Some(end) if end <= bytes.len() as u64 => end as usize,
                _ => {
                    undecodable += 1;
                    continue;
                }
            };
            let blob = &bytes[meta.file_offset as usize..end];
            match decode_descriptor(blob) {
                Ok(_) => {
                    blobs.insert(*hash, blob.to_vec());
                }
                Err(_) => undecodable += 1,
            }
        }
        if undecodable > 0 {
            warn!(
                path = %path.display(),
                count = undecodable,
                "skipped undecodable descriptor blobs"
            );
        }

        Ok(CacheFileData {
            header,
            sort_order: toc.sort_order,
            entries: toc.entries,
            blobs,
        })
    }
}

/// Author a fresh single-GUID cache file from a descriptor set. Used to
/// produce content-tier caches during cooking. Returns the file's GUID.
pub fn write_cache_file(
    path: &Path,
    pipelines: &[(PipelineDescriptor, EntryStats, u64)],
    game_version: u32,
    platform: u8,
) -> Result<u128> {
    let guid = rand::random::<u128>();
    let mut image = CacheHeader {
        game_version,
        platform,
        guid,
        toc_offset: 0,
    }
    .to_bytes()
    .to_vec();

    let mut toc_entries = Vec::with_capacity(pipelines.len());
    for (descriptor, stats, usage_mask) in pipelines {
        if !descriptor.verify() {
            return Err(CacheError::InvalidDescriptor);
        }
        let blob = encode_descriptor(descriptor);
        toc_entries.push((
            descriptor.structural_hash(),
            EntryMetadata {
                file_offset: image.len() as u64,
                file_size: blob.len() as u64,
                file_guid: guid,
                stats: *stats,
                shaders: descriptor.referenced_shaders().into_iter().collect(),
                usage_mask: *usage_mask,
                engine_flags: 0,
            },
        ));
        image.extend_from_slice(&blob);
    }

    let toc_offset = image.len() as u64;
    let toc = Toc {
        sort_order: SortOrder::Unsorted,
        entries: toc_entries,
    };
    image.extend_from_slice(&toc.encode(guid));
    let at = CacheHeader::SIZE - 8;
    image[at..at + 8].copy_from_slice(&toc_offset.to_le_bytes());

    write_atomic(path, &image)?;
    info!(path = %path.display(), entries = pipelines.len(), "wrote cache file");
    Ok(guid)
}

/// Merge two cache files into `out`, rewriting every blob under a fresh
/// GUID in the requested order. Returns the merged entry count.
///
/// Invalid-flagged entries and entries whose descriptor bytes cannot be
/// located are dropped. For hashes present in both inputs the usage masks
/// OR together, bind and create counts sum, and the frame stamps take the
/// widest span.
pub fn merge_cache_files(
    a: &Path,
    b: &Path,
    order: SortOrder,
    out: &Path,
) -> Result<usize> {
    let first = CacheFileData::load(a)?;
    let second = CacheFileData::load(b)?;

    if first.header.game_version != second.header.game_version {
        return Err(CacheError::GameVersionMismatch {
            found: second.header.game_version,
            expected: first.header.game_version,
        });
    }
    if first.header.platform != second.header.platform {
        return Err(CacheError::PlatformMismatch {
            found: second.header.platform,
            expected: first.header.platform,
        });
    }

    let mut merged: AHashMap<u32, EntryMetadata> = AHashMap::new();
    let mut blobs: AHashMap<u32, Vec<u8>> = AHashMap::new();
    let mut dropped = 0usize;

    for source in [&first, &second] {
        for (hash, meta) in &source.entries {
            if meta.engine_flags & ENGINE_FLAG_INVALID != 0 {
                dropped += 1;
                continue;
            }
            let blob = match source.blobs.get(hash) {
                Some(blob) => blob,
                None => {
                    dropped += 1;
                    continue;
                }
            };
            match merged.get_mut(hash) {
                Some(existing) => {
                    existing.stats.merge(&meta.stats);
                    existing.usage_mask |= meta.usage_mask;
                    existing.shaders.extend(meta.shaders.iter().copied());
                }
                None => {
                    merged.insert(*hash, meta.clone());
                    blobs.insert(*hash, blob.clone());
                }
            }
        }
    }

    let guid = rand::random::<u128>();
    let mut image = CacheHeader {
        game_version: first.header.game_version,
        platform: first.header.platform,
        guid,
        toc_offset: 0,
    }
    .to_bytes()
    .to_vec();

    let mut order_vec: Vec<u32> = merged.keys().copied().collect();
    let sorted_as = sort_for_save(&mut order_vec, &merged, order, SortOrder::Unsorted);

    let mut toc_entries = Vec::with_capacity(order_vec.len());
    for hash in &order_vec {
        let blob = &blobs[hash];
        let mut meta = merged[hash].clone();
        meta.file_guid = guid;
        meta.file_offset = image.len() as u64;
        meta.file_size = blob.len() as u64;
        image.extend_from_slice(blob);
        toc_entries.push((*hash, meta));
    }

    let toc_offset = image.len() as u64;
    let toc = Toc {
        sort_order: sorted_as,
        entries: toc_entries,
    };
    image.extend_from_slice(&toc.encode(guid));
    let at = CacheHeader::SIZE - 8;
    image[at..at + 8].copy_from_slice(&toc_offset.to_le_bytes());

    write_atomic(out, &image)?;
    info!(
        entries = order_vec.len(),
        dropped,
        out = %out.display(),
        "merged cache files"
    );
    Ok(order_vec.len())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::test_support::*;
    use tempfile::TempDir;

    fn bound_stats(binds: i64) -> EntryStats {
        EntryStats {
            first_frame_used: 1,
            last_frame_used: 10,
            create_count: 1,
            total_bind_count: binds,
        }
    }

    #[test]
    fn test_write_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("content.pipecache");

        let graphics = PipelineDescriptor::graphics(sample_graphics());
        let compute = PipelineDescriptor::compute(shader(0x01));
        let guid = write_cache_file(
            &path,
            &[
                (graphics.clone(), bound_stats(5), 0b01),
                (compute.clone(), bound_stats(2), 0b10),
            ],
            7,
            1,
        )
        .unwrap();

        let data = CacheFileData::load(&path).unwrap();
        assert_eq!(data.header.guid, guid);
        assert_eq!(data.header.game_version, 7);
        assert_eq!(data.header.platform, 1);
        assert_eq!(data.entries.len(), 2);
        assert_eq!(data.blobs.len(), 2);

        let decoded =
            decode_descriptor(&data.blobs[&graphics.structural_hash()]).unwrap();
        assert_eq!(decoded, graphics);
    }

    #[test]
    fn test_write_rejects_unverifiable_descriptor() {
        let dir = TempDir::new().unwrap();
        let bad = PipelineDescriptor::compute(crate::descriptor::ShaderHash::ZERO);
        assert!(matches!(
            write_cache_file(
                &dir.path().join("bad.pipecache"),
                &[(bad, bound_stats(1), 0)],
                1,
                0
            ),
            Err(CacheError::InvalidDescriptor)
        ));
    }

    #[test]
    fn test_load_skips_blob_with_out_of_range_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("content.pipecache");
        write_cache_file(
            &path,
            &[(
                PipelineDescriptor::compute(shader(0x05)),
                bound_stats(1),
                0,
            )],
            1,
            0,
        )
        .unwrap();

        // Patch the entry's blob offset to near u64::MAX; the unchecked sum
        // with the size would wrap. Layout after the TOC offset: magic,
        // same-guid flag, shared guid, sort tag, count, then hash + offset.
        let mut bytes = fs::read(&path).unwrap();
        let toc_offset = u64::from_le_bytes(
            bytes[CacheHeader::SIZE - 8..CacheHeader::SIZE].try_into().unwrap(),
        ) as usize;
        let offset_at = toc_offset + 8 + 1 + 16 + 1 + 4 + 4;
        bytes[offset_at..offset_at + 8].copy_from_slice(&(u64::MAX - 1).to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let data = CacheFileData::load(&path).unwrap();
        assert_eq!(data.entries.len(), 1);
        assert!(data.blobs.is_empty());
    }

    #[test]
    fn test_merge_sums_bind_counts_for_shared_hashes() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.pipecache");
        let b = dir.path().join("b.pipecache");
        let out = dir.path().join("merged.pipecache");

        let shared = PipelineDescriptor::compute(shader(0x11));
        let only_a = PipelineDescriptor::compute(shader(0x22));
        let only_b = PipelineDescriptor::compute(shader(0x33));

        write_cache_file(
            &a,
            &[
                (shared.clone(), bound_stats(10), 0b01),
                (only_a.clone(), bound_stats(1), 0),
            ],
            1,
            0,
        )
        .unwrap();
        write_cache_file(
            &b,
            &[
                (shared.clone(), bound_stats(4), 0b10),
                (only_b.clone(), bound_stats(1), 0),
            ],
            1,
            0,
        )
        .unwrap();

        let count = merge_cache_files(&a, &b, SortOrder::MostToLeastUsed, &out).unwrap();
        assert_eq!(count, 3);

        let merged = CacheFileData::load(&out).unwrap();
        let meta = merged
            .entries
            .iter()
            .find(|(hash, _)| *hash == shared.structural_hash())
            .map(|(_, meta)| meta)
            .unwrap();
        assert_eq!(meta.stats.total_bind_count, 14);
        assert_eq!(meta.usage_mask, 0b11);
        // Most-used first.
        assert_eq!(merged.entries[0].0, shared.structural_hash());
        assert_eq!(merged.sort_order, SortOrder::MostToLeastUsed);
    }

    #[test]
    fn test_merge_rejects_mismatched_game_versions() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.pipecache");
        let b = dir.path().join("b.pipecache");
        let desc = PipelineDescriptor::compute(shader(0x11));
        write_cache_file(&a, &[(desc.clone(), bound_stats(1), 0)], 1, 0).unwrap();
        write_cache_file(&b, &[(desc, bound_stats(1), 0)], 2, 0).unwrap();
        assert!(matches!(
            merge_cache_files(&a, &b, SortOrder::Unsorted, &dir.path().join("out")),
            Err(CacheError::GameVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_rewrites_blobs_under_fresh_guid() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.pipecache");
        let b = dir.path().join("b.pipecache");
        let out = dir.path().join("merged.pipecache");

        let one = PipelineDescriptor::compute(shader(0x41));
        let two = PipelineDescriptor::graphics(sample_graphics());
        write_cache_file(&a, &[(one.clone(), bound_stats(1), 0)], 1, 0).unwrap();
        write_cache_file(&b, &[(two.clone(), bound_stats(1), 0)], 1, 0).unwrap();

        merge_cache_files(&a, &b, SortOrder::Unsorted, &out).unwrap();
        let merged = CacheFileData::load(&out).unwrap();
        assert_eq!(merged.blobs.len(), 2);
        for (_, meta) in &merged.entries {
            assert_eq!(meta.file_guid, merged.header.guid);
        }
        assert_eq!(
            decode_descriptor(&merged.blobs[&two.structural_hash()]).unwrap(),
            two
        );
    }
}

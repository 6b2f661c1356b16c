//! # pipecache - Pipeline State Object File Cache
//!
//! `pipecache` is a persistent, versioned, mergeable on-disk cache of GPU
//! pipeline descriptors with usage statistics. A title records every
//! pipeline it creates; the cache persists those descriptors together with
//! how often and when they were bound, so later sessions (or other machines)
//! can pre-compile the pipelines that matter before they are first needed.
//!
//! Caches are two-tiered: an optional read-only content file shipped with
//! the title, overlaid by a user file that accumulates what this machine
//! actually ran. Files from different sessions merge offline.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pipecache::{
//!     CacheConfig, FileCacheManager, PipelineDescriptor, Result, SaveMode, SortOrder,
//! };
//! use std::path::PathBuf;
//!
//! # fn make_descriptor() -> PipelineDescriptor { unimplemented!() }
//! # fn main() -> Result<()> {
//! let cache = FileCacheManager::new();
//! cache.open(CacheConfig {
//!     content_path: Some(PathBuf::from("shipped.pipecache")),
//!     user_path: PathBuf::from("user.pipecache"),
//!     recording_path: None,
//!     game_version: 42,
//!     platform: 0,
//! })?;
//!
//! // Record pipeline creations and binds as the renderer makes them.
//! let descriptor = make_descriptor();
//! cache.record_use(&descriptor, 0b1)?;
//! cache.record_stats(descriptor.structural_hash());
//!
//! // Ask for the hottest pipelines to pre-compile next session.
//! let hot = cache.request_ordered(SortOrder::MostToLeastUsed, 1, &Default::default());
//! for result in cache.fetch(&hot) {
//!     if result.valid { /* compile result.descriptor */ }
//! }
//!
//! cache.save(SaveMode::Incremental, SortOrder::Unsorted)?;
//! cache.close();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod fetch;
pub mod file;
pub mod manager;
pub mod merge;
pub mod stats;

pub use codec::{CacheHeader, EntryMetadata, SortOrder, FORMAT_VERSION};
pub use descriptor::{
    ComputeDescriptor, GraphicsDescriptor, PipelineDescriptor, PixelFormat,
    RayTracingDescriptor, ShaderHash, VertexElement, MAX_RENDER_TARGETS,
};
pub use error::{CacheError, Result};
pub use fetch::{FetchResult, FetchStream};
pub use file::{CacheFile, SaveMode};
pub use manager::{
    default_mask_comparator, CacheConfig, FileCacheManager, UsageMaskComparator,
};
pub use merge::{merge_cache_files, write_cache_file, CacheFileData};
pub use stats::{EntryStats, PipelineStateStats, ENGINE_FLAG_INVALID};

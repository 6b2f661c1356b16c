//! Binary wire format
//!
//! Little-endian throughout. The file layout is header, descriptor blob
//! region, table of contents, EOF sentinel. Offsets and sizes live only in
//! the TOC; blobs are raw descriptor encodings with no framing of their own.

use crate::descriptor::{
    BlendFactor, BlendOperation, CompareFunction, ComputeDescriptor, CullMode,
    DepthStencilState, FillMode, GraphicsDescriptor, LoadAction, PipelineDescriptor,
    PixelFormat, PrimitiveTopology, RasterizerState, RayTracingDescriptor, RayTracingStage,
    RenderTargetBlend, ShaderHash, StencilOp, StoreAction, VertexElement, VertexElementType,
    MAX_RENDER_TARGETS,
};
use crate::error::{CacheError, Result};
use crate::stats::EntryStats;
use ahash::AHashSet;

/// "PIPECACH"
pub const FILE_MAGIC: u64 = 0x5049_5045_4341_4348;
/// "TOCSTAR2"
pub const TOC_MAGIC: u64 = 0x544F_4353_5441_5232;
/// "EOF-MARK"
pub const EOF_MAGIC: u64 = 0x454F_462D_4D41_524B;

pub const FORMAT_VERSION: u32 = 1;

/// Preferred enumeration order for ordered pre-compile lists. Persisted in
/// the TOC so a reopened cache knows whether its hash vector is still sorted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum SortOrder {
    /// TOC order, whatever it happens to be.
    #[default]
    Unsorted = 0,
    /// Earliest first frame used first.
    FirstToLatestUsed = 1,
    /// Highest total bind count first.
    MostToLeastUsed = 2,
}

impl SortOrder {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SortOrder::Unsorted),
            1 => Some(SortOrder::FirstToLatestUsed),
            2 => Some(SortOrder::MostToLeastUsed),
            _ => None,
        }
    }
}

/// Fixed-size file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheHeader {
    pub game_version: u32,
    pub platform: u8,
    pub guid: u128,
    pub toc_offset: u64,
}

impl CacheHeader {
    /// magic + format_version + game_version + platform + guid + toc_offset
    pub const SIZE: usize = 8 + 4 + 4 + 1 + 16 + 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let mut w = Writer::over(&mut bytes);
        w.u64(FILE_MAGIC);
        w.u32(FORMAT_VERSION);
        w.u32(self.game_version);
        w.u8(self.platform);
        w.u128(self.guid);
        w.u64(self.toc_offset);
        bytes
    }

    /// Decode, validating only the magic and format version. Offline tools
    /// use this to read files regardless of origin.
    pub fn from_bytes_any(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        if r.u64()? != FILE_MAGIC {
            return Err(CacheError::InvalidMagic);
        }
        let found_version = r.u32()?;
        if found_version != FORMAT_VERSION {
            return Err(CacheError::UnsupportedVersion {
                found: found_version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(CacheHeader {
            game_version: r.u32()?,
            platform: r.u8()?,
            guid: r.u128()?,
            toc_offset: r.u64()?,
        })
    }

    /// Decode and validate against the expected game version and platform.
    pub fn from_bytes(bytes: &[u8], game_version: u32, platform: u8) -> Result<Self> {
        let header = Self::from_bytes_any(bytes)?;
        if header.game_version != game_version {
            return Err(CacheError::GameVersionMismatch {
                found: header.game_version,
                expected: game_version,
            });
        }
        if header.platform != platform {
            return Err(CacheError::PlatformMismatch {
                found: header.platform,
                expected: platform,
            });
        }
        Ok(header)
    }
}

/// Everything the TOC records about one pipeline besides its hash.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryMetadata {
    /// Byte offset of the descriptor blob within its owning file.
    pub file_offset: u64,
    pub file_size: u64,
    /// GUID of the physical file that owns the blob.
    pub file_guid: u128,
    pub stats: EntryStats,
    pub shaders: AHashSet<ShaderHash>,
    pub usage_mask: u64,
    pub engine_flags: u16,
}

impl EntryMetadata {
    pub fn encode(&self, out: &mut Vec<u8>, omit_guid: bool) {
        out.extend_from_slice(&self.file_offset.to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        if !omit_guid {
            out.extend_from_slice(&self.file_guid.to_le_bytes());
        }
        out.extend_from_slice(&self.stats.first_frame_used.to_le_bytes());
        out.extend_from_slice(&self.stats.last_frame_used.to_le_bytes());
        out.extend_from_slice(&self.stats.create_count.to_le_bytes());
        out.extend_from_slice(&self.stats.total_bind_count.to_le_bytes());
        out.extend_from_slice(&(self.shaders.len() as u32).to_le_bytes());
        // Stable shader order keeps repeated saves byte-identical.
        let mut shaders: Vec<&ShaderHash> = self.shaders.iter().collect();
        shaders.sort();
        for shader in shaders {
            out.extend_from_slice(&shader.0);
        }
        out.extend_from_slice(&self.usage_mask.to_le_bytes());
        out.extend_from_slice(&self.engine_flags.to_le_bytes());
    }

    pub fn decode(r: &mut Reader<'_>, shared_guid: Option<u128>) -> Result<Self> {
        let file_offset = r.u64()?;
        let file_size = r.u64()?;
        let file_guid = match shared_guid {
            Some(guid) => guid,
            None => r.u128()?,
        };
        let stats = EntryStats {
            first_frame_used: r.i64()?,
            last_frame_used: r.i64()?,
            create_count: r.i64()?,
            total_bind_count: r.i64()?,
        };
        let shader_count = r.u32()?;
        if shader_count as usize > r.remaining() / 20 {
            return Err(CacheError::CorruptToc(
                "shader count exceeds record size".into(),
            ));
        }
        let mut shaders = AHashSet::with_capacity(shader_count as usize);
        for _ in 0..shader_count {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(r.bytes(20)?);
            shaders.insert(ShaderHash(hash));
        }
        Ok(EntryMetadata {
            file_offset,
            file_size,
            file_guid,
            stats,
            shaders,
            usage_mask: r.u64()?,
            engine_flags: r.u16()?,
        })
    }
}

/// Smallest possible encoded TOC entry: hash, blob offset and size, stats,
/// an empty shader set, usage mask, engine flags. Counts claiming more
/// entries than the remaining bytes could hold are corrupt.
const TOC_ENTRY_MIN_SIZE: usize = 4 + 8 + 8 + 32 + 4 + 8 + 2;

/// In-memory table of contents: hash to metadata, plus the persisted order
/// tag.
#[derive(Clone, Debug, Default)]
pub struct Toc {
    pub sort_order: SortOrder,
    pub entries: Vec<(u32, EntryMetadata)>,
}

impl Toc {
    /// Encode the TOC plus EOF sentinel. When every entry's blob lives in
    /// `own_guid`'s file the per-entry GUIDs collapse into one shared field.
    pub fn encode(&self, own_guid: u128) -> Vec<u8> {
        let same_guid = self
            .entries
            .iter()
            .all(|(_, meta)| meta.file_guid == own_guid);

        let mut out = Vec::with_capacity(64 + self.entries.len() * 128);
        out.extend_from_slice(&TOC_MAGIC.to_le_bytes());
        out.push(same_guid as u8);
        if same_guid {
            out.extend_from_slice(&own_guid.to_le_bytes());
        }
        out.push(self.sort_order as u8);
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (hash, meta) in &self.entries {
            out.extend_from_slice(&hash.to_le_bytes());
            meta.encode(&mut out, same_guid);
        }
        out.extend_from_slice(&EOF_MAGIC.to_le_bytes());
        out
    }

    /// Decode a TOC from the byte range starting at the TOC offset. The EOF
    /// sentinel must sit immediately after the last entry.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        if r.u64()? != TOC_MAGIC {
            return Err(CacheError::CorruptToc("bad TOC magic".into()));
        }
        let same_guid = r.u8()? != 0;
        let shared_guid = if same_guid { Some(r.u128()?) } else { None };
        let sort_order = SortOrder::from_u8(r.u8()?)
            .ok_or_else(|| CacheError::CorruptToc("unknown sort order tag".into()))?;
        let count = r.u32()?;
        if count as usize > r.remaining() / TOC_ENTRY_MIN_SIZE {
            return Err(CacheError::CorruptToc("entry count exceeds file size".into()));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let hash = r.u32()?;
            entries.push((hash, EntryMetadata::decode(&mut r, shared_guid)?));
        }
        if r.u64()? != EOF_MAGIC {
            return Err(CacheError::CorruptToc("missing EOF marker".into()));
        }
        Ok(Toc {
            sort_order,
            entries,
        })
    }
}

// ---------------------------------------------------------------------------
// Descriptor blobs

const KIND_GRAPHICS: u8 = 0;
const KIND_COMPUTE: u8 = 1;
const KIND_RAY_TRACING: u8 = 2;

pub fn encode_descriptor(desc: &PipelineDescriptor) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    match desc {
        PipelineDescriptor::Compute(c) => {
            out.push(KIND_COMPUTE);
            out.extend_from_slice(&c.compute_shader.0);
        }
        PipelineDescriptor::RayTracing(rt) => {
            out.push(KIND_RAY_TRACING);
            out.extend_from_slice(&rt.shader.0);
            out.push(rt.stage as u8);
            out.extend_from_slice(&rt.max_payload_size.to_le_bytes());
            out.push(rt.allow_hit_group_indexing as u8);
        }
        PipelineDescriptor::Graphics(g) => {
            out.push(KIND_GRAPHICS);
            out.extend_from_slice(&g.vertex_shader.0);
            out.extend_from_slice(&g.fragment_shader.0);
            out.extend_from_slice(&g.geometry_shader.0);
            out.extend_from_slice(&g.hull_shader.0);
            out.extend_from_slice(&g.domain_shader.0);

            out.extend_from_slice(&(g.vertex_layout.len() as u32).to_le_bytes());
            for element in &g.vertex_layout {
                out.push(element.stream_index);
                out.push(element.offset);
                out.push(element.element_type as u8);
                out.push(element.attribute_index);
                out.extend_from_slice(&element.stride.to_le_bytes());
                out.push(element.per_instance as u8);
            }

            out.push(g.blend_state.independent_blend as u8);
            for rt in &g.blend_state.render_targets {
                out.push(rt.color_blend_op as u8);
                out.push(rt.color_src_blend as u8);
                out.push(rt.color_dest_blend as u8);
                out.push(rt.alpha_blend_op as u8);
                out.push(rt.alpha_src_blend as u8);
                out.push(rt.alpha_dest_blend as u8);
                out.push(rt.color_write_mask);
            }

            out.extend_from_slice(&g.rasterizer_state.depth_bias.to_bits().to_le_bytes());
            out.extend_from_slice(
                &g.rasterizer_state
                    .slope_scale_depth_bias
                    .to_bits()
                    .to_le_bytes(),
            );
            out.push(g.rasterizer_state.fill_mode as u8);
            out.push(g.rasterizer_state.cull_mode as u8);
            out.push(g.rasterizer_state.allow_msaa as u8);
            out.push(g.rasterizer_state.enable_line_aa as u8);

            let ds = &g.depth_stencil_state;
            out.push(ds.enable_depth_write as u8);
            out.push(ds.depth_test as u8);
            out.push(ds.enable_front_face_stencil as u8);
            out.push(ds.front_face_stencil_test as u8);
            out.push(ds.front_face_stencil_fail_op as u8);
            out.push(ds.front_face_depth_fail_op as u8);
            out.push(ds.front_face_pass_op as u8);
            out.push(ds.enable_back_face_stencil as u8);
            out.push(ds.back_face_stencil_test as u8);
            out.push(ds.back_face_stencil_fail_op as u8);
            out.push(ds.back_face_depth_fail_op as u8);
            out.push(ds.back_face_pass_op as u8);
            out.push(ds.stencil_read_mask);
            out.push(ds.stencil_write_mask);

            for format in &g.render_target_formats {
                out.push(format.0);
            }
            for flags in &g.render_target_flags {
                out.extend_from_slice(&flags.to_le_bytes());
            }
            out.extend_from_slice(&g.render_targets_active.to_le_bytes());
            out.extend_from_slice(&g.msaa_samples.to_le_bytes());
            out.push(g.primitive_topology as u8);
            out.push(g.depth_stencil_format.0);
            out.extend_from_slice(&g.depth_stencil_flags.to_le_bytes());
            out.push(g.depth_load as u8);
            out.push(g.stencil_load as u8);
            out.push(g.depth_store as u8);
            out.push(g.stencil_store as u8);
            out.push(g.subpass_hint);
            out.push(g.subpass_index);
        }
    }
    out
}

pub fn decode_descriptor(bytes: &[u8]) -> Result<PipelineDescriptor> {
    let mut r = Reader::new(bytes);
    match r.u8()? {
        KIND_COMPUTE => Ok(PipelineDescriptor::Compute(ComputeDescriptor {
            compute_shader: r.shader_hash()?,
        })),
        KIND_RAY_TRACING => Ok(PipelineDescriptor::RayTracing(RayTracingDescriptor {
            shader: r.shader_hash()?,
            stage: RayTracingStage::from_u8(r.u8()?)
                .ok_or_else(|| blob_err("ray tracing stage"))?,
            max_payload_size: r.u32()?,
            allow_hit_group_indexing: r.u8()? != 0,
        })),
        KIND_GRAPHICS => {
            let mut g = GraphicsDescriptor {
                vertex_shader: r.shader_hash()?,
                fragment_shader: r.shader_hash()?,
                geometry_shader: r.shader_hash()?,
                hull_shader: r.shader_hash()?,
                domain_shader: r.shader_hash()?,
                ..Default::default()
            };

            let element_count = r.u32()?;
            // 7 encoded bytes per element.
            if element_count as usize > r.remaining() / 7 {
                return Err(blob_err("vertex element count"));
            }
            g.vertex_layout = Vec::with_capacity(element_count as usize);
            for _ in 0..element_count {
                g.vertex_layout.push(VertexElement {
                    stream_index: r.u8()?,
                    offset: r.u8()?,
                    element_type: VertexElementType::from_u8(r.u8()?)
                        .ok_or_else(|| blob_err("vertex element type"))?,
                    attribute_index: r.u8()?,
                    stride: r.u16()?,
                    per_instance: r.u8()? != 0,
                });
            }
            // Canonical order is not trusted from disk.
            g.canonicalize();

            g.blend_state.independent_blend = r.u8()? != 0;
            for rt in 0..MAX_RENDER_TARGETS {
                g.blend_state.render_targets[rt] = RenderTargetBlend {
                    color_blend_op: BlendOperation::from_u8(r.u8()?)
                        .ok_or_else(|| blob_err("blend op"))?,
                    color_src_blend: BlendFactor::from_u8(r.u8()?)
                        .ok_or_else(|| blob_err("blend factor"))?,
                    color_dest_blend: BlendFactor::from_u8(r.u8()?)
                        .ok_or_else(|| blob_err("blend factor"))?,
                    alpha_blend_op: BlendOperation::from_u8(r.u8()?)
                        .ok_or_else(|| blob_err("blend op"))?,
                    alpha_src_blend: BlendFactor::from_u8(r.u8()?)
                        .ok_or_else(|| blob_err("blend factor"))?,
                    alpha_dest_blend: BlendFactor::from_u8(r.u8()?)
                        .ok_or_else(|| blob_err("blend factor"))?,
                    color_write_mask: r.u8()?,
                };
            }

            g.rasterizer_state = RasterizerState {
                depth_bias: f32::from_bits(r.u32()?),
                slope_scale_depth_bias: f32::from_bits(r.u32()?),
                fill_mode: FillMode::from_u8(r.u8()?).ok_or_else(|| blob_err("fill mode"))?,
                cull_mode: CullMode::from_u8(r.u8()?).ok_or_else(|| blob_err("cull mode"))?,
                allow_msaa: r.u8()? != 0,
                enable_line_aa: r.u8()? != 0,
            };

            g.depth_stencil_state = DepthStencilState {
                enable_depth_write: r.u8()? != 0,
                depth_test: CompareFunction::from_u8(r.u8()?)
                    .ok_or_else(|| blob_err("compare function"))?,
                enable_front_face_stencil: r.u8()? != 0,
                front_face_stencil_test: CompareFunction::from_u8(r.u8()?)
                    .ok_or_else(|| blob_err("compare function"))?,
                front_face_stencil_fail_op: StencilOp::from_u8(r.u8()?)
                    .ok_or_else(|| blob_err("stencil op"))?,
                front_face_depth_fail_op: StencilOp::from_u8(r.u8()?)
                    .ok_or_else(|| blob_err("stencil op"))?,
                front_face_pass_op: StencilOp::from_u8(r.u8()?)
                    .ok_or_else(|| blob_err("stencil op"))?,
                enable_back_face_stencil: r.u8()? != 0,
                back_face_stencil_test: CompareFunction::from_u8(r.u8()?)
                    .ok_or_else(|| blob_err("compare function"))?,
                back_face_stencil_fail_op: StencilOp::from_u8(r.u8()?)
                    .ok_or_else(|| blob_err("stencil op"))?,
                back_face_depth_fail_op: StencilOp::from_u8(r.u8()?)
                    .ok_or_else(|| blob_err("stencil op"))?,
                back_face_pass_op: StencilOp::from_u8(r.u8()?)
                    .ok_or_else(|| blob_err("stencil op"))?,
                stencil_read_mask: r.u8()?,
                stencil_write_mask: r.u8()?,
            };

            for rt in 0..MAX_RENDER_TARGETS {
                g.render_target_formats[rt] = PixelFormat(r.u8()?);
            }
            for rt in 0..MAX_RENDER_TARGETS {
                g.render_target_flags[rt] = r.u32()?;
            }
            g.render_targets_active = r.u32()?;
            g.msaa_samples = r.u32()?;
            g.primitive_topology = PrimitiveTopology::from_u8(r.u8()?)
                .ok_or_else(|| blob_err("primitive topology"))?;
            g.depth_stencil_format = PixelFormat(r.u8()?);
            g.depth_stencil_flags = r.u32()?;
            g.depth_load = LoadAction::from_u8(r.u8()?).ok_or_else(|| blob_err("load action"))?;
            g.stencil_load =
                LoadAction::from_u8(r.u8()?).ok_or_else(|| blob_err("load action"))?;
            g.depth_store =
                StoreAction::from_u8(r.u8()?).ok_or_else(|| blob_err("store action"))?;
            g.stencil_store =
                StoreAction::from_u8(r.u8()?).ok_or_else(|| blob_err("store action"))?;
            g.subpass_hint = r.u8()?;
            g.subpass_index = r.u8()?;

            Ok(PipelineDescriptor::Graphics(g))
        }
        _ => Err(blob_err("pipeline kind")),
    }
}

fn blob_err(what: &str) -> CacheError {
    CacheError::CorruptToc(format!("descriptor blob has invalid {what}"))
}

// ---------------------------------------------------------------------------
// Byte cursors

/// Bounds-checked little-endian reader over a byte slice.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| CacheError::CorruptToc("truncated record".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.bytes(2)?);
        Ok(u16::from_le_bytes(buf))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(i64::from_le_bytes(buf))
    }

    pub fn u128(&mut self) -> Result<u128> {
        let mut buf = [0u8; 16];
        buf.copy_from_slice(self.bytes(16)?);
        Ok(u128::from_le_bytes(buf))
    }

    fn shader_hash(&mut self) -> Result<ShaderHash> {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(self.bytes(20)?);
        Ok(ShaderHash(hash))
    }
}

/// Fixed-buffer little-endian writer used for the header.
struct Writer<'a> {
    bytes: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn over(bytes: &'a mut [u8]) -> Self {
        Writer { bytes, pos: 0 }
    }

    fn put(&mut self, src: &[u8]) {
        self.bytes[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
    }

    fn u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    fn u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    fn u128(&mut self, value: u128) {
        self.put(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::test_support::*;
    use proptest::prelude::*;

    fn meta(guid: u128, bind_count: i64) -> EntryMetadata {
        EntryMetadata {
            file_offset: 41,
            file_size: 128,
            file_guid: guid,
            stats: EntryStats {
                first_frame_used: 10,
                last_frame_used: 500,
                create_count: 2,
                total_bind_count: bind_count,
            },
            shaders: [shader(0xAA), shader(0xBB)].into_iter().collect(),
            usage_mask: 0b1010,
            engine_flags: 0,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = CacheHeader {
            game_version: 77,
            platform: 3,
            guid: 0xDEAD_BEEF_CAFE,
            toc_offset: 4096,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), CacheHeader::SIZE);
        let decoded = CacheHeader::from_bytes(&bytes, 77, 3).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_wrong_magic() {
        let mut bytes = CacheHeader {
            game_version: 1,
            platform: 0,
            guid: 1,
            toc_offset: 0,
        }
        .to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            CacheHeader::from_bytes(&bytes, 1, 0),
            Err(CacheError::InvalidMagic)
        ));
    }

    #[test]
    fn test_header_rejects_game_version_mismatch() {
        let bytes = CacheHeader {
            game_version: 5,
            platform: 0,
            guid: 1,
            toc_offset: 0,
        }
        .to_bytes();
        let err = CacheHeader::from_bytes(&bytes, 6, 0).unwrap_err();
        assert!(matches!(
            err,
            CacheError::GameVersionMismatch {
                found: 5,
                expected: 6
            }
        ));
        assert!(err.is_format_mismatch());
    }

    #[test]
    fn test_header_rejects_platform_mismatch() {
        let bytes = CacheHeader {
            game_version: 5,
            platform: 2,
            guid: 1,
            toc_offset: 0,
        }
        .to_bytes();
        assert!(matches!(
            CacheHeader::from_bytes(&bytes, 5, 3),
            Err(CacheError::PlatformMismatch {
                found: 2,
                expected: 3
            })
        ));
    }

    #[test]
    fn test_toc_round_trip_same_guid() {
        let guid = 0x1234_5678_9ABC;
        let toc = Toc {
            sort_order: SortOrder::MostToLeastUsed,
            entries: vec![(1, meta(guid, 10)), (2, meta(guid, -1))],
        };
        let bytes = toc.encode(guid);
        // Shared-GUID form stores the GUID once, not per entry.
        assert!(bytes.len() < Toc {
            sort_order: toc.sort_order,
            entries: vec![(1, meta(guid, 10)), (2, meta(0xFF, -1))],
        }
        .encode(guid)
        .len());

        let decoded = Toc::decode(&bytes).unwrap();
        assert_eq!(decoded.sort_order, SortOrder::MostToLeastUsed);
        assert_eq!(decoded.entries, toc.entries);
    }

    #[test]
    fn test_toc_round_trip_mixed_guids() {
        let toc = Toc {
            sort_order: SortOrder::Unsorted,
            entries: vec![(1, meta(0xAA, 3)), (2, meta(0xBB, 5))],
        };
        let decoded = Toc::decode(&toc.encode(0xAA)).unwrap();
        assert_eq!(decoded.entries, toc.entries);
    }

    #[test]
    fn test_toc_missing_eof_marker_is_corrupt() {
        let toc = Toc {
            sort_order: SortOrder::Unsorted,
            entries: vec![(9, meta(0x1, 1))],
        };
        let mut bytes = toc.encode(0x1);
        bytes.truncate(bytes.len() - 8);
        assert!(matches!(
            Toc::decode(&bytes),
            Err(CacheError::CorruptToc(_))
        ));
    }

    #[test]
    fn test_toc_truncated_entry_is_corrupt() {
        let toc = Toc {
            sort_order: SortOrder::Unsorted,
            entries: vec![(9, meta(0x1, 1))],
        };
        let bytes = toc.encode(0x1);
        assert!(matches!(
            Toc::decode(&bytes[..bytes.len() / 2]),
            Err(CacheError::CorruptToc(_))
        ));
    }

    #[test]
    fn test_toc_rejects_entry_count_past_file_size() {
        // A TOC header claiming u32::MAX entries followed by nothing.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&TOC_MAGIC.to_le_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&1u128.to_le_bytes());
        bytes.push(SortOrder::Unsorted as u8);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&EOF_MAGIC.to_le_bytes());
        assert!(matches!(
            Toc::decode(&bytes),
            Err(CacheError::CorruptToc(_))
        ));
    }

    #[test]
    fn test_metadata_rejects_shader_count_past_record_size() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&16u64.to_le_bytes());
        for _ in 0..4 {
            bytes.extend_from_slice(&(-1i64).to_le_bytes());
        }
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            EntryMetadata::decode(&mut r, Some(1)),
            Err(CacheError::CorruptToc(_))
        ));
    }

    #[test]
    fn test_decoder_rejects_element_count_past_blob_size() {
        let mut bytes = vec![KIND_GRAPHICS];
        bytes.extend_from_slice(&[0u8; 100]); // five shader hashes
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(decode_descriptor(&bytes).is_err());
    }

    #[test]
    fn test_graphics_descriptor_round_trip() {
        let desc = PipelineDescriptor::graphics(sample_graphics());
        let decoded = decode_descriptor(&encode_descriptor(&desc)).unwrap();
        assert_eq!(decoded, desc);
        assert_eq!(decoded.structural_hash(), desc.structural_hash());
    }

    #[test]
    fn test_decoder_rejects_unknown_kind() {
        assert!(decode_descriptor(&[0xFE]).is_err());
    }

    #[test]
    fn test_decoder_rejects_bad_enum_value() {
        let mut bytes = encode_descriptor(&PipelineDescriptor::ray_tracing(
            RayTracingDescriptor {
                shader: shader(0x10),
                stage: RayTracingStage::Miss,
                max_payload_size: 64,
                allow_hit_group_indexing: true,
            },
        ));
        bytes[21] = 0xFF; // stage byte
        assert!(decode_descriptor(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn prop_compute_descriptor_round_trips(byte in any::<u8>()) {
            prop_assume!(byte != 0);
            let desc = PipelineDescriptor::compute(shader(byte));
            let decoded = decode_descriptor(&encode_descriptor(&desc)).unwrap();
            prop_assert_eq!(decoded, desc);
        }

        #[test]
        fn prop_ray_tracing_descriptor_round_trips(
            byte in 1u8..,
            stage in 0u8..4,
            payload in any::<u32>(),
            indexing in any::<bool>(),
        ) {
            let desc = PipelineDescriptor::ray_tracing(RayTracingDescriptor {
                shader: shader(byte),
                stage: RayTracingStage::from_u8(stage).unwrap(),
                max_payload_size: payload,
                allow_hit_group_indexing: indexing,
            });
            let decoded = decode_descriptor(&encode_descriptor(&desc)).unwrap();
            prop_assert_eq!(decoded, desc);
        }

        #[test]
        fn prop_structural_hash_survives_round_trip(
            depth_bias in any::<f32>(),
            msaa in 1u32..=16,
            topology in 0u8..4,
        ) {
            let mut graphics = sample_graphics();
            graphics.rasterizer_state.depth_bias = depth_bias;
            graphics.msaa_samples = msaa;
            graphics.primitive_topology = PrimitiveTopology::from_u8(topology).unwrap();
            let desc = PipelineDescriptor::graphics(graphics);
            let decoded = decode_descriptor(&encode_descriptor(&desc)).unwrap();
            prop_assert_eq!(decoded.structural_hash(), desc.structural_hash());
        }
    }
}

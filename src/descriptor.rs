//! Pipeline descriptor model
//!
//! A [`PipelineDescriptor`] captures everything needed to recreate one GPU
//! pipeline state: shader-stage hashes plus the fixed-function configuration
//! for graphics pipelines, a single shader hash for compute pipelines, and
//! the shader/stage/payload tuple for ray-tracing pipelines.
//!
//! Descriptors are plain value types compared structurally. The stable cache
//! key is [`PipelineDescriptor::structural_hash`], a CRC32 chain over every
//! semantic field (never over usage counters). A second, cheaper
//! [`PipelineDescriptor::runtime_hash`] (xxh3) keys the per-session registry
//! so the hot path does not re-walk the CRC chain on every creation call.

use crc32fast::Hasher as Crc32;
use std::hash::{Hash, Hasher};
use xxhash_rust::xxh3::Xxh3;

/// Maximum number of simultaneously bound render targets.
pub const MAX_RENDER_TARGETS: usize = 8;

/// Maximum supported MSAA sample count.
pub const MAX_MSAA_SAMPLES: u32 = 16;

/// Hash of a compiled shader stage. The zero hash means "stage absent".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderHash(pub [u8; 20]);

impl ShaderHash {
    pub const ZERO: ShaderHash = ShaderHash([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[repr(u8)]
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub enum $name {
            #[default]
            $($variant = $value),+
        }

        impl $name {
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum!(
    /// Vertex attribute component type.
    VertexElementType {
        Float1 = 0,
        Float2 = 1,
        Float3 = 2,
        Float4 = 3,
        UByte4 = 4,
        UByte4Norm = 5,
        Short2 = 6,
        Short4 = 7,
        Half2 = 8,
        Half4 = 9,
        UInt = 10,
    }
);

wire_enum!(
    BlendOperation {
        Add = 0,
        Subtract = 1,
        Min = 2,
        Max = 3,
        ReverseSubtract = 4,
    }
);

wire_enum!(
    BlendFactor {
        Zero = 0,
        One = 1,
        SourceColor = 2,
        InverseSourceColor = 3,
        SourceAlpha = 4,
        InverseSourceAlpha = 5,
        DestAlpha = 6,
        InverseDestAlpha = 7,
        DestColor = 8,
        InverseDestColor = 9,
        ConstantBlendFactor = 10,
        InverseConstantBlendFactor = 11,
    }
);

wire_enum!(
    FillMode {
        Solid = 0,
        Wireframe = 1,
        Point = 2,
    }
);

wire_enum!(
    CullMode {
        None = 0,
        Clockwise = 1,
        CounterClockwise = 2,
    }
);

wire_enum!(
    CompareFunction {
        Less = 0,
        LessEqual = 1,
        Greater = 2,
        GreaterEqual = 3,
        Equal = 4,
        NotEqual = 5,
        Never = 6,
        Always = 7,
    }
);

wire_enum!(
    StencilOp {
        Keep = 0,
        Zero = 1,
        Replace = 2,
        SaturatedIncrement = 3,
        SaturatedDecrement = 4,
        Invert = 5,
        Increment = 6,
        Decrement = 7,
    }
);

wire_enum!(
    LoadAction {
        NoAction = 0,
        Load = 1,
        Clear = 2,
    }
);

wire_enum!(
    StoreAction {
        NoAction = 0,
        Store = 1,
        MultisampleResolve = 2,
    }
);

wire_enum!(
    PrimitiveTopology {
        TriangleList = 0,
        TriangleStrip = 1,
        LineList = 2,
        PointList = 3,
        PatchList = 4,
    }
);

wire_enum!(
    /// Shader stage of a ray-tracing pipeline entry point.
    RayTracingStage {
        RayGen = 0,
        Miss = 1,
        HitGroup = 2,
        Callable = 3,
    }
);

/// Render-target pixel format. An open set: the cache treats the value as an
/// opaque tag supplied by the renderer, bounded by [`PixelFormat::MAX`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub u8);

impl PixelFormat {
    pub const UNKNOWN: PixelFormat = PixelFormat(0);
    /// One past the largest format tag the renderer defines.
    pub const MAX: u8 = 90;

    pub fn is_valid(&self) -> bool {
        self.0 < Self::MAX
    }
}

/// One vertex-input attribute declaration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub stream_index: u8,
    pub offset: u8,
    pub element_type: VertexElementType,
    pub attribute_index: u8,
    pub stride: u16,
    pub per_instance: bool,
}

/// Blend configuration for a single render target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderTargetBlend {
    pub color_blend_op: BlendOperation,
    pub color_src_blend: BlendFactor,
    pub color_dest_blend: BlendFactor,
    pub alpha_blend_op: BlendOperation,
    pub alpha_src_blend: BlendFactor,
    pub alpha_dest_blend: BlendFactor,
    pub color_write_mask: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub independent_blend: bool,
    pub render_targets: [RenderTargetBlend; MAX_RENDER_TARGETS],
}

/// Rasterizer configuration. The two bias fields are floats supplied by the
/// renderer; they compare and hash by bit pattern.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RasterizerState {
    pub depth_bias: f32,
    pub slope_scale_depth_bias: f32,
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub allow_msaa: bool,
    pub enable_line_aa: bool,
}

impl Eq for RasterizerState {}

impl Hash for RasterizerState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.depth_bias.to_bits().hash(state);
        self.slope_scale_depth_bias.to_bits().hash(state);
        self.fill_mode.hash(state);
        self.cull_mode.hash(state);
        self.allow_msaa.hash(state);
        self.enable_line_aa.hash(state);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub enable_depth_write: bool,
    pub depth_test: CompareFunction,
    pub enable_front_face_stencil: bool,
    pub front_face_stencil_test: CompareFunction,
    pub front_face_stencil_fail_op: StencilOp,
    pub front_face_depth_fail_op: StencilOp,
    pub front_face_pass_op: StencilOp,
    pub enable_back_face_stencil: bool,
    pub back_face_stencil_test: CompareFunction,
    pub back_face_stencil_fail_op: StencilOp,
    pub back_face_depth_fail_op: StencilOp,
    pub back_face_pass_op: StencilOp,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
}

/// Full fixed-function + shader configuration of a graphics pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct GraphicsDescriptor {
    pub vertex_shader: ShaderHash,
    pub fragment_shader: ShaderHash,
    pub geometry_shader: ShaderHash,
    pub hull_shader: ShaderHash,
    pub domain_shader: ShaderHash,
    pub vertex_layout: Vec<VertexElement>,
    pub blend_state: BlendState,
    pub rasterizer_state: RasterizerState,
    pub depth_stencil_state: DepthStencilState,
    pub render_target_formats: [PixelFormat; MAX_RENDER_TARGETS],
    pub render_target_flags: [u32; MAX_RENDER_TARGETS],
    pub render_targets_active: u32,
    pub msaa_samples: u32,
    pub primitive_topology: PrimitiveTopology,
    pub depth_stencil_format: PixelFormat,
    pub depth_stencil_flags: u32,
    pub depth_load: LoadAction,
    pub stencil_load: LoadAction,
    pub depth_store: StoreAction,
    pub stencil_store: StoreAction,
    pub subpass_hint: u8,
    pub subpass_index: u8,
}

impl GraphicsDescriptor {
    /// Sort the vertex layout into its canonical order so declaration order
    /// never influences equality or hashing.
    pub fn canonicalize(&mut self) {
        self.vertex_layout.sort_by_key(|element| {
            (element.stream_index, element.offset, element.attribute_index)
        });
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ComputeDescriptor {
    pub compute_shader: ShaderHash,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RayTracingDescriptor {
    pub shader: ShaderHash,
    pub stage: RayTracingStage,
    pub max_payload_size: u32,
    pub allow_hit_group_indexing: bool,
}

impl Eq for RayTracingDescriptor {}

impl Hash for RayTracingDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shader.hash(state);
        self.stage.hash(state);
        self.max_payload_size.hash(state);
        self.allow_hit_group_indexing.hash(state);
    }
}

/// One distinct pipeline state, tagged by pipeline kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PipelineDescriptor {
    Graphics(GraphicsDescriptor),
    Compute(ComputeDescriptor),
    RayTracing(RayTracingDescriptor),
}

impl PipelineDescriptor {
    /// Construct a graphics descriptor, canonicalizing the vertex layout.
    pub fn graphics(mut desc: GraphicsDescriptor) -> Self {
        desc.canonicalize();
        PipelineDescriptor::Graphics(desc)
    }

    pub fn compute(shader: ShaderHash) -> Self {
        PipelineDescriptor::Compute(ComputeDescriptor {
            compute_shader: shader,
        })
    }

    pub fn ray_tracing(desc: RayTracingDescriptor) -> Self {
        PipelineDescriptor::RayTracing(desc)
    }

    /// Type tag used on the wire and when hashing.
    pub(crate) fn kind(&self) -> u8 {
        match self {
            PipelineDescriptor::Graphics(_) => 0,
            PipelineDescriptor::Compute(_) => 1,
            PipelineDescriptor::RayTracing(_) => 2,
        }
    }

    /// Reject structurally impossible combinations before they can be hashed
    /// or cached.
    pub fn verify(&self) -> bool {
        match self {
            PipelineDescriptor::Compute(desc) => !desc.compute_shader.is_zero(),
            PipelineDescriptor::RayTracing(desc) => !desc.shader.is_zero(),
            PipelineDescriptor::Graphics(desc) => {
                if desc.vertex_shader.is_zero() {
                    // No vertex shader, no graphics pipeline.
                    return false;
                }

                // Hull without domain (or vice versa) cannot be compiled.
                if desc.hull_shader.is_zero() != desc.domain_shader.is_zero() {
                    return false;
                }

                // Patch topologies require the tessellation stages.
                if desc.primitive_topology == PrimitiveTopology::PatchList
                    && desc.hull_shader.is_zero()
                {
                    return false;
                }

                if desc.render_targets_active > MAX_RENDER_TARGETS as u32
                    || desc.msaa_samples > MAX_MSAA_SAMPLES
                    || !desc.depth_stencil_format.is_valid()
                {
                    return false;
                }

                for rt in 0..desc.render_targets_active as usize {
                    if !desc.render_target_formats[rt].is_valid() {
                        return false;
                    }
                    if desc.blend_state.render_targets[rt].color_write_mask > 0xf {
                        return false;
                    }
                }

                true
            }
        }
    }

    /// Stable 32-bit structural hash: the persistent cache key.
    ///
    /// Deterministic across sessions and platforms. Covers every semantic
    /// field in a fixed order and nothing else; usage statistics never feed
    /// into it. Collisions between structurally different descriptors are
    /// tolerated and resolved by full equality comparison at the call sites
    /// that insert descriptors.
    pub fn structural_hash(&self) -> u32 {
        let mut crc = Crc32::new();
        self.walk_fields(&mut CrcSink(&mut crc));
        crc.finalize()
    }

    /// Cheap session-local hash keying the runtime usage registry.
    ///
    /// Never persisted; only valid within one process lifetime.
    pub fn runtime_hash(&self) -> u64 {
        let mut xxh = Xxh3::new();
        self.walk_fields(&mut XxhSink(&mut xxh));
        xxh.digest()
    }

    /// Shader hashes this pipeline references, stage-absent entries omitted.
    pub fn referenced_shaders(&self) -> Vec<ShaderHash> {
        match self {
            PipelineDescriptor::Compute(desc) => vec![desc.compute_shader],
            PipelineDescriptor::RayTracing(desc) => vec![desc.shader],
            PipelineDescriptor::Graphics(desc) => [
                desc.vertex_shader,
                desc.fragment_shader,
                desc.geometry_shader,
                desc.hull_shader,
                desc.domain_shader,
            ]
            .into_iter()
            .filter(|hash| !hash.is_zero())
            .collect(),
        }
    }

    /// Feed every semantic field into `sink` in a fixed order. Shared by the
    /// structural and runtime hashes so the two always agree on coverage.
    fn walk_fields(&self, sink: &mut dyn FieldSink) {
        sink.bytes(&[self.kind()]);
        match self {
            PipelineDescriptor::Compute(desc) => {
                sink.bytes(&desc.compute_shader.0);
            }
            PipelineDescriptor::RayTracing(desc) => {
                sink.bytes(&desc.shader.0);
                sink.bytes(&[desc.stage as u8]);
                sink.bytes(&desc.max_payload_size.to_le_bytes());
                sink.bytes(&[desc.allow_hit_group_indexing as u8]);
            }
            PipelineDescriptor::Graphics(desc) => {
                sink.bytes(&desc.vertex_shader.0);
                sink.bytes(&desc.fragment_shader.0);
                sink.bytes(&desc.geometry_shader.0);
                sink.bytes(&desc.hull_shader.0);
                sink.bytes(&desc.domain_shader.0);

                for element in &desc.vertex_layout {
                    sink.bytes(&[
                        element.stream_index,
                        element.offset,
                        element.element_type as u8,
                        element.attribute_index,
                    ]);
                    sink.bytes(&element.stride.to_le_bytes());
                    sink.bytes(&[element.per_instance as u8]);
                }

                sink.bytes(&[desc.blend_state.independent_blend as u8]);
                for rt in &desc.blend_state.render_targets {
                    sink.bytes(&[
                        rt.color_blend_op as u8,
                        rt.color_src_blend as u8,
                        rt.color_dest_blend as u8,
                        rt.alpha_blend_op as u8,
                        rt.alpha_src_blend as u8,
                        rt.alpha_dest_blend as u8,
                        rt.color_write_mask,
                    ]);
                }

                sink.bytes(&desc.rasterizer_state.depth_bias.to_bits().to_le_bytes());
                sink.bytes(
                    &desc
                        .rasterizer_state
                        .slope_scale_depth_bias
                        .to_bits()
                        .to_le_bytes(),
                );
                sink.bytes(&[
                    desc.rasterizer_state.fill_mode as u8,
                    desc.rasterizer_state.cull_mode as u8,
                    desc.rasterizer_state.allow_msaa as u8,
                    desc.rasterizer_state.enable_line_aa as u8,
                ]);

                let ds = &desc.depth_stencil_state;
                sink.bytes(&[
                    ds.enable_depth_write as u8,
                    ds.depth_test as u8,
                    ds.enable_front_face_stencil as u8,
                    ds.front_face_stencil_test as u8,
                    ds.front_face_stencil_fail_op as u8,
                    ds.front_face_depth_fail_op as u8,
                    ds.front_face_pass_op as u8,
                    ds.enable_back_face_stencil as u8,
                    ds.back_face_stencil_test as u8,
                    ds.back_face_stencil_fail_op as u8,
                    ds.back_face_depth_fail_op as u8,
                    ds.back_face_pass_op as u8,
                    ds.stencil_read_mask,
                    ds.stencil_write_mask,
                ]);

                for format in &desc.render_target_formats {
                    sink.bytes(&[format.0]);
                }
                for flags in &desc.render_target_flags {
                    sink.bytes(&flags.to_le_bytes());
                }
                sink.bytes(&desc.render_targets_active.to_le_bytes());
                sink.bytes(&desc.msaa_samples.to_le_bytes());
                sink.bytes(&[desc.primitive_topology as u8]);
                sink.bytes(&[desc.depth_stencil_format.0]);
                sink.bytes(&desc.depth_stencil_flags.to_le_bytes());
                sink.bytes(&[
                    desc.depth_load as u8,
                    desc.stencil_load as u8,
                    desc.depth_store as u8,
                    desc.stencil_store as u8,
                    desc.subpass_hint,
                    desc.subpass_index,
                ]);
            }
        }
    }
}

trait FieldSink {
    fn bytes(&mut self, bytes: &[u8]);
}

struct CrcSink<'a>(&'a mut Crc32);

impl FieldSink for CrcSink<'_> {
    fn bytes(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

struct XxhSink<'a>(&'a mut Xxh3);

impl FieldSink for XxhSink<'_> {
    fn bytes(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn shader(byte: u8) -> ShaderHash {
        ShaderHash([byte; 20])
    }

    /// A plausible graphics descriptor with a two-stream vertex layout.
    pub fn sample_graphics() -> GraphicsDescriptor {
        let mut desc = GraphicsDescriptor {
            vertex_shader: shader(0xAA),
            fragment_shader: shader(0xBB),
            vertex_layout: vec![
                VertexElement {
                    stream_index: 0,
                    offset: 0,
                    element_type: VertexElementType::Float3,
                    attribute_index: 0,
                    stride: 32,
                    per_instance: false,
                },
                VertexElement {
                    stream_index: 0,
                    offset: 12,
                    element_type: VertexElementType::Float2,
                    attribute_index: 1,
                    stride: 32,
                    per_instance: false,
                },
                VertexElement {
                    stream_index: 1,
                    offset: 0,
                    element_type: VertexElementType::UByte4Norm,
                    attribute_index: 2,
                    stride: 4,
                    per_instance: true,
                },
            ],
            render_targets_active: 1,
            msaa_samples: 1,
            depth_stencil_format: PixelFormat(24),
            ..Default::default()
        };
        desc.render_target_formats[0] = PixelFormat(2);
        desc.rasterizer_state.depth_bias = 0.5;
        desc
    }
}

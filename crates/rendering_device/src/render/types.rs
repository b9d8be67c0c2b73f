//! Resource descriptions
//!
//! Plain data describing how resources are created and addressed. Nothing in
//! this module owns device memory.

use super::error::{DriverError, DriverResult};
use super::flags::{BufferUsage, ImageAspect, ImageUsage};

/// Pixel layout and encoding of image data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    /// 8-bit normalized red
    R8Unorm,
    /// 8-bit normalized red/green
    R8G8Unorm,
    /// 8-bit normalized RGBA
    R8G8B8A8Unorm,
    /// 8-bit sRGB-encoded RGBA
    R8G8B8A8Srgb,
    /// 8-bit normalized BGRA
    B8G8R8A8Unorm,
    /// 8-bit sRGB-encoded BGRA
    B8G8R8A8Srgb,
    /// 16-bit float RGBA
    R16G16B16A16Sfloat,
    /// 32-bit unsigned integer red
    R32Uint,
    /// 32-bit float red
    R32Sfloat,
    /// 32-bit float red/green
    R32G32Sfloat,
    /// 32-bit float RGB
    R32G32B32Sfloat,
    /// 32-bit float RGBA
    R32G32B32A32Sfloat,
    /// 16-bit normalized depth
    D16Unorm,
    /// 32-bit float depth
    D32Sfloat,
    /// 24-bit depth with 8-bit stencil
    D24UnormS8Uint,
    /// BC1 compressed RGBA, 4x4 blocks
    Bc1RgbaUnormBlock,
    /// BC3 compressed RGBA, 4x4 blocks
    Bc3UnormBlock,
}

impl DataFormat {
    /// Size in bytes of one texel block
    pub const fn block_size(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::R8G8Unorm | Self::D16Unorm => 2,
            Self::R8G8B8A8Unorm
            | Self::R8G8B8A8Srgb
            | Self::B8G8R8A8Unorm
            | Self::B8G8R8A8Srgb
            | Self::R32Uint
            | Self::R32Sfloat
            | Self::D32Sfloat
            | Self::D24UnormS8Uint => 4,
            Self::R16G16B16A16Sfloat | Self::R32G32Sfloat | Self::Bc1RgbaUnormBlock => 8,
            Self::R32G32B32Sfloat => 12,
            Self::R32G32B32A32Sfloat | Self::Bc3UnormBlock => 16,
        }
    }

    /// Texel dimensions of one block
    pub const fn block_extent(self) -> (u32, u32) {
        if self.is_compressed() {
            (4, 4)
        } else {
            (1, 1)
        }
    }

    /// Whether the format is block compressed
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::Bc1RgbaUnormBlock | Self::Bc3UnormBlock)
    }

    /// Whether the format stores depth
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D16Unorm | Self::D32Sfloat | Self::D24UnormS8Uint)
    }

    /// Whether the format stores stencil
    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::D24UnormS8Uint)
    }

    /// Whether color data is sRGB encoded
    pub const fn is_srgb(self) -> bool {
        matches!(self, Self::R8G8B8A8Srgb | Self::B8G8R8A8Srgb)
    }

    /// Aspects present in the format
    pub fn aspects(self) -> ImageAspect {
        if self.has_stencil() {
            ImageAspect::DEPTH | ImageAspect::STENCIL
        } else if self.is_depth() {
            ImageAspect::DEPTH
        } else {
            ImageAspect::COLOR
        }
    }

    /// Whether two formats can view the same storage
    pub fn is_view_compatible(self, other: Self) -> bool {
        self == other
            || (!self.is_depth()
                && !other.is_depth()
                && self.block_size() == other.block_size()
                && self.block_extent() == other.block_extent())
    }

    /// Bytes one texel of `color` occupies in this format
    ///
    /// Returns `None` for depth, compressed and half-float formats.
    pub fn encode_color(self, color: [f32; 4]) -> Option<Vec<u8>> {
        let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        let srgb = |c: f32| unorm(linear_to_srgb(c));
        let [r, g, b, a] = color;

        let bytes = match self {
            Self::R8Unorm => vec![unorm(r)],
            Self::R8G8Unorm => vec![unorm(r), unorm(g)],
            Self::R8G8B8A8Unorm => vec![unorm(r), unorm(g), unorm(b), unorm(a)],
            Self::R8G8B8A8Srgb => vec![srgb(r), srgb(g), srgb(b), unorm(a)],
            Self::B8G8R8A8Unorm => vec![unorm(b), unorm(g), unorm(r), unorm(a)],
            Self::B8G8R8A8Srgb => vec![srgb(b), srgb(g), srgb(r), unorm(a)],
            Self::R32Uint => (r.max(0.0) as u32).to_le_bytes().to_vec(),
            Self::R32Sfloat => r.to_le_bytes().to_vec(),
            Self::R32G32Sfloat => [r, g].iter().flat_map(|c| c.to_le_bytes()).collect(),
            Self::R32G32B32Sfloat => [r, g, b].iter().flat_map(|c| c.to_le_bytes()).collect(),
            Self::R32G32B32A32Sfloat => color.iter().flat_map(|c| c.to_le_bytes()).collect(),
            _ => return None,
        };
        Some(bytes)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

/// Dimensionality and arrangement of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureType {
    /// One-dimensional
    Type1D,
    /// Two-dimensional
    #[default]
    Type2D,
    /// Three-dimensional
    Type3D,
    /// Six-face cube
    Cube,
    /// Array of 1D layers
    Type1DArray,
    /// Array of 2D layers
    Type2DArray,
    /// Array of cubes
    CubeArray,
}

/// Samples per texel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum SampleCount {
    /// Single sample
    #[default]
    X1,
    /// 2 samples
    X2,
    /// 4 samples
    X4,
    /// 8 samples
    X8,
    /// 16 samples
    X16,
}

impl SampleCount {
    /// Numeric sample count
    pub const fn count(self) -> u32 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X8 => 8,
            Self::X16 => 16,
        }
    }
}

/// Storage description of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormat {
    /// Texel format of the storage
    pub format: DataFormat,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels
    pub depth: u32,
    /// Number of array layers
    pub array_layers: u32,
    /// Number of mip levels
    pub mipmaps: u32,
    /// Dimensionality
    pub texture_type: TextureType,
    /// Samples per texel
    pub samples: SampleCount,
    /// Allowed operations
    pub usage: ImageUsage,
}

impl ImageFormat {
    /// Single-layer, single-mip 2D image
    pub const fn new_2d(format: DataFormat, width: u32, height: u32, usage: ImageUsage) -> Self {
        Self {
            format,
            width,
            height,
            depth: 1,
            array_layers: 1,
            mipmaps: 1,
            texture_type: TextureType::Type2D,
            samples: SampleCount::X1,
            usage,
        }
    }

    /// Set the mip level count
    pub const fn with_mipmaps(mut self, mipmaps: u32) -> Self {
        self.mipmaps = mipmaps;
        self
    }

    /// Set the array layer count
    pub const fn with_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }

    /// Set the sample count
    pub const fn with_samples(mut self, samples: SampleCount) -> Self {
        self.samples = samples;
        self
    }

    /// Set the texture type and depth
    pub const fn with_type(mut self, texture_type: TextureType, depth: u32) -> Self {
        self.texture_type = texture_type;
        self.depth = depth;
        self
    }

    /// Maximum mip levels for the base extent
    pub fn max_mipmaps(&self) -> u32 {
        let largest = self.width.max(self.height).max(self.depth).max(1);
        u32::BITS - largest.leading_zeros()
    }

    /// Extent of a mip level, never below one texel
    pub fn mip_extent(&self, mip: u32) -> [u32; 3] {
        [
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth >> mip).max(1),
        ]
    }

    /// Bytes of one layer at one mip level, tightly packed
    pub fn subresource_size(&self, mip: u32) -> u64 {
        let [w, h, d] = self.mip_extent(mip);
        let (bw, bh) = self.format.block_extent();
        u64::from(w.div_ceil(bw))
            * u64::from(h.div_ceil(bh))
            * u64::from(d)
            * u64::from(self.format.block_size())
    }

    /// Bytes of one full layer including every mip level
    pub fn layer_size(&self) -> u64 {
        (0..self.mipmaps).map(|mip| self.subresource_size(mip)).sum()
    }

    /// Bytes of the whole image, layers stored one after another
    pub fn total_size(&self) -> u64 {
        self.layer_size() * u64::from(self.array_layers)
    }

    /// Byte offset of a subresource inside the packed image
    pub fn subresource_offset(&self, layer: u32, mip: u32) -> u64 {
        let in_layer: u64 = (0..mip).map(|m| self.subresource_size(m)).sum();
        u64::from(layer) * self.layer_size() + in_layer
    }

    /// Check the description is internally consistent
    pub fn validate(&self) -> DriverResult<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 || self.array_layers == 0 {
            return Err(DriverError::contract("image extent and layer count must be non-zero"));
        }
        if self.mipmaps == 0 || self.mipmaps > self.max_mipmaps() {
            return Err(DriverError::contract(format!(
                "image requests {} mip levels, extent allows 1..={}",
                self.mipmaps,
                self.max_mipmaps()
            )));
        }
        if self.usage.is_empty() {
            return Err(DriverError::contract("image usage must not be empty"));
        }

        match self.texture_type {
            TextureType::Type1D | TextureType::Type1DArray if self.height != 1 || self.depth != 1 => {
                return Err(DriverError::contract("1D images must have height and depth 1"));
            }
            TextureType::Type2D | TextureType::Type2DArray if self.depth != 1 => {
                return Err(DriverError::contract("2D images must have depth 1"));
            }
            TextureType::Type3D if self.array_layers != 1 => {
                return Err(DriverError::contract("3D images cannot be layered"));
            }
            TextureType::Cube | TextureType::CubeArray => {
                if self.width != self.height || self.depth != 1 {
                    return Err(DriverError::contract("cube faces must be square with depth 1"));
                }
                let layers_ok = if self.texture_type == TextureType::Cube {
                    self.array_layers == 6
                } else {
                    self.array_layers % 6 == 0
                };
                if !layers_ok {
                    return Err(DriverError::contract("cube images need six layers per cube"));
                }
            }
            TextureType::Type1D | TextureType::Type2D if self.array_layers != 1 => {
                return Err(DriverError::contract(
                    "non-array image types must have one layer",
                ));
            }
            _ => {}
        }

        if self.samples != SampleCount::X1
            && (self.mipmaps != 1
                || !matches!(self.texture_type, TextureType::Type2D | TextureType::Type2DArray))
        {
            return Err(DriverError::unsupported(
                "multisampled images must be 2D with a single mip level",
            ));
        }
        if self.format.is_depth() && self.texture_type == TextureType::Type3D {
            return Err(DriverError::unsupported("3D depth images"));
        }
        if self.format.is_compressed()
            && self.usage.intersects(
                ImageUsage::COLOR_ATTACHMENT
                    | ImageUsage::DEPTH_STENCIL_ATTACHMENT
                    | ImageUsage::STORAGE,
            )
        {
            return Err(DriverError::unsupported(format!(
                "{:?} with usage {:?}",
                self.format, self.usage
            )));
        }
        if self.format.is_depth() && self.usage.contains(ImageUsage::COLOR_ATTACHMENT) {
            return Err(DriverError::unsupported("depth format as color attachment"));
        }
        if !self.format.is_depth() && self.usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
            return Err(DriverError::unsupported("color format as depth attachment"));
        }
        if self.usage.contains(ImageUsage::CPU_READ)
            && (self.samples != SampleCount::X1 || self.format.is_depth())
        {
            return Err(DriverError::unsupported(
                "host-readable images must be single-sampled color images",
            ));
        }
        Ok(())
    }
}

/// Per-channel source of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Swizzle {
    /// Keep the channel
    #[default]
    Identity,
    /// Constant zero
    Zero,
    /// Constant one
    One,
    /// Red channel
    R,
    /// Green channel
    G,
    /// Blue channel
    B,
    /// Alpha channel
    A,
}

/// Reinterpretation of an image's storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageView {
    /// Format the storage is viewed as
    pub format: DataFormat,
    /// Per-channel swizzle (r, g, b, a)
    pub swizzle: [Swizzle; 4],
}

impl ImageView {
    /// Identity view in the given format
    pub const fn new(format: DataFormat) -> Self {
        Self {
            format,
            swizzle: [Swizzle::Identity; 4],
        }
    }

    /// Set the channel swizzle
    pub const fn with_swizzle(mut self, swizzle: [Swizzle; 4]) -> Self {
        self.swizzle = swizzle;
        self
    }
}

/// Texel filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerFilter {
    /// Nearest texel
    #[default]
    Nearest,
    /// Linear interpolation
    Linear,
}

/// Addressing outside `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerRepeatMode {
    /// Wrap around
    #[default]
    Repeat,
    /// Wrap with mirroring
    MirroredRepeat,
    /// Clamp to the edge texel
    ClampToEdge,
    /// Clamp to the border color
    ClampToBorder,
    /// Mirror once then clamp
    MirrorClampToEdge,
}

/// Depth comparison for shadow samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOperator {
    /// Never passes
    Never,
    /// Reference < sample
    Less,
    /// Reference == sample
    Equal,
    /// Reference <= sample
    LessOrEqual,
    /// Reference > sample
    Greater,
    /// Reference != sample
    NotEqual,
    /// Reference >= sample
    GreaterOrEqual,
    /// Always passes
    #[default]
    Always,
}

/// Border color for `ClampToBorder`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerBorderColor {
    /// Float (0, 0, 0, 0)
    FloatTransparentBlack,
    /// Integer (0, 0, 0, 0)
    IntTransparentBlack,
    /// Float (0, 0, 0, 1)
    #[default]
    FloatOpaqueBlack,
    /// Integer (0, 0, 0, 1)
    IntOpaqueBlack,
    /// Float (1, 1, 1, 1)
    FloatOpaqueWhite,
    /// Integer (1, 1, 1, 1)
    IntOpaqueWhite,
}

/// Full sampler configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerState {
    /// Magnification filter
    pub mag_filter: SamplerFilter,
    /// Minification filter
    pub min_filter: SamplerFilter,
    /// Filter between mip levels
    pub mip_filter: SamplerFilter,
    /// Addressing along U
    pub repeat_u: SamplerRepeatMode,
    /// Addressing along V
    pub repeat_v: SamplerRepeatMode,
    /// Addressing along W
    pub repeat_w: SamplerRepeatMode,
    /// Bias added to the computed LOD
    pub lod_bias: f32,
    /// Anisotropic filtering switch
    pub use_anisotropy: bool,
    /// Maximum anisotropy when enabled
    pub anisotropy_max: f32,
    /// Depth comparison switch
    pub enable_compare: bool,
    /// Comparison used when enabled
    pub compare_op: CompareOperator,
    /// Lowest LOD
    pub min_lod: f32,
    /// Highest LOD
    pub max_lod: f32,
    /// Border color
    pub border_color: SamplerBorderColor,
    /// Address in texels instead of `[0, 1]`
    pub unnormalized_uvw: bool,
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            mag_filter: SamplerFilter::Nearest,
            min_filter: SamplerFilter::Nearest,
            mip_filter: SamplerFilter::Nearest,
            repeat_u: SamplerRepeatMode::ClampToEdge,
            repeat_v: SamplerRepeatMode::ClampToEdge,
            repeat_w: SamplerRepeatMode::ClampToEdge,
            lod_bias: 0.0,
            use_anisotropy: false,
            anisotropy_max: 1.0,
            enable_compare: false,
            compare_op: CompareOperator::Always,
            min_lod: 0.0,
            max_lod: 1e20,
            border_color: SamplerBorderColor::FloatOpaqueBlack,
            unnormalized_uvw: false,
        }
    }
}

impl SamplerState {
    /// Trilinear filtering with wrapping
    pub fn linear_repeat() -> Self {
        Self {
            mag_filter: SamplerFilter::Linear,
            min_filter: SamplerFilter::Linear,
            mip_filter: SamplerFilter::Linear,
            repeat_u: SamplerRepeatMode::Repeat,
            repeat_v: SamplerRepeatMode::Repeat,
            repeat_w: SamplerRepeatMode::Repeat,
            ..Self::default()
        }
    }

    /// Check the state against the rules every backend shares
    pub fn validate(&self) -> DriverResult<()> {
        if self.min_lod.is_nan() || self.max_lod.is_nan() || self.min_lod > self.max_lod {
            return Err(DriverError::contract(format!(
                "sampler LOD range {}..{} is empty",
                self.min_lod, self.max_lod
            )));
        }
        if self.use_anisotropy && !(self.anisotropy_max >= 1.0) {
            return Err(DriverError::contract(format!(
                "anisotropy level {} is below 1",
                self.anisotropy_max
            )));
        }
        if self.unnormalized_uvw {
            let clamps = [self.repeat_u, self.repeat_v].iter().all(|mode| {
                matches!(
                    mode,
                    SamplerRepeatMode::ClampToEdge | SamplerRepeatMode::ClampToBorder
                )
            });
            if !clamps
                || self.use_anisotropy
                || self.enable_compare
                || self.mag_filter != self.min_filter
                || self.mip_filter != SamplerFilter::Nearest
                || self.min_lod != 0.0
                || self.max_lod != 0.0
            {
                return Err(DriverError::unsupported(
                    "unnormalized coordinates need clamped, unfiltered-mip, non-compare sampling with LOD 0",
                ));
            }
        }
        Ok(())
    }
}

/// Where buffer memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryAccess {
    /// Host visible and coherent, readable and writable from the CPU
    #[default]
    HostVisible,
    /// Device local, reachable only through copy commands
    GpuOnly,
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescription {
    /// Allowed operations
    pub usage: BufferUsage,
    /// Number of elements
    pub count: u64,
    /// Bytes per element
    pub stride: u64,
    /// Memory placement
    pub memory: MemoryAccess,
}

impl BufferDescription {
    /// Host-visible buffer of `count` elements of `stride` bytes
    pub const fn new(usage: BufferUsage, count: u64, stride: u64) -> Self {
        Self {
            usage,
            count,
            stride,
            memory: MemoryAccess::HostVisible,
        }
    }

    /// Place the buffer in device-local memory
    pub const fn gpu_only(mut self) -> Self {
        self.memory = MemoryAccess::GpuOnly;
        self
    }

    /// Total size in bytes, `None` on overflow
    pub const fn size(&self) -> Option<u64> {
        self.count.checked_mul(self.stride)
    }

    /// Size after checking the description can be created
    pub fn validated_size(&self) -> DriverResult<u64> {
        if self.usage.is_empty() {
            return Err(DriverError::contract("buffer usage must not be empty"));
        }
        match self.size() {
            Some(0) => Err(DriverError::contract("buffer size must be non-zero")),
            Some(size) => Ok(size),
            None => Err(DriverError::OutOfDeviceMemory { requested: u64::MAX }),
        }
    }
}

/// Range of mip levels and layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSubresourceRange {
    /// Aspects addressed
    pub aspect: ImageAspect,
    /// First mip level
    pub base_mip: u32,
    /// Number of mip levels
    pub mip_count: u32,
    /// First array layer
    pub base_layer: u32,
    /// Number of array layers
    pub layer_count: u32,
}

impl ImageSubresourceRange {
    /// Every mip and layer of the given format
    pub fn whole(format: &ImageFormat) -> Self {
        Self {
            aspect: format.format.aspects(),
            base_mip: 0,
            mip_count: format.mipmaps,
            base_layer: 0,
            layer_count: format.array_layers,
        }
    }

    /// Check the range lies inside `format`
    pub fn validate(&self, format: &ImageFormat) -> DriverResult<()> {
        check_aspect(self.aspect, format)?;
        let mips_ok = self.mip_count > 0
            && self
                .base_mip
                .checked_add(self.mip_count)
                .is_some_and(|end| end <= format.mipmaps);
        let layers_ok = self.layer_count > 0
            && self
                .base_layer
                .checked_add(self.layer_count)
                .is_some_and(|end| end <= format.array_layers);
        if mips_ok && layers_ok {
            Ok(())
        } else {
            Err(DriverError::contract(format!(
                "subresource range {self:?} outside image with {} mips and {} layers",
                format.mipmaps, format.array_layers
            )))
        }
    }

    /// Every (layer, mip) pair in the range
    pub fn subresources(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.base_layer..self.base_layer + self.layer_count)
            .flat_map(move |layer| (self.base_mip..self.base_mip + self.mip_count).map(move |mip| (layer, mip)))
    }
}

/// Layers of a single mip level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSubresourceLayers {
    /// Aspects addressed
    pub aspect: ImageAspect,
    /// Mip level
    pub mip_level: u32,
    /// First array layer
    pub base_layer: u32,
    /// Number of array layers
    pub layer_count: u32,
}

impl ImageSubresourceLayers {
    /// Single color layer at mip 0
    pub fn color(layer: u32) -> Self {
        Self {
            aspect: ImageAspect::COLOR,
            mip_level: 0,
            base_layer: layer,
            layer_count: 1,
        }
    }

    /// As a one-mip range
    pub const fn as_range(&self) -> ImageSubresourceRange {
        ImageSubresourceRange {
            aspect: self.aspect,
            base_mip: self.mip_level,
            mip_count: 1,
            base_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }

    /// Check the layers and a region at `offset` of `extent` lie inside `format`
    pub fn validate_region(
        &self,
        format: &ImageFormat,
        offset: [u32; 3],
        extent: [u32; 3],
    ) -> DriverResult<()> {
        self.as_range().validate(format)?;
        if self.aspect.bits().count_ones() != 1 {
            return Err(DriverError::contract("copy regions address exactly one aspect"));
        }
        let mip_extent = format.mip_extent(self.mip_level);
        let (bw, bh) = format.format.block_extent();
        for axis in 0..3 {
            let end = offset[axis].checked_add(extent[axis]);
            if extent[axis] == 0 || end.map_or(true, |end| end > mip_extent[axis]) {
                return Err(DriverError::contract(format!(
                    "region {offset:?}+{extent:?} outside mip {} extent {mip_extent:?}",
                    self.mip_level
                )));
            }
        }
        let aligned = |value: u32, block: u32, limit: u32| value % block == 0 || value == limit;
        if !(aligned(offset[0], bw, 0)
            && aligned(offset[1], bh, 0)
            && aligned(offset[0] + extent[0], bw, mip_extent[0])
            && aligned(offset[1] + extent[1], bh, mip_extent[1]))
        {
            return Err(DriverError::contract(
                "compressed image regions must be block aligned",
            ));
        }
        Ok(())
    }
}

fn check_aspect(aspect: ImageAspect, format: &ImageFormat) -> DriverResult<()> {
    if aspect.is_empty() || !format.format.aspects().contains(aspect) {
        return Err(DriverError::contract(format!(
            "aspect {aspect:?} not present in {:?}",
            format.format
        )));
    }
    Ok(())
}

/// Byte range copied between two buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopyRegion {
    /// Offset in the source buffer
    pub src_offset: u64,
    /// Offset in the destination buffer
    pub dst_offset: u64,
    /// Number of bytes
    pub size: u64,
}

/// Texel region copied between two images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCopyRegion {
    /// Source layers
    pub src_subresources: ImageSubresourceLayers,
    /// Source texel offset
    pub src_offset: [u32; 3],
    /// Destination layers
    pub dst_subresources: ImageSubresourceLayers,
    /// Destination texel offset
    pub dst_offset: [u32; 3],
    /// Texel extent
    pub extent: [u32; 3],
}

/// Region copied between a buffer and an image
///
/// Buffer data is tightly packed: rows of blocks, then slices, then layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopyRegion {
    /// Offset of the first texel in the buffer
    pub buffer_offset: u64,
    /// Image layers
    pub subresources: ImageSubresourceLayers,
    /// Image texel offset
    pub image_offset: [u32; 3],
    /// Image texel extent
    pub image_extent: [u32; 3],
}

impl BufferImageCopyRegion {
    /// Buffer bytes covered by the region
    pub fn buffer_size(&self, format: DataFormat) -> u64 {
        let (bw, bh) = format.block_extent();
        let [w, h, d] = self.image_extent;
        u64::from(w.div_ceil(bw))
            * u64::from(h.div_ceil(bh))
            * u64::from(d)
            * u64::from(format.block_size())
            * u64::from(self.subresources.layer_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_description_size() {
        let desc = BufferDescription::new(BufferUsage::VERTEX, 4, 12);
        assert_eq!(desc.size(), Some(48));
        assert_eq!(desc.validated_size().unwrap(), 48);
        assert_eq!(desc.memory, MemoryAccess::HostVisible);

        let empty = BufferDescription::new(BufferUsage::VERTEX, 0, 12);
        assert!(matches!(empty.validated_size(), Err(DriverError::ContractViolation(_))));

        let huge = BufferDescription::new(BufferUsage::STORAGE, u64::MAX, 2);
        assert!(huge.size().is_none());
    }

    #[test]
    fn test_image_sizes_and_offsets() {
        let format = ImageFormat::new_2d(DataFormat::R8G8B8A8Unorm, 8, 4, ImageUsage::SAMPLING)
            .with_mipmaps(3)
            .with_layers(1)
            .with_type(TextureType::Type2DArray, 1)
            .with_layers(2);
        assert_eq!(format.max_mipmaps(), 4);
        assert_eq!(format.mip_extent(2), [2, 1, 1]);
        assert_eq!(format.subresource_size(0), 128);
        assert_eq!(format.subresource_size(1), 32);
        assert_eq!(format.subresource_size(2), 8);
        assert_eq!(format.layer_size(), 168);
        assert_eq!(format.total_size(), 336);
        assert_eq!(format.subresource_offset(1, 1), 168 + 128);
        assert!(format.validate().is_ok());
    }

    #[test]
    fn test_compressed_sizes_round_up_to_blocks() {
        let format =
            ImageFormat::new_2d(DataFormat::Bc1RgbaUnormBlock, 6, 6, ImageUsage::SAMPLING);
        assert_eq!(format.subresource_size(0), 4 * 8);
    }

    #[test]
    fn test_image_validation() {
        let base = ImageFormat::new_2d(DataFormat::R8G8B8A8Unorm, 16, 16, ImageUsage::SAMPLING);
        assert!(base.with_mipmaps(6).validate().is_err());
        assert!(base.with_type(TextureType::Cube, 1).validate().is_err());
        assert!(base.with_type(TextureType::Cube, 1).with_layers(6).validate().is_ok());
        assert!(matches!(
            base.with_samples(SampleCount::X4).with_mipmaps(2).validate(),
            Err(DriverError::Unsupported { .. })
        ));

        let depth = ImageFormat::new_2d(
            DataFormat::D32Sfloat,
            16,
            16,
            ImageUsage::DEPTH_STENCIL_ATTACHMENT | ImageUsage::CPU_READ,
        );
        assert!(matches!(depth.validate(), Err(DriverError::Unsupported { .. })));

        let compressed_target = ImageFormat::new_2d(
            DataFormat::Bc3UnormBlock,
            16,
            16,
            ImageUsage::COLOR_ATTACHMENT,
        );
        assert!(compressed_target.validate().is_err());
    }

    #[test]
    fn test_subresource_range_validation() {
        let format = ImageFormat::new_2d(DataFormat::R8Unorm, 4, 4, ImageUsage::SAMPLING)
            .with_mipmaps(2);
        let whole = ImageSubresourceRange::whole(&format);
        assert!(whole.validate(&format).is_ok());
        assert_eq!(whole.subresources().collect::<Vec<_>>(), vec![(0, 0), (0, 1)]);

        let beyond = ImageSubresourceRange { mip_count: 3, ..whole };
        assert!(beyond.validate(&format).is_err());

        let depth_aspect = ImageSubresourceRange { aspect: ImageAspect::DEPTH, ..whole };
        assert!(depth_aspect.validate(&format).is_err());
    }

    #[test]
    fn test_region_validation() {
        let format = ImageFormat::new_2d(DataFormat::R8Unorm, 4, 4, ImageUsage::SAMPLING);
        let layers = ImageSubresourceLayers::color(0);
        assert!(layers.validate_region(&format, [0, 0, 0], [4, 4, 1]).is_ok());
        assert!(layers.validate_region(&format, [1, 0, 0], [4, 4, 1]).is_err());
        assert!(layers.validate_region(&format, [0, 0, 0], [0, 4, 1]).is_err());

        let bc = ImageFormat::new_2d(DataFormat::Bc1RgbaUnormBlock, 8, 8, ImageUsage::SAMPLING);
        assert!(layers.validate_region(&bc, [4, 0, 0], [4, 4, 1]).is_ok());
        assert!(layers.validate_region(&bc, [2, 0, 0], [4, 4, 1]).is_err());
    }

    #[test]
    fn test_color_encoding() {
        assert_eq!(
            DataFormat::B8G8R8A8Unorm.encode_color([1.0, 0.0, 0.5, 1.0]),
            Some(vec![128, 0, 255, 255])
        );
        assert_eq!(
            DataFormat::R8G8B8A8Srgb.encode_color([0.5, 0.0, 1.0, 0.5]).unwrap(),
            vec![188, 0, 255, 128]
        );
        assert_eq!(
            DataFormat::R32Sfloat.encode_color([2.5, 0.0, 0.0, 0.0]).unwrap(),
            2.5f32.to_le_bytes().to_vec()
        );
        assert!(DataFormat::D32Sfloat.encode_color([0.0; 4]).is_none());
    }

    #[test]
    fn test_sampler_validation() {
        assert!(SamplerState::default().validate().is_ok());
        assert!(SamplerState::linear_repeat().validate().is_ok());

        let inverted = SamplerState { min_lod: 4.0, max_lod: 1.0, ..SamplerState::default() };
        assert!(inverted.validate().is_err());

        let aniso = SamplerState { use_anisotropy: true, anisotropy_max: 0.5, ..SamplerState::default() };
        assert!(aniso.validate().is_err());

        let unnormalized = SamplerState {
            unnormalized_uvw: true,
            max_lod: 0.0,
            ..SamplerState::default()
        };
        assert!(unnormalized.validate().is_ok());
        let bad_unnormalized = SamplerState { repeat_u: SamplerRepeatMode::Repeat, ..unnormalized };
        assert!(matches!(bad_unnormalized.validate(), Err(DriverError::Unsupported { .. })));
    }

    #[test]
    fn test_view_compatibility() {
        assert!(DataFormat::R8G8B8A8Unorm.is_view_compatible(DataFormat::R8G8B8A8Srgb));
        assert!(DataFormat::R8G8B8A8Unorm.is_view_compatible(DataFormat::R32Sfloat));
        assert!(!DataFormat::R8G8B8A8Unorm.is_view_compatible(DataFormat::R8G8Unorm));
        assert!(!DataFormat::R32Sfloat.is_view_compatible(DataFormat::D32Sfloat));
    }
}

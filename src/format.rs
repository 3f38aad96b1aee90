//! Engine-neutral enums and their translation to `ash::vk` (SPEC_FULL.md §4
//! component 1). These are the types the rest of the crate's public API is
//! expressed in; nothing outside this module should name an `ash::vk` enum
//! directly when describing a resource-create input.

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Format {
    Unknown,
    R8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    R16G16Float,
    R16G16B16A16Float,
    R32Float,
    R32G32Float,
    R32G32B32Float,
    R32G32B32A32Float,
    D32Float,
    D24UnormS8Uint,
    D32FloatS8Uint,
}

impl Format {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Format::Unknown => vk::Format::UNDEFINED,
            Format::R8Unorm => vk::Format::R8_UNORM,
            Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
            Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::R16G16Float => vk::Format::R16G16_SFLOAT,
            Format::R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
            Format::R32Float => vk::Format::R32_SFLOAT,
            Format::R32G32Float => vk::Format::R32G32_SFLOAT,
            Format::R32G32B32Float => vk::Format::R32G32B32_SFLOAT,
            Format::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
            Format::D32Float => vk::Format::D32_SFLOAT,
            Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
            Format::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float | Format::D24UnormS8Uint | Format::D32FloatS8Uint)
    }

    pub fn is_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32FloatS8Uint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            CompareOp::Never => vk::CompareOp::NEVER,
            CompareOp::Less => vk::CompareOp::LESS,
            CompareOp::Equal => vk::CompareOp::EQUAL,
            CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOp::Greater => vk::CompareOp::GREATER,
            CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareOp::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

impl FilterMode {
    pub fn to_vk(self) -> vk::Filter {
        match self {
            FilterMode::Nearest => vk::Filter::NEAREST,
            FilterMode::Linear => vk::Filter::LINEAR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

impl AddressMode {
    pub fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

impl PrimitiveTopology {
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

impl PolygonMode {
    pub fn to_vk(self) -> vk::PolygonMode {
        match self {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Line => vk::PolygonMode::LINE,
            PolygonMode::Point => vk::PolygonMode::POINT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
    FrontAndBack,
}

impl CullMode {
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    CounterClockwise,
    Clockwise,
}

impl FrontFace {
    pub fn to_vk(self) -> vk::FrontFace {
        match self {
            FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        }
    }
}

bitflags::bitflags! {
    /// Usage flags for [`crate::buffer::Buffer`] creation.
    pub struct BufferUsage: u32 {
        const VERTEX       = 1 << 0;
        const INDEX        = 1 << 1;
        const UNIFORM      = 1 << 2;
        const STORAGE      = 1 << 3;
        const UNIFORM_TEXEL = 1 << 4;
        const STORAGE_TEXEL = 1 << 5;
        const INDIRECT     = 1 << 6;
        const TRANSFER_SRC = 1 << 7;
        const TRANSFER_DST = 1 << 8;
    }
}

impl BufferUsage {
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut out = vk::BufferUsageFlags::empty();
        if self.contains(BufferUsage::VERTEX) {
            out |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(BufferUsage::INDEX) {
            out |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(BufferUsage::UNIFORM) {
            out |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(BufferUsage::STORAGE) {
            out |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(BufferUsage::UNIFORM_TEXEL) {
            out |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER;
        }
        if self.contains(BufferUsage::STORAGE_TEXEL) {
            out |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
        }
        if self.contains(BufferUsage::INDIRECT) {
            out |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        if self.contains(BufferUsage::TRANSFER_SRC) {
            out |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(BufferUsage::TRANSFER_DST) {
            out |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        out
    }
}

bitflags::bitflags! {
    /// Usage flags for [`crate::texture::Texture`] creation.
    pub struct TextureUsage: u32 {
        const SAMPLED          = 1 << 0;
        const STORAGE          = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC     = 1 << 4;
        const TRANSFER_DST     = 1 << 5;
    }
}

impl TextureUsage {
    pub fn to_vk(self) -> vk::ImageUsageFlags {
        let mut out = vk::ImageUsageFlags::empty();
        if self.contains(TextureUsage::SAMPLED) {
            out |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.contains(TextureUsage::STORAGE) {
            out |= vk::ImageUsageFlags::STORAGE;
        }
        if self.contains(TextureUsage::COLOR_ATTACHMENT) {
            out |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if self.contains(TextureUsage::DEPTH_ATTACHMENT) {
            out |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if self.contains(TextureUsage::TRANSFER_SRC) {
            out |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.contains(TextureUsage::TRANSFER_DST) {
            out |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        out
    }
}

/// The layout a [`crate::texture::Texture`] subresource is transitioned to
/// depending on how it is currently bound (SPEC_FULL.md §8, property 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachmentOptimal,
    DepthStencilAttachmentOptimal,
    ShaderReadOnlyOptimal,
    TransferSrcOptimal,
    TransferDstOptimal,
    PresentSrc,
}

impl ImageLayout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::General => vk::ImageLayout::GENERAL,
            ImageLayout::ColorAttachmentOptimal => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayout::DepthStencilAttachmentOptimal => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ImageLayout::ShaderReadOnlyOptimal => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayout::TransferSrcOptimal => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageLayout::TransferDstOptimal => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

impl LoadOp {
    pub fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            LoadOp::Load => vk::AttachmentLoadOp::LOAD,
            LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
            LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

impl StoreOp {
    pub fn to_vk(self) -> vk::AttachmentStoreOp {
        match self {
            StoreOp::Store => vk::AttachmentStoreOp::STORE,
            StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        }
    }
}

/// Per-axis combiner op for `VK_KHR_fragment_shading_rate` (SPEC_FULL.md
/// §4.7, `shading_rate`). Numeric values match
/// `VkFragmentShadingRateCombinerOpKHR` directly since this crate loads the
/// extension's entry point by hand (see `device::Device::cmd_set_fragment_shading_rate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadingRateCombiner {
    Keep,
    Replace,
    Min,
    Max,
    Mul,
}

impl ShadingRateCombiner {
    pub fn to_raw(self) -> i32 {
        match self {
            ShadingRateCombiner::Keep => 0,
            ShadingRateCombiner::Replace => 1,
            ShadingRateCombiner::Min => 2,
            ShadingRateCombiner::Max => 3,
            ShadingRateCombiner::Mul => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_are_classified_correctly() {
        assert!(Format::D32Float.is_depth());
        assert!(!Format::D32Float.is_stencil());
        assert!(Format::D24UnormS8Uint.is_stencil());
        assert!(!Format::R8G8B8A8Unorm.is_depth());
    }

    #[test]
    fn buffer_usage_union_maps_every_flag() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
        let vk_usage = usage.to_vk();
        assert!(vk_usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(vk_usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!vk_usage.contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }

    #[test]
    fn shading_rate_combiner_values_match_khr_enum() {
        assert_eq!(ShadingRateCombiner::Keep.to_raw(), 0);
        assert_eq!(ShadingRateCombiner::Mul.to_raw(), 4);
    }
}

//! Views over a [`crate::texture::Texture`] (SPEC_FULL.md §3, "View").

use ash::vk;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::format::Format;
use crate::handle::Handle;
use crate::texture::Texture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// Shader resource view (sampled or combined-image-sampler read).
    Srv,
    /// Unordered-access view (storage image read/write).
    Uav,
    /// Render-target view (color attachment).
    Rtv,
    /// Depth-stencil view (depth/stencil attachment).
    Dsv,
}

#[derive(Debug, Clone, Copy)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl Default for SubresourceRange {
    fn default() -> Self {
        SubresourceRange { base_mip: 0, mip_count: 1, base_layer: 0, layer_count: 1 }
    }
}

/// A `(texture, subresource range, interpretation)` tuple. The view's format
/// may differ from the texture's storage format (e.g. a typeless depth
/// texture read as a depth-only SRV vs. bound as a combined DSV).
pub struct View {
    device: Arc<Device>,
    texture: Handle<Texture>,
    raw: vk::ImageView,
    kind: ViewKind,
    format: Format,
    range: SubresourceRange,
}

unsafe impl Send for View {}
unsafe impl Sync for View {}

impl View {
    pub fn new(
        device: &Arc<Device>,
        texture: Handle<Texture>,
        kind: ViewKind,
        format: Format,
        range: SubresourceRange,
    ) -> Result<View> {
        let aspect_mask = match kind {
            ViewKind::Dsv if format.is_stencil() => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            ViewKind::Dsv => vk::ImageAspectFlags::DEPTH,
            _ if format.is_depth() => vk::ImageAspectFlags::DEPTH,
            _ => vk::ImageAspectFlags::COLOR,
        };

        let subresource = vk::ImageSubresourceRange::builder()
            .aspect_mask(aspect_mask)
            .base_mip_level(range.base_mip)
            .level_count(range.mip_count)
            .base_array_layer(range.base_layer)
            .layer_count(range.layer_count);

        let view_type = if range.layer_count > 1 { vk::ImageViewType::TYPE_2D_ARRAY } else { vk::ImageViewType::TYPE_2D };

        let info = vk::ImageViewCreateInfo::builder()
            .image(texture.raw())
            .view_type(view_type)
            .format(format.to_vk())
            .subresource_range(subresource.build());

        let raw = unsafe { device.raw().create_image_view(&info, None)? };

        Ok(View { device: device.clone(), texture, raw, kind, format, range })
    }

    pub fn raw(&self) -> vk::ImageView {
        self.raw
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn range(&self) -> SubresourceRange {
        self.range
    }

    pub fn texture(&self) -> &Handle<Texture> {
        &self.texture
    }

    pub fn extent(&self) -> (u32, u32) {
        let desc = self.texture.descriptor();
        (desc.width, desc.height)
    }
}

impl Drop for View {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_image_view(self.raw, None);
        }
    }
}

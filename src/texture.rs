//! GPU image resource with per-subresource layout tracking and weak
//! render-target back-references (SPEC_FULL.md §3 "Texture", §9 "cyclic
//! references between RT and Texture").

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::format::{Format, ImageLayout, TextureUsage};
use crate::handle::WeakHandle;
use crate::memory::AllocatedMemory;
use crate::render_pass::RenderTarget;

#[derive(Debug, Clone, Copy)]
pub struct TextureDescriptor {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        TextureDescriptor {
            format: Format::R8G8B8A8Unorm,
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: TextureUsage::SAMPLED,
        }
    }
}

/// Per-subresource layout state, tracked from the owning command stream's
/// viewpoint (SPEC_FULL.md §3 invariant: "A Texture's layout field always
/// reflects the most-recently-recorded transition").
struct LayoutState {
    current: ImageLayout,
}

pub struct Texture {
    device: Arc<Device>,
    raw: vk::Image,
    memory: Option<AllocatedMemory>,
    desc: TextureDescriptor,
    layout: Mutex<LayoutState>,
    /// Render targets that hold a view into this texture. Weak: the RT owns
    /// its views (and thus keeps the texture alive via the view), the
    /// texture does not keep the RT alive (SPEC_FULL.md §9).
    referencing_render_targets: Mutex<Vec<WeakHandle<RenderTarget>>>,
    /// False for swapchain backbuffers, whose `VkImage` is owned by the
    /// swapchain and destroyed by `vkDestroySwapchainKHR` (SPEC_FULL.md §4.9).
    owns_image: bool,
}

unsafe impl Send for Texture {}
unsafe impl Sync for Texture {}

impl Texture {
    pub fn new(device: &Arc<Device>, desc: TextureDescriptor, memory: Option<AllocatedMemory>) -> Result<Texture> {
        let image_type = if desc.depth > 1 { vk::ImageType::TYPE_3D } else { vk::ImageType::TYPE_2D };
        let info = vk::ImageCreateInfo::builder()
            .image_type(image_type)
            .format(desc.format.to_vk())
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: desc.depth })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(samples_flags(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { device.raw().create_image(&info, None)? };
        if let Some(mem) = &memory {
            unsafe { device.raw().bind_image_memory(raw, mem.memory, mem.offset)? };
        }

        Ok(Texture {
            device: device.clone(),
            raw,
            memory,
            desc,
            layout: Mutex::new(LayoutState { current: ImageLayout::Undefined }),
            referencing_render_targets: Mutex::new(Vec::new()),
            owns_image: true,
        })
    }

    /// Wraps a `VkImage` this `Texture` does not own, e.g. a swapchain
    /// backbuffer (SPEC_FULL.md §4.9). `Drop` skips `vkDestroyImage`.
    pub fn from_raw(device: &Arc<Device>, raw: vk::Image, desc: TextureDescriptor, initial_layout: ImageLayout) -> Texture {
        Texture {
            device: device.clone(),
            raw,
            memory: None,
            desc,
            layout: Mutex::new(LayoutState { current: initial_layout }),
            referencing_render_targets: Mutex::new(Vec::new()),
            owns_image: false,
        }
    }

    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn descriptor(&self) -> TextureDescriptor {
        self.desc
    }

    pub fn current_layout(&self) -> ImageLayout {
        self.layout.lock().current
    }

    /// Records that the owning command stream has transitioned this
    /// subresource to `new_layout`. Returns the previous layout so the caller
    /// (the state manager, SPEC_FULL.md §4.6 step 4) can decide whether a
    /// barrier is actually required.
    pub fn transition(&self, new_layout: ImageLayout) -> ImageLayout {
        let mut state = self.layout.lock();
        let old = state.current;
        state.current = new_layout;
        old
    }

    pub fn register_render_target(&self, rt: &crate::handle::Handle<RenderTarget>) {
        self.referencing_render_targets.lock().push(rt.into());
    }

    /// Invalidates every render target referencing this texture. Called by
    /// the deferred-destroy path before the texture's backend object is
    /// actually freed (SPEC_FULL.md §4.5).
    pub fn invalidate_referencing_render_targets(&self, cache: &crate::render_pass::RenderPassCache) {
        let refs = self.referencing_render_targets.lock();
        for weak in refs.iter() {
            if let Some(rt) = weak.upgrade() {
                cache.evict(&rt);
            }
        }
    }
}

fn samples_flags(samples: u32) -> vk::SampleCountFlags {
    match samples {
        1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if self.owns_image {
            unsafe {
                self.device.raw().destroy_image(self.raw, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_maps_known_values() {
        assert_eq!(samples_flags(1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(samples_flags(4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(samples_flags(3), vk::SampleCountFlags::TYPE_1);
    }
}

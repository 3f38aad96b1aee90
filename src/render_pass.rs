//! Render pass / framebuffer cache and render-target back-reference
//! bookkeeping (SPEC_FULL.md §4.5, §9).
//!
//! Keys attachments by identity; produces a single `VkRenderPass` +
//! `VkFramebuffer` pair per key, or is skipped entirely when the device
//! supports dynamic rendering (`vulkan_context.cpp::begin_rendering`).

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::format::{Format, LoadOp, StoreOp};
use crate::handle::Handle;
use crate::view::View;

const MAX_COLOR_ATTACHMENTS: usize = 4;

/// Canonical sentinel used for unused attachment slots so the key is a fixed
/// size array regardless of how many attachments are actually bound
/// (SPEC_FULL.md §4.5: "Missing slots are canonicalized to a sentinel
/// format").
const UNUSED_SLOT: AttachmentKey = AttachmentKey { format: Format::Unknown, load: LoadOp::DontCare, store: StoreOp::DontCare, samples: 1 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    pub format: Format,
    pub load: LoadOp,
    pub store: StoreOp,
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub colors: [AttachmentKey; MAX_COLOR_ATTACHMENTS],
    pub depth_stencil: Option<AttachmentKey>,
}

impl RenderPassKey {
    pub fn new(colors: &[AttachmentKey], depth_stencil: Option<AttachmentKey>) -> Self {
        let mut slots = [UNUSED_SLOT; MAX_COLOR_ATTACHMENTS];
        for (slot, color) in slots.iter_mut().zip(colors.iter()) {
            *slot = *color;
        }
        RenderPassKey { colors: slots, depth_stencil }
    }

    /// Two render-pass keys are Vulkan-"compatible" (SPEC_FULL.md §3, §8
    /// property 4) iff they are identical under this definition: this
    /// reimplementation uses exact key equality as its compatibility
    /// relation, which is sufficient (though stricter than Vulkan's formal
    /// rules) because the cache only ever hands back a renderpass created
    /// from an identical key.
    pub fn compatible_with(&self, other: &RenderPassKey) -> bool {
        self == other
    }
}

pub struct RenderPass {
    device: Arc<Device>,
    raw: vk::RenderPass,
    key: RenderPassKey,
}

impl RenderPass {
    pub fn raw(&self) -> vk::RenderPass {
        self.raw
    }

    pub fn key(&self) -> &RenderPassKey {
        &self.key
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.raw().destroy_render_pass(self.raw, None) };
    }
}

/// A set of attachment views plus the renderpass/framebuffer pair compatible
/// with them, or nothing (when the device uses dynamic rendering).
pub struct RenderTarget {
    pub key: RenderPassKey,
    pub color_views: Vec<Handle<View>>,
    pub depth_stencil_view: Option<Handle<View>>,
    pub extent: (u32, u32),
    render_pass: Option<Handle<RenderPass>>,
    framebuffer: Option<vk::Framebuffer>,
}

impl RenderTarget {
    pub fn render_pass(&self) -> Option<&Handle<RenderPass>> {
        self.render_pass.as_ref()
    }

    pub fn framebuffer(&self) -> Option<vk::Framebuffer> {
        self.framebuffer
    }
}

/// Cache of `RenderPassKey -> RenderPass` plus `(key, views) -> Framebuffer`,
/// guarded by a single critical section (SPEC_FULL.md §5).
pub struct RenderPassCache {
    device: Arc<Device>,
    render_passes: Mutex<HashMap<RenderPassKey, Handle<RenderPass>>>,
    framebuffers: Mutex<HashMap<usize, vk::Framebuffer>>,
}

impl RenderPassCache {
    pub fn new(device: &Arc<Device>) -> Self {
        RenderPassCache { device: device.clone(), render_passes: Mutex::new(HashMap::new()), framebuffers: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_create_render_pass(&self, key: RenderPassKey) -> Result<Handle<RenderPass>> {
        let mut cache = self.render_passes.lock();
        if let Some(existing) = cache.get(&key) {
            return Ok(existing.clone());
        }

        let mut attachments = Vec::new();
        let mut color_refs = Vec::new();
        for (i, color) in key.colors.iter().enumerate() {
            if color.format == Format::Unknown {
                continue;
            }
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(color.format.to_vk())
                    .samples(samples_flags(color.samples))
                    .load_op(color.load.to_vk())
                    .store_op(color.store.to_vk())
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            color_refs.push(vk::AttachmentReference { attachment: i as u32, layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL });
        }

        let depth_ref = key.depth_stencil.map(|ds| {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(ds.format.to_vk())
                    .samples(samples_flags(ds.samples))
                    .load_op(ds.load.to_vk())
                    .store_op(ds.store.to_vk())
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            vk::AttachmentReference { attachment: (attachments.len() - 1) as u32, layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL }
        });

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = &depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let subpasses = [subpass.build()];
        let dependencies = [dependency.build()];
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let raw = unsafe { self.device.raw().create_render_pass(&info, None)? };
        log::debug!("render pass cache miss, created new VkRenderPass for key {:?}", key);
        let render_pass = Handle::new(RenderPass { device: self.device.clone(), raw, key });
        cache.insert(key, render_pass.clone());
        Ok(render_pass)
    }

    /// Builds (or reuses, keyed by view identity) a [`RenderTarget`] for the
    /// given attachment views, registering it with each referenced texture
    /// so a later texture destroy can invalidate it (SPEC_FULL.md §4.5).
    pub fn get_or_create_render_target(
        &self,
        color_views: Vec<Handle<View>>,
        depth_stencil_view: Option<Handle<View>>,
        dynamic_rendering: bool,
    ) -> Result<Handle<RenderTarget>> {
        let colors: Vec<AttachmentKey> = color_views
            .iter()
            .map(|v| AttachmentKey { format: v.format(), load: LoadOp::Load, store: StoreOp::Store, samples: 1 })
            .collect();
        let depth_key = depth_stencil_view
            .as_ref()
            .map(|v| AttachmentKey { format: v.format(), load: LoadOp::Load, store: StoreOp::Store, samples: 1 });
        let key = RenderPassKey::new(&colors, depth_key);

        let extent = color_views
            .first()
            .or(depth_stencil_view.as_ref())
            .map(|v| v.extent())
            .unwrap_or((0, 0));

        let (render_pass, framebuffer) = if dynamic_rendering {
            (None, None)
        } else {
            let render_pass = self.get_or_create_render_pass(key)?;
            let mut attachment_views: Vec<vk::ImageView> = color_views.iter().map(|v| v.raw()).collect();
            if let Some(ds) = &depth_stencil_view {
                attachment_views.push(ds.raw());
            }
            let fb_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.raw())
                .attachments(&attachment_views)
                .width(extent.0)
                .height(extent.1)
                .layers(1);
            let framebuffer = unsafe { self.device.raw().create_framebuffer(&fb_info, None)? };
            (Some(render_pass), Some(framebuffer))
        };

        let rt = Handle::new(RenderTarget {
            key,
            color_views: color_views.clone(),
            depth_stencil_view: depth_stencil_view.clone(),
            extent,
            render_pass,
            framebuffer,
        });

        for view in &color_views {
            view.texture().register_render_target(&rt);
        }
        if let Some(ds) = &depth_stencil_view {
            ds.texture().register_render_target(&rt);
        }

        Ok(rt)
    }

    /// Invalidates a render target (e.g. because one of its textures was
    /// destroyed). Destroys its framebuffer if it owns one; the renderpass
    /// itself remains cached and shared by any other compatible RT.
    pub fn evict(&self, rt: &Handle<RenderTarget>) {
        if let Some(fb) = rt.framebuffer() {
            unsafe { self.device.raw().destroy_framebuffer(fb, None) };
        }
        log::trace!("evicted render target for key {:?}", rt.key);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn key(format: Format) -> AttachmentKey {
        AttachmentKey { format, load: LoadOp::Clear, store: StoreOp::Store, samples: 1 }
    }

    #[test]
    fn missing_slots_canonicalize_to_sentinel() {
        let k = RenderPassKey::new(&[key(Format::R8G8B8A8Unorm)], None);
        assert_eq!(k.colors[0].format, Format::R8G8B8A8Unorm);
        assert_eq!(k.colors[1], UNUSED_SLOT);
        assert_eq!(k.colors[2], UNUSED_SLOT);
        assert_eq!(k.colors[3], UNUSED_SLOT);
    }

    #[test]
    fn identical_keys_are_compatible() {
        let a = RenderPassKey::new(&[key(Format::R8G8B8A8Unorm)], Some(key(Format::D32Float)));
        let b = RenderPassKey::new(&[key(Format::R8G8B8A8Unorm)], Some(key(Format::D32Float)));
        assert!(a.compatible_with(&b));
    }

    #[test]
    fn different_depth_format_is_incompatible() {
        let a = RenderPassKey::new(&[key(Format::R8G8B8A8Unorm)], Some(key(Format::D32Float)));
        let b = RenderPassKey::new(&[key(Format::R8G8B8A8Unorm)], Some(key(Format::D24UnormS8Uint)));
        assert!(!a.compatible_with(&b));
    }

    #[test]
    fn different_framebuffer_same_key_is_still_compatible() {
        // Scenario 6: same attachment formats/ops, different framebuffer
        // instance — still the same RenderPassKey.
        let a = RenderPassKey::new(&[key(Format::R8G8B8A8Unorm)], Some(key(Format::D32Float)));
        let b = RenderPassKey::new(&[key(Format::R8G8B8A8Unorm)], Some(key(Format::D32Float)));
        assert_eq!(a, b);
    }
}

//! Dirty-bit binding state and minimal-recording flush (SPEC_FULL.md §4.6).
//!
//! Grounded on `vulkan_pipeline.cpp`'s `is_dirty_state`/`remove_dirty` bit
//! idiom: every binding mutation only sets a flag; the actual `vkCmdBind*`
//! calls are deferred to `flush_graphics`/`flush_compute`, called once per
//! draw/dispatch by [`crate::context::Context`].

use ash::vk;
use smallvec::SmallVec;

use crate::command_buffer::CommandHandle;
use crate::descriptor::{BindingSnapshot, DescriptorAllocator, DescriptorWriteDesc};
use crate::error::Result;
use crate::format::{CullMode, FrontFace, ImageLayout, PolygonMode, PrimitiveTopology, ShadingRateCombiner};
use crate::handle::Handle;
use crate::pipeline::{GraphicsPipeline, GraphicsVariantKey};
use crate::pipeline_layout::{DescriptorType, PipelineLayout};
use crate::render_pass::RenderTarget;
use crate::sampler::Sampler;
use crate::texture::Texture;
use crate::vertex::validate_stride;
use crate::view::View;

const MAX_VERTEX_BUFFERS: usize = 8;
const MAX_BOUND_RESOURCES: usize = 16;

bitflags::bitflags! {
    /// Matches `vulkan_pipeline.cpp`'s dirty-bit mask (SPEC_FULL.md §4.6
    /// ambient note).
    pub struct DirtyFlags: u32 {
        const PIPELINE        = 1 << 0;
        const RENDER_TARGET   = 1 << 1;
        const TOPOLOGY        = 1 << 2;
        const RASTER_STATE    = 1 << 3;
        const VIEWPORT        = 1 << 4;
        const SCISSOR         = 1 << 5;
        const SHADING_RATE    = 1 << 6;
        const VERTEX_BUFFERS  = 1 << 7;
        const INDEX_BUFFER    = 1 << 8;
        const DESCRIPTORS     = 1 << 9;
    }
}

#[derive(Clone, Copy, Default)]
struct VertexBufferBinding {
    buffer: Option<vk::Buffer>,
    offset: u64,
    stride: u32,
}

#[derive(Clone, Copy, Default)]
struct BoundResource {
    view: Option<(usize, vk::ImageView, vk::Format)>,
    sampler: Option<vk::Sampler>,
    buffer: Option<(vk::Buffer, u64, u64)>,
    texel_view: Option<vk::BufferView>,
}

/// Holds the logical binding state for one [`CommandHandle`] and drives
/// minimal re-recording on flush (SPEC_FULL.md §4.6).
pub struct StateManager {
    dirty: DirtyFlags,
    pipeline: Option<Handle<GraphicsPipeline>>,
    render_target: Option<Handle<RenderTarget>>,
    topology: PrimitiveTopology,
    polygon_mode: PolygonMode,
    cull_mode: CullMode,
    front_face: FrontFace,
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    vertex_buffers: [VertexBufferBinding; MAX_VERTEX_BUFFERS],
    index_buffer: Option<(vk::Buffer, u64, vk::IndexType)>,
    resources: [BoundResource; MAX_BOUND_RESOURCES],
    srv_textures: [Option<Handle<Texture>>; MAX_BOUND_RESOURCES],
    uav_textures: [Option<Handle<Texture>>; MAX_BOUND_RESOURCES],
    shading_rate: Option<(vk::Extent2D, [ShadingRateCombiner; 2])>,
}

impl Default for StateManager {
    fn default() -> Self {
        StateManager {
            dirty: DirtyFlags::empty(),
            pipeline: None,
            render_target: None,
            topology: PrimitiveTopology::TriangleList,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            viewport: vk::Viewport::default(),
            scissor: vk::Rect2D::default(),
            vertex_buffers: [VertexBufferBinding::default(); MAX_VERTEX_BUFFERS],
            index_buffer: None,
            resources: [BoundResource::default(); MAX_BOUND_RESOURCES],
            srv_textures: Default::default(),
            uav_textures: Default::default(),
            shading_rate: None,
        }
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pipeline(&mut self, pipeline: Handle<GraphicsPipeline>) {
        self.pipeline = Some(pipeline);
        self.dirty.insert(DirtyFlags::PIPELINE | DirtyFlags::DESCRIPTORS);
    }

    pub fn set_render_target(&mut self, rt: Handle<RenderTarget>) {
        self.render_target = Some(rt);
        self.dirty.insert(DirtyFlags::RENDER_TARGET);
    }

    pub fn set_topology(&mut self, topology: PrimitiveTopology) {
        if self.topology != topology {
            self.topology = topology;
            self.dirty.insert(DirtyFlags::TOPOLOGY);
        }
    }

    pub fn set_raster_state(&mut self, polygon_mode: PolygonMode, cull_mode: CullMode, front_face: FrontFace) {
        if self.polygon_mode != polygon_mode || self.cull_mode != cull_mode || self.front_face != front_face {
            self.polygon_mode = polygon_mode;
            self.cull_mode = cull_mode;
            self.front_face = front_face;
            self.dirty.insert(DirtyFlags::RASTER_STATE);
        }
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.viewport = viewport;
        self.dirty.insert(DirtyFlags::VIEWPORT);
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.scissor = scissor;
        self.dirty.insert(DirtyFlags::SCISSOR);
    }

    pub fn bind_vertex_buffer(&mut self, slot: usize, buffer: vk::Buffer, offset: u64, stride: u32) {
        self.vertex_buffers[slot] = VertexBufferBinding { buffer: Some(buffer), offset, stride };
        self.dirty.insert(DirtyFlags::VERTEX_BUFFERS);
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, ty: vk::IndexType) {
        self.index_buffer = Some((buffer, offset, ty));
        self.dirty.insert(DirtyFlags::INDEX_BUFFER);
    }

    pub fn bind_sampled_image(&mut self, slot: usize, view: &Handle<View>) {
        self.resources[slot].view = Some((view.identity(), view.raw(), view.format().to_vk()));
        self.srv_textures[slot] = Some(view.texture().clone());
        self.dirty.insert(DirtyFlags::DESCRIPTORS);
    }

    pub fn bind_storage_image(&mut self, slot: usize, view: &Handle<View>) {
        self.resources[slot].view = Some((view.identity(), view.raw(), view.format().to_vk()));
        self.uav_textures[slot] = Some(view.texture().clone());
        self.dirty.insert(DirtyFlags::DESCRIPTORS);
    }

    pub fn bind_sampler(&mut self, slot: usize, sampler: &Handle<Sampler>) {
        self.resources[slot].sampler = Some(sampler.raw());
        self.dirty.insert(DirtyFlags::DESCRIPTORS);
    }

    pub fn bind_uniform_buffer(&mut self, slot: usize, buffer: vk::Buffer, offset: u64, size: u64) {
        self.resources[slot].buffer = Some((buffer, offset, size));
        self.dirty.insert(DirtyFlags::DESCRIPTORS);
    }

    pub fn bind_storage_buffer(&mut self, slot: usize, buffer: vk::Buffer, offset: u64, size: u64) {
        self.resources[slot].buffer = Some((buffer, offset, size));
        self.dirty.insert(DirtyFlags::DESCRIPTORS);
    }

    pub fn bind_texel_buffer(&mut self, slot: usize, view: vk::BufferView) {
        self.resources[slot].texel_view = Some(view);
        self.dirty.insert(DirtyFlags::DESCRIPTORS);
    }

    pub fn set_shading_rate(&mut self, extent: vk::Extent2D, combiners: [ShadingRateCombiner; 2]) {
        self.shading_rate = Some((extent, combiners));
        self.dirty.insert(DirtyFlags::SHADING_RATE);
    }

    fn binding_snapshot(&self) -> SmallVec<[BindingSnapshot; MAX_BOUND_RESOURCES]> {
        self.resources
            .iter()
            .map(|r| {
                if let Some((identity, _, _)) = r.view {
                    BindingSnapshot::image(identity)
                } else if let Some(view) = r.texel_view {
                    BindingSnapshot::image(view.as_raw() as usize)
                } else if let Some((buffer, offset, size)) = r.buffer {
                    BindingSnapshot::buffer(buffer.as_raw() as usize, offset, size)
                } else {
                    BindingSnapshot::default()
                }
            })
            .collect()
    }

    /// Step 1-5 of SPEC_FULL.md §4.6's `flush_graphics`: (re)selects the
    /// pipeline variant, binds a deduplicated descriptor set, records
    /// dynamic state, transitions referenced textures, clears dirty bits.
    pub fn flush_graphics(
        &mut self,
        handle: &mut CommandHandle,
        allocator: &mut DescriptorAllocator,
        dynamic_rendering: bool,
    ) -> Result<()> {
        let before = self.dirty;
        log::trace!("flush_graphics: dirty bits = {:?}", before);

        let pipeline = self.pipeline.clone().expect("flush_graphics called with no pipeline bound");
        let rt = self.render_target.clone().expect("flush_graphics called with no render target bound");

        if self.dirty.intersects(DirtyFlags::PIPELINE | DirtyFlags::RENDER_TARGET | DirtyFlags::TOPOLOGY | DirtyFlags::RASTER_STATE) {
            let key = GraphicsVariantKey {
                topology: self.topology,
                polygon_mode: self.polygon_mode,
                cull_mode: self.cull_mode,
                front_face: self.front_face,
                render_pass: rt.key,
            };
            let raw_pipeline = pipeline.variant(key, dynamic_rendering)?;
            unsafe {
                handle.device().raw().cmd_bind_pipeline(handle.raw(), vk::PipelineBindPoint::GRAPHICS, raw_pipeline);
            }
        }

        if self.dirty.contains(DirtyFlags::DESCRIPTORS) {
            let snapshot = self.binding_snapshot();
            let layout = pipeline.layout().clone();
            let set = allocator.get_or_allocate(&layout, &snapshot, |_set| self.descriptor_writes(&layout))?;
            unsafe {
                handle.device().raw().cmd_bind_descriptor_sets(
                    handle.raw(),
                    vk::PipelineBindPoint::GRAPHICS,
                    layout.raw(),
                    0,
                    &[set],
                    &[],
                );
            }
        }

        if self.dirty.intersects(DirtyFlags::VIEWPORT | DirtyFlags::SCISSOR) {
            unsafe {
                handle.device().raw().cmd_set_viewport(handle.raw(), 0, &[self.viewport]);
                handle.device().raw().cmd_set_scissor(handle.raw(), 0, &[self.scissor]);
            }
        }

        if self.dirty.contains(DirtyFlags::SHADING_RATE) {
            if let Some((extent, combiners)) = self.shading_rate {
                let raw_combiners = [combiners[0].to_raw(), combiners[1].to_raw()];
                handle.device().cmd_set_fragment_shading_rate(handle.raw(), extent, raw_combiners);
            }
        }

        if self.dirty.contains(DirtyFlags::VERTEX_BUFFERS) {
            for (slot, binding) in self.vertex_buffers.iter().enumerate() {
                if binding.buffer.is_some() {
                    validate_stride(pipeline.vertex_layout(), slot as u32, binding.stride)?;
                }
            }
            let buffers: SmallVec<[vk::Buffer; MAX_VERTEX_BUFFERS]> =
                self.vertex_buffers.iter().filter_map(|b| b.buffer).collect();
            let offsets: SmallVec<[u64; MAX_VERTEX_BUFFERS]> =
                self.vertex_buffers.iter().filter(|b| b.buffer.is_some()).map(|b| b.offset).collect();
            if !buffers.is_empty() {
                unsafe { handle.device().raw().cmd_bind_vertex_buffers(handle.raw(), 0, &buffers, &offsets) };
            }
        }

        if self.dirty.contains(DirtyFlags::INDEX_BUFFER) {
            if let Some((buffer, offset, ty)) = self.index_buffer {
                unsafe { handle.device().raw().cmd_bind_index_buffer(handle.raw(), buffer, offset, ty) };
            }
        }

        for texture in self.srv_textures.iter().flatten() {
            texture.transition(ImageLayout::ShaderReadOnlyOptimal);
        }
        for texture in self.uav_textures.iter().flatten() {
            texture.transition(ImageLayout::General);
        }

        self.dirty = DirtyFlags::empty();
        log::trace!("flush_graphics: cleared bits {:?}", before);
        Ok(())
    }

    /// Mirrors `flush_graphics`'s descriptor branch for a compute dispatch
    /// (SPEC_FULL.md §4.6); `layout` is the bound compute pipeline's layout,
    /// threaded in by the caller (`Context::dispatch`, SPEC_FULL.md §4.7)
    /// since the state manager itself only tracks bindings, not which
    /// compute pipeline is current.
    pub fn flush_compute(
        &mut self,
        handle: &mut CommandHandle,
        allocator: &mut DescriptorAllocator,
        layout: &PipelineLayout,
    ) -> Result<()> {
        let before = self.dirty;
        log::trace!("flush_compute: dirty bits = {:?}", before);

        if self.dirty.contains(DirtyFlags::DESCRIPTORS) {
            let snapshot = self.binding_snapshot();
            let set = allocator.get_or_allocate(layout, &snapshot, |_set| self.descriptor_writes(layout))?;
            unsafe {
                handle.device().raw().cmd_bind_descriptor_sets(
                    handle.raw(),
                    vk::PipelineBindPoint::COMPUTE,
                    layout.raw(),
                    0,
                    &[set],
                    &[],
                );
            }
        }

        self.dirty.remove(DirtyFlags::DESCRIPTORS | DirtyFlags::VIEWPORT | DirtyFlags::SCISSOR);
        log::trace!("flush_compute: cleared bits {:?}", before);
        Ok(())
    }

    /// Builds the binding's worth of write data for every descriptor
    /// `layout` declares, keyed to the resource currently bound at that
    /// binding's slot (SPEC_FULL.md §4.4, §4.6). A binding with nothing
    /// bound yet is silently skipped rather than writing a garbage
    /// descriptor.
    fn descriptor_writes(&self, layout: &PipelineLayout) -> SmallVec<[DescriptorWriteDesc; 8]> {
        layout
            .descriptors()
            .iter()
            .filter_map(|d| {
                let resource = &self.resources[d.binding as usize];
                let vk_ty = d.ty.to_vk();
                match d.ty {
                    DescriptorType::Sampler => resource.sampler.map(|sampler| {
                        let info = vk::DescriptorImageInfo::builder().sampler(sampler).build();
                        DescriptorWriteDesc::Image { binding: d.binding, descriptor_type: vk_ty, info }
                    }),
                    DescriptorType::SampledImage | DescriptorType::StorageImage => resource.view.map(|(_, view, _)| {
                        let image_layout = if d.ty == DescriptorType::StorageImage {
                            vk::ImageLayout::GENERAL
                        } else {
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                        };
                        let info =
                            vk::DescriptorImageInfo::builder().image_view(view).image_layout(image_layout).build();
                        DescriptorWriteDesc::Image { binding: d.binding, descriptor_type: vk_ty, info }
                    }),
                    DescriptorType::CombinedImageSampler => resource.view.zip(resource.sampler).map(
                        |((_, view, _), sampler)| {
                            let info = vk::DescriptorImageInfo::builder()
                                .image_view(view)
                                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                                .sampler(sampler)
                                .build();
                            DescriptorWriteDesc::Image { binding: d.binding, descriptor_type: vk_ty, info }
                        },
                    ),
                    DescriptorType::UniformBufferDynamic | DescriptorType::StorageBuffer => {
                        resource.buffer.map(|(buffer, offset, size)| {
                            let info =
                                vk::DescriptorBufferInfo::builder().buffer(buffer).offset(offset).range(size).build();
                            DescriptorWriteDesc::Buffer { binding: d.binding, descriptor_type: vk_ty, info }
                        })
                    }
                    DescriptorType::UniformTexelBuffer | DescriptorType::StorageTexelBuffer => {
                        resource.texel_view.map(|view| DescriptorWriteDesc::TexelBuffer {
                            binding: d.binding,
                            descriptor_type: vk_ty,
                            view,
                        })
                    }
                    DescriptorType::AccelerationStructure => None,
                }
            })
            .collect()
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_same_topology_does_not_dirty() {
        let mut state = StateManager::new();
        state.dirty = DirtyFlags::empty();
        state.set_topology(PrimitiveTopology::TriangleList);
        assert!(!state.dirty.contains(DirtyFlags::TOPOLOGY));
    }

    #[test]
    fn changing_topology_sets_dirty_bit() {
        let mut state = StateManager::new();
        state.dirty = DirtyFlags::empty();
        state.set_topology(PrimitiveTopology::LineList);
        assert!(state.dirty.contains(DirtyFlags::TOPOLOGY));
    }

    #[test]
    fn flag_union_and_intersection() {
        let a = DirtyFlags::PIPELINE | DirtyFlags::VIEWPORT;
        assert!(a.intersects(DirtyFlags::VIEWPORT));
        assert!(!a.intersects(DirtyFlags::SCISSOR));
    }
}

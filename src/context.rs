//! Public command-recording API (SPEC_FULL.md §4.7).
//!
//! Grounded on `vulkan_context.cpp`'s `VulkanContext`: a thin wrapper around
//! a [`CommandHandle`] plus a [`StateManager`], returning `&mut Self` from
//! state-only binds (the teacher's `VulkanContext&` return-by-reference
//! idiom) so callers chain binds before a draw/dispatch.

use ash::vk;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::command_buffer::{CommandBufferManager, CommandHandle, CommandHandleKind};
use crate::descriptor::DescriptorAllocator;
use crate::device::Device;
use crate::error::{Result, RhiError};
use crate::format::{CullMode, FrontFace, PolygonMode, PrimitiveTopology, ShadingRateCombiner};
use crate::handle::Handle;
use crate::memory::LinearMemoryPool;
use crate::pipeline::{ComputePipeline, GraphicsPipeline};
use crate::render_pass::RenderTarget;
use crate::sampler::Sampler;
use crate::state::StateManager;
use crate::view::View;

pub struct BeginRenderingInfo {
    pub render_target: Handle<RenderTarget>,
    pub clear_colors: Vec<Option<[f32; 4]>>,
    pub clear_depth: Option<f32>,
}

/// A single recording session over one [`CommandHandle`] (SPEC_FULL.md §4.7).
/// Primary and secondary contexts share this type; `kind()` on the
/// underlying handle distinguishes them.
pub struct Context {
    device: Arc<Device>,
    handle: Rc<RefCell<CommandHandle>>,
    allocator: Rc<RefCell<DescriptorAllocator>>,
    memory_pool: Rc<RefCell<LinearMemoryPool>>,
    state: StateManager,
    rendering: bool,
    current_render_pass: Option<vk::RenderPass>,
}

impl Context {
    /// Acquires a handle from `manager` and begins recording. Primary
    /// contexts reset all state; secondary contexts start with default
    /// state and are expected to be driven entirely by `execute` callers
    /// (SPEC_FULL.md §4.7, "begin").
    pub fn begin(
        device: &Arc<Device>,
        manager: &CommandBufferManager,
        allocator: Rc<RefCell<DescriptorAllocator>>,
        memory_pool: Rc<RefCell<LinearMemoryPool>>,
        kind: CommandHandleKind,
    ) -> Result<Context> {
        let handle = manager.request(kind)?;
        handle.borrow_mut().begin()?;
        Ok(Context {
            device: device.clone(),
            handle,
            allocator,
            memory_pool,
            state: StateManager::new(),
            rendering: false,
            current_render_pass: None,
        })
    }

    pub fn begin_secondary(
        device: &Arc<Device>,
        manager: &CommandBufferManager,
        allocator: Rc<RefCell<DescriptorAllocator>>,
        memory_pool: Rc<RefCell<LinearMemoryPool>>,
        render_pass: Option<vk::RenderPass>,
        framebuffer: Option<vk::Framebuffer>,
    ) -> Result<Context> {
        let handle = manager.request(CommandHandleKind::Secondary)?;
        handle.borrow_mut().begin_secondary(render_pass, framebuffer)?;
        Ok(Context {
            device: device.clone(),
            handle,
            allocator,
            memory_pool,
            state: StateManager::new(),
            rendering: false,
            current_render_pass: render_pass,
        })
    }

    /// Ends recording, returning the handle for submission via
    /// [`CommandBufferManager::return_handle`].
    pub fn end(mut self) -> Result<Rc<RefCell<CommandHandle>>> {
        if self.rendering {
            self.end_rendering()?;
        }
        self.handle.borrow_mut().end()?;
        Ok(self.handle)
    }

    pub fn begin_rendering(&mut self, info: BeginRenderingInfo) -> Result<&mut Self> {
        if self.rendering {
            return Err(RhiError::InvalidState { expected: "not rendering", found: "rendering" });
        }

        let rt = info.render_target.clone();
        let extent = rt.extent;
        let mut handle = self.handle.borrow_mut();

        if self.device.supports_dynamic_rendering() {
            let color_attachments: Vec<vk::RenderingAttachmentInfoKHR> = rt
                .color_views
                .iter()
                .zip(info.clear_colors.iter())
                .map(|(view, clear)| {
                    let mut attachment = vk::RenderingAttachmentInfoKHR::builder()
                        .image_view(view.raw())
                        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                        .load_op(if clear.is_some() { vk::AttachmentLoadOp::CLEAR } else { vk::AttachmentLoadOp::LOAD })
                        .store_op(vk::AttachmentStoreOp::STORE);
                    if let Some(color) = clear {
                        attachment = attachment.clear_value(vk::ClearValue { color: vk::ClearColorValue { float32: *color } });
                    }
                    attachment.build()
                })
                .collect();

            let mut rendering_info = vk::RenderingInfoKHR::builder()
                .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: vk::Extent2D { width: extent.0, height: extent.1 } })
                .layer_count(1)
                .color_attachments(&color_attachments);

            let depth_attachment;
            if let Some(depth_view) = &rt.depth_stencil_view {
                depth_attachment = vk::RenderingAttachmentInfoKHR::builder()
                    .image_view(depth_view.raw())
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(if info.clear_depth.is_some() { vk::AttachmentLoadOp::CLEAR } else { vk::AttachmentLoadOp::LOAD })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: info.clear_depth.unwrap_or(1.0), stencil: 0 } })
                    .build();
                rendering_info = rendering_info.depth_attachment(&depth_attachment);
            }

            unsafe { self.device.dynamic_rendering().cmd_begin_rendering(handle.raw(), &rendering_info) };
        } else {
            let render_pass = rt.render_pass().expect("non-dynamic-rendering RT must own a render pass").raw();
            let framebuffer = rt.framebuffer().expect("non-dynamic-rendering RT must own a framebuffer");
            self.current_render_pass = Some(render_pass);

            let clear_values: Vec<vk::ClearValue> = info
                .clear_colors
                .iter()
                .map(|c| vk::ClearValue { color: vk::ClearColorValue { float32: c.unwrap_or([0.0; 4]) } })
                .chain(info.clear_depth.map(|d| vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: d, stencil: 0 } }))
                .collect();

            let begin_info = vk::RenderPassBeginInfo::builder()
                .render_pass(render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: vk::Extent2D { width: extent.0, height: extent.1 } })
                .clear_values(&clear_values);

            unsafe { self.device.raw().cmd_begin_render_pass(handle.raw(), &begin_info, vk::SubpassContents::INLINE) };
        }

        handle.retain(rt.color_views.first().expect("at least one color attachment").clone());
        drop(handle);

        self.state.set_render_target(info.render_target);
        self.rendering = true;
        Ok(self)
    }

    pub fn end_rendering(&mut self) -> Result<&mut Self> {
        if !self.rendering {
            return Err(RhiError::InvalidState { expected: "rendering", found: "not rendering" });
        }
        let handle = self.handle.borrow();
        if self.device.supports_dynamic_rendering() {
            unsafe { self.device.dynamic_rendering().cmd_end_rendering(handle.raw()) };
        } else {
            unsafe { self.device.raw().cmd_end_render_pass(handle.raw()) };
        }
        drop(handle);
        self.rendering = false;
        self.current_render_pass = None;
        Ok(self)
    }

    pub fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) -> &mut Self {
        self.state.set_viewport(vk::Viewport { x, y, width, height, min_depth: 0.0, max_depth: 1.0 });
        self
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, width: u32, height: u32) -> &mut Self {
        self.state.set_scissor(vk::Rect2D { offset: vk::Offset2D { x, y }, extent: vk::Extent2D { width, height } });
        self
    }

    pub fn set_pipeline(&mut self, pipeline: Handle<GraphicsPipeline>) -> &mut Self {
        self.state.set_pipeline(pipeline);
        self
    }

    pub fn set_raster_state(&mut self, polygon_mode: PolygonMode, cull_mode: CullMode, front_face: FrontFace) -> &mut Self {
        self.state.set_raster_state(polygon_mode, cull_mode, front_face);
        self
    }

    pub fn set_topology(&mut self, topology: PrimitiveTopology) -> &mut Self {
        self.state.set_topology(topology);
        self
    }

    /// `stride` is validated against the bound pipeline's vertex-input
    /// description on the next draw (SPEC_FULL.md §8, "vertex buffer stride
    /// mismatch"), not here — the pipeline may not be bound yet.
    pub fn bind_vertex_buffer(&mut self, slot: usize, buffer: vk::Buffer, offset: u64, stride: u32) -> &mut Self {
        self.state.bind_vertex_buffer(slot, buffer, offset, stride);
        self
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, format: crate::vertex::IndexFormat) -> &mut Self {
        self.state.bind_index_buffer(buffer, offset, format.to_vk());
        self
    }

    pub fn bind_sampled_image(&mut self, slot: usize, view: &Handle<View>) -> &mut Self {
        self.state.bind_sampled_image(slot, view);
        self.handle.borrow_mut().retain(view.clone());
        self
    }

    pub fn bind_storage_image(&mut self, slot: usize, view: &Handle<View>) -> &mut Self {
        self.state.bind_storage_image(slot, view);
        self.handle.borrow_mut().retain(view.clone());
        self
    }

    pub fn bind_sampler(&mut self, slot: usize, sampler: &Handle<Sampler>) -> &mut Self {
        self.state.bind_sampler(slot, sampler);
        self.handle.borrow_mut().retain(sampler.clone());
        self
    }

    pub fn bind_storage_buffer(&mut self, slot: usize, buffer: &Handle<Buffer>, offset: u64, size: u64) -> &mut Self {
        self.state.bind_storage_buffer(slot, buffer.raw(), offset, size);
        self.handle.borrow_mut().retain(buffer.clone());
        self
    }

    /// `view` is a raw `vk::BufferView`, consistent with `bind_vertex_buffer`/
    /// `bind_index_buffer` taking raw buffer handles — no `BufferView`-owning
    /// wrapper type exists in the crate (SPEC_FULL.md §4.7).
    pub fn bind_texel_buffer(&mut self, slot: usize, view: vk::BufferView) -> &mut Self {
        self.state.bind_texel_buffer(slot, view);
        self
    }

    /// Sub-allocates and writes `data` into the handle's uniform page chain,
    /// then binds it at `slot` (SPEC_FULL.md §4.2/§4.7 interaction).
    pub fn bind_uniform_data(&mut self, slot: usize, data: &[u8]) -> Result<&mut Self> {
        let mut handle = self.handle.borrow_mut();
        let mut pool = self.memory_pool.borrow_mut();
        let (page, offset) = handle.uniforms.alloc(data.len() as u64, &mut pool)?;
        handle.uniforms.write(page, offset, data);
        let buffer = handle.uniforms.buffer_raw(page);
        drop(handle);
        self.state.bind_uniform_buffer(slot, buffer, offset, data.len() as u64);
        Ok(self)
    }

    fn flush(&mut self) -> Result<()> {
        let mut handle = self.handle.borrow_mut();
        let mut allocator = self.allocator.borrow_mut();
        self.state.flush_graphics(&mut handle, &mut allocator, self.device.supports_dynamic_rendering())
    }

    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<&mut Self> {
        self.flush()?;
        let handle = self.handle.borrow();
        unsafe { self.device.raw().cmd_draw(handle.raw(), vertex_count, 1, first_vertex, 0) };
        Ok(self)
    }

    pub fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<&mut Self> {
        self.flush()?;
        let handle = self.handle.borrow();
        unsafe { self.device.raw().cmd_draw(handle.raw(), vertex_count, instance_count, first_vertex, first_instance) };
        Ok(self)
    }

    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) -> Result<&mut Self> {
        self.flush()?;
        let handle = self.handle.borrow();
        unsafe { self.device.raw().cmd_draw_indexed(handle.raw(), index_count, 1, first_index, vertex_offset, 0) };
        Ok(self)
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<&mut Self> {
        self.flush()?;
        let handle = self.handle.borrow();
        unsafe {
            self.device
                .raw()
                .cmd_draw_indexed(handle.raw(), index_count, instance_count, first_index, vertex_offset, first_instance)
        };
        Ok(self)
    }

    pub fn dispatch(&mut self, pipeline: &Handle<ComputePipeline>, x: u32, y: u32, z: u32) -> Result<&mut Self> {
        {
            let mut handle = self.handle.borrow_mut();
            let mut allocator = self.allocator.borrow_mut();
            self.state.flush_compute(&mut handle, &mut allocator, pipeline.layout())?;
            unsafe {
                self.device.raw().cmd_bind_pipeline(handle.raw(), vk::PipelineBindPoint::COMPUTE, pipeline.raw());
                self.device.raw().cmd_dispatch(handle.raw(), x, y, z);
            }
            handle.retain(pipeline.clone());
        }
        Ok(self)
    }

    /// Records `vkCmdDrawMeshTasksNV` after the usual graphics-state flush
    /// (SPEC_FULL.md §4.7). Errors rather than silently skipping when the
    /// driver lacks `VK_NV_mesh_shader`, unlike `shading_rate`.
    pub fn draw_mesh(&mut self, task_count: u32, first_task: u32) -> Result<&mut Self> {
        self.flush()?;
        let handle = self.handle.borrow();
        self.device.cmd_draw_mesh_tasks(handle.raw(), task_count, first_task)?;
        Ok(self)
    }

    /// Sets the per-draw fragment shading rate and combiner ops
    /// (SPEC_FULL.md §4.7). A no-op on the next flush if the driver lacks
    /// `VK_KHR_fragment_shading_rate`.
    pub fn shading_rate(&mut self, width: u32, height: u32, combiners: [ShadingRateCombiner; 2]) -> &mut Self {
        self.state.set_shading_rate(vk::Extent2D { width, height }, combiners);
        self
    }

    /// Records `executeCommands` for a finished secondary context and
    /// retains it so it cannot be destroyed before this primary's fence
    /// signals (SPEC_FULL.md §4.7, "execute").
    pub fn execute(&mut self, secondary: Rc<RefCell<CommandHandle>>) -> Result<&mut Self> {
        use crate::command_buffer::CommandHandleState;
        if secondary.borrow().state() != CommandHandleState::Pending {
            return Err(RhiError::InvalidState { expected: "Pending", found: "other" });
        }
        let mut handle = self.handle.borrow_mut();
        let raw = secondary.borrow().raw();
        unsafe { self.device.raw().cmd_execute_commands(handle.raw(), &[raw]) };
        handle.retain(secondary);
        drop(handle);
        Ok(self)
    }

    pub fn push_debug_stage(&mut self, label: &str) -> &mut Self {
        if let Some(debug_utils) = self.device.debug_utils() {
            let name = std::ffi::CString::new(label).unwrap_or_default();
            let info = vk::DebugUtilsLabelEXT::builder().label_name(&name);
            unsafe { debug_utils.cmd_begin_debug_utils_label(self.handle.borrow().raw(), &info) };
        }
        self
    }

    pub fn pop_debug_stage(&mut self) -> &mut Self {
        if let Some(debug_utils) = self.device.debug_utils() {
            unsafe { debug_utils.cmd_end_debug_utils_label(self.handle.borrow().raw()) };
        }
        self
    }
}

#[cfg(test)]
mod tests {
    // Context::begin/draw require a live Device; the pure-logic portion of
    // this module (builder chaining, state delegation) is exercised through
    // `state::tests` instead.
}

//! Command-buffer manager and the per-handle fence-driven state machine
//! (SPEC_FULL.md §4.1).
//!
//! Grounded on `vulkan_context.cpp`'s `VulkanCommandHandle` /
//! `VulkanCommandBufferManager`: a thread-local deque of handles per
//! primary/secondary kind, recycled once their fence signals.

use ash::vk;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{Result, RhiError};
use crate::memory::LinearMemoryPool;
use crate::resource::Resource;
use crate::uniform::UniformPageList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandHandleState {
    Unused,
    Active,
    Pending,
    Submitted,
}

impl CommandHandleState {
    fn name(self) -> &'static str {
        match self {
            CommandHandleState::Unused => "Unused",
            CommandHandleState::Active => "Active",
            CommandHandleState::Pending => "Pending",
            CommandHandleState::Submitted => "Submitted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandHandleKind {
    Primary,
    Secondary,
}

/// A recorded, not-yet-submitted or in-flight GPU command stream with its
/// fence (SPEC_FULL.md §3, "CommandHandle").
pub struct CommandHandle {
    device: Arc<Device>,
    raw: vk::CommandBuffer,
    fence: vk::Fence,
    kind: CommandHandleKind,
    state: CommandHandleState,
    pub uniforms: UniformPageList,
    stagging: Vec<Resource>,
}

impl CommandHandle {
    fn new(device: &Arc<Device>, pool: vk::CommandPool, kind: CommandHandleKind, page_capacity: u64) -> Result<Self> {
        let level = match kind {
            CommandHandleKind::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandHandleKind::Secondary => vk::CommandBufferLevel::SECONDARY,
        };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        let raw = unsafe { device.raw().allocate_command_buffers(&alloc_info)?[0] };

        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { device.raw().create_fence(&fence_info, None)? };

        Ok(CommandHandle {
            device: device.clone(),
            raw,
            fence,
            kind,
            state: CommandHandleState::Unused,
            uniforms: UniformPageList::new(device, page_capacity),
            stagging: Vec::new(),
        })
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn state(&self) -> CommandHandleState {
        self.state
    }

    pub fn kind(&self) -> CommandHandleKind {
        self.kind
    }

    pub fn is_unused(&self) -> bool {
        self.state == CommandHandleState::Unused
    }

    fn require(&self, expected: CommandHandleState) -> Result<()> {
        if self.state != expected {
            return Err(RhiError::InvalidState { expected: expected.name(), found: self.state.name() });
        }
        Ok(())
    }

    /// Begins recording. Resets dirty tracking the caller (the state
    /// manager, SPEC_FULL.md §4.6) is responsible for driving.
    pub fn begin(&mut self) -> Result<()> {
        self.require(CommandHandleState::Unused)?;
        let info = vk::CommandBufferBeginInfo::builder();
        unsafe { self.device.raw().begin_command_buffer(self.raw, &info)? };
        self.state = CommandHandleState::Active;
        log::trace!("command handle {:?} Unused -> Active", self.raw);
        Ok(())
    }

    /// Begins a secondary command buffer inheriting the parent's render-pass
    /// scope, or with no inheritance info when dynamic rendering is in use
    /// (DESIGN.md decision 2).
    pub fn begin_secondary(
        &mut self,
        render_pass: Option<vk::RenderPass>,
        framebuffer: Option<vk::Framebuffer>,
    ) -> Result<()> {
        self.require(CommandHandleState::Unused)?;
        let mut info = vk::CommandBufferBeginInfo::builder();
        let mut inheritance = vk::CommandBufferInheritanceInfo::builder();
        if let (Some(rp), Some(fb)) = (render_pass, framebuffer) {
            inheritance = inheritance.render_pass(rp).framebuffer(fb);
            info = info.flags(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE).inheritance_info(&inheritance);
        }
        unsafe { self.device.raw().begin_command_buffer(self.raw, &info)? };
        self.state = CommandHandleState::Active;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        self.require(CommandHandleState::Active)?;
        unsafe { self.device.raw().end_command_buffer(self.raw)? };
        self.state = CommandHandleState::Pending;
        log::trace!("command handle {:?} Active -> Pending", self.raw);
        Ok(())
    }

    /// Submits to the graphics queue and marks the handle Submitted. Manager
    /// owns the ordering of this call relative to pool return.
    fn submit(&mut self, queue: vk::Queue) -> Result<()> {
        self.submit_with_semaphores(queue, &[], &[], &[])
    }

    /// Submits with explicit wait/signal semaphores, used when the recorded
    /// work targets a swapchain image (SPEC_FULL.md §4.9 acquire/present
    /// protocol): waits on `image_available` before the color-attachment
    /// stage and signals `render_finished` for the present call to wait on.
    fn submit_with_semaphores(
        &mut self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        self.require(CommandHandleState::Pending)?;
        self.uniforms.flush()?;
        let buffers = [self.raw];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&buffers)
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .signal_semaphores(signal_semaphores);
        unsafe {
            self.device.raw().queue_submit(queue, &[submit_info.build()], self.fence)?;
        }
        self.state = CommandHandleState::Submitted;
        log::trace!("command handle {:?} Pending -> Submitted", self.raw);
        Ok(())
    }

    fn is_signaled(&self) -> bool {
        unsafe { self.device.raw().get_fence_status(self.fence).unwrap_or(false) }
    }

    /// If `Submitted` and the fence has signaled, resets the command buffer,
    /// the fence, and every uniform page cursor, transitioning back to
    /// `Unused` (SPEC_FULL.md §4.1/§4.2).
    pub fn refresh_fence_status(&mut self) -> Result<()> {
        if self.state == CommandHandleState::Submitted && self.is_signaled() {
            unsafe {
                self.device.raw().reset_command_buffer(self.raw, vk::CommandBufferResetFlags::empty())?;
                self.device.raw().reset_fences(&[self.fence])?;
            }
            self.uniforms.reset();
            self.stagging.clear();
            self.state = CommandHandleState::Unused;
            log::trace!("command handle {:?} Submitted -> Unused (fence signaled)", self.raw);
        }
        Ok(())
    }

    /// Blocks on the fence. Only called during teardown or explicit
    /// synchronization points (SPEC_FULL.md §5).
    pub fn wait(&mut self) -> Result<()> {
        if self.state == CommandHandleState::Submitted {
            unsafe { self.device.raw().wait_for_fences(&[self.fence], true, u64::MAX)? };
            self.refresh_fence_status()?;
        }
        Ok(())
    }

    /// Appends a resource to the stagging list so it is not destroyed before
    /// this handle's fence signals (SPEC_FULL.md §4.7, "side effect common to
    /// resource-referencing ops").
    pub fn retain(&mut self, resource: impl Into<Resource>) {
        self.stagging.push(resource.into());
    }

    pub fn stagging_len(&self) -> usize {
        self.stagging.len()
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_fence(self.fence, None);
        }
    }
}

/// Thread-local manager for a single kind (primary or secondary) of command
/// handle. One `CommandBufferManager` exists per thread (SPEC_FULL.md §5).
pub struct CommandBufferManager {
    device: Arc<Device>,
    pool: vk::CommandPool,
    primary: Mutex<VecDeque<Rc<RefCell<CommandHandle>>>>,
    secondary: Mutex<VecDeque<Rc<RefCell<CommandHandle>>>>,
    page_capacity: u64,
}

impl CommandBufferManager {
    pub fn new(device: &Arc<Device>, page_capacity: u64) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.queue_families().graphics);
        let pool = unsafe { device.raw().create_command_pool(&info, None)? };
        Ok(CommandBufferManager {
            device: device.clone(),
            pool,
            primary: Mutex::new(VecDeque::new()),
            secondary: Mutex::new(VecDeque::new()),
            page_capacity,
        })
    }

    /// Returns a handle in state `Unused`, reusing a recycled one from the
    /// pool if available, else allocating a fresh one (SPEC_FULL.md §4.1).
    pub fn request(&self, kind: CommandHandleKind) -> Result<Rc<RefCell<CommandHandle>>> {
        let deque = match kind {
            CommandHandleKind::Primary => &self.primary,
            CommandHandleKind::Secondary => &self.secondary,
        };

        {
            let mut deque = deque.lock();
            if let Some(front) = deque.front() {
                front.borrow_mut().refresh_fence_status()?;
                if front.borrow().is_unused() {
                    return Ok(deque.pop_front().unwrap());
                }
            }
        }

        let handle = CommandHandle::new(&self.device, self.pool, kind, self.page_capacity)?;
        Ok(Rc::new(RefCell::new(handle)))
    }

    /// Submits `handle` and places it at the back of its pool.
    pub fn return_handle(&self, handle: Rc<RefCell<CommandHandle>>, queue: vk::Queue) -> Result<()> {
        let kind = handle.borrow().kind();
        handle.borrow_mut().submit(queue)?;
        let deque = match kind {
            CommandHandleKind::Primary => &self.primary,
            CommandHandleKind::Secondary => &self.secondary,
        };
        deque.lock().push_back(handle);
        Ok(())
    }

    /// Like [`Self::return_handle`], but waits on `wait_semaphore` and
    /// signals `signal_semaphore` (SPEC_FULL.md §4.9).
    pub fn return_handle_for_present(
        &self,
        handle: Rc<RefCell<CommandHandle>>,
        queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
        signal_semaphore: vk::Semaphore,
    ) -> Result<()> {
        let kind = handle.borrow().kind();
        handle.borrow_mut().submit_with_semaphores(
            queue,
            &[wait_semaphore],
            &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            &[signal_semaphore],
        )?;
        let deque = match kind {
            CommandHandleKind::Primary => &self.primary,
            CommandHandleKind::Secondary => &self.secondary,
        };
        deque.lock().push_back(handle);
        Ok(())
    }
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        for deque in [&self.primary, &self.secondary] {
            for handle in deque.lock().iter() {
                let _ = handle.borrow_mut().wait();
            }
        }
        unsafe {
            self.device.raw().destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CommandHandleState;

    #[test]
    fn state_names_are_distinct() {
        let all = [
            CommandHandleState::Unused,
            CommandHandleState::Active,
            CommandHandleState::Pending,
            CommandHandleState::Submitted,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }
}

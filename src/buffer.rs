//! GPU buffer resource (SPEC_FULL.md §3, "Buffer").

use ash::vk;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::format::BufferUsage;
use crate::memory::AllocatedMemory;

/// A GPU allocation with a size and a set of usage flags. `mappable`
/// indicates the backing memory is host-visible (used for uniform pages and
/// staging uploads).
pub struct Buffer {
    device: Arc<Device>,
    raw: vk::Buffer,
    memory: AllocatedMemory,
    size: u64,
    usage: BufferUsage,
    mappable: bool,
    mapped_ptr: Option<*mut u8>,
}

// Buffer is only ever mutated from the render thread that owns `device`
// (SPEC_FULL.md §5); sharing the handle across threads for read-only queries
// (size/usage) is safe because those fields are immutable post-creation.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub fn new(
        device: &Arc<Device>,
        size: u64,
        usage: BufferUsage,
        mappable: bool,
        memory: AllocatedMemory,
    ) -> Result<Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { device.raw().create_buffer(&info, None)? };
        unsafe { device.raw().bind_buffer_memory(raw, memory.memory, memory.offset)? };

        let mapped_ptr = if mappable {
            let ptr = unsafe {
                device
                    .raw()
                    .map_memory(memory.memory, memory.offset, size, vk::MemoryMapFlags::empty())?
            };
            Some(ptr as *mut u8)
        } else {
            None
        };

        Ok(Buffer {
            device: device.clone(),
            raw,
            memory,
            size,
            usage,
            mappable,
            mapped_ptr,
        })
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn is_mappable(&self) -> bool {
        self.mappable
    }

    /// Writes `data` at `offset` into host-visible memory. Panics if the
    /// buffer is not mappable or the write would overrun its size — callers
    /// (the uniform paging allocator, SPEC_FULL.md §4.2) are expected to have
    /// already bounds-checked via `alloc`.
    pub fn write(&self, offset: u64, data: &[u8]) {
        let ptr = self.mapped_ptr.expect("buffer is not host-mappable");
        assert!(offset + data.len() as u64 <= self.size, "write overruns buffer");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(_) = self.mapped_ptr {
            let range = vk::MappedMemoryRange::builder()
                .memory(self.memory.memory)
                .offset(self.memory.offset)
                .size(self.size);
            unsafe { self.device.raw().flush_mapped_memory_ranges(&[range.build()])? };
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped_ptr.is_some() {
                self.device.raw().unmap_memory(self.memory.memory);
            }
            self.device.raw().destroy_buffer(self.raw, None);
        }
    }
}

//! Device-memory allocation backing [`crate::buffer::Buffer`] and
//! [`crate::texture::Texture`] (SPEC_FULL.md §3, "Buffer"/"Texture").
//!
//! Grounded on the teacher's `src/memory/linear_pool.rs`: a linear
//! (bump-pointer) pool per memory-type index that only grows, never frees
//! individual suballocations. Real resource destruction is deferred (see
//! [`crate::command_buffer`]) rather than returned to this pool, matching the
//! teacher's own `deallocate_all`-only API.

use ash::vk;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;

fn align_up(offset: u64, align: u64) -> u64 {
    (offset + align - 1) & !(align - 1)
}

struct Block {
    memory: vk::DeviceMemory,
    size: u64,
}

/// A bump allocator over device memory of a single memory-type index.
pub struct LinearMemoryPool {
    device: Arc<Device>,
    memory_type_index: u32,
    block_size: u64,
    blocks: Vec<Block>,
    cursor: u64,
}

/// A suballocation returned by [`LinearMemoryPool::allocate`].
#[derive(Debug, Clone, Copy)]
pub struct AllocatedMemory {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
}

impl LinearMemoryPool {
    pub fn new(device: &Arc<Device>, memory_type_index: u32, block_size: u64) -> Self {
        LinearMemoryPool {
            device: device.clone(),
            memory_type_index,
            block_size,
            blocks: Vec::new(),
            cursor: 0,
        }
    }

    fn allocate_block(&mut self, min_size: u64) -> Result<()> {
        let size = min_size.max(self.block_size);
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(self.memory_type_index);
        let memory = unsafe { self.device.raw().allocate_memory(&info, None)? };
        log::trace!(
            "allocated device memory block: type={} size={}",
            self.memory_type_index,
            size
        );
        self.blocks.push(Block { memory, size });
        self.cursor = 0;
        Ok(())
    }

    /// Suballocates `size` bytes aligned to `align` (a power of two).
    ///
    /// Never fails except on genuine device OOM: when the current block
    /// cannot satisfy the request a new block is allocated, mirroring the
    /// teacher's pool-growth behavior rather than returning `None`.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<AllocatedMemory> {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");

        if self.blocks.is_empty() {
            self.allocate_block(size)?;
        }

        let aligned = align_up(self.cursor, align);
        let current_size = self.blocks.last().unwrap().size;
        if aligned + size > current_size {
            self.allocate_block(size)?;
            let aligned = align_up(self.cursor, align);
            self.cursor = aligned + size;
            return Ok(AllocatedMemory {
                memory: self.blocks.last().unwrap().memory,
                offset: aligned,
                size,
            });
        }

        self.cursor = aligned + size;
        Ok(AllocatedMemory {
            memory: self.blocks.last().unwrap().memory,
            offset: aligned,
            size,
        })
    }

    /// Releases every block. Callers must guarantee no in-flight command
    /// handle still references memory from this pool (deferred destroy is
    /// the caller's responsibility, not this pool's).
    ///
    /// # Safety
    /// All allocations handed out by this pool must no longer be in use by
    /// the device.
    pub unsafe fn deallocate_all(&mut self) {
        for block in self.blocks.drain(..) {
            self.device.raw().free_memory(block.memory, None);
        }
        self.cursor = 0;
    }
}

impl Drop for LinearMemoryPool {
    fn drop(&mut self) {
        if !self.blocks.is_empty() {
            log::warn!("LinearMemoryPool dropped with {} block(s) still allocated", self.blocks.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }
}

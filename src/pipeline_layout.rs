//! Pipeline layout deduplication cache (SPEC_FULL.md §4.3).
//!
//! Grounded on `vulkan_pipeline.cpp`/`vulkan_descriptor.cpp`'s layout
//! construction and hashing: the descriptor list is normalized (sorted by
//! `(binding, type)`), hashed, and looked up in a multi-map keyed by that
//! hash with a byte-equality tiebreak on collision.

use ash::vk;
use fxhash::FxHasher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::handle::Handle;

bitflags::bitflags! {
    pub struct ShaderStageFlags: u32 {
        const VERTEX   = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE  = 1 << 2;
    }
}

impl ShaderStageFlags {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        let mut out = vk::ShaderStageFlags::empty();
        if self.contains(ShaderStageFlags::VERTEX) {
            out |= vk::ShaderStageFlags::VERTEX;
        }
        if self.contains(ShaderStageFlags::FRAGMENT) {
            out |= vk::ShaderStageFlags::FRAGMENT;
        }
        if self.contains(ShaderStageFlags::COMPUTE) {
            out |= vk::ShaderStageFlags::COMPUTE;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorType {
    Sampler,
    SampledImage,
    CombinedImageSampler,
    StorageImage,
    UniformBufferDynamic,
    StorageBuffer,
    UniformTexelBuffer,
    StorageTexelBuffer,
    AccelerationStructure,
}

impl DescriptorType {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
            DescriptorType::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorType::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorType::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            DescriptorType::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            DescriptorType::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
}

/// Per-category descriptor counts, used by the descriptor-pool allocator to
/// size/budget pools (SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorCounts {
    pub sampler: u32,
    pub sampled_image: u32,
    pub combined_image_sampler: u32,
    pub storage_image: u32,
    pub uniform_buffer_dynamic: u32,
    pub storage_buffer: u32,
    pub uniform_texel_buffer: u32,
    pub storage_texel_buffer: u32,
    pub acceleration_structure: u32,
}

impl DescriptorCounts {
    fn tally(descriptors: &[DescriptorBindingDesc]) -> DescriptorCounts {
        let mut counts = DescriptorCounts::default();
        for d in descriptors {
            let slot = match d.ty {
                DescriptorType::Sampler => &mut counts.sampler,
                DescriptorType::SampledImage => &mut counts.sampled_image,
                DescriptorType::CombinedImageSampler => &mut counts.combined_image_sampler,
                DescriptorType::StorageImage => &mut counts.storage_image,
                DescriptorType::UniformBufferDynamic => &mut counts.uniform_buffer_dynamic,
                DescriptorType::StorageBuffer => &mut counts.storage_buffer,
                DescriptorType::UniformTexelBuffer => &mut counts.uniform_texel_buffer,
                DescriptorType::StorageTexelBuffer => &mut counts.storage_texel_buffer,
                DescriptorType::AccelerationStructure => &mut counts.acceleration_structure,
            };
            *slot += d.count;
        }
        counts
    }
}

/// Normalizes a raw descriptor list by sorting on `(binding, type)`, matching
/// `vulkan_pipeline.cpp`'s normalization step before hashing.
pub fn normalize(mut descriptors: Vec<DescriptorBindingDesc>) -> Vec<DescriptorBindingDesc> {
    descriptors.sort();
    descriptors
}

pub fn hash_layout(stage_mask: ShaderStageFlags, normalized: &[DescriptorBindingDesc]) -> u64 {
    let mut hasher = FxHasher::default();
    stage_mask.bits().hash(&mut hasher);
    normalized.hash(&mut hasher);
    hasher.finish()
}

pub struct PipelineLayout {
    device: Arc<Device>,
    raw_layout: vk::PipelineLayout,
    raw_set_layout: vk::DescriptorSetLayout,
    stage_mask: ShaderStageFlags,
    descriptors: Vec<DescriptorBindingDesc>,
    pub(crate) counts: DescriptorCounts,
    hash: u64,
}

impl PipelineLayout {
    pub fn raw(&self) -> vk::PipelineLayout {
        self.raw_layout
    }

    pub fn raw_set_layout(&self) -> vk::DescriptorSetLayout {
        self.raw_set_layout
    }

    pub fn descriptors(&self) -> &[DescriptorBindingDesc] {
        &self.descriptors
    }

    pub fn stage_mask(&self) -> ShaderStageFlags {
        self.stage_mask
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn counts(&self) -> DescriptorCounts {
        self.counts
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_pipeline_layout(self.raw_layout, None);
            self.device.raw().destroy_descriptor_set_layout(self.raw_set_layout, None);
        }
    }
}

/// Deduplicates [`PipelineLayout`]s by `(stage_mask, normalized descriptor
/// list)`. Guarded by a single critical section (SPEC_FULL.md §5).
pub struct PipelineLayoutCache {
    device: Arc<Device>,
    entries: Mutex<HashMap<u64, Vec<Handle<PipelineLayout>>>>,
}

impl PipelineLayoutCache {
    pub fn new(device: &Arc<Device>) -> Self {
        PipelineLayoutCache { device: device.clone(), entries: Mutex::new(HashMap::new()) }
    }

    /// Looks up or creates a [`PipelineLayout`] for the given stage mask and
    /// descriptor list. The input is normalized and hashed before lookup; on
    /// collision every candidate's normalized list is compared element-wise
    /// before falling through to creation (SPEC_FULL.md §4.3).
    pub fn get_or_create(
        &self,
        stage_mask: ShaderStageFlags,
        descriptors: Vec<DescriptorBindingDesc>,
    ) -> Result<Handle<PipelineLayout>> {
        let normalized = normalize(descriptors);
        let hash = hash_layout(stage_mask, &normalized);

        let mut entries = self.entries.lock();
        if let Some(candidates) = entries.get(&hash) {
            for candidate in candidates {
                if candidate.stage_mask == stage_mask && candidate.descriptors == normalized {
                    log::trace!("pipeline layout cache hit (hash={:#x})", hash);
                    return Ok(candidate.clone());
                }
            }
        }

        log::debug!("pipeline layout cache miss (hash={:#x}), creating", hash);
        let layout = self.create(stage_mask, normalized, hash)?;
        entries.entry(hash).or_insert_with(Vec::new).push(layout.clone());
        Ok(layout)
    }

    fn create(
        &self,
        stage_mask: ShaderStageFlags,
        descriptors: Vec<DescriptorBindingDesc>,
        hash: u64,
    ) -> Result<Handle<PipelineLayout>> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = descriptors
            .iter()
            .map(|d| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(d.binding)
                    .descriptor_type(d.ty.to_vk())
                    .descriptor_count(d.count)
                    .stage_flags(stage_mask.to_vk())
                    .build()
            })
            .collect();

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let raw_set_layout = unsafe { self.device.raw().create_descriptor_set_layout(&set_layout_info, None)? };

        let set_layouts = [raw_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let raw_layout = unsafe { self.device.raw().create_pipeline_layout(&layout_info, None)? };

        let counts = DescriptorCounts::tally(&descriptors);

        Ok(Handle::new(PipelineLayout {
            device: self.device.clone(),
            raw_layout,
            raw_set_layout,
            stage_mask,
            descriptors,
            counts,
            hash,
        }))
    }

    /// Drops the cache's own reference to `layout`'s cache slot once no other
    /// owner remains. The backend objects themselves are destroyed by
    /// `PipelineLayout::drop` once the last `Handle` clone disappears; this
    /// only prunes the cache's bookkeeping entry so it doesn't grow
    /// unboundedly with transient layouts.
    pub fn release(&self, layout: &Handle<PipelineLayout>) {
        let mut entries = self.entries.lock();
        if let Some(bucket) = entries.get_mut(&layout.hash()) {
            if layout.strong_count() <= 2 {
                bucket.retain(|l| !l.ptr_eq(layout));
                if bucket.is_empty() {
                    entries.remove(&layout.hash());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(binding: u32, ty: DescriptorType) -> DescriptorBindingDesc {
        DescriptorBindingDesc { binding, ty, count: 1 }
    }

    #[test]
    fn normalize_sorts_by_binding_then_type() {
        let list = vec![
            desc(2, DescriptorType::Sampler),
            desc(0, DescriptorType::UniformBufferDynamic),
            desc(1, DescriptorType::SampledImage),
        ];
        let normalized = normalize(list);
        assert_eq!(normalized[0].binding, 0);
        assert_eq!(normalized[1].binding, 1);
        assert_eq!(normalized[2].binding, 2);
    }

    #[test]
    fn hash_is_stable_for_equal_normalized_lists() {
        let a = normalize(vec![desc(0, DescriptorType::UniformBufferDynamic), desc(1, DescriptorType::Sampler)]);
        let b = normalize(vec![desc(1, DescriptorType::Sampler), desc(0, DescriptorType::UniformBufferDynamic)]);
        assert_eq!(hash_layout(ShaderStageFlags::FRAGMENT, &a), hash_layout(ShaderStageFlags::FRAGMENT, &b));
    }

    #[test]
    fn hash_differs_for_different_stage_mask() {
        let list = normalize(vec![desc(0, DescriptorType::UniformBufferDynamic)]);
        let h1 = hash_layout(ShaderStageFlags::VERTEX, &list);
        let h2 = hash_layout(ShaderStageFlags::FRAGMENT, &list);
        assert_ne!(h1, h2);
    }

    #[test]
    fn descriptor_counts_tally_per_category() {
        let list = vec![
            desc(0, DescriptorType::UniformBufferDynamic),
            desc(1, DescriptorType::UniformBufferDynamic),
            desc(2, DescriptorType::CombinedImageSampler),
        ];
        let counts = DescriptorCounts::tally(&list);
        assert_eq!(counts.uniform_buffer_dynamic, 2);
        assert_eq!(counts.combined_image_sampler, 1);
        assert_eq!(counts.sampler, 0);
    }
}

//! Immutable sampler resource (SPEC_FULL.md §3, "Sampler").

use ash::vk;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::format::{AddressMode, CompareOp, FilterMode};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDescriptor {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub min_lod: f32,
    pub max_lod: f32,
    pub anisotropy: Option<f32>,
    pub compare: Option<CompareOp>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        SamplerDescriptor {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            address_u: AddressMode::Repeat,
            address_v: AddressMode::Repeat,
            address_w: AddressMode::Repeat,
            min_lod: 0.0,
            max_lod: 1000.0,
            anisotropy: None,
            compare: None,
        }
    }
}

pub struct Sampler {
    device: Arc<Device>,
    raw: vk::Sampler,
    desc: SamplerDescriptor,
}

unsafe impl Send for Sampler {}
unsafe impl Sync for Sampler {}

impl Sampler {
    pub fn new(device: &Arc<Device>, desc: SamplerDescriptor) -> Result<Sampler> {
        let mut info = vk::SamplerCreateInfo::builder()
            .min_filter(desc.min_filter.to_vk())
            .mag_filter(desc.mag_filter.to_vk())
            .address_mode_u(desc.address_u.to_vk())
            .address_mode_v(desc.address_v.to_vk())
            .address_mode_w(desc.address_w.to_vk())
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod);

        if let Some(max_aniso) = desc.anisotropy {
            info = info.anisotropy_enable(true).max_anisotropy(max_aniso);
        }
        if let Some(op) = desc.compare {
            info = info.compare_enable(true).compare_op(op.to_vk());
        }

        let raw = unsafe { device.raw().create_sampler(&info, None)? };
        Ok(Sampler { device: device.clone(), raw, desc })
    }

    pub fn raw(&self) -> vk::Sampler {
        self.raw
    }

    pub fn descriptor(&self) -> SamplerDescriptor {
        self.desc
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_sampler(self.raw, None);
        }
    }
}

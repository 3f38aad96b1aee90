//! RHI creation options (SPEC_FULL.md §6).
//!
//! Loaded through the `config` crate so the host application can layer a TOML
//! file, environment variables (`RHI_*`), and defaults the way the rest of the
//! engine configures itself.

use serde::Deserialize;

/// GPU type preference used when selecting a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuPreference {
    Integrated,
    Discrete,
    Any,
}

impl Default for GpuPreference {
    fn default() -> Self {
        GpuPreference::Any
    }
}

/// Creation-time configuration for a [`crate::device::Device`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RhiConfig {
    /// Request the backend's debug/validation layer.
    pub enable_validation: bool,
    /// Preferred physical device class.
    pub prefer_gpu_type: GpuPreference,
    /// Desired swapchain image count; clamped to `[min_supported, max_supported]`.
    pub desired_swapchain_images: u32,
    /// Capacity in bytes of a single uniform page (SPEC_FULL.md §4.2).
    pub uniform_page_size: usize,
    /// Descriptor sets preallocated per pool in the descriptor-pool chain.
    pub descriptor_pool_sets: u32,
    /// Number of frames the command-buffer manager keeps in flight before a
    /// stalled fence is treated as suspicious (diagnostic only, SPEC_FULL.md §8).
    pub max_frames_in_flight: u32,
}

impl Default for RhiConfig {
    fn default() -> Self {
        RhiConfig {
            enable_validation: cfg!(debug_assertions),
            prefer_gpu_type: GpuPreference::Any,
            desired_swapchain_images: 3,
            uniform_page_size: 64 * 1024,
            descriptor_pool_sets: 1024,
            max_frames_in_flight: 2,
        }
    }
}

impl RhiConfig {
    /// Loads configuration from an optional TOML file layered under
    /// environment variables prefixed `RHI_` (e.g. `RHI_ENABLE_VALIDATION=1`),
    /// falling back to [`RhiConfig::default`] for anything unset.
    pub fn load(path: Option<&str>) -> crate::error::Result<RhiConfig> {
        let mut builder = config::Config::new();
        // Seed every field so a partial override (file or env) doesn't leave
        // the rest undefined.
        builder.merge(config::Config::try_from(&RhiConfig::default())?)?;
        if let Some(path) = path {
            builder.merge(config::File::with_name(path).required(false))?;
        }
        builder.merge(config::Environment::with_prefix("rhi"))?;
        Ok(builder.try_into()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let cfg = RhiConfig::default();
        assert!(cfg.uniform_page_size > 0);
        assert!(cfg.desired_swapchain_images >= 1);
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let cfg = RhiConfig::load(None).expect("defaults must always load");
        assert_eq!(cfg.desired_swapchain_images, RhiConfig::default().desired_swapchain_images);
    }
}

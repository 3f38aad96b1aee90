//! Error taxonomy for the RHI (see SPEC_FULL.md §7).

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, RhiError>;

/// The unified error type surfaced at RHI boundaries.
///
/// Recoverable conditions (cache miss triggering a recompile, pool exhaustion
/// triggering chain growth) are handled internally and never reach the caller
/// as an error; only the taxonomy described in SPEC_FULL.md §7 is represented
/// here.
#[derive(Debug, Error)]
pub enum RhiError {
    #[error("device lost")]
    DeviceLost,

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("descriptor pool exhausted and a fresh pool still could not satisfy the allocation")]
    OutOfPoolMemory,

    #[error("pipeline render pass is not compatible with the currently bound render target")]
    IncompatibleRenderPass,

    #[error("vertex buffer stride does not match the bound pipeline's vertex-input description")]
    VertexStrideMismatch,

    #[error("no shader compiler is registered to resolve pipeline `{identity}`")]
    ShaderCompileUnavailable { identity: String },

    #[error("handle does not reference a live resource")]
    InvalidHandle,

    #[error("invalid state transition: expected `{expected}`, found `{found}`")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("allocation of {requested} bytes exceeds page capacity of {capacity} bytes")]
    AllocationTooLarge { requested: usize, capacity: usize },

    #[error("no suitable physical device found matching the requested configuration")]
    NoSuitablePhysicalDevice,

    #[error("`{feature}` is not supported by this device")]
    FeatureUnsupported { feature: &'static str },

    #[error("swapchain is out of date and must be resized before further use")]
    SwapchainOutOfDate,

    #[error("vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

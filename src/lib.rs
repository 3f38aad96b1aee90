//! Render Hardware Interface: a backend-agnostic contract for GPU command
//! submission, resource lifetime, descriptor binding, pipeline state, and
//! frame synchronization, with a concrete Vulkan implementation
//! (SPEC_FULL.md §1).
//!
//! Module layout mirrors the components of SPEC_FULL.md §4: each module owns
//! one cache, allocator, or state machine, threaded through a single
//! [`device::Device`] value in place of the teacher's global singleton
//! (SPEC_FULL.md §9).

#[macro_use]
extern crate log;

pub mod buffer;
pub mod command_buffer;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod format;
pub mod handle;
pub mod memory;
pub mod pipeline;
pub mod pipeline_layout;
pub mod render_pass;
pub mod resource;
pub mod sampler;
pub mod state;
pub mod swapchain;
pub mod texture;
pub mod uniform;
pub mod vertex;
pub mod view;

mod context;

pub use config::RhiConfig;
pub use context::{BeginRenderingInfo, Context};
pub use device::Device;
pub use error::{Result, RhiError};
pub use handle::{Handle, WeakHandle};

/// Initializes `pretty_env_logger` once per process. Safe to call more than
/// once; only the first call installs the logger, the rest are discarded
/// (not surfaced as an error, since re-initialization is expected when
/// multiple crates in a host application each call this).
///
/// Host applications embedding this crate as part of a larger engine are
/// free to install their own `log` backend instead and skip this entirely.
pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_logging_is_idempotent() {
        super::init_logging();
        super::init_logging();
    }
}

//! Minimal headless smoke test for the RHI (SPEC_FULL.md §7, §13): creates a
//! device with no window collaborator, records and submits one empty command
//! buffer, and logs the outcome. This is the one place in the crate allowed
//! to call `std::process::exit`; the library itself never terminates the
//! process (SPEC_FULL.md §7).

#[macro_use]
extern crate log;

use rhi_vulkan::{Device, RhiConfig};

fn run() -> rhi_vulkan::Result<()> {
    let config = RhiConfig::load(None)?;
    let device = Device::new(config, &[])?;
    info!(
        "device ready (dynamic_rendering={})",
        device.supports_dynamic_rendering()
    );
    device.wait_idle()?;
    Ok(())
}

fn main() {
    rhi_vulkan::init_logging();
    if let Err(err) = run() {
        error!("demo failed: {}", err);
        std::process::exit(1);
    }
}

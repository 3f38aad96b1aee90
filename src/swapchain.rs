//! Window-bound swapchain: acquire/present semaphore protocol and resize
//! (SPEC_FULL.md §4.9).
//!
//! Surface creation takes an opaque `raw-window-handle`-implementing value —
//! the crate does not know about windows — via `ash-window`, in place of the
//! teacher's hand-rolled per-platform `create_surface` cfg blocks.

use ash::vk;
use raw_window_handle::HasRawWindowHandle;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{Result, RhiError};
use crate::format::{Format, ImageLayout, TextureUsage};
use crate::handle::Handle;
use crate::render_pass::{RenderPassCache, RenderTarget};
use crate::texture::{Texture, TextureDescriptor};
use crate::view::{SubresourceRange, View, ViewKind};

/// Creates a `VkSurfaceKHR` for `window` through `ash-window`. The returned
/// handle is owned by the caller; [`Swapchain::new`] takes ownership of it.
pub fn create_surface<W: HasRawWindowHandle>(device: &Device, window: &W) -> Result<vk::SurfaceKHR> {
    let surface = unsafe { ash_window::create_surface(device.entry(), device.instance(), window, None)? };
    Ok(surface)
}

/// Instance extensions the windowing collaborator must request alongside
/// `VK_KHR_surface` before [`crate::device::Device::new`] is called.
pub fn required_instance_extensions<W: HasRawWindowHandle>(window: &W) -> Result<Vec<*const i8>> {
    Ok(ash_window::enumerate_required_extensions(window)?.iter().map(|s| s.as_ptr()).collect())
}

struct SwapchainImage {
    texture: Handle<Texture>,
    view: Handle<View>,
    render_finished: vk::Semaphore,
}

/// A chain of presentable images bound to a surface, plus the per-frame
/// synchronization primitives described in SPEC_FULL.md §4.9's protocol.
pub struct Swapchain {
    device: Arc<Device>,
    render_pass_cache: Arc<RenderPassCache>,
    surface: vk::SurfaceKHR,
    raw: vk::SwapchainKHR,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    images: Vec<SwapchainImage>,
    render_targets: Vec<Handle<RenderTarget>>,
    image_available: Vec<vk::Semaphore>,
    frame_index: usize,
    vsync: bool,
}

impl Swapchain {
    /// Builds a swapchain over `surface` sized to `requested_extent` (clamped
    /// to the surface's reported min/max), honoring
    /// `config.desired_swapchain_images` (clamped to the surface's supported
    /// image count) and `vsync` for present-mode selection.
    pub fn new(
        device: &Arc<Device>,
        render_pass_cache: &Arc<RenderPassCache>,
        surface: vk::SurfaceKHR,
        requested_extent: (u32, u32),
        vsync: bool,
    ) -> Result<Swapchain> {
        let mut swapchain = Swapchain {
            device: device.clone(),
            render_pass_cache: render_pass_cache.clone(),
            surface,
            raw: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            extent: vk::Extent2D { width: 0, height: 0 },
            present_mode: vk::PresentModeKHR::FIFO,
            images: Vec::new(),
            render_targets: Vec::new(),
            image_available: Vec::new(),
            frame_index: 0,
            vsync,
        };
        swapchain.build(requested_extent, vk::SwapchainKHR::null())?;
        Ok(swapchain)
    }

    fn choose_format(&self, candidates: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
        candidates
            .iter()
            .find(|f| f.format == Format::B8G8R8A8Unorm.to_vk() && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .copied()
            .unwrap_or(candidates[0])
    }

    fn choose_present_mode(&self, candidates: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        if self.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            candidates
                .iter()
                .copied()
                .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                .or_else(|| candidates.iter().copied().find(|&m| m == vk::PresentModeKHR::IMMEDIATE))
                .unwrap_or(vk::PresentModeKHR::FIFO)
        }
    }

    /// (Re)creates the swapchain, image views, render targets and per-frame
    /// semaphores. `old` is passed to `VkSwapchainCreateInfoKHR::oldSwapchain`
    /// so the platform can hand back the same images where possible.
    fn build(&mut self, requested_extent: (u32, u32), old: vk::SwapchainKHR) -> Result<()> {
        let surface_loader = self.device.surface_loader();
        let physical_device = self.device.physical_device();

        let capabilities = unsafe { surface_loader.get_physical_device_surface_capabilities(physical_device, self.surface)? };
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical_device, self.surface)? };
        let present_modes = unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, self.surface)? };

        let surface_format = self.choose_format(&formats);
        let present_mode = self.choose_present_mode(&present_modes);

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: requested_extent.0.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
                height: requested_extent.1.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
            }
        };

        let mut image_count = self.device.config().desired_swapchain_images.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let raw = unsafe { self.device.swapchain_loader().create_swapchain(&info, None)? };
        let raw_images = unsafe { self.device.swapchain_loader().get_swapchain_images(raw)? };

        let desc = TextureDescriptor {
            format: Format::B8G8R8A8Unorm,
            width: extent.width,
            height: extent.height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: TextureUsage::COLOR_ATTACHMENT,
        };

        let mut images = Vec::with_capacity(raw_images.len());
        let mut render_targets = Vec::with_capacity(raw_images.len());
        for raw_image in raw_images {
            let texture = Handle::new(Texture::from_raw(&self.device, raw_image, desc, ImageLayout::Undefined));
            let view = Handle::new(View::new(
                &self.device,
                texture.clone(),
                ViewKind::Rtv,
                Format::B8G8R8A8Unorm,
                SubresourceRange::default(),
            )?);
            let render_finished_info = vk::SemaphoreCreateInfo::builder();
            let render_finished = unsafe { self.device.raw().create_semaphore(&render_finished_info, None)? };

            let rt = self.render_pass_cache.get_or_create_render_target(
                vec![view.clone()],
                None,
                self.device.supports_dynamic_rendering(),
            )?;

            render_targets.push(rt);
            images.push(SwapchainImage { texture, view, render_finished });
        }

        let frames_in_flight = self.device.config().max_frames_in_flight.max(1) as usize;
        let mut image_available = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            let sem_info = vk::SemaphoreCreateInfo::builder();
            image_available.push(unsafe { self.device.raw().create_semaphore(&sem_info, None)? });
        }

        self.raw = raw;
        self.format = surface_format.format;
        self.color_space = surface_format.color_space;
        self.extent = extent;
        self.present_mode = present_mode;
        self.images = images;
        self.render_targets = render_targets;
        self.image_available = image_available;
        self.frame_index = 0;

        log::info!(
            "built swapchain: {}x{}, {} images, present_mode={:?}",
            extent.width,
            extent.height,
            self.images.len(),
            present_mode
        );
        Ok(())
    }

    /// Drains in-flight work, tears down the swapchain, image views and
    /// per-frame semaphores, and rebuilds against the surface's current
    /// extent (SPEC_FULL.md §4.9). A (0, 0) target is a no-op (§8 edge case).
    pub fn resize(&mut self, requested_extent: (u32, u32)) -> Result<()> {
        if requested_extent.0 == 0 || requested_extent.1 == 0 {
            return Ok(());
        }
        self.device.wait_idle()?;
        let old = self.raw;
        // Image views/semaphores must be destroyed before the old swapchain;
        // vkDestroySwapchainKHR is what actually frees the backbuffer images.
        for image in self.images.drain(..) {
            unsafe { self.device.raw().destroy_semaphore(image.render_finished, None) };
        }
        for rt in self.render_targets.drain(..) {
            self.render_pass_cache.evict(&rt);
        }
        for sem in self.image_available.drain(..) {
            unsafe { self.device.raw().destroy_semaphore(sem, None) };
        }
        self.build(requested_extent, old)?;
        unsafe { self.device.swapchain_loader().destroy_swapchain(old, None) };
        Ok(())
    }

    /// Acquires the next presentable image, waiting on the frame-in-flight's
    /// `image_available` semaphore. Returns `RhiError::SwapchainOutOfDate` if
    /// the caller must `resize` before proceeding.
    pub fn acquire_next_image(&mut self) -> Result<(u32, vk::Semaphore)> {
        let semaphore = self.image_available[self.frame_index];
        self.frame_index = (self.frame_index + 1) % self.image_available.len();

        let result = unsafe {
            self.device.swapchain_loader().acquire_next_image(self.raw, u64::MAX, semaphore, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("swapchain acquire returned suboptimal, resize recommended");
                }
                Ok((index, semaphore))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RhiError::SwapchainOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Render target for the given swapchain image index.
    pub fn render_target(&self, image_index: u32) -> &Handle<RenderTarget> {
        &self.render_targets[image_index as usize]
    }

    /// Semaphore the caller signals when submitting work that renders into
    /// `image_index`; [`Self::present`] waits on it.
    pub fn render_finished_semaphore(&self, image_index: u32) -> vk::Semaphore {
        self.images[image_index as usize].render_finished
    }

    /// Presents `image_index`, waiting on its `render_finished` semaphore.
    pub fn present(&self, image_index: u32) -> Result<()> {
        let wait = [self.render_finished_semaphore(image_index)];
        let swapchains = [self.raw];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder().wait_semaphores(&wait).swapchains(&swapchains).image_indices(&indices);

        let result = unsafe { self.device.swapchain_loader().queue_present(self.device.present_queue(), &info) };
        match result {
            Ok(suboptimal) => {
                if suboptimal {
                    log::debug!("swapchain present returned suboptimal, resize recommended");
                }
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RhiError::SwapchainOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        for image in self.images.drain(..) {
            unsafe { self.device.raw().destroy_semaphore(image.render_finished, None) };
        }
        for rt in self.render_targets.drain(..) {
            self.render_pass_cache.evict(&rt);
        }
        for sem in self.image_available.drain(..) {
            unsafe { self.device.raw().destroy_semaphore(sem, None) };
        }
        if self.raw != vk::SwapchainKHR::null() {
            unsafe { self.device.swapchain_loader().destroy_swapchain(self.raw, None) };
        }
        let surface_loader = self.device.surface_loader();
        unsafe { surface_loader.destroy_surface(self.surface, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsync_always_picks_fifo() {
        let swapchain_vsync_on = |vsync: bool, candidates: &[vk::PresentModeKHR]| -> vk::PresentModeKHR {
            if vsync {
                vk::PresentModeKHR::FIFO
            } else {
                candidates
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .or_else(|| candidates.iter().copied().find(|&m| m == vk::PresentModeKHR::IMMEDIATE))
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            }
        };
        let candidates = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(swapchain_vsync_on(true, &candidates), vk::PresentModeKHR::FIFO);
        assert_eq!(swapchain_vsync_on(false, &candidates), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn no_vsync_falls_back_to_immediate_without_mailbox() {
        let swapchain_vsync_off = |candidates: &[vk::PresentModeKHR]| -> vk::PresentModeKHR {
            candidates
                .iter()
                .copied()
                .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                .or_else(|| candidates.iter().copied().find(|&m| m == vk::PresentModeKHR::IMMEDIATE))
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };
        let candidates = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(swapchain_vsync_off(&candidates), vk::PresentModeKHR::IMMEDIATE);
    }
}

// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Rebuilt from the previous swapchain whenever the window size changes.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

/// Outcome of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// Image ready to render into. `suboptimal` images still present fine
    /// but the swapchain should be rebuilt soon.
    Image { index: u32, suboptimal: bool },
    /// The surface changed and this swapchain can no longer be used
    OutOfDate,
}

/// Resize bookkeeping, independent of any Vulkan object.
///
/// A zero-area window pauses rendering. A pending rebuild survives the
/// pause and runs once the window has area again.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainState {
    needs_recreate: bool,
    is_minimized: bool,
}

impl SwapchainState {
    /// Window size changed; zero area pauses rendering
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            self.is_minimized = true;
        } else {
            self.is_minimized = false;
            self.needs_recreate = true;
        }
    }

    /// Stale swapchain, fullscreen toggle or a missing swapchain
    pub fn request_recreate(&mut self) {
        self.needs_recreate = true;
    }

    pub fn should_render(&self) -> bool {
        !self.is_minimized
    }

    pub fn wants_recreate(&self) -> bool {
        self.needs_recreate
    }

    /// Called with the extent the surface reports before rebuilding.
    /// Returns false if the surface has no area and the rebuild must wait.
    pub fn begin_recreate(&mut self, extent: vk::Extent2D) -> bool {
        self.is_minimized = extent.width == 0 || extent.height == 0;
        !self.is_minimized
    }

    pub fn finish_recreate(&mut self) {
        self.needs_recreate = false;
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Create a swapchain for the device's surface.
    ///
    /// When `old` is given its handle is passed as `old_swapchain` so the
    /// driver can reuse resources; the caller drops it afterwards.
    pub fn new(
        device: Arc<VulkanDevice>,
        preferred_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let surface = device.surface;
        let surface_loader = &device.surface_loader;

        let surface_caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(device.physical_device, surface)
        }
        .context("Unable to query physical device surface capabilities")?;

        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(device.physical_device, surface)
        }
        .context("Unable to query physical device surface present modes")?;

        let surface_format = query_surface_format(&device)?;
        let present_mode = choose_present_mode(&present_modes, preferred_mode);
        let extent = choose_extent(&surface_caps, width, height);
        let image_count = choose_image_count(&surface_caps);
        let pre_transform = choose_pre_transform(&surface_caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |old| old.swapchain))
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to get swapchain images");
            }
        };

        log::debug!("Swapchain has {} images", images.len());

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match create_color_view(&device.device, image, surface_format.format) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    unsafe {
                        for &view in &image_views {
                            device.device.destroy_image_view(view, None);
                        }
                        swapchain_loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views,
            format: surface_format.format,
            extent,
            device,
        })
    }

    /// Acquire next image for rendering, signaling `semaphore` once it is ready
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<Acquired> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen.
    ///
    /// Returns true when the swapchain should be recreated.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Surface format a swapchain for this device will use
pub fn query_surface_format(device: &VulkanDevice) -> Result<vk::SurfaceFormatKHR> {
    let formats = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_formats(device.physical_device, device.surface)
    }
    .context("Unable to query physical device surface formats")?;

    choose_surface_format(&formats).context("No surface formats were found")
}

/// Extent a swapchain created now would get; zero while the window is minimized
pub fn query_extent(device: &VulkanDevice, width: u32, height: u32) -> Result<vk::Extent2D> {
    let surface_caps = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_capabilities(device.physical_device, device.surface)
    }
    .context("Unable to query physical device surface capabilities")?;

    Ok(choose_extent(&surface_caps, width, height))
}

fn create_color_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::R,
            g: vk::ComponentSwizzle::G,
            b: vk::ComponentSwizzle::B,
            a: vk::ComponentSwizzle::A,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }
        .context("Failed to create swapchain image view")
}

/// Pick the surface format.
///
/// A single UNDEFINED entry means the surface has no preference.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: only.color_space,
            });
        }
    }

    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use the preferred mode when available; FIFO is always supported
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        if preferred != vk::PresentModeKHR::FIFO {
            log::warn!("Present mode {:?} not supported, using FIFO", preferred);
        }
        vk::PresentModeKHR::FIFO
    }
}

/// Surface size, or the window size when the surface leaves it to us
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, so acquire rarely blocks. 0 max means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 && desired > caps.max_image_count {
        caps.max_image_count
    } else {
        desired
    }
}

pub fn choose_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D { width: 640, height: 480 },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        }
    }

    #[test]
    fn undefined_format_means_any() {
        let formats = [format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let chosen = choose_surface_format(&formats).unwrap();

        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn srgb_format_preferred_over_first() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn first_format_when_no_srgb() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];

        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_when_defined() {
        let extent = choose_extent(&caps(2, 3), 300, 300);
        assert_eq!((extent.width, extent.height), (640, 480));
    }

    #[test]
    fn extent_clamps_window_size_when_undefined() {
        let mut caps = caps(2, 3);
        caps.current_extent = vk::Extent2D { width: u32::MAX, height: u32::MAX };
        caps.max_image_extent = vk::Extent2D { width: 800, height: 600 };

        let extent = choose_extent(&caps, 300, 200);
        assert_eq!((extent.width, extent.height), (300, 200));

        let extent = choose_extent(&caps, 5000, 0);
        assert_eq!((extent.width, extent.height), (800, 1));
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        assert_eq!(choose_image_count(&caps(2, 8)), 3);
        assert_eq!(choose_image_count(&caps(2, 2)), 2);
        assert_eq!(choose_image_count(&caps(3, 0)), 4);
    }

    #[test]
    fn identity_transform_preferred() {
        let mut caps = caps(2, 3);
        caps.supported_transforms =
            vk::SurfaceTransformFlagsKHR::IDENTITY | vk::SurfaceTransformFlagsKHR::ROTATE_90;
        caps.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(choose_pre_transform(&caps), vk::SurfaceTransformFlagsKHR::IDENTITY);

        caps.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(choose_pre_transform(&caps), vk::SurfaceTransformFlagsKHR::ROTATE_90);
    }

    const ZERO: vk::Extent2D = vk::Extent2D { width: 0, height: 0 };

    #[test]
    fn zero_size_resize_pauses_without_rebuild() {
        let mut state = SwapchainState::default();
        assert!(state.should_render());

        state.resize(0, 0);
        assert!(!state.should_render());
        assert!(!state.wants_recreate());

        state.resize(800, 0);
        assert!(!state.should_render());
        assert!(!state.wants_recreate());
    }

    #[test]
    fn resize_with_area_requests_rebuild() {
        let mut state = SwapchainState::default();
        state.resize(0, 0);
        state.resize(640, 480);

        assert!(state.should_render());
        assert!(state.wants_recreate());

        assert!(state.begin_recreate(vk::Extent2D { width: 640, height: 480 }));
        state.finish_recreate();
        assert!(state.should_render());
        assert!(!state.wants_recreate());
    }

    #[test]
    fn rebuild_request_while_minimized_stays_paused() {
        let mut state = SwapchainState::default();
        state.resize(0, 0);
        state.request_recreate();

        assert!(!state.should_render());
        assert!(state.wants_recreate());

        // Restoring the window resumes with the rebuild still pending
        state.resize(300, 300);
        assert!(state.should_render());
        assert!(state.wants_recreate());
    }

    #[test]
    fn zero_extent_during_rebuild_stays_minimized() {
        let mut state = SwapchainState::default();
        state.resize(1024, 768);

        // Window was minimized between the resize event and the rebuild
        assert!(!state.begin_recreate(ZERO));
        assert!(!state.should_render());
        assert!(state.wants_recreate());

        state.resize(1024, 768);
        assert!(state.begin_recreate(vk::Extent2D { width: 1024, height: 768 }));
        assert!(state.should_render());
    }
}

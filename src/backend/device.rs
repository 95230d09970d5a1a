// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with the window system's surface extensions
// - Surface creation for the window
// - Physical device + graphics/present queue family selection
// - Logical device + queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device, see Drop
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Presentation target
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,

    pub instance: ash::Instance,
    _entry: Entry,

    /// One queue serves both graphics and present
    pub queue: vk::Queue,
    pub queue_family: u32,

    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanDevice {
    /// Create the Vulkan device for a window
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `window` - Window the surface is created for
    /// * `enable_validation` - Request the Khronos validation layer
    pub fn new<W>(app_name: &str, window: &W, enable_validation: bool) -> Result<Arc<Self>>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = enable_validation && Self::validation_available(&entry);

        // Undoes the steps below if a later one fails. Declared after
        // `entry` so it runs before the library is unloaded.
        let mut cleanup = CleanupStack::default();

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, window, enable_validation)?;
        let handle = instance.clone();
        cleanup.push(move || unsafe { handle.destroy_instance(None) });

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            let (utils, messenger) = Self::setup_debug_messenger(&entry, &instance)?;
            let handle = utils.clone();
            cleanup.push(move || unsafe { handle.destroy_debug_utils_messenger(messenger, None) });
            Some((utils, messenger))
        } else {
            None
        };

        // Step 4: Create surface
        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;
        let handle = surface_loader.clone();
        cleanup.push(move || unsafe { handle.destroy_surface(surface, None) });

        // Step 5: Pick physical device (GPU) able to present to the surface
        let (physical_device, queue_family) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        // Step 6: Create logical device
        let (device, queue) = Self::create_logical_device(&instance, physical_device, queue_family)?;
        let handle = device.clone();
        cleanup.push(move || unsafe { handle.destroy_device(None) });

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::debug!("Graphics/present queue family: {}", queue_family);

        // Step 7: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        // From here on Drop for VulkanDevice owns the handles
        cleanup.disarm();

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            surface,
            surface_loader,
            instance,
            _entry: entry,
            queue,
            queue_family,
            debug_utils,
        }))
    }

    fn validation_available(entry: &Entry) -> bool {
        let layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Unable to query instance layers: {}", e);
                return false;
            }
        };

        let found = layers.iter().any(|layer| {
            (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
        });

        if !found {
            log::warn!("Validation layer not installed, continuing without it");
        }
        found
    }

    fn create_instance<W: HasRawDisplayHandle>(
        entry: &Entry,
        app_name: &str,
        window: &W,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Triangle Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        // Surface extensions required by the window system
        let mut extensions =
            ash_window::enumerate_required_extensions(window.raw_display_handle())
                .context("Window system has no Vulkan surface support")?
                .to_vec();

        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to query the physical devices present")?;

        if devices.is_empty() {
            anyhow::bail!("No physical devices were found with Vulkan support");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if !Self::supports_swapchain(instance, device)? {
                log::debug!("Skipping {}: no {:?}", name, khr::Swapchain::name());
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let supports_present = (0..queue_families.len() as u32)
                .map(|i| unsafe {
                    surface_loader.get_physical_device_surface_support(device, i, surface)
                })
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to query surface support")?;

            let queue_family = match select_queue_family(&queue_families, &supports_present) {
                Ok(family) => family,
                Err(e) => {
                    log::debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };

            let score = device_type_score(props.device_type);
            if score > best_score {
                best_score = score;
                best_device = Some((device, queue_family));
            }
        }

        best_device.context("No GPU can render and present to this window")
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<bool> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .context("Unable to query device extensions")?;

        Ok(extensions.iter().any(|ext| {
            (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == khr::Swapchain::name()
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create a Vulkan device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    /// GPU memory allocator shared by all buffers
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Destroy actions for a partially built device, run newest first on drop
#[derive(Default)]
struct CleanupStack {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl CleanupStack {
    fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Everything succeeded, keep the handles alive
    fn disarm(&mut self) {
        self.steps.clear();
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            log::debug!("Releasing {} partially created Vulkan objects", self.steps.len());
        }
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

/// Pick the queue family used for both rendering and presenting.
///
/// A family supporting both is preferred. Otherwise the first graphics
/// family and the first present family are considered, and they must match.
pub fn select_queue_family(
    families: &[vk::QueueFamilyProperties],
    supports_present: &[bool],
) -> Result<u32> {
    let is_graphics =
        |i: usize| families[i].queue_flags.contains(vk::QueueFlags::GRAPHICS);
    let is_present = |i: usize| supports_present.get(i).copied().unwrap_or(false);

    if let Some(i) = (0..families.len()).find(|&i| is_graphics(i) && is_present(i)) {
        return Ok(i as u32);
    }

    let graphics = (0..families.len()).find(|&i| is_graphics(i));
    let present = (0..families.len()).find(|&i| is_present(i));

    match (graphics, present) {
        (Some(g), Some(p)) if g == p => Ok(g as u32),
        (Some(_), Some(_)) => anyhow::bail!("Could not find a common graphics and present queue"),
        _ => anyhow::bail!("Could not find graphics and present queues"),
    }
}

/// Prefer discrete GPUs over integrated ones
pub fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 1,
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_family_with_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        let present = [false, true, true];

        assert_eq!(select_queue_family(&families, &present).unwrap(), 2);
    }

    #[test]
    fn separate_graphics_and_present_is_rejected() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let present = [false, true];

        let err = select_queue_family(&families, &present).unwrap_err();
        assert!(err.to_string().contains("common"));
    }

    #[test]
    fn missing_present_support_is_rejected() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let err = select_queue_family(&families, &[false]).unwrap_err();
        assert!(err.to_string().contains("graphics and present"));
    }

    #[test]
    fn missing_graphics_is_rejected() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert!(select_queue_family(&families, &[true]).is_err());
        assert!(select_queue_family(&[], &[]).is_err());
    }

    #[test]
    fn short_present_list_counts_as_unsupported() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
        ];
        assert_eq!(select_queue_family(&families, &[false, true]).unwrap(), 1);
        assert!(select_queue_family(&families, &[false]).is_err());
    }

    #[test]
    fn failed_setup_releases_in_reverse_order() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let released = Rc::new(RefCell::new(Vec::new()));
        let setup = || -> Result<()> {
            let mut cleanup = CleanupStack::default();
            for name in ["instance", "messenger", "surface"] {
                let released = released.clone();
                cleanup.push(move || released.borrow_mut().push(name));
            }
            anyhow::bail!("device creation failed")
        };

        assert!(setup().is_err());
        assert_eq!(*released.borrow(), ["surface", "messenger", "instance"]);
    }

    #[test]
    fn disarmed_cleanup_keeps_handles() {
        use std::cell::Cell;
        use std::rc::Rc;

        let released = Rc::new(Cell::new(0));
        {
            let mut cleanup = CleanupStack::default();
            let counter = released.clone();
            cleanup.push(move || counter.set(counter.get() + 1));
            cleanup.disarm();
        }
        assert_eq!(released.get(), 0);
    }

    #[test]
    fn discrete_gpu_scores_highest() {
        let discrete = device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU);
        let cpu = device_type_score(vk::PhysicalDeviceType::CPU);

        assert!(discrete > integrated);
        assert!(integrated > cpu);
        assert!(cpu > 0);
    }
}

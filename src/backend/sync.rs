// Synchronization primitives
//
// Fences pace the CPU against the GPU, semaphores order acquire,
// render and present on the GPU.

use ash::vk;
use anyhow::{Context, Result};
use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let image_available = create_semaphore(device)?;

        // Start signaled so the first wait on this slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        match unsafe { device.device.create_fence(&fence_info, None) } {
            Ok(in_flight_fence) => Ok(Self {
                image_available,
                in_flight_fence,
            }),
            Err(e) => {
                unsafe { device.device.destroy_semaphore(image_available, None) };
                Err(e).context("Failed to create fence")
            }
        }
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_semaphore(self.image_available, None);
            device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

pub fn create_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();

    unsafe { device.device.create_semaphore(&semaphore_info, None) }
        .context("Failed to create semaphore")
}

/// Frame slot bookkeeping: which slot records next and which slot's fence
/// guards each swapchain image.
#[derive(Debug)]
pub struct FrameSlots {
    frames_in_flight: usize,
    current: usize,
    images_in_flight: Vec<Option<usize>>,
}

impl FrameSlots {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current: 0,
            images_in_flight: Vec::new(),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Forget image ownership after the swapchain was rebuilt
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight = vec![None; image_count];
    }

    /// Mark `image` as rendered by the current slot.
    ///
    /// Returns the other slot still using the image, whose fence must be
    /// waited on before the image's command buffer is resubmitted.
    pub fn claim_image(&mut self, image: usize) -> Option<usize> {
        if image >= self.images_in_flight.len() {
            self.images_in_flight.resize(image + 1, None);
        }

        let previous = self.images_in_flight[image].replace(self.current);
        previous.filter(|&slot| slot != self.current)
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames_in_flight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_wrap_around() {
        let mut slots = FrameSlots::new(2);
        assert_eq!(slots.current(), 0);
        slots.advance();
        assert_eq!(slots.current(), 1);
        slots.advance();
        assert_eq!(slots.current(), 0);
    }

    #[test]
    fn zero_slots_behaves_like_one() {
        let mut slots = FrameSlots::new(0);
        slots.advance();
        assert_eq!(slots.current(), 0);
    }

    #[test]
    fn claiming_image_used_by_other_slot_reports_it() {
        let mut slots = FrameSlots::new(2);
        slots.reset_images(3);

        assert_eq!(slots.claim_image(0), None);
        slots.advance();
        assert_eq!(slots.claim_image(1), None);
        slots.advance();

        // Slot 0 again: image 1 still belongs to slot 1
        assert_eq!(slots.claim_image(1), Some(1));
        // Image 1 now belongs to slot 0, whose fence is waited on every frame
        slots.advance();
        slots.advance();
        assert_eq!(slots.claim_image(1), None);
    }

    #[test]
    fn reset_forgets_ownership() {
        let mut slots = FrameSlots::new(2);
        slots.reset_images(2);
        slots.claim_image(0);
        slots.advance();

        slots.reset_images(2);
        assert_eq!(slots.claim_image(0), None);
    }

    #[test]
    fn out_of_range_image_grows_table() {
        let mut slots = FrameSlots::new(2);
        assert_eq!(slots.claim_image(4), None);
        slots.advance();
        assert_eq!(slots.claim_image(4), Some(0));
    }
}

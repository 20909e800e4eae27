// Synchronization - frame slots and the acquire/submit/present cycle
//
// N frame slots rotate modulo N. A slot owns a command buffer, an
// image-acquired semaphore and a frame-complete fence. The fence gates reuse:
// a slot is never re-recorded before the GPU has retired its last submission,
// so at most N frames are ever in flight.
//
// Render-finished semaphores are per swapchain image and live in the swapchain.
// `images_in_flight` remembers which slot last rendered into each image, so an
// image handed back early by the presentation engine is not re-recorded while
// an older frame still targets it.

use anyhow::{bail, Result};
use ash::vk;

use super::device::DeviceContext;
use crate::error::EngineError;

/// Result of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of a present request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presented {
    Optimal,
    Suboptimal,
    OutOfDate,
}

/// What happened to one iteration of the frame loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Frame submitted and presented
    Presented,
    /// Frame submitted and presented, but the swapchain should be rebuilt
    PresentedStale,
    /// Acquire reported out-of-date; nothing was recorded or submitted
    OutOfDate,
}

impl FrameOutcome {
    pub fn needs_recreate(self) -> bool {
        !matches!(self, FrameOutcome::Presented)
    }

    pub fn presented(self) -> bool {
        !matches!(self, FrameOutcome::OutOfDate)
    }
}

/// The GPU side of the frame loop, as seen by [`FrameSynchronizer`]
///
/// Slots are indices into the frame slots, images are swapchain image indices.
pub trait FrameTimeline {
    /// Block until the slot's frame-complete fence is signaled
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    /// Unsignal the slot's fence ahead of its next submission
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    /// Acquire the next image, signaling the slot's image-acquired semaphore
    fn acquire(&mut self, slot: usize) -> Result<Acquired>;
    /// Record the slot's command buffer for `image`
    fn record(&mut self, slot: usize, image: u32) -> Result<()>;
    /// Submit the slot's command buffer, arming its fence
    fn submit(&mut self, slot: usize, image: u32) -> Result<()>;
    /// Queue `image` for presentation
    fn present(&mut self, slot: usize, image: u32) -> Result<Presented>;
}

/// Frame pacing state: slot rotation plus the images-in-flight table
#[derive(Debug, Clone)]
pub struct FrameSynchronizer {
    frames_in_flight: usize,
    current_frame: usize,
    images_in_flight: Vec<Option<usize>>,
}

impl FrameSynchronizer {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current_frame: 0,
            images_in_flight: vec![None; image_count],
        }
    }

    #[inline]
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Slot that last submitted work targeting `image`
    pub fn image_owner(&self, image: u32) -> Option<usize> {
        self.images_in_flight.get(image as usize).copied().flatten()
    }

    /// Number of swapchain images the ownership table covers
    pub fn tracked_images(&self) -> usize {
        self.images_in_flight.len()
    }

    /// Forget image ownership after the swapchain was rebuilt
    ///
    /// Only call once the device is idle.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }

    /// Run one acquire -> record -> submit -> present iteration.
    ///
    /// The slot's fence is reset only after acquisition and recording
    /// succeeded, so an aborted frame never leaves a fence that no submission
    /// will signal.
    pub fn draw_frame<T: FrameTimeline + ?Sized>(&mut self, gpu: &mut T) -> Result<FrameOutcome> {
        let slot = self.current_frame;

        // Admission control: the slot's previous frame must be retired
        gpu.wait_for_slot(slot)?;

        let (image, acquire_suboptimal) = match gpu.acquire(slot)? {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::OutOfDate => {
                log::debug!("Swapchain out of date during acquire");
                return Ok(FrameOutcome::OutOfDate);
            }
        };

        let image_slot = image as usize;
        if image_slot >= self.images_in_flight.len() {
            bail!(
                "Acquired image {} but only {} images are tracked",
                image,
                self.images_in_flight.len()
            );
        }

        // The image may still be the target of an older frame
        if let Some(owner) = self.images_in_flight[image_slot] {
            if owner != slot {
                gpu.wait_for_slot(owner)?;
            }
        }

        gpu.record(slot, image)?;
        gpu.reset_slot(slot)?;
        gpu.submit(slot, image)?;
        self.images_in_flight[image_slot] = Some(slot);

        // The slot is armed from here on, whatever present reports
        self.current_frame = (slot + 1) % self.frames_in_flight;

        let outcome = match gpu.present(slot, image)? {
            Presented::Optimal if !acquire_suboptimal => FrameOutcome::Presented,
            Presented::Optimal | Presented::Suboptimal => FrameOutcome::PresentedStale,
            Presented::OutOfDate => {
                log::debug!("Swapchain out of date during present");
                FrameOutcome::PresentedStale
            }
        };

        Ok(outcome)
    }
}

/// Per-frame-in-flight Vulkan objects
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSlot {
    pub fn new(device: &ash::Device, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .map_err(EngineError::creation("image-acquired semaphore"))?;

            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(EngineError::creation("frame fence")(e).into());
                }
            };

            Ok(Self {
                command_buffer,
                image_available,
                in_flight_fence,
            })
        }
    }

    /// Command buffers go back with their pool
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Command pool plus `count` frame slots allocated from it
pub struct FrameSlots {
    pub command_pool: vk::CommandPool,
    pub slots: Vec<FrameSlot>,
}

impl FrameSlots {
    pub fn new(device: &DeviceContext, count: usize) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            // RESET: command buffers are re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .map_err(EngineError::creation("command pool"))?;

        let mut frames = Self {
            command_pool,
            slots: Vec::with_capacity(count),
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        let command_buffers = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                frames.destroy(&device.device);
                return Err(EngineError::creation("command buffers")(e).into());
            }
        };

        for command_buffer in command_buffers {
            match FrameSlot::new(&device.device, command_buffer) {
                Ok(slot) => frames.slots.push(slot),
                Err(e) => {
                    frames.destroy(&device.device);
                    return Err(e);
                }
            }
        }

        log::info!("Created {} frame slots", count);
        Ok(frames)
    }

    pub fn get(&self, slot: usize) -> &FrameSlot {
        &self.slots[slot]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Destroy slots and pool; the device must be idle
    pub fn destroy(&mut self, device: &ash::Device) {
        for slot in self.slots.drain(..) {
            slot.destroy(device);
        }
        if self.command_pool != vk::CommandPool::null() {
            unsafe { device.destroy_command_pool(self.command_pool, None) };
            self.command_pool = vk::CommandPool::null();
        }
    }
}

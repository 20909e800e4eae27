// Backend module - Vulkan layer of the presentation engine
//
// device    -> instance, surface, GPU, queues
// swapchain -> images, views, framebuffers, per-image semaphores
// pipeline  -> render pass, graphics pipeline, command recording
// sync      -> frame slots and the acquire/submit/present protocol

pub mod device;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::{DeviceContext, DeviceOptions};
pub use pipeline::FramePipeline;
pub use surface::PresentTarget;
pub use swapchain::Swapchain;
pub use sync::{FrameOutcome, FrameSlots, FrameSynchronizer, FrameTimeline};

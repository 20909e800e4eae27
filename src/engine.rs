// =============================================================================
// PRESENTATION ENGINE - device, swapchain, pipeline and frame slots together
// =============================================================================
//
// Owns every Vulkan object of the application. The window side only hands in
// a `PresentTarget` and calls `render_frame` on every redraw.
//
// Lifetime:
//   DeviceContext    created once, destroyed last
//   Swapchain        rebuilt on resize / out-of-date / suboptimal
//   FramePipeline    rebuilt only when the swapchain format changes
//   FrameSlots       created once, sized by max_frames_in_flight
//
// The rebuild policy lives in `PresentState`, which only sees the swapchain
// and pipeline through `SurfaceResources`.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::backend::sync::{Acquired, Presented};
use crate::backend::{
    DeviceContext, DeviceOptions, FramePipeline, FrameSlots, FrameSynchronizer, FrameTimeline,
    PresentTarget, Swapchain,
};
use crate::config::Config;
use crate::error::EngineError;

/// Whether a surface of this size can be rendered to
pub fn is_drawable((width, height): (u32, u32)) -> bool {
    width > 0 && height > 0
}

// =============================================================================
// REBUILD POLICY
// =============================================================================

/// What the rebuild policy needs to know about a swapchain
pub trait PresentImages {
    fn image_format(&self) -> vk::Format;
    fn image_count(&self) -> usize;
}

impl PresentImages for Swapchain {
    fn image_format(&self) -> vk::Format {
        self.format.format
    }

    fn image_count(&self) -> usize {
        Swapchain::image_count(self)
    }
}

/// Creates the surface-dependent objects
pub trait SurfaceResources {
    type Swapchain: PresentImages;
    type Pipeline;

    /// Block until the GPU has retired all submitted work
    fn wait_idle(&mut self) -> Result<()>;
    /// `Ok(None)` when the surface currently has zero area
    fn create_swapchain(&mut self, drawable: (u32, u32)) -> Result<Option<Self::Swapchain>>;
    fn create_pipeline(&mut self, format: vk::Format) -> Result<Self::Pipeline>;
    fn pipeline_format(pipeline: &Self::Pipeline) -> vk::Format;
    /// Bind the swapchain's images to the pipeline's render pass
    fn attach(&mut self, swapchain: &mut Self::Swapchain, pipeline: &Self::Pipeline) -> Result<()>;
}

/// Swapchain + pipeline and whether they are stale
pub struct PresentState<S, P> {
    // Dropped in this order: framebuffers go before the render pass
    swapchain: Option<S>,
    pipeline: Option<P>,

    /// Set by resize events and by out-of-date / suboptimal results
    needs_recreate: bool,
}

impl<S: PresentImages, P> Default for PresentState<S, P> {
    fn default() -> Self {
        Self {
            swapchain: None,
            pipeline: None,
            needs_recreate: false,
        }
    }
}

impl<S: PresentImages, P> PresentState<S, P> {
    pub fn request_recreate(&mut self) {
        self.needs_recreate = true;
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }

    pub fn swapchain(&self) -> Option<&S> {
        self.swapchain.as_ref()
    }

    pub fn pipeline(&self) -> Option<&P> {
        self.pipeline.as_ref()
    }

    /// Swapchain and pipeline, if a frame can be drawn with them
    pub fn ready(&self) -> Option<(&S, &P)> {
        Some((self.swapchain.as_ref()?, self.pipeline.as_ref()?))
    }

    /// Get ready for a frame at `drawable` size, rebuilding if needed.
    ///
    /// Returns `false` when no frame should be drawn: zero-area drawable, or
    /// the surface refused a swapchain for now.
    pub fn prepare<R>(
        &mut self,
        resources: &mut R,
        synchronizer: &mut FrameSynchronizer,
        drawable: (u32, u32),
    ) -> Result<bool>
    where
        R: SurfaceResources<Swapchain = S, Pipeline = P>,
    {
        if !is_drawable(drawable) {
            return Ok(false);
        }

        if self.needs_recreate || self.swapchain.is_none() {
            self.recreate(resources, synchronizer, drawable)?;
        }

        Ok(self.ready().is_some())
    }

    /// Rebuild the swapchain for `drawable`.
    ///
    /// Drains the device first. Image ownership is reset to the new image
    /// count. The pipeline is rebuilt only if the format changed. The stale
    /// flag is cleared only once a new swapchain is fully attached.
    pub fn recreate<R>(
        &mut self,
        resources: &mut R,
        synchronizer: &mut FrameSynchronizer,
        drawable: (u32, u32),
    ) -> Result<()>
    where
        R: SurfaceResources<Swapchain = S, Pipeline = P>,
    {
        resources.wait_idle()?;

        // The surface only takes one swapchain at a time
        self.swapchain = None;
        synchronizer.reset_images(0);

        let Some(mut swapchain) = resources.create_swapchain(drawable)? else {
            // Zero-area surface; try again once the window has a size
            return Ok(());
        };

        let format = swapchain.image_format();
        if self.pipeline.as_ref().map(R::pipeline_format) != Some(format) {
            self.pipeline = None;
            self.pipeline = Some(resources.create_pipeline(format)?);
        }

        let pipeline = self.pipeline.as_ref().context("Pipeline not initialized")?;
        resources.attach(&mut swapchain, pipeline)?;

        synchronizer.reset_images(swapchain.image_count());
        self.swapchain = Some(swapchain);
        self.needs_recreate = false;

        Ok(())
    }

    /// Drop swapchain, then pipeline. The device must be idle.
    pub fn release(&mut self) {
        self.swapchain = None;
        self.pipeline = None;
    }
}

/// Real swapchains and pipelines on a device
struct VulkanResources<'a> {
    device: &'a Arc<DeviceContext>,
    config: &'a Config,
}

impl SurfaceResources for VulkanResources<'_> {
    type Swapchain = Swapchain;
    type Pipeline = FramePipeline;

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }

    fn create_swapchain(&mut self, drawable: (u32, u32)) -> Result<Option<Swapchain>> {
        Swapchain::new(self.device.clone(), drawable, self.config.preferred_present_mode())
    }

    fn create_pipeline(&mut self, format: vk::Format) -> Result<FramePipeline> {
        FramePipeline::new(
            self.device.clone(),
            format,
            &self.config.shaders.vertex,
            &self.config.shaders.fragment,
        )
    }

    fn pipeline_format(pipeline: &FramePipeline) -> vk::Format {
        pipeline.format
    }

    fn attach(&mut self, swapchain: &mut Swapchain, pipeline: &FramePipeline) -> Result<()> {
        swapchain.create_framebuffers(pipeline.render_pass)
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct PresentationEngine {
    config: Config,
    synchronizer: FrameSynchronizer,
    frames: FrameSlots,
    state: PresentState<Swapchain, FramePipeline>,
    device: Arc<DeviceContext>,
}

impl PresentationEngine {
    /// Build everything needed to draw into `target`
    pub fn new(config: Config, target: &dyn PresentTarget) -> Result<Self> {
        log::info!("Initializing presentation engine...");

        let options = DeviceOptions {
            app_name: config.window.title.clone(),
            enable_validation: config.validation_requested(),
            require_discrete_gpu: config.graphics.require_discrete_gpu,
        };
        let device = DeviceContext::new(&options, target)?;

        let frames_in_flight = config.graphics.max_frames_in_flight;
        let mut synchronizer = FrameSynchronizer::new(frames_in_flight, 0);

        // A window that starts minimized gets its swapchain on the first
        // frame with a non-zero size
        let mut state = PresentState::default();
        let mut resources = VulkanResources {
            device: &device,
            config: &config,
        };
        state.recreate(&mut resources, &mut synchronizer, target.drawable_size())?;

        // Last fallible step; FrameSlots has no Drop of its own
        let frames = FrameSlots::new(&device, frames_in_flight)?;

        log::info!(
            "Presentation engine ready ({} frames in flight)",
            frames_in_flight
        );

        Ok(Self {
            config,
            synchronizer,
            frames,
            state,
            device,
        })
    }

    /// Draw and present one frame.
    ///
    /// Returns `Ok(false)` when nothing was presented: the window is
    /// minimized, or acquisition found the swapchain out of date (it will be
    /// rebuilt on the next call).
    pub fn render_frame(&mut self, target: &dyn PresentTarget) -> Result<bool> {
        let mut resources = VulkanResources {
            device: &self.device,
            config: &self.config,
        };
        if !self
            .state
            .prepare(&mut resources, &mut self.synchronizer, target.drawable_size())?
        {
            return Ok(false);
        }

        let Some((swapchain, pipeline)) = self.state.ready() else {
            return Ok(false);
        };

        let mut timeline = VulkanFrames {
            device: &self.device,
            frames: &self.frames,
            swapchain,
            pipeline,
            clear_color: self.config.graphics.clear_color,
        };

        let outcome = self.synchronizer.draw_frame(&mut timeline)?;
        if outcome.needs_recreate() {
            log::debug!("Swapchain recreation requested ({:?})", outcome);
            self.state.request_recreate();
        }

        Ok(outcome.presented())
    }

    /// Rebuild the swapchain for the target's current size now
    pub fn recreate_swapchain(&mut self, target: &dyn PresentTarget) -> Result<()> {
        let mut resources = VulkanResources {
            device: &self.device,
            config: &self.config,
        };
        self.state
            .recreate(&mut resources, &mut self.synchronizer, target.drawable_size())
    }

    /// Mark the swapchain stale, e.g. after a window resize
    pub fn request_resize(&mut self) {
        self.state.request_recreate();
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.state.swapchain()
    }

    pub fn current_frame(&self) -> usize {
        self.synchronizer.current_frame()
    }
}

impl Drop for PresentationEngine {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before destroying anything
        if let Err(e) = self.device.wait_idle() {
            log::warn!("wait_idle failed during shutdown: {:#}", e);
        }

        self.frames.destroy(&self.device.device);
        self.state.release();

        // DeviceContext goes with the last Arc
    }
}

// =============================================================================
// GPU TIMELINE
// =============================================================================

/// The real Vulkan side of one frame, borrowed from the engine
struct VulkanFrames<'a> {
    device: &'a DeviceContext,
    frames: &'a FrameSlots,
    swapchain: &'a Swapchain,
    pipeline: &'a FramePipeline,
    clear_color: [f32; 4],
}

impl VulkanFrames<'_> {
    fn render_finished(&self, image: u32) -> Result<vk::Semaphore> {
        let semaphore = self
            .swapchain
            .render_finished
            .get(image as usize)
            .ok_or(EngineError::SwapchainOutOfDate)?;
        Ok(*semaphore)
    }
}

impl FrameTimeline for VulkanFrames<'_> {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames.get(slot).in_flight_fence;
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("Failed to wait for frame fence")?;
        Ok(())
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames.get(slot).in_flight_fence;
        unsafe { self.device.device.reset_fences(&[fence]) }.context("Failed to reset frame fence")?;
        Ok(())
    }

    fn acquire(&mut self, slot: usize) -> Result<Acquired> {
        self.swapchain.acquire_next_image(self.frames.get(slot).image_available)
    }

    fn record(&mut self, slot: usize, image: u32) -> Result<()> {
        let framebuffer = *self
            .swapchain
            .framebuffers
            .get(image as usize)
            .ok_or(EngineError::SwapchainOutOfDate)?;

        self.pipeline.record(
            self.frames.get(slot).command_buffer,
            framebuffer,
            self.swapchain.extent,
            self.clear_color,
        )?;
        Ok(())
    }

    fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
        let frame = self.frames.get(slot);

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [self.render_finished(image)?];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores) // Wait for image to be available
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight_fence, // Signal this fence when GPU is done
            )
        }
        .context("Failed to submit draw command buffer")?;

        Ok(())
    }

    fn present(&mut self, _slot: usize, image: u32) -> Result<Presented> {
        let wait_semaphore = self.render_finished(image)?;
        self.swapchain.present(self.device.present_queue, image, wait_semaphore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeSwapchain {
        format: vk::Format,
        images: usize,
        attached_to: Option<u32>,
    }

    impl PresentImages for FakeSwapchain {
        fn image_format(&self) -> vk::Format {
            self.format
        }

        fn image_count(&self) -> usize {
            self.images
        }
    }

    struct FakePipeline {
        id: u32,
        format: vk::Format,
    }

    /// Hands out scripted swapchains and counts pipeline builds
    #[derive(Default)]
    struct FakeSurface {
        calls: Vec<String>,
        /// `None` entries model a zero-area surface
        swapchains: VecDeque<Option<(vk::Format, usize)>>,
        pipelines_built: u32,
        fail_pipeline: bool,
    }

    impl SurfaceResources for FakeSurface {
        type Swapchain = FakeSwapchain;
        type Pipeline = FakePipeline;

        fn wait_idle(&mut self) -> Result<()> {
            self.calls.push("wait_idle".to_string());
            Ok(())
        }

        fn create_swapchain(&mut self, drawable: (u32, u32)) -> Result<Option<FakeSwapchain>> {
            self.calls.push(format!("swapchain {}x{}", drawable.0, drawable.1));
            let next = self.swapchains.pop_front().flatten();
            Ok(next.map(|(format, images)| FakeSwapchain {
                format,
                images,
                attached_to: None,
            }))
        }

        fn create_pipeline(&mut self, format: vk::Format) -> Result<FakePipeline> {
            self.calls.push(format!("pipeline {:?}", format));
            if self.fail_pipeline {
                return Err(EngineError::creation("graphics pipeline")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).into());
            }
            self.pipelines_built += 1;
            Ok(FakePipeline {
                id: self.pipelines_built,
                format,
            })
        }

        fn pipeline_format(pipeline: &FakePipeline) -> vk::Format {
            pipeline.format
        }

        fn attach(&mut self, swapchain: &mut FakeSwapchain, pipeline: &FakePipeline) -> Result<()> {
            swapchain.attached_to = Some(pipeline.id);
            Ok(())
        }
    }

    const SRGB: vk::Format = vk::Format::B8G8R8A8_SRGB;
    const UNORM: vk::Format = vk::Format::B8G8R8A8_UNORM;

    fn surface(swapchains: &[Option<(vk::Format, usize)>]) -> FakeSurface {
        FakeSurface {
            swapchains: swapchains.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn drawable_needs_both_dimensions() {
        assert!(is_drawable((800, 600)));
        assert!(!is_drawable((0, 600)));
        assert!(!is_drawable((800, 0)));
        assert!(!is_drawable((0, 0)));
    }

    #[test]
    fn first_frame_builds_everything() {
        let mut gpu = surface(&[Some((SRGB, 3))]);
        let mut sync = FrameSynchronizer::new(2, 0);
        let mut state = PresentState::default();

        assert!(state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap());

        assert_eq!(gpu.calls, vec!["wait_idle", "swapchain 800x600", "pipeline B8G8R8A8_SRGB"]);
        let (swapchain, pipeline) = state.ready().unwrap();
        assert_eq!(swapchain.attached_to, Some(pipeline.id));
        assert_eq!(sync.tracked_images(), 3);
        assert!(!state.needs_recreate());
    }

    #[test]
    fn zero_area_drawable_touches_nothing() {
        let mut gpu = surface(&[Some((SRGB, 3))]);
        let mut sync = FrameSynchronizer::new(2, 0);
        let mut state = PresentState::default();
        state.request_recreate();

        assert!(!state.prepare(&mut gpu, &mut sync, (0, 600)).unwrap());

        assert!(gpu.calls.is_empty());
        assert!(state.needs_recreate());
    }

    #[test]
    fn fresh_swapchain_is_not_rebuilt() {
        let mut gpu = surface(&[Some((SRGB, 3))]);
        let mut sync = FrameSynchronizer::new(2, 0);
        let mut state = PresentState::default();

        state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap();
        let calls = gpu.calls.len();
        assert!(state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap());

        assert_eq!(gpu.calls.len(), calls);
    }

    #[test]
    fn resize_keeps_pipeline_and_retracks_images() {
        let mut gpu = surface(&[Some((SRGB, 3)), Some((SRGB, 4))]);
        let mut sync = FrameSynchronizer::new(2, 0);
        let mut state = PresentState::default();
        state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap();

        state.request_recreate();
        assert!(state.prepare(&mut gpu, &mut sync, (1024, 768)).unwrap());

        assert_eq!(gpu.pipelines_built, 1);
        assert_eq!(sync.tracked_images(), 4);
        assert!(!state.needs_recreate());
        let (swapchain, pipeline) = state.ready().unwrap();
        assert_eq!(swapchain.images, 4);
        assert_eq!(swapchain.attached_to, Some(pipeline.id));
    }

    #[test]
    fn format_change_rebuilds_pipeline() {
        let mut gpu = surface(&[Some((SRGB, 3)), Some((UNORM, 3))]);
        let mut sync = FrameSynchronizer::new(2, 0);
        let mut state = PresentState::default();
        state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap();

        state.request_recreate();
        state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap();

        assert_eq!(gpu.pipelines_built, 2);
        let (swapchain, pipeline) = state.ready().unwrap();
        assert_eq!(pipeline.format, UNORM);
        assert_eq!(swapchain.attached_to, Some(2));
    }

    #[test]
    fn failed_rebuild_stays_stale() {
        let mut gpu = surface(&[Some((SRGB, 3)), Some((UNORM, 3)), Some((UNORM, 3))]);
        let mut sync = FrameSynchronizer::new(2, 0);
        let mut state = PresentState::default();
        state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap();

        gpu.fail_pipeline = true;
        state.request_recreate();
        assert!(state.prepare(&mut gpu, &mut sync, (800, 600)).is_err());

        assert!(state.needs_recreate());
        assert!(state.ready().is_none());
        assert_eq!(sync.tracked_images(), 0);

        // Next frame retries and succeeds
        gpu.fail_pipeline = false;
        assert!(state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap());
        assert!(!state.needs_recreate());
        assert_eq!(sync.tracked_images(), 3);
    }

    #[test]
    fn zero_area_surface_is_retried() {
        let mut gpu = surface(&[None, Some((SRGB, 2))]);
        let mut sync = FrameSynchronizer::new(2, 0);
        let mut state = PresentState::default();

        assert!(!state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap());
        assert!(state.swapchain().is_none());
        assert!(state.pipeline().is_none());

        assert!(state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap());
        assert_eq!(sync.tracked_images(), 2);
    }

    #[test]
    fn device_drained_before_old_swapchain_goes() {
        let mut gpu = surface(&[Some((SRGB, 3)), Some((SRGB, 3))]);
        let mut sync = FrameSynchronizer::new(2, 0);
        let mut state = PresentState::default();
        state.prepare(&mut gpu, &mut sync, (800, 600)).unwrap();
        gpu.calls.clear();

        state.request_recreate();
        state.prepare(&mut gpu, &mut sync, (640, 480)).unwrap();

        assert_eq!(gpu.calls, vec!["wait_idle", "swapchain 640x480"]);
    }
}

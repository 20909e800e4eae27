// Swapchain - Window presentation
//
// Owns the chain of presentable images and everything sized by it:
// one view, one framebuffer and one render-finished semaphore per image.
// These four lists always have the same length and index correspondence.

use anyhow::{Context, Result};
use ash::extensions::khr::Surface;
use ash::vk;
use std::sync::Arc;

use super::device::{DeviceContext, QueueFamilyIndices};
use super::sync::{Acquired, Presented};
use crate::error::EngineError;

/// What a surface supports for a given physical device
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(
        surface_loader: &Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                formats: surface_loader.get_physical_device_surface_formats(physical_device, surface)?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            })
        }
    }

    /// At least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Prefer 8-bit BGRA sRGB, otherwise whatever the driver lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use `preferred` when available; FIFO is always supported
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// A defined `current_extent` wins. `u32::MAX` means the window decides,
/// clamped into the surface's supported range.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, drawable: (u32, u32)) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    // Not `clamp`: a driver reporting min > max must not panic the loop
    let (width, height) = drawable;
    let (min, max) = (capabilities.min_image_extent, capabilities.max_image_extent);
    vk::Extent2D {
        width: width.max(min.width).min(max.width),
        height: height.max(min.height).min(max.height),
    }
}

/// One more than the minimum, capped by a nonzero maximum (0 = unbounded)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        image_count
    }
}

/// Concurrent sharing only when graphics and present families differ
pub fn choose_sharing(families: &QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    match families.pair() {
        Some((graphics, present)) if graphics != present => {
            (vk::SharingMode::CONCURRENT, vec![graphics, present])
        }
        _ => (vk::SharingMode::EXCLUSIVE, Vec::new()),
    }
}

/// Create one `T` per source item. If any creation fails, everything created
/// so far is handed to `destroy` (newest first) before the error is returned.
pub fn create_per_image<S, T, C, D>(sources: &[S], mut create: C, mut destroy: D) -> Result<Vec<T>>
where
    C: FnMut(usize, &S) -> Result<T>,
    D: FnMut(T),
{
    let mut created = Vec::with_capacity(sources.len());

    for (index, source) in sources.iter().enumerate() {
        match create(index, source) {
            Ok(item) => created.push(item),
            Err(e) => {
                while let Some(item) = created.pop() {
                    destroy(item);
                }
                return Err(e);
            }
        }
    }

    Ok(created)
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    /// Signaled by the submission that rendered into the image, waited on by present
    pub render_finished: Vec<vk::Semaphore>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    device: Arc<DeviceContext>,
}

impl Swapchain {
    /// Build a swapchain for the surface's current capabilities.
    ///
    /// Returns `Ok(None)` when the resulting extent has zero area (minimized
    /// window). Framebuffers are attached afterwards with
    /// [`Swapchain::create_framebuffers`] once the render pass matches `format`.
    pub fn new(
        device: Arc<DeviceContext>,
        drawable: (u32, u32),
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Option<Self>> {
        let support =
            SwapchainSupport::query(device.surface_loader(), device.physical_device, device.surface())?;

        let extent = choose_extent(&support.capabilities, drawable);
        if extent.width == 0 || extent.height == 0 {
            log::debug!("Surface has zero area, skipping swapchain creation");
            return Ok(None);
        }

        let format = choose_surface_format(&support.formats).context("No suitable surface format")?;
        let present_mode = choose_present_mode(&support.present_modes, preferred_present_mode);
        let image_count = choose_image_count(&support.capabilities);
        let (sharing_mode, family_indices) = choose_sharing(&device.queue_families());

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}, {} images requested",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let handle = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(EngineError::creation("swapchain"))?;

        // From here on Drop cleans up whatever has been attached
        let mut swapchain = Self {
            swapchain: handle,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            render_finished: Vec::new(),
            format,
            present_mode,
            extent,
            device,
        };

        swapchain.images = unsafe { swapchain.device.swapchain_loader.get_swapchain_images(handle) }
            .map_err(EngineError::creation("swapchain images"))?;
        log::info!("Swapchain images count: {}", swapchain.images.len());

        swapchain.image_views = swapchain.create_image_views()?;
        swapchain.render_finished = swapchain.create_semaphores()?;

        Ok(Some(swapchain))
    }

    fn create_image_views(&self) -> Result<Vec<vk::ImageView>> {
        let device = &self.device.device;
        let format = self.format.format;

        create_per_image(
            &self.images,
            |_, &image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                Ok(unsafe { device.create_image_view(&create_info, None) }
                    .map_err(EngineError::creation("image view"))?)
            },
            |view| unsafe { device.destroy_image_view(view, None) },
        )
    }

    fn create_semaphores(&self) -> Result<Vec<vk::Semaphore>> {
        let device = &self.device.device;
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        create_per_image(
            &self.images,
            |_, _| {
                Ok(unsafe { device.create_semaphore(&semaphore_info, None) }
                    .map_err(EngineError::creation("render-finished semaphore"))?)
            },
            |semaphore| unsafe { device.destroy_semaphore(semaphore, None) },
        )
    }

    /// Create one framebuffer per image view, bound to `render_pass`
    pub fn create_framebuffers(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        let device = &self.device.device;
        let extent = self.extent;

        let framebuffers = create_per_image(
            &self.image_views,
            |_, &view| {
                let attachments = [view];
                let framebuffer_info = vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);

                Ok(unsafe { device.create_framebuffer(&framebuffer_info, None) }
                    .map_err(EngineError::creation("framebuffer"))?)
            },
            |framebuffer| unsafe { device.destroy_framebuffer(framebuffer, None) },
        )?;

        self.destroy_framebuffers();
        self.framebuffers = framebuffers;
        Ok(())
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image, signaling `semaphore` once it can be rendered to
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Acquired> {
        let result = unsafe {
            self.device.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
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

    /// Present `image_index` once `wait_semaphore` is signaled
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<Presented> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.device.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(Presented::Optimal),
            Ok(true) => Ok(Presented::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        unsafe {
            let device = &self.device.device;
            for &semaphore in &self.render_finished {
                device.destroy_semaphore(semaphore, None);
            }
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            self.device.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn format_prefers_bgra_srgb() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let selected = choose_surface_format(&formats).unwrap();
        assert_eq!(selected.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(selected.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn format_needs_matching_color_space() {
        let formats = [
            surface_format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT),
        ];
        let selected = choose_surface_format(&formats).unwrap();
        assert_eq!(selected.format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn format_falls_back_to_first_entry() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::B8G8R8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_prefers_mailbox() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        // Even an empty list resolves to FIFO
        assert_eq!(choose_present_mode(&[], vk::PresentModeKHR::MAILBOX), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_uses_defined_current_extent() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 1920, height: 1080 },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        };
        let extent = choose_extent(&caps, (800, 600));
        assert_eq!((extent.width, extent.height), (1920, 1080));
    }

    #[test]
    fn extent_clamps_drawable_size_on_sentinel() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 100, height: 200 },
            max_image_extent: vk::Extent2D { width: 2000, height: 1000 },
            ..Default::default()
        };

        let extent = choose_extent(&caps, (3000, 50));
        assert_eq!((extent.width, extent.height), (2000, 200));

        let extent = choose_extent(&caps, (50, 3000));
        assert_eq!((extent.width, extent.height), (100, 1000));

        let extent = choose_extent(&caps, (800, 600));
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn extent_survives_inverted_limits() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 900, height: 700 },
            max_image_extent: vk::Extent2D { width: 800, height: 600 },
            ..Default::default()
        };

        let extent = choose_extent(&caps, (1024, 768));
        assert_eq!((extent.width, extent.height), (800, 600));

        let extent = choose_extent(&caps, (10, 10));
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn image_count_unbounded_max() {
        assert_eq!(choose_image_count(&capabilities(2, 0)), 3);
    }

    #[test]
    fn image_count_clamped_to_max() {
        assert_eq!(choose_image_count(&capabilities(2, 2)), 2);
        assert_eq!(choose_image_count(&capabilities(2, 8)), 3);
        assert_eq!(choose_image_count(&capabilities(3, 3)), 3);
    }

    #[test]
    fn sharing_mode_follows_queue_families() {
        let same = QueueFamilyIndices { graphics: Some(0), present: Some(0) };
        assert_eq!(choose_sharing(&same), (vk::SharingMode::EXCLUSIVE, vec![]));

        let split = QueueFamilyIndices { graphics: Some(0), present: Some(2) };
        assert_eq!(choose_sharing(&split), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }

    #[test]
    fn adequate_support_needs_format_and_mode() {
        let mut support = SwapchainSupport {
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
            ..Default::default()
        };
        assert!(support.is_adequate());

        support.present_modes.clear();
        assert!(!support.is_adequate());

        support.present_modes.push(vk::PresentModeKHR::FIFO);
        support.formats.clear();
        assert!(!support.is_adequate());
    }

    #[test]
    fn per_image_resources_match_image_count() {
        let images = [10u64, 11, 12];
        let views = create_per_image(&images, |i, &img| Ok((i, img)), |_| {}).unwrap();
        let framebuffers = create_per_image(&views, |i, _| Ok(i * 100), |_| {}).unwrap();

        assert_eq!(views.len(), images.len());
        assert_eq!(framebuffers.len(), images.len());
        assert_eq!(views[2], (2, 12));
    }

    #[test]
    fn per_image_failure_destroys_partial_results() {
        let images = [1, 2, 3, 4];
        let mut destroyed = Vec::new();

        let result: Result<Vec<i32>> = create_per_image(
            &images,
            |i, &img| {
                if i == 2 {
                    Err(EngineError::creation("framebuffer")(vk::Result::ERROR_OUT_OF_HOST_MEMORY).into())
                } else {
                    Ok(img * 10)
                }
            },
            |item| destroyed.push(item),
        );

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::ResourceCreation { what: "framebuffer", .. })
        ));
        assert_eq!(destroyed, vec![20, 10]);
    }
}

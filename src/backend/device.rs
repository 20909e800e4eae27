// Device Context - instance, surface, GPU and queues
//
// Responsibilities:
// - Instance creation (window extensions, portability, optional validation)
// - Surface creation through the presentation target
// - Physical device selection (discrete GPU by default)
// - Logical device with one queue per unique family
//
// Created once at startup and destroyed last. Everything else holds an
// `Arc<DeviceContext>`.

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr::Surface, khr::Swapchain as SwapchainLoader};
use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::surface::PresentTarget;
use super::swapchain::SwapchainSupport;
use crate::error::EngineError;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Highest API version we ask for
const TARGET_API_VERSION: u32 = vk::API_VERSION_1_2;

/// Options that drive instance and device creation
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub app_name: String,
    pub enable_validation: bool,
    pub require_discrete_gpu: bool,
}

/// Queue families used by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan families in order, keeping the first graphics-capable family and
    /// the first family that can present to the surface.
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> Result<Self>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut indices = Self::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;

            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }
            if indices.present.is_none() && supports_present(index)? {
                indices.present = Some(index);
            }
            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// (graphics, present) when both were found
    pub fn pair(&self) -> Option<(u32, u32)> {
        Some((self.graphics?, self.present?))
    }

    /// Distinct families, graphics first
    pub fn unique(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(2);
        for family in [self.graphics, self.present].into_iter().flatten() {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Score a physical device, or `None` if it can't drive the engine.
///
/// With `require_discrete` only discrete GPUs qualify. Otherwise every type
/// qualifies and discrete GPUs win.
pub fn device_score(
    device_type: vk::PhysicalDeviceType,
    queues_complete: bool,
    has_swapchain_extension: bool,
    swapchain_adequate: bool,
    require_discrete: bool,
) -> Option<u32> {
    if !queues_complete || !has_swapchain_extension || !swapchain_adequate {
        return None;
    }

    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => Some(1000),
        _ if require_discrete => None,
        vk::PhysicalDeviceType::INTEGRATED_GPU => Some(100),
        vk::PhysicalDeviceType::VIRTUAL_GPU => Some(10),
        _ => Some(1),
    }
}

/// Clamp the API version we request to what the loader supports
pub fn negotiate_api_version(loader_version: Option<u32>) -> u32 {
    let loader_version = loader_version.unwrap_or(vk::API_VERSION_1_0);
    TARGET_API_VERSION.min(loader_version)
}

/// Highest-scoring candidate, first one on ties.
///
/// A candidate whose probing failed is logged and skipped, so one broken
/// driver doesn't hide the other GPUs.
fn best_candidate<T>(candidates: impl IntoIterator<Item = (String, Result<Option<(u32, T)>>)>) -> Option<T> {
    let mut best: Option<(u32, T)> = None;

    for (name, rating) in candidates {
        match rating {
            Ok(Some((score, candidate))) => {
                log::debug!("GPU candidate {} score {}", name, score);
                if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                    best = Some((score, candidate));
                }
            }
            Ok(None) => log::debug!("GPU {} not suitable", name),
            Err(e) => log::debug!("GPU {} skipped, probing failed: {:#}", name, e),
        }
    }

    best.map(|(_, candidate)| candidate)
}

fn push_unique<'a>(list: &mut Vec<&'a CStr>, name: &'a CStr) {
    if !list.contains(&name) {
        list.push(name);
    }
}

fn extension_names(properties: &[vk::ExtensionProperties]) -> Vec<CString> {
    properties
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
        .collect()
}

fn contains_name(names: &[CString], name: &CStr) -> bool {
    names.iter().any(|n| n.as_c_str() == name)
}

/// Instance-level handles
///
/// Dropping this destroys surface, debug messenger and instance, so any
/// failure after instance creation cleans up on the way out.
pub struct VulkanInstance {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: Surface,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    pub entry: Entry,
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Vulkan device context with automatic cleanup
pub struct DeviceContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub swapchain_loader: SwapchainLoader,

    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    pub properties: vk::PhysicalDeviceProperties,

    // Dropped after `device` (see Drop)
    pub vulkan: VulkanInstance,
}

impl DeviceContext {
    /// Create the device context for `target`
    pub fn new(options: &DeviceOptions, target: &dyn PresentTarget) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", options.app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .map_err(EngineError::from)
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let (instance, validation) = Self::create_instance(&entry, options, target)?;
        let surface_loader = Surface::new(&entry, &instance);
        let mut vulkan = VulkanInstance {
            surface: vk::SurfaceKHR::null(),
            surface_loader,
            debug_utils: None,
            instance,
            entry,
        };

        // Step 3: Debug messenger
        if validation {
            vulkan.debug_utils = Some(Self::setup_debug_messenger(&vulkan.entry, &vulkan.instance)?);
        }

        // Step 4: Surface
        vulkan.surface = unsafe { target.create_surface(&vulkan.entry, &vulkan.instance)? };

        // Step 5: Pick physical device (GPU)
        let (physical_device, families) = Self::pick_physical_device(&vulkan, options.require_discrete_gpu)?;
        let (graphics_queue_family, present_queue_family) =
            families.pair().ok_or(EngineError::NoSuitableDevice)?;

        // Step 6: Create logical device
        let device = Self::create_logical_device(&vulkan.instance, physical_device, &families)?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        let properties = unsafe { vulkan.instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "Queue families: graphics={}, present={}",
            graphics_queue_family,
            present_queue_family
        );

        let swapchain_loader = SwapchainLoader::new(&vulkan.instance, &device);

        Ok(Arc::new(Self {
            device,
            physical_device,
            swapchain_loader,
            graphics_queue,
            graphics_queue_family,
            present_queue,
            present_queue_family,
            properties,
            vulkan,
        }))
    }

    fn create_instance(
        entry: &Entry,
        options: &DeviceOptions,
        target: &dyn PresentTarget,
    ) -> Result<(ash::Instance, bool)> {
        let loader_version = entry.try_enumerate_instance_version()?;
        let api_version = negotiate_api_version(loader_version);
        log::info!(
            "Vulkan API {}.{}.{}",
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            vk::api_version_patch(api_version)
        );

        let available = extension_names(&entry.enumerate_instance_extension_properties(None)?);

        // Window-system extensions are mandatory
        let required = target.required_extensions()?;
        if required.is_empty() {
            return Err(EngineError::ExtensionUnavailable(
                "window system surface extensions".to_string(),
            )
            .into());
        }

        let mut extensions: Vec<&CStr> = Vec::with_capacity(required.len() + 2);
        for name in required {
            if !contains_name(&available, name) {
                return Err(EngineError::ExtensionUnavailable(name.to_string_lossy().into_owned()).into());
            }
            push_unique(&mut extensions, name);
        }

        let mut flags = vk::InstanceCreateFlags::empty();
        let portability = vk::KhrPortabilityEnumerationFn::name();
        if contains_name(&available, portability) {
            push_unique(&mut extensions, portability);
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
            log::info!("Enabled instance extension: {}", portability.to_string_lossy());
        }

        let mut validation = false;
        if options.enable_validation {
            match Self::check_validation_layer(entry) {
                Ok(()) if contains_name(&available, DebugUtils::name()) => {
                    push_unique(&mut extensions, DebugUtils::name());
                    validation = true;
                }
                Ok(()) => {
                    log::warn!("{} missing, validation disabled", DebugUtils::name().to_string_lossy());
                }
                Err(e) => {
                    log::warn!("{}, continuing without validation", e);
                }
            }
        }

        let app_name = CString::new(options.app_name.as_str())?;
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(api_version);

        let extension_ptrs: Vec<_> = extensions.iter().map(|name| name.as_ptr()).collect();
        let layer_ptrs = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(EngineError::creation("instance"))?;

        Ok((instance, validation))
    }

    fn check_validation_layer(entry: &Entry) -> Result<(), EngineError> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(EngineError::creation("layer list"))?;

        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if found {
            Ok(())
        } else {
            Err(EngineError::LayerUnavailable(VALIDATION_LAYER.to_string_lossy().into_owned()))
        }
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(EngineError::creation("debug messenger"))?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        vulkan: &VulkanInstance,
        require_discrete: bool,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { vulkan.instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            log::error!("No Vulkan-capable GPU found");
            return Err(EngineError::NoSuitableDevice.into());
        }

        let candidates = devices.into_iter().map(|device| {
            let props = unsafe { vulkan.instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            let rating = Self::rate_device(vulkan, device, props.device_type, require_discrete)
                .map(|rated| rated.map(|(score, families)| (score, (device, families))));
            (name, rating)
        });

        best_candidate(candidates).ok_or_else(|| EngineError::NoSuitableDevice.into())
    }

    /// Score one GPU, `None` if it can't drive the surface
    fn rate_device(
        vulkan: &VulkanInstance,
        device: vk::PhysicalDevice,
        device_type: vk::PhysicalDeviceType,
        require_discrete: bool,
    ) -> Result<Option<(u32, QueueFamilyIndices)>> {
        let queue_families =
            unsafe { vulkan.instance.get_physical_device_queue_family_properties(device) };
        let families = QueueFamilyIndices::find(&queue_families, |index| unsafe {
            Ok(vulkan
                .surface_loader
                .get_physical_device_surface_support(device, index, vulkan.surface)?)
        })?;

        let extensions =
            extension_names(&unsafe { vulkan.instance.enumerate_device_extension_properties(device) }?);
        let has_swapchain = contains_name(&extensions, SwapchainLoader::name());

        let adequate = has_swapchain
            && SwapchainSupport::query(&vulkan.surface_loader, device, vulkan.surface)?.is_adequate();

        let score = device_score(
            device_type,
            families.is_complete(),
            has_swapchain,
            adequate,
            require_discrete,
        );
        Ok(score.map(|score| (score, families)))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilyIndices,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let available =
            extension_names(&unsafe { instance.enumerate_device_extension_properties(physical_device) }?);

        let mut extensions = vec![SwapchainLoader::name().as_ptr()];
        let portability_subset = vk::KhrPortabilitySubsetFn::name();
        if contains_name(&available, portability_subset) {
            extensions.push(portability_subset.as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(EngineError::creation("logical device"))?;

        Ok(device)
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.vulkan.instance
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.vulkan.surface
    }

    pub fn surface_loader(&self) -> &Surface {
        &self.vulkan.surface_loader
    }

    /// Queue family indices for swapchain sharing
    pub fn queue_families(&self) -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics: Some(self.graphics_queue_family),
            present: Some(self.present_queue_family),
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // `vulkan` (surface, messenger, instance) is dropped right after this
        unsafe {
            self.device.destroy_device(None);
        }
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
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

// Error taxonomy for the presentation engine
//
// Functions propagate `anyhow::Result`; the variants below are the failures
// callers may want to tell apart (downcast with `err.downcast_ref::<EngineError>()`).

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Failed to load the Vulkan loader library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// A required instance or device extension is missing
    #[error("Required extension not available: {0}")]
    ExtensionUnavailable(String),

    /// A requested instance layer is missing
    #[error("Required layer not available: {0}")]
    LayerUnavailable(String),

    /// No physical device satisfied the selection policy
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Creating a Vulkan object failed
    #[error("Failed to create {what}: {result:?}")]
    ResourceCreation {
        what: &'static str,
        result: vk::Result,
    },

    /// A command buffer could not be recorded
    #[error("Command buffer recording failed: {0:?}")]
    Recording(vk::Result),

    /// The swapchain no longer matches the surface
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Shader bytecode could not be read
    #[error("Failed to load shader {path:?}: {source}")]
    Shader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Closure adapter for `map_err` on Vulkan create calls
    pub fn creation(what: &'static str) -> impl Fn(vk::Result) -> EngineError {
        move |result| EngineError::ResourceCreation { what, result }
    }
}

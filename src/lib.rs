// Triangle presentation engine
//
// Draws a single triangle into a window surface through Vulkan, keeping up to
// N frames in flight and rebuilding the swapchain when the surface changes.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;

pub use config::Config;
pub use engine::PresentationEngine;
pub use error::EngineError;

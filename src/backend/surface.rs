// Presentation target - what the engine needs from a window
//
// The engine never talks to the windowing system directly. It asks for the
// drawable size, the instance extensions the platform surface needs, and a
// surface for a given instance.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::CStr;

pub trait PresentTarget {
    /// Current drawable size in pixels (may be 0x0 while minimized)
    fn drawable_size(&self) -> (u32, u32);

    /// Instance extensions required to create a surface for this target
    fn required_extensions(&self) -> Result<Vec<&'static CStr>>;

    /// Create a surface for this target on `instance`
    ///
    /// # Safety
    /// The surface must be destroyed before `instance`.
    unsafe fn create_surface(&self, entry: &Entry, instance: &ash::Instance)
        -> Result<vk::SurfaceKHR>;
}

impl PresentTarget for winit::window::Window {
    fn drawable_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }

    fn required_extensions(&self) -> Result<Vec<&'static CStr>> {
        let names = ash_window::enumerate_required_extensions(self.raw_display_handle())
            .context("Failed to query surface extensions for this display")?;

        // ash-window hands out pointers to static extension name strings
        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect())
    }

    unsafe fn create_surface(
        &self,
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        ash_window::create_surface(
            entry,
            instance,
            self.raw_display_handle(),
            self.raw_window_handle(),
            None,
        )
        .context("Failed to create window surface")
    }
}

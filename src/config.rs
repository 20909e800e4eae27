// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Missing file means defaults. A file that fails to parse or validate is
// reported and replaced by defaults as well.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Upper bound for `graphics.max_frames_in_flight`
pub const MAX_FRAMES_IN_FLIGHT_LIMIT: usize = 5;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Hello Triangle".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    pub require_discrete_gpu: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
            require_discrete_gpu: true,
        }
    }
}

/// SPIR-V locations, relative to the working directory
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/vert.spv"),
            fragment: PathBuf::from("shaders/frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "triangle.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load `config.toml` from the working directory, falling back to defaults.
    ///
    /// Logging is usually not up yet when this runs, so a file that fails to
    /// parse or validate is handed back for the caller to report once it is.
    pub fn load() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default("config.toml")
    }

    /// Like [`Config::load_from_path`], but never fails
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to load config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let frames = self.graphics.max_frames_in_flight;
        if frames == 0 || frames > MAX_FRAMES_IN_FLIGHT_LIMIT {
            return Err(EngineError::InvalidConfig(format!(
                "graphics.max_frames_in_flight must be in 1..={}, got {}",
                MAX_FRAMES_IN_FLIGHT_LIMIT, frames
            ))
            .into());
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "window size must be non-zero, got {}x{}",
                self.window.width, self.window.height
            ))
            .into());
        }
        if parse_present_mode(&self.graphics.present_mode).is_none() {
            return Err(EngineError::InvalidConfig(format!(
                "graphics.present_mode must be one of {}, got '{}'",
                PRESENT_MODES.join(", "),
                self.graphics.present_mode
            ))
            .into());
        }
        Ok(())
    }

    /// Preferred present mode as Vulkan enum
    ///
    /// The swapchain falls back to FIFO when the surface lacks it.
    pub fn preferred_present_mode(&self) -> vk::PresentModeKHR {
        parse_present_mode(&self.graphics.present_mode).unwrap_or(vk::PresentModeKHR::MAILBOX)
    }

    /// Validation is only ever enabled in debug builds
    pub fn validation_requested(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}

/// Accepted `graphics.present_mode` values
pub const PRESENT_MODES: [&str; 4] = ["mailbox", "fifo", "fifo_relaxed", "immediate"];

/// Map a config name (case-insensitive) to its present mode
pub fn parse_present_mode(name: &str) -> Option<vk::PresentModeKHR> {
    match name.to_lowercase().as_str() {
        "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
        "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
        "fifo" => Some(vk::PresentModeKHR::FIFO),
        "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/vert.spv"));
        assert_eq!(config.shaders.fragment, PathBuf::from("shaders/frag.spv"));
        assert_eq!(config.preferred_present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            max_frames_in_flight = 3
            present_mode = "FIFO"

            [shaders]
            vertex = "assets/tri.vert.spv"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.preferred_present_mode(), vk::PresentModeKHR::FIFO);
        assert!(config.graphics.require_discrete_gpu);
        assert_eq!(config.shaders.vertex, PathBuf::from("assets/tri.vert.spv"));
        assert_eq!(config.shaders.fragment, PathBuf::from("shaders/frag.spv"));
        assert_eq!(config.window.title, "Hello Triangle");
    }

    #[test]
    fn rejects_frames_in_flight_out_of_range() {
        for frames in [0, MAX_FRAMES_IN_FLIGHT_LIMIT + 1] {
            let doc = format!("[graphics]\nmax_frames_in_flight = {}\n", frames);
            let err = Config::from_toml(&doc).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<EngineError>(),
                Some(EngineError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn rejects_zero_window_size() {
        let err = Config::from_toml("[window]\nwidth = 0\n").unwrap_err();
        assert!(err.to_string().contains("window size"));
    }

    #[test]
    fn rejects_unknown_present_mode() {
        let err = Config::from_toml("[graphics]\npresent_mode = \"vsync-ish\"\n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidConfig(_))
        ));
        assert!(err.to_string().contains("vsync-ish"));
    }

    #[test]
    fn every_listed_present_mode_parses() {
        for name in PRESENT_MODES {
            assert!(parse_present_mode(name).is_some(), "{}", name);
        }
        assert_eq!(parse_present_mode("Fifo_Relaxed"), Some(vk::PresentModeKHR::FIFO_RELAXED));
    }

    #[test]
    fn invalid_file_falls_back_with_error() {
        let path = std::env::temp_dir().join("triangle-present-invalid-config.toml");
        std::fs::write(&path, "[graphics]\nmax_frames_in_flight = 9\n").unwrap();
        let (config, err) = Config::load_or_default(&path);
        std::fs::remove_file(&path).ok();

        assert_eq!(config.graphics.max_frames_in_flight, 2);
        let err = err.expect("invalid file must be reported");
        assert!(format!("{:#}", err).contains("max_frames_in_flight"));
    }

    #[test]
    fn valid_file_has_no_error() {
        let path = std::env::temp_dir().join("triangle-present-valid-config.toml");
        std::fs::write(&path, "[graphics]\nmax_frames_in_flight = 3\n").unwrap();
        let (config, err) = Config::load_or_default(&path);
        std::fs::remove_file(&path).ok();

        assert!(err.is_none());
        assert_eq!(config.graphics.max_frames_in_flight, 3);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let path = std::env::temp_dir().join("triangle-present-no-such-config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
    }

    #[test]
    fn malformed_file_reports_path() {
        let path = std::env::temp_dir().join("triangle-present-malformed-config.toml");
        std::fs::write(&path, "[graphics\nmax_frames_in_flight = ").unwrap();
        let err = Config::load_from_path(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(format!("{:#}", err).contains("triangle-present-malformed-config.toml"));
    }
}

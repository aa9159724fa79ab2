// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::{RendererConfig, ShaderStages};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub assets: AssetConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Endura".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Only honoured in debug builds
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

/// Where compiled shaders live and which entry points to use
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub shader_dir: PathBuf,
    pub shader_name: String,
    pub vertex_entry: String,
    pub fragment_entry: String,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("shaders"),
            shader_name: "triangle".to_string(),
            vertex_entry: "vertMain".to_string(),
            fragment_entry: "fragMain".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
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

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validation is forced off in release builds.
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }

    /// Startup options for the renderer
    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            app_name: self.window.title.clone(),
            enable_validation: self.validation_enabled(),
            frames_in_flight: self.graphics.max_frames_in_flight.max(1),
            clear_color: self.graphics.clear_color,
            shader: ShaderStages {
                name: self.assets.shader_name.clone(),
                vertex_entry: self.assets.vertex_entry.clone(),
                fragment_entry: self.assets.fragment_entry.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.assets.shader_name, "triangle");
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [graphics]
            max_frames_in_flight = 3

            [assets]
            shader_dir = "build/shaders"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.assets.shader_dir, PathBuf::from("build/shaders"));
        assert_eq!(config.assets.vertex_entry, "vertMain");
    }

    #[test]
    fn renderer_config_is_threaded_through() {
        let config = Config::parse(
            r#"
            [window]
            title = "Demo"

            [graphics]
            max_frames_in_flight = 0
            clear_color = [0.1, 0.2, 0.3, 1.0]

            [debug]
            validation_layers = false
            "#,
        )
        .unwrap();
        let renderer = config.renderer_config();

        assert_eq!(renderer.app_name, "Demo");
        assert_eq!(renderer.frames_in_flight, 1);
        assert_eq!(renderer.clear_color, [0.1, 0.2, 0.3, 1.0]);
        assert!(!renderer.enable_validation);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::parse("[graphics\nmax_frames_in_flight = 2").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from_path("definitely/not/here/config.toml").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
    }
}

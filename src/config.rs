// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Every field has a default, so a missing or partial file still works.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use winit::keyboard::KeyCode;

/// Environment variable that overrides the config file location
pub const CONFIG_PATH_ENV: &str = "VK_TRIANGLE_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
    pub controls: ControlsConfig,
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
            title: "Vulkan Test Program".to_string(),
            width: 300,
            height: 300,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.0, 0.0, 0.2, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            show_fps: true,
            log_level: "info".to_string(),
        }
    }
}

/// Compiled SPIR-V locations, relative to the working directory
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/triangle.vert.spv"),
            fragment: PathBuf::from("shaders/triangle.frag.spv"),
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub quit_key: String,
    pub fullscreen_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            quit_key: "Escape".to_string(),
            fullscreen_key: "F11".to_string(),
        }
    }
}

/// How the configuration was obtained.
///
/// Loading happens before the logger exists, so the outcome is reported
/// afterwards with [`LoadOutcome::log`].
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(PathBuf),
    Missing(PathBuf),
    Invalid(PathBuf, anyhow::Error),
}

impl LoadOutcome {
    pub fn log(&self, config: &Config) {
        match self {
            LoadOutcome::Loaded(path) => {
                log::info!("Loaded configuration from {:?}", path);
                log::debug!("Config: {:?}", config);
            }
            LoadOutcome::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path);
            }
            LoadOutcome::Invalid(path, e) => {
                log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e);
            }
        }
    }
}

impl Config {
    /// Load configuration from `$VK_TRIANGLE_CONFIG` or config.toml,
    /// falling back to defaults on any error
    pub fn load() -> (Self, LoadOutcome) {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        Self::load_or_default(path)
    }

    /// Load configuration from a specific path, defaults if missing or broken
    pub fn load_or_default(path: PathBuf) -> (Self, LoadOutcome) {
        match Self::load_from_path(&path) {
            Ok(Some(config)) => (config, LoadOutcome::Loaded(path)),
            Ok(None) => (Config::default(), LoadOutcome::Missing(path)),
            Err(e) => (Config::default(), LoadOutcome::Invalid(path, e)),
        }
    }

    /// Load configuration from a specific path, `None` if there is no file
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(Some(config))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Preferred present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Number of frames the CPU may record ahead of the GPU (at least 1)
    pub fn frames_in_flight(&self) -> usize {
        self.graphics.max_frames_in_flight.max(1)
    }

    /// Log level, `info` if the configured name is not recognised
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }

    pub fn quit_key(&self) -> Option<KeyCode> {
        parse_key(&self.controls.quit_key)
    }

    pub fn fullscreen_key(&self) -> Option<KeyCode> {
        parse_key(&self.controls.fullscreen_key)
    }
}

/// Map a key name from the config file to a physical key code
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let name = name.trim();
    let key = match name.to_ascii_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        _ => return parse_letter(name),
    };
    Some(key)
}

fn parse_letter(name: &str) -> Option<KeyCode> {
    let mut chars = name.chars();
    let c = chars.next()?.to_ascii_uppercase();
    if chars.next().is_some() {
        return None;
    }

    let key = match c {
        'A' => KeyCode::KeyA,
        'B' => KeyCode::KeyB,
        'C' => KeyCode::KeyC,
        'D' => KeyCode::KeyD,
        'E' => KeyCode::KeyE,
        'F' => KeyCode::KeyF,
        'G' => KeyCode::KeyG,
        'H' => KeyCode::KeyH,
        'I' => KeyCode::KeyI,
        'J' => KeyCode::KeyJ,
        'K' => KeyCode::KeyK,
        'L' => KeyCode::KeyL,
        'M' => KeyCode::KeyM,
        'N' => KeyCode::KeyN,
        'O' => KeyCode::KeyO,
        'P' => KeyCode::KeyP,
        'Q' => KeyCode::KeyQ,
        'R' => KeyCode::KeyR,
        'S' => KeyCode::KeyS,
        'T' => KeyCode::KeyT,
        'U' => KeyCode::KeyU,
        'V' => KeyCode::KeyV,
        'W' => KeyCode::KeyW,
        'X' => KeyCode::KeyX,
        'Y' => KeyCode::KeyY,
        'Z' => KeyCode::KeyZ,
        _ => return None,
    };
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config.window.title, "Vulkan Test Program");
        assert_eq!((config.window.width, config.window.height), (300, 300));
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.frames_in_flight(), 2);
        assert_eq!(
            config.shaders.vertex,
            PathBuf::from("shaders/triangle.vert.spv")
        );
        assert_eq!(config.quit_key(), Some(KeyCode::Escape));
        assert_eq!(config.fullscreen_key(), Some(KeyCode::F11));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [window]
            width = 1024

            [graphics]
            present_mode = "Mailbox"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1024);
        assert_eq!(config.window.height, 300);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.2, 1.0]);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config = Config::from_toml("[graphics]\npresent_mode = \"vsync-ish\"").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn zero_frames_in_flight_is_clamped() {
        let config = Config::from_toml("[graphics]\nmax_frames_in_flight = 0").unwrap();
        assert_eq!(config.frames_in_flight(), 1);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Config::from_toml("[window\nwidth = ").is_err());
        assert!(Config::from_toml("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = PathBuf::from("definitely/not/here/config.toml");
        assert!(Config::load_from_path(&path).unwrap().is_none());

        let (config, outcome) = Config::load_or_default(path);
        assert_eq!(config.window.width, 300);
        assert!(matches!(outcome, LoadOutcome::Missing(_)));
    }

    #[test]
    fn broken_file_is_reported_not_dropped() {
        let path = std::env::temp_dir()
            .join(format!("vk-triangle-broken-{}.toml", std::process::id()));
        std::fs::write(&path, "[window\nwidth = ").unwrap();

        let (config, outcome) = Config::load_or_default(path.clone());
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.width, 300);
        match outcome {
            LoadOutcome::Invalid(reported, e) => {
                assert_eq!(reported, path);
                assert!(format!("{:#}", e).contains("Failed to parse config file"));
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn valid_file_is_loaded() {
        let path = std::env::temp_dir()
            .join(format!("vk-triangle-valid-{}.toml", std::process::id()));
        std::fs::write(&path, "[window]\nheight = 480\n").unwrap();

        let (config, outcome) = Config::load_or_default(path.clone());
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.height, 480);
        assert!(matches!(outcome, LoadOutcome::Loaded(p) if p == path));
    }

    #[test]
    fn log_level_parsing() {
        let config = Config::from_toml("[debug]\nlog_level = \"DEBUG\"").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);

        let config = Config::from_toml("[debug]\nlog_level = \"loud\"").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn key_names() {
        assert_eq!(parse_key("Escape"), Some(KeyCode::Escape));
        assert_eq!(parse_key("esc"), Some(KeyCode::Escape));
        assert_eq!(parse_key(" F12 "), Some(KeyCode::F12));
        assert_eq!(parse_key("q"), Some(KeyCode::KeyQ));
        assert_eq!(parse_key("Z"), Some(KeyCode::KeyZ));
        assert_eq!(parse_key("F13"), None);
        assert_eq!(parse_key("Hyper"), None);
        assert_eq!(parse_key(""), None);
    }
}

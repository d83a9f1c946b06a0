//! Configuration management for QuadMap

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A 2D point in surface pixel coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point
    pub fn distance(&self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn as_tuple(&self) -> (f64, f64) {
        (self.x, self.y)
    }
}

/// Axis-aligned rectangle in surface pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle covering a whole surface of the given size
    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f64, height as f64)
    }

    /// Corners in winding order: top-left, top-right, bottom-right, bottom-left
    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x, self.y),
            Point::new(self.x + self.width, self.y),
            Point::new(self.x + self.width, self.y + self.height),
            Point::new(self.x, self.y + self.height),
        ]
    }

    /// Clamp a point into the rectangle (edges inclusive)
    pub fn clamp(&self, p: Point) -> Point {
        Point::new(
            p.x.clamp(self.x, self.x + self.width),
            p.y.clamp(self.y, self.y + self.height),
        )
    }

    /// Shrink by `margin` (fraction of the shorter side) on every edge
    pub fn inset(&self, margin: f64) -> Self {
        let m = self.width.min(self.height) * margin.clamp(0.0, 0.5);
        Self::new(
            self.x + m,
            self.y + m,
            self.width - 2.0 * m,
            self.height - 2.0 * m,
        )
    }
}

/// Display configuration for the editor window and the projector output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub title: String,
    pub editor_width: u32,
    pub editor_height: u32,
    pub projector_width: u32,
    pub projector_height: u32,
    /// Position of the borderless projector window (e.g. the second monitor)
    #[serde(default)]
    pub projector_x: i32,
    #[serde(default)]
    pub projector_y: i32,
    pub fps: u32,
    /// Fill color outside the warped footprint
    #[serde(default)]
    pub background: [u8; 3],
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            title: "QuadMap".to_string(),
            editor_width: 1200,
            editor_height: 800,
            projector_width: 1920,
            projector_height: 1080,
            projector_x: 0,
            projector_y: 0,
            fps: 60,
            background: [0, 0, 0],
        }
    }
}

/// Pointer interaction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionConfig {
    /// Pointer distance (pixels) within which a corner handle is grabbed
    pub hit_radius: f64,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self { hit_radius: 12.0 }
    }
}

/// Editor overlay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Draw quad edges and corner handles in the editor
    pub show_mesh: bool,
    /// Warp live; when off the source is letterboxed unwarped
    pub live_warp: bool,
    /// Radius of the drawn handle markers
    pub handle_radius: u32,
    /// Inset used by the reset command, as a fraction of the shorter side
    #[serde(default)]
    pub reset_margin: f64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            show_mesh: true,
            live_warp: true,
            handle_radius: 10,
            reset_margin: 0.0,
        }
    }
}

/// Media source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Images, animated GIFs or capture devices (/dev/videoN), cycled with Tab
    #[serde(default)]
    pub playlist: Vec<PathBuf>,
    pub placeholder_width: u32,
    pub placeholder_height: u32,
    pub placeholder_color: [u8; 3],
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
    /// Decoder binaries used for video files
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            playlist: Vec::new(),
            placeholder_width: 640,
            placeholder_height: 480,
            placeholder_color: [48, 48, 64],
            capture_width: 640,
            capture_height: 480,
            capture_fps: 30,
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

/// Preset storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetConfig {
    pub directory: PathBuf,
    /// Name used by the save/load keys
    pub default_name: String,
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("presets"),
            default_name: "default".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub interaction: InteractionConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub presets: PresetConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Frame interval for the render loop
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.display.fps.max(1) as f64)
    }
}

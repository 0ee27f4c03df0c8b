//! Configuration management
//!
//! Values are layered: built-in defaults, then an optional TOML file, then the
//! `APP_*` environment variables, then command-line flags (applied by the
//! binary).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::CaptureSettings;
use crate::timelapse::TimelapseSettings;

pub const ENV_PORT: &str = "APP_PORT";
pub const ENV_TIMELAPSE_INTERVAL: &str = "APP_TIMELAPSE_INT_MINS";
pub const ENV_TIMELAPSE_DIR: &str = "APP_TIMELAPSE_DIR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub timelapse: TimelapseConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Limit for reading and answering a non-streaming request
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// V4L2 device path
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Frame rate of the synthetic test pattern
    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_secs: u64,

    /// Consecutive frame timeouts tolerated before capture gives up
    #[serde(default = "default_max_frame_timeouts")]
    pub max_frame_timeouts: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            frame_timeout_secs: default_frame_timeout(),
            max_frame_timeouts: default_max_frame_timeouts(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Most consumers served from one encoded frame
    #[serde(default = "default_max_fanout")]
    pub max_fanout: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_fanout: default_max_fanout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelapseConfig {
    #[serde(default = "default_interval_mins")]
    pub interval_mins: u64,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Frame rate of the assembled video
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    #[serde(default = "default_encoder_program")]
    pub encoder_program: String,
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            interval_mins: default_interval_mins(),
            output_dir: default_output_dir(),
            framerate: default_framerate(),
            encoder_program: default_encoder_program(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout_secs: u64,

    /// Capacity of the fatal error channel
    #[serde(default = "default_error_capacity")]
    pub error_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_secs: default_graceful_timeout(),
            error_capacity: default_error_capacity(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7676
}
fn default_read_timeout() -> u64 {
    5
}
fn default_device() -> String {
    "/dev/video0".to_string()
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_fps() -> u32 {
    30
}
fn default_frame_timeout() -> u64 {
    5
}
fn default_max_frame_timeouts() -> u32 {
    10
}
fn default_jpeg_quality() -> u8 {
    75
}
fn default_max_fanout() -> usize {
    50
}
fn default_interval_mins() -> u64 {
    5
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("tl_output")
}
fn default_framerate() -> u32 {
    30
}
fn default_encoder_program() -> String {
    "ffmpeg".to_string()
}
fn default_graceful_timeout() -> u64 {
    5
}
fn default_error_capacity() -> usize {
    1000
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `APP_PORT`, `APP_TIMELAPSE_INT_MINS` and `APP_TIMELAPSE_DIR`
    /// from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(port) = set(ENV_PORT) {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("failed to parse env var {ENV_PORT} as a port: {port}")))?;
        }
        if let Some(mins) = set(ENV_TIMELAPSE_INTERVAL) {
            self.timelapse.interval_mins = mins.parse().map_err(|_| {
                ConfigError::Invalid(format!("failed to parse env var {ENV_TIMELAPSE_INTERVAL} as integer: {mins}"))
            })?;
        }
        if let Some(dir) = set(ENV_TIMELAPSE_DIR) {
            self.timelapse.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("server.read_timeout_secs must be > 0".into()));
        }

        if self.camera.frame_timeout_secs == 0 {
            return Err(ConfigError::Invalid("camera.frame_timeout_secs must be > 0".into()));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Invalid("camera width and height must be > 0".into()));
        }

        if self.camera.jpeg_quality == 0 || self.camera.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "camera.jpeg_quality must be between 1 and 100, got {}",
                self.camera.jpeg_quality
            )));
        }

        if self.broadcast.max_fanout == 0 {
            return Err(ConfigError::Invalid("broadcast.max_fanout must be > 0".into()));
        }

        if self.timelapse.interval_mins == 0 {
            return Err(ConfigError::Invalid("timelapse.interval_mins must be > 0".into()));
        }

        if self.timelapse.framerate == 0 {
            return Err(ConfigError::Invalid("timelapse.framerate must be > 0".into()));
        }

        if self.lifecycle.graceful_timeout_secs == 0 {
            return Err(ConfigError::Invalid("lifecycle.graceful_timeout_secs must be > 0".into()));
        }

        if self.lifecycle.error_capacity == 0 {
            return Err(ConfigError::Invalid("lifecycle.error_capacity must be > 0".into()));
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.read_timeout_secs)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.graceful_timeout_secs)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            frame_timeout: Duration::from_secs(self.camera.frame_timeout_secs),
            max_frame_timeouts: self.camera.max_frame_timeouts,
        }
    }

    pub fn timelapse_settings(&self) -> TimelapseSettings {
        TimelapseSettings {
            interval: Duration::from_secs(self.timelapse.interval_mins * 60),
            output_dir: self.timelapse.output_dir.clone(),
            framerate: self.timelapse.framerate,
        }
    }
}

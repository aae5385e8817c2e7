//! Pipeline configuration.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::af::AfMode;
use crate::traits::{CameraError, Format, FourCC, Result, StreamMask};

/// Default host frame-dequeue timeout (milliseconds).
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 2_000;

/// What an output stream is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Viewfinder.
    Preview,
    /// Still capture.
    Capture,
    /// Video recording.
    Record,
}

/// How scaler output reaches the application buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conversion {
    /// Scaler format equals the application format; buffers are copied as-is.
    Direct,
    /// Scaler output is software-converted into `target`.
    Indirect {
        /// Application buffer pixel format.
        target: FourCC,
    },
}

/// One application-visible output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream id (0..32), used in request output masks.
    pub id: u8,
    /// Role of the stream.
    pub kind: StreamKind,
    /// Scaler output format.
    pub format: Format,
    /// Scaler buffer count.
    pub buffer_count: u32,
    /// Delivery path into application buffers.
    pub conversion: Conversion,
}

impl StreamConfig {
    /// Format of the buffers handed to the application.
    #[must_use]
    pub fn app_format(&self) -> Format {
        match self.conversion {
            Conversion::Direct => self.format.clone().normalized(),
            Conversion::Indirect { target } => {
                Format::new(self.format.width, self.format.height, target)
            }
        }
    }
}

/// Tunables for the whole pipeline.
///
/// # Example
/// ```rust
/// use cam_pipeline::config::PipelineConfig;
///
/// let config = PipelineConfig::default();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Raw sensor output format.
    pub sensor_format: Format,
    /// ISP input format.
    pub isp_format: Format,
    /// Output streams.
    pub streams: Vec<StreamConfig>,
    /// AF mode programmed at startup.
    pub af_mode: AfMode,
    /// Host frame-dequeue timeout in milliseconds.
    pub frame_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sensor_format: Format::new(1920, 1080, FourCC::BA10),
            isp_format: Format::new(1920, 1080, FourCC::BA10),
            streams: vec![
                StreamConfig {
                    id: 0,
                    kind: StreamKind::Preview,
                    format: Format::new(640, 480, FourCC::YUYV),
                    buffer_count: 4,
                    conversion: Conversion::Direct,
                },
                StreamConfig {
                    id: 1,
                    kind: StreamKind::Capture,
                    format: Format::new(640, 480, FourCC::YUYV),
                    buffer_count: 2,
                    conversion: Conversion::Indirect {
                        target: FourCC::RGB3,
                    },
                },
            ],
            af_mode: AfMode::Auto,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
        }
    }
}

impl PipelineConfig {
    /// Parse a JSON configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse a JSON configuration string.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| CameraError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(CameraError::Config("no output streams".to_owned()));
        }
        let mut ids = HashSet::new();
        for stream in &self.streams {
            if stream.id >= 32 {
                return Err(CameraError::Config(format!(
                    "stream id {} out of range",
                    stream.id
                )));
            }
            if !ids.insert(stream.id) {
                return Err(CameraError::Config(format!(
                    "duplicate stream id {}",
                    stream.id
                )));
            }
            if stream.buffer_count == 0 {
                return Err(CameraError::Config(format!(
                    "stream {} has no buffers",
                    stream.id
                )));
            }
            if stream.format.width == 0 || stream.format.height == 0 {
                return Err(CameraError::Config(format!(
                    "stream {} has an empty format",
                    stream.id
                )));
            }
            if let Conversion::Indirect { target } = stream.conversion {
                if target == stream.format.fourcc {
                    return Err(CameraError::Config(format!(
                        "stream {} converts {target} into itself",
                        stream.id
                    )));
                }
            }
        }
        if self.sensor_format.width == 0 || self.sensor_format.height == 0 {
            return Err(CameraError::Config("empty sensor format".to_owned()));
        }
        Ok(())
    }

    /// Mask of all configured stream ids.
    #[must_use]
    pub fn stream_mask(&self) -> StreamMask {
        self.streams.iter().map(|s| s.id).collect()
    }

    /// Look up a stream by id.
    #[must_use]
    pub fn stream(&self, id: u8) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.id == id)
    }

    /// Host frame-dequeue timeout.
    #[must_use]
    pub const fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

//! Core traits and types shared by the pipeline stages and their hardware collaborators.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::af::{AfHwState, AfMode, AfServiceState, AfTrigger};

/// Pixel format representation (e.g., YUYV, RGB3, BA10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// 10-bit GRBG Bayer, one sample per 16-bit container.
    pub const BA10: Self = Self::new(b"BA10");

    /// Bytes used per pixel in a single-plane buffer of this format.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u32 {
        match &self.0 {
            b"RGB3" => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl TryFrom<String> for FourCC {
    type Error = CameraError;

    fn try_from(value: String) -> Result<Self> {
        let bytes: [u8; 4] = value
            .as_bytes()
            .try_into()
            .map_err(|_| CameraError::Config(format!("fourcc must be 4 characters: {value:?}")))?;
        Ok(Self(bytes))
    }
}

impl From<FourCC> for String {
    fn from(fourcc: FourCC) -> Self {
        fourcc.to_string()
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride). Zero means "derive from width".
    #[serde(default)]
    pub stride: u32,
    /// Total frame size in bytes. Zero means "derive from stride".
    #[serde(default)]
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = width * fourcc.bytes_per_pixel();
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }

    /// Fill in stride and size when they were left at zero.
    #[must_use]
    pub const fn normalized(self) -> Self {
        if self.stride != 0 && self.size != 0 {
            return self;
        }
        Self::new(self.width, self.height, self.fourcc)
    }
}

/// Set of output streams, one bit per stream id (ids 0..32).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamMask(pub u32);

impl StreamMask {
    /// No streams.
    pub const EMPTY: Self = Self(0);

    /// Mask containing a single stream id.
    #[must_use]
    pub const fn single(id: u8) -> Self {
        if id < 32 {
            Self(1 << id)
        } else {
            Self::EMPTY
        }
    }

    /// Whether `id` is part of the mask.
    #[must_use]
    pub const fn contains(self, id: u8) -> bool {
        id < 32 && self.0 & (1 << id) != 0
    }

    /// Add `id` to the mask.
    pub fn insert(&mut self, id: u8) {
        self.0 |= Self::single(id).0;
    }

    /// Remove `id` from the mask.
    pub fn remove(&mut self, id: u8) {
        self.0 &= !Self::single(id).0;
    }

    /// Streams present in both masks.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Number of streams in the mask.
    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the mask is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate over stream ids in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0u8..32).filter(move |id| self.contains(*id))
    }
}

impl FromIterator<u8> for StreamMask {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for id in iter {
            mask.insert(id);
        }
        mask
    }
}

/// Auto-exposure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AeMode {
    /// Manual exposure from the request.
    Off,
    /// Automatic exposure.
    #[default]
    On,
    /// Automatic exposure with auto flash.
    OnAutoFlash,
    /// Automatic exposure, flash always fires.
    OnAlwaysFlash,
}

/// Auto-white-balance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AwbMode {
    /// Manual white balance.
    Off,
    /// Automatic white balance.
    #[default]
    Auto,
    /// Incandescent preset.
    Incandescent,
    /// Fluorescent preset.
    Fluorescent,
    /// Daylight preset.
    Daylight,
    /// Cloudy daylight preset.
    Cloudy,
}

/// Overall 3A control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AaMode {
    /// 3A disabled, all settings manual.
    Off,
    /// Per-algorithm modes apply.
    #[default]
    Auto,
    /// Scene mode drives 3A.
    SceneMode,
}

/// Control parameters decoded from an application request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlSettings {
    /// Exposure time for manual exposure.
    pub exposure_time: Option<Duration>,
    /// Sensor sensitivity (ISO).
    pub sensitivity: Option<u32>,
    /// Auto-exposure mode.
    pub ae_mode: AeMode,
    /// Auto-white-balance mode.
    pub awb_mode: AwbMode,
    /// Exposure compensation in steps.
    pub ae_compensation: i32,
    /// Overall 3A mode.
    pub aa_mode: AaMode,
    /// Autofocus mode requested by this capture, if any.
    pub af_mode: Option<AfMode>,
}

/// An application capture request.
///
/// The pipeline takes ownership on submission and hands the same value back
/// inside [`CompletedFrame`] once the frame is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureRequest {
    /// Opaque caller tag, returned untouched.
    pub tag: u64,
    /// Capture controls.
    pub controls: ControlSettings,
    /// Output streams that must receive this frame.
    pub output_streams: StreamMask,
}

impl CaptureRequest {
    /// Create a request targeting the given output streams with default controls.
    #[must_use]
    pub fn new(tag: u64, output_streams: StreamMask) -> Self {
        Self {
            tag,
            controls: ControlSettings::default(),
            output_streams,
        }
    }

    /// Replace the request controls.
    #[must_use]
    pub fn with_controls(mut self, controls: ControlSettings) -> Self {
        self.controls = controls;
        self
    }
}

/// Per-frame control block sent to the sensor and ISP together with a raw buffer.
///
/// Mode fields are `None` when the value equals the one last sent to hardware.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Shot {
    /// Correlation id of the bound request; `None` for a bubble.
    pub frame_count: Option<u32>,
    /// Exposure time.
    pub exposure_time: Option<Duration>,
    /// Sensitivity (ISO).
    pub sensitivity: Option<u32>,
    /// Auto-exposure mode change.
    pub ae_mode: Option<AeMode>,
    /// Auto-white-balance mode change.
    pub awb_mode: Option<AwbMode>,
    /// Exposure compensation change.
    pub ae_compensation: Option<i32>,
    /// 3A mode change.
    pub aa_mode: Option<AaMode>,
    /// Autofocus mode change.
    pub af_mode: Option<AfMode>,
    /// Autofocus trigger command.
    pub af_trigger: AfTrigger,
    /// Scaler outputs to produce from this frame.
    pub output_streams: StreamMask,
}

impl Shot {
    /// A shot with no bound request.
    #[must_use]
    pub fn bubble() -> Self {
        Self::default()
    }

    /// Whether this shot carries no request.
    #[must_use]
    pub const fn is_bubble(&self) -> bool {
        self.frame_count.is_none()
    }
}

/// Metadata reported by hardware for one completed frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DynamicMetadata {
    /// Frame count echoed by hardware.
    pub frame_count: Option<u32>,
    /// Exposure time actually used.
    pub exposure_time: Option<Duration>,
    /// Sensitivity actually used.
    pub sensitivity: Option<u32>,
    /// Hardware autofocus state for this frame.
    pub af_state: AfHwState,
}

impl DynamicMetadata {
    /// Merge hardware-reported fields over `self`, keeping fields absent from `other`.
    pub fn merge(&mut self, other: &Self) {
        if other.frame_count.is_some() {
            self.frame_count = other.frame_count;
        }
        if other.exposure_time.is_some() {
            self.exposure_time = other.exposure_time;
        }
        if other.sensitivity.is_some() {
            self.sensitivity = other.sensitivity;
        }
        self.af_state = other.af_state;
    }
}

/// A buffer returned by a blocking dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dequeued {
    /// Buffer index within the node's buffer set.
    pub index: usize,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Hardware-reported metadata, when the node carries any.
    pub metadata: Option<DynamicMetadata>,
}

/// Application-visible result metadata for one completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameResult {
    /// Frame count assigned at registration.
    pub frame_count: u32,
    /// Sensor timestamp, written once when the raw frame completed.
    pub timestamp: Option<Duration>,
    /// Merged hardware metadata.
    pub metadata: DynamicMetadata,
    /// Streams that received a buffer.
    pub delivered_streams: StreamMask,
    /// Streams that failed to produce a buffer.
    pub failed_streams: StreamMask,
}

/// A completed capture: the caller's request plus its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    /// The request as originally submitted.
    pub request: CaptureRequest,
    /// Result metadata.
    pub result: FrameResult,
}

/// Handle to an application-owned graphics buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Small integer taxonomy reported across the host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation succeeded.
    Success = 0,
    /// Request table has no free slot.
    QueueFull = 1,
    /// No buffer was available.
    NoBuffer = 2,
    /// A hardware operation failed.
    HardwareOpFailed = 3,
}

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Failed to open or configure a device at startup.
    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// The request table has no free slot.
    #[error("request queue is full")]
    QueueFull,
    /// No buffer available for the given stream.
    #[error("no buffer available for stream {stream}")]
    NoBuffer {
        /// Stream id that ran dry.
        stream: u8,
    },
    /// A single hardware operation failed.
    #[error("{node}: {op} failed: {reason}")]
    HardwareOp {
        /// Node name.
        node: String,
        /// Operation name.
        op: &'static str,
        /// Driver-reported reason.
        reason: String,
    },
    /// A buffer index did not match the expected ring head or slot state.
    #[error("{transition}: expected buffer {expected:?}, got {actual}")]
    BufferOrder {
        /// Lifecycle transition that was attempted.
        transition: &'static str,
        /// Expected ring head, if the ring had a buffer in the prior state.
        expected: Option<usize>,
        /// Index supplied by the caller.
        actual: usize,
    },
    /// A request slot was asked to make an illegal lifecycle transition.
    #[error("request slot {slot}: illegal transition {detail}")]
    InvalidTransition {
        /// Slot index, if one was addressed.
        slot: usize,
        /// What was attempted.
        detail: String,
    },
    /// A worker thread could not be spawned.
    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        /// Thread name.
        name: String,
        /// Spawn failure.
        source: std::io::Error,
    },
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Captured output or pipeline bookkeeping failed a consistency check.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// The pipeline has been released.
    #[error("pipeline released")]
    Released,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Shorthand for a failed hardware operation.
    pub fn hardware<R: ToString>(node: &str, op: &'static str, reason: R) -> Self {
        Self::HardwareOp {
            node: node.to_owned(),
            op,
            reason: reason.to_string(),
        }
    }

    /// Integer code for the host boundary.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::QueueFull => ErrorCode::QueueFull,
            Self::NoBuffer { .. } => ErrorCode::NoBuffer,
            _ => ErrorCode::HardwareOpFailed,
        }
    }

    /// Whether the operation may succeed when retried.
    pub const fn retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull | Self::NoBuffer { .. } | Self::HardwareOp { .. } | Self::Timeout
        )
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// A V4L2-style video node with indexed buffer exchange.
///
/// `dequeue` blocks until hardware completes a buffer or fails.
pub trait VideoNode: Send {
    /// Node name used in logs and errors.
    fn name(&self) -> &str;

    /// Set the buffer format. Returns the format accepted by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Allocate `count` buffers. Returns the number actually allocated.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Hand buffer `index` to hardware, with its per-frame controls if any.
    fn queue(&mut self, index: usize, shot: Option<&Shot>) -> Result<()>;

    /// Wait for the next completed buffer.
    fn dequeue(&mut self) -> Result<Dequeued>;

    /// Start streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// Stop streaming and return all buffers to the host.
    fn stream_off(&mut self) -> Result<()>;

    /// CPU view of buffer `index`, when the node exposes mapped planes.
    fn buffer(&self, index: usize) -> Option<&[u8]>;
}

/// Application-side buffer exchange (gralloc/window style).
pub trait GraphicBufferQueue: Send {
    /// Take a free buffer from the application, if one is available.
    fn dequeue_buffer(&mut self) -> Option<BufferHandle>;

    /// Map a buffer for CPU writes.
    fn lock(&mut self, handle: BufferHandle) -> Result<&mut [u8]>;

    /// Unmap a previously locked buffer.
    fn unlock(&mut self, handle: BufferHandle) -> Result<()>;

    /// Return a filled buffer to the application.
    fn enqueue_buffer(&mut self, handle: BufferHandle, timestamp: Duration) -> Result<()>;

    /// Return an unfilled buffer to the application.
    fn cancel_buffer(&mut self, handle: BufferHandle) -> Result<()>;
}

/// Software pixel-format conversion.
pub trait FormatConverter: Send {
    /// Convert `src` (laid out as `src_format`) into `dst` (laid out as `dst_format`).
    fn convert(
        &mut self,
        src_format: &Format,
        src: &[u8],
        dst_format: &Format,
        dst: &mut [u8],
    ) -> Result<()>;
}

/// Host-side notification sink. Called from pipeline threads.
pub trait PipelineListener: Send + Sync {
    /// The sensor finished exposing the frame bound to `frame_count`.
    fn on_shutter(&self, _frame_count: u32, _timestamp: Duration) {}

    /// The service-visible autofocus state changed.
    fn on_af_state(&self, _state: AfServiceState, _trigger_id: i32) {}

    /// A hardware or bookkeeping error was observed.
    fn on_error(&self, _error: &CameraError) {}
}

/// Listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl PipelineListener for NullListener {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_new_uses_bytes_per_pixel() {
        let rgb = Format::new(4, 2, FourCC::RGB3);
        assert_eq!(rgb.stride, 12);
        assert_eq!(rgb.size, 24);

        let yuyv = Format::new(4, 2, FourCC::YUYV);
        assert_eq!(yuyv.size, 16);

        let raw = Format::new(4, 2, FourCC::BA10);
        assert_eq!(raw.stride, 8);
        assert_eq!(raw.size, 16);
    }

    #[test]
    fn test_format_normalized_fills_zero_fields() {
        let format = Format {
            width: 8,
            height: 2,
            fourcc: FourCC::BA10,
            stride: 0,
            size: 0,
        };
        assert_eq!(format.normalized(), Format::new(8, 2, FourCC::BA10));
    }

    #[test]
    fn test_stream_mask_ops() {
        let mut mask: StreamMask = [0u8, 3].into_iter().collect();
        assert!(mask.contains(0));
        assert!(mask.contains(3));
        assert!(!mask.contains(1));
        assert_eq!(mask.count(), 2);

        mask.remove(0);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!(StreamMask::single(40), StreamMask::EMPTY);
    }

    #[test]
    fn test_fourcc_string_round_trip() {
        let fourcc = FourCC::try_from("YUYV".to_owned()).expect("valid fourcc");
        assert_eq!(fourcc, FourCC::YUYV);
        assert_eq!(String::from(FourCC::RGB3), "RGB3");
        assert!(FourCC::try_from("YUV".to_owned()).is_err());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(CameraError::QueueFull.code(), ErrorCode::QueueFull);
        assert_eq!(CameraError::NoBuffer { stream: 1 }.code(), ErrorCode::NoBuffer);
        assert_eq!(
            CameraError::hardware("sensor", "dequeue", "EIO").code(),
            ErrorCode::HardwareOpFailed
        );
        assert_eq!(ErrorCode::HardwareOpFailed as i32, 3);
    }

    #[test]
    fn test_metadata_merge_keeps_absent_fields() {
        let mut meta = DynamicMetadata {
            frame_count: Some(3),
            exposure_time: Some(Duration::from_millis(10)),
            sensitivity: Some(100),
            af_state: AfHwState::Inactive,
        };
        meta.merge(&DynamicMetadata {
            frame_count: None,
            exposure_time: None,
            sensitivity: Some(400),
            af_state: AfHwState::ActiveScan,
        });
        assert_eq!(meta.frame_count, Some(3));
        assert_eq!(meta.exposure_time, Some(Duration::from_millis(10)));
        assert_eq!(meta.sensitivity, Some(400));
        assert_eq!(meta.af_state, AfHwState::ActiveScan);
    }
}

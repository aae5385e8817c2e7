//! Exynos-Cam-Pipeline: a signal-driven camera pipeline orchestrator
//!
//! The pipeline moves raw frames from a sensor through an ISP into per-stream
//! scalers, correlating every hardware completion with the application
//! request that asked for it. Hardware is reached through the [`VideoNode`]
//! and [`GraphicBufferQueue`] traits, so the same pipeline runs on V4L2
//! devices ([`device::V4l2Node`]) and on simulated hardware
//! ([`mock::SimulatedHardware`]).

pub mod af;
pub mod bayer;
pub mod config;
pub mod convert;
pub mod device;
pub mod mock;
pub mod pipeline;
pub mod request;
pub mod signal_thread;
pub mod traits;
pub mod validation;

pub use af::{AfMode, AfServiceState};
pub use bayer::BAYER_BUFFERS;
pub use config::{Conversion, PipelineConfig, StreamConfig, StreamKind};
pub use device::V4l2Node;
pub use pipeline::{Pipeline, PipelineHardware, PipelineStats, StreamHardware};
pub use request::REQUEST_SLOTS;
pub use traits::{
    CameraError, CaptureRequest, CompletedFrame, ControlSettings, Format, FourCC,
    GraphicBufferQueue, PipelineListener, Result, StreamMask, VideoNode,
};

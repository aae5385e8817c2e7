//! V4L2 node adapter using the v4l crate.
//!
//! The v4l mmap stream recycles its own buffers, so [`V4l2Node`] runs the
//! stream on a capture worker and presents the indexed queue/dequeue contract
//! on top: each dequeued frame is copied into the host buffer at the front of
//! the queued list.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{CameraError, Dequeued, Format, FourCC, Result, Shot, VideoNode};

/// How long `dequeue` waits for the driver before giving up.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Device capabilities and identification.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// Driver name (e.g., "bcm2835-v4l2", "vivid").
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether device supports video capture.
    pub can_capture: bool,
    /// Whether device supports streaming I/O.
    pub can_stream: bool,
}

struct CapturedFrame {
    data: Vec<u8>,
    timestamp: Duration,
    sequence: u32,
}

struct CaptureWorker {
    frames: Receiver<io::Result<CapturedFrame>>,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// A V4L2 capture node.
pub struct V4l2Node {
    name: String,
    path: PathBuf,
    capabilities: DeviceCapabilities,
    format: Option<Format>,
    count: u32,
    queued: VecDeque<usize>,
    frames: Vec<Vec<u8>>,
    worker: Option<CaptureWorker>,
}

impl V4l2Node {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    pub fn open(index: u32) -> Result<Self> {
        Self::with_path(format!("/dev/video{index}"))
    }

    /// Open a V4L2 device by path.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let device = Device::with_path(&path)
            .map_err(|err| CameraError::DeviceOpenFailed(format!("{}: {err}", path.display())))?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };
        if !capabilities.can_capture || !capabilities.can_stream {
            return Err(CameraError::DeviceOpenFailed(format!(
                "{}: not a streaming capture device",
                path.display()
            )));
        }
        info!(path = %path.display(), card = %capabilities.card, driver = %capabilities.driver, "v4l2 node opened");

        Ok(Self {
            name: path.display().to_string(),
            path,
            capabilities,
            format: None,
            count: 0,
            queued: VecDeque::new(),
            frames: Vec::new(),
            worker: None,
        })
    }

    /// Device identification.
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Query the driver's current format.
    pub fn format(&self) -> Result<Format> {
        let device = self.device("format")?;
        let fmt = Capture::format(&device).map_err(|err| self.error("format", err))?;
        Ok(from_v4l(&fmt))
    }

    fn device(&self, op: &'static str) -> Result<Device> {
        Device::with_path(&self.path).map_err(|err| self.error(op, err))
    }

    fn error(&self, op: &'static str, err: io::Error) -> CameraError {
        CameraError::hardware(&self.name, op, err)
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.stop.send(()).is_err() {
                debug!(node = %self.name, "capture worker already exited");
            }
            drop(worker.frames);
            if worker.handle.join().is_err() {
                warn!(node = %self.name, "capture worker panicked");
            }
        }
    }
}

fn from_v4l(fmt: &v4l::Format) -> Format {
    Format {
        width: fmt.width,
        height: fmt.height,
        fourcc: FourCC::from(fmt.fourcc),
        stride: fmt.stride,
        size: fmt.size,
    }
}

fn apply_format(device: &Device, format: &Format) -> io::Result<v4l::Format> {
    let mut fmt = Capture::format(device)?;
    fmt.width = format.width;
    fmt.height = format.height;
    fmt.fourcc = format.fourcc.into();
    Capture::set_format(device, &fmt)
}

fn run_capture(
    path: &Path,
    format: Option<&Format>,
    count: u32,
    frames: &Sender<io::Result<CapturedFrame>>,
    stop: &Receiver<()>,
) -> io::Result<()> {
    let device = Device::with_path(path)?;
    if let Some(format) = format {
        apply_format(&device, format)?;
    }
    let mut stream = Stream::with_buffers(&device, Type::VideoCapture, count)?;

    loop {
        if !stop.is_empty() {
            return Ok(());
        }
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(err) => {
                if frames.send(Err(err)).is_err() {
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(5));
                continue;
            }
        };

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let used = (meta.bytesused as usize).min(buf.len());
        let frame = CapturedFrame {
            data: buf.get(..used).unwrap_or(buf).to_vec(),
            timestamp: Duration::new(secs, nanos),
            sequence: meta.sequence,
        };
        match frames.try_send(Ok(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("host is behind, frame dropped"),
            Err(TrySendError::Disconnected(_)) => return Ok(()),
        }
    }
}

impl VideoNode for V4l2Node {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let device = self.device("set_format")?;
        let fmt = apply_format(&device, format).map_err(|err| self.error("set_format", err))?;
        let actual = from_v4l(&fmt);
        self.format = Some(actual.clone());
        Ok(actual)
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        if self.worker.is_some() {
            return Err(CameraError::hardware(&self.name, "request_buffers", "busy streaming"));
        }
        self.count = count;
        self.frames = vec![Vec::new(); count as usize];
        self.queued.clear();
        Ok(count)
    }

    fn queue(&mut self, index: usize, shot: Option<&Shot>) -> Result<()> {
        if index >= self.frames.len() {
            return Err(CameraError::hardware(
                &self.name,
                "queue",
                format!("index {index} out of range"),
            ));
        }
        if self.queued.contains(&index) {
            return Err(CameraError::hardware(
                &self.name,
                "queue",
                format!("index {index} already queued"),
            ));
        }
        if let Some(shot) = shot.filter(|s| s.exposure_time.is_some() || s.sensitivity.is_some()) {
            debug!(node = %self.name, frame_count = ?shot.frame_count, "per-frame controls not applied");
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Dequeued> {
        let Some(worker) = self.worker.as_ref() else {
            return Err(CameraError::hardware(&self.name, "dequeue", "not streaming"));
        };
        let Some(&index) = self.queued.front() else {
            return Err(CameraError::hardware(&self.name, "dequeue", "no buffer queued"));
        };
        let frame = match worker.frames.recv_timeout(DEQUEUE_TIMEOUT) {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => return Err(self.error("dequeue", err)),
            Err(RecvTimeoutError::Timeout) => {
                return Err(CameraError::hardware(&self.name, "dequeue", "timed out"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CameraError::hardware(&self.name, "dequeue", "capture worker exited"));
            }
        };
        self.queued.pop_front();
        debug!(node = %self.name, index, sequence = frame.sequence, bytes = frame.data.len(), "frame dequeued");
        if let Some(slot) = self.frames.get_mut(index) {
            *slot = frame.data;
        }
        Ok(Dequeued {
            index,
            timestamp: frame.timestamp,
            metadata: None,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        if self.count == 0 {
            return Err(CameraError::hardware(&self.name, "stream_on", "no buffers requested"));
        }
        let (frames_tx, frames_rx) = bounded(self.count as usize);
        let (stop_tx, stop_rx) = bounded(1);
        let path = self.path.clone();
        let format = self.format.clone();
        let count = self.count;

        let handle = thread::Builder::new()
            .name(format!("v4l2-{}", self.name))
            .spawn(move || {
                if let Err(err) = run_capture(&path, format.as_ref(), count, &frames_tx, &stop_rx) {
                    if let Err(unsent) = frames_tx.send(Err(err)) {
                        debug!(error = ?unsent.into_inner().err(), "capture worker error after stop");
                    }
                }
            })
            .map_err(|source| CameraError::ThreadSpawn {
                name: self.name.clone(),
                source,
            })?;

        self.worker = Some(CaptureWorker {
            frames: frames_rx,
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.stop_worker();
        self.queued.clear();
        Ok(())
    }

    fn buffer(&self, index: usize) -> Option<&[u8]> {
        self.frames
            .get(index)
            .filter(|data| !data.is_empty())
            .map(Vec::as_slice)
    }
}

impl Drop for V4l2Node {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

//! Simulated camera hardware for testing without a device.
//!
//! [`SimulatedHardware`] hands out sensor, ISP and scaler nodes that share one
//! simulated core: the sensor echoes each shot's frame count back as metadata
//! and runs a small autofocus model, the ISP routes processed frames to the
//! scalers named in the shot, and scalers render a YUYV test pattern into
//! their buffers on dequeue. A scaler dequeue blocks until the ISP has
//! produced a frame for it, as a driver `DQBUF` would. A scaler with no free
//! buffer when the ISP finishes drops that frame. [`MockBufferQueue`] stands in for the
//! application's buffer exchange.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::warn;

use crate::af::{AfHwState, AfMode, AfTrigger};
use crate::config::PipelineConfig;
use crate::pipeline::{PipelineHardware, StreamHardware};
use crate::traits::{
    BufferHandle, CameraError, Dequeued, DynamicMetadata, Format, FourCC, GraphicBufferQueue,
    Result, Shot, VideoNode,
};

/// Simulated time between sensor frames (~30fps).
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

const DEFAULT_EXPOSURE: Duration = Duration::from_millis(10);
const DEFAULT_SENSITIVITY: u32 = 100;

/// How long a scaler dequeue waits for ISP output before failing.
pub const DEFAULT_SCALER_WAIT: Duration = Duration::from_secs(2);

/// Frames an auto/macro scan reports `ActiveScan` after the trigger frame.
const TRIGGERED_SCAN_FRAMES: u32 = 2;
/// Frames a continuous-mode scan reports `ActiveScan` after the mode is programmed.
const CONTINUOUS_SCAN_FRAMES: u32 = 3;

/// Test pattern types for scaler frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sensor,
    Isp,
    Scaler(u8),
}

#[derive(Debug)]
struct Fault {
    node: String,
    op: &'static str,
}

#[derive(Debug, Clone, Copy)]
struct ScalerFrame {
    index: usize,
    timestamp: Duration,
    frame_count: Option<u32>,
}

#[derive(Debug, Default)]
struct ScalerQueues {
    free: VecDeque<usize>,
    done: VecDeque<ScalerFrame>,
}

/// Lens model: scans for a few frames after a trigger, then settles on `outcome`.
#[derive(Debug)]
struct SimAf {
    mode: AfMode,
    state: AfHwState,
    scan_left: u32,
    outcome: AfHwState,
}

impl SimAf {
    /// Advance one frame. Bubbles do not move the lens.
    fn on_shot(&mut self, shot: &Shot) -> AfHwState {
        if shot.is_bubble() {
            return self.state;
        }
        if let Some(mode) = shot.af_mode {
            self.mode = mode;
            if matches!(mode, AfMode::ContinuousVideo | AfMode::ContinuousPicture) {
                self.state = AfHwState::ActiveScan;
                self.scan_left = CONTINUOUS_SCAN_FRAMES;
                return self.state;
            }
            self.state = AfHwState::Inactive;
            self.scan_left = 0;
        }
        match shot.af_trigger {
            AfTrigger::Start(_) if matches!(self.mode, AfMode::Auto | AfMode::Macro) => {
                self.state = AfHwState::ActiveScan;
                self.scan_left = TRIGGERED_SCAN_FRAMES;
                return self.state;
            }
            AfTrigger::Cancel(_) => {
                self.state = AfHwState::Inactive;
                self.scan_left = 0;
                return self.state;
            }
            _ => {}
        }
        if self.state == AfHwState::ActiveScan {
            self.scan_left = self.scan_left.saturating_sub(1);
            if self.scan_left == 0 {
                self.state = self.outcome;
            }
        }
        self.state
    }
}

#[derive(Debug)]
struct SimCore {
    sensor_queued: VecDeque<(usize, Shot)>,
    isp_queued: VecDeque<(usize, Shot)>,
    scalers: BTreeMap<u8, ScalerQueues>,
    af: SimAf,
    faults: Vec<Fault>,
    clock: Duration,
    frame_interval: Duration,
    paced: bool,
    pattern: TestPattern,
    sensor_frames: u64,
    scaler_wait: Duration,
}

/// The core plus the wake-up for blocked scaler dequeues.
#[derive(Debug)]
struct SimShared {
    state: Mutex<SimCore>,
    scaler_ready: Condvar,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimCore> {
        self.state.lock()
    }
}

/// Shared simulated sensor, ISP and scalers.
#[derive(Debug, Clone)]
pub struct SimulatedHardware {
    core: Arc<SimShared>,
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulated hardware wired up for a configuration, plus the per-stream
/// delivery logs of its application buffer queues.
pub struct SimulatedRig {
    /// Hardware to hand to [`crate::pipeline::Pipeline::start`].
    pub hardware: PipelineHardware,
    /// Delivery log for each configured stream id.
    pub deliveries: BTreeMap<u8, DeliveryLog>,
}

impl SimulatedHardware {
    /// Create simulated hardware that completes frames as fast as they are asked for.
    #[must_use]
    pub fn new() -> Self {
        let state = Mutex::new(SimCore {
                sensor_queued: VecDeque::new(),
                isp_queued: VecDeque::new(),
                scalers: BTreeMap::new(),
                af: SimAf {
                    mode: AfMode::Off,
                    state: AfHwState::Inactive,
                    scan_left: 0,
                    outcome: AfHwState::AcquiredFocus,
                },
                faults: Vec::new(),
                clock: Duration::ZERO,
                frame_interval: DEFAULT_FRAME_INTERVAL,
                paced: false,
                pattern: TestPattern::ColorBars,
                sensor_frames: 0,
                scaler_wait: DEFAULT_SCALER_WAIT,
            });
        Self {
            core: Arc::new(SimShared {
                state,
                scaler_ready: Condvar::new(),
            }),
        }
    }

    /// Pace sensor dequeues in real time at `interval`.
    #[must_use]
    pub fn with_frame_interval(self, interval: Duration) -> Self {
        {
            let mut core = self.core.lock();
            core.frame_interval = interval;
            core.paced = true;
        }
        self
    }

    /// How long a scaler dequeue waits for a frame before failing.
    #[must_use]
    pub fn with_scaler_wait(self, wait: Duration) -> Self {
        self.core.lock().scaler_wait = wait;
        self
    }

    /// Set the pattern scalers render.
    #[must_use]
    pub fn with_pattern(self, pattern: TestPattern) -> Self {
        self.core.lock().pattern = pattern;
        self
    }

    /// State the lens settles on when a scan finishes.
    pub fn set_af_outcome(&self, outcome: AfHwState) {
        self.core.lock().af.outcome = outcome;
    }

    /// Make the next `op` on the node called `node` fail without side effects.
    ///
    /// `op` is one of `set_format`, `request_buffers`, `queue`, `dequeue`,
    /// `stream_on`, `stream_off`.
    pub fn fail_next(&self, node: &str, op: &'static str) {
        self.core.lock().faults.push(Fault {
            node: node.to_owned(),
            op,
        });
    }

    /// Raw frames the sensor has produced so far.
    pub fn sensor_frames(&self) -> u64 {
        self.core.lock().sensor_frames
    }

    /// A sensor node named `sensor`.
    pub fn sensor_node(&self) -> SimNode {
        self.node(Role::Sensor, "sensor".to_owned())
    }

    /// An ISP node named `isp`.
    pub fn isp_node(&self) -> SimNode {
        self.node(Role::Isp, "isp".to_owned())
    }

    /// A scaler node for stream `id`, named `scaler<id>`.
    pub fn scaler_node(&self, id: u8) -> SimNode {
        self.core.lock().scalers.entry(id).or_default();
        self.node(Role::Scaler(id), format!("scaler{id}"))
    }

    fn node(&self, role: Role, name: String) -> SimNode {
        SimNode {
            core: Arc::clone(&self.core),
            role,
            name,
            format: Format::new(640, 480, FourCC::YUYV),
            count: 0,
            buffers: Vec::new(),
            streaming: false,
        }
    }

    /// Build nodes and application buffer queues for every stream in `config`.
    pub fn build(&self, config: &PipelineConfig) -> SimulatedRig {
        let mut deliveries = BTreeMap::new();
        let streams = config
            .streams
            .iter()
            .map(|stream| {
                let queue =
                    MockBufferQueue::new(stream.app_format(), stream.buffer_count as usize + 2);
                deliveries.insert(stream.id, queue.log());
                StreamHardware {
                    id: stream.id,
                    node: Box::new(self.scaler_node(stream.id)),
                    buffers: Box::new(queue),
                    converter: None,
                }
            })
            .collect();

        SimulatedRig {
            hardware: PipelineHardware {
                sensor: Box::new(self.sensor_node()),
                isp: Box::new(self.isp_node()),
                streams,
            },
            deliveries,
        }
    }
}

/// One simulated video node.
#[derive(Debug)]
pub struct SimNode {
    core: Arc<SimShared>,
    role: Role,
    name: String,
    format: Format,
    count: usize,
    buffers: Vec<Vec<u8>>,
    streaming: bool,
}

impl SimNode {
    fn check_fault(&self, op: &'static str) -> Result<()> {
        let mut core = self.core.lock();
        if let Some(pos) = core
            .faults
            .iter()
            .position(|f| f.node == self.name && f.op == op)
        {
            core.faults.remove(pos);
            return Err(CameraError::hardware(&self.name, op, "injected fault"));
        }
        Ok(())
    }

    fn dequeue_sensor(&self) -> Result<Dequeued> {
        let (paced, interval) = {
            let core = self.core.lock();
            (core.paced, core.frame_interval)
        };
        if paced {
            std::thread::sleep(interval);
        }

        let mut core = self.core.lock();
        let (index, shot) = core
            .sensor_queued
            .pop_front()
            .ok_or_else(|| CameraError::hardware(&self.name, "dequeue", "no buffer queued"))?;
        core.clock += interval;
        core.sensor_frames += 1;
        let af_state = core.af.on_shot(&shot);

        Ok(Dequeued {
            index,
            timestamp: core.clock,
            metadata: Some(DynamicMetadata {
                frame_count: shot.frame_count,
                exposure_time: shot.exposure_time.or(Some(DEFAULT_EXPOSURE)),
                sensitivity: shot.sensitivity.or(Some(DEFAULT_SENSITIVITY)),
                af_state,
            }),
        })
    }

    fn dequeue_isp(&self) -> Result<Dequeued> {
        let mut core = self.core.lock();
        let (index, shot) = core
            .isp_queued
            .pop_front()
            .ok_or_else(|| CameraError::hardware(&self.name, "dequeue", "no buffer queued"))?;
        let timestamp = core.clock;
        for id in shot.output_streams.iter() {
            let Some(scaler) = core.scalers.get_mut(&id) else {
                continue;
            };
            match scaler.free.pop_front() {
                Some(free) => scaler.done.push_back(ScalerFrame {
                    index: free,
                    timestamp,
                    frame_count: shot.frame_count,
                }),
                None => warn!(stream = id, "scaler overrun, frame dropped"),
            }
        }
        drop(core);
        self.core.scaler_ready.notify_all();
        Ok(Dequeued {
            index,
            timestamp,
            metadata: None,
        })
    }

    fn dequeue_scaler(&mut self, id: u8) -> Result<Dequeued> {
        let (frame, pattern) = {
            let mut core = self.core.lock();
            let deadline = Instant::now() + core.scaler_wait;
            let frame = loop {
                if let Some(frame) = core.scalers.get_mut(&id).and_then(|q| q.done.pop_front()) {
                    break frame;
                }
                if Instant::now() >= deadline {
                    return Err(CameraError::hardware(&self.name, "dequeue", "no frame ready"));
                }
                self.core.scaler_ready.wait_until(&mut core, deadline);
            };
            (frame, core.pattern)
        };
        if let Some(data) = self.buffers.get_mut(frame.index) {
            fill_test_frame(data, &self.format, pattern);
        }
        Ok(Dequeued {
            index: frame.index,
            timestamp: frame.timestamp,
            metadata: Some(DynamicMetadata {
                frame_count: frame.frame_count,
                ..DynamicMetadata::default()
            }),
        })
    }
}

impl VideoNode for SimNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        self.check_fault("set_format")?;
        self.format = format.clone().normalized();
        Ok(self.format.clone())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        self.check_fault("request_buffers")?;
        self.count = count as usize;
        if let Role::Scaler(_) = self.role {
            self.buffers = vec![vec![0u8; self.format.size as usize]; self.count];
        }
        Ok(count)
    }

    fn queue(&mut self, index: usize, shot: Option<&Shot>) -> Result<()> {
        self.check_fault("queue")?;
        if index >= self.count {
            return Err(CameraError::hardware(
                &self.name,
                "queue",
                format!("index {index} out of range"),
            ));
        }
        let shot = shot.cloned().unwrap_or_default();
        let mut core = self.core.lock();
        match self.role {
            Role::Sensor => core.sensor_queued.push_back((index, shot)),
            Role::Isp => core.isp_queued.push_back((index, shot)),
            Role::Scaler(id) => core.scalers.entry(id).or_default().free.push_back(index),
        }
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Dequeued> {
        self.check_fault("dequeue")?;
        if !self.streaming {
            return Err(CameraError::hardware(&self.name, "dequeue", "not streaming"));
        }
        match self.role {
            Role::Sensor => self.dequeue_sensor(),
            Role::Isp => self.dequeue_isp(),
            Role::Scaler(id) => self.dequeue_scaler(id),
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        self.check_fault("stream_on")?;
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.check_fault("stream_off")?;
        self.streaming = false;
        let mut core = self.core.lock();
        match self.role {
            Role::Sensor => core.sensor_queued.clear(),
            Role::Isp => core.isp_queued.clear(),
            Role::Scaler(id) => {
                if let Some(queues) = core.scalers.get_mut(&id) {
                    queues.free.clear();
                    queues.done.clear();
                }
            }
        }
        Ok(())
    }

    fn buffer(&self, index: usize) -> Option<&[u8]> {
        self.buffers.get(index).map(Vec::as_slice)
    }
}

#[derive(Debug, Default)]
struct LogInner {
    timestamps: Vec<Duration>,
    last_frame: Option<Vec<u8>>,
    cancelled: usize,
}

/// Record of what a [`MockBufferQueue`] received. Cloneable; clones share the record.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLog {
    inner: Arc<Mutex<LogInner>>,
}

impl DeliveryLog {
    /// Number of filled buffers returned.
    pub fn delivered(&self) -> usize {
        self.inner.lock().timestamps.len()
    }

    /// Timestamps of filled buffers, in delivery order.
    pub fn timestamps(&self) -> Vec<Duration> {
        self.inner.lock().timestamps.clone()
    }

    /// Contents of the most recently filled buffer.
    pub fn last_frame(&self) -> Option<Vec<u8>> {
        self.inner.lock().last_frame.clone()
    }

    /// Number of buffers returned unfilled.
    pub fn cancelled(&self) -> usize {
        self.inner.lock().cancelled
    }
}

/// Application buffer queue backed by plain memory.
#[derive(Debug)]
pub struct MockBufferQueue {
    buffers: Vec<Vec<u8>>,
    free: VecDeque<usize>,
    locked: Option<usize>,
    recycle: bool,
    log: DeliveryLog,
}

impl MockBufferQueue {
    /// `count` buffers sized for `format`. Filled buffers go straight back to
    /// the free list, as if the application consumed them at once.
    #[must_use]
    pub fn new(format: Format, count: usize) -> Self {
        let size = format.normalized().size as usize;
        Self {
            buffers: vec![vec![0u8; size]; count],
            free: (0..count).collect(),
            locked: None,
            recycle: true,
            log: DeliveryLog::default(),
        }
    }

    /// Keep filled buffers instead of recycling them.
    #[must_use]
    pub const fn without_recycling(mut self) -> Self {
        self.recycle = false;
        self
    }

    /// Shared delivery record.
    pub fn log(&self) -> DeliveryLog {
        self.log.clone()
    }

    fn index(&self, handle: BufferHandle, op: &'static str) -> Result<usize> {
        usize::try_from(handle.0)
            .ok()
            .filter(|index| *index < self.buffers.len())
            .ok_or_else(|| CameraError::hardware("gralloc", op, format!("bad handle {}", handle.0)))
    }
}

impl GraphicBufferQueue for MockBufferQueue {
    fn dequeue_buffer(&mut self) -> Option<BufferHandle> {
        self.free.pop_front().map(|index| BufferHandle(index as u64))
    }

    fn lock(&mut self, handle: BufferHandle) -> Result<&mut [u8]> {
        let index = self.index(handle, "lock")?;
        if self.locked.is_some() {
            return Err(CameraError::hardware("gralloc", "lock", "buffer already locked"));
        }
        self.locked = Some(index);
        self.buffers
            .get_mut(index)
            .map(Vec::as_mut_slice)
            .ok_or_else(|| CameraError::hardware("gralloc", "lock", "buffer missing"))
    }

    fn unlock(&mut self, handle: BufferHandle) -> Result<()> {
        let index = self.index(handle, "unlock")?;
        if self.locked != Some(index) {
            return Err(CameraError::hardware("gralloc", "unlock", "buffer not locked"));
        }
        self.locked = None;
        Ok(())
    }

    fn enqueue_buffer(&mut self, handle: BufferHandle, timestamp: Duration) -> Result<()> {
        let index = self.index(handle, "enqueue")?;
        {
            let mut log = self.log.inner.lock();
            log.timestamps.push(timestamp);
            log.last_frame = self.buffers.get(index).cloned();
        }
        if self.recycle {
            self.free.push_back(index);
        }
        Ok(())
    }

    fn cancel_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let index = self.index(handle, "cancel")?;
        self.log.inner.lock().cancelled += 1;
        self.free.push_back(index);
        Ok(())
    }
}

/// Generate a YUYV test frame for `format`.
#[must_use]
pub fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let format = format.clone().normalized();
    let mut data = vec![0u8; format.size as usize];
    fill_test_frame(&mut data, &format, pattern);
    data
}

/// Render `pattern` as YUYV into `data`, laid out as `format`.
pub fn fill_test_frame(data: &mut [u8], format: &Format, pattern: TestPattern) {
    let width = format.width as usize;
    let stride = (format.stride as usize).max(width * 2);
    for row in data.chunks_exact_mut(stride).take(format.height as usize) {
        for (pair, px) in row.chunks_exact_mut(4).take(width / 2).enumerate() {
            let x = pair * 2;
            let (y, u, v) = match pattern {
                TestPattern::ColorBars => color_bar_at(x, width),
                TestPattern::Gradient => (gradient_at(x, width), 128, 128),
                TestPattern::Solid(y, u, v) => (y, u, v),
            };
            px.copy_from_slice(&[y, u, y, v]);
        }
    }
}

/// YUV value of the color bar covering column `x`.
fn color_bar_at(x: usize, width: usize) -> (u8, u8, u8) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    const BARS: [(u8, u8, u8); 8] = [
        (235, 128, 128), // White
        (210, 16, 146),  // Yellow
        (170, 166, 16),  // Cyan
        (145, 54, 34),   // Green
        (106, 202, 222), // Magenta
        (81, 90, 240),   // Red
        (41, 240, 110),  // Blue
        (16, 128, 128),  // Black
    ];
    let bar_width = (width / 8).max(1);
    BARS.get((x / bar_width).min(7)).copied().unwrap_or((16, 128, 128))
}

#[allow(clippy::cast_possible_truncation)]
fn gradient_at(x: usize, width: usize) -> u8 {
    ((x * 255) / width.max(1)) as u8
}

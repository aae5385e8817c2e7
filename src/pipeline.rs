//! Pipeline orchestrator.
//!
//! One [`SignalThread`] per role:
//!
//! * `main` takes new requests and hands completed frames to the host,
//! * `sensor` owns the raw buffer ring, the sensor and ISP nodes and the AF
//!   context; it runs one raw frame per wake through sensor and ISP,
//! * `isp` fans processed frames out to the stream threads,
//! * `stream-N` moves scaler output into application buffers.
//!
//! The ISP is driven one-in one-out: a raw buffer queued to the ISP is
//! dequeued again before the sensor thread touches the next raw buffer. The
//! capture timestamp and the AF notification for a frame are both taken at
//! sensor dequeue and rely on that ordering.
//!
//! A frame is routed to a stream only while that stream's scaler has a free
//! buffer. The sensor thread takes a [`ScalerCredits`] unit per routed
//! stream and waits for the stream thread to hand one back when the scaler
//! is full; a stream that stays full past the frame timeout fails that
//! output instead of overrunning the scaler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::af::{AfContext, AfMode};
use crate::bayer::{BayerBufManager, BAYER_BUFFERS};
use crate::config::{Conversion, PipelineConfig};
use crate::convert::YuyvToRgbConverter;
use crate::request::RequestManager;
use crate::signal_thread::{SignalHandler, SignalThread, Signaller};
use crate::traits::{
    BufferHandle, CameraError, CaptureRequest, CompletedFrame, Dequeued, Format, FormatConverter,
    GraphicBufferQueue, PipelineListener, Result, Shot, StreamMask, VideoNode,
};
use crate::validation::{validate_bayer_counts, validate_request_table};

const SIGNAL_MAIN_REQUEST_AVAILABLE: u32 = 1 << 0;
const SIGNAL_MAIN_FRAME_READY: u32 = 1 << 1;

const SIGNAL_SENSOR_PROCESS: u32 = 1 << 0;
const SIGNAL_SENSOR_AF_COMMAND: u32 = 1 << 1;

const SIGNAL_ISP_FRAME_DONE: u32 = 1 << 0;

const SIGNAL_STREAM_DATA_READY: u32 = 1 << 0;

/// Consecutive failed sensor cycles after which retries are spaced out.
const BACKOFF_AFTER_FAILURES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);
const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Delay before the next sensor cycle after `failures` consecutive failures.
fn retry_backoff(failures: u32) -> Duration {
    let Some(excess) = failures.checked_sub(BACKOFF_AFTER_FAILURES) else {
        return Duration::ZERO;
    };
    RETRY_BACKOFF
        .saturating_mul(1 << excess.min(5))
        .min(MAX_RETRY_BACKOFF)
}

/// Hardware for one output stream.
pub struct StreamHardware {
    /// Stream id, matching a configured stream.
    pub id: u8,
    /// Scaler output node.
    pub node: Box<dyn VideoNode>,
    /// Application buffer exchange.
    pub buffers: Box<dyn GraphicBufferQueue>,
    /// Converter for indirect streams. Indirect streams without one get a
    /// [`YuyvToRgbConverter`].
    pub converter: Option<Box<dyn FormatConverter>>,
}

/// All hardware collaborators the pipeline drives.
pub struct PipelineHardware {
    /// Raw sensor node.
    pub sensor: Box<dyn VideoNode>,
    /// ISP input node.
    pub isp: Box<dyn VideoNode>,
    /// Output streams.
    pub streams: Vec<StreamHardware>,
}

/// Counters exposed through [`Pipeline::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    /// Requests handed back to the host.
    pub frames_completed: u64,
    /// Raw frames processed with no request bound.
    pub bubbles: u64,
    /// Failed hardware or buffer-exchange operations.
    pub hardware_errors: u64,
    /// Buffer ordering or request lifecycle violations.
    pub protocol_violations: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    frames_completed: AtomicU64,
    bubbles: AtomicU64,
    hardware_errors: AtomicU64,
    protocol_violations: AtomicU64,
}

/// State shared by every pipeline thread.
struct Shared {
    requests: RequestManager,
    listener: Arc<dyn PipelineListener>,
    stats: StatsCounters,
}

impl Shared {
    fn report(&self, err: &CameraError) {
        match err {
            CameraError::BufferOrder { .. }
            | CameraError::InvalidTransition { .. }
            | CameraError::Validation(_) => {
                self.stats.protocol_violations.fetch_add(1, Ordering::Relaxed);
                error!(%err, "protocol violation");
            }
            _ => {
                self.stats.hardware_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%err, code = ?err.code(), "pipeline operation failed");
            }
        }
        self.listener.on_error(err);
    }
}

/// Free scaler buffers of one stream. Taken by the sensor thread when it
/// routes a frame to the stream, returned by the stream thread when the
/// buffer goes back to the scaler.
#[derive(Debug)]
struct ScalerCredits {
    free: Mutex<u32>,
    returned: Condvar,
}

impl ScalerCredits {
    fn new(free: u32) -> Self {
        Self {
            free: Mutex::new(free),
            returned: Condvar::new(),
        }
    }

    /// Take one buffer, waiting up to `timeout` for one to come back.
    fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut free = self.free.lock();
        while *free == 0 {
            if Instant::now() >= deadline {
                return false;
            }
            self.returned.wait_until(&mut free, deadline);
        }
        *free -= 1;
        true
    }

    fn release(&self) {
        *self.free.lock() += 1;
        self.returned.notify_one();
    }
}

/// Host AF calls, applied on the sensor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfRequest {
    Trigger(i32),
    Cancel(i32),
    SetMode(AfMode),
}

/// A processed frame that owes output to one or more streams.
#[derive(Debug, Clone, Copy)]
struct IspCompletion {
    frame_count: u32,
    timestamp: Duration,
    output_streams: StreamMask,
}

#[derive(Debug, Clone, Copy)]
struct StreamTicket {
    frame_count: u32,
    timestamp: Duration,
}

struct MainHandler {
    shared: Arc<Shared>,
    sensor: Signaller,
    completed: Sender<CompletedFrame>,
}

impl MainHandler {
    fn drain_completed(&self) {
        while let Some(result) = self.shared.requests.prepare_frame() {
            let request = match self.shared.requests.deregister_request() {
                Ok(request) => request,
                Err(err) => {
                    self.shared.report(&err);
                    return;
                }
            };
            self.shared
                .stats
                .frames_completed
                .fetch_add(1, Ordering::Relaxed);
            debug!(frame_count = result.frame_count, tag = request.tag, "frame ready");
            if self
                .completed
                .send(CompletedFrame { request, result })
                .is_err()
            {
                debug!("host stopped collecting frames");
            }
        }
    }
}

impl SignalHandler for MainHandler {
    fn on_signal(&mut self, signals: u32) {
        if signals & SIGNAL_MAIN_FRAME_READY != 0 {
            self.drain_completed();
        }
        if signals & SIGNAL_MAIN_REQUEST_AVAILABLE != 0 {
            self.sensor.set_signal(SIGNAL_SENSOR_PROCESS);
        }
    }
}

/// Routing decided at sensor dequeue for the buffer now on its way through the ISP.
#[derive(Debug, Clone, Copy)]
struct IspJob {
    index: usize,
    frame_count: Option<u32>,
    timestamp: Duration,
    output_streams: StreamMask,
}

/// Everything the sensor thread owns.
struct SensorStage {
    shared: Arc<Shared>,
    sensor: Box<dyn VideoNode>,
    isp: Box<dyn VideoNode>,
    bayer: BayerBufManager,
    af: AfContext,
    pending_shot: Option<Shot>,
    job: Option<IspJob>,
    credits: Vec<(u8, Arc<ScalerCredits>)>,
    credit_wait: Duration,
}

impl SensorStage {
    fn configure(&mut self, config: &PipelineConfig) -> Result<()> {
        let count = u32::try_from(BAYER_BUFFERS).unwrap_or(u32::MAX);

        let format = self.sensor.set_format(&config.sensor_format)?;
        info!(
            node = self.sensor.name(),
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "sensor format"
        );
        let granted = self.sensor.request_buffers(count)?;
        if granted < count {
            return Err(CameraError::DeviceOpenFailed(format!(
                "{}: {granted} raw buffers granted, {count} needed",
                self.sensor.name()
            )));
        }

        self.isp.set_format(&config.isp_format)?;
        let granted = self.isp.request_buffers(count)?;
        if granted < count {
            return Err(CameraError::DeviceOpenFailed(format!(
                "{}: {granted} raw buffers granted, {count} needed",
                self.isp.name()
            )));
        }

        // Prime the whole ring; nothing is registered yet so these are bubbles.
        self.fill_sensor()?;
        self.isp.stream_on()?;
        self.sensor.stream_on()?;
        Ok(())
    }

    fn listener(&self) -> &dyn PipelineListener {
        self.shared.listener.as_ref()
    }

    /// One raw frame: finish whatever stage the last cycle left off at.
    fn run_cycle(&mut self, main: &Signaller, isp_thread: &IspLink) -> Result<()> {
        let counts = self.bayer.counts();
        if counts.on_hal_filled == 0 && counts.on_isp == 0 {
            if counts.on_sensor == 0 {
                return Ok(());
            }
            self.job = Some(self.dequeue_sensor(main)?);
        }
        if self.bayer.counts().on_hal_filled > 0 {
            self.enqueue_isp()?;
        }
        if self.bayer.counts().on_isp > 0 {
            self.dequeue_isp(isp_thread)?;
        }
        Ok(())
    }

    fn dequeue_sensor(&mut self, main: &Signaller) -> Result<IspJob> {
        let Dequeued {
            index,
            timestamp,
            metadata,
        } = self.sensor.dequeue()?;
        let echoed = metadata
            .as_ref()
            .and_then(|m| m.frame_count)
            .or_else(|| self.bayer.shot(index).and_then(|s| s.frame_count));
        self.bayer.mark_sensor_dequeue(index, echoed, timestamp)?;

        let matched = echoed.and_then(|fc| self.shared.requests.find_frame_cnt(fc));
        let output_streams = match matched {
            Some(frame_count) => {
                if self.shared.requests.register_timestamp(frame_count, timestamp) {
                    self.listener().on_shutter(frame_count, timestamp);
                }
                let metadata = metadata.unwrap_or_default();
                if self
                    .shared
                    .requests
                    .apply_dynamic_metadata(frame_count, &metadata)
                {
                    main.set_signal(SIGNAL_MAIN_FRAME_READY);
                }
                let listener = Arc::clone(&self.shared.listener);
                self.af
                    .on_notification(frame_count, metadata.af_state, listener.as_ref());
                let requested = self
                    .bayer
                    .shot(index)
                    .map_or(StreamMask::EMPTY, |s| s.output_streams);
                self.reserve_scalers(frame_count, requested, main)
            }
            None => {
                self.shared.stats.bubbles.fetch_add(1, Ordering::Relaxed);
                if let Some(frame_count) = echoed {
                    warn!(index, frame_count, "raw frame matches no in-flight request");
                } else {
                    debug!(index, "bubble frame");
                }
                StreamMask::EMPTY
            }
        };

        Ok(IspJob {
            index,
            frame_count: matched,
            timestamp,
            output_streams,
        })
    }

    /// Take a scaler buffer for every stream in `requested`. Streams that
    /// stay full past the wait have their output failed here.
    fn reserve_scalers(
        &self,
        frame_count: u32,
        requested: StreamMask,
        main: &Signaller,
    ) -> StreamMask {
        let mut routed = StreamMask::EMPTY;
        for id in requested.iter() {
            let reserved = match self.credits.iter().find(|(stream, _)| *stream == id) {
                Some((_, credits)) => credits.acquire(self.credit_wait),
                // Unknown streams are left to the ISP thread, which fails them.
                None => true,
            };
            if reserved {
                routed.insert(id);
                continue;
            }
            warn!(frame_count, stream = id, "scaler full, output dropped");
            self.shared.report(&CameraError::NoBuffer { stream: id });
            if self
                .shared
                .requests
                .notify_stream_output(frame_count, id, false)
            {
                main.set_signal(SIGNAL_MAIN_FRAME_READY);
            }
        }
        routed
    }

    fn enqueue_isp(&mut self) -> Result<()> {
        let Some((index, _)) = self.bayer.get_index_for_isp_enqueue() else {
            return Ok(());
        };
        let mut shot = self.bayer.shot(index).cloned().unwrap_or_default();
        if let Some(job) = self.job.as_ref().filter(|job| job.index == index) {
            shot.output_streams = job.output_streams;
        }
        self.isp.queue(index, Some(&shot))?;
        self.bayer.mark_isp_enqueue(index)
    }

    fn dequeue_isp(&mut self, isp_thread: &IspLink) -> Result<()> {
        let done = self.isp.dequeue()?;
        self.bayer.mark_isp_dequeue(done.index)?;

        let Some(job) = self.job.take() else {
            return Ok(());
        };
        if job.index != done.index {
            warn!(expected = job.index, actual = done.index, "isp returned a different buffer");
        }
        if let Some(frame_count) = job.frame_count {
            if !job.output_streams.is_empty() {
                isp_thread.send(IspCompletion {
                    frame_count,
                    timestamp: job.timestamp,
                    output_streams: job.output_streams,
                });
            }
        }
        Ok(())
    }

    /// Queue every free raw buffer to the sensor.
    fn fill_sensor(&mut self) -> Result<()> {
        while let Some(index) = self.bayer.get_index_for_sensor_enqueue() {
            self.enqueue_sensor(index)?;
        }
        Ok(())
    }

    fn enqueue_sensor(&mut self, index: usize) -> Result<()> {
        let shot = match self.pending_shot.take() {
            Some(shot) => shot,
            None => self.next_shot(),
        };
        if let Err(err) = self.bayer.set_shot(index, shot.clone()) {
            self.pending_shot = Some(shot);
            return Err(err);
        }
        if let Err(err) = self.sensor.queue(index, Some(&shot)) {
            // The request stays bound; the same shot goes out on the next attempt.
            self.pending_shot = Some(shot);
            return Err(err);
        }
        self.bayer.mark_sensor_enqueue(index)
    }

    /// Bind the next registered request, or build a bubble.
    fn next_shot(&mut self) -> Shot {
        let Some(processed) = self.shared.requests.mark_processing_request() else {
            return Shot::bubble();
        };
        let listener = Arc::clone(&self.shared.listener);
        if let Some(mode) = processed.af_mode {
            self.af.set_mode(mode, listener.as_ref());
        }
        let command = self.af.take_command(processed.frame_count);
        Shot {
            af_mode: command.mode,
            af_trigger: command.trigger,
            ..processed.shot
        }
    }

    fn apply_af(&mut self, request: AfRequest) {
        let listener = Arc::clone(&self.shared.listener);
        debug!(?request, "af request");
        match request {
            AfRequest::Trigger(id) => self.af.on_trigger(id, listener.as_ref()),
            AfRequest::Cancel(id) => self.af.on_cancel(id, listener.as_ref()),
            AfRequest::SetMode(mode) => self.af.set_mode(mode, listener.as_ref()),
        }
    }

    fn has_work(&self) -> bool {
        let counts = self.bayer.counts();
        self.shared.requests.has_pending_work() || counts.on_hal_filled > 0 || counts.on_isp > 0
    }

    /// Raw ring and request table invariants, checked after every cycle.
    fn check_bookkeeping(&self) -> Result<()> {
        validate_bayer_counts(&self.bayer)?;
        validate_request_table(&self.shared.requests)
    }
}

/// Sender half of the sensor-to-ISP-thread hand-off.
struct IspLink {
    completions: Sender<IspCompletion>,
    thread: Signaller,
}

impl IspLink {
    fn send(&self, completion: IspCompletion) {
        if self.completions.send(completion).is_ok() {
            self.thread.set_signal(SIGNAL_ISP_FRAME_DONE);
        } else {
            warn!(frame_count = completion.frame_count, "isp thread gone");
        }
    }
}

struct SensorHandler {
    stage: SensorStage,
    me: Signaller,
    main: Signaller,
    isp_thread: IspLink,
    af_requests: Receiver<AfRequest>,
    failures: u32,
}

impl SensorHandler {
    fn drain_af_requests(&mut self) {
        while let Ok(request) = self.af_requests.try_recv() {
            self.stage.apply_af(request);
        }
    }

    fn process(&mut self) {
        match self.stage.run_cycle(&self.main, &self.isp_thread) {
            Ok(()) => self.failures = 0,
            Err(err) => {
                self.failures += 1;
                self.stage.shared.report(&err);
            }
        }
        if let Err(err) = self.stage.fill_sensor() {
            self.failures += 1;
            self.stage.shared.report(&err);
        }
        if let Err(err) = self.stage.check_bookkeeping() {
            self.stage.shared.report(&err);
        }

        if self.stage.has_work() {
            let delay = retry_backoff(self.failures);
            if !delay.is_zero() {
                warn!(failures = self.failures, ?delay, "sensor cycle keeps failing, backing off");
                thread::sleep(delay);
            }
            self.me.set_signal(SIGNAL_SENSOR_PROCESS);
        }
    }
}

impl SignalHandler for SensorHandler {
    fn on_signal(&mut self, signals: u32) {
        if signals & (SIGNAL_SENSOR_AF_COMMAND | SIGNAL_SENSOR_PROCESS) != 0 {
            self.drain_af_requests();
        }
        if signals & SIGNAL_SENSOR_PROCESS != 0 {
            self.process();
        }
    }

    fn on_release(&mut self) {
        for node in [&mut self.stage.sensor, &mut self.stage.isp] {
            if let Err(err) = node.stream_off() {
                warn!(%err, "stream off failed");
            }
        }
        let counts = self.stage.bayer.counts();
        info!(?counts, "sensor stage released");
    }
}

struct StreamRoute {
    id: u8,
    tickets: Sender<StreamTicket>,
    thread: Signaller,
}

struct IspHandler {
    shared: Arc<Shared>,
    completions: Receiver<IspCompletion>,
    routes: Vec<StreamRoute>,
}

impl SignalHandler for IspHandler {
    fn on_signal(&mut self, signals: u32) {
        if signals & SIGNAL_ISP_FRAME_DONE == 0 {
            return;
        }
        while let Ok(completion) = self.completions.try_recv() {
            for id in completion.output_streams.iter() {
                let ticket = StreamTicket {
                    frame_count: completion.frame_count,
                    timestamp: completion.timestamp,
                };
                let sent = self
                    .routes
                    .iter()
                    .find(|route| route.id == id)
                    .is_some_and(|route| {
                        let ok = route.tickets.send(ticket).is_ok();
                        if ok {
                            route.thread.set_signal(SIGNAL_STREAM_DATA_READY);
                        }
                        ok
                    });
                if !sent {
                    warn!(frame_count = completion.frame_count, stream = id, "no route for stream");
                    self.shared
                        .requests
                        .notify_stream_output(completion.frame_count, id, false);
                }
            }
        }
    }
}

struct StreamHandler {
    id: u8,
    shared: Arc<Shared>,
    main: Signaller,
    node: Box<dyn VideoNode>,
    buffers: Box<dyn GraphicBufferQueue>,
    converter: Option<Box<dyn FormatConverter>>,
    scaler_format: Format,
    app_format: Format,
    tickets: Receiver<StreamTicket>,
    /// Scaler buffers dequeued but not yet handed back, oldest first.
    held: VecDeque<usize>,
    credits: Arc<ScalerCredits>,
}

impl StreamHandler {
    fn requeue_held(&mut self) -> Result<()> {
        while let Some(&index) = self.held.front() {
            self.node.queue(index, None)?;
            self.held.pop_front();
            self.credits.release();
        }
        Ok(())
    }

    /// Dequeue scaler output for `frame_count`, recycling older frames left
    /// behind by earlier failures.
    fn dequeue_scaler(&mut self, frame_count: u32) -> Result<Dequeued> {
        loop {
            let done = self.node.dequeue()?;
            match done.metadata.as_ref().and_then(|m| m.frame_count) {
                Some(older) if older < frame_count => {
                    warn!(stream = self.id, older, frame_count, "dropping stale scaler frame");
                    self.held.push_back(done.index);
                    self.requeue_held()?;
                }
                _ => return Ok(done),
            }
        }
    }

    fn deliver(&mut self, ticket: StreamTicket) -> Result<()> {
        let done = self.dequeue_scaler(ticket.frame_count)?;
        self.held.push_back(done.index);
        let delivered = self.fill_app_buffer(done.index, ticket.timestamp);
        let requeued = self.requeue_held();
        delivered.and(requeued)
    }

    fn fill_app_buffer(&mut self, index: usize, timestamp: Duration) -> Result<()> {
        let handle = self
            .buffers
            .dequeue_buffer()
            .ok_or(CameraError::NoBuffer { stream: self.id })?;
        match self.write_app_buffer(index, handle) {
            Ok(()) => self.buffers.enqueue_buffer(handle, timestamp),
            Err(err) => {
                if let Err(cancel) = self.buffers.cancel_buffer(handle) {
                    warn!(stream = self.id, %cancel, "cancel buffer failed");
                }
                Err(err)
            }
        }
    }

    fn write_app_buffer(&mut self, index: usize, handle: BufferHandle) -> Result<()> {
        let src = self
            .node
            .buffer(index)
            .ok_or_else(|| CameraError::hardware(self.node.name(), "map", "buffer not mapped"))?;
        let dst = self.buffers.lock(handle)?;
        let written = match self.converter.as_mut() {
            Some(converter) => converter.convert(&self.scaler_format, src, &self.app_format, dst),
            None => copy_plane(self.node.name(), src, dst),
        };
        let unlocked = self.buffers.unlock(handle);
        written.and(unlocked)
    }
}

fn copy_plane(node: &str, src: &[u8], dst: &mut [u8]) -> Result<()> {
    let Some(target) = dst.get_mut(..src.len()) else {
        return Err(CameraError::hardware(
            node,
            "copy",
            format!("application buffer holds {} of {} bytes", dst.len(), src.len()),
        ));
    };
    target.copy_from_slice(src);
    Ok(())
}

impl SignalHandler for StreamHandler {
    fn on_signal(&mut self, signals: u32) {
        if signals & SIGNAL_STREAM_DATA_READY == 0 {
            return;
        }
        if let Err(err) = self.requeue_held() {
            self.shared.report(&err);
        }
        while let Ok(ticket) = self.tickets.try_recv() {
            let outcome = self.deliver(ticket);
            if let Err(err) = &outcome {
                self.shared.report(err);
            }
            if self
                .shared
                .requests
                .notify_stream_output(ticket.frame_count, self.id, outcome.is_ok())
            {
                self.main.set_signal(SIGNAL_MAIN_FRAME_READY);
            }
        }
    }

    fn on_release(&mut self) {
        if let Err(err) = self.node.stream_off() {
            warn!(stream = self.id, %err, "stream off failed");
        }
    }
}

fn prepare_stream(
    config: &PipelineConfig,
    hardware: StreamHardware,
    shared: &Arc<Shared>,
    main: &Signaller,
    tickets: Receiver<StreamTicket>,
    credits: Arc<ScalerCredits>,
) -> Result<StreamHandler> {
    let StreamHardware {
        id,
        mut node,
        buffers,
        converter,
    } = hardware;
    let stream = config
        .stream(id)
        .ok_or_else(|| CameraError::Config(format!("hardware for unconfigured stream {id}")))?;

    let scaler_format = node.set_format(&stream.format)?.normalized();
    let granted = node.request_buffers(stream.buffer_count)?;
    if granted == 0 {
        return Err(CameraError::DeviceOpenFailed(format!(
            "{}: no scaler buffers granted",
            node.name()
        )));
    }
    for index in 0..granted as usize {
        node.queue(index, None)?;
        credits.release();
    }
    node.stream_on()?;

    let converter = match (stream.conversion, converter) {
        (Conversion::Direct, _) => None,
        (Conversion::Indirect { .. }, Some(converter)) => Some(converter),
        (Conversion::Indirect { .. }, None) => {
            Some(Box::new(YuyvToRgbConverter) as Box<dyn FormatConverter>)
        }
    };
    info!(stream = id, kind = ?stream.kind, buffers = granted, "stream configured");

    Ok(StreamHandler {
        id,
        shared: Arc::clone(shared),
        main: main.clone(),
        node,
        buffers,
        converter,
        scaler_format,
        app_format: stream.app_format(),
        tickets,
        held: VecDeque::new(),
        credits,
    })
}

/// Host-facing handle to a running pipeline.
pub struct Pipeline {
    shared: Arc<Shared>,
    main: SignalThread,
    sensor: SignalThread,
    isp: SignalThread,
    streams: Vec<SignalThread>,
    completed: Receiver<CompletedFrame>,
    af_requests: Sender<AfRequest>,
    frame_timeout: Duration,
    released: bool,
}

impl Pipeline {
    /// Configure the hardware, prime the sensor and start every pipeline thread.
    ///
    /// Any failure here is a construction failure; nothing is left running.
    pub fn start(
        config: &PipelineConfig,
        hardware: PipelineHardware,
        listener: Arc<dyn PipelineListener>,
    ) -> Result<Self> {
        config.validate()?;
        for stream in &config.streams {
            if !hardware.streams.iter().any(|h| h.id == stream.id) {
                return Err(CameraError::Config(format!(
                    "no hardware for stream {}",
                    stream.id
                )));
            }
        }

        let shared = Arc::new(Shared {
            requests: RequestManager::new(config.stream_mask()),
            listener,
            stats: StatsCounters::default(),
        });

        let main_signal = Signaller::new("main");
        let sensor_signal = Signaller::new("sensor");
        let isp_signal = Signaller::new("isp");

        let PipelineHardware {
            sensor,
            isp,
            streams,
        } = hardware;

        let mut stream_handlers = Vec::with_capacity(streams.len());
        let mut routes = Vec::with_capacity(streams.len());
        let mut credits = Vec::with_capacity(streams.len());
        for stream in streams {
            let (tickets_tx, tickets_rx) = unbounded();
            let free = Arc::new(ScalerCredits::new(0));
            let handler = prepare_stream(
                config,
                stream,
                &shared,
                &main_signal,
                tickets_rx,
                Arc::clone(&free),
            )?;
            credits.push((handler.id, free));
            let signaller = Signaller::new(&format!("stream-{}", handler.id));
            routes.push(StreamRoute {
                id: handler.id,
                tickets: tickets_tx,
                thread: signaller.clone(),
            });
            stream_handlers.push((signaller, handler));
        }

        let mut stage = SensorStage {
            shared: Arc::clone(&shared),
            sensor,
            isp,
            bayer: BayerBufManager::new(),
            af: AfContext::new(config.af_mode),
            pending_shot: None,
            job: None,
            credits,
            credit_wait: config.frame_timeout(),
        };
        stage.configure(config)?;

        let mut stream_threads = Vec::with_capacity(stream_handlers.len());
        for (signaller, handler) in stream_handlers {
            stream_threads.push(SignalThread::start(signaller, handler)?);
        }

        let (completions_tx, completions_rx) = unbounded();
        let isp_thread = SignalThread::start(
            isp_signal.clone(),
            IspHandler {
                shared: Arc::clone(&shared),
                completions: completions_rx,
                routes,
            },
        )?;

        let (af_tx, af_rx) = unbounded();
        let sensor_thread = SignalThread::start(
            sensor_signal.clone(),
            SensorHandler {
                stage,
                me: sensor_signal.clone(),
                main: main_signal.clone(),
                isp_thread: IspLink {
                    completions: completions_tx,
                    thread: isp_signal,
                },
                af_requests: af_rx,
                failures: 0,
            },
        )?;

        let (completed_tx, completed_rx) = unbounded();
        let main_thread = SignalThread::start(
            main_signal,
            MainHandler {
                shared: Arc::clone(&shared),
                sensor: sensor_signal,
                completed: completed_tx,
            },
        )?;

        info!(streams = stream_threads.len(), af_mode = ?config.af_mode, "pipeline started");
        Ok(Self {
            shared,
            main: main_thread,
            sensor: sensor_thread,
            isp: isp_thread,
            streams: stream_threads,
            completed: completed_rx,
            af_requests: af_tx,
            frame_timeout: config.frame_timeout(),
            released: false,
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.released {
            return Err(CameraError::Released);
        }
        Ok(())
    }

    /// Queue a capture request. Returns the frame count assigned to it.
    pub fn submit_request(&self, request: CaptureRequest) -> Result<u32> {
        self.ensure_running()?;
        let frame_count = self.shared.requests.register_request(request)?;
        self.main.set_signal(SIGNAL_MAIN_REQUEST_AVAILABLE);
        Ok(frame_count)
    }

    /// Whether [`Pipeline::submit_request`] would currently fail with `QueueFull`.
    pub fn is_request_queue_full(&self) -> bool {
        self.shared.requests.is_request_queue_full()
    }

    /// Wait for the next completed frame, up to the configured frame timeout.
    pub fn dequeue_frame(&self) -> Result<CompletedFrame> {
        self.dequeue_frame_timeout(self.frame_timeout)
    }

    /// Wait up to `timeout` for the next completed frame.
    pub fn dequeue_frame_timeout(&self, timeout: Duration) -> Result<CompletedFrame> {
        match self.completed.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(CameraError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(CameraError::Released),
        }
    }

    /// Start an autofocus scan. `id` comes back with the resulting AF state callbacks.
    pub fn trigger_autofocus(&self, id: i32) -> Result<()> {
        self.send_af(AfRequest::Trigger(id))
    }

    /// Abort an autofocus scan.
    pub fn cancel_autofocus(&self, id: i32) -> Result<()> {
        self.send_af(AfRequest::Cancel(id))
    }

    /// Change the autofocus mode.
    pub fn set_af_mode(&self, mode: AfMode) -> Result<()> {
        self.send_af(AfRequest::SetMode(mode))
    }

    fn send_af(&self, request: AfRequest) -> Result<()> {
        self.ensure_running()?;
        self.af_requests
            .send(request)
            .map_err(|_| CameraError::Released)?;
        self.sensor.set_signal(SIGNAL_SENSOR_AF_COMMAND);
        Ok(())
    }

    /// Snapshot of the pipeline counters.
    pub fn stats(&self) -> PipelineStats {
        let stats = &self.shared.stats;
        PipelineStats {
            frames_completed: stats.frames_completed.load(Ordering::Relaxed),
            bubbles: stats.bubbles.load(Ordering::Relaxed),
            hardware_errors: stats.hardware_errors.load(Ordering::Relaxed),
            protocol_violations: stats.protocol_violations.load(Ordering::Relaxed),
        }
    }

    /// Number of requests accepted but not yet handed back.
    pub fn in_flight(&self) -> usize {
        self.shared.requests.num_entries()
    }

    /// Stop every thread, streaming off all nodes. Frames already completed
    /// can still be dequeued afterwards.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        info!("releasing pipeline");
        self.sensor.release();
        self.isp.release();
        for stream in &mut self.streams {
            stream.release();
        }
        self.main.release();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.release();
    }
}

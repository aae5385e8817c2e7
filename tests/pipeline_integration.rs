//! End-to-end pipeline tests on simulated hardware.
//!
//! Every test starts a full pipeline (main, sensor, ISP and stream threads)
//! over `mock::SimulatedHardware`. Tests are serialized so paced runs are not
//! starved of CPU by each other.

use std::sync::Arc;
use std::time::Duration;

use cam_pipeline::af::{AfHwState, AfServiceState};
use cam_pipeline::mock::SimulatedHardware;
use cam_pipeline::validation::{
    validate_color_bars, validate_frame_sequence, validate_timestamps,
};
use cam_pipeline::{
    AfMode, CameraError, CaptureRequest, CompletedFrame, ControlSettings, Pipeline,
    PipelineConfig, PipelineListener, StreamMask, REQUEST_SLOTS,
};
use parking_lot::Mutex;
use serial_test::serial;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Recorder {
    shutters: Mutex<Vec<(u32, Duration)>>,
    af_states: Mutex<Vec<(AfServiceState, i32)>>,
    errors: Mutex<Vec<String>>,
}

impl Recorder {
    fn af_count(&self, state: AfServiceState) -> usize {
        self.af_states
            .lock()
            .iter()
            .filter(|(s, _)| *s == state)
            .count()
    }

    fn af_sequence(&self) -> Vec<AfServiceState> {
        self.af_states.lock().iter().map(|(s, _)| *s).collect()
    }
}

impl PipelineListener for Recorder {
    fn on_shutter(&self, frame_count: u32, timestamp: Duration) {
        self.shutters.lock().push((frame_count, timestamp));
    }

    fn on_af_state(&self, state: AfServiceState, trigger_id: i32) {
        self.af_states.lock().push((state, trigger_id));
    }

    fn on_error(&self, error: &CameraError) {
        self.errors.lock().push(error.to_string());
    }
}

/// Submit `count` requests to every configured stream, keeping the queue
/// topped up, and collect the completed frames.
fn run_frames(pipeline: &Pipeline, outputs: StreamMask, count: u64) -> Vec<CompletedFrame> {
    let mut submitted = 0;
    let mut frames = Vec::new();
    while (frames.len() as u64) < count {
        while submitted < count && !pipeline.is_request_queue_full() {
            pipeline
                .submit_request(CaptureRequest::new(submitted, outputs))
                .expect("submit should succeed");
            submitted += 1;
        }
        frames.push(
            pipeline
                .dequeue_frame_timeout(WAIT)
                .expect("frame should complete"),
        );
    }
    frames
}

#[test]
#[serial]
fn test_many_frames_complete_in_order() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let mut pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");

    let frames = run_frames(&pipeline, config.stream_mask(), 40);

    validate_frame_sequence(&frames).expect("frame counts should increase");
    validate_timestamps(&frames).expect("timestamps should not go backwards");
    for (tag, frame) in frames.iter().enumerate() {
        assert_eq!(frame.request.tag, tag as u64, "requests complete in submission order");
        assert_eq!(frame.result.delivered_streams, config.stream_mask());
        assert!(frame.result.failed_streams.is_empty());
        assert!(frame.result.metadata.exposure_time.is_some());
    }

    for log in rig.deliveries.values() {
        assert_eq!(log.delivered(), 40);
        assert_eq!(log.cancelled(), 0);
    }

    let stats = pipeline.stats();
    assert_eq!(stats.frames_completed, 40);
    assert_eq!(stats.hardware_errors, 0);
    assert_eq!(stats.protocol_violations, 0);
    assert!(stats.bubbles >= 8, "primed ring drains as bubbles");
    assert!(recorder.errors.lock().is_empty());
    assert_eq!(pipeline.in_flight(), 0);

    pipeline.release();
}

#[test]
#[serial]
fn test_one_shutter_per_frame() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");

    let frames = run_frames(&pipeline, StreamMask::single(0), 12);

    let shutters = recorder.shutters.lock().clone();
    for frame in &frames {
        let timestamp = frame.result.timestamp.expect("frame has a timestamp");
        let matching = shutters
            .iter()
            .filter(|(fc, _)| *fc == frame.result.frame_count)
            .collect::<Vec<_>>();
        assert_eq!(matching, vec![&(frame.result.frame_count, timestamp)]);
    }
}

#[test]
#[serial]
fn test_request_queue_full() {
    let config = PipelineConfig::default();
    // Slow sensor: the primed ring alone takes 800ms to drain.
    let sim = SimulatedHardware::new().with_frame_interval(Duration::from_millis(100));
    let rig = sim.build(&config);
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::new(Recorder::default()))
        .expect("pipeline should start");

    for tag in 0..REQUEST_SLOTS as u64 {
        pipeline
            .submit_request(CaptureRequest::new(tag, StreamMask::single(0)))
            .expect("submit should succeed");
    }
    assert!(pipeline.is_request_queue_full());
    let err = pipeline
        .submit_request(CaptureRequest::new(99, StreamMask::single(0)))
        .expect_err("eleventh request should be rejected");
    assert!(matches!(err, CameraError::QueueFull));
    assert!(err.retryable());

    for tag in 0..REQUEST_SLOTS as u64 {
        let frame = pipeline
            .dequeue_frame_timeout(WAIT)
            .expect("frame should complete");
        assert_eq!(frame.request.tag, tag);
    }
    assert!(!pipeline.is_request_queue_full());
    pipeline
        .submit_request(CaptureRequest::new(10, StreamMask::single(0)))
        .expect("slots free again after completion");
}

#[test]
#[serial]
fn test_autofocus_trigger_locks_once() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");

    pipeline.trigger_autofocus(5).expect("trigger should be accepted");
    let frames = run_frames(&pipeline, StreamMask::single(0), 8);

    assert_eq!(recorder.af_count(AfServiceState::ActiveScan), 1);
    assert_eq!(recorder.af_count(AfServiceState::FocusedLocked), 1);
    assert!(recorder
        .af_states
        .lock()
        .iter()
        .all(|(_, id)| *id == 5));

    let last = frames.last().expect("frames collected");
    assert_eq!(last.result.metadata.af_state, AfHwState::AcquiredFocus);
}

#[test]
#[serial]
fn test_autofocus_failure_reports_not_focused() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    sim.set_af_outcome(AfHwState::FailedFocus);
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");

    pipeline.trigger_autofocus(11).expect("trigger should be accepted");
    run_frames(&pipeline, StreamMask::single(0), 8);

    assert_eq!(recorder.af_count(AfServiceState::NotFocusedLocked), 1);
    assert_eq!(recorder.af_count(AfServiceState::FocusedLocked), 0);
}

#[test]
#[serial]
fn test_scaler_failure_fails_stream_not_request() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    sim.fail_next("scaler0", "dequeue");
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");

    let frames = run_frames(&pipeline, config.stream_mask(), 4);

    let first = frames.first().expect("frames collected");
    assert_eq!(first.result.failed_streams, StreamMask::single(0));
    assert_eq!(first.result.delivered_streams, StreamMask::single(1));
    for frame in frames.iter().skip(1) {
        assert_eq!(frame.result.delivered_streams, config.stream_mask());
    }
    assert_eq!(recorder.errors.lock().len(), 1);
    assert_eq!(pipeline.stats().hardware_errors, 1);
}

#[test]
#[serial]
fn test_sensor_dequeue_failure_recovers() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    sim.fail_next("sensor", "dequeue");
    let rig = sim.build(&config);
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::new(Recorder::default()))
        .expect("pipeline should start");

    let frames = run_frames(&pipeline, StreamMask::single(0), 3);
    validate_frame_sequence(&frames).expect("frames complete after a transient failure");
    assert_eq!(pipeline.stats().hardware_errors, 1);
}

#[test]
#[serial]
fn test_repeated_sensor_faults_keep_retrying() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    for _ in 0..4 {
        sim.fail_next("sensor", "dequeue");
    }
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");

    pipeline
        .submit_request(CaptureRequest::new(0, StreamMask::single(0)))
        .expect("submit should succeed");
    let frame = pipeline
        .dequeue_frame_timeout(WAIT)
        .expect("sensor keeps retrying without a new request");
    assert_eq!(frame.request.tag, 0);
    assert_eq!(frame.result.delivered_streams, StreamMask::single(0));

    let stats = pipeline.stats();
    assert_eq!(stats.hardware_errors, 4);
    assert_eq!(stats.protocol_violations, 0);
    assert_eq!(recorder.errors.lock().len(), 4);
}

#[test]
#[serial]
fn test_full_scaler_fails_output_instead_of_overrunning() {
    let config = PipelineConfig {
        frame_timeout_ms: 150,
        ..PipelineConfig::default()
    };
    let sim = SimulatedHardware::new();
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");
    // Stream 1 never gets its two scaler buffers back.
    for _ in 0..20 {
        sim.fail_next("scaler1", "queue");
    }

    let frames = run_frames(&pipeline, StreamMask::single(1), 3);

    for frame in &frames {
        assert_eq!(frame.result.failed_streams, StreamMask::single(1));
    }
    assert!(recorder
        .errors
        .lock()
        .iter()
        .any(|e| e.contains("no buffer available for stream 1")));
    assert_eq!(rig.deliveries.get(&1).map(|log| log.delivered()), Some(2));
    assert_eq!(pipeline.stats().protocol_violations, 0);
}

#[test]
#[serial]
fn test_request_af_mode_keeps_pending_trigger() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");

    pipeline.trigger_autofocus(5).expect("trigger should be accepted");
    let mut frames = Vec::new();
    for tag in 0..8 {
        let request = CaptureRequest {
            controls: ControlSettings {
                af_mode: Some(AfMode::Auto),
                ..ControlSettings::default()
            },
            ..CaptureRequest::new(tag, StreamMask::single(0))
        };
        pipeline.submit_request(request).expect("submit should succeed");
        frames.push(
            pipeline
                .dequeue_frame_timeout(WAIT)
                .expect("frame should complete"),
        );
    }

    assert_eq!(recorder.af_count(AfServiceState::ActiveScan), 1);
    assert_eq!(recorder.af_count(AfServiceState::FocusedLocked), 1);
    assert_eq!(recorder.af_count(AfServiceState::Inactive), 0);
    let last = frames.last().expect("frames collected");
    assert_eq!(last.result.metadata.af_state, AfHwState::AcquiredFocus);
}

#[test]
#[serial]
fn test_continuous_picture_cancel_restarts_scan() {
    let config = PipelineConfig {
        af_mode: AfMode::ContinuousPicture,
        ..PipelineConfig::default()
    };
    let sim = SimulatedHardware::new();
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");

    run_frames(&pipeline, StreamMask::single(0), 6);
    assert_eq!(
        recorder.af_sequence(),
        vec![AfServiceState::PassiveScan, AfServiceState::PassiveFocused]
    );

    pipeline.cancel_autofocus(3).expect("cancel should be accepted");
    let frames = run_frames(&pipeline, StreamMask::single(0), 6);

    assert_eq!(
        recorder.af_sequence(),
        vec![
            AfServiceState::PassiveScan,
            AfServiceState::PassiveFocused,
            AfServiceState::Inactive,
            AfServiceState::PassiveScan,
            AfServiceState::PassiveFocused,
        ]
    );
    let last = frames.last().expect("frames collected");
    assert_eq!(last.result.metadata.af_state, AfHwState::AcquiredFocus);
}

#[test]
#[serial]
fn test_af_mode_changes_during_update_keep_latest() {
    let config = PipelineConfig::default();
    // Paced so the first mode command is still in flight when the changes land.
    let sim = SimulatedHardware::new().with_frame_interval(Duration::from_millis(30));
    let rig = sim.build(&config);
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::<Recorder>::clone(&recorder))
        .expect("pipeline should start");

    pipeline
        .submit_request(CaptureRequest::new(100, StreamMask::single(0)))
        .expect("submit should succeed");
    std::thread::sleep(Duration::from_millis(100));
    pipeline.set_af_mode(AfMode::Macro).expect("mode change accepted");
    pipeline
        .set_af_mode(AfMode::ContinuousVideo)
        .expect("mode change accepted");

    let frames = run_frames(&pipeline, StreamMask::single(0), 16);

    assert_eq!(recorder.af_count(AfServiceState::PassiveScan), 1);
    assert_eq!(recorder.af_count(AfServiceState::PassiveFocused), 1);
    assert_eq!(recorder.af_count(AfServiceState::ActiveScan), 0);
    let last = frames.last().expect("frames collected");
    assert_eq!(last.result.metadata.af_state, AfHwState::AcquiredFocus);
}

#[test]
#[serial]
fn test_indirect_stream_delivers_converted_color_bars() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    let rig = sim.build(&config);
    let pipeline = Pipeline::start(&config, rig.hardware, Arc::new(Recorder::default()))
        .expect("pipeline should start");

    run_frames(&pipeline, config.stream_mask(), 3);

    for stream in &config.streams {
        let frame = rig
            .deliveries
            .get(&stream.id)
            .and_then(|log| log.last_frame())
            .expect("stream delivered a frame");
        validate_color_bars(&frame, &stream.app_format())
            .expect("delivered buffer should hold color bars");
    }
}

#[test]
#[serial]
fn test_release_rejects_new_requests() {
    let config = PipelineConfig::default();
    let sim = SimulatedHardware::new();
    let rig = sim.build(&config);
    let mut pipeline = Pipeline::start(&config, rig.hardware, Arc::new(Recorder::default()))
        .expect("pipeline should start");

    run_frames(&pipeline, StreamMask::single(1), 2);
    pipeline.release();
    pipeline.release();

    assert!(matches!(
        pipeline.submit_request(CaptureRequest::new(3, StreamMask::single(1))),
        Err(CameraError::Released)
    ));
    assert!(matches!(
        pipeline.trigger_autofocus(1),
        Err(CameraError::Released)
    ));
    assert!(matches!(
        pipeline.dequeue_frame_timeout(Duration::from_millis(50)),
        Err(CameraError::Released | CameraError::Timeout)
    ));
}

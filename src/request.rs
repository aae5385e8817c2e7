//! In-flight capture request table.
//!
//! A fixed ring of [`REQUEST_SLOTS`] entries. Each entry moves strictly through
//! `Empty -> Registered -> Requested -> Captured -> Empty`:
//!
//! * `register_request` fills the next ring slot (insertion cursor),
//! * `mark_processing_request` binds the next registered slot to a raw buffer
//!   (processing cursor) and produces the hardware shot,
//! * `find_frame_cnt` matches a hardware completion back to its slot,
//! * `prepare_frame`/`deregister_request` hand finished slots back to the host
//!   in completion order.
//!
//! All mutation happens under one mutex; callers never hold it across a
//! hardware call.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::af::AfMode;
use crate::traits::{
    AaMode, AeMode, AwbMode, CameraError, CaptureRequest, DynamicMetadata, FrameResult, Result,
    Shot, StreamMask,
};

/// Number of request slots.
pub const REQUEST_SLOTS: usize = 10;

/// Lifecycle of a request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Free.
    Empty,
    /// Accepted from the application, waiting for a raw buffer.
    Registered,
    /// Bound to a raw buffer on its way through hardware.
    Requested,
    /// Hardware completion matched; waiting for outputs and the host.
    Captured,
}

/// A registered request bound to a raw buffer by [`RequestManager::mark_processing_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRequest {
    /// Slot index.
    pub slot: usize,
    /// Frame count the request was registered under.
    pub frame_count: u32,
    /// Shot to send to hardware.
    pub shot: Shot,
    /// AF mode the request asks for, if any.
    pub af_mode: Option<AfMode>,
}

#[derive(Debug, Clone)]
struct RequestEntry {
    status: RequestStatus,
    original: Option<CaptureRequest>,
    frame_count: u32,
    output_streams: StreamMask,
    output_stream_count: u32,
    delivered: StreamMask,
    failed: StreamMask,
    metadata: DynamicMetadata,
    dynamic_metadata_valid: bool,
    timestamp: Option<Duration>,
    completion_queued: bool,
}

impl RequestEntry {
    fn empty() -> Self {
        Self {
            status: RequestStatus::Empty,
            original: None,
            frame_count: 0,
            output_streams: StreamMask::EMPTY,
            output_stream_count: 0,
            delivered: StreamMask::EMPTY,
            failed: StreamMask::EMPTY,
            metadata: DynamicMetadata::default(),
            dynamic_metadata_valid: false,
            timestamp: None,
            completion_queued: false,
        }
    }
}

/// Mode values last written to hardware, used to suppress redundant resets.
#[derive(Debug, Default)]
struct LastSent {
    ae_mode: Option<AeMode>,
    awb_mode: Option<AwbMode>,
    ae_compensation: Option<i32>,
    aa_mode: Option<AaMode>,
}

fn changed<T: Copy + PartialEq>(last: &mut Option<T>, value: T) -> Option<T> {
    if *last == Some(value) {
        None
    } else {
        *last = Some(value);
        Some(value)
    }
}

#[derive(Debug)]
struct Table {
    entries: Vec<RequestEntry>,
    num_entries: usize,
    insertion: usize,
    processing: usize,
    completed: VecDeque<usize>,
    next_frame_count: u32,
    last_sent: LastSent,
    configured_streams: StreamMask,
}

impl Table {
    const fn next_index(index: usize) -> usize {
        (index + 1) % REQUEST_SLOTS
    }

    fn status(&self, index: usize) -> RequestStatus {
        self.entries
            .get(index)
            .map_or(RequestStatus::Empty, |e| e.status)
    }

    fn find(&self, status: RequestStatus, frame_count: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.status == status && e.frame_count == frame_count)
    }

    fn check_completed(&mut self, index: usize) -> bool {
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        if entry.status != RequestStatus::Captured
            || !entry.dynamic_metadata_valid
            || entry.output_stream_count != 0
            || entry.completion_queued
        {
            return false;
        }
        entry.completion_queued = true;
        self.completed.push_back(index);
        debug!(slot = index, frame_count = entry.frame_count, "request completed");
        true
    }
}

/// Owner of the request table.
#[derive(Debug)]
pub struct RequestManager {
    table: Mutex<Table>,
}

impl RequestManager {
    /// Create an empty table. Requested outputs outside `configured_streams` are ignored.
    pub fn new(configured_streams: StreamMask) -> Self {
        Self {
            table: Mutex::new(Table {
                entries: vec![RequestEntry::empty(); REQUEST_SLOTS],
                num_entries: 0,
                insertion: REQUEST_SLOTS - 1,
                processing: REQUEST_SLOTS - 1,
                completed: VecDeque::new(),
                next_frame_count: 1,
                last_sent: LastSent::default(),
                configured_streams,
            }),
        }
    }

    /// Number of non-empty slots.
    pub fn num_entries(&self) -> usize {
        self.table.lock().num_entries
    }

    /// Whether the next registration would be rejected.
    pub fn is_request_queue_full(&self) -> bool {
        let table = self.table.lock();
        table.num_entries >= REQUEST_SLOTS
            || table.status(Table::next_index(table.insertion)) != RequestStatus::Empty
    }

    /// Whether any slot is still waiting for, or travelling through, hardware.
    pub fn has_pending_work(&self) -> bool {
        self.table.lock().entries.iter().any(|e| {
            matches!(
                e.status,
                RequestStatus::Registered | RequestStatus::Requested
            )
        })
    }

    /// Status of every slot with its frame count, in slot order.
    pub fn snapshot(&self) -> Vec<(RequestStatus, u32)> {
        self.table
            .lock()
            .entries
            .iter()
            .map(|e| (e.status, e.frame_count))
            .collect()
    }

    /// Accept a request into the next ring slot. Returns its frame count.
    pub fn register_request(&self, request: CaptureRequest) -> Result<u32> {
        let mut table = self.table.lock();
        let index = Table::next_index(table.insertion);
        if table.num_entries >= REQUEST_SLOTS || table.status(index) != RequestStatus::Empty {
            debug!(slot = index, entries = table.num_entries, "request queue full");
            return Err(CameraError::QueueFull);
        }

        let requested = request.output_streams;
        let output_streams = requested.intersection(table.configured_streams);
        if output_streams != requested {
            warn!(
                requested = requested.0,
                configured = table.configured_streams.0,
                "request names unconfigured streams"
            );
        }

        let frame_count = table.next_frame_count;
        table.next_frame_count = table.next_frame_count.wrapping_add(1).max(1);

        let entry = RequestEntry {
            status: RequestStatus::Registered,
            original: Some(request),
            frame_count,
            output_streams,
            output_stream_count: output_streams.count(),
            ..RequestEntry::empty()
        };
        if let Some(slot) = table.entries.get_mut(index) {
            *slot = entry;
        }
        table.insertion = index;
        table.num_entries += 1;
        debug!(slot = index, frame_count, "request registered");
        Ok(frame_count)
    }

    /// Bind the next registered request to a raw buffer.
    ///
    /// Returns `None` (a bubble) when no registered request is waiting; the
    /// table is left untouched in that case.
    pub fn mark_processing_request(&self) -> Option<ProcessedRequest> {
        let mut table = self.table.lock();
        if table.num_entries == 0 {
            return None;
        }
        if table.processing == table.insertion
            && matches!(
                table.status(table.processing),
                RequestStatus::Requested | RequestStatus::Captured
            )
        {
            return None;
        }
        let index = Table::next_index(table.processing);
        if table.status(index) != RequestStatus::Registered {
            return None;
        }

        let Table {
            entries, last_sent, ..
        } = &mut *table;
        let entry = entries.get_mut(index)?;
        let controls = entry.original.as_ref()?.controls.clone();
        let shot = Shot {
            frame_count: Some(entry.frame_count),
            exposure_time: controls.exposure_time,
            sensitivity: controls.sensitivity,
            ae_mode: changed(&mut last_sent.ae_mode, controls.ae_mode),
            awb_mode: changed(&mut last_sent.awb_mode, controls.awb_mode),
            ae_compensation: changed(&mut last_sent.ae_compensation, controls.ae_compensation),
            aa_mode: changed(&mut last_sent.aa_mode, controls.aa_mode),
            output_streams: entry.output_streams,
            ..Shot::default()
        };
        entry.status = RequestStatus::Requested;
        let frame_count = entry.frame_count;
        table.processing = index;
        debug!(slot = index, frame_count, "request bound to raw buffer");

        Some(ProcessedRequest {
            slot: index,
            frame_count,
            shot,
            af_mode: controls.af_mode,
        })
    }

    /// Match a hardware completion to its requested slot and mark it captured.
    pub fn find_frame_cnt(&self, frame_count: u32) -> Option<u32> {
        let mut table = self.table.lock();
        let index = table.find(RequestStatus::Requested, frame_count)?;
        if let Some(entry) = table.entries.get_mut(index) {
            entry.status = RequestStatus::Captured;
        }
        Some(frame_count)
    }

    /// Record the capture timestamp. Only the first timestamp for a frame sticks.
    pub fn register_timestamp(&self, frame_count: u32, timestamp: Duration) -> bool {
        let mut table = self.table.lock();
        let Some(index) = table.find(RequestStatus::Captured, frame_count) else {
            return false;
        };
        match table.entries.get_mut(index) {
            Some(entry) if entry.timestamp.is_none() => {
                entry.timestamp = Some(timestamp);
                true
            }
            _ => false,
        }
    }

    /// Merge hardware-reported metadata into the captured slot for
    /// `frame_count`. Returns `true` if this completed the request.
    pub fn apply_dynamic_metadata(&self, frame_count: u32, metadata: &DynamicMetadata) -> bool {
        let mut table = self.table.lock();
        let Some(index) = table.find(RequestStatus::Captured, frame_count) else {
            warn!(frame_count, "metadata for unknown frame");
            return false;
        };
        if let Some(entry) = table.entries.get_mut(index) {
            entry.metadata.merge(metadata);
            entry.metadata.frame_count = Some(frame_count);
            entry.dynamic_metadata_valid = true;
        }
        table.check_completed(index)
    }

    /// Account for one output stream finishing `frame_count`. Returns `true`
    /// if this completed the request.
    pub fn notify_stream_output(&self, frame_count: u32, stream: u8, delivered: bool) -> bool {
        let mut table = self.table.lock();
        let Some(index) = table.find(RequestStatus::Captured, frame_count) else {
            warn!(frame_count, stream, "stream output for unknown frame");
            return false;
        };
        let Some(entry) = table.entries.get_mut(index) else {
            return false;
        };
        let accounted = entry.delivered.contains(stream) || entry.failed.contains(stream);
        if !entry.output_streams.contains(stream) || accounted {
            warn!(frame_count, stream, "unexpected stream output");
            return false;
        }
        if delivered {
            entry.delivered.insert(stream);
        } else {
            entry.failed.insert(stream);
        }
        entry.output_stream_count = entry.output_stream_count.saturating_sub(1);
        table.check_completed(index)
    }

    /// Result for the oldest completed request, without releasing it.
    pub fn prepare_frame(&self) -> Option<FrameResult> {
        let table = self.table.lock();
        let index = *table.completed.front()?;
        let entry = table.entries.get(index)?;
        Some(FrameResult {
            frame_count: entry.frame_count,
            timestamp: entry.timestamp,
            metadata: entry.metadata.clone(),
            delivered_streams: entry.delivered,
            failed_streams: entry.failed,
        })
    }

    /// Release the oldest completed request and hand the original back.
    pub fn deregister_request(&self) -> Result<CaptureRequest> {
        let mut table = self.table.lock();
        let Some(&index) = table.completed.front() else {
            return Err(CameraError::InvalidTransition {
                slot: table.processing,
                detail: "deregister with no completed request".to_owned(),
            });
        };
        let status = table.status(index);
        if status != RequestStatus::Captured {
            error!(slot = index, ?status, "deregistering a slot that is not captured");
            return Err(CameraError::InvalidTransition {
                slot: index,
                detail: format!("deregister from {status:?}"),
            });
        }
        table.completed.pop_front();
        let original = table
            .entries
            .get_mut(index)
            .and_then(|entry| std::mem::replace(entry, RequestEntry::empty()).original);
        table.num_entries -= 1;
        original.ok_or_else(|| CameraError::InvalidTransition {
            slot: index,
            detail: "captured slot without request".to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::af::AfHwState;
    use crate::traits::ControlSettings;

    const STREAMS: StreamMask = StreamMask(0b11);

    fn request(tag: u64) -> CaptureRequest {
        CaptureRequest::new(tag, StreamMask::single(0))
    }

    fn complete(manager: &RequestManager, frame_count: u32) {
        assert_eq!(manager.find_frame_cnt(frame_count), Some(frame_count));
        manager.apply_dynamic_metadata(frame_count, &DynamicMetadata::default());
        assert!(manager.notify_stream_output(frame_count, 0, true));
    }

    fn assert_unique_requested(manager: &RequestManager) {
        let requested: Vec<u32> = manager
            .snapshot()
            .into_iter()
            .filter(|(s, _)| *s == RequestStatus::Requested)
            .map(|(_, fc)| fc)
            .collect();
        let mut deduped = requested.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), requested.len());
    }

    #[test]
    fn test_register_until_full() {
        let manager = RequestManager::new(STREAMS);
        for tag in 0..REQUEST_SLOTS as u64 {
            assert!(!manager.is_request_queue_full());
            manager.register_request(request(tag)).expect("slot available");
        }
        assert!(manager.is_request_queue_full());
        assert!(matches!(
            manager.register_request(request(99)),
            Err(CameraError::QueueFull)
        ));
        assert_eq!(manager.num_entries(), REQUEST_SLOTS);

        let processed = manager.mark_processing_request().expect("registered request");
        let frame_count = processed.shot.frame_count.expect("bound request");
        complete(&manager, frame_count);
        assert!(manager.prepare_frame().is_some());
        let original = manager.deregister_request().expect("captured slot");
        assert_eq!(original.tag, 0);

        assert!(!manager.is_request_queue_full());
        manager.register_request(request(10)).expect("slot freed");
    }

    #[test]
    fn test_underrun_returns_bubble_without_change() {
        let manager = RequestManager::new(STREAMS);
        let before = manager.snapshot();
        assert!(manager.mark_processing_request().is_none());
        assert_eq!(manager.snapshot(), before);

        let frame_count = manager.register_request(request(1)).expect("slot available");
        assert!(manager.mark_processing_request().is_some());
        let before = manager.snapshot();
        assert!(manager.mark_processing_request().is_none());
        assert_eq!(manager.snapshot(), before);
        assert_eq!(manager.find_frame_cnt(frame_count), Some(frame_count));
    }

    #[test]
    fn test_find_frame_cnt_only_matches_requested() {
        let manager = RequestManager::new(STREAMS);
        let frame_count = manager.register_request(request(1)).expect("slot available");
        assert_eq!(manager.find_frame_cnt(frame_count), None);

        manager.mark_processing_request().expect("registered request");
        assert_eq!(manager.find_frame_cnt(frame_count + 100), None);
        assert_eq!(manager.find_frame_cnt(frame_count), Some(frame_count));
        assert_eq!(manager.find_frame_cnt(frame_count), None);
    }

    #[test]
    fn test_stateful_mode_diff() {
        let manager = RequestManager::new(STREAMS);
        let controls = ControlSettings {
            ae_compensation: 2,
            ..ControlSettings::default()
        };
        manager
            .register_request(request(1).with_controls(controls.clone()))
            .expect("slot available");
        manager
            .register_request(request(2).with_controls(controls.clone()))
            .expect("slot available");
        manager
            .register_request(request(3).with_controls(ControlSettings {
                awb_mode: AwbMode::Daylight,
                ..controls
            }))
            .expect("slot available");

        let first = manager.mark_processing_request().expect("first").shot;
        assert_eq!(first.ae_mode, Some(AeMode::On));
        assert_eq!(first.awb_mode, Some(AwbMode::Auto));
        assert_eq!(first.ae_compensation, Some(2));
        assert_eq!(first.aa_mode, Some(AaMode::Auto));

        let second = manager.mark_processing_request().expect("second").shot;
        assert_eq!(second.ae_mode, None);
        assert_eq!(second.awb_mode, None);
        assert_eq!(second.ae_compensation, None);
        assert_eq!(second.aa_mode, None);

        let third = manager.mark_processing_request().expect("third").shot;
        assert_eq!(third.awb_mode, Some(AwbMode::Daylight));
        assert_eq!(third.ae_mode, None);
    }

    #[test]
    fn test_timestamp_written_once() {
        let manager = RequestManager::new(STREAMS);
        let frame_count = manager.register_request(request(1)).expect("slot available");
        manager.mark_processing_request().expect("registered request");
        manager.find_frame_cnt(frame_count).expect("requested");

        assert!(manager.register_timestamp(frame_count, Duration::from_millis(10)));
        assert!(!manager.register_timestamp(frame_count, Duration::from_millis(20)));

        let metadata = DynamicMetadata {
            sensitivity: Some(800),
            af_state: AfHwState::ActiveScan,
            ..DynamicMetadata::default()
        };
        assert!(!manager.apply_dynamic_metadata(frame_count, &metadata));
        assert!(manager.notify_stream_output(frame_count, 0, true));

        let result = manager.prepare_frame().expect("completed");
        assert_eq!(result.timestamp, Some(Duration::from_millis(10)));
        assert_eq!(result.metadata.sensitivity, Some(800));
        assert_eq!(result.metadata.frame_count, Some(frame_count));
        assert_eq!(result.delivered_streams, StreamMask::single(0));
    }

    #[test]
    fn test_completion_waits_for_all_streams() {
        let manager = RequestManager::new(STREAMS);
        let frame_count = manager
            .register_request(CaptureRequest::new(1, STREAMS))
            .expect("slot available");
        manager.mark_processing_request().expect("registered request");
        manager.find_frame_cnt(frame_count).expect("requested");

        assert!(!manager.notify_stream_output(frame_count, 1, false));
        assert!(!manager.notify_stream_output(frame_count, 1, true));
        assert!(!manager.apply_dynamic_metadata(frame_count, &DynamicMetadata::default()));
        assert!(manager.prepare_frame().is_none());
        assert!(manager.notify_stream_output(frame_count, 0, true));

        let result = manager.prepare_frame().expect("completed");
        assert_eq!(result.delivered_streams, StreamMask::single(0));
        assert_eq!(result.failed_streams, StreamMask::single(1));
    }

    #[test]
    fn test_request_without_outputs_completes_on_metadata() {
        let manager = RequestManager::new(STREAMS);
        let frame_count = manager
            .register_request(CaptureRequest::new(1, StreamMask::single(5)))
            .expect("slot available");
        let processed = manager.mark_processing_request().expect("registered request");
        assert_eq!(processed.shot.output_streams, StreamMask::EMPTY);
        manager.find_frame_cnt(frame_count).expect("requested");
        assert!(manager.apply_dynamic_metadata(frame_count, &DynamicMetadata::default()));
    }

    #[test]
    fn test_deregister_non_captured_is_rejected() {
        let manager = RequestManager::new(STREAMS);
        assert!(manager.deregister_request().is_err());

        manager.register_request(request(1)).expect("slot available");
        manager.mark_processing_request().expect("registered request");
        let before = manager.snapshot();
        assert!(manager.deregister_request().is_err());
        assert_eq!(manager.snapshot(), before);
        assert_eq!(manager.num_entries(), 1);
    }

    #[test]
    fn test_completed_frames_leave_in_completion_order() {
        let manager = RequestManager::new(STREAMS);
        let first = manager.register_request(request(1)).expect("slot available");
        let second = manager.register_request(request(2)).expect("slot available");
        manager.mark_processing_request().expect("first");
        manager.mark_processing_request().expect("second");

        complete(&manager, second);
        complete(&manager, first);

        assert_eq!(manager.prepare_frame().map(|r| r.frame_count), Some(second));
        assert_eq!(manager.deregister_request().expect("captured").tag, 2);
        assert_eq!(manager.prepare_frame().map(|r| r.frame_count), Some(first));
        assert_eq!(manager.deregister_request().expect("captured").tag, 1);
        assert_eq!(manager.num_entries(), 0);
    }

    #[test]
    fn test_requested_frame_counts_unique_over_long_run() {
        let manager = RequestManager::new(STREAMS);
        let mut in_flight = VecDeque::new();
        for tag in 0..200u64 {
            while manager.is_request_queue_full() {
                let frame_count = in_flight.pop_front().expect("something in flight");
                complete(&manager, frame_count);
                manager.deregister_request().expect("captured");
                assert_unique_requested(&manager);
            }
            manager.register_request(request(tag)).expect("slot available");
            if let Some(processed) = manager.mark_processing_request() {
                in_flight.push_back(processed.shot.frame_count.expect("bound request"));
            }
            assert_unique_requested(&manager);
        }
    }
}

//! Raw sensor buffer ring.
//!
//! Buffers travel `OnHalEmpty -> OnSensor -> OnHalFilled -> OnIsp -> OnHalEmpty`.
//! Each transition has its own ring head, and drivers must hand buffers back in
//! ring order. A `mark_*` call whose index is not the expected head, or whose
//! slot is not in the expected prior state, is rejected without touching any
//! state. The manager is owned by the sensor thread and has no lock.

use std::time::Duration;

use tracing::error;

use crate::traits::{CameraError, Result, Shot};

/// Number of raw sensor buffers in the ring.
pub const BAYER_BUFFERS: usize = 8;

/// Where a raw buffer currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BayerStatus {
    /// Free, owned by the host.
    OnHalEmpty,
    /// Queued to the sensor.
    OnSensor,
    /// Filled by the sensor, not yet processed.
    OnHalFilled,
    /// Queued to the ISP.
    OnIsp,
}

/// Buffer counts per status. Always sums to [`BAYER_BUFFERS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BayerCounts {
    /// Free buffers.
    pub on_hal_empty: usize,
    /// Buffers at the sensor.
    pub on_sensor: usize,
    /// Filled, unprocessed buffers.
    pub on_hal_filled: usize,
    /// Buffers at the ISP.
    pub on_isp: usize,
}

impl BayerCounts {
    /// Sum over all states.
    pub const fn total(&self) -> usize {
        self.on_hal_empty + self.on_sensor + self.on_hal_filled + self.on_isp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    SensorEnqueue,
    SensorDequeue,
    IspEnqueue,
    IspDequeue,
}

impl Transition {
    const fn name(self) -> &'static str {
        match self {
            Self::SensorEnqueue => "sensor enqueue",
            Self::SensorDequeue => "sensor dequeue",
            Self::IspEnqueue => "isp enqueue",
            Self::IspDequeue => "isp dequeue",
        }
    }

    const fn from(self) -> BayerStatus {
        match self {
            Self::SensorEnqueue => BayerStatus::OnHalEmpty,
            Self::SensorDequeue => BayerStatus::OnSensor,
            Self::IspEnqueue => BayerStatus::OnHalFilled,
            Self::IspDequeue => BayerStatus::OnIsp,
        }
    }

    const fn to(self) -> BayerStatus {
        match self {
            Self::SensorEnqueue => BayerStatus::OnSensor,
            Self::SensorDequeue => BayerStatus::OnHalFilled,
            Self::IspEnqueue => BayerStatus::OnIsp,
            Self::IspDequeue => BayerStatus::OnHalEmpty,
        }
    }
}

#[derive(Debug, Clone)]
struct BayerSlot {
    status: BayerStatus,
    frame_count: Option<u32>,
    timestamp: Option<Duration>,
    shot: Shot,
}

/// Lifecycle tracker for the raw buffer ring.
#[derive(Debug, Clone)]
pub struct BayerBufManager {
    slots: Vec<BayerSlot>,
    heads: [usize; 4],
}

impl Default for BayerBufManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BayerBufManager {
    /// A ring with every buffer free.
    pub fn new() -> Self {
        let slot = BayerSlot {
            status: BayerStatus::OnHalEmpty,
            frame_count: None,
            timestamp: None,
            shot: Shot::bubble(),
        };
        Self {
            slots: vec![slot; BAYER_BUFFERS],
            heads: [0; 4],
        }
    }

    /// Buffer counts per status.
    pub fn counts(&self) -> BayerCounts {
        let count = |status| self.slots.iter().filter(|s| s.status == status).count();
        BayerCounts {
            on_hal_empty: count(BayerStatus::OnHalEmpty),
            on_sensor: count(BayerStatus::OnSensor),
            on_hal_filled: count(BayerStatus::OnHalFilled),
            on_isp: count(BayerStatus::OnIsp),
        }
    }

    /// Status of buffer `index`.
    pub fn status(&self, index: usize) -> Option<BayerStatus> {
        self.slots.get(index).map(|s| s.status)
    }

    /// Frame count recorded at sensor dequeue, `None` for a bubble.
    pub fn frame_count(&self, index: usize) -> Option<u32> {
        self.slots.get(index).and_then(|s| s.frame_count)
    }

    /// Capture timestamp recorded at sensor dequeue.
    pub fn timestamp(&self, index: usize) -> Option<Duration> {
        self.slots.get(index).and_then(|s| s.timestamp)
    }

    /// Shot attached to buffer `index`.
    pub fn shot(&self, index: usize) -> Option<&Shot> {
        self.slots.get(index).map(|s| &s.shot)
    }

    /// Attach a shot to a free buffer before it goes to the sensor.
    pub fn set_shot(&mut self, index: usize, shot: Shot) -> Result<()> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.status == BayerStatus::OnHalEmpty => {
                slot.shot = shot;
                Ok(())
            }
            _ => Err(CameraError::BufferOrder {
                transition: "attach shot",
                expected: self.head_if(Transition::SensorEnqueue),
                actual: index,
            }),
        }
    }

    /// Next buffer to queue to the sensor, if any is free.
    pub fn get_index_for_sensor_enqueue(&self) -> Option<usize> {
        self.head_if(Transition::SensorEnqueue)
    }

    /// Record that buffer `index` was queued to the sensor.
    pub fn mark_sensor_enqueue(&mut self, index: usize) -> Result<()> {
        self.advance(Transition::SensorEnqueue, index)
    }

    /// Record that the sensor returned buffer `index`.
    pub fn mark_sensor_dequeue(
        &mut self,
        index: usize,
        frame_count: Option<u32>,
        timestamp: Duration,
    ) -> Result<()> {
        self.advance(Transition::SensorDequeue, index)?;
        if let Some(slot) = self.slots.get_mut(index) {
            slot.frame_count = frame_count;
            slot.timestamp = Some(timestamp);
        }
        Ok(())
    }

    /// Next filled buffer to queue to the ISP, with its frame count.
    pub fn get_index_for_isp_enqueue(&self) -> Option<(usize, Option<u32>)> {
        self.head_if(Transition::IspEnqueue)
            .map(|index| (index, self.frame_count(index)))
    }

    /// Record that buffer `index` was queued to the ISP.
    pub fn mark_isp_enqueue(&mut self, index: usize) -> Result<()> {
        self.advance(Transition::IspEnqueue, index)
    }

    /// Buffer the ISP is expected to return next, with its frame count.
    pub fn get_index_for_isp_dequeue(&self) -> Option<(usize, Option<u32>)> {
        self.head_if(Transition::IspDequeue)
            .map(|index| (index, self.frame_count(index)))
    }

    /// Record that the ISP returned buffer `index`; the buffer becomes free.
    pub fn mark_isp_dequeue(&mut self, index: usize) -> Result<()> {
        self.advance(Transition::IspDequeue, index)?;
        if let Some(slot) = self.slots.get_mut(index) {
            slot.frame_count = None;
        }
        Ok(())
    }

    /// Current ring head for each transition: sensor enqueue, sensor dequeue,
    /// ISP enqueue, ISP dequeue.
    pub const fn heads(&self) -> [usize; 4] {
        self.heads
    }

    fn head_if(&self, transition: Transition) -> Option<usize> {
        let head = self.heads[transition as usize];
        self.slots
            .get(head)
            .filter(|s| s.status == transition.from())
            .map(|_| head)
    }

    fn advance(&mut self, transition: Transition, index: usize) -> Result<()> {
        let expected = self.head_if(transition);
        if expected != Some(index) {
            error!(
                transition = transition.name(),
                ?expected,
                index,
                "raw buffer out of ring order"
            );
            return Err(CameraError::BufferOrder {
                transition: transition.name(),
                expected,
                actual: index,
            });
        }
        if let Some(slot) = self.slots.get_mut(index) {
            slot.status = transition.to();
        }
        self.heads[transition as usize] = (index + 1) % BAYER_BUFFERS;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(manager: &mut BayerBufManager, index: usize, frame_count: u32) {
        manager.mark_sensor_enqueue(index).expect("sensor enqueue");
        manager
            .mark_sensor_dequeue(index, Some(frame_count), Duration::from_millis(u64::from(frame_count)))
            .expect("sensor dequeue");
        manager.mark_isp_enqueue(index).expect("isp enqueue");
        manager.mark_isp_dequeue(index).expect("isp dequeue");
    }

    #[test]
    fn test_new_ring_is_empty() {
        let manager = BayerBufManager::new();
        let counts = manager.counts();
        assert_eq!(counts.on_hal_empty, BAYER_BUFFERS);
        assert_eq!(counts.total(), BAYER_BUFFERS);
        assert_eq!(manager.get_index_for_sensor_enqueue(), Some(0));
        assert_eq!(manager.get_index_for_isp_enqueue(), None);
        assert_eq!(manager.get_index_for_isp_dequeue(), None);
    }

    #[test]
    fn test_full_lifecycle_keeps_total() {
        let mut manager = BayerBufManager::new();
        for index in 0..BAYER_BUFFERS {
            manager.mark_sensor_enqueue(index).expect("sensor enqueue");
            assert_eq!(manager.counts().total(), BAYER_BUFFERS);
        }
        assert_eq!(manager.counts().on_sensor, BAYER_BUFFERS);
        assert_eq!(manager.get_index_for_sensor_enqueue(), None);

        manager
            .mark_sensor_dequeue(0, Some(11), Duration::from_millis(5))
            .expect("sensor dequeue");
        assert_eq!(manager.get_index_for_isp_enqueue(), Some((0, Some(11))));
        assert_eq!(manager.timestamp(0), Some(Duration::from_millis(5)));

        manager.mark_isp_enqueue(0).expect("isp enqueue");
        assert_eq!(manager.get_index_for_isp_dequeue(), Some((0, Some(11))));
        manager.mark_isp_dequeue(0).expect("isp dequeue");

        let counts = manager.counts();
        assert_eq!(counts.on_hal_empty, 1);
        assert_eq!(counts.on_sensor, BAYER_BUFFERS - 1);
        assert_eq!(counts.total(), BAYER_BUFFERS);
        assert_eq!(manager.get_index_for_sensor_enqueue(), Some(0));
        assert_eq!(manager.frame_count(0), None);
    }

    #[test]
    fn test_out_of_order_index_rejected() {
        let mut manager = BayerBufManager::new();
        manager.mark_sensor_enqueue(0).expect("sensor enqueue");
        manager.mark_sensor_enqueue(1).expect("sensor enqueue");

        let before = manager.clone();
        let err = manager
            .mark_sensor_dequeue(1, Some(1), Duration::ZERO)
            .expect_err("head is 0");
        assert!(matches!(
            err,
            CameraError::BufferOrder {
                expected: Some(0),
                actual: 1,
                ..
            }
        ));
        assert_eq!(manager.counts(), before.counts());
        assert_eq!(manager.heads(), before.heads());
    }

    #[test]
    fn test_wrong_dequeue_rejected_twice_without_change() {
        let mut manager = BayerBufManager::new();
        manager.mark_sensor_enqueue(0).expect("sensor enqueue");
        manager
            .mark_sensor_dequeue(0, None, Duration::ZERO)
            .expect("sensor dequeue");
        manager.mark_isp_enqueue(0).expect("isp enqueue");

        let counts = manager.counts();
        let heads = manager.heads();
        for _ in 0..2 {
            assert!(manager.mark_isp_dequeue(3).is_err());
            assert_eq!(manager.counts(), counts);
            assert_eq!(manager.heads(), heads);
            assert_eq!(manager.status(0), Some(BayerStatus::OnIsp));
        }
    }

    #[test]
    fn test_wrong_prior_state_rejected() {
        let mut manager = BayerBufManager::new();
        assert!(manager.mark_isp_enqueue(0).is_err());
        assert!(manager.mark_sensor_dequeue(0, None, Duration::ZERO).is_err());
        assert_eq!(manager.counts().on_hal_empty, BAYER_BUFFERS);
    }

    #[test]
    fn test_ring_wraparound_visits_every_slot_in_order() {
        let mut manager = BayerBufManager::new();
        let mut frame_count = 0;
        for _round in 0..3 {
            let mut visited = Vec::new();
            for _ in 0..BAYER_BUFFERS {
                let index = manager
                    .get_index_for_sensor_enqueue()
                    .expect("free buffer available");
                visited.push(index);
                frame_count += 1;
                cycle(&mut manager, index, frame_count);
                assert_eq!(manager.counts().total(), BAYER_BUFFERS);
            }
            assert_eq!(visited, (0..BAYER_BUFFERS).collect::<Vec<_>>());
            assert_eq!(manager.heads(), [0; 4]);
        }
    }

    #[test]
    fn test_set_shot_only_on_free_buffer() {
        let mut manager = BayerBufManager::new();
        let shot = Shot {
            frame_count: Some(4),
            ..Shot::default()
        };
        manager.set_shot(0, shot.clone()).expect("free buffer");
        assert_eq!(manager.shot(0), Some(&shot));

        manager.mark_sensor_enqueue(0).expect("sensor enqueue");
        assert!(manager.set_shot(0, Shot::bubble()).is_err());
        assert_eq!(manager.shot(0), Some(&shot));
    }
}

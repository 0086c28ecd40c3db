//! Slot holding the most recent processed frame and its detections.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ml_core::DetectionBox;
use video_ingest::Frame;

/// Consistent copy of the shared slot. The frame is shared, not cloned.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionSnapshot {
    pub frame: Option<Arc<Frame>>,
    pub boxes: Vec<DetectionBox>,
    pub last_update_ms: Option<u64>,
    /// Bumped on every publish; lets readers skip results they already saw.
    pub generation: u64,
}

#[derive(Default)]
struct Slot {
    frame: Option<Arc<Frame>>,
    boxes: Vec<DetectionBox>,
    last_update_ms: Option<u64>,
    generation: u64,
    busy: bool,
    closed: bool,
}

/// Latest detection result plus the worker's busy flag, under one mutex.
///
/// Frame and boxes are always written together, so a reader never observes a
/// frame paired with another frame's boxes.
#[derive(Clone, Default)]
pub struct SharedDetectionState {
    inner: Arc<Mutex<Slot>>,
}

impl SharedDetectionState {
    /// Empty slot, not busy, open for work.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy out the current frame, boxes and update time under the lock.
    pub fn snapshot(&self) -> DetectionSnapshot {
        let slot = self.lock();
        DetectionSnapshot {
            frame: slot.frame.clone(),
            boxes: slot.boxes.clone(),
            last_update_ms: slot.last_update_ms,
            generation: slot.generation,
        }
    }

    /// Claim the worker. Fails while a detection is in flight or after close.
    pub fn try_begin(&self) -> bool {
        let mut slot = self.lock();
        if slot.busy || slot.closed {
            return false;
        }
        slot.busy = true;
        true
    }

    /// Store a result. `busy` stays set; the worker releases it once every
    /// subscriber has seen the boxes, so deliveries keep publish order.
    ///
    /// Returns `false` (and stores nothing) once the state was closed.
    pub fn publish(&self, frame: Frame, boxes: Vec<DetectionBox>, now_ms: u64) -> bool {
        let mut slot = self.lock();
        if slot.closed {
            return false;
        }
        slot.frame = Some(Arc::new(frame));
        slot.boxes = boxes;
        slot.last_update_ms = Some(now_ms);
        slot.generation = slot.generation.wrapping_add(1);
        true
    }

    /// Clear `busy` so the next frame can be claimed.
    pub fn release(&self) {
        self.lock().busy = false;
    }

    /// Whether a detection currently owns the slot.
    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// Whether [`clear_and_close`](Self::clear_and_close) was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Drop the stored frame and boxes and refuse further work.
    pub fn clear_and_close(&self) {
        let mut slot = self.lock();
        slot.frame = None;
        slot.boxes.clear();
        slot.last_update_ms = None;
        slot.busy = false;
        slot.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: i64) -> Frame {
        Frame::bgr8(vec![0; 12], 2, 2, ts).unwrap()
    }

    #[test]
    fn begin_is_exclusive_until_release() {
        let state = SharedDetectionState::new();
        assert!(state.try_begin());
        assert!(!state.try_begin());
        state.release();
        assert!(state.try_begin());
    }

    #[test]
    fn publish_writes_frame_and_boxes_together() {
        let state = SharedDetectionState::new();
        assert!(state.try_begin());
        let boxes = vec![DetectionBox::new(0, 0, 1, 1, "hot dog", 0.9).unwrap()];
        assert!(state.publish(frame(7), boxes.clone(), 42));

        let snap = state.snapshot();
        assert_eq!(snap.frame.as_deref().map(|f| f.timestamp_ms), Some(7));
        assert_eq!(snap.boxes, boxes);
        assert_eq!(snap.last_update_ms, Some(42));
        assert_eq!(snap.generation, 1);
        assert!(state.is_busy());
        state.release();
        assert!(!state.is_busy());
    }

    #[test]
    fn closed_state_rejects_work_and_results() {
        let state = SharedDetectionState::new();
        assert!(state.try_begin());
        state.clear_and_close();
        assert!(!state.is_busy());
        assert!(!state.try_begin());
        assert!(!state.publish(frame(1), Vec::new(), 5));
        assert_eq!(state.snapshot(), DetectionSnapshot::default());
    }
}

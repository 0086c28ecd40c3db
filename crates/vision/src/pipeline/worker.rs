//! Single-flight detection offload.
//!
//! The capture loop offers frames through [`DetectionWorker::submit`]. Only one
//! detection runs at a time; anything offered meanwhile is dropped rather than
//! queued, so results never lag behind the screen.

use std::{
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};

use ml_core::{DetectionBox, Detector};
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::pipeline::{
    clock::SharedClock, shutdown::ShutdownSignal, state::SharedDetectionState, telemetry,
};

/// Invoked with every published box list, outside the state lock.
///
/// Callbacks run before the worker accepts another frame, so subscribers see
/// results in publish order.
pub type ResultCallback = Arc<dyn Fn(&[DetectionBox]) + Send + Sync>;

#[derive(Clone)]
pub struct DetectionWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    detector: Arc<dyn Detector>,
    state: SharedDetectionState,
    clock: SharedClock,
    shutdown: ShutdownSignal,
    paused: AtomicBool,
    subscribers: RwLock<Vec<ResultCallback>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears `busy` when the detection thread is done, however it exits.
struct BusyGuard<'a> {
    state: &'a SharedDetectionState,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.state.release();
    }
}

impl DetectionWorker {
    pub fn new(
        detector: Arc<dyn Detector>,
        state: SharedDetectionState,
        clock: SharedClock,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                detector,
                state,
                clock,
                shutdown,
                paused: AtomicBool::new(false),
                subscribers: RwLock::new(Vec::new()),
                in_flight: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Offer a frame for detection. Returns `false` without side effects when
    /// a detection is already running, the worker is paused, or shutdown began.
    pub fn submit(&self, frame: Frame) -> bool {
        let inner = &self.inner;
        if inner.shutdown.is_triggered() || inner.paused.load(Ordering::SeqCst) {
            return false;
        }
        if !inner.state.try_begin() {
            return false;
        }

        let job = inner.clone();
        match telemetry::spawn_thread("detection-worker", move || job.run(frame)) {
            Ok(handle) => {
                let mut handles = inner
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                true
            }
            Err(err) => {
                warn!("failed to spawn detection thread: {err}");
                inner.state.release();
                false
            }
        }
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&[DetectionBox]) + Send + Sync + 'static,
    {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.is_busy()
    }

    pub fn state(&self) -> &SharedDetectionState {
        &self.inner.state
    }

    /// Hand over the handles of detection threads that may still be running.
    pub fn take_in_flight(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *handles)
    }
}

impl WorkerInner {
    fn run(&self, frame: Frame) {
        let _busy = BusyGuard { state: &self.state };
        let span = tracing::info_span!(
            "detection.run",
            detector = self.detector.name(),
            timestamp = frame.timestamp_ms,
            boxes = tracing::field::Empty
        );
        let _span_guard = span.enter();

        let started = Instant::now();
        let result = self.detector.detect(&frame);
        metrics::histogram!("vision_detection_seconds").record(started.elapsed().as_secs_f64());

        let boxes = match result {
            Ok(boxes) => boxes,
            Err(err) => {
                warn!("detection failed, frame discarded: {err}");
                metrics::counter!("vision_detection_failures_total").increment(1);
                return;
            }
        };
        span.record("boxes", boxes.len());

        if self.shutdown.is_triggered() {
            debug!("discarding detection result after cancellation");
            return;
        }

        let published = self
            .state
            .publish(frame, boxes.clone(), self.clock.now_ms());
        if !published {
            debug!("detection state closed, result dropped");
            return;
        }
        metrics::counter!("vision_detections_published_total").increment(1);

        let subscribers: Vec<ResultCallback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in subscribers {
            callback(&boxes);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Condvar,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use ml_core::DetectionError;

    use super::*;
    use crate::pipeline::clock::ManualClock;

    /// Blocks every detection until the gate opens.
    struct GatedDetector {
        open: Mutex<bool>,
        cv: Condvar,
        running: AtomicUsize,
        max_running: AtomicUsize,
        calls: AtomicUsize,
        boxes: Vec<DetectionBox>,
    }

    impl GatedDetector {
        fn new(boxes: Vec<DetectionBox>) -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(false),
                cv: Condvar::new(),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                boxes,
            })
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    impl Detector for GatedDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectionBox>, DetectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
            drop(open);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(self.boxes.clone())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectionBox>, DetectionError> {
            Err(DetectionError::Model("boom".into()))
        }
    }

    /// Labels each box with the timestamp of the frame it came from.
    struct StampingDetector;

    impl Detector for StampingDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<DetectionBox>, DetectionError> {
            Ok(vec![
                DetectionBox::new(0, 0, 4, 4, format!("f{}", frame.timestamp_ms), 0.9).unwrap(),
            ])
        }
    }

    fn frame(ts: i64) -> Frame {
        Frame::bgr8(vec![1; 12], 2, 2, ts).unwrap()
    }

    fn worker(detector: Arc<dyn Detector>, clock: Arc<ManualClock>) -> DetectionWorker {
        DetectionWorker::new(
            detector,
            SharedDetectionState::new(),
            clock,
            ShutdownSignal::new(),
        )
    }

    fn join_all(worker: &DetectionWorker) {
        for handle in worker.take_in_flight() {
            handle.join().unwrap();
        }
    }

    #[test]
    fn at_most_one_detection_in_flight() {
        let detector = GatedDetector::new(Vec::new());
        let worker = worker(detector.clone(), Arc::new(ManualClock::new(0)));

        assert!(worker.submit(frame(0)));
        let before = worker.state().snapshot();
        for ts in 1..20 {
            assert!(!worker.submit(frame(ts)));
        }
        assert_eq!(worker.state().snapshot(), before);
        assert!(worker.is_busy());

        detector.open();
        join_all(&worker);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(detector.max_running.load(Ordering::SeqCst), 1);
        assert!(!worker.is_busy());
    }

    #[test]
    fn published_boxes_read_back_unchanged() {
        let boxes = vec![
            DetectionBox::new(10, 20, 110, 220, "hot dog", 0.875).unwrap(),
            DetectionBox::new(-4, 0, 3, 9, "hot dog", 0.35).unwrap(),
        ];
        let detector = GatedDetector::new(boxes.clone());
        detector.open();
        let clock = Arc::new(ManualClock::new(1_234));
        let worker = worker(detector, clock);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        worker.subscribe(move |b| sink.lock().unwrap().push(b.to_vec()));

        assert!(worker.submit(frame(9)));
        join_all(&worker);

        let snap = worker.state().snapshot();
        assert_eq!(snap.boxes, boxes);
        for (stored, original) in snap.boxes.iter().zip(&boxes) {
            assert_eq!(
                stored.confidence().to_bits(),
                original.confidence().to_bits()
            );
        }
        assert_eq!(snap.last_update_ms, Some(1_234));
        assert_eq!(snap.frame.unwrap().timestamp_ms, 9);
        assert_eq!(*seen.lock().unwrap(), vec![boxes]);
    }

    #[test]
    fn failure_clears_busy_and_publishes_nothing() {
        let worker = worker(Arc::new(FailingDetector), Arc::new(ManualClock::new(0)));
        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        worker.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(worker.submit(frame(0)));
        join_all(&worker);
        assert!(!worker.is_busy());
        assert_eq!(worker.state().snapshot().generation, 0);
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert!(worker.submit(frame(1)));
        join_all(&worker);
    }

    #[test]
    fn paused_or_cancelled_worker_rejects_frames() {
        let detector = GatedDetector::new(Vec::new());
        detector.open();
        let shutdown = ShutdownSignal::new();
        let worker = DetectionWorker::new(
            detector.clone(),
            SharedDetectionState::new(),
            Arc::new(ManualClock::new(0)),
            shutdown.clone(),
        );

        worker.set_paused(true);
        assert!(!worker.submit(frame(0)));
        worker.set_paused(false);
        shutdown.trigger();
        assert!(!worker.submit(frame(1)));
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn result_after_cancellation_is_discarded() {
        let detector = GatedDetector::new(vec![
            DetectionBox::new(0, 0, 5, 5, "hot dog", 0.9).unwrap(),
        ]);
        let shutdown = ShutdownSignal::new();
        let worker = DetectionWorker::new(
            detector.clone(),
            SharedDetectionState::new(),
            Arc::new(ManualClock::new(0)),
            shutdown.clone(),
        );

        assert!(worker.submit(frame(0)));
        while detector.running.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        shutdown.trigger();
        detector.open();
        join_all(&worker);

        assert!(worker.state().snapshot().boxes.is_empty());
        assert!(!worker.is_busy());
    }

    #[test]
    fn subscribers_see_results_in_publish_order() {
        let worker = worker(Arc::new(StampingDetector), Arc::new(ManualClock::new(0)));
        let delivered = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = delivered.clone();
        worker.subscribe(move |boxes| {
            let first = sink.lock().unwrap().is_empty();
            if first {
                std::thread::sleep(Duration::from_millis(200));
            }
            sink.lock()
                .unwrap()
                .extend(boxes.iter().map(|b| b.label().to_string()));
        });

        assert!(worker.submit(frame(0)));
        while worker.state().snapshot().generation < 1 {
            std::thread::sleep(Duration::from_millis(1));
        }
        // frame 0 is published but its subscriber is still running
        assert!(!worker.submit(frame(1)));
        assert!(worker.is_busy());
        join_all(&worker);

        assert!(worker.submit(frame(1)));
        join_all(&worker);

        let state_label = worker.state().snapshot().boxes[0].label().to_string();
        assert_eq!(state_label, "f1");
        assert_eq!(*delivered.lock().unwrap(), vec!["f0", "f1"]);
    }
}

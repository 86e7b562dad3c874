//! Worker pool and the face-engine boundary.
//!
//! The heavy computation is behind [`FaceEngine`]. [`analyze`] turns one
//! job payload into an [`Outcome`] using the identification and
//! verification rules; [`WorkerPool`] runs those analyses on a fixed-size
//! rayon pool so the dispatch thread only ever waits on a channel.

pub mod process;

pub use process::ProcessEngine;

use crate::config::WorkerConfig;
use crate::queue::{FaceRect, JobPayload, Outcome};
use crossbeam_channel as channel;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Detection settings passed to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Stricter detection used when faces will be compared afterwards.
    pub for_identification: bool,
    pub threshold: f64,
}

/// Result of comparing two faces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub is_match: bool,
    pub similarity_confidence: f64,
}

/// Which image of a verification pair an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    First,
    Second,
}

impl ImageSlot {
    /// Engines report the failing image as a 0-based index.
    pub fn from_index(index: usize) -> Self {
        if index == 0 {
            ImageSlot::First
        } else {
            ImageSlot::Second
        }
    }
}

impl fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSlot::First => write!(f, "first"),
            ImageSlot::Second => write!(f, "second"),
        }
    }
}

/// Errors raised by a [`FaceEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Multiple faces detected: {quantity}")]
    MultipleFaces { quantity: usize },

    #[error("Features extraction failed on image {index}")]
    FeaturesExtraction { index: usize },

    #[error("Image decode error: {0}")]
    ImageDecode(String),

    #[error("Engine process error: {0}")]
    Process(String),

    #[error("Engine protocol error: {0}")]
    Protocol(String),

    #[error("No face engine configured")]
    Unavailable,
}

/// Errors surfaced by the [`WorkerPool`].
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to build worker pool: {0}")]
    Build(String),
}

/// Face detection and comparison.
///
/// Implementations are shared across worker threads.
pub trait FaceEngine: Send + Sync {
    /// Locate faces in an encoded image.
    ///
    /// Returns [`EngineError::MultipleFaces`] when `params.for_identification`
    /// is set and more than one face is present.
    fn detect(&self, image: &[u8], params: DetectionParams) -> Result<Vec<FaceRect>, EngineError>;

    /// Compare one face from each image.
    fn compare(
        &self,
        first: (&[u8], &FaceRect),
        second: (&[u8], &FaceRect),
    ) -> Result<Comparison, EngineError>;
}

/// Engine used when no engine program is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredEngine;

impl FaceEngine for UnconfiguredEngine {
    fn detect(&self, _image: &[u8], _params: DetectionParams) -> Result<Vec<FaceRect>, EngineError> {
        Err(EngineError::Unavailable)
    }

    fn compare(
        &self,
        _first: (&[u8], &FaceRect),
        _second: (&[u8], &FaceRect),
    ) -> Result<Comparison, EngineError> {
        Err(EngineError::Unavailable)
    }
}

/// Detection thresholds per mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub identify: f64,
    pub verify: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            identify: 0.65,
            verify: 0.7,
        }
    }
}

impl Thresholds {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            identify: config.identify_threshold,
            verify: config.verify_threshold,
        }
    }

    fn params(&self, verification: bool) -> DetectionParams {
        if verification {
            DetectionParams {
                for_identification: true,
                threshold: self.verify,
            }
        } else {
            DetectionParams {
                for_identification: false,
                threshold: self.identify,
            }
        }
    }
}

fn multiple_faces(slot: ImageSlot, quantity: usize) -> Outcome {
    Outcome::failure(format!(
        "Unable to compare faces due multiple faces detected on {slot} image: {quantity}"
    ))
}

fn detect_in(
    engine: &dyn FaceEngine,
    image: &[u8],
    params: DetectionParams,
    slot: ImageSlot,
) -> Result<Result<Vec<FaceRect>, Outcome>, EngineError> {
    match engine.detect(image, params) {
        Ok(faces) => Ok(Ok(faces)),
        Err(EngineError::MultipleFaces { quantity }) => Ok(Err(multiple_faces(slot, quantity))),
        Err(e) => Err(e),
    }
}

/// Run one job payload through the engine.
///
/// Domain failures (no face, multiple faces, failed feature extraction)
/// become [`Outcome::Failure`] with a client-facing detail. Any other
/// engine error is returned as `Err` and must not reach the client verbatim.
///
/// For verification the second image is only examined once the first one
/// has yielded a face.
pub fn analyze(
    engine: &dyn FaceEngine,
    payload: &JobPayload,
    thresholds: &Thresholds,
) -> Result<Outcome, EngineError> {
    let params = thresholds.params(payload.is_verification());

    let first_faces = match detect_in(engine, &payload.primary_image, params, ImageSlot::First)? {
        Ok(faces) => faces,
        Err(failure) => return Ok(failure),
    };

    let Some(second_image) = payload.secondary_image.as_deref() else {
        if first_faces.is_empty() {
            return Ok(Outcome::failure("No faces were found"));
        }
        return Ok(Outcome::Identification { faces: first_faces });
    };

    let Some(first_face) = first_faces.first() else {
        return Ok(Outcome::failure("No faces were found on first image"));
    };

    let second_faces = match detect_in(engine, second_image, params, ImageSlot::Second)? {
        Ok(faces) => faces,
        Err(failure) => return Ok(failure),
    };
    let Some(second_face) = second_faces.first() else {
        return Ok(Outcome::failure("No faces were found on second image"));
    };

    let comparison = match engine.compare(
        (&payload.primary_image, first_face),
        (second_image, second_face),
    ) {
        Ok(comparison) => comparison,
        Err(EngineError::FeaturesExtraction { index }) => {
            return Ok(Outcome::failure(format!(
                "Unable to compare faces due features extraction failed on {} image",
                ImageSlot::from_index(index)
            )));
        }
        Err(e) => return Err(e),
    };

    let mut faces = first_faces;
    faces.extend(second_faces);
    Ok(Outcome::Verification {
        is_match: comparison.is_match,
        confidence: comparison.similarity_confidence,
        faces,
    })
}

/// Result channel of one submission.
pub type Submission = channel::Receiver<Result<Outcome, WorkerError>>;

#[derive(Debug)]
struct PoolState {
    in_flight: usize,
    accepting: bool,
}

#[derive(Debug)]
struct Tracker {
    state: Mutex<PoolState>,
    drained: Condvar,
}

impl Tracker {
    /// Register a unit of work unless the pool stopped accepting.
    fn enter(&self) -> bool {
        let mut state = self.state.lock();
        if !state.accepting {
            return false;
        }
        state.in_flight += 1;
        true
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.drained.notify_all();
        }
    }
}

/// Decrements the in-flight count even if the engine panics.
struct InFlight(Arc<Tracker>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.leave();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fixed-size pool executing [`analyze`] off the dispatch thread.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    engine: Arc<dyn FaceEngine>,
    thresholds: Thresholds,
    tracker: Arc<Tracker>,
}

impl WorkerPool {
    pub fn new(
        engine: Arc<dyn FaceEngine>,
        threads: usize,
        thresholds: Thresholds,
    ) -> Result<Self, WorkerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("face-worker-{i}"))
            .build()
            .map_err(|e| WorkerError::Build(e.to_string()))?;

        tracing::info!(threads = pool.current_num_threads(), "worker_pool_started");

        Ok(Self {
            pool,
            engine,
            thresholds,
            tracker: Arc::new(Tracker {
                state: Mutex::new(PoolState {
                    in_flight: 0,
                    accepting: true,
                }),
                drained: Condvar::new(),
            }),
        })
    }

    pub fn from_config(
        engine: Arc<dyn FaceEngine>,
        config: &WorkerConfig,
    ) -> Result<Self, WorkerError> {
        Self::new(engine, config.pool_size(), Thresholds::from_config(config))
    }

    /// Queue a payload for analysis.
    ///
    /// The returned channel yields exactly one result. After
    /// [`shutdown`](Self::shutdown) it yields [`WorkerError::ShuttingDown`]
    /// immediately.
    pub fn submit(&self, payload: JobPayload) -> Submission {
        let (tx, rx) = channel::bounded(1);
        if !self.tracker.enter() {
            let _ = tx.send(Err(WorkerError::ShuttingDown));
            return rx;
        }

        let guard = InFlight(Arc::clone(&self.tracker));
        let engine = Arc::clone(&self.engine);
        let thresholds = self.thresholds;
        self.pool.spawn(move || {
            let _guard = guard;
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                analyze(engine.as_ref(), &payload, &thresholds)
            }));
            let result = match result {
                Ok(analysis) => analysis.map_err(WorkerError::Engine),
                Err(payload) => Err(WorkerError::Panicked(panic_message(payload.as_ref()))),
            };
            // The dispatcher may have given up on this job already.
            let _ = tx.send(result);
        });
        rx
    }

    /// Number of submissions that have not finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.state.lock().in_flight
    }

    pub fn is_accepting(&self) -> bool {
        self.tracker.state.lock().accepting
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Reject new submissions and wait up to `timeout` for in-flight work.
    ///
    /// Returns `true` when everything drained in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let mut state = self.tracker.state.lock();
        state.accepting = false;
        let result = self
            .tracker
            .drained
            .wait_while_for(&mut state, |s| s.in_flight > 0, timeout);
        let drained = !result.timed_out() || state.in_flight == 0;
        if drained {
            tracing::info!("worker_pool_drained");
        } else {
            tracing::warn!(in_flight = state.in_flight, "worker_pool_drain_timed_out");
        }
        drained
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .field("thresholds", &self.thresholds)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine driven by the image bytes:
    /// `[n, ..]` has `n` faces, `[0xEE, q]` reports `q` faces as multiple,
    /// `[0xBA]` panics, `[0xDE]` cannot be decoded, a second byte of `0xFE`
    /// fails feature extraction during comparison.
    #[derive(Default)]
    struct ScriptedEngine {
        detections: Mutex<Vec<(Vec<u8>, DetectionParams)>>,
    }

    fn rect(i: i32) -> FaceRect {
        FaceRect::from_location([i * 10, i * 10, i * 10 + 5, i * 10 + 5])
    }

    impl FaceEngine for ScriptedEngine {
        fn detect(
            &self,
            image: &[u8],
            params: DetectionParams,
        ) -> Result<Vec<FaceRect>, EngineError> {
            self.detections.lock().push((image.to_vec(), params));
            match image {
                [0xEE, q, ..] => Err(EngineError::MultipleFaces {
                    quantity: usize::from(*q),
                }),
                [0xBA, ..] => panic!("engine blew up"),
                [0xDE, ..] => Err(EngineError::ImageDecode("not an image".into())),
                [n, ..] => Ok((0..i32::from(*n)).map(rect).collect()),
                [] => Ok(Vec::new()),
            }
        }

        fn compare(
            &self,
            first: (&[u8], &FaceRect),
            second: (&[u8], &FaceRect),
        ) -> Result<Comparison, EngineError> {
            if first.0.get(1) == Some(&0xFE) {
                return Err(EngineError::FeaturesExtraction { index: 0 });
            }
            if second.0.get(1) == Some(&0xFE) {
                return Err(EngineError::FeaturesExtraction { index: 1 });
            }
            let is_match = first.0 == second.0;
            Ok(Comparison {
                is_match,
                similarity_confidence: if is_match { 0.93 } else { 0.12 },
            })
        }
    }

    fn run(payload: JobPayload) -> (Result<Outcome, EngineError>, ScriptedEngine) {
        let engine = ScriptedEngine::default();
        let result = analyze(&engine, &payload, &Thresholds::default());
        (result, engine)
    }

    #[test]
    fn test_identify_one_face() {
        let (result, engine) = run(JobPayload::identify(vec![1]));
        assert_eq!(
            result.unwrap(),
            Outcome::Identification {
                faces: vec![rect(0)]
            }
        );
        let detections = engine.detections.lock();
        assert_eq!(
            detections[0].1,
            DetectionParams {
                for_identification: false,
                threshold: 0.65
            }
        );
    }

    #[test]
    fn test_identify_keeps_every_face() {
        let (result, _) = run(JobPayload::identify(vec![3]));
        match result.unwrap() {
            Outcome::Identification { faces } => assert_eq!(faces, vec![rect(0), rect(1), rect(2)]),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_identify_zero_faces() {
        let (result, _) = run(JobPayload::identify(vec![0]));
        assert_eq!(result.unwrap(), Outcome::failure("No faces were found"));
    }

    #[test]
    fn test_identify_multiple_faces_names_first_image() {
        let (result, _) = run(JobPayload::identify(vec![0xEE, 4]));
        assert_eq!(
            result.unwrap(),
            Outcome::failure("Unable to compare faces due multiple faces detected on first image: 4")
        );
    }

    #[test]
    fn test_verify_match_orders_faces_first_then_second() {
        let (result, engine) = run(JobPayload::verify(vec![1, 7], vec![1, 7]));
        assert_eq!(
            result.unwrap(),
            Outcome::Verification {
                is_match: true,
                confidence: 0.93,
                faces: vec![rect(0), rect(0)],
            }
        );
        let detections = engine.detections.lock();
        assert_eq!(detections.len(), 2);
        assert!(detections.iter().all(|(_, p)| *p
            == DetectionParams {
                for_identification: true,
                threshold: 0.7
            }));
    }

    #[test]
    fn test_verify_no_match() {
        let (result, _) = run(JobPayload::verify(vec![1, 1], vec![1, 2]));
        match result.unwrap() {
            Outcome::Verification {
                is_match,
                confidence,
                faces,
            } => {
                assert!(!is_match);
                assert!((confidence - 0.12).abs() < f64::EPSILON);
                assert_eq!(faces.len(), 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_verify_multiple_faces_on_second_image() {
        let (result, engine) = run(JobPayload::verify(vec![1], vec![0xEE, 2]));
        assert_eq!(
            result.unwrap(),
            Outcome::failure(
                "Unable to compare faces due multiple faces detected on second image: 2"
            )
        );
        // Only detection ran; no comparison was attempted.
        assert_eq!(engine.detections.lock().len(), 2);
    }

    #[test]
    fn test_verify_no_face_on_first_skips_second() {
        let (result, engine) = run(JobPayload::verify(vec![0], vec![1]));
        assert_eq!(
            result.unwrap(),
            Outcome::failure("No faces were found on first image")
        );
        assert_eq!(engine.detections.lock().len(), 1);
    }

    #[test]
    fn test_verify_no_face_on_second() {
        let (result, _) = run(JobPayload::verify(vec![1], vec![0]));
        assert_eq!(
            result.unwrap(),
            Outcome::failure("No faces were found on second image")
        );
    }

    #[test]
    fn test_verify_features_extraction_failures() {
        let (result, _) = run(JobPayload::verify(vec![1, 0xFE], vec![1]));
        assert_eq!(
            result.unwrap(),
            Outcome::failure("Unable to compare faces due features extraction failed on first image")
        );
        let (result, _) = run(JobPayload::verify(vec![1], vec![1, 0xFE]));
        assert_eq!(
            result.unwrap(),
            Outcome::failure(
                "Unable to compare faces due features extraction failed on second image"
            )
        );
    }

    #[test]
    fn test_other_engine_errors_propagate() {
        let (result, _) = run(JobPayload::identify(vec![0xDE]));
        assert!(matches!(result, Err(EngineError::ImageDecode(_))));
    }

    #[test]
    fn test_unconfigured_engine_is_unavailable() {
        let result = analyze(
            &UnconfiguredEngine,
            &JobPayload::identify(vec![1]),
            &Thresholds::default(),
        );
        assert!(matches!(result, Err(EngineError::Unavailable)));
    }

    #[test]
    fn test_image_slot_from_index() {
        assert_eq!(ImageSlot::from_index(0), ImageSlot::First);
        assert_eq!(ImageSlot::from_index(1), ImageSlot::Second);
        assert_eq!(ImageSlot::Second.to_string(), "second");
    }

    fn pool(threads: usize) -> WorkerPool {
        WorkerPool::new(
            Arc::new(ScriptedEngine::default()),
            threads,
            Thresholds::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_pool_returns_outcome() {
        let pool = pool(2);
        let result = pool
            .submit(JobPayload::identify(vec![2]))
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(matches!(result, Ok(Outcome::Identification { faces }) if faces.len() == 2));
    }

    #[test]
    fn test_pool_catches_panics() {
        let pool = pool(1);
        let result = pool
            .submit(JobPayload::identify(vec![0xBA]))
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        match result {
            Err(WorkerError::Panicked(message)) => assert!(message.contains("engine blew up")),
            other => panic!("expected panic error, got {other:?}"),
        }
        // The pool keeps working afterwards.
        let result = pool
            .submit(JobPayload::identify(vec![1]))
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_pool_wraps_engine_errors() {
        let pool = pool(1);
        let result = pool
            .submit(JobPayload::identify(vec![0xDE]))
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(matches!(
            result,
            Err(WorkerError::Engine(EngineError::ImageDecode(_)))
        ));
    }

    #[test]
    fn test_pool_rejects_after_shutdown() {
        let pool = pool(1);
        assert!(pool.shutdown(Duration::from_secs(1)));
        assert!(!pool.is_accepting());
        let result = pool
            .submit(JobPayload::identify(vec![1]))
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert!(matches!(result, Err(WorkerError::ShuttingDown)));
    }

    struct SlowEngine(Duration);

    impl FaceEngine for SlowEngine {
        fn detect(&self, _: &[u8], _: DetectionParams) -> Result<Vec<FaceRect>, EngineError> {
            std::thread::sleep(self.0);
            Ok(vec![rect(0)])
        }

        fn compare(
            &self,
            _: (&[u8], &FaceRect),
            _: (&[u8], &FaceRect),
        ) -> Result<Comparison, EngineError> {
            unreachable!("identification only")
        }
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_work() {
        let pool = WorkerPool::new(
            Arc::new(SlowEngine(Duration::from_millis(100))),
            1,
            Thresholds::default(),
        )
        .unwrap();
        let rx = pool.submit(JobPayload::identify(vec![1]));
        assert!(pool.shutdown(Duration::from_secs(5)));
        assert_eq!(pool.in_flight(), 0);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_shutdown_times_out_on_stuck_work() {
        let pool = WorkerPool::new(
            Arc::new(SlowEngine(Duration::from_millis(500))),
            1,
            Thresholds::default(),
        )
        .unwrap();
        let _rx = pool.submit(JobPayload::identify(vec![1]));
        assert!(!pool.shutdown(Duration::from_millis(20)));
    }

    #[test]
    fn test_zero_threads_builds_single_thread_pool() {
        assert_eq!(pool(0).threads(), 1);
    }
}

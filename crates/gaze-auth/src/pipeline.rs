//! Bounded capture → workers → results pipeline.
//!
//! The camera must keep draining even while face work is slow, and stale
//! frames must never queue up: freshness beats completeness. The input
//! queue is shallow and lossy (drops are counted, not retried), and an
//! adaptive controller trades frame rate and resolution against observed
//! worker latency.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use gaze_core::face::{FaceBox, FaceObservation};
use gaze_core::frame::Frame;
use gaze_core::quality::QualityGate;
use gaze_ipc::client::ClientError;

use crate::camera::FrameSource;

/// Input queue depth: enough to keep workers busy, shallow enough that
/// nothing stale survives in it.
const INPUT_DEPTH: usize = 4;
/// Worker latency above which the pipeline sheds load.
const SLOW_THRESHOLD: Duration = Duration::from_millis(100);
/// Worker latency below which the pipeline restores fidelity.
const FAST_THRESHOLD: Duration = Duration::from_millis(30);
/// Consecutive capture failures treated as a stalled camera.
const MAX_CAPTURE_ERRORS: u32 = 30;

/// Produces face observations for one frame. The IPC-backed finder lives
/// in the session; tests substitute stubs.
pub trait FaceFinder: Send + Sync + 'static {
    fn find_faces(&self, frame: &Frame) -> Result<Vec<(FaceBox, Vec<f64>)>, ClientError>;
}

#[derive(Clone, Copy, Debug)]
pub struct PipelineOptions {
    pub workers: usize,
    pub enable_adaptive: bool,
    pub enable_quality: bool,
    /// Dark-frame threshold on the bin-0 luma ratio, in [0, 1].
    pub dark_threshold: f64,
    /// Downscale applied to every frame (the `max_height` cap), before
    /// any adaptive scaling.
    pub base_scale: f64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            enable_adaptive: true,
            enable_quality: true,
            dark_threshold: 0.6,
            base_scale: 1.0,
        }
    }
}

/// 2–4 workers depending on the machine.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 4)
}

/// Latency-driven degradation ladder. Skip stride moves first, resolution
/// second; recovery walks the same ladder in reverse. One step per update
/// keeps the control loop from oscillating.
pub struct AdaptiveController {
    durations: VecDeque<Duration>,
    skip_stride: u32,
    resolution_scale: f64,
}

impl AdaptiveController {
    pub fn new() -> Self {
        Self {
            durations: VecDeque::with_capacity(30),
            skip_stride: 1,
            resolution_scale: 1.0,
        }
    }

    pub fn skip_stride(&self) -> u32 {
        self.skip_stride
    }

    pub fn resolution_scale(&self) -> f64 {
        self.resolution_scale
    }

    /// Record one worker processing time and take at most one adaptation
    /// step. Returns true when a parameter changed.
    pub fn observe(&mut self, elapsed: Duration) -> bool {
        if self.durations.len() == 30 {
            self.durations.pop_front();
        }
        self.durations.push_back(elapsed);
        if self.durations.len() < 5 {
            return false;
        }

        let recent: f64 = self
            .durations
            .iter()
            .rev()
            .take(10)
            .map(Duration::as_secs_f64)
            .sum::<f64>()
            / self.durations.len().min(10) as f64;

        if recent > SLOW_THRESHOLD.as_secs_f64() {
            if self.skip_stride < 4 {
                self.skip_stride += 1;
                tracing::debug!(stride = self.skip_stride, "adapting: raising frame skip");
                return true;
            }
            if self.resolution_scale > 0.5 {
                self.resolution_scale = (self.resolution_scale * 0.8).max(0.5);
                tracing::debug!(
                    scale = self.resolution_scale,
                    "adapting: lowering resolution"
                );
                return true;
            }
        } else if recent < FAST_THRESHOLD.as_secs_f64() {
            if self.resolution_scale < 1.0 {
                self.resolution_scale = (self.resolution_scale * 1.1).min(1.0);
                tracing::debug!(
                    scale = self.resolution_scale,
                    "adapting: restoring resolution"
                );
                return true;
            }
            if self.skip_stride > 1 {
                self.skip_stride -= 1;
                tracing::debug!(stride = self.skip_stride, "adapting: lowering frame skip");
                return true;
            }
        }
        false
    }
}

impl Default for AdaptiveController {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters shared across the capture thread, workers, and the session.
#[derive(Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub frames_processed: AtomicU64,
    pub frames_skipped_adaptive: AtomicU64,
    pub frames_skipped_quality: AtomicU64,
    pub black_frames: AtomicU64,
    pub dark_frames: AtomicU64,
    pub valid_frames: AtomicU64,
    pub capture_errors: AtomicU64,
    pub worker_errors: AtomicU64,
    pub adaptations: AtomicU64,
    pub skip_stride: AtomicU64,
    pub resolution_milli: AtomicU64,
}

impl PipelineStats {
    fn new() -> Self {
        let stats = Self::default();
        stats.skip_stride.store(1, Ordering::Relaxed);
        stats.resolution_milli.store(1000, Ordering::Relaxed);
        stats
    }

    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Every non-black frame the camera produced was under the dark
    /// threshold — the scene, not the subject, is the problem.
    pub fn all_frames_dark(&self) -> bool {
        let valid = self.valid_frames.load(Ordering::Relaxed);
        valid > 0 && self.dark_frames.load(Ordering::Relaxed) == valid
    }
}

/// Running pipeline: one capture thread, a small worker pool, and the
/// observation stream the session drains.
pub struct FramePipeline {
    stats: Arc<PipelineStats>,
    results: Receiver<FaceObservation>,
    stop: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl FramePipeline {
    pub fn start(
        source: Box<dyn FrameSource>,
        finder: Arc<dyn FaceFinder>,
        options: PipelineOptions,
    ) -> Self {
        let stats = Arc::new(PipelineStats::new());
        let stop = Arc::new(AtomicBool::new(false));
        let adaptive = Arc::new(Mutex::new(AdaptiveController::new()));
        let (input_tx, input_rx) = bounded::<Arc<Frame>>(INPUT_DEPTH);
        let (result_tx, result_rx) = unbounded::<FaceObservation>();

        let capture = {
            let stats = Arc::clone(&stats);
            let stop = Arc::clone(&stop);
            let adaptive = Arc::clone(&adaptive);
            std::thread::Builder::new()
                .name("gaze-capture".into())
                .spawn(move || capture_loop(source, input_tx, stats, stop, adaptive, options))
                .expect("failed to spawn capture thread")
        };

        let worker_count = options.workers.clamp(1, 4);
        let workers = (0..worker_count)
            .map(|id| {
                let finder = Arc::clone(&finder);
                let input_rx = input_rx.clone();
                let result_tx = result_tx.clone();
                let stats = Arc::clone(&stats);
                let stop = Arc::clone(&stop);
                let adaptive = Arc::clone(&adaptive);
                std::thread::Builder::new()
                    .name(format!("gaze-worker-{id}"))
                    .spawn(move || {
                        worker_loop(id, finder, input_rx, result_tx, stats, stop, adaptive, options)
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            stats,
            results: result_rx,
            stop,
            capture: Some(capture),
            workers,
        }
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Next observation, in arrival order (not frame order), or `None`
    /// after `timeout`.
    pub fn next_observation(&self, timeout: Duration) -> Option<FaceObservation> {
        self.results.recv_timeout(timeout).ok()
    }

    /// Idempotent, bounded stop: the capture thread quits producing, the
    /// workers drain the shallow queue and exit on disconnect.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.capture.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    input_tx: Sender<Arc<Frame>>,
    stats: Arc<PipelineStats>,
    stop: Arc<AtomicBool>,
    adaptive: Arc<Mutex<AdaptiveController>>,
    options: PipelineOptions,
) {
    let mut quality = QualityGate::new();
    let mut stride_counter: u64 = 0;
    let mut consecutive_errors: u32 = 0;

    while !stop.load(Ordering::Relaxed) {
        let frame = match source.grab() {
            Ok(frame) => {
                consecutive_errors = 0;
                frame
            }
            Err(e) => {
                stats.capture_errors.fetch_add(1, Ordering::Relaxed);
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CAPTURE_ERRORS {
                    tracing::error!(error = %e, "capture stalled, giving up");
                    break;
                }
                tracing::debug!(error = %e, "frame capture failed");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };
        stats.frames_captured.fetch_add(1, Ordering::Relaxed);

        // Lighting accounting happens on every captured frame, before any
        // shedding, so the too-dark decision reflects the whole session.
        if frame.is_black() {
            stats.black_frames.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        stats.valid_frames.fetch_add(1, Ordering::Relaxed);
        if frame.darkness_ratio() > options.dark_threshold {
            stats.dark_frames.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let (stride, scale) = if options.enable_adaptive {
            let controller = adaptive.lock().expect("adaptive lock poisoned");
            (controller.skip_stride(), controller.resolution_scale())
        } else {
            (1, 1.0)
        };
        stats.skip_stride.store(u64::from(stride), Ordering::Relaxed);
        stats
            .resolution_milli
            .store((scale * 1000.0) as u64, Ordering::Relaxed);

        stride_counter += 1;
        if stride_counter % u64::from(stride) != 0 {
            stats.frames_skipped_adaptive.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if options.enable_quality && !quality.analyze(&frame).passes() {
            stats.frames_skipped_quality.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let frame = Arc::new(frame).scaled(options.base_scale * scale);
        match input_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // Intentional drop: a queued stale frame is worth less
                // than the fresh one behind it.
                stats.frames_skipped_adaptive.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    // input_tx drops here; workers drain and exit on disconnect.
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    worker_id: usize,
    finder: Arc<dyn FaceFinder>,
    input_rx: Receiver<Arc<Frame>>,
    result_tx: Sender<FaceObservation>,
    stats: Arc<PipelineStats>,
    stop: Arc<AtomicBool>,
    adaptive: Arc<Mutex<AdaptiveController>>,
    options: PipelineOptions,
) {
    loop {
        match input_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => {
                let started = Instant::now();
                match finder.find_faces(&frame) {
                    Ok(faces) => {
                        stats.frames_processed.fetch_add(1, Ordering::Relaxed);
                        for (bbox, descriptor) in faces {
                            let observation = FaceObservation {
                                bbox,
                                descriptor,
                                frame: Arc::clone(&frame),
                                frame_id: frame.sequence,
                                worker_id,
                            };
                            if result_tx.send(observation).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        stats.worker_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(worker_id, error = %e, "face processing failed");
                    }
                }
                if options.enable_adaptive {
                    let changed = adaptive
                        .lock()
                        .expect("adaptive lock poisoned")
                        .observe(started.elapsed());
                    if changed {
                        stats.adaptations.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

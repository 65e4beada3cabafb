//! The liveness engine: a positive descriptor match is never sufficient on
//! its own. Passive spectral analysis, a temporal static-scene cue, and
//! active user challenges are combined before an accept is possible.
//!
//! Passive-only liveness is vulnerable to high-quality prints; active-only
//! liveness is vulnerable to pre-recorded videos cued to the prompt. The
//! conjunction makes both attacks materially harder.

pub mod challenge;
pub mod spectral;
pub mod temporal;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::config::SecurityConfig;
use crate::face::{FaceBox, Landmarks};
use crate::frame::Frame;

use challenge::Challenge;
use spectral::FrequencyAnalyzer;
use temporal::StabilityWindow;

/// Hard ceiling on one liveness session.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(8);
/// An accept is never issued before this much observation time.
const MIN_ELAPSED: Duration = Duration::from_millis(1500);
/// Spoof-score contribution of one spoof-indicating frame.
const SPOOF_INCREMENT: f64 = 0.2;
/// Above this cumulative score the session fails outright.
const SPOOF_LIMIT: f64 = 0.5;

const EAR_HISTORY_CAP: usize = 30;
const EYE_Y_HISTORY_CAP: usize = 15;
const NOSE_Y_HISTORY_CAP: usize = 20;

/// Engine verdict for one processed frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessSignal {
    /// Keep feeding frames.
    Continue,
    /// Liveness established; the match may authenticate.
    Accept,
    /// Terminal: the session failed (spoof or timeout).
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessPhase {
    Idle,
    AwaitingAction,
    Verified,
    Failed,
}

/// Per-attempt liveness session. Construct one per authentication attempt
/// and feed it every candidate-matched frame.
pub struct LivenessEngine {
    security: SecurityConfig,

    phase: LivenessPhase,
    started_at: Option<Instant>,
    challenge_started: Option<Instant>,
    total_timeout: Duration,
    min_elapsed: Duration,

    pending: Vec<Challenge>,
    active: Option<Challenge>,
    completed: Vec<Challenge>,
    required: usize,

    spoof_score: f64,
    static_flagged: bool,
    motion_seen: bool,

    analyzer: FrequencyAnalyzer,
    stability: StabilityWindow,
    ear_history: VecDeque<f64>,
    eye_y_history: VecDeque<f64>,
    nose_y_history: VecDeque<f64>,
}

impl LivenessEngine {
    pub fn new(security: SecurityConfig) -> Self {
        Self {
            security,
            phase: LivenessPhase::Idle,
            started_at: None,
            challenge_started: None,
            total_timeout: TOTAL_TIMEOUT,
            min_elapsed: MIN_ELAPSED,
            pending: Vec::new(),
            active: None,
            completed: Vec::new(),
            required: 0,
            spoof_score: 0.0,
            static_flagged: false,
            motion_seen: false,
            analyzer: FrequencyAnalyzer::new(),
            stability: StabilityWindow::new(),
            ear_history: VecDeque::with_capacity(EAR_HISTORY_CAP),
            eye_y_history: VecDeque::with_capacity(EYE_Y_HISTORY_CAP),
            nose_y_history: VecDeque::with_capacity(NOSE_Y_HISTORY_CAP),
        }
    }

    pub fn phase(&self) -> LivenessPhase {
        self.phase
    }

    /// Cumulative spoof score, in [0, 1] and non-decreasing.
    pub fn spoof_score(&self) -> f64 {
        self.spoof_score
    }

    pub fn completed_challenges(&self) -> usize {
        self.completed.len()
    }

    /// Current instruction for the UI channel, if any.
    pub fn prompt(&self) -> Option<&'static str> {
        match self.phase {
            LivenessPhase::AwaitingAction => match self.active {
                Some(c) => Some(c.prompt()),
                None => Some("Hold still, verifying..."),
            },
            LivenessPhase::Verified => Some("Liveness confirmed"),
            LivenessPhase::Idle | LivenessPhase::Failed => None,
        }
    }

    /// Feed one candidate-matched frame. Observations may arrive out of
    /// sequence order; the frame passed here is the one the observation
    /// was computed from.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        landmarks: &Landmarks,
        bbox: &FaceBox,
    ) -> LivenessSignal {
        match self.phase {
            LivenessPhase::Failed => return LivenessSignal::Reject,
            LivenessPhase::Verified => return LivenessSignal::Accept,
            _ => {}
        }

        let now = Instant::now();
        if self.phase == LivenessPhase::Idle {
            self.begin(landmarks, now);
        }
        let elapsed = now.duration_since(self.started_at.unwrap_or(now));
        if elapsed > self.total_timeout {
            return self.fail("liveness window expired");
        }

        if self.security.frequency_analysis {
            let score = self.analyzer.analyze(&frame.luma, Some(bbox));
            if score > self.security.moire_threshold {
                tracing::debug!(score, "spectral analysis flagged frame");
                self.bump_spoof();
            }
            if self.spoof_score > SPOOF_LIMIT {
                return self.fail("spoof score exceeded limit");
            }
        }

        if self.security.temporal_analysis {
            let (left, right) = landmarks.eye_centers();
            self.stability.push(left, right);
            if let Some(d) = self.stability.last_displacement() {
                if d >= temporal::STATIC_DISPLACEMENT {
                    self.motion_seen = true;
                }
            }
            let needed = self.security.min_consistency_frames.max(2);
            if !self.static_flagged && self.stability.len() > needed {
                if let Some(d) = self.stability.mean_displacement() {
                    if d < temporal::STATIC_DISPLACEMENT {
                        tracing::debug!(displacement = d, "static scene flagged");
                        self.static_flagged = true;
                        self.bump_spoof();
                    }
                }
            }
            if self.spoof_score > SPOOF_LIMIT {
                return self.fail("spoof score exceeded limit");
            }
        }

        self.push_histories(landmarks);

        if let Some(active) = self.active {
            let deadline = Duration::from_secs_f64(self.security.challenge_timeout);
            let challenge_elapsed =
                now.duration_since(self.challenge_started.unwrap_or(now));
            if challenge_elapsed > deadline {
                return self.fail("challenge timed out");
            }
            if self.challenge_met(active, landmarks, bbox) {
                tracing::debug!(challenge = ?active, "challenge completed");
                self.completed.push(active);
                if self.completed.len() < self.required {
                    self.active = self.pending.pop();
                    self.challenge_started = Some(now);
                    self.clear_motion_histories();
                } else {
                    self.active = None;
                }
            }
        }

        if self.accept_ready(elapsed) {
            self.phase = LivenessPhase::Verified;
            return LivenessSignal::Accept;
        }
        LivenessSignal::Continue
    }

    /// First-frame setup: start the clock and draw the challenge plan.
    /// The pool depends on the landmark model: the pose challenges need
    /// the 68-point layout, 5-point landmarks leave only the blink analog.
    fn begin(&mut self, landmarks: &Landmarks, now: Instant) {
        self.phase = LivenessPhase::AwaitingAction;
        self.started_at = Some(now);
        if !self.security.active_challenge {
            self.required = 0;
            return;
        }
        let mut pool = if landmarks.arity() == 68 {
            Challenge::full_pool()
        } else {
            vec![Challenge::Blink]
        };
        pool.shuffle(&mut rand::thread_rng());
        self.required = self
            .security
            .security_level
            .required_challenges()
            .min(pool.len());
        self.pending = pool;
        self.active = self.pending.pop();
        self.challenge_started = Some(now);
    }

    fn push_histories(&mut self, landmarks: &Landmarks) {
        if let Some(ear) = challenge::average_ear(landmarks) {
            push_capped(&mut self.ear_history, ear, EAR_HISTORY_CAP);
        }
        let (left, right) = landmarks.eye_centers();
        push_capped(
            &mut self.eye_y_history,
            f64::from((left.y + right.y) / 2.0),
            EYE_Y_HISTORY_CAP,
        );
        push_capped(
            &mut self.nose_y_history,
            f64::from(landmarks.nose_tip().y),
            NOSE_Y_HISTORY_CAP,
        );
    }

    /// Motion evidence must not carry from one challenge into the next.
    fn clear_motion_histories(&mut self) {
        self.ear_history.clear();
        self.eye_y_history.clear();
        self.nose_y_history.clear();
    }

    fn challenge_met(
        &self,
        active: Challenge,
        landmarks: &Landmarks,
        bbox: &FaceBox,
    ) -> bool {
        match active {
            Challenge::Blink => {
                if landmarks.arity() == 68 {
                    challenge::blink_detected(&self.ear_history)
                } else {
                    challenge::blink_motion_detected(&self.eye_y_history)
                }
            }
            Challenge::TurnLeft => {
                challenge::nose_rel_x(landmarks, bbox) > challenge::TURN_LEFT_MIN
            }
            Challenge::TurnRight => {
                challenge::nose_rel_x(landmarks, bbox) < challenge::TURN_RIGHT_MAX
            }
            Challenge::Nod => challenge::nod_detected(&self.nose_y_history),
        }
    }

    fn accept_ready(&self, elapsed: Duration) -> bool {
        if self.completed.len() < self.required {
            return false;
        }
        if self.spoof_score > SPOOF_LIMIT {
            return false;
        }
        if elapsed < self.min_elapsed {
            return false;
        }
        // Without challenges (or with the stricter multi-cue mode on) the
        // temporal cue must have seen actual movement before an accept.
        let need_motion = self.security.temporal_analysis
            && (!self.security.active_challenge || self.security.advanced_liveness);
        if need_motion && !self.motion_seen {
            return false;
        }
        true
    }

    fn bump_spoof(&mut self) {
        self.spoof_score = (self.spoof_score + SPOOF_INCREMENT).min(1.0);
    }

    fn fail(&mut self, reason: &'static str) -> LivenessSignal {
        tracing::info!(reason, spoof_score = self.spoof_score, "liveness failed");
        self.phase = LivenessPhase::Failed;
        LivenessSignal::Reject
    }
}

fn push_capped(history: &mut VecDeque<f64>, value: f64, cap: usize) {
    if history.len() == cap {
        history.pop_front();
    }
    history.push_back(value);
}

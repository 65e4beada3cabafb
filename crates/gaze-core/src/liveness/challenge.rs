//! Active challenge definitions and their landmark-based detectors.

use std::collections::VecDeque;

use crate::face::{FaceBox, Landmarks, Point};

/// EAR below this reads as a closed eye.
pub const EAR_CLOSED: f64 = 0.25;
/// EAR above this, seen recently, confirms the eye was open before the
/// blink (rules out a photo of someone with narrow eyes).
pub const EAR_OPEN: f64 = 0.30;
/// How many recent EAR samples the open-eye check looks back over.
pub const BLINK_WINDOW: usize = 5;
/// Nose-x relative position thresholds for the head-turn challenges.
pub const TURN_LEFT_MIN: f32 = 0.65;
pub const TURN_RIGHT_MAX: f32 = 0.35;
/// Minimum vertical nose travel (px) over the nod window.
pub const NOD_RANGE: f64 = 15.0;
/// Samples required before a nod can be confirmed.
pub const NOD_WINDOW: usize = 5;
/// Vertical eye movement (px) across recent samples that counts as a
/// blink when only 5-point landmarks are available.
pub const EYE_MOTION_THRESHOLD: f64 = 3.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Challenge {
    Blink,
    TurnLeft,
    TurnRight,
    Nod,
}

impl Challenge {
    /// Short instruction shown on the UI channel.
    pub fn prompt(self) -> &'static str {
        match self {
            Challenge::Blink => "Please blink",
            Challenge::TurnLeft => "Turn your head to the left",
            Challenge::TurnRight => "Turn your head to the right",
            Challenge::Nod => "Nod your head",
        }
    }

    /// The full pool, available with 68-point landmarks.
    pub fn full_pool() -> Vec<Challenge> {
        vec![
            Challenge::Blink,
            Challenge::TurnLeft,
            Challenge::TurnRight,
            Challenge::Nod,
        ]
    }
}

/// Eye aspect ratio of a six-point eye ring: vertical lid distances over
/// twice the horizontal corner distance.
pub fn ring_ear(ring: &[Point; 6]) -> f64 {
    let a = ring[1].distance_to(&ring[5]) as f64;
    let b = ring[2].distance_to(&ring[4]) as f64;
    let c = ring[0].distance_to(&ring[3]) as f64;
    if c <= f64::EPSILON {
        return 0.0;
    }
    (a + b) / (2.0 * c)
}

/// Mean EAR of both eyes; `None` without 68-point landmarks.
pub fn average_ear(landmarks: &Landmarks) -> Option<f64> {
    let (left, right) = landmarks.eye_rings()?;
    Some((ring_ear(&left) + ring_ear(&right)) / 2.0)
}

/// Nose tip position relative to the face box width, in [0, 1].
pub fn nose_rel_x(landmarks: &Landmarks, bbox: &FaceBox) -> f32 {
    let width = bbox.width();
    if width <= 0.0 {
        return 0.5;
    }
    ((landmarks.nose_tip().x - bbox.left) / width).clamp(0.0, 1.0)
}

/// A blink happened iff the eye is currently closed and was clearly open
/// within the last few samples.
pub fn blink_detected(ear_history: &VecDeque<f64>) -> bool {
    let Some(&current) = ear_history.back() else {
        return false;
    };
    let recent_max = ear_history
        .iter()
        .rev()
        .take(BLINK_WINDOW)
        .fold(f64::MIN, |m, &v| m.max(v));
    current < EAR_CLOSED && recent_max > EAR_OPEN
}

/// Blink analog for 5-point landmarks: vertical eye-center movement across
/// the last few samples.
pub fn blink_motion_detected(eye_y_history: &VecDeque<f64>) -> bool {
    if eye_y_history.len() < 3 {
        return false;
    }
    let recent: Vec<f64> = eye_y_history.iter().rev().take(3).copied().collect();
    recent
        .windows(2)
        .any(|w| (w[0] - w[1]).abs() > EYE_MOTION_THRESHOLD)
}

/// A nod is enough vertical nose travel over a sustained window.
pub fn nod_detected(nose_y_history: &VecDeque<f64>) -> bool {
    if nose_y_history.len() < NOD_WINDOW {
        return false;
    }
    let min = nose_y_history.iter().fold(f64::MAX, |m, &v| m.min(v));
    let max = nose_y_history.iter().fold(f64::MIN, |m, &v| m.max(v));
    max - min > NOD_RANGE
}

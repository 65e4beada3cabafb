use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// A point in frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis-aligned face rectangle in frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FaceBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Clamp the rectangle to image bounds, returning integer crop
    /// coordinates `(x, y, w, h)`. Returns `None` for degenerate boxes.
    pub fn crop_within(&self, img_w: u32, img_h: u32) -> Option<(u32, u32, u32, u32)> {
        let x = self.left.max(0.0) as u32;
        let y = self.top.max(0.0) as u32;
        let right = (self.right.max(0.0) as u32).min(img_w);
        let bottom = (self.bottom.max(0.0) as u32).min(img_h);
        if right <= x || bottom <= y {
            return None;
        }
        Some((x, y, right - x, bottom - y))
    }

    /// Intersection-over-union with another box, used for NMS.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let ix = (self.right.min(other.right) - self.left.max(other.left)).max(0.0);
        let iy = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// A fixed-arity landmark set. The five-point layout follows the detector
/// convention (left eye, right eye, nose tip, mouth corners); the 68-point
/// layout follows the standard annotation (eye rings at 36..42 and 42..48,
/// nose tip at 30, chin at 8).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Landmarks {
    FivePoint([Point; 5]),
    #[serde(with = "sixty_eight_point_array")]
    SixtyEightPoint(Box<[Point; 68]>),
}

/// `serde`'s derive only implements `Serialize`/`Deserialize` for arrays up
/// to length 32, so the 68-point array needs a manual (de)serialization via
/// a `Vec<Point>` intermediary.
mod sixty_eight_point_array {
    use super::Point;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(points: &Box<[Point; 68]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        points.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Box<[Point; 68]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let points = Vec::<Point>::deserialize(deserializer)?;
        let arr: [Point; 68] = points
            .try_into()
            .map_err(|v: Vec<Point>| {
                serde::de::Error::invalid_length(v.len(), &"array of length 68")
            })?;
        Ok(Box::new(arr))
    }
}

impl Landmarks {
    pub fn arity(&self) -> usize {
        match self {
            Landmarks::FivePoint(_) => 5,
            Landmarks::SixtyEightPoint(_) => 68,
        }
    }

    /// Build from a flat point list; lengths other than 5 or 68 are not a
    /// landmark set this system knows.
    pub fn from_points(points: Vec<Point>) -> Option<Self> {
        match points.len() {
            5 => {
                let mut arr = [Point::new(0.0, 0.0); 5];
                arr.copy_from_slice(&points);
                Some(Landmarks::FivePoint(arr))
            }
            68 => {
                let mut arr = Box::new([Point::new(0.0, 0.0); 68]);
                arr.copy_from_slice(&points);
                Some(Landmarks::SixtyEightPoint(arr))
            }
            _ => None,
        }
    }

    /// The six-point eye rings, only available on the 68-point layout.
    pub fn eye_rings(&self) -> Option<([Point; 6], [Point; 6])> {
        match self {
            Landmarks::FivePoint(_) => None,
            Landmarks::SixtyEightPoint(p) => {
                let mut left = [Point::new(0.0, 0.0); 6];
                let mut right = [Point::new(0.0, 0.0); 6];
                left.copy_from_slice(&p[36..42]);
                right.copy_from_slice(&p[42..48]);
                Some((left, right))
            }
        }
    }

    pub fn nose_tip(&self) -> Point {
        match self {
            Landmarks::FivePoint(p) => p[2],
            Landmarks::SixtyEightPoint(p) => p[30],
        }
    }

    /// Eye center points: annotated centers for the 5-point layout, ring
    /// centroids for the 68-point layout.
    pub fn eye_centers(&self) -> (Point, Point) {
        match self {
            Landmarks::FivePoint(p) => (p[0], p[1]),
            Landmarks::SixtyEightPoint(_) => {
                let (l, r) = self.eye_rings().expect("68-point layout has eye rings");
                (centroid(&l), centroid(&r))
            }
        }
    }
}

fn centroid(points: &[Point]) -> Point {
    let n = points.len() as f32;
    Point::new(
        points.iter().map(|p| p.x).sum::<f32>() / n,
        points.iter().map(|p| p.y).sum::<f32>() / n,
    )
}

/// One face found by a pipeline worker: where it was, its descriptor, and
/// the (possibly downscaled) frame it came from. Observations arrive at
/// the verifier in completion order, not sequence order, so the source
/// frame travels with the observation.
#[derive(Clone)]
pub struct FaceObservation {
    pub bbox: FaceBox,
    pub descriptor: Vec<f64>,
    pub frame: Arc<Frame>,
    pub frame_id: u64,
    pub worker_id: usize,
}

/// Result of matching a probe descriptor against an enrollment set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchDecision {
    pub distance: f64,
    pub enrollment_index: usize,
}

impl MatchDecision {
    /// A decision accepts iff the nearest distance is under the threshold.
    pub fn is_accepting(&self, certainty_threshold: f64) -> bool {
        self.distance < certainty_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_clamps_to_image() {
        let b = FaceBox::new(-10.0, -5.0, 50.0, 40.0);
        assert_eq!(b.crop_within(32, 32), Some((0, 0, 32, 32)));
    }

    #[test]
    fn degenerate_crop_is_none() {
        let b = FaceBox::new(40.0, 40.0, 50.0, 50.0);
        assert_eq!(b.crop_within(32, 32), None);
        let b = FaceBox::new(10.0, 10.0, 10.0, 20.0);
        assert_eq!(b.crop_within(32, 32), None);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = FaceBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = FaceBox::new(0.0, 0.0, 10.0, 10.0);
        let b = FaceBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn landmark_arity_round_trip() {
        let five = Landmarks::from_points(vec![Point::new(1.0, 2.0); 5]).unwrap();
        assert_eq!(five.arity(), 5);
        let sixty_eight = Landmarks::from_points(vec![Point::new(0.0, 0.0); 68]).unwrap();
        assert_eq!(sixty_eight.arity(), 68);
        assert!(Landmarks::from_points(vec![Point::new(0.0, 0.0); 7]).is_none());
    }

    #[test]
    fn five_point_accessors() {
        let p: Vec<Point> = (0..5).map(|i| Point::new(i as f32, 10.0)).collect();
        let lm = Landmarks::from_points(p).unwrap();
        assert_eq!(lm.nose_tip(), Point::new(2.0, 10.0));
        let (l, r) = lm.eye_centers();
        assert_eq!(l, Point::new(0.0, 10.0));
        assert_eq!(r, Point::new(1.0, 10.0));
        assert!(lm.eye_rings().is_none());
    }

    #[test]
    fn sixty_eight_point_eye_rings() {
        let mut pts = vec![Point::new(0.0, 0.0); 68];
        for (i, p) in pts.iter_mut().enumerate().take(42).skip(36) {
            *p = Point::new(i as f32, 1.0);
        }
        let lm = Landmarks::from_points(pts).unwrap();
        let (left, _) = lm.eye_rings().unwrap();
        assert_eq!(left[0], Point::new(36.0, 1.0));
        assert_eq!(left[5], Point::new(41.0, 1.0));
    }

    #[test]
    fn accepting_under_threshold_only() {
        let d = MatchDecision {
            distance: 0.34,
            enrollment_index: 1,
        };
        assert!(d.is_accepting(0.35));
        assert!(!d.is_accepting(0.34));
        assert!(!d.is_accepting(0.30));
    }
}

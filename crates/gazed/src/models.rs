//! ONNX vision stack: face detector (two variants), landmark predictor,
//! and descriptor encoder.
//!
//! All three are pretrained models loaded once at daemon startup. Loading
//! is synchronous and fail-fast: a missing or corrupt model file must stop
//! the daemon before it ever accepts a connection.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use ndarray::Array4;
use ort::{GraphOptimizationLevel, Session};
use sha2::{Digest, Sha256};
use thiserror::Error;

use gaze_core::face::{FaceBox, Point};
use gaze_core::DESCRIPTOR_DIM;

/// Window-scan detector: lightweight anchor-grid model (YuNet-shape IO).
const WINDOW_DETECTOR_FILE: &str = "detect_window.onnx";
/// Higher-recall convolutional detector with a flat detection output.
const CNN_DETECTOR_FILE: &str = "detect_cnn.onnx";
const LANDMARK_FILE: &str = "landmarks.onnx";
const ENCODER_FILE: &str = "encoder.onnx";

/// Minimum decoded confidence for a detection to survive.
const DETECT_CONFIDENCE: f32 = 0.6;
/// IoU above which two detections are duplicates.
const NMS_IOU: f32 = 0.4;
/// Landmark model crop size.
const LANDMARK_INPUT: u32 = 192;
/// Encoder crop size (ArcFace-standard).
const ENCODER_INPUT: u32 = 112;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {name} ({path})")]
    Missing { name: &'static str, path: PathBuf },
    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("model checksum mismatch for {path}\n  expected: {expected}\n  got:      {got}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        got: String,
    },
    #[error("inference failed: {0}")]
    Inference(#[from] ort::Error),
    #[error("model output could not be decoded: {detail}")]
    Decode { detail: String },
    #[error("face region lies outside the frame")]
    BadRegion,
}

/// Compute the SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelError> {
    let mut file = fs::File::open(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// When a `<model>.sha256` sidecar exists next to a model file, the model
/// must match it. Installations without sidecars skip the check.
pub fn verify_sidecar(path: &Path) -> Result<(), ModelError> {
    let sidecar = {
        let mut s = path.as_os_str().to_owned();
        s.push(".sha256");
        PathBuf::from(s)
    };
    let expected = match fs::read_to_string(&sidecar) {
        Ok(text) => match text.split_whitespace().next() {
            Some(tok) => tok.to_ascii_lowercase(),
            None => return Ok(()),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no checksum sidecar, skipping verification");
            return Ok(());
        }
        Err(source) => {
            return Err(ModelError::Io {
                path: sidecar,
                source,
            })
        }
    };
    let got = sha256_file_hex(path)?;
    if got != expected {
        return Err(ModelError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            got,
        });
    }
    Ok(())
}

fn load_session(name: &'static str, path: &Path) -> Result<Session, ModelError> {
    if !path.exists() {
        return Err(ModelError::Missing {
            name,
            path: path.to_path_buf(),
        });
    }
    verify_sidecar(path)?;
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Anchor-grid detector. Output layout per FPN stride s ∈ {8, 16, 32}:
/// `cls_s`/`obj_s` are per-anchor sigmoid probabilities `(1, N, 1)` and
/// `bbox_s` carries `[cx, cy, w, h]` offsets in stride units `(1, N, 4)`.
pub struct WindowDetector {
    session: Session,
}

impl WindowDetector {
    fn detect(&self, luma: &GrayImage) -> Result<Vec<(FaceBox, f32)>, ModelError> {
        let img_w = luma.width() as f32;
        let img_h = luma.height() as f32;
        let tensor = luma_tensor(luma);
        let outputs = self.session.run(ort::inputs!["input" => tensor.view()]?)?;

        let mut detections = Vec::new();
        for stride in [8usize, 16, 32] {
            let cls = outputs[format!("cls_{stride}").as_str()].try_extract_tensor::<f32>()?;
            let obj = outputs[format!("obj_{stride}").as_str()].try_extract_tensor::<f32>()?;
            let bbox = outputs[format!("bbox_{stride}").as_str()].try_extract_tensor::<f32>()?;
            let cls = cls.as_slice().ok_or_else(|| ModelError::Decode {
                detail: "non-contiguous cls tensor".to_string(),
            })?;
            let obj = obj.as_slice().ok_or_else(|| ModelError::Decode {
                detail: "non-contiguous obj tensor".to_string(),
            })?;
            let bbox = bbox.as_slice().ok_or_else(|| ModelError::Decode {
                detail: "non-contiguous bbox tensor".to_string(),
            })?;
            detections.extend(decode_stride(stride, cls, obj, bbox, img_w, img_h));
        }
        Ok(non_max_suppression(detections, NMS_IOU))
    }
}

/// Convolutional detector with a flat `dets` output `(1, N, 5)` of
/// `[x1, y1, x2, y2, score]` rows in frame coordinates.
pub struct CnnDetector {
    session: Session,
}

impl CnnDetector {
    fn detect(&self, luma: &GrayImage) -> Result<Vec<(FaceBox, f32)>, ModelError> {
        let img_w = luma.width() as f32;
        let img_h = luma.height() as f32;
        let tensor = luma_tensor(luma);
        let outputs = self.session.run(ort::inputs!["input" => tensor.view()]?)?;
        let dets = outputs["dets"].try_extract_tensor::<f32>()?;
        let rows = dets.as_slice().ok_or_else(|| ModelError::Decode {
            detail: "non-contiguous dets tensor".to_string(),
        })?;

        let mut detections = Vec::new();
        for row in rows.chunks_exact(5) {
            let score = row[4];
            if score < DETECT_CONFIDENCE {
                continue;
            }
            detections.push((
                FaceBox::new(
                    row[0].clamp(0.0, img_w),
                    row[1].clamp(0.0, img_h),
                    row[2].clamp(0.0, img_w),
                    row[3].clamp(0.0, img_h),
                ),
                score,
            ));
        }
        Ok(non_max_suppression(detections, NMS_IOU))
    }
}

/// Detector variant selected by `core.use_cnn`.
pub enum FaceDetector {
    Window(WindowDetector),
    Convolutional(CnnDetector),
}

impl FaceDetector {
    /// Detect faces on a luma frame. Both variants are normalized to the
    /// same plain rectangle shape, ordered by descending confidence.
    pub fn detect(&self, luma: &GrayImage) -> Result<Vec<FaceBox>, ModelError> {
        let scored = match self {
            FaceDetector::Window(d) => d.detect(luma)?,
            FaceDetector::Convolutional(d) => d.detect(luma)?,
        };
        Ok(scored.into_iter().map(|(b, _)| b).collect())
    }
}

/// Landmark predictor. Input: 192×192 face crop; output `points`
/// `(1, 2·N)` of coordinates normalized to the crop, N ∈ {5, 68}.
pub struct Landmarker {
    session: Session,
}

impl Landmarker {
    pub fn landmarks(&self, rgb: &RgbImage, bbox: &FaceBox) -> Result<Vec<Point>, ModelError> {
        let (cx, cy, cw, ch) = bbox
            .crop_within(rgb.width(), rgb.height())
            .ok_or(ModelError::BadRegion)?;
        let tensor = crop_tensor_bgr(rgb, bbox, LANDMARK_INPUT)?;
        let outputs = self.session.run(ort::inputs!["input" => tensor.view()]?)?;
        let points = outputs["points"].try_extract_tensor::<f32>()?;
        let flat = points.as_slice().ok_or_else(|| ModelError::Decode {
            detail: "non-contiguous points tensor".to_string(),
        })?;

        let arity = flat.len() / 2;
        if !(arity == 5 || arity == 68) || flat.len() % 2 != 0 {
            return Err(ModelError::Decode {
                detail: format!("unsupported landmark arity {arity}"),
            });
        }
        Ok(flat
            .chunks_exact(2)
            .map(|p| {
                Point::new(
                    cx as f32 + p[0] * cw as f32,
                    cy as f32 + p[1] * ch as f32,
                )
            })
            .collect())
    }
}

/// Descriptor encoder. Input: 112×112 face crop (`data`); output `fc1`
/// `(1, 128)` L2-normalised embedding, widened to f64 for the enrollment
/// descriptor space.
pub struct Encoder {
    session: Session,
}

impl Encoder {
    pub fn encode(&self, rgb: &RgbImage, bbox: &FaceBox) -> Result<Vec<f64>, ModelError> {
        let tensor = crop_tensor_bgr(rgb, bbox, ENCODER_INPUT)?;
        let outputs = self.session.run(ort::inputs!["data" => tensor.view()]?)?;
        let embedding = outputs["fc1"].try_extract_tensor::<f32>()?;
        let flat = embedding.as_slice().ok_or_else(|| ModelError::Decode {
            detail: "non-contiguous embedding tensor".to_string(),
        })?;
        if flat.len() != DESCRIPTOR_DIM {
            return Err(ModelError::Decode {
                detail: format!("descriptor dimension {} != {DESCRIPTOR_DIM}", flat.len()),
            });
        }
        Ok(flat.iter().map(|&v| f64::from(v)).collect())
    }
}

/// The full loaded stack. Construction order matters and is logged:
/// detector, then landmarker, then encoder.
pub struct ModelStack {
    pub detector: FaceDetector,
    pub landmarker: Landmarker,
    pub encoder: Encoder,
}

impl ModelStack {
    pub fn load(model_dir: &Path, use_cnn: bool) -> Result<Self, ModelError> {
        let detector = if use_cnn {
            let path = model_dir.join(CNN_DETECTOR_FILE);
            tracing::info!(path = %path.display(), "loading convolutional face detector");
            FaceDetector::Convolutional(CnnDetector {
                session: load_session(CNN_DETECTOR_FILE, &path)?,
            })
        } else {
            let path = model_dir.join(WINDOW_DETECTOR_FILE);
            tracing::info!(path = %path.display(), "loading window-scan face detector");
            FaceDetector::Window(WindowDetector {
                session: load_session(WINDOW_DETECTOR_FILE, &path)?,
            })
        };

        let path = model_dir.join(LANDMARK_FILE);
        tracing::info!(path = %path.display(), "loading landmark predictor");
        let landmarker = Landmarker {
            session: load_session(LANDMARK_FILE, &path)?,
        };

        let path = model_dir.join(ENCODER_FILE);
        tracing::info!(path = %path.display(), "loading descriptor encoder");
        let encoder = Encoder {
            session: load_session(ENCODER_FILE, &path)?,
        };

        Ok(Self {
            detector,
            landmarker,
            encoder,
        })
    }
}

/// Decode one FPN stride of the anchor-grid detector output. Offsets are
/// in stride units relative to each anchor's center.
fn decode_stride(
    stride: usize,
    cls: &[f32],
    obj: &[f32],
    bbox: &[f32],
    img_w: f32,
    img_h: f32,
) -> Vec<(FaceBox, f32)> {
    let stride_f = stride as f32;
    let feat_w = (img_w / stride_f) as usize;
    if feat_w == 0 {
        return Vec::new();
    }
    let n = cls.len().min(obj.len()).min(bbox.len() / 4);

    let mut out = Vec::new();
    for i in 0..n {
        let score = cls[i] * obj[i];
        if score < DETECT_CONFIDENCE {
            continue;
        }
        let row = i / feat_w;
        let col = i % feat_w;
        let anchor_cx = (col as f32 + 0.5) * stride_f;
        let anchor_cy = (row as f32 + 0.5) * stride_f;

        let cx = anchor_cx + bbox[i * 4] * stride_f;
        let cy = anchor_cy + bbox[i * 4 + 1] * stride_f;
        let w = bbox[i * 4 + 2] * stride_f;
        let h = bbox[i * 4 + 3] * stride_f;

        out.push((
            FaceBox::new(
                (cx - w / 2.0).clamp(0.0, img_w),
                (cy - h / 2.0).clamp(0.0, img_h),
                (cx + w / 2.0).clamp(0.0, img_w),
                (cy + h / 2.0).clamp(0.0, img_h),
            ),
            score,
        ));
    }
    out
}

/// Greedy non-maximum suppression: keep the best-scoring box of every
/// overlapping cluster. Returns survivors ordered by descending score.
fn non_max_suppression(
    mut detections: Vec<(FaceBox, f32)>,
    iou_threshold: f32,
) -> Vec<(FaceBox, f32)> {
    detections.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<(FaceBox, f32)> = Vec::new();
    for (candidate, score) in detections {
        if kept.iter().all(|(k, _)| k.iou(&candidate) < iou_threshold) {
            kept.push((candidate, score));
        }
    }
    kept
}

/// Replicate a luma image into a `(1, 3, H, W)` f32 tensor (the detector
/// models take three channels).
fn luma_tensor(luma: &GrayImage) -> Array4<f32> {
    let (w, h) = luma.dimensions();
    let mut t = Array4::zeros((1, 3, h as usize, w as usize));
    for y in 0..h {
        for x in 0..w {
            let v = f32::from(luma.get_pixel(x, y)[0]);
            for c in 0..3 {
                t[[0, c, y as usize, x as usize]] = v;
            }
        }
    }
    t
}

/// Crop the face region, resize to `size`², and lay it out as a BGR
/// `(1, 3, size, size)` tensor with 0-255 values, the convention the
/// OpenCV-zoo-trained models expect.
fn crop_tensor_bgr(rgb: &RgbImage, bbox: &FaceBox, size: u32) -> Result<Array4<f32>, ModelError> {
    let (x, y, w, h) = bbox
        .crop_within(rgb.width(), rgb.height())
        .ok_or(ModelError::BadRegion)?;
    let crop = image::imageops::crop_imm(rgb, x, y, w, h).to_image();
    let resized = image::imageops::resize(&crop, size, size, FilterType::Triangle);

    let mut t = Array4::zeros((1, 3, size as usize, size as usize));
    for yy in 0..size {
        for xx in 0..size {
            let p = resized.get_pixel(xx, yy);
            t[[0, 0, yy as usize, xx as usize]] = f32::from(p[2]);
            t[[0, 1, yy as usize, xx as usize]] = f32::from(p[1]);
            t[[0, 2, yy as usize, xx as usize]] = f32::from(p[0]);
        }
    }
    Ok(t)
}

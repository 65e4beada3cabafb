use std::time::SystemTime;

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gaze_core::enrollment::DescriptorMeta;
use gaze_core::face::{FaceBox, Point};

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("payload encode/decode failed: {0}")]
    Codec(#[from] bincode::Error),
}

/// Single-channel image payload. Bytes are row-major, one byte per pixel,
/// and must round-trip exactly: the daemon computes on what the verifier
/// captured, not on a re-encoding of it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLuma {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl WireLuma {
    pub fn from_image(img: &GrayImage) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
            data: img.as_raw().clone(),
        }
    }

    /// Rebuild the image; `None` if the byte count disagrees with the
    /// declared dimensions.
    pub fn into_image(self) -> Option<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data)
    }
}

/// Three-channel RGB payload, row-major, three bytes per pixel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRgb {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl WireRgb {
    pub fn from_image(img: &RgbImage) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
            data: img.as_raw().clone(),
        }
    }

    pub fn into_image(self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data)
    }
}

/// Everything the daemon knows about one user's enrollment, flattened for
/// the wire: row-major descriptor vectors with per-row provenance and the
/// source file's mtime for cache validation on the client side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodingsPayload {
    pub vectors: Vec<Vec<f64>>,
    pub meta: Vec<DescriptorMeta>,
    pub source_mtime: SystemTime,
}

/// Cumulative daemon counters, served by the `Stats` request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub requests_served: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub startup_seconds: f64,
    pub mean_response_seconds: f64,
}

/// Typed per-request failure reasons. The daemon never dies on a request;
/// it answers with one of these instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceErrorKind {
    /// The request could not be decoded or named an unknown kind.
    Unknown,
    /// The request decoded but was semantically invalid (malformed image
    /// payload, unusable username).
    InvalidRequest,
    /// The detector raised.
    DetectFailed,
    /// The landmark predictor raised.
    LandmarksFailed,
    /// The descriptor encoder raised.
    EncodeFailed,
    /// The enrollment file exists but could not be parsed.
    EnrollmentCorrupt,
    /// Anything else the handler contained.
    Internal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    GetEncodings { username: String },
    DetectFaces { frame: WireLuma },
    GetLandmarks { frame: WireRgb, bbox: FaceBox },
    GetFaceEncoding { frame: WireRgb, bbox: FaceBox },
    Invalidate { username: String },
    Stats,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Pong { alive: bool, models_loaded: bool },
    Encodings(Option<EncodingsPayload>),
    Faces(Vec<FaceBox>),
    Landmarks(Vec<Point>),
    Encoding(Vec<f64>),
    Invalidated,
    Stats(ServiceStats),
    Error { kind: ServiceErrorKind },
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, ProtoError> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luma_payload_round_trips_byte_identically() {
        let img = GrayImage::from_fn(17, 9, |x, y| image::Luma([(x * 13 + y * 7) as u8]));
        let wire = WireLuma::from_image(&img);
        let encoded = encode(&wire).unwrap();
        let decoded: WireLuma = decode(&encoded).unwrap();
        assert_eq!(decoded, wire);
        let back = decoded.into_image().unwrap();
        assert_eq!(back.dimensions(), (17, 9));
        assert_eq!(back.as_raw(), img.as_raw());
    }

    #[test]
    fn rgb_payload_round_trips_byte_identically() {
        let img = RgbImage::from_fn(8, 6, |x, y| {
            image::Rgb([x as u8, y as u8, (x ^ y) as u8])
        });
        let wire = WireRgb::from_image(&img);
        let decoded: WireRgb = decode(&encode(&wire).unwrap()).unwrap();
        assert_eq!(decoded.into_image().unwrap().as_raw(), img.as_raw());
    }

    #[test]
    fn mismatched_dimensions_reject_reassembly() {
        let wire = WireLuma {
            width: 10,
            height: 10,
            data: vec![0u8; 50],
        };
        assert!(wire.into_image().is_none());
    }

    #[test]
    fn request_enum_round_trips() {
        let req = Request::GetLandmarks {
            frame: WireRgb {
                width: 2,
                height: 2,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
            },
            bbox: FaceBox::new(1.0, 2.0, 30.0, 40.0),
        };
        let decoded: Request = decode(&encode(&req).unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn response_enum_round_trips() {
        let resp = Response::Encodings(Some(EncodingsPayload {
            vectors: vec![vec![0.25; 4], vec![-0.5; 4]],
            meta: vec![
                DescriptorMeta {
                    label: "normal".to_string(),
                    time: 1_700_000_000,
                },
                DescriptorMeta {
                    label: "glasses".to_string(),
                    time: 1_700_000_001,
                },
            ],
            source_mtime: SystemTime::UNIX_EPOCH,
        }));
        let decoded: Response = decode(&encode(&resp).unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn garbage_does_not_decode() {
        let garbage = vec![0xffu8; 64];
        assert!(decode::<Request>(&garbage).is_err());
    }

    #[test]
    fn error_response_carries_its_kind() {
        let resp = Response::Error {
            kind: ServiceErrorKind::Unknown,
        };
        let decoded: Response = decode(&encode(&resp).unwrap()).unwrap();
        assert_eq!(
            decoded,
            Response::Error {
                kind: ServiceErrorKind::Unknown
            }
        );
    }
}

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use image::{GrayImage, RgbImage};

use gaze_core::enrollment::{self, EnrollmentError};
use gaze_core::face::{FaceBox, Point};
use gaze_ipc::proto::{Request, Response, ServiceErrorKind, ServiceStats};

use crate::cache::EncodingCache;
use crate::models::{ModelError, ModelStack};

/// The vision operations the service dispatches to. `ModelStack` is the
/// real implementation; tests substitute a stub so the request handling,
/// cache, and stats paths run without model files.
pub trait VisionBackend: Send + 'static {
    fn detect(&self, luma: &GrayImage) -> Result<Vec<FaceBox>, ModelError>;
    fn landmarks(&self, rgb: &RgbImage, bbox: &FaceBox) -> Result<Vec<Point>, ModelError>;
    fn encode(&self, rgb: &RgbImage, bbox: &FaceBox) -> Result<Vec<f64>, ModelError>;
}

impl VisionBackend for ModelStack {
    fn detect(&self, luma: &GrayImage) -> Result<Vec<FaceBox>, ModelError> {
        self.detector.detect(luma)
    }

    fn landmarks(&self, rgb: &RgbImage, bbox: &FaceBox) -> Result<Vec<Point>, ModelError> {
        self.landmarker.landmarks(rgb, bbox)
    }

    fn encode(&self, rgb: &RgbImage, bbox: &FaceBox) -> Result<Vec<f64>, ModelError> {
        self.encoder.encode(rgb, bbox)
    }
}

struct ServiceState<B> {
    backend: B,
    cache: EncodingCache,
}

#[derive(Default)]
struct ResponseStats {
    requests_served: u64,
    mean_response_seconds: f64,
}

/// The model service: owns the loaded models and the enrollment cache,
/// and answers one request at a time per caller.
///
/// One mutex guards both the backend and the cache. The underlying models
/// carry no documented reentrancy guarantee, so every model call
/// serializes here; handlers never take the lock twice on any path.
pub struct ModelService<B> {
    state: Mutex<ServiceState<B>>,
    stats: Mutex<ResponseStats>,
    user_dir: PathBuf,
    startup: Duration,
}

impl<B: VisionBackend> ModelService<B> {
    pub fn new(backend: B, user_dir: PathBuf, startup: Duration) -> Self {
        Self {
            state: Mutex::new(ServiceState {
                backend,
                cache: EncodingCache::new(),
            }),
            stats: Mutex::new(ResponseStats::default()),
            user_dir,
            startup,
        }
    }

    /// Handle one decoded request. Every failure is contained and returned
    /// as a typed error response; nothing here may take the daemon down.
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong {
                alive: true,
                models_loaded: true,
            },
            Request::GetEncodings { username } => self.get_encodings(&username),
            Request::DetectFaces { frame } => {
                let Some(luma) = frame.into_image() else {
                    return error(ServiceErrorKind::InvalidRequest);
                };
                let state = self.state.lock().expect("service lock poisoned");
                match state.backend.detect(&luma) {
                    Ok(faces) => Response::Faces(faces),
                    Err(e) => {
                        tracing::error!(error = %e, "face detection failed");
                        error(ServiceErrorKind::DetectFailed)
                    }
                }
            }
            Request::GetLandmarks { frame, bbox } => {
                let Some(rgb) = frame.into_image() else {
                    return error(ServiceErrorKind::InvalidRequest);
                };
                let state = self.state.lock().expect("service lock poisoned");
                match state.backend.landmarks(&rgb, &bbox) {
                    Ok(points) => Response::Landmarks(points),
                    Err(e) => {
                        tracing::error!(error = %e, "landmark prediction failed");
                        error(ServiceErrorKind::LandmarksFailed)
                    }
                }
            }
            Request::GetFaceEncoding { frame, bbox } => {
                let Some(rgb) = frame.into_image() else {
                    return error(ServiceErrorKind::InvalidRequest);
                };
                let state = self.state.lock().expect("service lock poisoned");
                match state.backend.encode(&rgb, &bbox) {
                    Ok(descriptor) => Response::Encoding(descriptor),
                    Err(e) => {
                        tracing::error!(error = %e, "descriptor encoding failed");
                        error(ServiceErrorKind::EncodeFailed)
                    }
                }
            }
            Request::Invalidate { username } => {
                if !valid_username(&username) {
                    return error(ServiceErrorKind::InvalidRequest);
                }
                let mut state = self.state.lock().expect("service lock poisoned");
                state.cache.invalidate(&username);
                Response::Invalidated
            }
            Request::Stats => {
                let state = self.state.lock().expect("service lock poisoned");
                let stats = self.stats.lock().expect("stats lock poisoned");
                Response::Stats(ServiceStats {
                    requests_served: stats.requests_served,
                    cache_hits: state.cache.hits(),
                    cache_misses: state.cache.misses(),
                    startup_seconds: self.startup.as_secs_f64(),
                    mean_response_seconds: stats.mean_response_seconds,
                })
            }
        }
    }

    fn get_encodings(&self, username: &str) -> Response {
        if !valid_username(username) {
            tracing::warn!(username, "rejected unusable username");
            return error(ServiceErrorKind::InvalidRequest);
        }
        let path = enrollment::user_file_path(&self.user_dir, username);
        let mut state = self.state.lock().expect("service lock poisoned");
        match state.cache.lookup(username, &path) {
            Ok(payload) => Response::Encodings(payload),
            Err(EnrollmentError::Corrupt { path, detail }) => {
                tracing::error!(path = %path.display(), detail, "corrupt enrollment file");
                error(ServiceErrorKind::EnrollmentCorrupt)
            }
            Err(e) => {
                tracing::error!(error = %e, "enrollment lookup failed");
                error(ServiceErrorKind::Internal)
            }
        }
    }

    /// Update the request counters after a round completes. Held apart
    /// from the model lock so timing bookkeeping never delays inference.
    pub fn record_response(&self, elapsed: Duration) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.requests_served += 1;
        let n = stats.requests_served as f64;
        let x = elapsed.as_secs_f64();
        stats.mean_response_seconds += (x - stats.mean_response_seconds) / n;
    }
}

fn error(kind: ServiceErrorKind) -> Response {
    Response::Error { kind }
}

/// Usernames become file names under the enrollment directory; anything
/// that could traverse out of it is rejected outright.
fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !username.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaze_core::enrollment::EnrollmentEntry;
    use gaze_ipc::proto::{WireLuma, WireRgb};
    use std::path::Path;

    /// Stub backend with switchable failure behavior.
    struct StubBackend {
        fail: bool,
    }

    impl VisionBackend for StubBackend {
        fn detect(&self, _luma: &GrayImage) -> Result<Vec<FaceBox>, ModelError> {
            if self.fail {
                return Err(ModelError::Decode {
                    detail: "stub".to_string(),
                });
            }
            Ok(vec![FaceBox::new(10.0, 10.0, 50.0, 50.0)])
        }

        fn landmarks(&self, _rgb: &RgbImage, _bbox: &FaceBox) -> Result<Vec<Point>, ModelError> {
            if self.fail {
                return Err(ModelError::Decode {
                    detail: "stub".to_string(),
                });
            }
            Ok(vec![Point::new(0.0, 0.0); 5])
        }

        fn encode(&self, _rgb: &RgbImage, _bbox: &FaceBox) -> Result<Vec<f64>, ModelError> {
            if self.fail {
                return Err(ModelError::Decode {
                    detail: "stub".to_string(),
                });
            }
            Ok(vec![0.25; gaze_core::DESCRIPTOR_DIM])
        }
    }

    fn service(fail: bool, user_dir: &Path) -> ModelService<StubBackend> {
        ModelService::new(
            StubBackend { fail },
            user_dir.to_path_buf(),
            Duration::from_millis(1500),
        )
    }

    fn write_enrollment(dir: &Path, username: &str) {
        let entries = vec![EnrollmentEntry {
            label: "default".to_string(),
            time: 0,
            data: vec![vec![0.1; 8]; 2],
        }];
        std::fs::write(
            dir.join(format!("{username}.json")),
            serde_json::to_vec(&entries).unwrap(),
        )
        .unwrap();
    }

    fn luma_frame() -> WireLuma {
        WireLuma {
            width: 4,
            height: 4,
            data: vec![0u8; 16],
        }
    }

    fn rgb_frame() -> WireRgb {
        WireRgb {
            width: 4,
            height: 4,
            data: vec![0u8; 48],
        }
    }

    #[test]
    fn ping_reports_ready() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(false, dir.path());
        assert_eq!(
            s.handle(Request::Ping),
            Response::Pong {
                alive: true,
                models_loaded: true
            }
        );
    }

    #[test]
    fn encodings_hits_and_misses_add_up() {
        let dir = tempfile::tempdir().unwrap();
        write_enrollment(dir.path(), "alice");
        let s = service(false, dir.path());

        for _ in 0..3 {
            match s.handle(Request::GetEncodings {
                username: "alice".to_string(),
            }) {
                Response::Encodings(Some(payload)) => {
                    assert_eq!(payload.vectors.len(), 2);
                    assert_eq!(payload.meta.len(), 2);
                }
                other => panic!("unexpected response: {other:?}"),
            }
        }

        match s.handle(Request::Stats) {
            Response::Stats(stats) => {
                assert_eq!(stats.cache_hits + stats.cache_misses, 3);
                assert_eq!(stats.cache_misses, 1);
                assert!((stats.startup_seconds - 1.5).abs() < 1e-9);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn unknown_user_is_null_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(false, dir.path());
        assert_eq!(
            s.handle(Request::GetEncodings {
                username: "bob".to_string()
            }),
            Response::Encodings(None)
        );
    }

    #[test]
    fn traversal_usernames_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(false, dir.path());
        for bad in ["../root", "a/b", "", ".hidden", "x".repeat(65).as_str()] {
            assert_eq!(
                s.handle(Request::GetEncodings {
                    username: bad.to_string()
                }),
                Response::Error {
                    kind: ServiceErrorKind::InvalidRequest
                },
                "username {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn vision_requests_dispatch_to_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(false, dir.path());

        match s.handle(Request::DetectFaces { frame: luma_frame() }) {
            Response::Faces(faces) => assert_eq!(faces.len(), 1),
            other => panic!("unexpected response: {other:?}"),
        }
        match s.handle(Request::GetLandmarks {
            frame: rgb_frame(),
            bbox: FaceBox::new(0.0, 0.0, 4.0, 4.0),
        }) {
            Response::Landmarks(points) => assert_eq!(points.len(), 5),
            other => panic!("unexpected response: {other:?}"),
        }
        match s.handle(Request::GetFaceEncoding {
            frame: rgb_frame(),
            bbox: FaceBox::new(0.0, 0.0, 4.0, 4.0),
        }) {
            Response::Encoding(d) => assert_eq!(d.len(), gaze_core::DESCRIPTOR_DIM),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn backend_failures_become_typed_errors() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(true, dir.path());
        assert_eq!(
            s.handle(Request::DetectFaces { frame: luma_frame() }),
            Response::Error {
                kind: ServiceErrorKind::DetectFailed
            }
        );
        assert_eq!(
            s.handle(Request::GetFaceEncoding {
                frame: rgb_frame(),
                bbox: FaceBox::new(0.0, 0.0, 4.0, 4.0),
            }),
            Response::Error {
                kind: ServiceErrorKind::EncodeFailed
            }
        );
    }

    #[test]
    fn malformed_image_payload_is_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(false, dir.path());
        let bad = WireLuma {
            width: 100,
            height: 100,
            data: vec![0u8; 7],
        };
        assert_eq!(
            s.handle(Request::DetectFaces { frame: bad }),
            Response::Error {
                kind: ServiceErrorKind::InvalidRequest
            }
        );
    }

    #[test]
    fn corrupt_enrollment_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("eve.json"), b"{nope").unwrap();
        let s = service(false, dir.path());
        assert_eq!(
            s.handle(Request::GetEncodings {
                username: "eve".to_string()
            }),
            Response::Error {
                kind: ServiceErrorKind::EnrollmentCorrupt
            }
        );
    }

    #[test]
    fn invalidate_drops_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_enrollment(dir.path(), "alice");
        let s = service(false, dir.path());
        s.handle(Request::GetEncodings {
            username: "alice".to_string(),
        });
        assert_eq!(
            s.handle(Request::Invalidate {
                username: "alice".to_string()
            }),
            Response::Invalidated
        );
        s.handle(Request::GetEncodings {
            username: "alice".to_string(),
        });
        match s.handle(Request::Stats) {
            Response::Stats(stats) => assert_eq!(stats.cache_misses, 2),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn mean_response_time_is_a_running_mean() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(false, dir.path());
        s.record_response(Duration::from_millis(10));
        s.record_response(Duration::from_millis(30));
        match s.handle(Request::Stats) {
            Response::Stats(stats) => {
                assert_eq!(stats.requests_served, 2);
                assert!((stats.mean_response_seconds - 0.020).abs() < 1e-9);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}

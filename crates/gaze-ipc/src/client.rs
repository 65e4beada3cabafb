use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use image::{GrayImage, RgbImage};
use thiserror::Error;

use gaze_core::face::{FaceBox, Landmarks};

use crate::proto::{
    decode, encode, EncodingsPayload, ProtoError, Request, Response, ServiceErrorKind,
    ServiceStats, WireLuma, WireRgb,
};
use crate::wire::{read_frame, write_frame, WireError};

/// Per-call socket timeout. The daemon answers detect/encode requests in
/// tens of milliseconds; anything beyond this means it is wedged and the
/// verifier should fail the attempt rather than hang the login.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not reach the daemon at all — "service down", as opposed to
    /// "service said no".
    #[error("model service unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Codec(#[from] ProtoError),
    /// The daemon processed the request and reported a typed failure.
    #[error("model service reported {0:?}")]
    Service(ServiceErrorKind),
    #[error("model service sent an unexpected response variant")]
    UnexpectedResponse,
}

/// Blocking client for the model daemon. Each call opens a fresh
/// connection, performs one request/response round, and closes — the
/// connection model the daemon expects.
#[derive(Clone, Debug)]
pub struct ModelClient {
    socket_path: PathBuf,
}

impl ModelClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn round_trip(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream =
            UnixStream::connect(&self.socket_path).map_err(|source| ClientError::Unavailable {
                path: self.socket_path.clone(),
                source,
            })?;
        stream.set_read_timeout(Some(CALL_TIMEOUT)).ok();
        stream.set_write_timeout(Some(CALL_TIMEOUT)).ok();

        write_frame(&mut stream, &encode(request)?)?;
        let payload = read_frame(&mut stream)?;
        Ok(decode(&payload)?)
    }

    /// Reachability and readiness probe.
    pub fn ping(&self) -> Result<(bool, bool), ClientError> {
        match self.round_trip(&Request::Ping)? {
            Response::Pong {
                alive,
                models_loaded,
            } => Ok((alive, models_loaded)),
            Response::Error { kind } => Err(ClientError::Service(kind)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetch a user's enrollment; `None` means the user has none.
    pub fn get_encodings(&self, username: &str) -> Result<Option<EncodingsPayload>, ClientError> {
        match self.round_trip(&Request::GetEncodings {
            username: username.to_string(),
        })? {
            Response::Encodings(payload) => Ok(payload),
            Response::Error { kind } => Err(ClientError::Service(kind)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Detect faces on a luma frame; rectangles come back ordered by the
    /// daemon (best first).
    pub fn detect_faces(&self, luma: &GrayImage) -> Result<Vec<FaceBox>, ClientError> {
        match self.round_trip(&Request::DetectFaces {
            frame: WireLuma::from_image(luma),
        })? {
            Response::Faces(faces) => Ok(faces),
            Response::Error { kind } => Err(ClientError::Service(kind)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn get_landmarks(&self, rgb: &RgbImage, bbox: &FaceBox) -> Result<Landmarks, ClientError> {
        match self.round_trip(&Request::GetLandmarks {
            frame: WireRgb::from_image(rgb),
            bbox: *bbox,
        })? {
            Response::Landmarks(points) => {
                Landmarks::from_points(points).ok_or(ClientError::UnexpectedResponse)
            }
            Response::Error { kind } => Err(ClientError::Service(kind)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn get_face_encoding(
        &self,
        rgb: &RgbImage,
        bbox: &FaceBox,
    ) -> Result<Vec<f64>, ClientError> {
        match self.round_trip(&Request::GetFaceEncoding {
            frame: WireRgb::from_image(rgb),
            bbox: *bbox,
        })? {
            Response::Encoding(descriptor) => Ok(descriptor),
            Response::Error { kind } => Err(ClientError::Service(kind)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn invalidate(&self, username: &str) -> Result<(), ClientError> {
        match self.round_trip(&Request::Invalidate {
            username: username.to_string(),
        })? {
            Response::Invalidated => Ok(()),
            Response::Error { kind } => Err(ClientError::Service(kind)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn stats(&self) -> Result<ServiceStats, ClientError> {
        match self.round_trip(&Request::Stats)? {
            Response::Stats(stats) => Ok(stats),
            Response::Error { kind } => Err(ClientError::Service(kind)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    /// Minimal in-process daemon stand-in: answers each connection with a
    /// canned response derived from the decoded request.
    fn spawn_stub(path: &Path, rounds: usize) -> std::thread::JoinHandle<()> {
        let listener = UnixListener::bind(path).unwrap();
        std::thread::spawn(move || {
            for _ in 0..rounds {
                let (mut stream, _) = listener.accept().unwrap();
                let payload = read_frame(&mut stream).unwrap();
                let response = match decode::<Request>(&payload) {
                    Ok(Request::Ping) => Response::Pong {
                        alive: true,
                        models_loaded: true,
                    },
                    Ok(Request::GetEncodings { username }) if username == "alice" => {
                        Response::Encodings(Some(EncodingsPayload {
                            vectors: vec![vec![0.1; 4]],
                            meta: vec![gaze_core::enrollment::DescriptorMeta {
                                label: "default".to_string(),
                                time: 0,
                            }],
                            source_mtime: std::time::SystemTime::UNIX_EPOCH,
                        }))
                    }
                    Ok(Request::GetEncodings { .. }) => Response::Encodings(None),
                    Ok(Request::DetectFaces { frame }) => {
                        assert!(frame.into_image().is_some());
                        Response::Faces(vec![FaceBox::new(1.0, 2.0, 3.0, 4.0)])
                    }
                    Ok(_) => Response::Error {
                        kind: ServiceErrorKind::Internal,
                    },
                    Err(_) => Response::Error {
                        kind: ServiceErrorKind::Unknown,
                    },
                };
                write_frame(&mut stream, &encode(&response).unwrap()).unwrap();
            }
        })
    }

    #[test]
    fn connect_failure_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = ModelClient::new(dir.path().join("absent.sock"));
        let err = client.ping().unwrap_err();
        assert!(matches!(err, ClientError::Unavailable { .. }));
    }

    #[test]
    fn ping_and_typed_calls_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gazed.sock");
        let handle = spawn_stub(&path, 4);

        let client = ModelClient::new(&path);
        assert_eq!(client.ping().unwrap(), (true, true));

        let payload = client.get_encodings("alice").unwrap().unwrap();
        assert_eq!(payload.vectors.len(), 1);
        assert!(client.get_encodings("bob").unwrap().is_none());

        let luma = GrayImage::from_pixel(4, 4, image::Luma([9]));
        let faces = client.detect_faces(&luma).unwrap();
        assert_eq!(faces, vec![FaceBox::new(1.0, 2.0, 3.0, 4.0)]);

        handle.join().unwrap();
    }

    #[test]
    fn service_error_is_distinct_from_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gazed.sock");
        let handle = spawn_stub(&path, 1);

        let client = ModelClient::new(&path);
        // The stub answers Stats with an Internal error.
        let err = client.stats().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Service(ServiceErrorKind::Internal)
        ));
        handle.join().unwrap();
    }
}

use std::sync::Arc;
use std::time::Instant;

use tokio::net::{UnixListener, UnixStream};

use gaze_ipc::proto::{decode, encode, Request, Response, ServiceErrorKind};
use gaze_ipc::wire::{read_frame_async, write_frame_async};

use crate::service::{ModelService, VisionBackend};

/// Accept loop: one task per connection, one request/response round per
/// connection. Runs until the listener errors or the daemon is shut down.
pub async fn run<B: VisionBackend>(
    service: Arc<ModelService<B>>,
    listener: UnixListener,
) -> std::io::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            handle_connection(stream, service).await;
        });
    }
}

async fn handle_connection<B: VisionBackend>(mut stream: UnixStream, service: Arc<ModelService<B>>) {
    let started = Instant::now();

    let payload = match read_frame_async(&mut stream).await {
        Ok(payload) => payload,
        Err(e) if e.is_premature_close() => {
            tracing::debug!("peer closed before sending a full frame");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "dropping connection after framing error");
            return;
        }
    };

    let response = match decode::<Request>(&payload) {
        Ok(request) => {
            // Model work is CPU-bound and serializes on the service lock;
            // keep it off the async workers. A panicking model call is
            // contained here and answered as a typed error.
            let svc = Arc::clone(&service);
            match tokio::task::spawn_blocking(move || svc.handle(request)).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "request handler panicked");
                    Response::Error {
                        kind: ServiceErrorKind::Internal,
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "undecodable request payload");
            Response::Error {
                kind: ServiceErrorKind::Unknown,
            }
        }
    };

    service.record_response(started.elapsed());

    match encode(&response) {
        Ok(bytes) => {
            if let Err(e) = write_frame_async(&mut stream, &bytes).await {
                tracing::debug!(error = %e, "failed to write response, peer gone");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelError;
    use gaze_core::face::{FaceBox, Point};
    use gaze_ipc::client::{ClientError, ModelClient};
    use image::{GrayImage, RgbImage};
    use std::time::Duration;

    struct StubBackend;

    impl VisionBackend for StubBackend {
        fn detect(&self, _luma: &GrayImage) -> Result<Vec<FaceBox>, ModelError> {
            Ok(vec![FaceBox::new(5.0, 5.0, 25.0, 25.0)])
        }

        fn landmarks(&self, _rgb: &RgbImage, _bbox: &FaceBox) -> Result<Vec<Point>, ModelError> {
            Ok(vec![Point::new(1.0, 1.0); 68])
        }

        fn encode(&self, _rgb: &RgbImage, _bbox: &FaceBox) -> Result<Vec<f64>, ModelError> {
            Ok(vec![0.5; gaze_core::DESCRIPTOR_DIM])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_and_server_speak_the_same_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("gazed.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let service = Arc::new(ModelService::new(
            StubBackend,
            dir.path().to_path_buf(),
            Duration::from_millis(100),
        ));
        let server = tokio::spawn(run(Arc::clone(&service), listener));

        let socket_for_client = socket.clone();
        let results = tokio::task::spawn_blocking(move || {
            let client = ModelClient::new(&socket_for_client);
            let ping = client.ping()?;
            let faces = client.detect_faces(&GrayImage::from_pixel(8, 8, image::Luma([100])))?;
            let landmarks = client.get_landmarks(
                &RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3])),
                &faces[0],
            )?;
            let descriptor = client.get_face_encoding(
                &RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3])),
                &faces[0],
            )?;
            let missing = client.get_encodings("nobody")?;
            let stats = client.stats()?;
            Ok::<_, ClientError>((ping, faces, landmarks.arity(), descriptor, missing, stats))
        })
        .await
        .unwrap()
        .unwrap();

        let (ping, faces, arity, descriptor, missing, stats) = results;
        assert_eq!(ping, (true, true));
        assert_eq!(faces, vec![FaceBox::new(5.0, 5.0, 25.0, 25.0)]);
        assert_eq!(arity, 68);
        assert_eq!(descriptor.len(), gaze_core::DESCRIPTOR_DIM);
        assert!(missing.is_none());
        // Five rounds served before the stats call itself completed.
        assert!(stats.requests_served >= 5);

        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn undecodable_payload_gets_an_unknown_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("gazed.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let service = Arc::new(ModelService::new(
            StubBackend,
            dir.path().to_path_buf(),
            Duration::from_millis(100),
        ));
        let server = tokio::spawn(run(Arc::clone(&service), listener));

        let socket_for_client = socket.clone();
        let response = tokio::task::spawn_blocking(move || {
            use gaze_ipc::wire::{read_frame, write_frame};
            let mut stream = std::os::unix::net::UnixStream::connect(&socket_for_client).unwrap();
            write_frame(&mut stream, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
            let payload = read_frame(&mut stream).unwrap();
            decode::<Response>(&payload).unwrap()
        })
        .await
        .unwrap();

        assert_eq!(
            response,
            Response::Error {
                kind: ServiceErrorKind::Unknown
            }
        );
        server.abort();
    }
}

//! Single-attempt driver: wires the daemon client, camera pipeline,
//! liveness engine, journal, and UI together and decides the outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use gaze_core::enrollment::EnrollmentSet;
use gaze_core::face::{FaceBox, MatchDecision};
use gaze_core::frame::Frame;
use gaze_core::journal::{JournalKind, SecurityJournal};
use gaze_core::liveness::{LivenessEngine, LivenessSignal};
use gaze_core::matcher::nearest_match;
use gaze_core::Config;
use gaze_ipc::client::{ClientError, ModelClient};
use gaze_ipc::proto::ServiceErrorKind;

use crate::camera::{FrameSource, V4l2Source};
use crate::outcome::AuthOutcome;
use crate::pipeline::{default_worker_count, FaceFinder, FramePipeline, PipelineOptions};
use crate::snapshot::{write_snapshot, SNAPSHOT_FRAMES};
use crate::ui::StatusUi;

/// Pipeline workers ask the daemon for detections and descriptors; the
/// session thread separately asks for landmarks on candidate matches only.
struct DaemonFinder {
    client: ModelClient,
}

impl FaceFinder for DaemonFinder {
    fn find_faces(&self, frame: &Frame) -> Result<Vec<(FaceBox, Vec<f64>)>, ClientError> {
        let faces = self.client.detect_faces(&frame.luma)?;
        let mut out = Vec::with_capacity(faces.len());
        for bbox in faces {
            match self.client.get_face_encoding(&frame.rgb, &bbox) {
                Ok(descriptor) => out.push((bbox, descriptor)),
                // A single face failing to encode is not a transport fault.
                Err(ClientError::Service(kind)) => {
                    tracing::debug!(?kind, "descriptor request failed for one face");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Run one authentication attempt for `username`.
pub fn run_attempt(username: &str, config: &Config) -> AuthOutcome {
    let session_id = uuid::Uuid::new_v4();
    let client = ModelClient::new(&config.daemon.socket_path);

    // The journal is the audit trail and the lockout source of truth. If
    // it cannot be opened the attempt still runs, loudly.
    let journal = match SecurityJournal::open(&config.daemon.journal_path) {
        Ok(journal) => Some(journal),
        Err(e) => {
            tracing::error!(
                path = %config.daemon.journal_path.display(),
                error = %e,
                "security journal unavailable, lockout disabled for this attempt"
            );
            None
        }
    };

    // 1. Service reachability.
    match client.ping() {
        Ok((true, true)) => {}
        other => {
            tracing::warn!(?other, "model service not ready");
            if let Some(j) = &journal {
                j.record_event(
                    JournalKind::ServiceError,
                    Some(username),
                    json!({"error": "service_unavailable", "session_id": session_id.to_string()}),
                );
            }
            return AuthOutcome::ServiceUnavailable;
        }
    }

    // 2. Lockout — decided before the camera is ever touched.
    if let Some(j) = &journal {
        if j.is_locked(username) {
            tracing::warn!(username, "attempt while locked out");
            j.record_event(
                JournalKind::UserLocked,
                Some(username),
                json!({"session_id": session_id.to_string()}),
            );
            return AuthOutcome::Locked;
        }
    }

    // 3. Enrollment.
    let enrollment = match fetch_enrollment(&client, username) {
        Ok(set) => set,
        Err(outcome) => {
            if let Some(j) = &journal {
                match outcome {
                    AuthOutcome::ServiceUnavailable => j.record_event(
                        JournalKind::ServiceError,
                        Some(username),
                        json!({"error": "service_unavailable", "session_id": session_id.to_string()}),
                    ),
                    _ => {
                        let mut metadata = base_metadata(session_id);
                        insert_error(&mut metadata, outcome);
                        j.record_attempt(username, false, metadata);
                    }
                }
            }
            return outcome;
        }
    };
    tracing::info!(
        username,
        descriptors = enrollment.len(),
        "enrollment loaded"
    );

    let mut ui = StatusUi::spawn();
    ui.show_message("Identifying you...");

    // 4. Camera.
    let camera_started = Instant::now();
    let source = match V4l2Source::open(&config.video.device) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(error = %e, device = config.video.device, "camera open failed");
            if let Some(j) = &journal {
                j.record_event(
                    JournalKind::CameraError,
                    Some(username),
                    json!({"detail": e.to_string(), "session_id": session_id.to_string()}),
                );
                let mut metadata = base_metadata(session_id);
                insert_error(&mut metadata, AuthOutcome::CameraError);
                j.record_attempt(username, false, metadata);
            }
            ui.show_message(AuthOutcome::CameraError.message());
            return AuthOutcome::CameraError;
        }
    };
    let camera_open = camera_started.elapsed();

    // SIGINT takes the same stop path as the deadline.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || interrupted.store(true, Ordering::Relaxed)) {
            tracing::debug!(error = %e, "signal handler not installed");
        }
    }

    // 5. Pipeline + liveness.
    let (_, height) = source.dimensions();
    let base_scale = if height > config.video.max_height {
        f64::from(config.video.max_height) / f64::from(height)
    } else {
        1.0
    };
    let options = PipelineOptions {
        workers: default_worker_count(),
        enable_adaptive: config.video.enable_adaptive_processing,
        enable_quality: config.video.enable_quality_filtering,
        dark_threshold: config.video.dark_threshold,
        base_scale,
    };
    let finder = Arc::new(DaemonFinder {
        client: client.clone(),
    });
    let mut pipeline = FramePipeline::start(Box::new(source), finder, options);
    let mut engine = config
        .security
        .liveness_check
        .then(|| LivenessEngine::new(config.security.clone()));

    let deadline = Duration::from_secs_f64(config.video.timeout);
    let scan_started = Instant::now();
    let mut best: Option<MatchDecision> = None;
    let mut snapframes: Vec<Arc<Frame>> = Vec::new();
    let keep_snapshots = config.snapshots.save_failed || config.snapshots.save_successful;

    let mut outcome = 'scan: loop {
        if interrupted.load(Ordering::Relaxed) {
            tracing::info!("interrupted, stopping attempt");
            break AuthOutcome::Timeout;
        }
        if scan_started.elapsed() > deadline {
            break AuthOutcome::Timeout;
        }

        {
            let stats = pipeline.stats();
            ui.show_subtitle(&scan_subtitle(
                stats.get(&stats.frames_processed),
                stats.get(&stats.dark_frames),
            ));
        }

        let Some(obs) = pipeline.next_observation(Duration::from_millis(100)) else {
            continue;
        };

        if keep_snapshots
            && snapframes.len() < SNAPSHOT_FRAMES
            && snapframes.iter().all(|f| f.sequence != obs.frame.sequence)
        {
            snapframes.push(Arc::clone(&obs.frame));
        }

        let Some(decision) = nearest_match(&obs.descriptor, &enrollment) else {
            continue;
        };
        if best.map_or(true, |b| decision.distance < b.distance) {
            best = Some(decision);
        }
        if !decision.is_accepting(config.video.certainty) {
            continue;
        }

        // A passing distance is necessary, never sufficient: liveness gates
        // the accept (unless explicitly disabled by configuration).
        match engine.as_mut() {
            None => break AuthOutcome::Success,
            Some(engine) => {
                let landmarks = match client.get_landmarks(&obs.frame.rgb, &obs.bbox) {
                    Ok(landmarks) => landmarks,
                    Err(e) => {
                        tracing::debug!(error = %e, "landmark request failed");
                        continue;
                    }
                };
                match engine.process_frame(&obs.frame, &landmarks, &obs.bbox) {
                    LivenessSignal::Accept => break AuthOutcome::Success,
                    LivenessSignal::Reject => break 'scan AuthOutcome::SpoofDetected,
                    LivenessSignal::Continue => {
                        if let Some(prompt) = engine.prompt() {
                            ui.show_message(prompt);
                        }
                    }
                }
            }
        }
    };

    if outcome == AuthOutcome::Timeout && pipeline.stats().all_frames_dark() {
        outcome = AuthOutcome::TooDark;
    }

    pipeline.stop();
    let elapsed = scan_started.elapsed();

    // 6. Journal, snapshot, report.
    let stats = pipeline.stats();
    let mut metadata = base_metadata(session_id);
    if let Value::Object(map) = &mut metadata {
        map.insert(
            "frames_processed".into(),
            stats.get(&stats.frames_processed).into(),
        );
        map.insert(
            "frames_captured".into(),
            stats.get(&stats.frames_captured).into(),
        );
        map.insert("dark_frames".into(), stats.get(&stats.dark_frames).into());
        map.insert("elapsed_ms".into(), (elapsed.as_millis() as u64).into());
        if let Some(engine) = &engine {
            map.insert("spoof_score".into(), engine.spoof_score().into());
            map.insert(
                "challenges_completed".into(),
                engine.completed_challenges().into(),
            );
        }
        if let Some(best) = best {
            map.insert("nearest_distance".into(), best.distance.into());
        }
    }

    match outcome {
        AuthOutcome::Success => {
            let decision = best.expect("success implies a match decision");
            if let Value::Object(map) = &mut metadata {
                map.insert("distance".into(), decision.distance.into());
                map.insert("enrollment_index".into(), decision.enrollment_index.into());
            }
            if let Some(j) = &journal {
                j.record_attempt(username, true, metadata);
            }
            ui.show_message(AuthOutcome::Success.message());
            if config.snapshots.save_successful {
                save_snapshot(config, "successful", &snapframes);
            }
            if config.debug.end_report {
                print_end_report(camera_open, elapsed, stats, &decision, &enrollment);
            }
        }
        AuthOutcome::SpoofDetected => {
            if let Some(j) = &journal {
                j.record_event(
                    JournalKind::SpoofDetected,
                    Some(username),
                    json!({
                        "session_id": session_id.to_string(),
                        "spoof_score": engine.as_ref().map(LivenessEngine::spoof_score),
                    }),
                );
                insert_error(&mut metadata, outcome);
                j.record_attempt(username, false, metadata);
            }
            ui.show_message(outcome.message());
            if config.snapshots.save_failed {
                save_snapshot(config, "failed", &snapframes);
            }
        }
        _ => {
            if let Some(j) = &journal {
                insert_error(&mut metadata, outcome);
                j.record_attempt(username, false, metadata);
            }
            ui.show_message(outcome.message());
            if config.snapshots.save_failed {
                save_snapshot(config, "failed", &snapframes);
            }
        }
    }

    outcome
}

/// Fetch and validate the enrollment, mapping every failure to the
/// outcome the host framework should see.
fn fetch_enrollment(client: &ModelClient, username: &str) -> Result<EnrollmentSet, AuthOutcome> {
    let payload = match client.get_encodings(username) {
        Ok(Some(payload)) => payload,
        Ok(None) => return Err(AuthOutcome::NoEnrollment),
        Err(ClientError::Service(ServiceErrorKind::EnrollmentCorrupt)) => {
            tracing::error!(username, "enrollment file is corrupt");
            return Err(AuthOutcome::NoEnrollment);
        }
        Err(e) => {
            tracing::error!(error = %e, "enrollment fetch failed");
            return Err(AuthOutcome::ServiceUnavailable);
        }
    };
    EnrollmentSet::from_rows(payload.vectors, payload.meta, payload.source_mtime).map_err(
        |detail| {
            tracing::error!(username, detail, "enrollment payload rejected");
            AuthOutcome::NoEnrollment
        },
    )
}

/// Process-level facts every journal record carries.
fn base_metadata(session_id: uuid::Uuid) -> Value {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    json!({
        "pid": std::process::id(),
        "hostname": hostname,
        "session_id": session_id.to_string(),
        "ssh_connection": std::env::var("SSH_CONNECTION").unwrap_or_default(),
        "display": std::env::var("DISPLAY").unwrap_or_default(),
    })
}

fn insert_error(metadata: &mut Value, outcome: AuthOutcome) {
    if let (Value::Object(map), Some(error)) = (metadata, outcome.journal_error()) {
        map.insert("error".into(), error.into());
    }
}

fn scan_subtitle(processed: u64, dark: u64) -> String {
    if dark > 1 {
        format!("Scanned {processed} frames (skipped {dark} dark)")
    } else {
        format!("Scanned {processed} frames")
    }
}

fn save_snapshot(config: &Config, tag: &str, frames: &[Arc<Frame>]) {
    match write_snapshot(&config.snapshots.dir, tag, frames) {
        Ok(Some(path)) => tracing::info!(path = %path.display(), "snapshot written"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "snapshot failed"),
    }
}

fn print_end_report(
    camera_open: Duration,
    elapsed: Duration,
    stats: &crate::pipeline::PipelineStats,
    decision: &MatchDecision,
    enrollment: &EnrollmentSet,
) {
    let frames = stats.get(&stats.frames_captured);
    let fps = frames as f64 / elapsed.as_secs_f64().max(0.001);
    println!("Time spent");
    println!("  Opening camera: {}ms", camera_open.as_millis());
    println!("  Searching: {}ms", elapsed.as_millis());
    println!(
        "Frames: {frames} ({fps:.2} fps), processed {}, skipped {} adaptive / {} quality",
        stats.get(&stats.frames_processed),
        stats.get(&stats.frames_skipped_adaptive),
        stats.get(&stats.frames_skipped_quality),
    );
    println!("Distance: {:.3}", decision.distance);
    let label = enrollment
        .meta
        .get(decision.enrollment_index)
        .map_or("?", |m| m.label.as_str());
    println!(
        "Model: {} (\"{label}\")",
        decision.enrollment_index
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtitle_mentions_dark_frames_only_when_present() {
        assert_eq!(scan_subtitle(12, 0), "Scanned 12 frames");
        assert_eq!(scan_subtitle(12, 1), "Scanned 12 frames");
        assert_eq!(scan_subtitle(12, 5), "Scanned 12 frames (skipped 5 dark)");
    }

    #[test]
    fn base_metadata_carries_process_facts() {
        let id = uuid::Uuid::new_v4();
        let metadata = base_metadata(id);
        assert_eq!(metadata["session_id"], id.to_string());
        assert!(metadata["pid"].as_u64().unwrap() > 0);
        assert!(metadata.get("hostname").is_some());
        assert!(metadata.get("ssh_connection").is_some());
        assert!(metadata.get("display").is_some());
    }

    #[test]
    fn error_insertion_skips_success() {
        let mut m = json!({});
        insert_error(&mut m, AuthOutcome::Success);
        assert!(m.get("error").is_none());
        insert_error(&mut m, AuthOutcome::Timeout);
        assert_eq!(m["error"], "timeout");
    }
}

//! Core types and decision logic shared by the Gaze daemon and verifier.
//!
//! Nothing in this crate touches a camera, a socket, or an ONNX runtime;
//! it is the pure substrate both binaries build on: frame containers,
//! enrollment data, descriptor matching, frame quality analysis, the
//! liveness engine, the security journal, and configuration.

pub mod config;
pub mod enrollment;
pub mod face;
pub mod frame;
pub mod journal;
pub mod liveness;
pub mod matcher;
pub mod quality;

pub use config::Config;
pub use enrollment::{DescriptorMeta, EnrollmentError, EnrollmentSet};
pub use face::{FaceBox, FaceObservation, Landmarks, MatchDecision, Point};
pub use frame::{Frame, FrameDigest};
pub use journal::{JournalKind, SecurityJournal};
pub use liveness::{LivenessEngine, LivenessSignal};
pub use matcher::nearest_match;
pub use quality::{QualityGate, QualityReport};

/// Descriptor dimension produced by the encoder and stored in enrollments.
pub const DESCRIPTOR_DIM: usize = 128;

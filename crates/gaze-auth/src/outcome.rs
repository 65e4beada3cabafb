/// Typed outcome of one authentication attempt. The exit code is the
/// contract with the host authentication framework; nothing else this
/// process emits is authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    ServiceUnavailable,
    NoEnrollment,
    Timeout,
    InvalidInvocation,
    TooDark,
    CameraError,
    Locked,
    SpoofDetected,
}

impl AuthOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            AuthOutcome::Success => 0,
            AuthOutcome::ServiceUnavailable => 1,
            AuthOutcome::NoEnrollment => 10,
            AuthOutcome::Timeout => 11,
            AuthOutcome::InvalidInvocation => 12,
            AuthOutcome::TooDark => 13,
            AuthOutcome::CameraError => 14,
            AuthOutcome::Locked => 15,
            AuthOutcome::SpoofDetected => 16,
        }
    }

    /// Error string recorded in the journal metadata for failures.
    pub fn journal_error(self) -> Option<&'static str> {
        match self {
            AuthOutcome::Success => None,
            AuthOutcome::ServiceUnavailable => Some("service_unavailable"),
            AuthOutcome::NoEnrollment => Some("no_face_model"),
            AuthOutcome::Timeout => Some("timeout"),
            AuthOutcome::InvalidInvocation => Some("invalid_invocation"),
            AuthOutcome::TooDark => Some("too_dark"),
            AuthOutcome::CameraError => Some("camera_error"),
            AuthOutcome::Locked => Some("user_locked"),
            AuthOutcome::SpoofDetected => Some("spoof_detected"),
        }
    }

    /// Short user-facing line for the UI channel.
    pub fn message(self) -> &'static str {
        match self {
            AuthOutcome::Success => "Identified",
            AuthOutcome::ServiceUnavailable => "Authentication service unavailable",
            AuthOutcome::NoEnrollment => "No face model known",
            AuthOutcome::Timeout => "Could not identify you in time",
            AuthOutcome::InvalidInvocation => "Invalid invocation",
            AuthOutcome::TooDark => "Too dark, check your lighting",
            AuthOutcome::CameraError => "Camera unavailable",
            AuthOutcome::Locked => "Too many failed attempts, try again later",
            AuthOutcome::SpoofDetected => "Liveness check failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_host_contract() {
        assert_eq!(AuthOutcome::Success.exit_code(), 0);
        assert_eq!(AuthOutcome::ServiceUnavailable.exit_code(), 1);
        assert_eq!(AuthOutcome::NoEnrollment.exit_code(), 10);
        assert_eq!(AuthOutcome::Timeout.exit_code(), 11);
        assert_eq!(AuthOutcome::InvalidInvocation.exit_code(), 12);
        assert_eq!(AuthOutcome::TooDark.exit_code(), 13);
        assert_eq!(AuthOutcome::CameraError.exit_code(), 14);
        assert_eq!(AuthOutcome::Locked.exit_code(), 15);
        assert_eq!(AuthOutcome::SpoofDetected.exit_code(), 16);
    }

    #[test]
    fn success_has_no_journal_error() {
        assert!(AuthOutcome::Success.journal_error().is_none());
        assert_eq!(AuthOutcome::Timeout.journal_error(), Some("timeout"));
        assert_eq!(
            AuthOutcome::NoEnrollment.journal_error(),
            Some("no_face_model")
        );
    }
}

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum consecutive counted failures before lockout.
const MAX_FAILURES: u32 = 5;
/// Failures further apart than this do not accumulate.
const FAILURE_WINDOW: Duration = Duration::from_secs(300);
/// Lockout duration, measured from the last failure.
const LOCKOUT: Duration = Duration::from_secs(300);

/// Failure reasons that never count toward lockout: they say nothing about
/// whether someone is guessing at the camera. A corrupt enrollment is the
/// no-enrollment outcome wearing a different error string.
const EXEMPT_ERRORS: &[&str] = &["no_face_model", "service_unavailable", "enrollment_corrupt"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalKind {
    #[serde(rename = "AUTH_ATTEMPT")]
    AuthAttempt,
    #[serde(rename = "USER_LOCKED")]
    UserLocked,
    #[serde(rename = "CAMERA_ERROR")]
    CameraError,
    #[serde(rename = "SERVICE_ERROR")]
    ServiceError,
    #[serde(rename = "SPOOF_DETECTED")]
    SpoofDetected,
    #[serde(rename = "CONFIG_WARNING")]
    ConfigWarning,
}

/// One line of the security log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalRecord {
    pub timestamp_utc: String,
    pub kind: JournalKind,
    pub username: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Clone, Copy, Debug)]
struct LockoutState {
    consecutive_failures: u32,
    last_failure: SystemTime,
}

struct Inner {
    file: File,
    lockout: HashMap<String, LockoutState>,
}

/// Append-only security journal with lockout bookkeeping.
///
/// The verifier runs as one process per attempt, so the per-user failure
/// state is reconstructed from the log itself when the journal is opened.
/// That makes lockout a property of the log, not of any single process.
pub struct SecurityJournal {
    inner: Mutex<Inner>,
}

impl SecurityJournal {
    /// Open (or create) the journal at `path` and rebuild lockout state
    /// from the existing records.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lockout = match File::open(path) {
            Ok(existing) => rebuild_lockout(existing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Mutex::new(Inner { file, lockout }),
        })
    }

    /// Record an authentication attempt outcome. Failed attempts advance
    /// the lockout counter unless their error reason is exempt; success
    /// clears it.
    pub fn record_attempt(&self, username: &str, success: bool, metadata: Value) {
        let record = JournalRecord {
            timestamp_utc: chrono::Utc::now().to_rfc3339(),
            kind: JournalKind::AuthAttempt,
            username: Some(username.to_string()),
            success,
            metadata,
        };
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        apply_attempt(&mut inner.lockout, &record, SystemTime::now());
        write_record(&mut inner.file, &record);
    }

    /// Record a non-attempt security event (lockout hit, camera failure,
    /// spoof detection, configuration problems).
    pub fn record_event(&self, kind: JournalKind, username: Option<&str>, metadata: Value) {
        let record = JournalRecord {
            timestamp_utc: chrono::Utc::now().to_rfc3339(),
            kind,
            username: username.map(str::to_string),
            success: false,
            metadata,
        };
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        write_record(&mut inner.file, &record);
    }

    /// Whether the user is currently locked out. Stale failure records are
    /// garbage-collected here.
    pub fn is_locked(&self, username: &str) -> bool {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        let now = SystemTime::now();

        let Some(state) = inner.lockout.get(username).copied() else {
            return false;
        };
        let age = now
            .duration_since(state.last_failure)
            .unwrap_or(Duration::ZERO);
        if age >= LOCKOUT {
            inner.lockout.remove(username);
            return false;
        }
        state.consecutive_failures >= MAX_FAILURES
    }

    /// Current counted consecutive failures for a user (diagnostics).
    pub fn failure_count(&self, username: &str) -> u32 {
        let inner = self.inner.lock().expect("journal lock poisoned");
        inner
            .lockout
            .get(username)
            .map_or(0, |s| s.consecutive_failures)
    }
}

fn write_record(file: &mut File, record: &JournalRecord) {
    match serde_json::to_string(record) {
        Ok(line) => {
            if let Err(e) = writeln!(file, "{line}") {
                tracing::error!(error = %e, "failed to append security journal record");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize security journal record"),
    }
}

fn attempt_counts_toward_lockout(record: &JournalRecord) -> bool {
    if record.success {
        return false;
    }
    let error = record.metadata.get("error").and_then(Value::as_str);
    !matches!(error, Some(e) if EXEMPT_ERRORS.contains(&e))
}

fn apply_attempt(
    lockout: &mut HashMap<String, LockoutState>,
    record: &JournalRecord,
    at: SystemTime,
) {
    let Some(username) = record.username.as_deref() else {
        return;
    };
    if record.success {
        lockout.remove(username);
        return;
    }
    if !attempt_counts_toward_lockout(record) {
        return;
    }

    let state = lockout
        .entry(username.to_string())
        .or_insert(LockoutState {
            consecutive_failures: 0,
            last_failure: at,
        });
    let since_last = at
        .duration_since(state.last_failure)
        .unwrap_or(Duration::ZERO);
    if since_last >= FAILURE_WINDOW {
        state.consecutive_failures = 0;
    }
    state.consecutive_failures += 1;
    state.last_failure = at;
}

/// Replay AUTH_ATTEMPT records from an existing log to rebuild the per-user
/// failure counters. Unparseable lines are skipped: the journal must keep
/// working even if an operator edited it by hand.
fn rebuild_lockout(file: File) -> HashMap<String, LockoutState> {
    let mut lockout = HashMap::new();
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        let Ok(record) = serde_json::from_str::<JournalRecord>(&line) else {
            continue;
        };
        if record.kind != JournalKind::AuthAttempt {
            continue;
        }
        let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(&record.timestamp_utc) else {
            continue;
        };
        apply_attempt(&mut lockout, &record, SystemTime::from(parsed));
    }
    lockout
}

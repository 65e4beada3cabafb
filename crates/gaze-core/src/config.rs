use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// How demanding the liveness engine is about active challenges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Medium,
    High,
}

impl SecurityLevel {
    /// Number of distinct challenges the level requires.
    pub fn required_challenges(self) -> usize {
        match self {
            SecurityLevel::Medium => 1,
            SecurityLevel::High => 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Select the convolutional detector variant instead of the faster
    /// window-scan one.
    pub use_cnn: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self { use_cnn: false }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Authentication deadline in seconds, wall-clock from capture start.
    pub timeout: f64,
    /// Fraction of pixels in the darkest bin above which a frame counts
    /// as too dark, in [0, 1].
    pub dark_threshold: f64,
    /// Match acceptance threshold on descriptor distance.
    pub certainty: f64,
    /// Frames taller than this are scaled down before processing.
    pub max_height: u32,
    pub enable_quality_filtering: bool,
    pub enable_adaptive_processing: bool,
    /// V4L2 capture device.
    pub device: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            timeout: 4.0,
            dark_threshold: 0.6,
            certainty: 0.35,
            max_height: 320,
            enable_quality_filtering: true,
            enable_adaptive_processing: true,
            device: "/dev/video0".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Master switch: a match alone never authenticates when on.
    pub liveness_check: bool,
    /// Prefer the full challenge pool when 68-point landmarks exist.
    pub advanced_liveness: bool,
    pub active_challenge: bool,
    pub frequency_analysis: bool,
    pub temporal_analysis: bool,
    pub security_level: SecurityLevel,
    /// Seconds granted per active challenge.
    pub challenge_timeout: f64,
    pub moire_threshold: f64,
    /// Samples required before the static-scene cue may fire.
    pub min_consistency_frames: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            liveness_check: true,
            advanced_liveness: false,
            active_challenge: true,
            frequency_analysis: true,
            temporal_analysis: true,
            security_level: SecurityLevel::Medium,
            challenge_timeout: 3.0,
            moire_threshold: 0.15,
            min_consistency_frames: 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub save_failed: bool,
    pub save_successful: bool,
    pub dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            save_failed: false,
            save_successful: false,
            dir: PathBuf::from("/var/lib/gaze/snapshots"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Print the timing table after a successful attempt.
    pub end_report: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub model_dir: PathBuf,
    pub user_dir: PathBuf,
    pub journal_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/gaze/gazed.sock"),
            pid_path: PathBuf::from("/run/gaze/gazed.pid"),
            model_dir: PathBuf::from("/var/lib/gaze/models"),
            user_dir: PathBuf::from("/var/lib/gaze/users"),
            journal_path: PathBuf::from("/var/log/gaze/security.log"),
        }
    }
}

/// Whole-system configuration. Every key has a documented default, so an
/// absent file and an empty file both yield a working baseline.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub video: VideoConfig,
    pub security: SecurityConfig,
    pub snapshots: SnapshotConfig,
    pub debug: DebugConfig,
    pub daemon: DaemonConfig,
}

impl Config {
    /// Parse a TOML config file and clamp out-of-range values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.sanitize();
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Clamp values that would otherwise break invariants downstream.
    pub fn sanitize(&mut self) {
        let v = &mut self.video;
        if !(0.0..=1.0).contains(&v.dark_threshold) {
            tracing::warn!(value = v.dark_threshold, "video.dark_threshold clamped to [0,1]");
            v.dark_threshold = v.dark_threshold.clamp(0.0, 1.0);
        }
        if v.certainty <= 0.0 {
            tracing::warn!(value = v.certainty, "video.certainty must be positive, using default");
            v.certainty = VideoConfig::default().certainty;
        }
        if v.timeout <= 0.0 {
            tracing::warn!(value = v.timeout, "video.timeout must be positive, using default");
            v.timeout = VideoConfig::default().timeout;
        }
        let s = &mut self.security;
        if s.challenge_timeout <= 0.0 {
            tracing::warn!(
                value = s.challenge_timeout,
                "security.challenge_timeout must be positive, using default"
            );
            s.challenge_timeout = SecurityConfig::default().challenge_timeout;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_baseline() {
        let c = Config::default();
        assert!(!c.core.use_cnn);
        assert_eq!(c.video.timeout, 4.0);
        assert_eq!(c.video.dark_threshold, 0.6);
        assert_eq!(c.video.certainty, 0.35);
        assert_eq!(c.video.max_height, 320);
        assert!(c.security.liveness_check);
        assert!(c.security.active_challenge);
        assert_eq!(c.security.security_level, SecurityLevel::Medium);
        assert_eq!(c.security.challenge_timeout, 3.0);
        assert_eq!(c.security.moire_threshold, 0.15);
        assert!(!c.snapshots.save_failed);
        assert!(!c.debug.end_report);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let c: Config = toml::from_str(
            r#"
            [video]
            certainty = 0.30
            [security]
            security_level = "high"
            "#,
        )
        .unwrap();
        assert_eq!(c.video.certainty, 0.30);
        assert_eq!(c.video.timeout, 4.0);
        assert_eq!(c.security.security_level, SecurityLevel::High);
        assert_eq!(c.security.security_level.required_challenges(), 2);
    }

    #[test]
    fn sanitize_clamps_bad_values() {
        let mut c = Config::default();
        c.video.dark_threshold = 60.0; // the legacy percent form
        c.video.certainty = -1.0;
        c.security.challenge_timeout = 0.0;
        c.sanitize();
        assert_eq!(c.video.dark_threshold, 1.0);
        assert_eq!(c.video.certainty, 0.35);
        assert_eq!(c.security.challenge_timeout, 3.0);
    }

    #[test]
    fn load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let c = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(c.video.certainty, 0.35);
    }

    #[test]
    fn load_parses_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[core]\nuse_cnn = true\n").unwrap();
        let c = Config::load(&path).unwrap();
        assert!(c.core.use_cnn);
    }
}

use std::path::{Path, PathBuf};

use facegate_core::{AuthConfig, LivenessProfile};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
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
    #[error("invalid configuration: {0}")]
    Invalid(#[from] facegate_core::ConfigError),
}

/// Daemon configuration, loaded from environment variables and an optional
/// TOML file holding the decision core settings.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
    /// Decision core settings.
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    ///
    /// `FACEGATE_CONFIG` names a TOML file with the decision core settings;
    /// `FACEGATE_EMBEDDING_DIM=128` selects the 128-dimensional preset when no
    /// file is given. Individual `FACEGATE_*` threshold variables override
    /// whatever the file or preset set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("identities.db"));

        let mut auth = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => load_auth_file(Path::new(&path))?,
            Err(_) => match env_usize("FACEGATE_EMBEDDING_DIM", 512) {
                128 => AuthConfig::facenet_128(),
                _ => AuthConfig::arcface_512(),
            },
        };
        apply_env_overrides(&mut auth);
        auth.validate()?;

        Ok(Self {
            db_path,
            session_bus: std::env::var("FACEGATE_SESSION_BUS").is_ok(),
            auth,
        })
    }
}

/// Parse an [`AuthConfig`] from a TOML file. Missing keys keep their defaults.
pub fn load_auth_file(path: &Path) -> Result<AuthConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_auth(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_auth(text: &str) -> Result<AuthConfig, toml::de::Error> {
    toml::from_str(text)
}

fn apply_env_overrides(auth: &mut AuthConfig) {
    let t = &mut auth.thresholds;
    t.similarity_threshold = env_f32("FACEGATE_SIMILARITY_THRESHOLD", t.similarity_threshold);
    t.minimum_uniqueness_gap = env_f32("FACEGATE_MIN_UNIQUENESS_GAP", t.minimum_uniqueness_gap);
    t.maximum_second_best_similarity = env_f32(
        "FACEGATE_MAX_SECOND_BEST_SIMILARITY",
        t.maximum_second_best_similarity,
    );
    t.cross_reference_threshold = env_f32(
        "FACEGATE_CROSS_REFERENCE_THRESHOLD",
        t.cross_reference_threshold,
    );
    t.required_security_gap = env_f32("FACEGATE_SECURITY_GAP", t.required_security_gap);

    auth.max_failed_attempts = env_u32("FACEGATE_MAX_FAILED_ATTEMPTS", auth.max_failed_attempts);
    auth.lockout_duration_secs = env_u64("FACEGATE_LOCKOUT_SECS", auth.lockout_duration_secs);
    auth.store_timeout_ms = env_u64("FACEGATE_STORE_TIMEOUT_MS", auth.store_timeout_ms);

    if let Ok(profile) = std::env::var("FACEGATE_LIVENESS_PROFILE") {
        match profile.as_str() {
            "lenient" => auth.liveness.profile = LivenessProfile::Lenient,
            "standard" => auth.liveness.profile = LivenessProfile::Standard,
            "strict" => auth.liveness.profile = LivenessProfile::Strict,
            other => tracing::warn!(profile = other, "unknown liveness profile, ignoring"),
        }
    }
    if std::env::var("FACEGATE_LANDMARK_CHECK").is_ok_and(|v| v == "0") {
        auth.liveness.min_landmark_displacement = None;
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

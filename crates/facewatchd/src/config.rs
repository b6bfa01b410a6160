use facewatch_core::DetectionParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Feature extractor and matching scorer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// Canonical 100×100 luminance crop scored by mean absolute difference.
    Luma,
    /// ArcFace embedding scored by rescaled cosine similarity.
    Arcface,
}

impl std::str::FromStr for ExtractorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "luma" => Ok(Self::Luma),
            "arcface" => Ok(Self::Arcface),
            other => Err(ConfigError::Invalid(format!("unknown extractor: {other}"))),
        }
    }
}

/// Message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// Optional settings read from the TOML file named by `FACEWATCH_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    image_dir: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    extractor: Option<ExtractorKind>,
    match_timeout_secs: Option<u64>,
    bus: Option<BusKind>,
    #[serde(default)]
    detection: FileDetection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileDetection {
    scale_step: Option<f32>,
    min_neighbors: Option<usize>,
    min_face_size: Option<u32>,
    score_threshold: Option<f32>,
    nms_threshold: Option<f32>,
}

/// Daemon configuration: defaults, overlaid by the optional TOML file,
/// overlaid by `FACEWATCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    /// Directory holding stored reference images.
    pub image_dir: PathBuf,
    /// Exclusive similarity threshold for a positive match.
    pub similarity_threshold: f32,
    pub extractor: ExtractorKind,
    /// Deadline in seconds for one match request, 0 disables it.
    pub match_timeout_secs: u64,
    pub bus: BusKind,
    pub detection: DetectionParams,
}

impl Config {
    /// Load configuration from `FACEWATCH_CONFIG` and `FACEWATCH_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var("FACEWATCH_CONFIG") {
            Ok(path) => Some(read_file(Path::new(&path))?),
            Err(_) => None,
        };
        Self::resolve(file.as_deref(), &|key| std::env::var(key).ok())
    }

    fn resolve(
        file: Option<&str>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = match file {
            Some(src) => toml::from_str(src)?,
            None => FileConfig::default(),
        };

        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch");

        let model_dir = env_path(env, "FACEWATCH_MODEL_DIR")
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));
        let db_path = env_path(env, "FACEWATCH_DB_PATH")
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("gallery.db"));
        let image_dir = env_path(env, "FACEWATCH_IMAGE_DIR")
            .or(file.image_dir)
            .unwrap_or_else(|| data_dir.join("references"));

        let extractor = match env("FACEWATCH_EXTRACTOR") {
            Some(v) => v.parse()?,
            None => file.extractor.unwrap_or(ExtractorKind::Luma),
        };

        let bus = match env("FACEWATCH_BUS").as_deref() {
            Some("session") => BusKind::Session,
            Some("system") => BusKind::System,
            Some(other) => {
                return Err(ConfigError::Invalid(format!("unknown bus: {other}")));
            }
            None => file.bus.unwrap_or(BusKind::System),
        };

        let defaults = DetectionParams::default();
        let detection = DetectionParams {
            scale_step: env_parse(env, "FACEWATCH_SCALE_STEP")
                .or(file.detection.scale_step)
                .unwrap_or(defaults.scale_step),
            min_neighbors: env_parse(env, "FACEWATCH_MIN_NEIGHBORS")
                .or(file.detection.min_neighbors)
                .unwrap_or(defaults.min_neighbors),
            min_face_size: env_parse(env, "FACEWATCH_MIN_FACE_SIZE")
                .or(file.detection.min_face_size)
                .unwrap_or(defaults.min_face_size),
            score_threshold: env_parse(env, "FACEWATCH_SCORE_THRESHOLD")
                .or(file.detection.score_threshold)
                .unwrap_or(defaults.score_threshold),
            nms_threshold: env_parse(env, "FACEWATCH_NMS_THRESHOLD")
                .or(file.detection.nms_threshold)
                .unwrap_or(defaults.nms_threshold),
        };

        let config = Self {
            model_dir,
            db_path,
            image_dir,
            similarity_threshold: env_parse(env, "FACEWATCH_SIMILARITY_THRESHOLD")
                .or(file.similarity_threshold)
                .unwrap_or(facewatch_core::DEFAULT_THRESHOLD),
            extractor,
            match_timeout_secs: env_parse(env, "FACEWATCH_MATCH_TIMEOUT_SECS")
                .or(file.match_timeout_secs)
                .unwrap_or(10),
            bus,
            detection,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.detection.scale_step.is_nan() || self.detection.scale_step <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "scale_step must be greater than 1, got {}",
                self.detection.scale_step
            )));
        }
        for (name, value) in [
            ("score_threshold", self.detection.score_threshold),
            ("nms_threshold", self.detection.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    /// Per-request deadline, if enabled.
    pub fn match_timeout(&self) -> Option<std::time::Duration> {
        (self.match_timeout_secs > 0).then(|| std::time::Duration::from_secs(self.match_timeout_secs))
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn env_path(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    env(key).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(file: Option<&str>, vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::resolve(file, &|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = resolve(None, &[("HOME", "/home/op")]).unwrap();
        assert_eq!(config.similarity_threshold, 0.7);
        assert_eq!(config.extractor, ExtractorKind::Luma);
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.db_path, PathBuf::from("/home/op/.local/share/facewatch/gallery.db"));
        assert_eq!(config.image_dir, PathBuf::from("/home/op/.local/share/facewatch/references"));
        assert_eq!(config.detection, DetectionParams::default());
        assert_eq!(config.match_timeout(), Some(std::time::Duration::from_secs(10)));
    }

    #[test]
    fn test_file_values() {
        let file = r#"
            similarity_threshold = 0.8
            extractor = "arcface"
            bus = "session"
            match_timeout_secs = 0

            [detection]
            scale_step = 1.5
            min_neighbors = 3
        "#;
        let config = resolve(Some(file), &[]).unwrap();
        assert_eq!(config.similarity_threshold, 0.8);
        assert_eq!(config.extractor, ExtractorKind::Arcface);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.detection.scale_step, 1.5);
        assert_eq!(config.detection.min_neighbors, 3);
        assert_eq!(config.detection.min_face_size, DetectionParams::default().min_face_size);
        assert_eq!(config.match_timeout(), None);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = "similarity_threshold = 0.8\nextractor = \"arcface\"";
        let config = resolve(
            Some(file),
            &[
                ("FACEWATCH_SIMILARITY_THRESHOLD", "0.65"),
                ("FACEWATCH_EXTRACTOR", "luma"),
                ("FACEWATCH_DB_PATH", "/var/lib/facewatch/g.db"),
            ],
        )
        .unwrap();
        assert_eq!(config.similarity_threshold, 0.65);
        assert_eq!(config.extractor, ExtractorKind::Luma);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facewatch/g.db"));
    }

    #[test]
    fn test_unparsable_env_falls_back() {
        let config = resolve(None, &[("FACEWATCH_MIN_NEIGHBORS", "many")]).unwrap();
        assert_eq!(config.detection.min_neighbors, DetectionParams::default().min_neighbors);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            resolve(None, &[("FACEWATCH_SIMILARITY_THRESHOLD", "1.5")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            resolve(None, &[("FACEWATCH_SCALE_STEP", "1.0")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            resolve(None, &[("FACEWATCH_EXTRACTOR", "sift")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            resolve(None, &[("FACEWATCH_BUS", "tcp")]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_file_keys() {
        assert!(matches!(
            resolve(Some("treshold = 0.5"), &[]),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_model_paths() {
        let config = resolve(None, &[("FACEWATCH_MODEL_DIR", "/opt/models")]).unwrap();
        assert_eq!(config.scrfd_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(config.arcface_model_path(), PathBuf::from("/opt/models/w600k_r50.onnx"));
    }
}

use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control socket path (default: /tmp/face_recognition.sock).
    pub socket_path: PathBuf,
    /// V4L2 device index, opened as /dev/video<N>.
    pub camera_device: u32,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path of the persisted similarity index.
    pub index_path: PathBuf,
    /// Enrollment images, one subdirectory per identity.
    pub dataset_dir: PathBuf,
    /// Minimum similarity (0-1) for a positive match.
    pub similarity_threshold: f32,
    /// Minimum face crop side in pixels.
    pub min_face_size: u32,
    pub frame_skip: u64,
    pub recognition_interval: Duration,
    pub queue_capacity: usize,
    /// Consecutive failed reads before capture stops itself.
    pub max_camera_errors: u32,
    /// Interval between records on a recognition stream.
    pub stream_interval: Duration,
    /// Pipeline driver tick.
    pub refresh_interval: Duration,
    pub flip_horizontal: bool,
    pub frame_scale: f32,
    pub min_images_per_identity: usize,
    pub max_connections: usize,
    pub read_timeout: Duration,
    /// Add captured faces to the live index immediately.
    pub auto_train: bool,
    pub camera_on_start: bool,
}

impl Config {
    /// Load configuration from `FREC_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FREC_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| frec_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("frec");

        Self {
            socket_path: env_path("FREC_SOCKET_PATH", PathBuf::from("/tmp/face_recognition.sock")),
            camera_device: env_parse("FREC_CAMERA_DEVICE", 0),
            camera_width: env_parse("FREC_CAMERA_WIDTH", 320),
            camera_height: env_parse("FREC_CAMERA_HEIGHT", 240),
            model_dir,
            db_path: env_path("FREC_DB_PATH", data_dir.join("faces.db")),
            index_path: env_path("FREC_INDEX_PATH", data_dir.join("face_index.bin")),
            dataset_dir: env_path("FREC_DATASET_DIR", data_dir.join("dataset")),
            similarity_threshold: env_parse("FREC_SIMILARITY_THRESHOLD", 0.70),
            min_face_size: env_parse("FREC_MIN_FACE_SIZE", 80),
            frame_skip: env_parse("FREC_FRAME_SKIP", 3),
            recognition_interval: Duration::from_millis(env_parse("FREC_RECOGNITION_INTERVAL_MS", 1500)),
            queue_capacity: env_parse("FREC_QUEUE_CAPACITY", 5),
            max_camera_errors: env_parse("FREC_MAX_CAMERA_ERRORS", 10),
            stream_interval: Duration::from_millis(env_parse("FREC_STREAM_INTERVAL_MS", 500)),
            refresh_interval: Duration::from_millis(env_parse("FREC_REFRESH_MS", 30)),
            flip_horizontal: env_flag("FREC_FLIP", true),
            frame_scale: env_parse("FREC_FRAME_SCALE", 1.0),
            min_images_per_identity: env_parse("FREC_MIN_IMAGES_PER_IDENTITY", 2),
            max_connections: env_parse("FREC_MAX_CONNECTIONS", 16),
            read_timeout: Duration::from_secs(env_parse("FREC_READ_TIMEOUT_SECS", 30)),
            auto_train: env_flag("FREC_AUTO_TRAIN", true),
            camera_on_start: env_flag("FREC_CAMERA_ON_START", false),
        }
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(frec_core::DETECTOR_MODEL_FILE)
    }

    pub fn embedding_model_path(&self) -> PathBuf {
        self.model_dir.join(frec_core::EMBEDDING_MODEL_FILE)
    }
}

impl Default for Config {
    /// Built-in defaults with every path under the current directory.
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/face_recognition.sock"),
            camera_device: 0,
            camera_width: 320,
            camera_height: 240,
            model_dir: PathBuf::from("models"),
            db_path: PathBuf::from("faces.db"),
            index_path: PathBuf::from("face_index.bin"),
            dataset_dir: PathBuf::from("dataset"),
            similarity_threshold: 0.70,
            min_face_size: 80,
            frame_skip: 3,
            recognition_interval: Duration::from_millis(1500),
            queue_capacity: 5,
            max_camera_errors: 10,
            stream_interval: Duration::from_millis(500),
            refresh_interval: Duration::from_millis(30),
            flip_horizontal: true,
            frame_scale: 1.0,
            min_images_per_identity: 2,
            max_connections: 16,
            read_timeout: Duration::from_secs(30),
            auto_train: true,
            camera_on_start: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_helpers() {
        std::env::set_var("FREC_TEST_FLOAT", "0.55");
        std::env::set_var("FREC_TEST_BAD", "many");
        std::env::set_var("FREC_TEST_FLAG", "0");
        assert_eq!(env_parse("FREC_TEST_FLOAT", 0.7f32), 0.55);
        assert_eq!(env_parse("FREC_TEST_BAD", 16usize), 16);
        assert_eq!(env_parse("FREC_TEST_UNSET", 3u64), 3);
        assert!(!env_flag("FREC_TEST_FLAG", true));
        assert!(env_flag("FREC_TEST_UNSET", true));
    }

    #[test]
    fn test_model_paths() {
        let config = Config {
            model_dir: PathBuf::from("/opt/frec"),
            ..Config::default()
        };
        assert_eq!(config.detector_model_path(), PathBuf::from("/opt/frec/det_10g.onnx"));
        assert_eq!(config.embedding_model_path(), PathBuf::from("/opt/frec/w600k_r50.onnx"));
    }
}

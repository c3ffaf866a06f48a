use anyhow::Context as _;
use facereg_registry::RegistryConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Daemon configuration.
///
/// Values come from `FACEREG_*` environment variables, falling back to the
/// TOML file named by `FACEREG_CONFIG` (if any), then to built-in defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP listener binds (default: 0.0.0.0:5002).
    pub listen_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root for registry files and image sources.
    pub data_dir: PathBuf,
    /// Image source of the default registry.
    pub images_dir: PathBuf,
    /// One subdirectory per named dataset registry.
    pub datasets_dir: PathBuf,
    pub default_registry: String,
    /// Cosine similarity threshold for a reported match.
    pub similarity_threshold: f32,
    pub top_k: usize,
    /// Deadline in seconds for one request's sync, match or batch work.
    pub operation_timeout_secs: u64,
}

/// Keys accepted in the TOML file, all optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,
    model_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    images_dir: Option<PathBuf>,
    datasets_dir: Option<PathBuf>,
    default_registry: Option<String>,
    similarity_threshold: Option<f32>,
    top_k: Option<usize>,
    operation_timeout_secs: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let file = match std::env::var("FACEREG_CONFIG") {
            Ok(path) => FileConfig::load(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = env("FACEREG_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(facereg_core::default_model_dir);

        let data_dir = env("FACEREG_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| {
                env("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("facereg")
            });

        let images_dir = env("FACEREG_IMAGES_DIR")
            .map(PathBuf::from)
            .or(file.images_dir)
            .unwrap_or_else(|| data_dir.join("images"));
        let datasets_dir = env("FACEREG_DATASETS_DIR")
            .map(PathBuf::from)
            .or(file.datasets_dir)
            .unwrap_or_else(|| data_dir.join("datasets"));

        Self {
            listen_addr: env("FACEREG_LISTEN_ADDR")
                .or(file.listen_addr)
                .unwrap_or_else(|| "0.0.0.0:5002".to_string()),
            model_dir,
            images_dir,
            datasets_dir,
            default_registry: env("FACEREG_DEFAULT_REGISTRY")
                .or(file.default_registry)
                .unwrap_or_else(|| "default".to_string()),
            similarity_threshold: parsed(&env, "FACEREG_SIMILARITY_THRESHOLD", file.similarity_threshold, 0.40),
            top_k: parsed(&env, "FACEREG_TOP_K", file.top_k, 5),
            operation_timeout_secs: parsed(&env, "FACEREG_OPERATION_TIMEOUT_SECS", file.operation_timeout_secs, 600),
            data_dir,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            registries_dir: self.data_dir.join("registries"),
            images_dir: self.images_dir.clone(),
            datasets_dir: self.datasets_dir.clone(),
            default_registry: self.default_registry.clone(),
            threshold: self.similarity_threshold,
            top_k: self.top_k,
        }
    }
}

fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, file: Option<T>, default: T) -> T {
    match env(key).map(|v| v.parse::<T>()) {
        Some(Ok(value)) => value,
        Some(Err(_)) => {
            tracing::warn!(key, "ignoring unparsable value");
            file.unwrap_or(default)
        }
        None => file.unwrap_or(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(file: FileConfig, vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::resolve(file, |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = resolve(FileConfig::default(), &[("HOME", "/home/u")]);
        assert_eq!(config.listen_addr, "0.0.0.0:5002");
        assert_eq!(config.data_dir, PathBuf::from("/home/u/.local/share/facereg"));
        assert_eq!(config.images_dir, config.data_dir.join("images"));
        assert_eq!(config.datasets_dir, config.data_dir.join("datasets"));
        assert_eq!(config.default_registry, "default");
        assert!((config.similarity_threshold - 0.40).abs() < f32::EPSILON);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.operation_timeout_secs, 600);

        let registry = config.registry_config();
        assert_eq!(registry.registries_dir, config.data_dir.join("registries"));
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            data_dir = "/srv/facereg"
            top_k = 9
            similarity_threshold = 0.5
            "#,
        )
        .unwrap();
        let config = resolve(file, &[("FACEREG_TOP_K", "3"), ("XDG_DATA_HOME", "/xdg")]);
        assert_eq!(config.data_dir, PathBuf::from("/srv/facereg"));
        assert_eq!(config.images_dir, PathBuf::from("/srv/facereg/images"));
        assert_eq!(config.top_k, 3);
        assert!((config.similarity_threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_bad_env_value_falls_back() {
        let file = FileConfig {
            top_k: Some(7),
            ..FileConfig::default()
        };
        let config = resolve(file, &[("FACEREG_TOP_K", "many"), ("FACEREG_OPERATION_TIMEOUT_SECS", "x")]);
        assert_eq!(config.top_k, 7);
        assert_eq!(config.operation_timeout_secs, 600);
    }

    #[test]
    fn test_xdg_data_home() {
        let config = resolve(FileConfig::default(), &[("XDG_DATA_HOME", "/xdg")]);
        assert_eq!(config.data_dir, PathBuf::from("/xdg/facereg"));
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        assert!(toml::from_str::<FileConfig>("camera = \"/dev/video0\"").is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("faceregd.toml");
        std::fs::write(&path, "listen_addr = \"127.0.0.1:9000\"\n").unwrap();
        let file = FileConfig::load(&path).unwrap();
        assert_eq!(file.listen_addr.as_deref(), Some("127.0.0.1:9000"));
        assert!(FileConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}

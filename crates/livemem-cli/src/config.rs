//! Configuration vault – reads/writes `~/.livemem/config.toml`.

use livemem_model::{ByteTokenizer, ModelConfig};
use livemem_types::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_NEW_TOKENS, LiveMemError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name used when no explicit state path is given.
pub const DEFAULT_STATE_FILE: &str = "memory_state.lmem";

/// Persisted user configuration stored in `~/.livemem/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Tokens per ingestion window.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Generation budget per query turn.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Directory holding state files.  Defaults to `~/.livemem`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// The model every state file is built against.  A state can only be
    /// queried with the model configuration that ingested it.
    #[serde(default)]
    pub model: ModelConfig,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_max_new_tokens() -> usize {
    DEFAULT_MAX_NEW_TOKENS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_new_tokens: default_max_new_tokens(),
            state_dir: None,
            model: ModelConfig::default(),
        }
    }
}

impl Config {
    /// Where state files live when no path is given on the command line.
    pub fn default_state_path(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.join(DEFAULT_STATE_FILE),
            None => livemem_dir_for_home(&home_dir()).join(DEFAULT_STATE_FILE),
        }
    }

    /// Reject settings the ingestion and query engines cannot run with.
    pub fn validate(&self) -> Result<(), LiveMemError> {
        self.model.validate()?;
        // the CLI feeds byte tokens plus BOS/EOT
        if self.model.vocab_size < ByteTokenizer::VOCAB_SIZE {
            return Err(LiveMemError::InvalidArgument(format!(
                "model.vocab_size {} is smaller than the byte tokenizer's {}",
                self.model.vocab_size,
                ByteTokenizer::VOCAB_SIZE
            )));
        }
        check_chunk_size(self.chunk_size, &self.model)
    }
}

/// A window must be non-empty and fit in one forward call.
pub fn check_chunk_size(chunk_size: usize, model: &ModelConfig) -> Result<(), LiveMemError> {
    if chunk_size == 0 {
        return Err(LiveMemError::InvalidArgument("chunk_size must be positive".into()));
    }
    if chunk_size > model.max_seq_len {
        return Err(LiveMemError::InvalidArgument(format!(
            "chunk_size {chunk_size} exceeds the model's max_seq_len {}",
            model.max_seq_len
        )));
    }
    Ok(())
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn livemem_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".livemem")
}

/// Return the path to `~/.livemem/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    livemem_dir_for_home(home).join("config.toml")
}

/// Load the effective configuration: the file at `path` (defaults when it
/// does not exist) with `LIVEMEM_*` overrides applied.
pub fn load(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?;
    apply_env_overrides(&mut cfg)?;
    Ok(cfg)
}

/// Load the config file alone, without environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `LIVEMEM_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `LIVEMEM_CHUNK_SIZE` | `chunk_size` |
/// | `LIVEMEM_MAX_NEW_TOKENS` | `max_new_tokens` |
/// | `LIVEMEM_STATE_DIR` | `state_dir` |
/// | `LIVEMEM_MODEL_SEED` | `model.seed` |
///
/// Unparseable numbers are an error rather than silently ignored: a wrong
/// seed would build a different model.
pub fn apply_env_overrides(cfg: &mut Config) -> Result<(), String> {
    if let Some(v) = env_number("LIVEMEM_CHUNK_SIZE")? {
        cfg.chunk_size = v;
    }
    if let Some(v) = env_number("LIVEMEM_MAX_NEW_TOKENS")? {
        cfg.max_new_tokens = v;
    }
    if let Ok(v) = std::env::var("LIVEMEM_STATE_DIR")
        && !v.is_empty()
    {
        cfg.state_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = env_number("LIVEMEM_MODEL_SEED")? {
        cfg.model.seed = v;
    }
    Ok(())
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>, String> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{name}={v:?} is not a valid number")),
        Err(_) => Ok(None),
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use livemem_memory::ConsolidationConfig;
    use livemem_model::CompressionConfig;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_mode =
            std::fs::metadata(path.parent().unwrap()).expect("dir metadata").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.chunk_size = 128;
        cfg.state_dir = Some(dir.path().join("states"));
        cfg.model.compression = CompressionConfig::Layers { layers: vec![1] };
        cfg.model.consolidation = ConsolidationConfig::FoldOldest {
            max_traces: 32,
            keep_recent: 8,
            decay: 0.5,
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = load_from(&path).expect("no error");
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.max_new_tokens, DEFAULT_MAX_NEW_TOKENS);
        assert_eq!(cfg.model, ModelConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_new_tokens = 7\n\n[model]\nwidth = 32\n").unwrap();

        let cfg = load_from(&path).expect("load ok");
        assert_eq!(cfg.max_new_tokens, 7);
        assert_eq!(cfg.model.width, 32);
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.model.n_layers, ModelConfig::default().n_layers);
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "chunk_size = \"many\"").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_livemem_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".livemem"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn state_dir_decides_default_state_path() {
        let cfg = Config {
            state_dir: Some(PathBuf::from("/data/mem")),
            ..Config::default()
        };
        assert_eq!(cfg.default_state_path(), PathBuf::from("/data/mem/memory_state.lmem"));
        assert!(Config::default().default_state_path().ends_with(".livemem/memory_state.lmem"));
    }

    #[test]
    fn chunk_size_must_fit_the_model() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert!(check_chunk_size(0, &cfg.model).is_err());
        assert!(check_chunk_size(cfg.model.max_seq_len + 1, &cfg.model).is_err());
    }

    #[test]
    fn vocab_must_cover_the_byte_tokenizer() {
        let mut cfg = Config::default();
        cfg.model.vocab_size = 100;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, LiveMemError::InvalidArgument(_)));
        assert!(err.to_string().contains("vocab_size"), "{err}");

        cfg.model.vocab_size = ByteTokenizer::VOCAB_SIZE;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn small_vocab_from_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[model]\nvocab_size = 100\n").unwrap();
        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.model.vocab_size, 100);
        assert!(matches!(cfg.validate(), Err(LiveMemError::InvalidArgument(_))));
    }

    // ── env overrides ────────────────────────────────────────────────────────
    // One test owns every LIVEMEM_* variable so parallel tests never race.

    #[test]
    fn apply_env_overrides_sets_and_rejects() {
        // SAFETY: this is the only test that reads or writes LIVEMEM_* vars.
        unsafe {
            std::env::set_var("LIVEMEM_CHUNK_SIZE", "256");
            std::env::set_var("LIVEMEM_MAX_NEW_TOKENS", "12");
            std::env::set_var("LIVEMEM_STATE_DIR", "/tmp/livemem-states");
            std::env::set_var("LIVEMEM_MODEL_SEED", "99");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg).expect("valid overrides");
        assert_eq!(cfg.chunk_size, 256);
        assert_eq!(cfg.max_new_tokens, 12);
        assert_eq!(cfg.state_dir, Some(PathBuf::from("/tmp/livemem-states")));
        assert_eq!(cfg.model.seed, 99);

        unsafe { std::env::set_var("LIVEMEM_CHUNK_SIZE", "lots") };
        let mut cfg = Config::default();
        assert!(apply_env_overrides(&mut cfg).is_err());

        unsafe {
            std::env::remove_var("LIVEMEM_CHUNK_SIZE");
            std::env::remove_var("LIVEMEM_MAX_NEW_TOKENS");
            std::env::remove_var("LIVEMEM_STATE_DIR");
            std::env::remove_var("LIVEMEM_MODEL_SEED");
        }
    }
}

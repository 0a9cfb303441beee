//! Configuration for Kiln.
//!
//! Precedence, lowest first: built-in defaults, the first config file found
//! (`./.kiln.toml`, `{config_dir}/kiln/config.toml`, `~/.kiln.toml`),
//! `KILN_*` environment variables, then `OPENAI_API_KEY` when no key is set.
//! Settings changed in the UI are written back into
//! `{config_dir}/kiln/config.toml` one key at a time, preserving the rest of
//! the file.

use std::env;
use std::fmt;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_MAX_ITERATIONS: usize = 25;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 300;

const APP_DIR: &str = "kiln";
const PROJECT_FILE: &str = ".kiln.toml";
const CONFIG_FILE: &str = "config.toml";
const DB_FILE: &str = "kiln.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to determine working directory: {0}")]
    WorkDir(#[source] io::Error),
    #[error("could not determine the data directory")]
    NoDataDir,
    #[error("could not determine the config directory")]
    NoConfigDir,
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml_edit::TomlError,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Resolved application settings.
#[derive(Clone, PartialEq, Eq)]
pub struct KilnConfig {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub max_tokens: u32,
    pub max_iterations: usize,
    /// Seconds a response stream may stay silent before it is abandoned.
    pub stream_idle_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub shell: String,
    pub debug: bool,
    /// Process working directory; never read from or written to a file.
    pub work_dir: PathBuf,
}

impl fmt::Debug for KilnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let api_key = if self.api_key.is_empty() {
            "None"
        } else {
            "[REDACTED]"
        };
        f.debug_struct("KilnConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &api_key)
            .field("max_tokens", &self.max_tokens)
            .field("max_iterations", &self.max_iterations)
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .field("data_dir", &self.data_dir)
            .field("shell", &self.shell)
            .field("debug", &self.debug)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

/// Keys as they appear in a config file; anything missing keeps its default.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    provider: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    max_iterations: Option<usize>,
    stream_idle_timeout_secs: Option<u64>,
    data_dir: Option<PathBuf>,
    shell: Option<String>,
    debug: Option<bool>,
}

/// Where [`KilnConfig::load_from`] looks. Injected so loading is testable
/// without touching the real home directory or environment.
pub struct Sources<'a> {
    pub work_dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub default_data_dir: Option<PathBuf>,
    pub env: &'a dyn Fn(&str) -> Option<String>,
}

fn process_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn default_shell() -> &'static str {
    if cfg!(windows) { "cmd.exe" } else { "/bin/bash" }
}

/// Replace `${VAR}` references with the variable's value (empty when unset).
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                out.push_str(&env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// `{config_dir}/kiln/config.toml`, where UI changes are persisted.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

fn default_data_dir() -> Option<PathBuf> {
    if let Some(xdg) = process_env("XDG_DATA_HOME") {
        return Some(PathBuf::from(xdg).join(APP_DIR));
    }
    dirs::home_dir().map(|home| home.join(".local").join("share").join(APP_DIR))
}

fn read_file_config(path: &Path) -> Option<FileConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!("Failed to read config at {}: {err}", path.display());
            return None;
        }
    };
    match toml::from_str(&content) {
        Ok(config) => {
            tracing::debug!(path = %path.display(), "loaded config");
            Some(config)
        }
        Err(err) => {
            tracing::warn!("Failed to parse config at {}: {err}", path.display());
            None
        }
    }
}

impl KilnConfig {
    /// Defaults only; `data_dir` is left empty for the loader to fill.
    #[must_use]
    pub fn defaults(work_dir: PathBuf) -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            stream_idle_timeout_secs: DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
            data_dir: PathBuf::new(),
            shell: default_shell().to_string(),
            debug: false,
            work_dir,
        }
    }

    /// Load from the usual locations and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let work_dir = env::current_dir().map_err(ConfigError::WorkDir)?;
        let mut files = vec![work_dir.join(PROJECT_FILE)];
        files.extend(user_config_path());
        files.extend(dirs::home_dir().map(|home| home.join(PROJECT_FILE)));

        Self::load_from(&Sources {
            work_dir,
            files,
            default_data_dir: default_data_dir(),
            env: &process_env,
        })
    }

    pub fn load_from(sources: &Sources<'_>) -> Result<Self, ConfigError> {
        let env = sources.env;
        let mut config = Self::defaults(sources.work_dir.clone());

        if let Some(path) = sources.files.iter().find(|p| p.is_file())
            && let Some(file) = read_file_config(path)
        {
            config.apply(file);
        }

        if let Some(provider) = env("KILN_PROVIDER") {
            config.provider = provider;
        }
        if let Some(model) = env("KILN_MODEL") {
            config.model = model;
        }
        if let Some(shell) = env("KILN_SHELL") {
            config.shell = shell;
        }
        if let Some(secs) = env("KILN_STREAM_IDLE_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.stream_idle_timeout_secs = secs;
        }
        if let Some(data_dir) = env("KILN_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if config.api_key.is_empty()
            && let Some(key) = env("OPENAI_API_KEY")
        {
            config.api_key = key;
        }

        if config.data_dir.as_os_str().is_empty() {
            config.data_dir = sources
                .default_data_dir
                .clone()
                .ok_or(ConfigError::NoDataDir)?;
        }
        fs::create_dir_all(&config.data_dir).map_err(|source| ConfigError::CreateDir {
            path: config.data_dir.clone(),
            source,
        })?;

        Ok(config)
    }

    fn apply(&mut self, file: FileConfig) {
        if let Some(provider) = file.provider.filter(|v| !v.is_empty()) {
            self.provider = provider;
        }
        if let Some(model) = file.model.filter(|v| !v.is_empty()) {
            self.model = model;
        }
        if let Some(key) = file.api_key {
            self.api_key = expand_env_vars(&key);
        }
        if let Some(max_tokens) = file.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(max_iterations) = file.max_iterations.filter(|n| *n > 0) {
            self.max_iterations = max_iterations;
        }
        if let Some(secs) = file.stream_idle_timeout_secs.filter(|secs| *secs > 0) {
            self.stream_idle_timeout_secs = secs;
        }
        if let Some(data_dir) = file.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(shell) = file.shell.filter(|v| !v.is_empty()) {
            self.shell = shell;
        }
        if let Some(debug) = file.debug {
            self.debug = debug;
        }
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    #[must_use]
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

/// The file settings changed at runtime are written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `{config_dir}/kiln/config.toml`.
    pub fn user() -> Result<Self, ConfigError> {
        user_config_path()
            .map(Self::new)
            .ok_or(ConfigError::NoConfigDir)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_api_key(&self, api_key: &str) -> Result<(), ConfigError> {
        persist_key(&self.path, "api_key", toml_edit::value(api_key))
    }

    pub fn set_model(&self, model: &str) -> Result<(), ConfigError> {
        persist_key(&self.path, "model", toml_edit::value(model))
    }

    pub fn set_max_iterations(&self, max_iterations: usize) -> Result<(), ConfigError> {
        let value = i64::try_from(max_iterations).unwrap_or(i64::MAX);
        persist_key(&self.path, "max_iterations", toml_edit::value(value))
    }
}

#[cfg(unix)]
fn tighten_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    let metadata = fs::metadata(path)?;
    // SAFETY: getuid has no preconditions and cannot fail.
    let our_uid = unsafe { libc::getuid() };
    if metadata.uid() == our_uid && metadata.permissions().mode() & 0o077 != 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn tighten_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Set one top-level key in the TOML file at `path`, keeping comments and
/// every other key as written.
fn persist_key(path: &Path, key: &str, value: toml_edit::Item) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;
    tighten_permissions(dir, 0o700).map_err(write_err)?;

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let mut doc = content
        .parse::<toml_edit::DocumentMut>()
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    doc[key] = value;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(doc.to_string().as_bytes())
        .map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    tighten_permissions(path, 0o600).map_err(write_err)?;

    tracing::debug!(path = %path.display(), key, "persisted config key");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn load(dir: &TempDir, files: Vec<PathBuf>, vars: &[(&str, &str)]) -> KilnConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let lookup = move |name: &str| vars.get(name).cloned();
        KilnConfig::load_from(&Sources {
            work_dir: dir.path().to_path_buf(),
            files,
            default_data_dir: Some(dir.path().join("data")),
            env: &lookup,
        })
        .unwrap()
    }

    #[test]
    fn defaults_apply_without_files_or_env() {
        let dir = TempDir::new().unwrap();
        let config = load(&dir, vec![dir.path().join("missing.toml")], &[]);
        assert_eq!(config.provider, "openai");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.stream_idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.data_dir, dir.path().join("data"));
        assert!(config.data_dir.is_dir());
        assert_eq!(config.db_path(), dir.path().join("data").join("kiln.db"));
    }

    #[test]
    fn first_existing_file_wins_and_env_overrides_it() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.toml");
        let second = dir.path().join("second.toml");
        fs::write(&first, "model = \"gpt-4.1\"\nmax_iterations = 7\n").unwrap();
        fs::write(&second, "model = \"ignored\"\n").unwrap();

        let config = load(
            &dir,
            vec![dir.path().join("none.toml"), first, second],
            &[("KILN_SHELL", "/bin/zsh"), ("OPENAI_API_KEY", "sk-env")],
        );
        assert_eq!(config.model, "gpt-4.1");
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.shell, "/bin/zsh");
        assert_eq!(config.api_key, "sk-env");
    }

    #[test]
    fn stream_idle_timeout_comes_from_file_then_env() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("kiln.toml");
        fs::write(&file, "stream_idle_timeout_secs = 900\n").unwrap();

        let config = load(&dir, vec![file.clone()], &[]);
        assert_eq!(config.stream_idle_timeout_secs, 900);

        let config = load(
            &dir,
            vec![file.clone()],
            &[("KILN_STREAM_IDLE_TIMEOUT_SECS", "1200")],
        );
        assert_eq!(config.stream_idle_timeout(), Duration::from_secs(1200));

        // Zero and junk are ignored.
        fs::write(&file, "stream_idle_timeout_secs = 0\n").unwrap();
        let config = load(
            &dir,
            vec![file],
            &[("KILN_STREAM_IDLE_TIMEOUT_SECS", "soon")],
        );
        assert_eq!(config.stream_idle_timeout_secs, DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
    }

    #[test]
    fn file_key_beats_environment_key() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("kiln.toml");
        fs::write(&file, "api_key = \"sk-file\"\n").unwrap();
        let config = load(&dir, vec![file], &[("OPENAI_API_KEY", "sk-env")]);
        assert_eq!(config.api_key, "sk-file");
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("bad.toml");
        fs::write(&file, "model = [unclosed").unwrap();
        let config = load(&dir, vec![file], &[]);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = KilnConfig::defaults(PathBuf::from("/w"));
        config.api_key = "sk-secret".to_string();
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-secret"));
    }

    #[test]
    fn expand_env_vars_handles_edge_cases() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
        assert_eq!(
            expand_env_vars("before ${KILN_TEST_SURELY_UNSET_VAR} after"),
            "before  after"
        );
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
        assert_eq!(expand_env_vars("test ${} more"), "test ${} more");
    }

    #[test]
    fn settings_file_preserves_other_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kiln").join("config.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "# my settings\nshell = \"/bin/zsh\"\nmodel = \"old\"\n").unwrap();

        let settings = SettingsFile::new(&path);
        settings.set_model("gpt-4.1").unwrap();
        settings.set_max_iterations(40).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# my settings\n"));
        assert!(written.contains("shell = \"/bin/zsh\""));
        assert!(written.contains("model = \"gpt-4.1\""));
        assert!(written.contains("max_iterations = 40"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn settings_file_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh").join("config.toml");
        let settings = SettingsFile::new(&path);
        settings.set_api_key("sk-new").unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim(), "api_key = \"sk-new\"");
    }
}

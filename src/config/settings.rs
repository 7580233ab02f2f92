use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;

use crate::venue::client::Endpoints;

pub const API_KEY_ENV: &str = "STOCKFIGHTER_API_KEY";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    api_key: String,
    level: String,
    worker_threads: usize,
    api_url: Option<String>,
    game_url: Option<String>,
    stream_url: Option<String>,
    world_ping_failure_limit: usize,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            level: "first_steps".to_string(),
            worker_threads: 6,
            api_url: None,
            game_url: None,
            stream_url: None,
            world_ping_failure_limit: 5,
        }
    }
}

/// Process configuration. Built once in `main` and shared by `Arc`.
#[derive(Clone)]
pub struct Settings {
    pub dir: PathBuf,
    pub stem: String,
    pub api_key: String,
    pub level: String,
    pub worker_threads: usize,
    pub endpoints: Endpoints,
    pub world_ping_failure_limit: usize,
}

impl Settings {
    /// Reads a `.json`, `.yml` or `.yaml` settings file. `STOCKFIGHTER_API_KEY`
    /// takes precedence over the file's key.
    pub fn load(path: &Path) -> Result<Self> {
        let env_key = env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty());
        Self::load_with_key(path, env_key)
    }

    fn load_with_key(path: &Path, env_key: Option<String>) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;

        let file: SettingsFile = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .with_context(|| format!("invalid JSON settings {}", path.display()))?,
            Some("yml" | "yaml") => serde_yaml::from_str(&text)
                .with_context(|| format!("invalid YAML settings {}", path.display()))?,
            _ => bail!("unsupported settings format: {}", path.display()),
        };

        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .with_context(|| format!("settings path has no stem: {}", path.display()))?
            .to_string();

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let defaults = Endpoints::default();

        let settings = Self {
            dir,
            stem,
            api_key: env_key.unwrap_or(file.api_key),
            level: file.level,
            worker_threads: file.worker_threads,
            endpoints: Endpoints {
                api_url: with_trailing_slash(file.api_url.unwrap_or(defaults.api_url)),
                game_url: with_trailing_slash(file.game_url.unwrap_or(defaults.game_url)),
                stream_url: with_trailing_slash(file.stream_url.unwrap_or(defaults.stream_url)),
            },
            world_ping_failure_limit: file.world_ping_failure_limit,
        };

        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.api_key.trim().is_empty(),
            "no API key: set api_key in the settings or {API_KEY_ENV}"
        );
        ensure!(self.worker_threads > 0, "worker_threads must be at least 1");
        ensure!(!self.level.trim().is_empty(), "level must not be empty");
        ensure!(
            self.world_ping_failure_limit > 0,
            "world_ping_failure_limit must be at least 1"
        );
        Ok(())
    }

    /// `<dir>/<stem><suffix>`, the path of a file that belongs to this run.
    pub fn derivative_file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", self.stem))
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("dir", &self.dir)
            .field("stem", &self.stem)
            .field("api_key", &"<redacted>")
            .field("level", &self.level)
            .field("worker_threads", &self.worker_threads)
            .field("endpoints", &self.endpoints)
            .field("world_ping_failure_limit", &self.world_ping_failure_limit)
            .finish()
    }
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_json_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "trader.json", r#"{"api_key": "abc"}"#);

        let settings = Settings::load_with_key(&path, None).unwrap();

        assert_eq!(settings.api_key, "abc");
        assert_eq!(settings.level, "first_steps");
        assert_eq!(settings.worker_threads, 6);
        assert_eq!(settings.world_ping_failure_limit, 5);
        assert_eq!(settings.endpoints, Endpoints::default());
        assert_eq!(settings.stem, "trader");
    }

    #[test]
    fn test_yaml_overrides() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "bot.yaml",
            "api_key: abc\nlevel: chock_a_block\nworker_threads: 2\napi_url: http://localhost:8000/ob/api\n",
        );

        let settings = Settings::load_with_key(&path, None).unwrap();

        assert_eq!(settings.level, "chock_a_block");
        assert_eq!(settings.worker_threads, 2);
        assert_eq!(settings.endpoints.api_url, "http://localhost:8000/ob/api/");
    }

    #[test]
    fn test_env_key_wins() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "trader.json", r#"{"api_key": "from-file"}"#);

        let settings = Settings::load_with_key(&path, Some("from-env".to_string())).unwrap();

        assert_eq!(settings.api_key, "from-env");
        assert!(!format!("{settings:?}").contains("from-env"));
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let dir = TempDir::new().unwrap();

        let no_key = write(&dir, "a.json", "{}");
        assert!(Settings::load_with_key(&no_key, None).is_err());

        let no_workers = write(&dir, "b.json", r#"{"api_key": "k", "worker_threads": 0}"#);
        assert!(Settings::load_with_key(&no_workers, None).is_err());

        let unknown_field = write(&dir, "c.json", r#"{"api_key": "k", "apikey": "k"}"#);
        assert!(Settings::load_with_key(&unknown_field, None).is_err());

        let wrong_format = write(&dir, "d.toml", "api_key = 'k'");
        assert!(Settings::load_with_key(&wrong_format, None).is_err());
    }

    #[test]
    fn test_derivative_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "trader.json", r#"{"api_key": "k"}"#);

        let settings = Settings::load_with_key(&path, None).unwrap();

        assert_eq!(settings.derivative_file(".log"), dir.path().join("trader.log"));
        assert_eq!(
            settings.derivative_file("_ticker_raw.csv"),
            dir.path().join("trader_ticker_raw.csv")
        );
    }
}

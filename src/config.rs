use anyhow::{Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub relations: RelationsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub plot: PlotConfig,
    #[serde(default)]
    pub sync: Option<SyncConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    /// Defaults to `<storage.root>/.chaos/index.sqlite`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_max_upload_mb() -> usize {
    64
}

/// The single credential guarding the web UI and API.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelationsConfig {
    #[serde(default = "default_min_shared")]
    pub min_shared: usize,
    #[serde(default = "default_max_related")]
    pub max_related: usize,
}

impl Default for RelationsConfig {
    fn default() -> Self {
        Self {
            min_shared: default_min_shared(),
            max_related: default_max_related(),
        }
    }
}

fn default_min_shared() -> usize {
    1
}
fn default_max_related() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
        }
    }
}

fn default_max_rows() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlotConfig {
    #[serde(default = "default_plot_width")]
    pub width: u32,
    #[serde(default = "default_plot_height")]
    pub height: u32,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            width: default_plot_width(),
            height: default_plot_height(),
        }
    }
}

fn default_plot_width() -> u32 {
    720
}
fn default_plot_height() -> u32 {
    420
}

/// Remote instance to mirror with `chaos sync`.
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    pub remote: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Globs over `kind/id` refs that are never mirrored or pruned.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub prune: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// A config with every default applied, rooted at `root`.
    pub fn minimal(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig { root: root.into() },
            index: IndexConfig::default(),
            server: ServerConfig::default(),
            auth: None,
            relations: RelationsConfig::default(),
            database: DatabaseConfig::default(),
            plot: PlotConfig::default(),
            sync: None,
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.index
            .path
            .clone()
            .unwrap_or_else(|| self.storage.root.join(".chaos").join("index.sqlite"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.root.as_os_str().is_empty() {
        anyhow::bail!("storage.root must not be empty");
    }

    if let Some(auth) = &config.auth {
        if auth.username.trim().is_empty() || auth.password.is_empty() {
            anyhow::bail!("auth.username and auth.password must both be non-empty");
        }
    }

    if config.relations.min_shared < 1 {
        anyhow::bail!("relations.min_shared must be >= 1");
    }
    if config.relations.max_related < 1 {
        anyhow::bail!("relations.max_related must be >= 1");
    }
    if config.database.max_rows < 1 {
        anyhow::bail!("database.max_rows must be >= 1");
    }
    if config.plot.width < 100 || config.plot.height < 100 {
        anyhow::bail!("plot.width and plot.height must be >= 100");
    }
    if config.server.max_upload_mb < 1 {
        anyhow::bail!("server.max_upload_mb must be >= 1");
    }

    if let Some(sync) = &config.sync {
        if !(sync.remote.starts_with("http://") || sync.remote.starts_with("https://")) {
            anyhow::bail!(
                "sync.remote must be an http:// or https:// URL, got '{}'",
                sync.remote
            );
        }
        if sync.username.is_some() != sync.password.is_some() {
            anyhow::bail!("sync.username and sync.password must be set together");
        }
        if sync.timeout_secs == 0 {
            anyhow::bail!("sync.timeout_secs must be > 0");
        }
        for pattern in &sync.exclude {
            Glob::new(pattern)
                .with_context(|| format!("Invalid sync.exclude glob: '{}'", pattern))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg = parse_config("[storage]\nroot = \"/srv/chaos\"\n").unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:8080");
        assert_eq!(cfg.relations.min_shared, 1);
        assert_eq!(cfg.database.max_rows, 1000);
        assert!(cfg.auth.is_none());
        assert_eq!(
            cfg.index_path(),
            PathBuf::from("/srv/chaos/.chaos/index.sqlite")
        );
    }

    #[test]
    fn full_file_parses() {
        let cfg = parse_config(
            r#"
[storage]
root = "data"

[index]
path = "cache/index.sqlite"

[server]
bind = "0.0.0.0:9000"

[auth]
username = "me"
password = "secret"

[relations]
min_shared = 2

[sync]
remote = "https://chaos.example.org"
username = "me"
password = "secret"
exclude = ["databases/*"]
prune = true
"#,
        )
        .unwrap();
        assert_eq!(cfg.index_path(), PathBuf::from("cache/index.sqlite"));
        assert_eq!(cfg.relations.min_shared, 2);
        let sync = cfg.sync.unwrap();
        assert!(sync.prune);
        assert_eq!(sync.timeout_secs, 30);
    }

    #[test]
    fn rejects_bad_values() {
        let base = "[storage]\nroot = \"data\"\n";
        assert!(parse_config(&format!("{base}[relations]\nmin_shared = 0\n")).is_err());
        assert!(parse_config(&format!("{base}[auth]\nusername = \"me\"\npassword = \"\"\n")).is_err());
        assert!(parse_config(&format!("{base}[auth]\nusername = \"me\"\n")).is_err());
        assert!(parse_config(&format!("{base}[sync]\nremote = \"ftp://x\"\n")).is_err());
        assert!(parse_config(&format!(
            "{base}[sync]\nremote = \"http://x\"\nusername = \"me\"\n"
        ))
        .is_err());
        assert!(parse_config(&format!(
            "{base}[sync]\nremote = \"http://x\"\nexclude = [\"[\"]\n"
        ))
        .is_err());
        assert!(parse_config("[server]\nbind = \"x\"\n").is_err());
    }
}

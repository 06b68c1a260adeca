use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 8910;
const CONFIG_ENV: &str = "PIPE_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
        }
    }
}

/// Precedence: `--config`, then `PIPE_CONFIG`, then `pipe.{toml,yaml,yml}` in the working
/// directory. `None` means the server runs from flags and defaults only.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> Option<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Some(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            });
        }
    }

    discover_config_path(Path::new(".")).map(|path| ResolvedConfigPath {
        path,
        source: ConfigPathSource::Cwd,
    })
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["pipe.toml", "pipe.yaml", "pipe.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Zero disables the admin server.
    pub admin_port: u16,
    pub bind_host: String,
    pub handshake_timeout: Duration,
    pub pending_timeout: Duration,
    pub buffer_size: usize,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            admin_port: 0,
            bind_host: "0.0.0.0".into(),
            handshake_timeout: Duration::from_millis(3000),
            pending_timeout: Duration::from_millis(30_000),
            buffer_size: 32 * 1024,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    port: Option<i64>,

    #[serde(alias = "admin-port")]
    admin_port: Option<i64>,

    bind_host: Option<String>,

    handshake_timeout_ms: Option<i64>,

    pending_timeout_ms: Option<i64>,

    #[serde(default)]
    buffer_size: i64,

    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", ext),
    };

    Config::from_file_config(fc)
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config::default();

        if let Some(p) = fc.port {
            cfg.port = parse_port(p).context("config: port")?;
        }
        if let Some(p) = fc.admin_port {
            cfg.admin_port = parse_port(p).context("config: admin_port")?;
        }
        if let Some(h) = &fc.bind_host {
            if !h.trim().is_empty() {
                cfg.bind_host = h.trim().to_string();
            }
        }
        if let Some(ms) = fc.handshake_timeout_ms {
            cfg.handshake_timeout = Duration::from_millis(ms.max(0) as u64);
        }
        if cfg.handshake_timeout == Duration::ZERO {
            cfg.handshake_timeout = Duration::from_millis(3000);
        }
        if let Some(ms) = fc.pending_timeout_ms {
            // Zero is meaningful here: it disables expiry.
            cfg.pending_timeout = Duration::from_millis(ms.max(0) as u64);
        }
        if fc.buffer_size > 0 {
            cfg.buffer_size = fc.buffer_size as usize;
        }

        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    cfg.logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    cfg.logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    cfg.logging.output = out.trim().to_string();
                }
            }
            cfg.logging.add_source = l.add_source;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies command-line overrides on top of file or default values.
    pub fn with_overrides(mut self, port: Option<u16>, admin_port: Option<u16>) -> anyhow::Result<Self> {
        if let Some(p) = port {
            self.port = p;
        }
        if let Some(p) = admin_port {
            self.admin_port = p;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.admin_port != 0 && self.admin_port == self.port {
            anyhow::bail!("config: admin_port must differ from port ({})", self.port);
        }
        Ok(())
    }
}

fn parse_port(v: i64) -> anyhow::Result<u16> {
    u16::try_from(v).map_err(|_| anyhow::anyhow!("out of range: {v} (expected 0..=65535)"))
}

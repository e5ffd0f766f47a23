use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use stomphub_broker::BrokerConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// `[sx, sy]` in ms: what the broker can send / wants to receive.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: [u64; 2],
    #[serde(
        default,
        deserialize_with = "stomphub_helpers::de::deserialize_optional_duration"
    )]
    pub heartbeat_error_margin: Option<Duration>,
    /// Raises the broker's own log targets to debug level.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            server_name: default_server_name(),
            heartbeat: default_heartbeat(),
            heartbeat_error_margin: None,
            debug: false,
            protocol: default_protocol(),
        }
    }
}

impl Config {
    /// Loads from argv[1], `STOMPHUB_CONFIG_PATH`, or
    /// `stomphub.yaml`/`.yml` in `$HOME` then the working directory.
    /// With no config file anywhere, every option takes its default.
    pub fn load() -> Result<Self> {
        let explicit = parse_config_path_arg(env::args().skip(1))?;
        let mut config = match explicit.or_else(resolve_config_path) {
            Some(path) => load_config_yaml(&path)?,
            None => Config::default(),
        };
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.listen = trim_owned(self.listen.clone());
        self.path = trim_owned(self.path.clone());
        self.server_name = trim_owned(self.server_name.clone());
        self.protocol = trim_owned(self.protocol.clone());

        if self.listen.is_empty() {
            self.listen = default_listen();
        }
        if self.path.is_empty() {
            self.path = default_path();
        }
        if self.server_name.is_empty() {
            self.server_name = default_server_name();
        }
        if self.protocol.is_empty() {
            self.protocol = default_protocol();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.protocol != "ws" {
            bail!(
                "unsupported transport protocol: {} (only \"ws\" is available)",
                self.protocol
            );
        }
        if !self.path.starts_with('/') {
            bail!("websocket upgrade path must start with '/': {}", self.path);
        }
        Ok(())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            server_name: self.server_name.clone(),
            heartbeat: (self.heartbeat[0], self.heartbeat[1]),
            heartbeat_error_margin: self
                .heartbeat_error_margin
                .unwrap_or(Duration::from_secs(1)),
        }
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!(
            "too many arguments: {arg} (usage: stomphub-server [config-path])"
        );
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: stomphub-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("STOMPHUB_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    if let Some(home) = non_empty_env("HOME") {
        for name in ["stomphub.yaml", "stomphub.yml"] {
            let candidate = PathBuf::from(&home).join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for name in ["stomphub.yaml", "stomphub.yml"] {
        let candidate = cwd.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

fn default_listen() -> String {
    "0.0.0.0:61614".to_string()
}

fn default_path() -> String {
    "/stomp".to_string()
}

fn default_server_name() -> String {
    format!("stomphub/{}", env!("CARGO_PKG_VERSION"))
}

fn default_heartbeat() -> [u64; 2] {
    [10_000, 10_000]
}

fn default_protocol() -> String {
    "ws".to_string()
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "SIMPLODON";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ui: UIConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// OAuth application registration and identity sent to the instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_client_secret")]
    pub client_secret: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_lang")]
    pub lang: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            client_secret: default_client_secret(),
            scopes: default_scopes(),
            redirect_uri: default_redirect_uri(),
            origin: default_origin(),
            user_agent: default_user_agent(),
            lang: default_lang(),
        }
    }
}

fn default_client_id() -> String {
    "S1X3r40DyEN6qX8RjxkoL4uRm6arRqEcoYK2NVrHSf8".into()
}

fn default_client_secret() -> String {
    "6nnyTmudEH6l0iL2nP7ONDoeUUFkgll0N7r7iC3EEzg".into()
}

fn default_scopes() -> Vec<String> {
    vec!["read".into(), "write".into(), "follow".into()]
}

fn default_redirect_uri() -> String {
    "http://127.0.0.1:65011/simplodon/callback".into()
}

fn default_origin() -> String {
    "https://allmastodon.com/simplodon/".into()
}

fn default_user_agent() -> String {
    format!("simplodon/{}", crate::VERSION)
}

fn default_lang() -> String {
    "en".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UIConfig {
    /// Stylesheet URLs selectable by index.
    #[serde(default = "default_themes")]
    pub themes: Vec<String>,
    #[serde(default = "default_timeline_limit")]
    pub timeline_limit: u32,
    /// How long the CLI waits for reply chains before writing the page.
    #[serde(default = "default_thread_wait", with = "humantime_serde")]
    pub thread_wait: Duration,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            themes: default_themes(),
            timeline_limit: default_timeline_limit(),
            thread_wait: default_thread_wait(),
        }
    }
}

fn default_themes() -> Vec<String> {
    vec![
        "https://cdn.jsdelivr.net/npm/water.css@2/out/water.css".into(),
        "https://cdn.simplecss.org/simple.min.css".into(),
        "https://unpkg.com/mvp.css".into(),
    ]
}

fn default_timeline_limit() -> u32 {
    40
}

fn default_thread_wait() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.server.client_id.is_empty() {
        base.server.client_id = other.server.client_id;
    }
    if !other.server.client_secret.is_empty() {
        base.server.client_secret = other.server.client_secret;
    }
    if !other.server.scopes.is_empty() {
        base.server.scopes = other.server.scopes;
    }
    if !other.server.redirect_uri.is_empty() {
        base.server.redirect_uri = other.server.redirect_uri;
    }
    if !other.server.origin.is_empty() {
        base.server.origin = other.server.origin;
    }
    if !other.server.user_agent.is_empty() {
        base.server.user_agent = other.server.user_agent;
    }
    if !other.server.lang.is_empty() {
        base.server.lang = other.server.lang;
    }

    if !other.ui.themes.is_empty() {
        base.ui.themes = other.ui.themes;
    }
    if other.ui.timeline_limit != 0 {
        base.ui.timeline_limit = other.ui.timeline_limit;
    }
    base.ui.thread_wait = other.ui.thread_wait;

    if !other.http.timeout.is_zero() {
        base.http.timeout = other.http.timeout;
    }

    base
}

// Environment values override in place; unset keys leave the file values alone.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "server.client_id" => cfg.server.client_id = value,
        "server.client_secret" => cfg.server.client_secret = value,
        "server.redirect_uri" => cfg.server.redirect_uri = value,
        "server.origin" => cfg.server.origin = value,
        "server.user_agent" => cfg.server.user_agent = value,
        "server.lang" => cfg.server.lang = value,
        "server.scopes" => cfg.server.scopes = split_list(&value),
        "ui.themes" => cfg.ui.themes = split_list(&value),
        "ui.timeline_limit" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.ui.timeline_limit = parsed;
            }
        }
        "ui.thread_wait" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.ui.thread_wait = duration;
            }
        }
        "http.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.http.timeout = duration;
            }
        }
        _ => {}
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("simplodon").join("config.yaml"))
}

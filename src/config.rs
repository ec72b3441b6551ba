use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

/// Config file read when `--config` is not given. Its absence is not an error.
pub const DEFAULT_CONFIG_PATH: &str = "custom/conf/app.toml";

/// Signing secret used in local mode when none is configured. Refused in production.
const LOCAL_SECRET: &str = "gitward-local-development-secret";

/// ConfigError
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Env
///
/// Runtime context. Production refuses insecure defaults and logs JSON; local mode
/// allows an in-memory store and logs for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    #[default]
    Local,
    Production,
}

/// Protocol
///
/// What the listener speaks. HTTPS needs `cert_file` and `key_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

/// AppConfig
///
/// The loaded, immutable configuration. Layered from defaults, the TOML file,
/// environment variables and finally the `--port` flag.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(rename = "app_env")]
    pub env: Env,
    pub protocol: Protocol,
    pub http_addr: String,
    pub http_port: u16,
    /// PEM certificate chain and private key for `protocol = "https"`.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Gzip responses for clients that accept it.
    pub enable_gzip: bool,
    /// Public base URL, always ending in `/`.
    pub app_url: String,
    /// No URL means the in-memory store (local mode only).
    pub database_url: Option<String>,
    pub secret_key: String,
    pub session_cookie: String,
    pub session_ttl_secs: i64,
    /// Bare repositories live at `<repository_root>/<owner>/<name>.git`.
    pub repository_root: PathBuf,
    pub static_root: PathBuf,
    pub robots_txt: Option<PathBuf>,
    pub require_sign_in_view: bool,
    pub disable_router_log: bool,
    pub git_binary: String,
    pub git_timeout_secs: u64,
    pub enable_swagger: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            env: Env::Local,
            protocol: Protocol::Http,
            http_addr: "0.0.0.0".to_string(),
            http_port: 3000,
            cert_file: None,
            key_file: None,
            enable_gzip: false,
            app_url: "http://localhost:3000/".to_string(),
            database_url: None,
            secret_key: LOCAL_SECRET.to_string(),
            session_cookie: "gitward_session".to_string(),
            session_ttl_secs: 86_400,
            repository_root: PathBuf::from("data/repositories"),
            static_root: PathBuf::from("public"),
            robots_txt: None,
            require_sign_in_view: false,
            disable_router_log: false,
            git_binary: "git".to_string(),
            git_timeout_secs: 600,
            enable_swagger: false,
        }
    }
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

impl AppConfig {
    /// Loads the configuration at startup.
    ///
    /// A missing file is only tolerated when `config_path` was not given explicitly.
    pub fn load(config_path: Option<&Path>, port: Option<u16>) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        if let Some(port) = port {
            config = config.with_port(port);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overrides fields from environment-style variables. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("APP_ENV") {
            self.env = match value.as_str() {
                "production" => Env::Production,
                _ => Env::Local,
            };
        }
        if let Some(value) = lookup("PROTOCOL") {
            self.protocol = match value.trim().to_ascii_lowercase().as_str() {
                "http" => Protocol::Http,
                "https" => Protocol::Https,
                _ => return Err(ConfigError::InvalidValue { key: "PROTOCOL", value }),
            };
        }
        if let Some(value) = lookup("CERT_FILE") {
            self.cert_file = Some(PathBuf::from(value)).filter(|path| !path.as_os_str().is_empty());
        }
        if let Some(value) = lookup("KEY_FILE") {
            self.key_file = Some(PathBuf::from(value)).filter(|path| !path.as_os_str().is_empty());
        }
        if let Some(value) = lookup("ENABLE_GZIP") {
            self.enable_gzip = parse_bool("ENABLE_GZIP", value)?;
        }
        if let Some(value) = lookup("HTTP_ADDR") {
            self.http_addr = value;
        }
        if let Some(value) = lookup("HTTP_PORT") {
            self.http_port = parse_num("HTTP_PORT", value)?;
        }
        if let Some(value) = lookup("APP_URL") {
            self.app_url = value;
        }
        if let Some(value) = lookup("DATABASE_URL") {
            self.database_url = Some(value).filter(|url| !url.is_empty());
        }
        if let Some(value) = lookup("SECRET_KEY") {
            self.secret_key = value;
        }
        if let Some(value) = lookup("SESSION_COOKIE") {
            self.session_cookie = value;
        }
        if let Some(value) = lookup("SESSION_TTL_SECS") {
            self.session_ttl_secs = parse_num("SESSION_TTL_SECS", value)?;
        }
        if let Some(value) = lookup("REPOSITORY_ROOT") {
            self.repository_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("STATIC_ROOT") {
            self.static_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("ROBOTS_TXT") {
            self.robots_txt = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("REQUIRE_SIGN_IN_VIEW") {
            self.require_sign_in_view = parse_bool("REQUIRE_SIGN_IN_VIEW", value)?;
        }
        if let Some(value) = lookup("DISABLE_ROUTER_LOG") {
            self.disable_router_log = parse_bool("DISABLE_ROUTER_LOG", value)?;
        }
        if let Some(value) = lookup("GIT_BINARY") {
            self.git_binary = value;
        }
        if let Some(value) = lookup("GIT_TIMEOUT_SECS") {
            self.git_timeout_secs = parse_num("GIT_TIMEOUT_SECS", value)?;
        }
        if let Some(value) = lookup("ENABLE_SWAGGER") {
            self.enable_swagger = parse_bool("ENABLE_SWAGGER", value)?;
        }
        Ok(())
    }

    /// Sets the listening port, rewriting an explicit port in `app_url` to match.
    pub fn with_port(mut self, port: u16) -> Self {
        let old = format!(":{}", self.http_port);
        if let Some((scheme, rest)) = self.app_url.split_once("://") {
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            if let Some(host) = authority.strip_suffix(&old) {
                self.app_url = format!("{scheme}://{host}:{port}/{path}");
            }
        }
        self.http_port = port;
        self
    }

    /// Fail-fast checks; also normalises `app_url`.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !self.app_url.ends_with('/') {
            self.app_url.push('/');
        }
        if self.session_ttl_secs <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "SESSION_TTL_SECS",
                value: self.session_ttl_secs.to_string(),
            });
        }
        if self.protocol == Protocol::Https {
            if self.cert_file.is_none() {
                return Err(ConfigError::Missing("CERT_FILE"));
            }
            if self.key_file.is_none() {
                return Err(ConfigError::Missing("KEY_FILE"));
            }
        }
        if self.env == Env::Production {
            if self.secret_key.is_empty() || self.secret_key == LOCAL_SECRET {
                return Err(ConfigError::Missing("SECRET_KEY"));
            }
            if self.database_url.is_none() {
                return Err(ConfigError::Missing("DATABASE_URL"));
            }
        } else if self.secret_key.is_empty() {
            tracing::warn!("SECRET_KEY is empty; using the local development secret");
            self.secret_key = LOCAL_SECRET.to_string();
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_addr, self.http_port)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = AppConfig::from_toml(
            r#"
            app_env = "production"
            http_port = 8080
            require_sign_in_view = true
            "#,
        )
        .unwrap();
        assert_eq!(config.env, Env::Production);
        assert_eq!(config.http_port, 8080);
        assert!(config.require_sign_in_view);
        assert_eq!(config.session_cookie, "gitward_session");
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = AppConfig::from_toml("http_port = 8080").unwrap();
        config
            .apply_env(lookup(&[("HTTP_PORT", "9090"), ("DISABLE_ROUTER_LOG", "true")]))
            .unwrap();
        assert_eq!(config.http_port, 9090);
        assert!(config.disable_router_log);
    }

    #[test]
    fn bad_values_are_reported_by_key() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(lookup(&[("HTTP_PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "HTTP_PORT", .. }));
    }

    #[test]
    fn port_flag_rewrites_app_url() {
        let config = AppConfig::default().with_port(4000);
        assert_eq!(config.http_port, 4000);
        assert_eq!(config.app_url, "http://localhost:4000/");
        assert_eq!(config.bind_addr(), "0.0.0.0:4000");

        let custom = AppConfig {
            app_url: "https://git.example.com/".into(),
            ..AppConfig::default()
        }
        .with_port(4000);
        assert_eq!(custom.app_url, "https://git.example.com/");
    }

    #[test]
    fn production_requires_secrets() {
        let mut config = AppConfig {
            env: Env::Production,
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Missing("SECRET_KEY"))));

        config.secret_key = "real-secret".into();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("DATABASE_URL"))));

        config.database_url = Some("postgres://localhost/gitward".into());
        config.app_url = "https://git.example.com".into();
        assert!(config.validate().is_ok());
        assert_eq!(config.app_url, "https://git.example.com/");
    }

    #[test]
    fn https_requires_certificate_and_key() {
        let mut config = AppConfig::from_toml(r#"protocol = "https""#).unwrap();
        assert_eq!(config.protocol, Protocol::Https);
        assert!(matches!(config.validate(), Err(ConfigError::Missing("CERT_FILE"))));

        config
            .apply_env(lookup(&[("CERT_FILE", "tls/cert.pem"), ("ENABLE_GZIP", "on")]))
            .unwrap();
        assert!(config.enable_gzip);
        assert!(matches!(config.validate(), Err(ConfigError::Missing("KEY_FILE"))));

        config.apply_env(lookup(&[("KEY_FILE", "tls/key.pem")])).unwrap();
        assert!(config.validate().is_ok());

        let err = AppConfig::default()
            .apply_env(lookup(&[("PROTOCOL", "fcgi")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PROTOCOL", .. }));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/app.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

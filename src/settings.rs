use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment};
use serde::Deserialize;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

const DEFAULT_TARGET_PORT: i64 = 3000;
const DEFAULT_CACHE_SIZE: i64 = (64 * MB) as i64;
const DEFAULT_MAX_CACHE_ITEM_SIZE: i64 = MB as i64;
const DEFAULT_ACME_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";
const DEFAULT_STORAGE_PATH: &str = "./storage/thruster";
const DEFAULT_BAD_GATEWAY_PAGE: &str = "./public/502.html";

/// Runtime configuration, read from the environment. Every option is looked
/// up as `THRUSTER_<NAME>` first, with `<NAME>` as a fallback, so the proxy
/// can coexist with applications that already use the bare names.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub target_port: u16,

    pub cache_size: u64,
    pub max_cache_item_size: u64,
    pub x_sendfile_enabled: bool,
    pub gzip_compression_enabled: bool,
    pub gzip_compression_disable_on_auth: bool,
    pub gzip_compression_jitter: u32,
    pub max_request_body: u64,

    pub tls_domain: String,
    pub tls_local: bool,
    pub acme_directory: String,
    pub eab_kid: String,
    pub eab_hmac_key: String,
    pub storage_path: PathBuf,
    pub bad_gateway_page: PathBuf,

    pub http_port: u16,
    pub https_port: u16,
    pub http_idle_timeout: u64,
    pub http_read_timeout: u64,
    pub http_write_timeout: u64,

    pub http_health_host: String,
    pub http_health_path: String,
    pub http_health_interval: u64,
    pub http_health_timeout: u64,
    pub http_health_deadline: u64,

    pub h2c_enabled: bool,

    /// Defaults to trusting inbound X-Forwarded-* only when no TLS is
    /// configured (a TLS-terminating deployment faces clients directly).
    pub forward_headers: Option<bool>,

    pub active_storage_secret: String,

    pub debug: bool,
    pub log_level: Option<String>,
    pub log_requests: bool,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .set_default("target_port", DEFAULT_TARGET_PORT)?
            .set_default("cache_size", DEFAULT_CACHE_SIZE)?
            .set_default("max_cache_item_size", DEFAULT_MAX_CACHE_ITEM_SIZE)?
            .set_default("x_sendfile_enabled", true)?
            .set_default("gzip_compression_enabled", true)?
            .set_default("gzip_compression_disable_on_auth", false)?
            .set_default("gzip_compression_jitter", 0)?
            .set_default("max_request_body", 0)?
            .set_default("tls_domain", "")?
            .set_default("tls_local", false)?
            .set_default("acme_directory", DEFAULT_ACME_DIRECTORY)?
            .set_default("eab_kid", "")?
            .set_default("eab_hmac_key", "")?
            .set_default("storage_path", DEFAULT_STORAGE_PATH)?
            .set_default("bad_gateway_page", DEFAULT_BAD_GATEWAY_PAGE)?
            .set_default("http_port", 80)?
            .set_default("https_port", 443)?
            .set_default("http_idle_timeout", 60)?
            .set_default("http_read_timeout", 30)?
            .set_default("http_write_timeout", 30)?
            .set_default("http_health_host", "127.0.0.1")?
            .set_default("http_health_path", "")?
            .set_default("http_health_interval", 1)?
            .set_default("http_health_timeout", 1)?
            .set_default("http_health_deadline", 120)?
            .set_default("h2c_enabled", false)?
            .set_default("active_storage_secret", "")?
            .set_default("debug", false)?
            .set_default("log_requests", true)?
            // Bare names first, prefixed names second: later sources win.
            .add_source(Environment::default().try_parsing(true))
            .add_source(Environment::with_prefix("THRUSTER").try_parsing(true));

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.target_port > 0, "TARGET_PORT must not be zero");
        ensure!(self.http_port > 0, "HTTP_PORT must not be zero");
        ensure!(self.https_port > 0, "HTTPS_PORT must not be zero");
        ensure!(
            self.max_cache_item_size <= self.cache_size,
            "MAX_CACHE_ITEM_SIZE ({}) must not exceed CACHE_SIZE ({})",
            self.max_cache_item_size,
            self.cache_size
        );
        if !self.http_health_path.is_empty() {
            ensure!(
                self.http_health_path.starts_with('/'),
                "HTTP_HEALTH_PATH must start with '/' (got '{}')",
                self.http_health_path
            );
            ensure!(
                self.http_health_interval > 0 && self.http_health_timeout > 0,
                "health check interval and timeout must be greater than 0 seconds"
            );
        }
        Ok(())
    }

    pub fn tls_domains(&self) -> Vec<String> {
        self.tls_domain
            .split(',')
            .map(str::trim)
            .filter(|domain| !domain.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn has_tls(&self) -> bool {
        !self.tls_domains().is_empty()
    }

    pub fn forward_headers(&self) -> bool {
        self.forward_headers.unwrap_or(!self.has_tls())
    }

    pub fn http_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.http_idle_timeout)
    }

    pub fn http_read_timeout(&self) -> Duration {
        Duration::from_secs(self.http_read_timeout)
    }

    pub fn http_write_timeout(&self) -> Duration {
        Duration::from_secs(self.http_write_timeout)
    }

    pub fn http_health_interval(&self) -> Duration {
        Duration::from_secs(self.http_health_interval)
    }

    pub fn http_health_timeout(&self) -> Duration {
        Duration::from_secs(self.http_health_timeout)
    }

    pub fn http_health_deadline(&self) -> Duration {
        Duration::from_secs(self.http_health_deadline)
    }

    /// Effective default log filter; `RUST_LOG` still takes precedence at
    /// subscriber construction time.
    pub fn log_filter(&self) -> &str {
        if self.debug {
            return "debug";
        }
        match self.log_level.as_deref() {
            Some(level) if !level.is_empty() => level,
            _ => "info",
        }
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

#[cfg(test)]
pub fn test_settings() -> Settings {
    Settings {
        target_port: 3000,
        cache_size: 64 * MB,
        max_cache_item_size: MB,
        x_sendfile_enabled: true,
        gzip_compression_enabled: true,
        gzip_compression_disable_on_auth: false,
        gzip_compression_jitter: 0,
        max_request_body: 0,
        tls_domain: String::new(),
        tls_local: false,
        acme_directory: DEFAULT_ACME_DIRECTORY.to_string(),
        eab_kid: String::new(),
        eab_hmac_key: String::new(),
        storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
        bad_gateway_page: PathBuf::from(DEFAULT_BAD_GATEWAY_PAGE),
        http_port: 80,
        https_port: 443,
        http_idle_timeout: 60,
        http_read_timeout: 30,
        http_write_timeout: 30,
        http_health_host: "127.0.0.1".to_string(),
        http_health_path: String::new(),
        http_health_interval: 1,
        http_health_timeout: 1,
        http_health_deadline: 120,
        h2c_enabled: false,
        forward_headers: None,
        active_storage_secret: String::new(),
        debug: false,
        log_level: None,
        log_requests: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_domains_splits_and_trims() {
        let mut settings = test_settings();
        settings.tls_domain = " example.com, www.example.com ,,".to_string();
        assert_eq!(settings.tls_domains(), vec!["example.com", "www.example.com"]);
        assert!(settings.has_tls());
    }

    #[test]
    fn forward_headers_defaults_track_tls() {
        let mut settings = test_settings();
        assert!(settings.forward_headers(), "no TLS: trust edge headers");

        settings.tls_domain = "example.com".to_string();
        assert!(!settings.forward_headers(), "TLS: clients are untrusted");

        settings.forward_headers = Some(true);
        assert!(settings.forward_headers(), "explicit setting wins");
    }

    #[test]
    fn validate_rejects_item_size_above_capacity() {
        let mut settings = test_settings();
        settings.cache_size = 1024;
        settings.max_cache_item_size = 2048;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_health_path() {
        let mut settings = test_settings();
        settings.http_health_path = "up".to_string();
        assert!(settings.validate().is_err());
        settings.http_health_path = "/up".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn log_filter_prefers_debug_flag() {
        let mut settings = test_settings();
        assert_eq!(settings.log_filter(), "info");
        settings.log_level = Some("warn".to_string());
        assert_eq!(settings.log_filter(), "warn");
        settings.debug = true;
        assert_eq!(settings.log_filter(), "debug");
    }
}

//! Configuration loading, validation, and runtime state.
//!
//! The service reads its YAML configuration exactly once at startup, applies
//! the `PORT` and `RATE_LIMIT_THRESHOLD` environment overrides, and validates
//! the result into a [`RuntimeConfig`] shared by every request handler.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, ServiceError};

/// Default address the listener binds to.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default TCP port.
pub const DEFAULT_PORT: i64 = 8080;

/// Default minimum interval between two requests with the same rate-limit key.
pub const DEFAULT_RATE_LIMIT_THRESHOLD_MS: i64 = 1000;

/// Default interval between sweeps of stale rate-limit entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Hard cap on bandwidth probe payloads in both directions.
pub const DEFAULT_MAX_BANDWIDTH_BYTES: u64 = 10_000_000;

/// Payload size for `GET /bandwidth` when no `length` is given.
pub const DEFAULT_BANDWIDTH_LENGTH: u64 = 100_000;

/// Default directory of static assets served verbatim.
pub const DEFAULT_STATIC_DIR: &str = "./static";

/// Default directory of HTML templates.
pub const DEFAULT_TEMPLATES_DIR: &str = "./templates";

/// Environment variable overriding the listen port.
pub const PORT_ENV: &str = "PORT";

/// Environment variable overriding the rate-limit threshold in milliseconds.
pub const RATE_LIMIT_THRESHOLD_ENV: &str = "RATE_LIMIT_THRESHOLD";

/// Raw configuration as deserialized from the YAML file.
///
/// Maps directly to the on-disk schema. After loading, it is transformed
/// into a [`RuntimeConfig`] holding validated values.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Host address the listener binds to (default `"0.0.0.0"`).
    #[serde(default)]
    pub host: Option<String>,
    /// TCP port, 1..=65535 (default 8080).
    #[serde(default)]
    pub port: Option<i64>,
    /// Minimum milliseconds between two requests sharing a rate-limit key.
    /// `0` disables limiting; negative values are rejected.
    #[serde(default)]
    pub rate_limit_threshold_ms: Option<i64>,
    /// Interval in milliseconds between sweeps of stale rate-limit entries
    /// (default: 60000).
    #[serde(default)]
    pub rate_limit_sweep_interval_ms: Option<u64>,
    /// Geolocation data sources credited in every response, in display
    /// order. Defaults to DB-IP when absent.
    #[serde(default)]
    pub providers: Option<Vec<Link>>,
    /// Paths to the offline geolocation databases.
    #[serde(default)]
    pub geoip: GeoDbPaths,
    /// External links shown under the logo and in HTML pages.
    #[serde(default)]
    pub links: Vec<Link>,
    /// Directory of static assets (default `./static`).
    #[serde(default)]
    pub static_dir: Option<String>,
    /// Directory of HTML templates (default `./templates`).
    #[serde(default)]
    pub templates_dir: Option<String>,
    /// Hard cap on bandwidth probe payloads in bytes (default 10,000,000).
    #[serde(default)]
    pub max_bandwidth_bytes: Option<u64>,
}

/// A named external link: a geolocation provider credit or a footer link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Per-database file paths. An absent or empty path leaves that database
/// unloaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeoDbPaths {
    #[serde(default)]
    pub asn: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub isp: Option<String>,
    #[serde(default, rename = "connectionType")]
    pub connection_type: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default, rename = "anonymousIP")]
    pub anonymous_ip: Option<String>,
}

fn default_providers() -> Vec<Link> {
    vec![Link {
        name: "DB-IP".into(),
        url: "https://db-ip.com".into(),
        icon: None,
    }]
}

/// Fully validated configuration.
///
/// Created once at startup and shared across all request handlers via `Arc`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Socket address the listener binds to.
    pub listen: SocketAddr,
    /// Minimum milliseconds between requests with the same key; `0` disables.
    pub rate_limit_threshold_ms: u64,
    /// Interval between sweeps of stale rate-limit entries.
    pub rate_limit_sweep_interval: Duration,
    /// Geolocation provider credits, in display order.
    pub providers: Vec<Link>,
    /// External links for the logo block and HTML pages.
    pub links: Vec<Link>,
    /// Geolocation database paths.
    pub geoip: GeoDbPaths,
    /// Directory of static assets.
    pub static_dir: PathBuf,
    /// Directory of HTML templates.
    pub templates_dir: PathBuf,
    /// Hard cap on bandwidth payloads in bytes.
    pub max_bandwidth_bytes: u64,
    /// Length of the `GET /bandwidth` payload when none is requested.
    pub default_bandwidth_length: u64,
}

fn validate_link(kind: &str, link: &Link) -> Result<()> {
    if link.name.trim().is_empty() || link.url.trim().is_empty() {
        return Err(ServiceError::Config(format!(
            "{kind} entries need a non-empty name and url"
        )));
    }
    Ok(())
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`ServiceError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            ServiceError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| ServiceError::Config(format!("failed to parse config: {e}")))
    }

    /// Applies the `PORT` and `RATE_LIMIT_THRESHOLD` overrides read through
    /// `lookup`. Empty values are ignored; values that are not integers are
    /// rejected.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let read = |name: &str| -> Result<Option<i64>> {
            match lookup(name).map(|v| v.trim().to_owned()) {
                Some(v) if !v.is_empty() => v.parse::<i64>().map(Some).map_err(|e| {
                    ServiceError::Config(format!("invalid {name} value \"{v}\": {e}"))
                }),
                _ => Ok(None),
            }
        };

        if let Some(port) = read(PORT_ENV)? {
            self.port = Some(port);
        }
        if let Some(threshold) = read(RATE_LIMIT_THRESHOLD_ENV)? {
            self.rate_limit_threshold_ms = Some(threshold);
        }
        Ok(())
    }

    /// Validates all fields, producing a [`RuntimeConfig`].
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let host = self.host.as_deref().unwrap_or(DEFAULT_HOST);
        let host = host
            .parse::<IpAddr>()
            .map_err(|e| ServiceError::Config(format!("invalid host \"{host}\": {e}")))?;

        let port = self.port.unwrap_or(DEFAULT_PORT);
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ServiceError::Config(format!("Port {port} is not allowed")))?;

        let threshold = self
            .rate_limit_threshold_ms
            .unwrap_or(DEFAULT_RATE_LIMIT_THRESHOLD_MS);
        let rate_limit_threshold_ms = u64::try_from(threshold).map_err(|_| {
            ServiceError::Config(
                "rate limit threshold should be greater than or equal to 0".into(),
            )
        })?;

        let rate_limit_sweep_interval = self
            .rate_limit_sweep_interval_ms
            .filter(|ms| *ms > 0)
            .map_or(DEFAULT_SWEEP_INTERVAL, Duration::from_millis);

        let providers = self.providers.unwrap_or_else(default_providers);
        providers
            .iter()
            .try_for_each(|p| validate_link("provider", p))?;
        self.links.iter().try_for_each(|l| validate_link("link", l))?;

        Ok(RuntimeConfig {
            listen: SocketAddr::new(host, port),
            rate_limit_threshold_ms,
            rate_limit_sweep_interval,
            providers,
            links: self.links,
            geoip: self.geoip,
            static_dir: self
                .static_dir
                .map_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR), PathBuf::from),
            templates_dir: self
                .templates_dir
                .map_or_else(|| PathBuf::from(DEFAULT_TEMPLATES_DIR), PathBuf::from),
            max_bandwidth_bytes: self
                .max_bandwidth_bytes
                .unwrap_or(DEFAULT_MAX_BANDWIDTH_BYTES),
            default_bandwidth_length: DEFAULT_BANDWIDTH_LENGTH,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_owned())
        }
    }

    #[test]
    fn loads_config_from_file() {
        let config = Config::load_from_file("./Config.yml").expect("Config.yml should be loadable");

        assert_eq!(config.host, Some("0.0.0.0".into()));
        assert_eq!(config.port, Some(8080));
        assert_eq!(config.rate_limit_threshold_ms, Some(1000));
        let providers = config.providers.expect("providers are configured");
        assert_eq!(providers[0].name, "DB-IP");
        assert_eq!(providers[0].url, "https://db-ip.com");
        assert_eq!(config.links.len(), 3);
        assert_eq!(config.links[0].name, "Website");
        assert_eq!(
            config.geoip.asn.as_deref(),
            Some("./mmdb/dbip-asn-lite.mmdb")
        );
    }

    #[test]
    fn defaults_are_valid() {
        let rt = Config::default().into_runtime().unwrap();
        assert_eq!(
            rt.listen,
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(rt.rate_limit_threshold_ms, 1000);
        assert_eq!(rt.rate_limit_sweep_interval, DEFAULT_SWEEP_INTERVAL);
        assert_eq!(rt.providers, default_providers());
        assert_eq!(rt.max_bandwidth_bytes, 10_000_000);
        assert_eq!(rt.default_bandwidth_length, 100_000);
    }

    #[test]
    fn rejects_negative_threshold() {
        let config = Config {
            rate_limit_threshold_ms: Some(-1),
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn zero_threshold_is_allowed() {
        let config = Config {
            rate_limit_threshold_ms: Some(0),
            ..Default::default()
        };
        assert_eq!(config.into_runtime().unwrap().rate_limit_threshold_ms, 0);
    }

    #[test]
    fn rejects_out_of_range_ports() {
        for port in [0, -5, 65536] {
            let config = Config {
                port: Some(port),
                ..Default::default()
            };
            assert!(config.into_runtime().is_err(), "port {port} should be rejected");
        }
    }

    #[test]
    fn rejects_invalid_host() {
        let config = Config {
            host: Some("not-an-ip".into()),
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn rejects_nameless_links() {
        let config = Config {
            links: vec![Link {
                name: " ".into(),
                url: "https://example.com".into(),
                icon: None,
            }],
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn env_overrides_port_and_threshold() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("PORT", "9090"), ("RATE_LIMIT_THRESHOLD", "0")]))
            .unwrap();
        let rt = config.into_runtime().unwrap();
        assert_eq!(rt.listen.port(), 9090);
        assert_eq!(rt.rate_limit_threshold_ms, 0);
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = Config {
            port: Some(7000),
            ..Default::default()
        };
        config.apply_env(env(&[("PORT", "")])).unwrap();
        assert_eq!(config.port, Some(7000));
    }

    #[test]
    fn non_numeric_env_values_are_rejected() {
        let mut config = Config::default();
        assert!(config.apply_env(env(&[("PORT", "eighty")])).is_err());
    }

    #[test]
    fn geoip_paths_use_database_names() {
        let yaml = "geoip:\n  connectionType: ./ct.mmdb\n  anonymousIP: ./anon.mmdb\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.geoip.connection_type.as_deref(), Some("./ct.mmdb"));
        assert_eq!(config.geoip.anonymous_ip.as_deref(), Some("./anon.mmdb"));
    }
}

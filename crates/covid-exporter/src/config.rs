//! Exporter configuration loaded from a YAML file.

use std::{
    collections::HashSet,
    fmt, fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use hyper::Uri;
use serde::{de, Deserialize, Deserializer};

use crate::store::TOTAL_METRIC;

/// Errors that can occur when loading [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file cannot be read.
    #[error("cannot read config file `{}`: {source}", path.display())]
    Read {
        /// Path to the config file.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: io::Error,
    },
    /// Config is not valid YAML or doesn't match the expected shape.
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// Config is well-formed, but one of its values is invalid.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Exporter configuration.
///
/// # Examples
///
/// ```
/// # use covid_exporter::Config;
/// # use std::time::Duration;
/// let config = Config::from_yaml(r#"
/// defaultTTL: "60"
/// metrics:
///   total: http://localhost:8080/now
///   states:
///     - name: berlin
///       data: http://localhost:8080/states/BE
///       ttl: "5"
/// "#)?;
/// assert_eq!(config.default_ttl, Duration::from_secs(60));
/// assert_eq!(config.metrics.states[0].ttl, Some(Duration::from_secs(5)));
/// # Ok::<_, covid_exporter::ConfigError>(())
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address to serve metrics on. An address starting with `:` (e.g., `:7070`) binds
    /// to all IPv4 interfaces; use `[::]:7070` to listen on IPv6 as well.
    #[serde(default = "Config::default_listen")]
    pub listen: String,
    /// TTL for metrics without an explicit override, and for the total metric. Defaults to 60s.
    #[serde(
        rename = "defaultTTL",
        default = "Config::default_ttl",
        deserialize_with = "deserialize_seconds"
    )]
    pub default_ttl: Duration,
    /// Upper bound on the duration of a single upstream fetch.
    #[serde(
        default = "Config::default_fetch_timeout",
        deserialize_with = "deserialize_seconds"
    )]
    pub fetch_timeout: Duration,
    /// Whether to append the exporter's own metrics to the scraped output.
    #[serde(default)]
    pub self_metrics: bool,
    /// Upstream sources.
    pub metrics: MetricsConfig,
}

/// Upstream sources for the exported metrics.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// URL of the totals source.
    pub total: String,
    /// State metrics in the order they are rendered.
    #[serde(default)]
    pub states: Vec<StateMetricConfig>,
}

/// Configuration of a single state metric.
#[derive(Debug, Clone, Deserialize)]
pub struct StateMetricConfig {
    /// Name used as the `state` label value.
    pub name: String,
    /// URL of the per-state source.
    pub data: String,
    /// TTL override; if absent or empty, [`Config::default_ttl`] is used.
    #[serde(default, deserialize_with = "deserialize_optional_seconds")]
    pub ttl: Option<Duration>,
}

impl StateMetricConfig {
    /// Returns the TTL for this metric given the default one.
    pub fn effective_ttl(&self, default_ttl: Duration) -> Duration {
        self.ttl.unwrap_or(default_ttl)
    }
}

impl Config {
    fn default_listen() -> String {
        ":7070".to_owned()
    }

    fn default_ttl() -> Duration {
        Duration::from_secs(60)
    }

    fn default_fetch_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Loads and validates the config from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parses and validates the config from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or validated.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the parsed [`listen`](Self::listen) address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        let address = if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        };
        address.parse().map_err(|err| {
            ConfigError::Invalid(format!("listen address `{}` is invalid: {err}", self.listen))
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.listen_address()?;
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::Invalid("fetchTimeout must be positive".into()));
        }
        if self.metrics.total.is_empty() {
            return Err(ConfigError::Invalid("metrics.total must be set".into()));
        }
        validate_url("metrics.total", &self.metrics.total)?;

        let mut names = HashSet::with_capacity(self.metrics.states.len());
        for state in &self.metrics.states {
            if state.name.is_empty() {
                return Err(ConfigError::Invalid("state metric name must not be empty".into()));
            }
            if state.name == TOTAL_METRIC {
                return Err(ConfigError::Invalid(format!(
                    "state metric name `{TOTAL_METRIC}` is reserved"
                )));
            }
            if !names.insert(state.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "state metric `{}` is defined more than once",
                    state.name
                )));
            }
            validate_url(&format!("data of state `{}`", state.name), &state.data)?;
        }
        Ok(())
    }
}

fn validate_url(context: &str, url: &str) -> Result<(), ConfigError> {
    let uri: Uri = url
        .parse()
        .map_err(|err| ConfigError::Invalid(format!("{context}: URL `{url}` is invalid: {err}")))?;
    if !matches!(uri.scheme_str(), Some("http" | "https")) {
        return Err(ConfigError::Invalid(format!(
            "{context}: URL `{url}` must use the `http` or `https` scheme"
        )));
    }
    Ok(())
}

/// Parses a number of seconds (with an implied `s` suffix), e.g. `60` or `1.5`.
fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|err| format!("`{raw}` is not a number of seconds: {err}"))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|err| format!("`{raw}` is not a valid duration: {err}"))
}

/// Seconds can be specified either as a YAML number or as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSeconds {
    Number(f64),
    Text(String),
}

impl fmt::Display for RawSeconds {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(secs) => write!(formatter, "{secs}"),
            Self::Text(secs) => formatter.write_str(secs),
        }
    }
}

fn deserialize_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = RawSeconds::deserialize(deserializer)?;
    parse_seconds(&raw.to_string()).map_err(de::Error::custom)
}

fn deserialize_optional_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    let raw = Option::<RawSeconds>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawSeconds::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(raw) => parse_seconds(&raw.to_string())
            .map(Some)
            .map_err(de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use assert_matches::assert_matches;

    use super::*;

    const CONFIG: &str = r#"
listen: ":9090"
defaultTTL: "60"
fetchTimeout: 2.5
selfMetrics: true
metrics:
  total: http://localhost:8080/now
  states:
    - name: berlin
      data: http://localhost:8080/states/BE
      ttl: "5"
    - name: hamburg
      data: http://localhost:8080/states/HH
      ttl: ""
    - name: bremen
      data: http://localhost:8080/states/HB
      ttl: 30
"#;

    #[test]
    fn parsing_full_config() {
        let config = Config::from_yaml(CONFIG).unwrap();
        assert_eq!(config.listen_address().unwrap(), "0.0.0.0:9090".parse().unwrap());
        assert_eq!(config.default_ttl, Duration::from_secs(60));
        assert_eq!(config.fetch_timeout, Duration::from_millis(2_500));
        assert!(config.self_metrics);
        assert_eq!(config.metrics.total, "http://localhost:8080/now");

        let states = &config.metrics.states;
        let names: Vec<_> = states.iter().map(|state| state.name.as_str()).collect();
        assert_eq!(names, ["berlin", "hamburg", "bremen"]);
        assert_eq!(states[0].ttl, Some(Duration::from_secs(5)));
        assert_eq!(states[1].ttl, None);
        assert_eq!(states[2].ttl, Some(Duration::from_secs(30)));
        assert_eq!(states[1].effective_ttl(config.default_ttl), Duration::from_secs(60));
    }

    #[test]
    fn defaults_are_applied() {
        let config = Config::from_yaml("metrics:\n  total: http://localhost/now\n").unwrap();
        assert_eq!(config.listen, ":7070");
        assert_eq!(config.listen_address().unwrap(), "0.0.0.0:7070".parse().unwrap());
        assert_eq!(config.default_ttl, Duration::from_secs(60));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert!(!config.self_metrics);
        assert!(config.metrics.states.is_empty());
    }

    #[test]
    fn explicit_listen_address() {
        let config = Config::from_yaml(
            "listen: 127.0.0.1:8000\nmetrics:\n  total: http://localhost/now\n",
        )
        .unwrap();
        assert_eq!(config.listen_address().unwrap(), "127.0.0.1:8000".parse().unwrap());
    }

    #[test]
    fn invalid_ttl_is_rejected() {
        let raw = "defaultTTL: soon\nmetrics:\n  total: http://localhost/now\n";
        let err = Config::from_yaml(raw).unwrap_err();
        assert_matches!(err, ConfigError::Parse(_));

        let raw = "defaultTTL: \"-5\"\nmetrics:\n  total: http://localhost/now\n";
        let err = Config::from_yaml(raw).unwrap_err();
        assert_matches!(err, ConfigError::Parse(_));
    }

    #[test]
    fn missing_metrics_are_rejected() {
        let err = Config::from_yaml("listen: \":7070\"\n").unwrap_err();
        assert_matches!(err, ConfigError::Parse(_));

        let err = Config::from_yaml("metrics:\n  total: \"\"\n").unwrap_err();
        assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("metrics.total"));
    }

    #[test]
    fn duplicate_state_names_are_rejected() {
        let raw = r#"
metrics:
  total: http://localhost/now
  states:
    - name: berlin
      data: http://localhost/BE
    - name: berlin
      data: http://localhost/BE2
"#;
        let err = Config::from_yaml(raw).unwrap_err();
        assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("more than once"));
    }

    #[test]
    fn reserved_state_name_is_rejected() {
        let raw = r#"
metrics:
  total: http://localhost/now
  states:
    - name: total
      data: http://localhost/total
"#;
        let err = Config::from_yaml(raw).unwrap_err();
        assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("reserved"));
    }

    #[test]
    fn https_urls_are_accepted() {
        let raw = r#"
metrics:
  total: https://api.example.com/now
  states:
    - name: berlin
      data: https://api.example.com/states/BE
"#;
        let config = Config::from_yaml(raw).unwrap();
        assert_eq!(config.metrics.total, "https://api.example.com/now");
        assert_eq!(config.metrics.states[0].data, "https://api.example.com/states/BE");
    }

    #[test]
    fn unsupported_url_schemes_are_rejected() {
        let raw = r#"
metrics:
  total: http://localhost/now
  states:
    - name: berlin
      data: ftp://localhost/BE
"#;
        let err = Config::from_yaml(raw).unwrap_err();
        assert_matches!(
            err,
            ConfigError::Invalid(msg) if msg.contains("`http` or `https` scheme")
        );

        let err = Config::from_yaml("metrics:
  total: localhost/now
").unwrap_err();
        assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("metrics.total"));
    }

    #[test]
    fn ipv6_listen_address_is_accepted() {
        let config =
            Config::from_yaml("listen: \"[::]:7070\"\nmetrics:\n  total: http://localhost/now\n")
                .unwrap();
        assert_eq!(config.listen_address().unwrap(), "[::]:7070".parse().unwrap());
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        let raw = "listen: nowhere\nmetrics:\n  total: http://localhost/now\n";
        let err = Config::from_yaml(raw).unwrap_err();
        assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("listen address"));
    }

    #[test]
    fn loading_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.metrics.states.len(), 3);

        let err = Config::load(Path::new("/definitely/missing/config.yml")).unwrap_err();
        assert_matches!(err, ConfigError::Read { .. });
    }
}

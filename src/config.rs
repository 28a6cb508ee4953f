//! Run configuration
//!
//! Global defaults that every test, step and operation inherits unless it
//! overrides them. Build it programmatically or load it from YAML.
//!
//! # Example
//!
//! ```
//! use kuvio::config::{Configuration, DeletionPropagation, Timeouts};
//! use std::time::Duration;
//!
//! let config = Configuration::new()
//!     .parallel(4)
//!     .fail_fast(true)
//!     .deletion_propagation(DeletionPropagation::Foreground)
//!     .timeouts(Timeouts::new().assert(Duration::from_secs(60)));
//!
//! assert_eq!(config.resolved_timeouts().assert, Duration::from_secs(60));
//! assert_eq!(config.resolved_timeouts().apply, Duration::from_secs(5));
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-verb timeout overrides; `None` inherits from the enclosing level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Timeouts {
    #[serde(default, deserialize_with = "duration::deserialize_option")]
    pub apply: Option<Duration>,
    #[serde(default, deserialize_with = "duration::deserialize_option")]
    pub assert: Option<Duration>,
    #[serde(default, deserialize_with = "duration::deserialize_option")]
    pub cleanup: Option<Duration>,
    #[serde(default, deserialize_with = "duration::deserialize_option")]
    pub delete: Option<Duration>,
    #[serde(default, deserialize_with = "duration::deserialize_option")]
    pub error: Option<Duration>,
    #[serde(default, deserialize_with = "duration::deserialize_option")]
    pub exec: Option<Duration>,
}

impl Timeouts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(mut self, d: Duration) -> Self {
        self.apply = Some(d);
        self
    }

    pub fn assert(mut self, d: Duration) -> Self {
        self.assert = Some(d);
        self
    }

    pub fn cleanup(mut self, d: Duration) -> Self {
        self.cleanup = Some(d);
        self
    }

    pub fn delete(mut self, d: Duration) -> Self {
        self.delete = Some(d);
        self
    }

    pub fn error(mut self, d: Duration) -> Self {
        self.error = Some(d);
        self
    }

    pub fn exec(mut self, d: Duration) -> Self {
        self.exec = Some(d);
        self
    }

    /// Value for one verb
    pub fn get(&self, kind: TimeoutKind) -> Option<Duration> {
        match kind {
            TimeoutKind::Apply => self.apply,
            TimeoutKind::Assert => self.assert,
            TimeoutKind::Cleanup => self.cleanup,
            TimeoutKind::Delete => self.delete,
            TimeoutKind::Error => self.error,
            TimeoutKind::Exec => self.exec,
        }
    }
}

/// Which timeout budget an operation draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Apply,
    Assert,
    Cleanup,
    Delete,
    Error,
    Exec,
}

/// Fully resolved timeouts, one concrete value per verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTimeouts {
    pub apply: Duration,
    pub assert: Duration,
    pub cleanup: Duration,
    pub delete: Duration,
    pub error: Duration,
    pub exec: Duration,
}

impl Default for DefaultTimeouts {
    fn default() -> Self {
        Self {
            apply: Duration::from_secs(5),
            assert: Duration::from_secs(30),
            cleanup: Duration::from_secs(30),
            delete: Duration::from_secs(15),
            error: Duration::from_secs(30),
            exec: Duration::from_secs(5),
        }
    }
}

impl DefaultTimeouts {
    /// Overlay the set values of `overrides`; unset values keep the current ones
    #[must_use]
    pub fn with_overrides(&self, overrides: &Timeouts) -> Self {
        Self {
            apply: overrides.apply.unwrap_or(self.apply),
            assert: overrides.assert.unwrap_or(self.assert),
            cleanup: overrides.cleanup.unwrap_or(self.cleanup),
            delete: overrides.delete.unwrap_or(self.delete),
            error: overrides.error.unwrap_or(self.error),
            exec: overrides.exec.unwrap_or(self.exec),
        }
    }

    pub fn get(&self, kind: TimeoutKind) -> Duration {
        match kind {
            TimeoutKind::Apply => self.apply,
            TimeoutKind::Assert => self.assert,
            TimeoutKind::Cleanup => self.cleanup,
            TimeoutKind::Delete => self.delete,
            TimeoutKind::Error => self.error,
            TimeoutKind::Exec => self.exec,
        }
    }
}

/// Cascading behavior for deletions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
pub enum DeletionPropagation {
    /// Dependents are deleted before the owner disappears
    Foreground,
    /// Owner is deleted immediately, dependents in the background
    #[default]
    Background,
    /// Dependents are left behind
    Orphan,
}

impl std::fmt::Display for DeletionPropagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletionPropagation::Foreground => write!(f, "Foreground"),
            DeletionPropagation::Background => write!(f, "Background"),
            DeletionPropagation::Orphan => write!(f, "Orphan"),
        }
    }
}

/// Global run configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Configuration {
    /// Per-verb global timeouts
    pub timeouts: Timeouts,

    /// Interval between attempts of every polling loop
    #[serde(deserialize_with = "duration::deserialize")]
    pub poll_interval: Duration,

    /// Maximum number of concurrently running tests
    pub parallel: usize,

    /// Cancel not-yet-started tests and steps after the first failure
    pub fail_fast: bool,

    /// Leave created resources behind
    pub skip_delete: bool,

    /// Grace period before cleanup starts
    #[serde(deserialize_with = "duration::deserialize_option")]
    pub delay_before_cleanup: Option<Duration>,

    pub deletion_propagation: DeletionPropagation,

    /// Shared namespace for every test that does not declare its own
    pub namespace: Option<String>,

    /// Substitute `"$name"` references inside resource documents
    pub templating: bool,

    pub report_name: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            poll_interval: Duration::from_secs(1),
            parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            fail_fast: false,
            skip_delete: false,
            delay_before_cleanup: None,
            deletion_propagation: DeletionPropagation::default(),
            namespace: None,
            templating: true,
            report_name: "kuvio-report".to_string(),
        }
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Configuration = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel == 0 {
            return Err(ConfigError::Invalid("parallel must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("pollInterval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn skip_delete(mut self, skip: bool) -> Self {
        self.skip_delete = skip;
        self
    }

    pub fn delay_before_cleanup(mut self, delay: Duration) -> Self {
        self.delay_before_cleanup = Some(delay);
        self
    }

    pub fn deletion_propagation(mut self, policy: DeletionPropagation) -> Self {
        self.deletion_propagation = policy;
        self
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn templating(mut self, enabled: bool) -> Self {
        self.templating = enabled;
        self
    }

    pub fn report_name(mut self, name: impl Into<String>) -> Self {
        self.report_name = name.into();
        self
    }

    /// Built-in defaults overlaid with the configured timeouts
    pub fn resolved_timeouts(&self) -> DefaultTimeouts {
        DefaultTimeouts::default().with_overrides(&self.timeouts)
    }
}

/// Parse durations such as `"500ms"`, `"2s"`, `"1m30s"` or `"1.5h"`
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_end].parse().map_err(|_| invalid())?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_end] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += value * factor;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}

/// Serde helpers for human-readable durations
pub(crate) mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(u64),
        Text(String),
    }

    fn convert<E: serde::de::Error>(repr: Repr) -> Result<Duration, E> {
        match repr {
            Repr::Seconds(s) => Ok(Duration::from_secs(s)),
            Repr::Text(t) => super::parse_duration(&t).map_err(E::custom),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        convert(Repr::deserialize(d)?)
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<Repr>::deserialize(d)? {
            Some(repr) => convert(repr).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let t = DefaultTimeouts::default();
        assert_eq!(t.apply, Duration::from_secs(5));
        assert_eq!(t.assert, Duration::from_secs(30));
        assert_eq!(t.cleanup, Duration::from_secs(30));
        assert_eq!(t.delete, Duration::from_secs(15));
        assert_eq!(t.error, Duration::from_secs(30));
        assert_eq!(t.exec, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides_only_replace_set_values() {
        let base = DefaultTimeouts::default();
        let merged = base.with_overrides(&Timeouts::new().assert(Duration::from_secs(2)));
        assert_eq!(merged.assert, Duration::from_secs(2));
        assert_eq!(merged.apply, base.apply);
        assert_eq!(merged.get(TimeoutKind::Delete), Duration::from_secs(15));
    }

    #[test]
    fn test_configuration_builder() {
        let config = Configuration::new()
            .parallel(2)
            .fail_fast(true)
            .skip_delete(true)
            .namespace("shared")
            .delay_before_cleanup(Duration::from_secs(3))
            .poll_interval(Duration::from_millis(100));

        assert_eq!(config.parallel, 2);
        assert!(config.fail_fast);
        assert!(config.skip_delete);
        assert!(config.templating);
        assert_eq!(config.namespace.as_deref(), Some("shared"));
        assert_eq!(config.delay_before_cleanup, Some(Duration::from_secs(3)));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.deletion_propagation, DeletionPropagation::Background);
    }

    #[test]
    fn test_configuration_from_yaml() {
        let yaml = r#"
timeouts:
  assert: 1m
  exec: 10
pollInterval: 250ms
parallel: 3
failFast: true
deletionPropagation: Foreground
templating: false
"#;
        let config = Configuration::from_yaml(yaml).unwrap();
        let t = config.resolved_timeouts();
        assert_eq!(t.assert, Duration::from_secs(60));
        assert_eq!(t.exec, Duration::from_secs(10));
        assert_eq!(t.apply, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.parallel, 3);
        assert!(config.fail_fast);
        assert!(!config.templating);
        assert_eq!(config.deletion_propagation, DeletionPropagation::Foreground);
    }

    #[test]
    fn test_configuration_rejects_zero_parallel() {
        assert!(matches!(
            Configuration::from_yaml("parallel: 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_configuration_rejects_unknown_keys() {
        assert!(matches!(
            Configuration::from_yaml("paralel: 2"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_configuration_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "skipDelete: true\nnamespace: e2e\n").unwrap();

        let config = Configuration::from_file(&path).unwrap();
        assert!(config.skip_delete);
        assert_eq!(config.namespace.as_deref(), Some("e2e"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5 days").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        assert!(matches!(
            parse_duration("99999999999999999999h"),
            Err(ConfigError::InvalidDuration(_))
        ));
        let yaml = "timeouts:\n  assert: 99999999999999999999h\n";
        assert!(Configuration::from_yaml(yaml).is_err());
    }
}

//! Process-wide configuration, immutable once loaded.

use std::{path::Path, time::Duration};

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;

/// The four identity patterns a deployment is seeded with if it doesn't
/// configure its own `cert_deny_list`. These match identities that should
/// never be auto-provisioned even if they show up on the provisioning
/// subcollective (compromised or misbehaving agents impersonating
/// privileged roles, stray admin/test nodes, etc).
pub const DEFAULT_CERT_DENY_LIST: &[&str] = &[
    r"^admin\.",
    r"\.privileged\.",
    r"^root\.",
    r"\.security\.",
];

pub const DEFAULT_LIFECYCLE_COMPONENT: &str = "provisioner";

/// Process-wide, immutable-after-startup configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker routines draining the work queue.
    pub workers: usize,
    /// Period between discovery broadcast cycles.
    pub interval: Duration,
    /// Path to the external helper executable.
    pub helper: String,
    /// Shared secret sent with privileged node actions. Empty means don't
    /// send a token; the node decides whether to require one.
    pub token: String,
    /// Transport security hint passed down to the fabric client.
    pub insecure: bool,
    /// Metric label identifying this orchestrator's deployment site.
    pub site: String,
    /// `component` field lifecycle `startup` events must carry to be
    /// accepted by the event source.
    pub lifecycle_component: String,
    /// Compiled deny-list patterns; an identity matching any of these never
    /// reaches CONFIGURE/RESTART.
    pub cert_deny_list: Vec<Regex>,
    /// Port the `/metrics` HTTP endpoint listens on. `0` disables it.
    pub monitor_port: u16,
    pub features: Features,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Features {
    /// Whether the CSR generation step runs at all.
    #[serde(default)]
    pub pki: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    workers: usize,
    interval_secs: u64,
    helper: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    insecure: bool,
    site: String,
    #[serde(default = "default_lifecycle_component")]
    lifecycle_component: String,
    #[serde(default = "default_cert_deny_list")]
    cert_deny_list: Vec<String>,
    #[serde(default)]
    monitor_port: u16,
    #[serde(default)]
    features: Features,
}

fn default_lifecycle_component() -> String {
    DEFAULT_LIFECYCLE_COMPONENT.to_owned()
}

fn default_cert_deny_list() -> Vec<String> {
    DEFAULT_CERT_DENY_LIST.iter().map(|s| (*s).to_owned()).collect()
}

impl Config {
    /// Loads and validates a [`Config`] from a YAML or JSON file at `path`.
    /// Format is auto-detected by trying YAML first, then JSON - this way a
    /// `.json` file that happens to be valid YAML (most JSON is) still
    /// round-trips, while a `.yaml`/`.yml` extension isn't required.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw_config = Self::parse(&raw)
            .map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_raw(raw_config)
    }

    fn parse(raw: &str) -> Result<RawConfig, Box<dyn std::error::Error + Send + Sync>> {
        match serde_yaml::from_str::<RawConfig>(raw) {
            Ok(config) => Ok(config),
            Err(yaml_err) => serde_json::from_str::<RawConfig>(raw)
                .map_err(|_json_err| Box::new(yaml_err) as Box<dyn std::error::Error + Send + Sync>),
        }
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.workers == 0 {
            return Err(ConfigError::Invalid("workers must be a positive integer".to_owned()));
        }
        if raw.site.is_empty() {
            return Err(ConfigError::Invalid("site must not be empty".to_owned()));
        }
        if raw.helper.is_empty() {
            return Err(ConfigError::Invalid("helper path must not be empty".to_owned()));
        }

        let cert_deny_list = raw
            .cert_deny_list
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!("invalid cert_deny_list pattern {pattern:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            workers: raw.workers,
            interval: Duration::from_secs(raw.interval_secs),
            helper: raw.helper,
            token: raw.token,
            insecure: raw.insecure,
            site: raw.site,
            lifecycle_component: raw.lifecycle_component,
            cert_deny_list,
            monitor_port: raw.monitor_port,
            features: raw.features,
        })
    }
}

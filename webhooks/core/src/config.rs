//! Runtime configuration.
//!
//! The live configuration is an immutable [`Config`] snapshot. A single
//! [`ConfigWriter`] derives each new snapshot from the previous one and swaps
//! it in; request handlers read through a [`SharedConfig`] and never observe a
//! partially updated value.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// The ConfigMap key holding the fallback decision.
pub const DEFAULT_ADMIT_POLICY_KEY: &str = "DefaultAdmitPolicy";

/// The decision applied to requests no handler path matches.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DefaultPolicy {
    #[default]
    Always,
    Never,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid default admit policy {0:?}; expected Always or Never")]
pub struct InvalidPolicy(String);

/// Coordinates of the ConfigMap that overrides the configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Source {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub default_policy: DefaultPolicy,

    /// Where dynamic overrides are read from, if enabled.
    pub source: Option<Source>,

    /// Every key of the source ConfigMap, passed through verbatim for
    /// plugins.
    pub data: BTreeMap<String, String>,
}

/// A cheap, cloneable reader of the current configuration.
#[derive(Clone, Debug)]
pub struct SharedConfig(watch::Receiver<Arc<Config>>);

/// The single writer of the current configuration.
#[derive(Debug)]
pub struct ConfigWriter(watch::Sender<Arc<Config>>);

pub fn channel(config: Config) -> (ConfigWriter, SharedConfig) {
    let (tx, rx) = watch::channel(Arc::new(config));
    (ConfigWriter(tx), SharedConfig(rx))
}

// === impl DefaultPolicy ===

impl FromStr for DefaultPolicy {
    type Err = InvalidPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("always") => Ok(Self::Always),
            s if s.eq_ignore_ascii_case("never") => Ok(Self::Never),
            s => Err(InvalidPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for DefaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Never => f.write_str("Never"),
        }
    }
}

// === impl Config ===

impl Config {
    pub fn new(default_policy: DefaultPolicy) -> Self {
        Self {
            default_policy,
            ..Default::default()
        }
    }

    pub fn with_source(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.source = Some(Source {
            namespace: namespace.into(),
            name: name.into(),
        });
        self
    }

    /// Builds the snapshot that results from observing `data` in the source.
    ///
    /// A missing or unparseable `DefaultAdmitPolicy` keeps the current value.
    /// All other keys replace the previous data wholesale.
    pub fn reconcile(&self, data: BTreeMap<String, String>) -> Self {
        let default_policy = match data.get(DEFAULT_ADMIT_POLICY_KEY) {
            None => {
                debug!(policy = %self.default_policy, "No default admit policy set; keeping current");
                self.default_policy
            }
            Some(value) => match value.parse() {
                Ok(policy) => policy,
                Err(error) => {
                    warn!(%error, policy = %self.default_policy, "Keeping last known default admit policy");
                    self.default_policy
                }
            },
        };

        Self {
            default_policy,
            source: self.source.clone(),
            data,
        }
    }
}

// === impl SharedConfig ===

impl SharedConfig {
    /// A configuration that never changes.
    pub fn fixed(config: Config) -> Self {
        let (_, rx) = channel(config);
        rx
    }

    /// Returns the current snapshot.
    pub fn get(&self) -> Arc<Config> {
        self.0.borrow().clone()
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::fixed(Config::default())
    }
}

// === impl ConfigWriter ===

impl ConfigWriter {
    pub fn current(&self) -> Arc<Config> {
        self.0.borrow().clone()
    }

    pub fn reconcile(&self, data: BTreeMap<String, String>) -> Arc<Config> {
        let next = Arc::new(self.current().reconcile(data));
        self.0.send_replace(next.clone());
        next
    }

    pub fn subscribe(&self) -> SharedConfig {
        SharedConfig(self.0.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn parses_policies_case_insensitively() {
        assert_eq!("Always".parse(), Ok(DefaultPolicy::Always));
        assert_eq!("never".parse(), Ok(DefaultPolicy::Never));
        assert_eq!(" NEVER ".parse(), Ok(DefaultPolicy::Never));
        assert!("sometimes".parse::<DefaultPolicy>().is_err());
    }

    #[test]
    fn reconcile_applies_valid_policy() {
        let cfg = Config::new(DefaultPolicy::Always).with_source("kube-system", "cm");
        let next = cfg.reconcile(btreemap! {
            DEFAULT_ADMIT_POLICY_KEY.to_string() => "Never".to_string(),
        });
        assert_eq!(next.default_policy, DefaultPolicy::Never);
        assert_eq!(next.source, cfg.source);
    }

    #[test]
    fn reconcile_keeps_last_good_policy() {
        let cfg = Config::new(DefaultPolicy::Never);
        let next = cfg.reconcile(btreemap! {
            DEFAULT_ADMIT_POLICY_KEY.to_string() => "Maybe".to_string(),
        });
        assert_eq!(next.default_policy, DefaultPolicy::Never);

        let next = next.reconcile(BTreeMap::new());
        assert_eq!(next.default_policy, DefaultPolicy::Never);
    }

    #[test]
    fn reconcile_passes_unknown_keys_through() {
        let data = btreemap! {
            "weightForAffinity".to_string() => "50".to_string(),
            "jiveWebAppsAffinity".to_string() => "hpaName: web".to_string(),
        };
        let next = Config::default().reconcile(data.clone());
        assert_eq!(next.data, data);

        let next = next.reconcile(BTreeMap::new());
        assert!(next.data.is_empty(), "data must be replaced, not merged");
    }

    #[test]
    fn readers_observe_whole_snapshots() {
        let (writer, reader) = channel(Config::new(DefaultPolicy::Always));
        let before = reader.get();

        writer.reconcile(btreemap! {
            DEFAULT_ADMIT_POLICY_KEY.to_string() => "Never".to_string(),
            "k".to_string() => "v".to_string(),
        });

        assert_eq!(before.default_policy, DefaultPolicy::Always);
        assert!(before.data.is_empty());

        let after = reader.get();
        assert_eq!(after.default_policy, DefaultPolicy::Never);
        assert_eq!(after.data.get("k").map(String::as_str), Some("v"));
        assert_eq!(writer.subscribe().get(), after);
    }

    #[test]
    fn fixed_config_outlives_its_writer() {
        let shared = SharedConfig::fixed(Config::new(DefaultPolicy::Never));
        assert_eq!(shared.get().default_policy, DefaultPolicy::Never);
    }
}

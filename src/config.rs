use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use serde::Deserialize;

use crate::{
    aggregator::AggregatorOptions,
    spec::{SpecError, WatchSpec},
    watcher::{backoff::BackoffPolicy, WatcherOptions},
};

pub mod selector;

/// Configuration of the `kubernetes_watch` input.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    /// The resources to watch.
    pub watches: Vec<WatchConfig>,

    /// Capacity of the channel shared by all watchers.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long `close` waits for watchers to exit.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// How a watch without namespaces is opened.
    #[serde(default)]
    pub all_namespaces: AllNamespaces,

    /// Whether the first list of every watcher emits the existing objects.
    #[serde(default = "default_true")]
    pub emit_initial: bool,

    /// Resolve every kind at startup and fail if one is not served.
    #[serde(default)]
    pub strict_discovery: bool,

    /// Re-emit every known object at this interval.
    #[serde(default)]
    pub resync_interval_ms: Option<u64>,

    /// Server-side timeout of a single watch call.
    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u32,

    /// Page size for list calls; unset lists everything at once.
    #[serde(default)]
    pub list_page_size: Option<u32>,

    /// Retry interval after authorization and not-found errors.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// One entry of `watches`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WatchConfig {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Empty means all namespaces.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub selector: Option<metav1::LabelSelector>,
    #[serde(default)]
    pub field_selector: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllNamespaces {
    /// One cluster-wide watch.
    #[default]
    Cluster,
    /// List namespaces once at startup and watch each of them.
    PerNamespace,
}

/// Exponential backoff for transient API errors.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Fraction of each delay that is randomized.
    #[serde(default = "default_backoff_randomization_factor")]
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            randomization_factor: default_backoff_randomization_factor(),
        }
    }
}

impl InputConfig {
    /// Builds the validated watch specs.
    pub fn specs(&self) -> Result<Vec<WatchSpec>, SpecError> {
        self.watches.iter().map(WatchSpec::try_from).collect()
    }

    pub fn options(&self) -> AggregatorOptions {
        AggregatorOptions {
            channel_capacity: self.channel_capacity,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            all_namespaces: self.all_namespaces,
            strict_discovery: self.strict_discovery,
            watcher: WatcherOptions {
                emit_initial: self.emit_initial,
                watch_timeout_secs: self.watch_timeout_secs,
                list_page_size: self.list_page_size,
                resync_interval: self.resync_interval_ms.map(Duration::from_millis),
                retry_interval: Duration::from_millis(self.retry_interval_ms),
                backoff: BackoffPolicy {
                    initial: Duration::from_millis(self.backoff.initial_ms),
                    max: Duration::from_millis(self.backoff.max_ms),
                    multiplier: self.backoff.multiplier,
                    randomization_factor: self.backoff.randomization_factor,
                },
            },
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    128
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_watch_timeout_secs() -> u32 {
    290
}

fn default_retry_interval_ms() -> u64 {
    30_000
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_randomization_factor() -> f64 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::NamespaceScope;

    #[test]
    fn parses_yaml_with_defaults() {
        let config: InputConfig = serde_yaml::from_str(
            r#"
watches:
  - version: v1
    kind: Pod
    namespaces: [default, kube-system]
    selector:
      matchLabels:
        app: web
      matchExpressions:
        - key: tier
          operator: In
          values: [frontend]
    fieldSelector: status.phase=Running
  - group: apps
    version: v1
    kind: Deployment
all_namespaces: per_namespace
backoff:
  initial_ms: 100
"#,
        )
        .unwrap();

        assert_eq!(config.channel_capacity, 128);
        assert_eq!(config.all_namespaces, AllNamespaces::PerNamespace);
        assert!(config.emit_initial);

        let options = config.options();
        assert_eq!(options.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(options.watcher.backoff.initial, Duration::from_millis(100));
        assert_eq!(options.watcher.backoff.max, Duration::from_secs(30));
        assert_eq!(options.watcher.backoff.randomization_factor, 0.5);

        let specs = config.specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].gvk().kind, "Pod");
        assert_eq!(
            specs[0].label_selector().map(ToString::to_string).as_deref(),
            Some("app=web,tier in (frontend)")
        );
        assert_eq!(
            specs[0].field_selector().map(ToString::to_string).as_deref(),
            Some("status.phase=Running")
        );
        assert!(matches!(specs[0].namespaces(), NamespaceScope::Only(ns) if ns.len() == 2));
        assert_eq!(specs[1].gvk().group, "apps");
        assert_eq!(specs[1].namespaces(), &NamespaceScope::All);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = serde_yaml::from_str::<InputConfig>(
            "watches:\n  - version: v1\n    kind: Pod\n    labels: {a: b}\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn invalid_selector_fails_spec_building() {
        let config: InputConfig = serde_yaml::from_str(
            "watches:\n  - version: v1\n    kind: Pod\n    fieldSelector: metadata.name\n",
        )
        .unwrap();
        assert!(config.specs().is_err());
    }
}

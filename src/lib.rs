//! kube-watch-input streams changes of Kubernetes resources into a message pipeline.
//!
//! Each configured watch (group/version/kind, namespaces and selectors) is served by
//! one or more list+watch loops, one per namespace or a single cluster-wide one.
//! The loops survive expired resource versions, denied access, resources that are not
//! installed yet and dropped connections without blocking each other.
//! Their events are normalized into a JSON payload with identifying metadata
//! and merged into one stream that the pipeline consumes through the [`host::Input`] contract.

pub mod aggregator;
pub use aggregator::{AggregatorOptions, WatchAggregator};
pub mod config;
pub use config::InputConfig;
pub mod host;
pub mod input;
pub use input::KubernetesWatchInput;
pub mod normalize;
pub mod spec;
pub use spec::WatchSpec;
pub mod watcher;

//! The `kubernetes_watch` input.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::{AggregatorOptions, NextError, StopError, WatchAggregator},
    config::InputConfig,
    host::{
        registry::{BuildError, Resources},
        AckFn, Input, InputError, Message,
    },
    normalize::NormalizedEvent,
    spec::{SpecError, WatchSpec},
    watcher::client::ResourceClient,
};

/// Registry name of [`KubernetesWatchInput`].
pub const NAME: &str = "kubernetes_watch";

/// Delivers Kubernetes watch events as pipeline messages.
///
/// Acknowledgements are no-ops: redelivery is governed by the watch protocol, not by the pipeline.
pub struct KubernetesWatchInput {
    client: Arc<dyn ResourceClient>,
    specs: Vec<WatchSpec>,
    options: AggregatorOptions,
    aggregator: OnceCell<WatchAggregator>,
}

impl KubernetesWatchInput {
    pub fn new(client: Arc<dyn ResourceClient>, specs: Vec<WatchSpec>, options: AggregatorOptions) -> Self {
        Self {
            client,
            specs,
            options,
            aggregator: OnceCell::new(),
        }
    }

    pub fn from_config(config: &InputConfig, client: Arc<dyn ResourceClient>) -> Result<Self, SpecError> {
        Ok(Self::new(client, config.specs()?, config.options()))
    }
}

#[async_trait]
impl Input for KubernetesWatchInput {
    async fn connect(&self) -> Result<(), InputError> {
        self.aggregator
            .get_or_try_init(|| {
                WatchAggregator::start(self.client.clone(), self.specs.clone(), self.options.clone())
            })
            .await
            .map_err(|err| InputError::Connect(Box::new(err)))?;
        Ok(())
    }

    async fn read(&self, ctx: &CancellationToken) -> Result<(Message, AckFn), InputError> {
        let aggregator = self.aggregator.get().ok_or(InputError::NotConnected)?;
        match aggregator.next(ctx).await {
            Ok(event) => Ok((to_message(event), noop_ack())),
            Err(NextError::Cancelled) => Err(InputError::Cancelled),
            Err(NextError::Closed) => Err(InputError::EndOfInput),
        }
    }

    async fn close(&self) -> Result<(), InputError> {
        let Some(aggregator) = self.aggregator.get() else {
            return Ok(());
        };
        aggregator.stop().await.map_err(|err| match err {
            StopError::Timeout(timeout) => InputError::ShutdownTimeout(timeout),
        })
    }
}

fn to_message(event: NormalizedEvent) -> Message {
    Message::new(event.payload).with_metadata(event.meta.to_map())
}

fn noop_ack() -> AckFn {
    Box::new(|result| {
        Box::pin(async move {
            if let Err(reason) = result {
                log::debug!("message rejected downstream: {reason}");
            }
        })
    })
}

pub(crate) fn build(config: &serde_yaml::Value, resources: &Resources) -> Result<Box<dyn Input>, BuildError> {
    let config: InputConfig = serde_yaml::from_value(config.clone())
        .map_err(|source| BuildError::Config { input: NAME, source })?;
    let input = KubernetesWatchInput::from_config(&config, resources.client.clone())?;
    Ok(Box::new(input))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        normalize::{META_DELETED, META_KIND, META_NAME, META_NAMESPACE},
        tests::{namespaced, object, Call, FakeCluster},
    };

    fn meta<'a>(message: &'a Message, key: &str) -> Option<&'a str> {
        message.metadata().get(key).map(String::as_str)
    }

    fn input(cluster: &Arc<FakeCluster>, specs: Vec<WatchSpec>) -> KubernetesWatchInput {
        KubernetesWatchInput::new(cluster.clone(), specs, AggregatorOptions::default())
    }

    #[tokio::test(start_paused = true)]
    async fn read_before_connect_fails() {
        let cluster = FakeCluster::new();
        let input = input(&cluster, vec![WatchSpec::new("", "v1", "ConfigMap").unwrap()]);

        let ctx = CancellationToken::new();
        assert!(matches!(input.read(&ctx).await, Err(InputError::NotConnected)));
        assert!(input.close().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let cluster = FakeCluster::new();
        cluster.add_kind("", "v1", "ConfigMap", true);
        cluster.put("ConfigMap", namespaced("ConfigMap", "default", "settings"));
        let input = input(&cluster, vec![WatchSpec::new("", "v1", "ConfigMap").unwrap()]);

        input.connect().await.unwrap();
        input.connect().await.unwrap();

        let ctx = CancellationToken::new();
        let (message, ack) = input.read(&ctx).await.unwrap();
        ack(Ok(())).await;
        assert_eq!(meta(&message, META_NAME), Some("settings"));

        assert!(tokio::time::timeout(Duration::from_secs(1), input.read(&ctx))
            .await
            .is_err());
        let lists = cluster
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::List { .. }))
            .count();
        assert_eq!(lists, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_carry_metadata() {
        let cluster = FakeCluster::new();
        cluster.add_kind("", "v1", "Namespace", false);
        cluster.put("Namespace", object("Namespace", None, "team-a"));
        let input = input(&cluster, vec![WatchSpec::new("", "v1", "Namespace").unwrap()]);
        input.connect().await.unwrap();

        let ctx = CancellationToken::new();
        let (message, ack) = input.read(&ctx).await.unwrap();
        ack(Err("sink unavailable".into())).await;

        assert_eq!(meta(&message, META_KIND), Some("Namespace"));
        assert_eq!(meta(&message, META_NAME), Some("team-a"));
        assert_eq!(meta(&message, META_NAMESPACE), None);
        assert_eq!(meta(&message, META_DELETED), None);

        let payload: serde_json::Value = serde_json::from_slice(message.payload()).unwrap();
        assert_eq!(payload["metadata"]["name"], "team-a");
    }

    #[tokio::test(start_paused = true)]
    async fn close_ends_the_input() {
        let cluster = FakeCluster::new();
        cluster.add_kind("", "v1", "ConfigMap", true);
        let input = input(&cluster, vec![WatchSpec::new("", "v1", "ConfigMap").unwrap()]);
        input.connect().await.unwrap();

        input.close().await.unwrap();
        let ctx = CancellationToken::new();
        assert!(matches!(input.read(&ctx).await, Err(InputError::EndOfInput)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_read() {
        let cluster = FakeCluster::new();
        cluster.add_kind("", "v1", "ConfigMap", true);
        let input = input(&cluster, vec![WatchSpec::new("", "v1", "ConfigMap").unwrap()]);
        input.connect().await.unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(input.read(&ctx).await, Err(InputError::Cancelled)));
    }
}

//! Fan-in of all watchers into one ordered consumption point.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use futures::future;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::AllNamespaces,
    normalize::NormalizedEvent,
    spec::{NamespaceScope, WatchSpec},
    watcher::{
        client::{ClientError, ResourceClient},
        WatcherOptions,
    },
};

mod task;
use task::WatcherTask;

/// Options of a [`WatchAggregator`].
#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub channel_capacity: usize,
    pub shutdown_timeout: Duration,
    pub all_namespaces: AllNamespaces,
    /// Resolve every kind during [`WatchAggregator::start`] and fail if one is not served.
    pub strict_discovery: bool,
    pub watcher: WatcherOptions,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 128,
            shutdown_timeout: Duration::from_secs(5),
            all_namespaces: AllNamespaces::Cluster,
            strict_discovery: false,
            watcher: WatcherOptions::default(),
        }
    }
}

/// Owns one watcher per (spec, namespace) pair and delivers their events through [`next`](Self::next).
///
/// Every watcher sends into the same bounded channel, which is the only synchronization
/// between them. Events of one watcher keep the order of its watch; events of different
/// watchers interleave.
pub struct WatchAggregator {
    output: tokio::sync::Mutex<mpsc::Receiver<NormalizedEvent>>,
    /// Cancels every watcher.
    shutdown: CancellationToken,
    /// Set once the channel is closed for good.
    closed: CancellationToken,
    tasks: Mutex<Vec<WatcherTask>>,
    shutdown_timeout: Duration,
}

impl WatchAggregator {
    /// Launches watchers for every spec.
    ///
    /// Connection failures of individual watchers are not reported here; each watcher
    /// retries on its own.
    pub async fn start(
        client: Arc<dyn ResourceClient>,
        specs: Vec<WatchSpec>,
        options: AggregatorOptions,
    ) -> Result<Self, StartError> {
        if options.channel_capacity == 0 {
            return Err(StartError::ZeroCapacity);
        }
        if options.strict_discovery {
            for spec in &specs {
                client
                    .resolve(spec.gvk())
                    .await
                    .map_err(|source| StartError::Discovery {
                        spec: spec.to_string(),
                        source,
                    })?;
            }
        }
        if specs.is_empty() {
            log::warn!("no watches configured, the input will close immediately");
        }

        let (sender, receiver) = mpsc::channel(options.channel_capacity);
        let shutdown = CancellationToken::new();
        let watcher_options = Arc::new(options.watcher);

        let mut tasks = Vec::new();
        for spec in specs {
            let spec = Arc::new(spec);
            let namespaces = resolve_namespaces(client.as_ref(), &spec, options.all_namespaces).await;
            for (i, namespace) in namespaces.into_iter().enumerate() {
                tasks.push(WatcherTask::spawn(
                    client.clone(),
                    spec.clone(),
                    namespace,
                    i > 0,
                    watcher_options.clone(),
                    shutdown.clone(),
                    sender.clone(),
                ));
            }
        }
        log::info!("started {} watchers", tasks.len());

        Ok(Self {
            output: tokio::sync::Mutex::new(receiver),
            shutdown,
            closed: CancellationToken::new(),
            tasks: Mutex::new(tasks),
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    /// Labels of the running watchers.
    pub fn watchers(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .map(|task| task.label().to_owned())
            .collect()
    }

    /// Waits for the next event.
    ///
    /// Returns [`NextError::Closed`] once every watcher has stopped (or [`stop`](Self::stop)
    /// has finished) and all buffered events were returned. Only one caller is expected
    /// at a time.
    pub async fn next(&self, ctx: &CancellationToken) -> Result<NormalizedEvent, NextError> {
        let mut output = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(NextError::Cancelled),
            output = self.output.lock() => output,
        };
        if self.closed.is_cancelled() {
            output.close();
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(NextError::Cancelled),
            event = output.recv() => event.ok_or(NextError::Closed),
            _ = self.closed.cancelled() => {
                output.close();
                output.recv().await.ok_or(NextError::Closed)
            }
        }
    }

    /// Cancels all watchers, waits for them up to the shutdown timeout and closes the channel.
    ///
    /// Watchers still running after the timeout are abandoned.
    pub async fn stop(&self) -> Result<(), StopError> {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();

        let joined = tokio::time::timeout(
            self.shutdown_timeout,
            future::join_all(tasks.into_iter().map(WatcherTask::join)),
        )
        .await;
        self.closed.cancel();

        match joined {
            Ok(_) => {
                log::info!("stopped {count} watchers");
                Ok(())
            }
            Err(_) => {
                log::warn!(
                    "watchers did not stop within {:?}, abandoning them",
                    self.shutdown_timeout
                );
                Err(StopError::Timeout(self.shutdown_timeout))
            }
        }
    }
}

impl Drop for WatchAggregator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Expands the namespace scope of `spec` into one entry per watcher.
///
/// A cluster-scoped resource gets a single cluster-wide entry. If its scope cannot be
/// resolved yet, the watchers after the first one exit on their own once it is.
async fn resolve_namespaces(
    client: &dyn ResourceClient,
    spec: &WatchSpec,
    mode: AllNamespaces,
) -> Vec<Option<String>> {
    let namespaces: Vec<_> = match (spec.namespaces(), mode) {
        (NamespaceScope::Only(namespaces), _) => namespaces.iter().cloned().map(Some).collect(),
        (NamespaceScope::All, AllNamespaces::Cluster) => return vec![None],
        (NamespaceScope::All, AllNamespaces::PerNamespace) => match client.namespaces().await {
            Ok(namespaces) => {
                let namespaces: BTreeSet<String> = namespaces.into_iter().collect();
                log::debug!("{spec}: watching {} namespaces", namespaces.len());
                namespaces.into_iter().map(Some).collect()
            }
            Err(err) => {
                log::warn!("{spec}: cannot list namespaces ({err}), falling back to a cluster-wide watch");
                return vec![None];
            }
        },
    };
    if namespaces.len() < 2 {
        return namespaces;
    }

    match client.resolve(spec.gvk()).await {
        Ok(resolved) if !resolved.namespaced => {
            log::info!("{spec}: resource is cluster-scoped, using one cluster-wide watch");
            vec![None]
        }
        Ok(_) => namespaces,
        Err(err) => {
            log::debug!("{spec}: cannot resolve scope yet ({err})");
            namespaces
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("channel capacity must be at least 1")]
    ZeroCapacity,
    #[error("{spec} is not served by the apiserver: {source}")]
    Discovery {
        spec: String,
        #[source]
        source: ClientError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NextError {
    #[error("cancelled")]
    Cancelled,
    #[error("all watchers have stopped")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StopError {
    #[error("watchers did not stop within {0:?}")]
    Timeout(Duration),
}

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    normalize::NormalizedEvent,
    spec::WatchSpec,
    watcher::{client::ResourceClient, watch_label, ResourceWatcher, SharedKnownObjects, WatcherOptions},
};

/// A supervised watcher running on its own task.
pub(crate) struct WatcherTask {
    label: String,
    join_handle: JoinHandle<()>,
}

impl WatcherTask {
    /// Spawns the watcher for `spec` in `namespace`.
    ///
    /// With `defer_cluster_scope` the watcher exits once the resource resolves as
    /// cluster-scoped, leaving the cluster-wide watch to the first namespace of the spec.
    pub(crate) fn spawn(
        client: Arc<dyn ResourceClient>,
        spec: Arc<WatchSpec>,
        namespace: Option<String>,
        defer_cluster_scope: bool,
        options: Arc<WatcherOptions>,
        token: CancellationToken,
        output: mpsc::Sender<NormalizedEvent>,
    ) -> Self {
        let label = watch_label(&spec, namespace.as_deref());
        let join_handle = tokio::spawn({
            let label = label.clone();
            let known = SharedKnownObjects::default();
            async move {
                loop {
                    let mut watcher =
                        ResourceWatcher::new(client.clone(), spec.clone(), namespace.clone(), options.clone())
                            .with_known_objects(known.clone());
                    if defer_cluster_scope {
                        watcher = watcher.defer_cluster_scope();
                    }
                    let run = tokio::spawn(watcher.run(token.clone(), output.clone()));

                    match run.await {
                        Ok(()) => return,
                        Err(err) if err.is_panic() && !token.is_cancelled() => {
                            log::error!(
                                "watcher for {label} panicked, restarting in {:?}",
                                options.retry_interval
                            );
                        }
                        Err(_) => return,
                    }

                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(options.retry_interval) => {}
                    }
                }
            }
        });

        Self { label, join_handle }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the task to exit. The shutdown token must already be cancelled.
    pub(crate) async fn join(self) {
        if let Err(err) = self.join_handle.await {
            log::error!("watcher task for {} failed: {err}", self.label);
        }
    }
}

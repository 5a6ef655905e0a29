//! The list+watch loop for one (spec, namespace) pair.

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use ::backoff::{backoff::Backoff, ExponentialBackoff};
use futures::StreamExt;
use kube_core::{DynamicObject, Resource};
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    normalize::{normalize, EventType, NormalizedEvent, RawEvent},
    spec::WatchSpec,
};

pub mod backoff;
pub mod client;
pub mod state;

use self::backoff::BackoffPolicy;
use client::{ClientError, Query, ResourceClient, WatchItem, WatchStream, WatchTarget};
use state::{Status, WatcherState};

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    /// Returns `None` for objects without a name.
    pub fn from_resource<K: Resource>(resource: &K) -> Option<Self> {
        Some(Self {
            namespace: resource.meta().namespace.clone(),
            name: resource.meta().name.clone()?,
        })
    }
}

/// The objects a watcher has last seen.
///
/// Owned by the supervising task so that a restarted watcher still reports objects
/// deleted while its predecessor was down.
#[derive(Debug, Default)]
pub struct KnownObjects {
    objects: BTreeMap<QualifiedName, DynamicObject>,
    listed: bool,
}

pub type SharedKnownObjects = Arc<Mutex<KnownObjects>>;

/// Tuning shared by every watcher.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Emit the objects returned by the very first list. Later lists always emit.
    pub emit_initial: bool,
    pub watch_timeout_secs: u32,
    pub list_page_size: Option<u32>,
    pub resync_interval: Option<Duration>,
    /// Delay before retrying after authorization or not-found errors.
    pub retry_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            emit_initial: true,
            watch_timeout_secs: 290,
            list_page_size: None,
            resync_interval: None,
            retry_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// How an API error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The resource version is too old; re-list from scratch.
    Gone,
    /// 401 or 403.
    Denied,
    /// 404 or the kind is not served (yet).
    NotFound,
    /// A single object could not be decoded.
    Malformed,
    Transient,
}

impl Failure {
    pub fn classify(err: &ClientError) -> Self {
        match err {
            ClientError::Api { code: 410, .. } => Self::Gone,
            ClientError::Api { code: 401 | 403, .. } => Self::Denied,
            ClientError::Api { code: 404, .. } | ClientError::NotServed(_) => Self::NotFound,
            ClientError::Decode(_) => Self::Malformed,
            ClientError::Api { .. } | ClientError::Transport(_) => Self::Transient,
        }
    }
}

/// Why a watcher loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    OutputClosed,
    /// The resource is cluster-scoped and another watcher of the same spec covers it.
    Redundant,
}

/// Keeps one logical watch alive and forwards every change as a [`NormalizedEvent`].
pub struct ResourceWatcher {
    client: Arc<dyn ResourceClient>,
    spec: Arc<WatchSpec>,
    options: Arc<WatcherOptions>,
    label: String,
    query: Query,
    state: WatcherState,
    target: Option<WatchTarget>,
    known: SharedKnownObjects,
    backoff: ExponentialBackoff,
    delay: Duration,
    /// Exit instead of watching if the resource turns out to be cluster-scoped.
    defer_cluster_scope: bool,
    next_resync: Option<Instant>,
}

impl ResourceWatcher {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        spec: Arc<WatchSpec>,
        namespace: Option<String>,
        options: Arc<WatcherOptions>,
    ) -> Self {
        let label = watch_label(&spec, namespace.as_deref());
        let query = Query {
            label_selector: spec.label_selector().map(ToString::to_string),
            field_selector: spec.field_selector().map(ToString::to_string),
        };
        Self {
            client,
            backoff: options.backoff.start(),
            options,
            spec,
            label,
            query,
            state: WatcherState::new(namespace),
            target: None,
            known: SharedKnownObjects::default(),
            delay: Duration::ZERO,
            defer_cluster_scope: false,
            next_resync: None,
        }
    }

    /// Continues from the objects seen by a previous watcher of the same pair.
    pub fn with_known_objects(mut self, known: SharedKnownObjects) -> Self {
        self.known = known;
        self
    }

    /// Marks this watcher as one of several namespaces of a spec that is not responsible
    /// for a cluster-wide watch. It stops once the resource resolves as cluster-scoped.
    pub fn defer_cluster_scope(mut self) -> Self {
        self.defer_cluster_scope = true;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Runs until `token` is cancelled or the receiving side of `output` is dropped.
    ///
    /// The watcher never closes `output` itself; it only drops its sender.
    pub async fn run(mut self, token: CancellationToken, output: mpsc::Sender<NormalizedEvent>) {
        log::info!("watching {}", self.label);

        let reason = loop {
            let step = match self.state.status() {
                Status::Initializing => self.initialize(&token).await,
                Status::Listing => self.list(&token, &output).await,
                Status::Watching => self.watch(&token, &output).await,
                Status::Reconnecting => self.reconnect(&token).await,
                Status::Closed => break Interrupt::Cancelled,
            };
            match step {
                Ok(next) => {
                    let prev = self.state.transition(next);
                    log::debug!("{}: {prev:?} -> {next:?}", self.label);
                }
                Err(reason) => break reason,
            }
        };

        self.state.transition(Status::Closed);
        match reason {
            Interrupt::Cancelled => log::info!("stopped watching {}", self.label),
            Interrupt::OutputClosed => log::info!("stopped watching {}: output closed", self.label),
            Interrupt::Redundant => log::info!(
                "stopped watching {}: resource is cluster-scoped and already watched",
                self.label
            ),
        }
    }

    async fn initialize(&mut self, token: &CancellationToken) -> Result<Status, Interrupt> {
        let resolving = self.client.resolve(self.spec.gvk());
        let resolved = match cancellable(token, resolving).await? {
            Ok(resolved) => resolved,
            Err(err) => return Ok(self.fail(err)),
        };

        let namespace = if resolved.namespaced {
            self.state.namespace().map(str::to_owned)
        } else {
            if let Some(ns) = self.state.namespace() {
                if self.defer_cluster_scope {
                    return Err(Interrupt::Redundant);
                }
                log::warn!(
                    "{}: resource is cluster-scoped, ignoring namespace {ns}",
                    self.label
                );
            }
            None
        };
        self.target = Some(WatchTarget {
            resource: resolved.resource,
            namespace,
        });
        Ok(Status::Listing)
    }

    async fn list(
        &mut self,
        token: &CancellationToken,
        output: &mpsc::Sender<NormalizedEvent>,
    ) -> Result<Status, Interrupt> {
        let Some(target) = self.target.clone() else {
            return Ok(Status::Reconnecting);
        };

        let listed = self
            .client
            .list(&target, &self.query, self.options.list_page_size);
        let page = match cancellable(token, listed).await? {
            Ok(page) => page,
            Err(err) => return Ok(self.fail(err)),
        };
        self.backoff.reset();
        self.state.observe_version(page.resource_version.as_deref());

        let mut current = BTreeMap::new();
        for object in page.items {
            match QualifiedName::from_resource(&object) {
                Some(key) => {
                    current.insert(key, object);
                }
                None => log::warn!("{}: skipping listed object without a name", self.label),
            }
        }
        log::debug!(
            "{}: listed {} objects at resource version {:?}",
            self.label,
            current.len(),
            self.state.resource_version(),
        );

        let events = {
            let mut known = self.known.lock();
            let previous = std::mem::replace(&mut known.objects, current);
            let mut events: Vec<_> = previous
                .into_iter()
                .filter(|(key, _)| !known.objects.contains_key(key))
                .map(|(_, object)| normalize(&self.spec, EventType::DeletedFinalStateUnknown, &object))
                .collect();
            if known.listed || self.options.emit_initial {
                events.extend(
                    known
                        .objects
                        .values()
                        .map(|object| normalize(&self.spec, EventType::Added, object)),
                );
            }
            known.listed = true;
            events
        };
        for event in events {
            send(token, output, event).await?;
        }

        if self.next_resync.is_none() {
            self.next_resync = self.options.resync_interval.map(|every| Instant::now() + every);
        }
        Ok(Status::Watching)
    }

    async fn watch(
        &mut self,
        token: &CancellationToken,
        output: &mpsc::Sender<NormalizedEvent>,
    ) -> Result<Status, Interrupt> {
        let Some(target) = self.target.clone() else {
            return Ok(Status::Reconnecting);
        };

        // An empty list response carries no version; "0" then means "any".
        let version = self.state.resource_version().unwrap_or("0").to_owned();
        let opened = self.client.watch(
            &target,
            &self.query,
            self.options.watch_timeout_secs,
            &version,
        );
        let mut stream: WatchStream = match cancellable(token, opened).await? {
            Ok(stream) => stream,
            Err(err) => return Ok(self.fail(err)),
        };
        log::debug!("{}: watch opened at resource version {version}", self.label);

        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Interrupt::Cancelled),
                _ = resync_due(self.next_resync) => None,
                item = stream.next() => Some(item),
            };

            let item = match item {
                None => {
                    self.resync(token, output).await?;
                    continue;
                }
                Some(None) => {
                    log::debug!("{}: watch closed by the server", self.label);
                    self.delay = Duration::ZERO;
                    return Ok(Status::Reconnecting);
                }
                Some(Some(item)) => item,
            };

            match item {
                Ok(WatchItem::Event(event)) => {
                    self.backoff.reset();
                    self.state
                        .observe_version(event.object.meta().resource_version.as_deref());
                    self.record(&event);
                    let normalized = normalize(&self.spec, event.event_type, &event.object);
                    send(token, output, normalized).await?;
                }
                Ok(WatchItem::Bookmark(version)) => self.state.observe_version(Some(&version)),
                Ok(WatchItem::Error(err)) | Err(err) => {
                    if Failure::classify(&err) == Failure::Malformed {
                        log::warn!("{}: skipping undecodable object: {err}", self.label);
                        continue;
                    }
                    return Ok(self.fail(err));
                }
            }
        }
    }

    async fn reconnect(&mut self, token: &CancellationToken) -> Result<Status, Interrupt> {
        let delay = std::mem::take(&mut self.delay);
        if !delay.is_zero() {
            cancellable(token, tokio::time::sleep(delay)).await?;
        }

        Ok(if self.target.is_none() {
            Status::Initializing
        } else if self.state.resource_version().is_none() {
            Status::Listing
        } else {
            Status::Watching
        })
    }

    /// Re-delivers every known object.
    async fn resync(
        &mut self,
        token: &CancellationToken,
        output: &mpsc::Sender<NormalizedEvent>,
    ) -> Result<(), Interrupt> {
        let events: Vec<_> = {
            let known = self.known.lock();
            log::debug!("{}: resyncing {} objects", self.label, known.objects.len());
            known
                .objects
                .values()
                .map(|object| normalize(&self.spec, EventType::Resynced, object))
                .collect()
        };
        for event in events {
            send(token, output, event).await?;
        }
        self.next_resync = self.options.resync_interval.map(|every| Instant::now() + every);
        Ok(())
    }

    fn record(&mut self, event: &RawEvent) {
        let Some(key) = QualifiedName::from_resource(&event.object) else {
            return;
        };
        let mut known = self.known.lock();
        if event.event_type.is_delete() {
            known.objects.remove(&key);
        } else {
            known.objects.insert(key, event.object.clone());
        }
    }

    /// Decides how long to wait after `err` and what state to drop.
    fn fail(&mut self, err: ClientError) -> Status {
        self.delay = match Failure::classify(&err) {
            Failure::Gone => {
                log::info!(
                    "{}: resource version {:?} expired, re-listing",
                    self.label,
                    self.state.resource_version(),
                );
                self.state.invalidate();
                Duration::ZERO
            }
            Failure::Denied => {
                log::error!(
                    "{}: access denied ({err}), retrying in {:?}",
                    self.label,
                    self.options.retry_interval,
                );
                self.options.retry_interval
            }
            Failure::NotFound => {
                log::warn!(
                    "{}: resource not found ({err}), retrying in {:?}",
                    self.label,
                    self.options.retry_interval,
                );
                self.target = None;
                self.state.invalidate();
                self.options.retry_interval
            }
            Failure::Malformed | Failure::Transient => {
                let delay = self
                    .backoff
                    .next_backoff()
                    .unwrap_or(self.options.backoff.max);
                log::warn!("{}: {err}, retrying in {delay:?}", self.label);
                delay
            }
        };
        Status::Reconnecting
    }
}

pub(crate) fn watch_label(spec: &WatchSpec, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{spec} in {ns}"),
        None => format!("{spec} in all namespaces"),
    }
}

async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Interrupt::Cancelled),
        out = fut => Ok(out),
    }
}

async fn send(
    token: &CancellationToken,
    output: &mpsc::Sender<NormalizedEvent>,
    event: NormalizedEvent,
) -> Result<(), Interrupt> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Interrupt::Cancelled),
        sent = output.send(event) => sent.map_err(|_| Interrupt::OutputClosed),
    }
}

async fn resync_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

//! The apiserver operations a watcher depends on.

use std::future::Future;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::{api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::ListMeta};
use kube_client::{
    api::{Api, ListParams, WatchParams},
    discovery::{self, Scope},
    Client,
};
use kube_core::{watch::WatchEvent, ApiResource, DynamicObject, ErrorResponse, GroupVersionKind};

use crate::normalize::{EventType, RawEvent};

/// An API resource resolved through discovery.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// The collection a watcher lists and watches.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub resource: ApiResource,
    /// `None` watches across all namespaces (or a cluster-scoped resource).
    pub namespace: Option<String>,
}

/// Rendered selectors sent with every list and watch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// All objects of a list call, with the resource version the list was served at.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub resource_version: Option<String>,
    pub items: Vec<DynamicObject>,
}

/// One item of a watch stream.
#[derive(Debug)]
pub enum WatchItem {
    Event(RawEvent),
    Bookmark(String),
    /// An `ERROR` event sent inside the stream, e.g. 410 Gone.
    Error(ClientError),
}

pub type WatchStream = BoxStream<'static, Result<WatchItem, ClientError>>;

/// Access to the apiserver for list/watch loops.
///
/// Implementations are shared by every watcher and must be safe for concurrent use.
#[async_trait]
pub trait ResourceClient: Send + Sync + 'static {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedResource, ClientError>;

    async fn list(
        &self,
        target: &WatchTarget,
        query: &Query,
        page_size: Option<u32>,
    ) -> Result<ListPage, ClientError>;

    async fn watch(
        &self,
        target: &WatchTarget,
        query: &Query,
        timeout_secs: u32,
        version: &str,
    ) -> Result<WatchStream, ClientError>;

    /// Names of all namespaces in the cluster.
    async fn namespaces(&self) -> Result<Vec<String>, ClientError>;
}

/// [`ResourceClient`] backed by an authenticated [`kube_client::Client`].
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, target: &WatchTarget) -> Api<DynamicObject> {
        match &target.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &target.resource),
            None => Api::all_with(self.client.clone(), &target.resource),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeClient {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedResource, ClientError> {
        let (resource, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        Ok(ResolvedResource {
            resource,
            namespaced: matches!(caps.scope, Scope::Namespaced),
        })
    }

    async fn list(
        &self,
        target: &WatchTarget,
        query: &Query,
        page_size: Option<u32>,
    ) -> Result<ListPage, ClientError> {
        let api = self.api(target);
        let params = ListParams {
            label_selector: query.label_selector.clone(),
            field_selector: query.field_selector.clone(),
            limit: page_size,
            ..ListParams::default()
        };

        collect_pages(|continue_token| {
            let api = api.clone();
            let params = ListParams {
                continue_token,
                ..params.clone()
            };
            async move {
                let list = api.list(&params).await?;
                Ok::<_, ClientError>((list.metadata, list.items))
            }
        })
        .await
    }

    async fn watch(
        &self,
        target: &WatchTarget,
        query: &Query,
        timeout_secs: u32,
        version: &str,
    ) -> Result<WatchStream, ClientError> {
        let params = WatchParams {
            label_selector: query.label_selector.clone(),
            field_selector: query.field_selector.clone(),
            timeout: Some(timeout_secs),
            ..WatchParams::default()
        };

        let stream = self.api(target).watch(&params, version).await?;
        Ok(stream
            .map(|item| match item {
                Ok(WatchEvent::Added(object)) => Ok(WatchItem::Event(RawEvent::new(EventType::Added, object))),
                Ok(WatchEvent::Modified(object)) => {
                    Ok(WatchItem::Event(RawEvent::new(EventType::Modified, object)))
                }
                Ok(WatchEvent::Deleted(object)) => {
                    Ok(WatchItem::Event(RawEvent::new(EventType::Deleted, object)))
                }
                Ok(WatchEvent::Bookmark(bookmark)) => Ok(WatchItem::Bookmark(bookmark.metadata.resource_version)),
                Ok(WatchEvent::Error(status)) => Ok(WatchItem::Error(status.into())),
                Err(err) => Err(err.into()),
            })
            .boxed())
    }

    async fn namespaces(&self) -> Result<Vec<String>, ClientError> {
        let list = Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }
}

/// Follows continue tokens until the last page and concatenates the items.
///
/// The resource version of the last page is the one to watch from.
async fn collect_pages<F, Fut>(mut fetch: F) -> Result<ListPage, ClientError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(ListMeta, Vec<DynamicObject>), ClientError>>,
{
    let mut items = Vec::new();
    let mut continue_token = None;
    loop {
        let (metadata, page) = fetch(continue_token.take()).await?;
        items.extend(page);
        match metadata.continue_ {
            Some(token) if !token.is_empty() => continue_token = Some(token),
            _ => {
                return Ok(ListPage {
                    resource_version: metadata.resource_version,
                    items,
                })
            }
        }
    }
}

/// Errors returned by a [`ResourceClient`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("apiserver responded {code} {reason}: {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },
    #[error("resource is not served: {0}")]
    NotServed(String),
    #[error("cannot decode object: {0}")]
    Decode(String),
    #[error("request failed: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn api(code: u16, reason: &str) -> Self {
        Self::Api {
            code,
            reason: reason.to_owned(),
            message: String::new(),
        }
    }
}

impl From<ErrorResponse> for ClientError {
    fn from(status: ErrorResponse) -> Self {
        Self::Api {
            code: status.code,
            reason: status.reason,
            message: status.message,
        }
    }
}

impl From<kube_client::Error> for ClientError {
    fn from(err: kube_client::Error) -> Self {
        match err {
            kube_client::Error::Api(status) => status.into(),
            kube_client::Error::SerdeError(err) => Self::Decode(err.to_string()),
            kube_client::Error::Discovery(err) => Self::NotServed(err.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::tests::namespaced;

    fn page(names: &[&str], version: &str, next: Option<&str>) -> (ListMeta, Vec<DynamicObject>) {
        let metadata = ListMeta {
            continue_: next.map(str::to_owned),
            resource_version: Some(version.to_owned()),
            ..ListMeta::default()
        };
        let items = names.iter().map(|name| namespaced("Pod", "default", name)).collect();
        (metadata, items)
    }

    #[tokio::test]
    async fn pages_are_concatenated() {
        let pages = Mutex::new(VecDeque::from([
            page(&["a", "b"], "10", Some("page-2")),
            page(&["c"], "11", Some("page-3")),
            page(&["d"], "12", Some("")),
        ]));
        let tokens = Mutex::new(Vec::new());

        let list = collect_pages(|token| {
            tokens.lock().push(token);
            let next = pages.lock().pop_front().expect("no more pages");
            async move { Ok(next) }
        })
        .await
        .unwrap();

        let names: Vec<_> = list.items.iter().filter_map(|item| item.metadata.name.clone()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
        assert_eq!(list.resource_version.as_deref(), Some("12"));
        assert_eq!(
            *tokens.lock(),
            [None, Some("page-2".to_owned()), Some("page-3".to_owned())]
        );
        assert!(pages.lock().is_empty());
    }

    #[tokio::test]
    async fn failing_page_fails_the_list() {
        let mut calls = 0;
        let list = collect_pages(|_| {
            calls += 1;
            let result = match calls {
                1 => Ok(page(&["a"], "10", Some("page-2"))),
                _ => Err(ClientError::api(410, "Expired")),
            };
            async move { result }
        })
        .await;

        assert!(matches!(list, Err(ClientError::Api { code: 410, .. })));
        assert_eq!(calls, 2);
    }
}

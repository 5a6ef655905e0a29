//! Conversion of raw watch events into messages.

use std::collections::BTreeMap;

use kube_core::{DynamicObject, Resource};

use crate::spec::WatchSpec;

pub const META_DELETED: &str = "deleted";
pub const META_GROUP: &str = "group";
pub const META_VERSION: &str = "version";
pub const META_KIND: &str = "kind";
pub const META_NAME: &str = "name";
pub const META_NAMESPACE: &str = "namespace";

/// Why an object was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    /// The object vanished while the watch was disconnected; only its last known state is available.
    DeletedFinalStateUnknown,
    /// Periodic re-delivery of an object that has not necessarily changed.
    Resynced,
}

impl EventType {
    pub fn is_delete(self) -> bool {
        matches!(self, Self::Deleted | Self::DeletedFinalStateUnknown)
    }
}

/// An object together with the kind of change that produced it.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub event_type: EventType,
    pub object: DynamicObject,
}

impl RawEvent {
    pub fn new(event_type: EventType, object: DynamicObject) -> Self {
        Self { event_type, object }
    }
}

/// Identity attached to every delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Absent for cluster-scoped objects.
    pub namespace: Option<String>,
    pub name: String,
    pub deleted: bool,
}

impl EventMeta {
    /// Flattens the metadata into message metadata keys.
    ///
    /// `deleted` is only present for deletions and `namespace` only for namespaced objects.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::from([
            (META_GROUP.to_owned(), self.group.clone()),
            (META_VERSION.to_owned(), self.version.clone()),
            (META_KIND.to_owned(), self.kind.clone()),
            (META_NAME.to_owned(), self.name.clone()),
        ]);
        if let Some(namespace) = &self.namespace {
            map.insert(META_NAMESPACE.to_owned(), namespace.clone());
        }
        if self.deleted {
            map.insert(META_DELETED.to_owned(), "true".to_owned());
        }
        map
    }
}

/// A single unit of output: the serialized object and its metadata.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub payload: Vec<u8>,
    pub meta: EventMeta,
}

/// Builds the output event for `object`.
///
/// The payload is the JSON encoding of the object. If encoding fails the payload is left
/// empty and the metadata is still filled in, so the event remains visible downstream.
pub fn normalize(spec: &WatchSpec, event_type: EventType, object: &DynamicObject) -> NormalizedEvent {
    let gvk = spec.gvk();
    let meta = EventMeta {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        kind: gvk.kind.clone(),
        namespace: object.meta().namespace.clone(),
        name: object.meta().name.clone().unwrap_or_default(),
        deleted: event_type.is_delete(),
    };

    let payload = match serde_json::to_vec(object) {
        Ok(payload) => payload,
        Err(err) => {
            log::warn!(
                "cannot serialize {spec} {}/{}: {err}; delivering with an empty payload",
                meta.namespace.as_deref().unwrap_or("-"),
                meta.name,
            );
            Vec::new()
        }
    };

    NormalizedEvent { payload, meta }
}

#[cfg(test)]
mod tests {
    use kube_core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    use super::*;

    fn pod(namespace: &str, name: &str) -> DynamicObject {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Pod"));
        DynamicObject::new(name, &resource)
            .within(namespace)
            .data(json!({ "spec": { "nodeName": "node-1" } }))
    }

    #[test]
    fn deleted_flag_follows_event_type() {
        let spec = WatchSpec::new("", "v1", "Pod").unwrap();
        let object = pod("default", "foo");

        for (event_type, deleted) in [
            (EventType::Added, false),
            (EventType::Modified, false),
            (EventType::Resynced, false),
            (EventType::Deleted, true),
            (EventType::DeletedFinalStateUnknown, true),
        ] {
            let event = normalize(&spec, event_type, &object);
            assert_eq!(event.meta.deleted, deleted, "{event_type:?}");
            assert_eq!(
                event.meta.to_map().contains_key(META_DELETED),
                deleted,
                "{event_type:?}"
            );
        }
    }

    #[test]
    fn identity_comes_from_object() {
        let spec = WatchSpec::new("", "v1", "Pod")
            .unwrap()
            .in_namespaces(["watched"])
            .unwrap();
        let event = normalize(&spec, EventType::Added, &pod("actual", "foo"));

        assert_eq!(event.meta.namespace.as_deref(), Some("actual"));
        assert_eq!(event.meta.name, "foo");

        let map = event.meta.to_map();
        assert_eq!(map[META_GROUP], "");
        assert_eq!(map[META_VERSION], "v1");
        assert_eq!(map[META_KIND], "Pod");
        assert_eq!(map[META_NAMESPACE], "actual");
    }

    #[test]
    fn cluster_scoped_objects_have_no_namespace() {
        let spec = WatchSpec::new("rbac.authorization.k8s.io", "v1", "ClusterRole").unwrap();
        let resource = ApiResource::from_gvk(spec.gvk());
        let object = DynamicObject::new("admin", &resource).data(json!({ "rules": [] }));

        let event = normalize(&spec, EventType::Modified, &object);
        assert_eq!(event.meta.namespace, None);
        assert!(!event.meta.to_map().contains_key(META_NAMESPACE));
        assert_eq!(event.meta.group, "rbac.authorization.k8s.io");
    }

    #[test]
    fn payload_is_the_object_json() {
        let spec = WatchSpec::new("", "v1", "Pod").unwrap();
        let event = normalize(&spec, EventType::Added, &pod("default", "foo"));

        let payload: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(payload["apiVersion"], "v1");
        assert_eq!(payload["kind"], "Pod");
        assert_eq!(payload["metadata"]["name"], "foo");
        assert_eq!(payload["spec"]["nodeName"], "node-1");
    }
}

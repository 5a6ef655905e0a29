//! Declared watch intents.

use std::{collections::BTreeSet, fmt};

use kube_core::GroupVersionKind;

use crate::config::{
    selector::{FieldSelector, LabelSelector, SelectorError},
    WatchConfig,
};

/// One resource type to watch, with its namespace scope and selectors.
///
/// Specs are validated on construction and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    gvk: GroupVersionKind,
    namespaces: NamespaceScope,
    label_selector: Option<LabelSelector>,
    field_selector: Option<FieldSelector>,
}

/// The namespaces a spec covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    All,
    Only(BTreeSet<String>),
}

impl WatchSpec {
    pub fn new(group: &str, version: &str, kind: &str) -> Result<Self, SpecError> {
        if version.is_empty() {
            return Err(SpecError::MissingVersion {
                kind: kind.to_owned(),
            });
        }
        if kind.is_empty() {
            return Err(SpecError::MissingKind {
                version: version.to_owned(),
            });
        }
        if group.contains('/') || version.contains('/') || kind.contains('/') {
            return Err(SpecError::MalformedGvk(format!("{group}/{version}/{kind}")));
        }

        Ok(Self {
            gvk: GroupVersionKind::gvk(group, version, kind),
            namespaces: NamespaceScope::All,
            label_selector: None,
            field_selector: None,
        })
    }

    /// Restricts the watch to the given namespaces; an empty set means all namespaces.
    pub fn in_namespaces<I, S>(mut self, namespaces: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = namespaces.into_iter().map(Into::into).collect();
        if set.iter().any(String::is_empty) {
            return Err(SpecError::EmptyNamespace(self.to_string()));
        }
        self.namespaces = if set.is_empty() {
            NamespaceScope::All
        } else {
            NamespaceScope::Only(set)
        };
        Ok(self)
    }

    pub fn with_label_selector(mut self, selector: LabelSelector) -> Self {
        self.label_selector = Some(selector).filter(|s| !s.is_empty());
        self
    }

    pub fn with_field_selector(mut self, selector: FieldSelector) -> Self {
        self.field_selector = Some(selector);
        self
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub fn namespaces(&self) -> &NamespaceScope {
        &self.namespaces
    }

    pub fn label_selector(&self) -> Option<&LabelSelector> {
        self.label_selector.as_ref()
    }

    pub fn field_selector(&self) -> Option<&FieldSelector> {
        self.field_selector.as_ref()
    }
}

impl fmt::Display for WatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let GroupVersionKind {
            group,
            version,
            kind,
        } = &self.gvk;
        if group.is_empty() {
            write!(f, "{version}/{kind}")
        } else {
            write!(f, "{group}/{version}/{kind}")
        }
    }
}

impl TryFrom<&WatchConfig> for WatchSpec {
    type Error = SpecError;

    fn try_from(config: &WatchConfig) -> Result<Self, Self::Error> {
        let mut spec = WatchSpec::new(&config.group, &config.version, &config.kind)?
            .in_namespaces(config.namespaces.iter().cloned())?;

        if let Some(selector) = &config.selector {
            let selector = LabelSelector::try_from(selector).map_err(|source| SpecError::Selector {
                spec: spec.to_string(),
                source,
            })?;
            spec = spec.with_label_selector(selector);
        }
        if let Some(selector) = &config.field_selector {
            let selector = selector.parse().map_err(|source| SpecError::Selector {
                spec: spec.to_string(),
                source,
            })?;
            spec = spec.with_field_selector(selector);
        }
        Ok(spec)
    }
}

/// A watch declaration that cannot be turned into a [`WatchSpec`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpecError {
    #[error("watch on kind {kind:?} has no version")]
    MissingVersion { kind: String },
    #[error("watch on version {version:?} has no kind")]
    MissingKind { version: String },
    #[error("malformed group/version/kind {0:?}")]
    MalformedGvk(String),
    #[error("watch on {0} lists an empty namespace")]
    EmptyNamespace(String),
    #[error("invalid selector on {spec}: {source}")]
    Selector {
        spec: String,
        #[source]
        source: SelectorError,
    },
}

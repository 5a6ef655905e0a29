use std::{collections::HashMap, sync::Arc};

use serde_yaml::Value;

use super::Input;
use crate::{spec::SpecError, watcher::client::ResourceClient};

/// Shared collaborators available to input constructors.
#[derive(Clone)]
pub struct Resources {
    pub client: Arc<dyn ResourceClient>,
}

/// Builds an input from its configuration section.
pub type InputCtor = fn(&Value, &Resources) -> Result<Box<dyn Input>, BuildError>;

/// Input constructors keyed by type name.
#[derive(Default)]
pub struct InputRegistry {
    ctors: HashMap<&'static str, InputCtor>,
}

impl InputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `ctor` under `name`, returning the constructor it replaces.
    pub fn register(&mut self, name: &'static str, ctor: InputCtor) -> Option<InputCtor> {
        self.ctors.insert(name, ctor)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.ctors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Builds the input described by `config`, a mapping with a single key naming the input type.
    pub fn build(&self, config: &Value, resources: &Resources) -> Result<Box<dyn Input>, BuildError> {
        let mapping = config
            .as_mapping()
            .filter(|mapping| mapping.len() == 1)
            .ok_or(BuildError::Shape)?;
        let Some((name, section)) = mapping.iter().next() else {
            return Err(BuildError::Shape);
        };
        let name = name.as_str().ok_or(BuildError::Shape)?;

        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| BuildError::UnknownInput(name.to_owned()))?;
        ctor(section, resources)
    }
}

/// The registry with every input of this crate.
pub fn default_registry() -> InputRegistry {
    let mut registry = InputRegistry::new();
    registry.register(crate::input::NAME, crate::input::build);
    registry
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("input config must be a mapping with exactly one input type")]
    Shape,
    #[error("unknown input type {0:?}")]
    UnknownInput(String),
    #[error("invalid config for input {input}: {source}")]
    Config {
        input: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Spec(#[from] SpecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::FakeCluster;

    fn resources() -> Resources {
        Resources {
            client: FakeCluster::new(),
        }
    }

    #[test]
    fn builds_registered_inputs() {
        let registry = default_registry();
        assert_eq!(registry.names(), ["kubernetes_watch"]);

        let config: Value = serde_yaml::from_str(
            "kubernetes_watch:\n  watches:\n    - version: v1\n      kind: ConfigMap\n",
        )
        .unwrap();
        assert!(registry.build(&config, &resources()).is_ok());
    }

    #[test]
    fn rejects_unknown_and_malformed_configs() {
        let registry = default_registry();
        let build = |yaml: &str| {
            let config: Value = serde_yaml::from_str(yaml).unwrap();
            registry.build(&config, &resources()).err()
        };

        assert!(matches!(
            build("kafka:\n  topics: [a]\n"),
            Some(BuildError::UnknownInput(name)) if name == "kafka"
        ));
        assert!(matches!(build("- kubernetes_watch\n"), Some(BuildError::Shape)));
        assert!(matches!(
            build("kubernetes_watch: {watches: []}\nkafka: {}\n"),
            Some(BuildError::Shape)
        ));
        assert!(matches!(
            build("kubernetes_watch:\n  watches: []\n  bogus: 1\n"),
            Some(BuildError::Config { .. })
        ));
        assert!(matches!(
            build("kubernetes_watch:\n  watches:\n    - version: v1\n      kind: Pod\n      fieldSelector: nope\n"),
            Some(BuildError::Spec(_))
        ));
    }
}

// src/loader.rs

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::{component::Component, error::ValidationError};

pub type ComponentFactory = Arc<dyn Fn() -> Component + Send + Sync>;

/// Named component factories. Cheap to clone, shared between clones.
#[derive(Clone, Default)]
pub struct ComponentLoader {
    factories: Arc<DashMap<String, ComponentFactory>>,
}

impl std::fmt::Debug for ComponentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentLoader")
            .field("components", &self.list())
            .finish()
    }
}

impl ComponentLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Component + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            info!(component = %name, "replaced component factory");
        }
    }

    pub fn create(&self, name: &str) -> Result<Component, ValidationError> {
        let factory = self
            .factories
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ValidationError::UnknownComponent(name.to_string()))?;
        Ok(factory())
    }

    pub fn factory(&self, name: &str) -> Option<ComponentFactory> {
        self.factories.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.factories.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{InPort, OutPort};

    fn passthrough() -> Component {
        Component::from_fn(|ctx| {
            if let Some(value) = ctx.input.get_data("in")? {
                ctx.output.send("out", value)?;
            }
            Ok(())
        })
        .inport(InPort::new("in"))
        .outport(OutPort::new("out"))
    }

    #[test]
    fn registered_factories_build_fresh_instances() {
        let loader = ComponentLoader::new();
        loader.register("core/Passthrough", passthrough);
        loader.register("core/Drop", || Component::from_fn(|_ctx| Ok(())));

        assert!(loader.contains("core/Passthrough"));
        assert_eq!(loader.list(), vec!["core/Drop", "core/Passthrough"]);

        let component = loader.create("core/Passthrough").unwrap();
        assert!(component.inports().contains("in"));
        assert!(component.outports().contains("out"));
    }

    #[test]
    fn unknown_component_is_reported() {
        let loader = ComponentLoader::new();
        assert_eq!(
            loader.create("nope").unwrap_err(),
            ValidationError::UnknownComponent("nope".into())
        );
    }
}

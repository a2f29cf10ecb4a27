// src/graph.rs

use std::{collections::BTreeMap, fmt, fs, path::Path};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    component::Component,
    error::ValidationError,
    loader::{ComponentFactory, ComponentLoader},
    socket::Endpoint,
};

/// A port on a named node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PortRef {
    pub node: String,
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
            index: None,
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

impl From<&PortRef> for Endpoint {
    fn from(port: &PortRef) -> Self {
        Endpoint {
            node: port.node.clone(),
            port: port.port.clone(),
            index: port.index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Edge {
    pub source: PortRef,
    pub target: PortRef,
}

/// A value delivered to a port once, when the network starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Initial {
    pub target: PortRef,
    pub value: Value,
}

pub enum NodeSource {
    Instance(Component),
    Factory(ComponentFactory),
}

impl NodeSource {
    pub(crate) fn instantiate(self) -> Component {
        match self {
            NodeSource::Instance(component) => component,
            NodeSource::Factory(factory) => factory(),
        }
    }
}

impl fmt::Debug for NodeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSource::Instance(component) => f.debug_tuple("Instance").field(component).finish(),
            NodeSource::Factory(_) => f.write_str("Factory"),
        }
    }
}

/// Nodes, edges, initial packets and boundary ports of a network.
#[derive(Debug)]
pub struct Graph {
    pub name: String,
    pub nodes: Vec<(String, NodeSource)>,
    pub edges: Vec<Edge>,
    pub initials: Vec<Initial>,
    pub inports: BTreeMap<String, PortRef>,
    pub outports: BTreeMap<String, PortRef>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            initials: Vec::new(),
            inports: BTreeMap::new(),
            outports: BTreeMap::new(),
        }
    }

    pub fn node(mut self, name: impl Into<String>, component: Component) -> Self {
        self.nodes.push((name.into(), NodeSource::Instance(component)));
        self
    }

    pub fn factory<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Component + Send + Sync + 'static,
    {
        self.nodes.push((name.into(), NodeSource::Factory(std::sync::Arc::new(factory))));
        self
    }

    pub fn connect(self, from: &str, out: &str, to: &str, inport: &str) -> Self {
        self.edge(PortRef::new(from, out), PortRef::new(to, inport))
    }

    pub fn edge(mut self, source: PortRef, target: PortRef) -> Self {
        self.edges.push(Edge { source, target });
        self
    }

    pub fn initial(mut self, node: &str, port: &str, value: impl Into<Value>) -> Self {
        self.initials.push(Initial {
            target: PortRef::new(node, port),
            value: value.into(),
        });
        self
    }

    /// Expose `node.port` as the network inport `name`.
    pub fn inport(mut self, name: impl Into<String>, node: &str, port: &str) -> Self {
        self.inports.insert(name.into(), PortRef::new(node, port));
        self
    }

    pub fn outport(mut self, name: impl Into<String>, node: &str, port: &str) -> Self {
        self.outports.insert(name.into(), PortRef::new(node, port));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeDefinition {
    /// Name the component is registered under in the loader.
    pub component: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Serializable form of a [`Graph`], with components referenced by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: BTreeMap<String, NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub initials: Vec<Initial>,
    #[serde(default)]
    pub inports: BTreeMap<String, PortRef>,
    #[serde(default)]
    pub outports: BTreeMap<String, PortRef>,
}

impl GraphDefinition {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading graph {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing graph {}", path.display()))
    }

    /// Look every component up in `loader` and build the runnable graph.
    pub fn resolve(&self, loader: &ComponentLoader) -> Result<Graph, ValidationError> {
        let mut graph = Graph::new(self.name.clone());
        for (name, node) in &self.nodes {
            let factory = loader
                .factory(&node.component)
                .ok_or_else(|| ValidationError::UnknownComponent(node.component.clone()))?;
            graph.nodes.push((name.clone(), NodeSource::Factory(factory)));
        }
        graph.edges = self.edges.clone();
        graph.initials = self.initials.clone();
        graph.inports = self.inports.clone();
        graph.outports = self.outports.clone();
        Ok(graph)
    }
}

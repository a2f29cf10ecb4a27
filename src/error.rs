// src/error.rs

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::{ip::Scope, socket::SocketId};

/// Misuse of a port or socket, raised at the call that caused it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("port `{port}` is addressable, an index is required")]
    MissingIndex { port: String },
    #[error("port `{port}` has nothing attached at index {index}")]
    UnknownIndex { port: String, index: usize },
    #[error("index {index} of port `{port}` is already in use")]
    IndexInUse { port: String, index: usize },
    #[error("no port named `{port}`")]
    UnknownPort { port: String },
    #[error("port `{port}` is not addressable")]
    NotAddressable { port: String },
    #[error("port `{port}` is required but nothing is attached to it")]
    RequiredNotAttached { port: String },
    #[error("invalid data `{value}` received on `{port}`, expected one of {allowed:?}")]
    InvalidValue {
        port: String,
        value: Value,
        allowed: Vec<Value>,
    },
    #[error("socket {socket} is not attached to port `{port}`")]
    NotAttached { port: String, socket: SocketId },
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),
    #[error("unknown node `{0}`")]
    UnknownNode(String),
    #[error("node `{0}` is defined twice")]
    DuplicateNode(String),
    #[error("no component registered as `{0}`")]
    UnknownComponent(String),
    #[error("network has no boundary port `{0}`")]
    UnknownBoundaryPort(String),
}

/// Bracket nesting that cannot be honoured.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StructuralError {
    #[error("closeBracket without a matching openBracket (scope {scope:?})")]
    UnmatchedCloseBracket { scope: Option<Scope> },
    #[error("closeBracket on `{port}` does not match the forwarded bracket nesting")]
    UnbalancedForward { port: String },
}

/// Anything a process routine can fail with.
///
/// `Runtime` errors are routed to the component's `error` port when it has
/// one. Validation and structural errors always stop the network.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessError {
    #[error("{0}")]
    Runtime(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Structural(#[from] StructuralError),
}

impl ProcessError {
    pub fn runtime(message: impl fmt::Display) -> Self {
        ProcessError::Runtime(message.to_string())
    }
}

impl From<anyhow::Error> for ProcessError {
    fn from(err: anyhow::Error) -> Self {
        ProcessError::Runtime(format!("{err:#}"))
    }
}

impl From<String> for ProcessError {
    fn from(message: String) -> Self {
        ProcessError::Runtime(message)
    }
}

impl From<&str> for ProcessError {
    fn from(message: &str) -> Self {
        ProcessError::Runtime(message.to_string())
    }
}

/// Errors that stop a network, or that refuse to build one.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NetworkError {
    #[error("component `{node}` failed: {error}")]
    Component { node: String, error: ProcessError },
    #[error("invalid packet handling in `{node}`: {error}")]
    Validation { node: String, error: ValidationError },
    #[error("bracket imbalance in `{node}`: {error}")]
    Structural { node: String, error: StructuralError },
    #[error("invalid graph: {0}")]
    Graph(#[from] ValidationError),
    #[error("network was stopped")]
    Stopped,
    #[error("network scheduler is no longer running")]
    Closed,
}

impl NetworkError {
    /// Attribute a process error to the node that raised it.
    pub fn from_process(node: &str, error: ProcessError) -> Self {
        let node = node.to_string();
        match error {
            ProcessError::Validation(error) => NetworkError::Validation { node, error },
            ProcessError::Structural(error) => NetworkError::Structural { node, error },
            error => NetworkError::Component { node, error },
        }
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            NetworkError::Component { node, .. }
            | NetworkError::Validation { node, .. }
            | NetworkError::Structural { node, .. } => Some(node),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_errors_keep_their_kind_when_attributed() {
        let err = NetworkError::from_process(
            "merge",
            ValidationError::MissingIndex { port: "out".into() }.into(),
        );
        assert!(matches!(err, NetworkError::Validation { ref node, .. } if node == "merge"));
        assert_eq!(err.node(), Some("merge"));

        let err = NetworkError::from_process("merge", ProcessError::runtime("boom"));
        assert_eq!(err.to_string(), "component `merge` failed: boom");
    }

    #[test]
    fn anyhow_context_is_flattened() {
        let err: ProcessError = anyhow::anyhow!("disk full").context("writing").into();
        assert_eq!(err, ProcessError::Runtime("writing: disk full".into()));
    }
}

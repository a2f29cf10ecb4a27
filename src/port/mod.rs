// src/port/mod.rs

pub mod inport;
pub mod outport;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{error::ValidationError, socket::SocketId};

pub use inport::InPort;
pub use outport::OutPort;

/// Options shared by both port directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOptions {
    pub datatype: String,
    pub schema: Option<String>,
    pub description: String,
    pub addressable: bool,
    pub required: bool,
    pub scoped: bool,
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            datatype: "all".to_string(),
            schema: None,
            description: String::new(),
            addressable: false,
            required: false,
            scoped: true,
        }
    }
}

/// A port name plus an optional connection index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey {
    pub port: String,
    pub index: Option<usize>,
}

impl PortKey {
    pub fn new(port: impl Into<String>, index: Option<usize>) -> Self {
        Self {
            port: port.into(),
            index,
        }
    }
}

/// Borrowed port reference used by the process API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRef<'p> {
    pub name: &'p str,
    pub index: Option<usize>,
}

impl<'p> PortRef<'p> {
    pub fn indexed(name: &'p str, index: usize) -> Self {
        Self {
            name,
            index: Some(index),
        }
    }
}

impl<'p> From<&'p str> for PortRef<'p> {
    fn from(name: &'p str) -> Self {
        Self { name, index: None }
    }
}

impl<'p> From<&'p String> for PortRef<'p> {
    fn from(name: &'p String) -> Self {
        Self {
            name: name.as_str(),
            index: None,
        }
    }
}

impl<'p> From<(&'p str, usize)> for PortRef<'p> {
    fn from((name, index): (&'p str, usize)) -> Self {
        Self::indexed(name, index)
    }
}

/// Emitted when a socket is detached from a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached {
    pub socket: SocketId,
    pub index: usize,
}

/// Index-to-socket table of one port.
#[derive(Debug, Clone, Default)]
pub struct Attachments {
    slots: BTreeMap<usize, SocketId>,
}

impl Attachments {
    /// Attach at `index`, or at the lowest free index when none is given.
    pub fn attach(
        &mut self,
        port: &str,
        socket: SocketId,
        index: Option<usize>,
    ) -> Result<usize, ValidationError> {
        let index = match index {
            Some(index) if self.slots.contains_key(&index) => {
                return Err(ValidationError::IndexInUse {
                    port: port.to_string(),
                    index,
                });
            }
            Some(index) => index,
            None => self.lowest_free(),
        };
        self.slots.insert(index, socket);
        Ok(index)
    }

    fn lowest_free(&self) -> usize {
        let mut free = 0;
        for index in self.slots.keys() {
            if *index != free {
                break;
            }
            free += 1;
        }
        free
    }

    pub fn detach(&mut self, port: &str, socket: SocketId) -> Result<Detached, ValidationError> {
        let index = self
            .index_of(socket)
            .ok_or_else(|| ValidationError::NotAttached {
                port: port.to_string(),
                socket,
            })?;
        self.slots.remove(&index);
        Ok(Detached { socket, index })
    }

    pub fn index_of(&self, socket: SocketId) -> Option<usize> {
        self.slots
            .iter()
            .find(|(_, attached)| **attached == socket)
            .map(|(index, _)| *index)
    }

    pub fn get(&self, index: usize) -> Option<SocketId> {
        self.slots.get(&index).copied()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.slots.contains_key(&index)
    }

    pub fn indices(&self) -> Vec<usize> {
        self.slots.keys().copied().collect()
    }

    pub fn sockets(&self) -> impl Iterator<Item = (usize, SocketId)> + '_ {
        self.slots.iter().map(|(index, socket)| (*index, *socket))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub trait NamedPort {
    fn name(&self) -> &str;
}

/// Ports of one direction, in declaration order.
#[derive(Debug, Clone)]
pub struct Ports<P> {
    ports: Vec<P>,
}

impl<P> Default for Ports<P> {
    fn default() -> Self {
        Self { ports: Vec::new() }
    }
}

impl<P: NamedPort> Ports<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port, replacing any earlier one with the same name.
    pub fn add(&mut self, port: P) {
        match self.ports.iter_mut().find(|p| p.name() == port.name()) {
            Some(existing) => *existing = port,
            None => self.ports.push(port),
        }
    }

    pub fn get(&self, name: &str) -> Option<&P> {
        self.ports.iter().find(|p| p.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut P> {
        self.ports.iter_mut().find(|p| p.name() == name)
    }

    pub fn require(&self, name: &str) -> Result<&P, ValidationError> {
        self.get(name).ok_or_else(|| ValidationError::UnknownPort {
            port: name.to_string(),
        })
    }

    pub fn require_mut(&mut self, name: &str) -> Result<&mut P, ValidationError> {
        self.get_mut(name).ok_or_else(|| ValidationError::UnknownPort {
            port: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.ports.iter().map(NamedPort::name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.ports.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut P> {
        self.ports.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

// src/socket.rs

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{ProcessError, StructuralError, ValidationError},
    ip::{Ip, Scope},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketId(u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a socket hands to whatever sits on its far end.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connect,
    Ip(Ip),
    Disconnect,
}

impl SocketEvent {
    pub fn ip(&self) -> Option<&Ip> {
        match self {
            SocketEvent::Ip(ip) => Some(ip),
            _ => None,
        }
    }
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketEvent::Connect => f.write_str("CONN"),
            SocketEvent::Ip(ip) => ip.fmt(f),
            SocketEvent::Disconnect => f.write_str("DISC"),
        }
    }
}

/// One side of an edge, kept for tracing and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub port: String,
    pub index: Option<usize>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}.{}[{}]", self.node, self.port, index),
            None => write!(f, "{}.{}", self.node, self.port),
        }
    }
}

/// A directed edge with a FIFO of pending events.
///
/// Tracks connection state and bracket depth per scope. Connecting happens
/// implicitly on the first non-close packet and disconnecting once the last
/// open bracket is closed.
#[derive(Debug)]
pub struct InternalSocket {
    id: SocketId,
    from: Option<Endpoint>,
    to: Option<Endpoint>,
    connected: bool,
    brackets: HashMap<Option<Scope>, Vec<Arc<Value>>>,
    queue: VecDeque<SocketEvent>,
}

impl InternalSocket {
    pub fn new(id: SocketId, from: Option<Endpoint>, to: Option<Endpoint>) -> Self {
        Self {
            id,
            from,
            to,
            connected: false,
            brackets: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn from(&self) -> Option<&Endpoint> {
        self.from.as_ref()
    }

    pub fn to(&self) -> Option<&Endpoint> {
        self.to.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connect(&mut self) {
        if !self.connected {
            self.connected = true;
            self.queue.push_back(SocketEvent::Connect);
        }
    }

    pub fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.queue.push_back(SocketEvent::Disconnect);
        }
    }

    pub fn post(&mut self, ip: Ip) -> Result<(), StructuralError> {
        if !self.connected && !ip.is_close() {
            self.connect();
        }
        let scope = ip.scope().cloned();
        if ip.is_open() {
            self.brackets.entry(scope).or_default().push(ip.payload());
        } else if ip.is_close() {
            let popped = self.brackets.get_mut(&scope).and_then(Vec::pop);
            if popped.is_none() {
                return Err(StructuralError::UnmatchedCloseBracket { scope });
            }
        }

        let closing = ip.is_close();
        self.queue.push_back(SocketEvent::Ip(ip));
        if closing && self.depth() == 0 {
            self.disconnect();
        }
        Ok(())
    }

    pub fn send(&mut self, data: impl Into<Value>) -> Result<(), StructuralError> {
        self.post(Ip::data(data))
    }

    pub fn begin_group(&mut self, data: impl Into<Value>) -> Result<(), StructuralError> {
        self.post(Ip::open_bracket(data))
    }

    /// Close the innermost unscoped bracket, echoing its data.
    pub fn end_group(&mut self) -> Result<(), StructuralError> {
        let data = self
            .brackets
            .get(&None)
            .and_then(|stack| stack.last())
            .map(|data| (**data).clone())
            .unwrap_or(Value::Null);
        self.post(Ip::close_bracket(data))
    }

    pub fn depth(&self) -> usize {
        self.brackets.values().map(Vec::len).sum()
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn take_event(&mut self) -> Option<SocketEvent> {
        self.queue.pop_front()
    }
}

/// Every socket of a network plus the global delivery order.
///
/// Each queued event puts its socket id on `ready` once, so draining
/// `ready` delivers events in the order they were produced.
#[derive(Debug, Default)]
pub struct Sockets {
    next_id: u64,
    sockets: BTreeMap<SocketId, InternalSocket>,
    ready: VecDeque<SocketId>,
}

impl Sockets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, from: Option<Endpoint>, to: Option<Endpoint>) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        self.sockets.insert(id, InternalSocket::new(id, from, to));
        id
    }

    pub fn get(&self, id: SocketId) -> Option<&InternalSocket> {
        self.sockets.get(&id)
    }

    pub fn remove(&mut self, id: SocketId) -> Option<InternalSocket> {
        self.ready.retain(|ready| *ready != id);
        self.sockets.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn with_socket<F>(&mut self, id: SocketId, op: F) -> Result<(), ProcessError>
    where
        F: FnOnce(&mut InternalSocket) -> Result<(), StructuralError>,
    {
        let socket = self
            .sockets
            .get_mut(&id)
            .ok_or(ValidationError::UnknownSocket(id))?;
        let before = socket.pending();
        let outcome = op(socket);
        let queued = socket.pending().saturating_sub(before);
        for _ in 0..queued {
            self.ready.push_back(id);
        }
        outcome.map_err(ProcessError::from)
    }

    pub fn post(&mut self, id: SocketId, ip: Ip) -> Result<(), ProcessError> {
        self.with_socket(id, |socket| socket.post(ip))
    }

    pub fn connect(&mut self, id: SocketId) -> Result<(), ProcessError> {
        self.with_socket(id, |socket| {
            socket.connect();
            Ok(())
        })
    }

    pub fn disconnect(&mut self, id: SocketId) -> Result<(), ProcessError> {
        self.with_socket(id, |socket| {
            socket.disconnect();
            Ok(())
        })
    }

    pub fn end_group(&mut self, id: SocketId) -> Result<(), ProcessError> {
        self.with_socket(id, InternalSocket::end_group)
    }

    pub fn has_pending(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Pop the oldest undelivered event across all sockets.
    pub fn next_ready(&mut self) -> Option<(SocketId, SocketEvent)> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(event) = self.sockets.get_mut(&id).and_then(InternalSocket::take_event) {
                return Some((id, event));
            }
        }
        None
    }
}

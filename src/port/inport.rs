// src/port/inport.rs

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use super::{Attachments, Detached, NamedPort, PortOptions};
use crate::{
    error::ValidationError,
    ip::{Ip, Scope},
    socket::SocketId,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BufferKey {
    index: Option<usize>,
    scope: Option<Scope>,
    initial: bool,
}

/// Receiving side of a component.
///
/// Packets are buffered per connection index and per scope. Initial packets
/// without a scope go to a separate buffer that is only read once the
/// regular one is empty, so they act as defaults.
#[derive(Debug, Clone)]
pub struct InPort {
    name: String,
    options: PortOptions,
    control: bool,
    triggering: bool,
    values: Option<Vec<Value>>,
    sockets: Attachments,
    buffers: HashMap<BufferKey, VecDeque<Ip>>,
}

impl InPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: PortOptions::default(),
            control: false,
            triggering: true,
            values: None,
            sockets: Attachments::default(),
            buffers: HashMap::new(),
        }
    }

    pub fn datatype(mut self, datatype: impl Into<String>) -> Self {
        self.options.datatype = datatype.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.options.schema = Some(schema.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.options.description = description.into();
        self
    }

    pub fn addressable(mut self) -> Self {
        self.options.addressable = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.options.required = true;
        self
    }

    /// Scope tags are dropped on arrival.
    pub fn unscoped(mut self) -> Self {
        self.options.scoped = false;
        self
    }

    /// Keeps only the latest data packet, which reads never consume.
    /// Control ports do not trigger the process routine.
    pub fn control(mut self) -> Self {
        self.control = true;
        self.triggering = false;
        self
    }

    pub fn triggering(mut self, triggering: bool) -> Self {
        self.triggering = triggering;
        self
    }

    pub fn values(mut self, values: Vec<Value>) -> Self {
        self.values = Some(values);
        self
    }

    pub fn options(&self) -> &PortOptions {
        &self.options
    }

    pub fn is_addressable(&self) -> bool {
        self.options.addressable
    }

    pub fn is_required(&self) -> bool {
        self.options.required
    }

    pub fn is_scoped(&self) -> bool {
        self.options.scoped
    }

    pub fn is_control(&self) -> bool {
        self.control
    }

    pub fn is_triggering(&self) -> bool {
        self.triggering
    }

    pub fn attach(
        &mut self,
        socket: SocketId,
        index: Option<usize>,
    ) -> Result<usize, ValidationError> {
        self.sockets.attach(&self.name, socket, index)
    }

    pub fn detach(&mut self, socket: SocketId) -> Result<Detached, ValidationError> {
        self.sockets.detach(&self.name, socket)
    }

    pub fn list_attached(&self) -> Vec<usize> {
        self.sockets.indices()
    }

    pub fn is_attached(&self, index: Option<usize>) -> bool {
        match index {
            Some(index) => self.sockets.contains(index),
            None => !self.sockets.is_empty(),
        }
    }

    fn effective_scope(&self, scope: Option<&Scope>) -> Option<Scope> {
        if self.options.scoped {
            scope.cloned()
        } else {
            None
        }
    }

    fn primary_key(&self, scope: Option<&Scope>, index: Option<usize>) -> BufferKey {
        BufferKey {
            index,
            scope: self.effective_scope(scope),
            initial: false,
        }
    }

    fn initial_key(index: Option<usize>) -> BufferKey {
        BufferKey {
            index,
            scope: None,
            initial: true,
        }
    }

    /// Buffer an arriving packet.
    pub fn handle_ip(&mut self, mut ip: Ip, index: Option<usize>) -> Result<(), ValidationError> {
        if self.control && !ip.is_data() {
            return Ok(());
        }
        if let Some(allowed) = &self.values {
            if ip.is_data() && !allowed.contains(ip.value()) {
                return Err(ValidationError::InvalidValue {
                    port: self.name.clone(),
                    value: ip.value().clone(),
                    allowed: allowed.clone(),
                });
            }
        }

        let index = if self.options.addressable { index } else { None };
        ip.set_index(index);
        if !self.options.scoped {
            ip.set_scope(None);
        }
        if self.options.datatype != "all" && ip.datatype().is_none_or(|d| d == "all") {
            ip.set_datatype(Some(self.options.datatype.clone()));
        }
        if ip.schema().is_none() {
            ip.set_schema(self.options.schema.clone());
        }

        let key = match ip.scope() {
            Some(scope) => BufferKey {
                index,
                scope: Some(scope.clone()),
                initial: false,
            },
            None if ip.is_initial() => Self::initial_key(index),
            None => self.primary_key(None, index),
        };
        let buffer = self.buffers.entry(key).or_default();
        buffer.push_back(ip);
        if self.control {
            while buffer.len() > 1 {
                buffer.pop_front();
            }
        }
        Ok(())
    }

    fn active_buffer(&self, scope: Option<&Scope>, index: Option<usize>) -> Option<&VecDeque<Ip>> {
        self.buffers
            .get(&self.primary_key(scope, index))
            .filter(|buffer| !buffer.is_empty())
            .or_else(|| {
                self.buffers
                    .get(&Self::initial_key(index))
                    .filter(|buffer| !buffer.is_empty())
            })
    }

    /// Does the buffer for this scope and index hold a packet matching `validate`?
    pub fn has(
        &self,
        scope: Option<&Scope>,
        index: Option<usize>,
        validate: impl Fn(&Ip) -> bool,
    ) -> bool {
        [self.primary_key(scope, index), Self::initial_key(index)]
            .iter()
            .filter_map(|key| self.buffers.get(key))
            .any(|buffer| buffer.iter().any(&validate))
    }

    /// Like `has`, across every connection index.
    pub fn has_any(&self, scope: Option<&Scope>, validate: impl Fn(&Ip) -> bool) -> bool {
        let scope = self.effective_scope(scope);
        self.buffers
            .iter()
            .filter(|(key, _)| key.initial || key.scope == scope)
            .any(|(_, buffer)| buffer.iter().any(&validate))
    }

    /// Read the next packet. Control ports hand out a copy of their latest one.
    pub fn get(&mut self, scope: Option<&Scope>, index: Option<usize>) -> Option<Ip> {
        let control = self.control;
        let primary = self.primary_key(scope, index);
        for key in [primary, Self::initial_key(index)] {
            let Some(buffer) = self.buffers.get_mut(&key) else {
                continue;
            };
            if control {
                if let Some(ip) = buffer.back() {
                    return Some(ip.clone());
                }
                continue;
            }
            if let Some(ip) = buffer.pop_front() {
                if buffer.is_empty() {
                    self.buffers.remove(&key);
                }
                return Some(ip);
            }
        }
        None
    }

    /// The regular buffer only, without falling back to initial packets.
    pub(crate) fn peek(
        &self,
        scope: Option<&Scope>,
        index: Option<usize>,
    ) -> Option<&VecDeque<Ip>> {
        self.buffers.get(&self.primary_key(scope, index))
    }

    pub(crate) fn take_front(&mut self, scope: Option<&Scope>, index: Option<usize>) -> Option<Ip> {
        let key = self.primary_key(scope, index);
        let buffer = self.buffers.get_mut(&key)?;
        let ip = buffer.pop_front();
        if buffer.is_empty() {
            self.buffers.remove(&key);
        }
        ip
    }

    /// Length of the complete stream at the head of the buffer, if there is one.
    pub(crate) fn stream_len(&self, scope: Option<&Scope>, index: Option<usize>) -> Option<usize> {
        let buffer = self.active_buffer(scope, index)?;
        let mut depth = 0usize;
        for (position, ip) in buffer.iter().enumerate() {
            if ip.is_open() {
                depth += 1;
            } else if ip.is_close() {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(position + 1);
                }
            } else if depth == 0 {
                return Some(position + 1);
            }
        }
        None
    }

    /// Scopes that currently have packets waiting.
    pub(crate) fn buffered_scopes(&self) -> impl Iterator<Item = &Scope> + '_ {
        self.buffers
            .iter()
            .filter(|(key, buffer)| !key.initial && !buffer.is_empty())
            .filter_map(|(key, _)| key.scope.as_ref())
    }

    pub fn buffered(&self) -> usize {
        self.buffers.values().map(VecDeque::len).sum()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

impl NamedPort for InPort {
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scoped_buffers_are_kept_apart() {
        let mut port = InPort::new("in");
        port.handle_ip(Ip::data(1).with_scope("a"), None).unwrap();
        port.handle_ip(Ip::data(2).with_scope("b"), None).unwrap();

        let a = Scope::from("a");
        let b = Scope::from("b");
        assert!(port.has(Some(&a), None, Ip::is_data));
        assert!(!port.has(None, None, Ip::is_data));
        assert_eq!(port.get(Some(&b), None).map(Ip::into_value), Some(json!(2)));
        assert_eq!(port.get(Some(&b), None), None);
        assert_eq!(port.buffered(), 1);
    }

    #[test]
    fn unscoped_port_strips_scope() {
        let mut port = InPort::new("in").unscoped();
        port.handle_ip(Ip::data("x").with_scope("s"), None).unwrap();

        let s = Scope::from("s");
        assert!(port.has(Some(&s), None, Ip::is_data));
        let ip = port.get(None, None).unwrap();
        assert_eq!(ip.scope(), None);
    }

    #[test]
    fn initial_packets_are_a_fallback() {
        let mut port = InPort::new("in");
        port.handle_ip(Ip::data("default").initial(true), None).unwrap();
        port.handle_ip(Ip::data("live"), None).unwrap();

        assert_eq!(port.get(None, None).map(Ip::into_value), Some(json!("live")));
        assert_eq!(port.get(None, None).map(Ip::into_value), Some(json!("default")));
        assert!(port.get(None, None).is_none());
    }

    #[test]
    fn control_port_keeps_latest_without_consuming() {
        let mut port = InPort::new("config").control();
        assert!(!port.is_triggering());
        port.handle_ip(Ip::open_bracket("ignored"), None).unwrap();
        port.handle_ip(Ip::data(1), None).unwrap();
        port.handle_ip(Ip::data(2), None).unwrap();

        assert_eq!(port.buffered(), 1);
        assert_eq!(port.get(None, None).map(Ip::into_value), Some(json!(2)));
        assert_eq!(port.get(None, None).map(Ip::into_value), Some(json!(2)));
    }

    #[test]
    fn allowed_values_are_enforced() {
        let mut port = InPort::new("mode").values(vec![json!("fast"), json!("slow")]);
        port.handle_ip(Ip::data("fast"), None).unwrap();
        let err = port.handle_ip(Ip::data("medium"), None).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { ref port, .. } if port == "mode"));
    }

    #[test]
    fn datatype_is_stamped_on_arrival() {
        let mut port = InPort::new("in").datatype("string");
        port.handle_ip(Ip::data("x"), None).unwrap();
        port.handle_ip(Ip::data("y").with_datatype("bang"), None).unwrap();

        assert_eq!(port.get(None, None).unwrap().datatype(), Some("string"));
        assert_eq!(port.get(None, None).unwrap().datatype(), Some("bang"));
    }

    #[test]
    fn addressable_port_buffers_per_index() {
        let mut port = InPort::new("in").addressable();
        port.handle_ip(Ip::data("zero"), Some(0)).unwrap();
        port.handle_ip(Ip::data("one"), Some(1)).unwrap();

        assert!(port.has(None, Some(1), Ip::is_data));
        assert!(port.has_any(None, Ip::is_data));
        let ip = port.get(None, Some(1)).unwrap();
        assert_eq!(ip.index(), Some(1));
        assert_eq!(ip.into_value(), json!("one"));
    }

    #[test]
    fn stream_length_covers_nested_brackets() {
        let mut port = InPort::new("in");
        for ip in [
            Ip::open_bracket("a"),
            Ip::open_bracket("b"),
            Ip::data(1),
            Ip::close_bracket("b"),
            Ip::close_bracket("a"),
            Ip::data(2),
        ] {
            port.handle_ip(ip, None).unwrap();
        }
        assert_eq!(port.stream_len(None, None), Some(5));

        let mut open = InPort::new("in");
        open.handle_ip(Ip::open_bracket("a"), None).unwrap();
        open.handle_ip(Ip::data(1), None).unwrap();
        assert_eq!(open.stream_len(None, None), None);
    }
}

// src/context.rs

use std::future::Future;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{
    component::{
        ForwardMap,
        brackets::{BracketCapture, BracketState, StackKey},
    },
    error::{ProcessError, StructuralError, ValidationError},
    ip::{Ip, Scope},
    port::{InPort, OutPort, PortKey, PortRef, Ports},
};

/// Work handed back by an activation that finishes later.
pub type Deferred = BoxFuture<'static, Result<Outputs, ProcessError>>;

/// Owned batch of packets, used by deferred activations and `send_done`.
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    packets: Vec<(String, Ip)>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(mut self, port: impl Into<String>, data: impl Into<Value>) -> Self {
        self.push(port, Ip::data(data));
        self
    }

    pub fn send_to(
        mut self,
        port: impl Into<String>,
        index: usize,
        data: impl Into<Value>,
    ) -> Self {
        self.push(port, Ip::data(data).with_index(index));
        self
    }

    pub fn send_ip(mut self, port: impl Into<String>, ip: Ip) -> Self {
        self.push(port, ip);
        self
    }

    pub fn push(&mut self, port: impl Into<String>, ip: Ip) {
        self.packets.push((port.into(), ip));
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl IntoIterator for Outputs {
    type Item = (String, Ip);
    type IntoIter = std::vec::IntoIter<(String, Ip)>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.into_iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Outputs {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut outputs = Outputs::new();
        for (port, data) in iter {
            outputs.push(port, Ip::data(data));
        }
        outputs
    }
}

/// Check that `port` exists and that `index` matches its addressability and
/// names an attached connection.
/// Returns the index the packet should travel with.
pub(crate) fn resolve_output(
    ports: &Ports<OutPort>,
    port: &str,
    index: Option<usize>,
) -> Result<Option<usize>, ValidationError> {
    let out = ports.require(port)?;
    if !out.is_addressable() {
        return Ok(None);
    }
    let index = index.ok_or_else(|| ValidationError::MissingIndex { port: port.to_string() })?;
    if !out.is_attached(Some(index)) {
        return Err(ValidationError::UnknownIndex { port: port.to_string(), index });
    }
    Ok(Some(index))
}

/// Packets without a scope inherit the activation's.
pub(crate) fn stamp_scope(mut ip: Ip, scope: Option<&Scope>) -> Ip {
    if ip.scope().is_none() {
        ip.set_scope(scope.cloned());
    }
    ip
}

/// What the process routine sees of one activation.
pub struct ProcessContext<'a> {
    pub input: ProcessInput<'a>,
    pub output: ProcessOutput<'a>,
    node: &'a str,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(node: &'a str, input: ProcessInput<'a>, output: ProcessOutput<'a>) -> Self {
        Self { input, output, node }
    }

    pub fn node(&self) -> &str {
        self.node
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.input.scope()
    }

    pub(crate) fn activated(&self) -> bool {
        self.input.activated || self.output.activated
    }

    pub(crate) fn into_parts(self) -> (BracketCapture, OutputParts) {
        let ProcessOutput {
            packets,
            errors,
            done,
            deferred,
            ..
        } = self.output;
        (
            self.input.capture,
            OutputParts {
                packets,
                errors,
                done,
                deferred,
            },
        )
    }
}

pub(crate) struct OutputParts {
    pub packets: Vec<(PortKey, Ip)>,
    pub errors: Vec<ProcessError>,
    pub done: bool,
    pub deferred: Option<Deferred>,
}

/// Read side of an activation.
///
/// Every read happens within the scope of the packet that triggered the
/// activation. Reading from a port that forwards brackets records the
/// brackets it skips so they can be re-emitted around the output.
pub struct ProcessInput<'a> {
    ports: &'a mut Ports<InPort>,
    brackets: &'a mut BracketState,
    forward: &'a ForwardMap,
    trigger: PortKey,
    scope: Option<Scope>,
    capture: BracketCapture,
    activated: bool,
}

impl<'a> ProcessInput<'a> {
    pub(crate) fn new(
        ports: &'a mut Ports<InPort>,
        brackets: &'a mut BracketState,
        forward: &'a ForwardMap,
        trigger: PortKey,
        scope: Option<Scope>,
    ) -> Self {
        Self {
            ports,
            brackets,
            forward,
            trigger,
            scope,
            capture: BracketCapture::default(),
            activated: false,
        }
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    /// The port whose packet caused this activation.
    pub fn port(&self) -> &str {
        &self.trigger.port
    }

    pub fn index(&self) -> Option<usize> {
        self.trigger.index
    }

    fn resolve(&self, target: PortRef<'_>) -> Result<&InPort, ValidationError> {
        let port = self.ports.require(target.name)?;
        match (port.is_addressable(), target.index) {
            (true, None) => Err(ValidationError::MissingIndex {
                port: target.name.to_string(),
            }),
            (false, Some(_)) => Err(ValidationError::NotAddressable {
                port: target.name.to_string(),
            }),
            _ => Ok(port),
        }
    }

    pub fn has_with<'p, I, R, F>(&self, ports: I, validate: F) -> Result<bool, ProcessError>
    where
        I: IntoIterator<Item = R>,
        R: Into<PortRef<'p>>,
        F: Fn(&Ip) -> bool,
    {
        for target in ports {
            let target = target.into();
            let port = self.resolve(target)?;
            if !port.has(self.scope.as_ref(), target.index, &validate) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Any packet buffered on every listed port.
    pub fn has<'p, I, R>(&self, ports: I) -> Result<bool, ProcessError>
    where
        I: IntoIterator<Item = R>,
        R: Into<PortRef<'p>>,
    {
        self.has_with(ports, |_| true)
    }

    pub fn has_data<'p, I, R>(&self, ports: I) -> Result<bool, ProcessError>
    where
        I: IntoIterator<Item = R>,
        R: Into<PortRef<'p>>,
    {
        self.has_with(ports, Ip::is_data)
    }

    /// A complete bracketed stream (or a lone data packet) is waiting.
    pub fn has_stream<'p>(&self, port: impl Into<PortRef<'p>>) -> Result<bool, ProcessError> {
        let target = port.into();
        let port = self.resolve(target)?;
        Ok(port.stream_len(self.scope.as_ref(), target.index).is_some())
    }

    pub fn attached(&self, port: &str) -> Result<Vec<usize>, ProcessError> {
        Ok(self.ports.require(port)?.list_attached())
    }

    fn take_raw(&mut self, target: PortRef<'_>) -> Option<Ip> {
        self.ports
            .get_mut(target.name)
            .and_then(|port| port.get(self.scope.as_ref(), target.index))
    }

    /// Read the next packet. On a forwarding port this skips ahead to the
    /// next data packet, recording the brackets in between.
    pub fn get<'p>(&mut self, port: impl Into<PortRef<'p>>) -> Result<Option<Ip>, ProcessError> {
        let target = port.into();
        self.resolve(target)?;
        self.activated = true;
        if self.forward.get(target.name).is_some_and(|outs| !outs.is_empty()) {
            return self.take_forwarding(target);
        }
        Ok(self.take_raw(target))
    }

    fn take_forwarding(&mut self, target: PortRef<'_>) -> Result<Option<Ip>, ProcessError> {
        let scoped = self.ports.get(target.name).is_some_and(InPort::is_scoped);
        let key = StackKey {
            port: target.name.to_string(),
            index: target.index,
            scope: if scoped { self.scope.clone() } else { None },
        };

        let mut data = None;
        while let Some(ip) = self.take_raw(target) {
            if ip.is_data() {
                data = Some(ip);
                break;
            }
            if ip.is_open() {
                self.brackets.open_frame(key.clone(), ip);
            } else {
                let frame = self.brackets.pop_inbound(&key).ok_or_else(|| {
                    StructuralError::UnbalancedForward {
                        port: target.name.to_string(),
                    }
                })?;
                self.brackets.close_frame(frame, ip);
                self.capture.closing_before.push(frame);
            }
        }

        let frames = self.brackets.inbound(&key);
        self.capture.set_context(key, frames);
        Ok(data)
    }

    /// Payload of the next data packet, skipping brackets.
    pub fn get_data<'p>(
        &mut self,
        port: impl Into<PortRef<'p>>,
    ) -> Result<Option<Value>, ProcessError> {
        let target = port.into();
        while let Some(ip) = self.get(target)? {
            if ip.is_data() {
                return Ok(Some(ip.into_value()));
            }
        }
        Ok(None)
    }

    pub fn get_data_many<'p, I, R>(&mut self, ports: I) -> Result<Vec<Option<Value>>, ProcessError>
    where
        I: IntoIterator<Item = R>,
        R: Into<PortRef<'p>>,
    {
        ports.into_iter().map(|port| self.get_data(port)).collect()
    }

    /// Take a whole stream, brackets included. Empty when none is complete.
    pub fn get_stream<'p>(
        &mut self,
        port: impl Into<PortRef<'p>>,
    ) -> Result<Vec<Ip>, ProcessError> {
        let target = port.into();
        let Some(len) = self.resolve(target)?.stream_len(self.scope.as_ref(), target.index) else {
            return Ok(Vec::new());
        };
        self.activated = true;
        Ok((0..len).filter_map(|_| self.take_raw(target)).collect())
    }
}

/// Write side of an activation. Packets are held until the activation is
/// done and its turn in the output order comes up.
pub struct ProcessOutput<'a> {
    ports: &'a Ports<OutPort>,
    scope: Option<Scope>,
    packets: Vec<(PortKey, Ip)>,
    errors: Vec<ProcessError>,
    done: bool,
    deferred: Option<Deferred>,
    activated: bool,
}

impl<'a> ProcessOutput<'a> {
    pub(crate) fn new(ports: &'a Ports<OutPort>, scope: Option<Scope>) -> Self {
        Self {
            ports,
            scope,
            packets: Vec::new(),
            errors: Vec::new(),
            done: false,
            deferred: None,
            activated: false,
        }
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn send(&mut self, port: &str, data: impl Into<Value>) -> Result<(), ProcessError> {
        self.send_ip(port, Ip::data(data))
    }

    pub fn send_to(
        &mut self,
        port: &str,
        index: usize,
        data: impl Into<Value>,
    ) -> Result<(), ProcessError> {
        if !self.ports.require(port)?.is_addressable() {
            return Err(ValidationError::NotAddressable { port: port.to_string() }.into());
        }
        self.send_ip(port, Ip::data(data).with_index(index))
    }

    pub fn send_ip(&mut self, port: &str, mut ip: Ip) -> Result<(), ProcessError> {
        let index = resolve_output(self.ports, port, ip.index())?;
        ip.set_index(index);
        self.activated = true;
        let ip = stamp_scope(ip, self.scope.as_ref());
        self.packets.push((PortKey::new(port, index), ip));
        Ok(())
    }

    pub fn send_all(&mut self, outputs: Outputs) -> Result<(), ProcessError> {
        for (port, ip) in outputs {
            self.send_ip(&port, ip)?;
        }
        Ok(())
    }

    /// Record a failure without finishing the activation.
    pub fn error(&mut self, error: impl Into<ProcessError>) {
        self.activated = true;
        self.errors.push(error.into());
    }

    pub fn done(&mut self, error: Option<ProcessError>) {
        if let Some(error) = error {
            self.error(error);
        }
        self.activated = true;
        self.done = true;
    }

    pub fn send_done(&mut self, outputs: Outputs) -> Result<(), ProcessError> {
        self.send_all(outputs)?;
        self.done(None);
        Ok(())
    }

    /// Finish the activation later. Packets sent so far stay with it; the
    /// future's outputs are appended when it resolves.
    pub fn defer<F>(&mut self, future: F)
    where
        F: Future<Output = Result<Outputs, ProcessError>> + Send + 'static,
    {
        self.activated = true;
        self.deferred = Some(Box::pin(future));
    }
}

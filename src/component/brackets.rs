// src/component/brackets.rs

use std::collections::HashMap;

use super::{ForwardMap, queue::Activation};
use crate::{
    error::StructuralError,
    ip::{Ip, Scope},
    port::{OutPort, PortKey, Ports},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct FrameId(u64);

/// Identifies one stack of open input brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StackKey {
    pub port: String,
    pub index: Option<usize>,
    pub scope: Option<Scope>,
}

/// An open bracket read from a forwarding inport.
#[derive(Debug)]
struct Frame {
    source: String,
    open: Ip,
    close: Option<Ip>,
    /// Output stacks this frame was opened on, with its level there.
    forwarded: Vec<(OutKey, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OutKey {
    port: PortKey,
    scope: Option<Scope>,
}

/// A bracket opened on an output, possibly shared by frames of several inports.
#[derive(Debug)]
struct OutFrame {
    refs: usize,
    sources: Vec<String>,
}

/// Brackets an activation consumed, to be replayed around its output.
#[derive(Debug, Default)]
pub(crate) struct BracketCapture {
    pub closing_before: Vec<FrameId>,
    pub context: Vec<(StackKey, Vec<FrameId>)>,
    pub closing_after: Vec<FrameId>,
}

impl BracketCapture {
    pub fn set_context(&mut self, key: StackKey, frames: Vec<FrameId>) {
        match self.context.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = frames,
            None => self.context.push((key, frames)),
        }
    }
}

#[derive(Default)]
struct PortGroup {
    before: Vec<Ip>,
    opens: Vec<Ip>,
    body: Vec<Ip>,
    after: Vec<Ip>,
}

fn group<'g>(groups: &'g mut Vec<(PortKey, PortGroup)>, key: &PortKey) -> &'g mut PortGroup {
    let position = match groups.iter().position(|(existing, _)| existing == key) {
        Some(position) => position,
        None => {
            groups.push((key.clone(), PortGroup::default()));
            groups.len() - 1
        }
    };
    &mut groups[position].1
}

/// Bracket bookkeeping of one component.
///
/// Input side: a stack of open frames per forwarding inport, index and
/// scope. Output side: a refcounted stack per outport and scope, so that
/// identical nesting arriving from several inports is opened and closed on
/// the output exactly once.
#[derive(Debug, Default)]
pub(crate) struct BracketState {
    next: u64,
    frames: HashMap<FrameId, Frame>,
    inbound: HashMap<StackKey, Vec<FrameId>>,
    outbound: HashMap<OutKey, Vec<OutFrame>>,
}

impl BracketState {
    pub fn open_frame(&mut self, key: StackKey, open: Ip) -> FrameId {
        let id = FrameId(self.next);
        self.next += 1;
        self.frames.insert(
            id,
            Frame {
                source: key.port.clone(),
                open,
                close: None,
                forwarded: Vec::new(),
            },
        );
        self.inbound.entry(key).or_default().push(id);
        id
    }

    pub fn pop_inbound(&mut self, key: &StackKey) -> Option<FrameId> {
        let stack = self.inbound.get_mut(key)?;
        let id = stack.pop();
        if stack.is_empty() {
            self.inbound.remove(key);
        }
        id
    }

    pub fn close_frame(&mut self, id: FrameId, close: Ip) {
        if let Some(frame) = self.frames.get_mut(&id) {
            frame.close = Some(close);
        }
    }

    pub fn inbound(&self, key: &StackKey) -> Vec<FrameId> {
        self.inbound.get(key).cloned().unwrap_or_default()
    }

    pub fn inbound_keys(&self) -> Vec<StackKey> {
        self.inbound.keys().cloned().collect()
    }

    pub fn open_outputs(&self) -> usize {
        self.outbound.values().map(Vec::len).sum()
    }

    /// Build the final packet sequence of an activation: closes owed from
    /// earlier activations, then opens for every bracket not yet forwarded
    /// to a port carrying data, the activation's own packets, and finally
    /// closes for brackets that ended right after it.
    pub fn forward(
        &mut self,
        activation: &mut Activation,
        forward: &ForwardMap,
        outports: &Ports<OutPort>,
    ) -> Result<Vec<(PortKey, Ip)>, StructuralError> {
        let mut groups: Vec<(PortKey, PortGroup)> = Vec::new();
        for (key, ip) in activation.packets.drain(..) {
            group(&mut groups, &key).body.push(ip);
        }

        for id in std::mem::take(&mut activation.capture.closing_before) {
            for (key, ip) in self.release(id)? {
                group(&mut groups, &key).before.push(ip);
            }
        }

        let data_ports: Vec<PortKey> = groups
            .iter()
            .filter(|(_, g)| g.body.iter().any(Ip::is_data))
            .map(|(key, _)| key.clone())
            .collect();
        for (stack, frames) in std::mem::take(&mut activation.capture.context) {
            let Some(targets) = forward.get(&stack.port) else {
                continue;
            };
            for key in data_ports.iter().filter(|key| targets.contains(&key.port)) {
                let scoped = outports.get(&key.port).is_some_and(OutPort::is_scoped);
                for (depth, id) in frames.iter().enumerate() {
                    if let Some(open) = self.acquire(*id, key, depth, scoped) {
                        group(&mut groups, key).opens.push(open);
                    }
                }
            }
        }

        for id in std::mem::take(&mut activation.capture.closing_after) {
            for (key, ip) in self.release(id)? {
                group(&mut groups, &key).after.push(ip);
            }
        }

        let mut packets = Vec::new();
        for (key, g) in groups {
            for ip in g.before.into_iter().chain(g.opens).chain(g.body).chain(g.after) {
                packets.push((key.clone(), ip));
            }
        }
        Ok(packets)
    }

    /// Open `id` on `key` unless already done. Returns the bracket to emit
    /// when no other inport holds the same level open.
    fn acquire(&mut self, id: FrameId, key: &PortKey, depth: usize, scoped: bool) -> Option<Ip> {
        let frame = self.frames.get_mut(&id)?;
        if frame.forwarded.iter().any(|(out, _)| out.port == *key) {
            return None;
        }
        let out_key = OutKey {
            port: key.clone(),
            scope: if scoped { frame.open.scope().cloned() } else { None },
        };
        let stack = self.outbound.entry(out_key.clone()).or_default();
        let (level, emit) = match stack.get_mut(depth) {
            Some(shared) if !shared.sources.contains(&frame.source) => {
                shared.refs += 1;
                shared.sources.push(frame.source.clone());
                (depth, false)
            }
            _ => {
                stack.push(OutFrame {
                    refs: 1,
                    sources: vec![frame.source.clone()],
                });
                (stack.len() - 1, true)
            }
        };
        frame.forwarded.push((out_key, level));
        emit.then(|| {
            let mut open = frame.open.clone();
            open.set_index(key.index);
            open
        })
    }

    /// Close a finished frame everywhere it was forwarded. Returns the
    /// brackets whose last holder this was.
    fn release(&mut self, id: FrameId) -> Result<Vec<(PortKey, Ip)>, StructuralError> {
        let Some(Frame {
            source,
            close,
            forwarded,
            ..
        }) = self.frames.remove(&id)
        else {
            return Ok(Vec::new());
        };
        let Some(close) = close else {
            return Ok(Vec::new());
        };

        let mut closes = Vec::new();
        for (out_key, level) in forwarded {
            let unbalanced = || StructuralError::UnbalancedForward {
                port: out_key.port.port.clone(),
            };
            let stack = self.outbound.get_mut(&out_key).ok_or_else(unbalanced)?;
            let entry = stack.get_mut(level).ok_or_else(unbalanced)?;
            entry.refs = entry.refs.saturating_sub(1);
            if let Some(position) = entry.sources.iter().position(|s| *s == source) {
                entry.sources.remove(position);
            }
            if entry.refs > 0 {
                continue;
            }
            if level + 1 != stack.len() {
                return Err(unbalanced());
            }
            stack.pop();
            if stack.is_empty() {
                self.outbound.remove(&out_key);
            }
            let mut ip = close.clone();
            ip.set_index(out_key.port.index);
            closes.push((out_key.port, ip));
        }
        Ok(closes)
    }
}

// src/component/queue.rs

use std::collections::BTreeMap;

use super::brackets::{BracketCapture, FrameId};
use crate::{error::ProcessError, ip::Ip, ip::Scope, port::PortKey};

/// Everything one activation produced, waiting for its turn to be sent.
#[derive(Debug)]
pub(crate) struct Activation {
    pub seq: u64,
    pub scope: Option<Scope>,
    pub resolved: bool,
    /// Carries only closing brackets for input streams that ended after
    /// the last activation. Not counted as in-flight work.
    pub brackets_only: bool,
    pub packets: Vec<(PortKey, Ip)>,
    pub errors: Vec<ProcessError>,
    pub capture: BracketCapture,
}

impl Activation {
    pub fn new(seq: u64, scope: Option<Scope>) -> Self {
        Self {
            seq,
            scope,
            resolved: false,
            brackets_only: false,
            packets: Vec::new(),
            errors: Vec::new(),
            capture: BracketCapture::default(),
        }
    }

    pub fn brackets_only(seq: u64, scope: Option<Scope>, closing: Vec<FrameId>) -> Self {
        let mut activation = Self::new(seq, scope);
        activation.resolved = true;
        activation.brackets_only = true;
        activation.capture.closing_after = closing;
        activation
    }
}

/// Reorder buffer keyed by activation sequence number.
#[derive(Debug, Default)]
pub(crate) struct OutputQueue {
    entries: BTreeMap<u64, Activation>,
}

impl OutputQueue {
    pub fn insert(&mut self, activation: Activation) {
        self.entries.insert(activation.seq, activation);
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut Activation> {
        self.entries.get_mut(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest queued activation that is not a bracket-only entry.
    pub fn last_activation(&self) -> Option<u64> {
        self.entries
            .values()
            .rev()
            .find(|activation| !activation.brackets_only)
            .map(|activation| activation.seq)
    }

    /// Next entry allowed out. Ordered: only the head, once resolved.
    /// Unordered: any resolved activation, but bracket-only entries still
    /// wait until they reach the head.
    pub fn pop_ready(&mut self, ordered: bool) -> Option<Activation> {
        let head = self.entries.values().next()?;
        if head.resolved {
            let seq = head.seq;
            return self.entries.remove(&seq);
        }
        if ordered {
            return None;
        }
        let seq = self
            .entries
            .values()
            .find(|activation| activation.resolved && !activation.brackets_only)?
            .seq;
        self.entries.remove(&seq)
    }
}

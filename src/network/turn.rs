// src/network/turn.rs

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::{sync::broadcast, task::JoinSet};

use super::events::NetworkEvent;
use crate::{
    context::{Deferred, Outputs},
    error::ProcessError,
    socket::Sockets,
};

/// Result of a deferred activation, tagged with where it came from.
#[derive(Debug)]
pub(crate) struct TaskOutcome {
    pub node: usize,
    pub seq: u64,
    pub result: Result<Outputs, ProcessError>,
}

/// Scheduler state lent to one component for a single step.
pub(crate) struct Turn<'a> {
    pub node: usize,
    pub sockets: &'a mut Sockets,
    pub tasks: &'a mut JoinSet<TaskOutcome>,
    pub in_flight: &'a mut usize,
    pub events: &'a broadcast::Sender<NetworkEvent>,
}

impl Turn<'_> {
    pub fn spawn(&mut self, seq: u64, future: Deferred) {
        let node = self.node;
        self.tasks.spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(ProcessError::runtime("deferred activation panicked")),
            };
            TaskOutcome { node, seq, result }
        });
    }

    pub fn emit(&self, event: NetworkEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

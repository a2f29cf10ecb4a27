// src/network/handle.rs

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};

use super::events::NetworkEvent;
use crate::{
    error::{NetworkError, ValidationError},
    ip::Ip,
};

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkStatus {
    Running,
    /// Nothing in flight and nothing queued. New input resumes the network.
    Complete,
    Stopped,
    Failed(NetworkError),
}

#[derive(Debug, Clone)]
pub(crate) struct StatusCell {
    pub status: NetworkStatus,
    /// Commands the scheduler has taken off its channel.
    pub processed: u64,
}

#[derive(Debug)]
pub(crate) enum BoundaryOp {
    Connect,
    Post(Ip),
    EndGroup,
    Disconnect,
}

#[derive(Debug)]
pub(crate) enum Command {
    Boundary { port: String, op: BoundaryOp },
    Stop,
}

/// Control surface of a running network.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<StatusCell>,
    events: broadcast::Sender<NetworkEvent>,
    inports: Arc<BTreeSet<String>>,
    sent: Arc<AtomicU64>,
}

impl NetworkHandle {
    pub(crate) fn new(
        name: String,
        commands: mpsc::UnboundedSender<Command>,
        status: watch::Receiver<StatusCell>,
        events: broadcast::Sender<NetworkEvent>,
        inports: BTreeSet<String>,
    ) -> Self {
        Self {
            name,
            commands,
            status,
            events,
            inports: Arc::new(inports),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, command: Command) -> Result<(), NetworkError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.commands.send(command).map_err(|_| {
            self.sent.fetch_sub(1, Ordering::SeqCst);
            NetworkError::Closed
        })
    }

    fn boundary(&self, port: &str, op: BoundaryOp) -> Result<(), NetworkError> {
        if !self.inports.contains(port) {
            return Err(ValidationError::UnknownBoundaryPort(port.to_string()).into());
        }
        self.command(Command::Boundary {
            port: port.to_string(),
            op,
        })
    }

    pub fn connect(&self, port: &str) -> Result<(), NetworkError> {
        self.boundary(port, BoundaryOp::Connect)
    }

    pub fn send(&self, port: &str, data: impl Into<Value>) -> Result<(), NetworkError> {
        self.boundary(port, BoundaryOp::Post(Ip::data(data)))
    }

    pub fn send_ip(&self, port: &str, ip: Ip) -> Result<(), NetworkError> {
        self.boundary(port, BoundaryOp::Post(ip))
    }

    pub fn begin_group(&self, port: &str, data: impl Into<Value>) -> Result<(), NetworkError> {
        self.boundary(port, BoundaryOp::Post(Ip::open_bracket(data)))
    }

    pub fn end_group(&self, port: &str) -> Result<(), NetworkError> {
        self.boundary(port, BoundaryOp::EndGroup)
    }

    pub fn disconnect(&self, port: &str) -> Result<(), NetworkError> {
        self.boundary(port, BoundaryOp::Disconnect)
    }

    /// Stop delivering packets. Activations already running still finish.
    pub fn stop(&self) -> Result<(), NetworkError> {
        self.command(Command::Stop)
    }

    pub fn status(&self) -> NetworkStatus {
        self.status.borrow().status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.status() == NetworkStatus::Running
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Wait until everything sent through this handle so far has been
    /// processed and the network went idle, stopped or failed.
    pub async fn wait(&self) -> Result<(), NetworkError> {
        let target = self.sent.load(Ordering::SeqCst);
        let mut status = self.status.clone();
        loop {
            let settled = {
                let cell = status.borrow_and_update();
                match &cell.status {
                    NetworkStatus::Failed(error) => Some(Err(error.clone())),
                    NetworkStatus::Stopped => Some(Ok(())),
                    NetworkStatus::Complete if cell.processed >= target => Some(Ok(())),
                    _ => None,
                }
            };
            if let Some(outcome) = settled {
                return outcome;
            }
            if status.changed().await.is_err() {
                return match &status.borrow().status {
                    NetworkStatus::Failed(error) => Err(error.clone()),
                    NetworkStatus::Stopped | NetworkStatus::Complete => Ok(()),
                    NetworkStatus::Running => Err(NetworkError::Closed),
                };
            }
        }
    }
}

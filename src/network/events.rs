// src/network/events.rs

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::NetworkError,
    ip::Scope,
    socket::{Endpoint, SocketEvent, SocketId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    Activate,
    Deactivate,
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationKind::Activate => f.write_str("activate"),
            ActivationKind::Deactivate => f.write_str("deactivate"),
        }
    }
}

/// One activation trace record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationEvent {
    pub node: String,
    pub kind: ActivationKind,
    pub seq: u64,
    pub scope: Option<Scope>,
    pub load: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Started {
        network: String,
        at: DateTime<Utc>,
    },
    Activation(ActivationEvent),
    /// Only published when the network runs with `debug` enabled.
    Packet {
        socket: SocketId,
        from: Option<Endpoint>,
        to: Option<Endpoint>,
        event: SocketEvent,
    },
    PortDetached {
        node: String,
        port: String,
        socket: SocketId,
        index: usize,
    },
    Error {
        node: Option<String>,
        error: NetworkError,
    },
    Complete {
        network: String,
        uptime: Duration,
    },
    Stopped {
        network: String,
        uptime: Duration,
    },
}

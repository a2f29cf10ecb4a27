// src/lib.rs

//! In-process flow-based programming.
//!
//! Components with named ports are wired into a [`Graph`], turned into a
//! [`Network`] and driven by a single scheduler task. Packets travel through
//! sockets in FIFO order; bracket packets group data into substreams and are
//! forwarded by components on behalf of their processing routines.

pub mod component;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod ip;
pub mod loader;
pub mod logger;
pub mod network;
pub mod port;
pub mod schema;
pub mod socket;

pub use component::{Component, OutputOrder, Process};
pub use config::RuntimeConfig;
pub use context::{Outputs, ProcessContext, ProcessInput, ProcessOutput};
pub use error::{NetworkError, ProcessError, StructuralError, ValidationError};
pub use graph::{Graph, GraphDefinition};
pub use ip::{Ip, IpType, Scope};
pub use loader::ComponentLoader;
pub use network::{
    Network, launch,
    events::NetworkEvent,
    handle::{NetworkHandle, NetworkStatus},
};
pub use port::{InPort, OutPort};
pub use socket::SocketEvent;

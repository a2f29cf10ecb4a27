// src/network/mod.rs

pub mod events;
pub mod handle;
pub(crate) mod turn;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Instant,
};

use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::{
    events::NetworkEvent,
    handle::{BoundaryOp, Command, NetworkHandle, NetworkStatus, StatusCell},
    turn::{TaskOutcome, Turn},
};
use crate::{
    component::Component,
    config::RuntimeConfig,
    error::{NetworkError, ValidationError},
    graph::{Edge, Graph, GraphDefinition, PortRef},
    ip::Ip,
    loader::ComponentLoader,
    port::NamedPort,
    socket::{Endpoint, SocketEvent, SocketId, Sockets},
};

pub use events::{ActivationEvent, ActivationKind};

#[derive(Debug)]
struct Node {
    id: String,
    component: Component,
}

#[derive(Debug, Clone)]
enum Route {
    Node {
        node: usize,
        port: String,
        index: Option<usize>,
    },
    External(mpsc::UnboundedSender<SocketEvent>),
}

/// A wired graph, ready to run.
///
/// Built from a [`Graph`], then started with [`Network::start`], which
/// moves it onto a scheduler task and hands back a [`NetworkHandle`].
/// Boundary outports must be opened with [`Network::outport`] before
/// starting.
#[derive(Debug)]
pub struct Network {
    id: String,
    name: String,
    debug: bool,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    sockets: Sockets,
    routes: HashMap<SocketId, Route>,
    edges: Vec<(Edge, SocketId)>,
    initials: Vec<(SocketId, Ip)>,
    inports: BTreeMap<String, SocketId>,
    outports: BTreeMap<String, PortRef>,
    events: broadcast::Sender<NetworkEvent>,
}

impl Network {
    pub fn new(graph: Graph, config: &RuntimeConfig) -> Result<Self, NetworkError> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mut network = Network {
            id: Uuid::new_v4().to_string(),
            name: graph.name,
            debug: config.debug,
            nodes: Vec::new(),
            index: HashMap::new(),
            sockets: Sockets::new(),
            routes: HashMap::new(),
            edges: Vec::new(),
            initials: Vec::new(),
            inports: BTreeMap::new(),
            outports: BTreeMap::new(),
            events,
        };

        for (id, source) in graph.nodes {
            if network.index.contains_key(&id) {
                return Err(ValidationError::DuplicateNode(id).into());
            }
            let mut component = source.instantiate();
            component.prepare(&id, config.default_ordering);
            network.index.insert(id.clone(), network.nodes.len());
            network.nodes.push(Node { id, component });
        }
        for edge in graph.edges {
            network.connect_edge(edge)?;
        }
        for initial in graph.initials {
            let socket = network.attach_target(None, &initial.target)?;
            network
                .initials
                .push((socket, Ip::data(initial.value).initial(true)));
        }
        for (name, target) in graph.inports {
            let socket = network.attach_target(None, &target)?;
            network.inports.insert(name, socket);
        }
        for (name, source) in graph.outports {
            let node = network.node_index(&source.node)?;
            network.nodes[node].component.outports.require(&source.port)?;
            network.outports.insert(name, source);
        }
        network.check_required()?;

        info!(
            network = %network.name,
            id = %network.id,
            nodes = network.nodes.len(),
            edges = network.edges.len(),
            "network wired"
        );
        Ok(network)
    }

    /// Resolve a serialized graph through `loader` and wire it.
    pub fn from_definition(
        definition: &GraphDefinition,
        loader: &ComponentLoader,
        config: &RuntimeConfig,
    ) -> Result<Self, NetworkError> {
        Self::new(definition.resolve(loader)?, config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self, node: &str) -> Option<&Component> {
        self.index.get(node).map(|index| &self.nodes[*index].component)
    }

    fn node_index(&self, node: &str) -> Result<usize, ValidationError> {
        self.index
            .get(node)
            .copied()
            .ok_or_else(|| ValidationError::UnknownNode(node.to_string()))
    }

    fn attach_target(
        &mut self,
        from: Option<Endpoint>,
        target: &PortRef,
    ) -> Result<SocketId, NetworkError> {
        let node = self.node_index(&target.node)?;
        let inport = self.nodes[node].component.inports.require_mut(&target.port)?;
        let socket = self.sockets.create(from, Some(Endpoint::from(target)));
        let index = inport.attach(socket, target.index)?;
        let index = inport.is_addressable().then_some(index);
        self.routes.insert(
            socket,
            Route::Node {
                node,
                port: target.port.clone(),
                index,
            },
        );
        Ok(socket)
    }

    fn connect_edge(&mut self, edge: Edge) -> Result<(), NetworkError> {
        let source = self.node_index(&edge.source.node)?;
        self.nodes[source].component.outports.require(&edge.source.port)?;
        let socket = self.attach_target(Some(Endpoint::from(&edge.source)), &edge.target)?;
        let Network { nodes, sockets, .. } = self;
        nodes[source]
            .component
            .outports
            .require_mut(&edge.source.port)?
            .attach(sockets, socket, edge.source.index)
            .map_err(|error| NetworkError::from_process(&edge.source.node, error))?;
        debug!(
            from = %Endpoint::from(&edge.source),
            to = %Endpoint::from(&edge.target),
            %socket,
            "edge connected"
        );
        self.edges.push((edge, socket));
        Ok(())
    }

    fn check_required(&self) -> Result<(), ValidationError> {
        for node in &self.nodes {
            let inports = node
                .component
                .inports
                .iter()
                .filter(|port| port.is_required() && !port.is_attached(None));
            let outports = node
                .component
                .outports
                .iter()
                .filter(|port| port.is_required() && !port.is_attached(None));
            let missing = inports
                .map(NamedPort::name)
                .chain(outports.map(NamedPort::name))
                .next();
            if let Some(port) = missing {
                return Err(ValidationError::RequiredNotAttached {
                    port: format!("{}.{}", node.id, port),
                });
            }
        }
        Ok(())
    }

    /// Open the boundary outport `name`. Everything the wired node port
    /// sends arrives on the returned channel.
    pub fn outport(
        &mut self,
        name: &str,
    ) -> Result<mpsc::UnboundedReceiver<SocketEvent>, NetworkError> {
        let source = self
            .outports
            .get(name)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownBoundaryPort(name.to_string()))?;
        let node = self.node_index(&source.node)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = self.sockets.create(Some(Endpoint::from(&source)), None);
        self.routes.insert(socket, Route::External(tx));
        let Network { nodes, sockets, .. } = self;
        nodes[node]
            .component
            .outports
            .require_mut(&source.port)?
            .attach(sockets, socket, source.index)
            .map_err(|error| NetworkError::from_process(&source.node, error))?;
        Ok(rx)
    }

    /// Move the network onto its scheduler task. Needs a tokio runtime.
    pub fn start(self) -> NetworkHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (status, watcher) = watch::channel(StatusCell {
            status: NetworkStatus::Running,
            processed: 0,
        });
        let handle = NetworkHandle::new(
            self.name.clone(),
            commands,
            watcher,
            self.events.clone(),
            self.inports.keys().cloned().collect::<BTreeSet<_>>(),
        );
        tokio::spawn(self.run(receiver, status));
        handle
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<StatusCell>,
    ) {
        let started = Instant::now();
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut processed = 0u64;
        let mut running = true;
        let mut stopping = false;
        let mut closed = false;

        info!(network = %self.name, id = %self.id, "network started");
        self.emit(NetworkEvent::Started {
            network: self.name.clone(),
            at: Utc::now(),
        });
        for node in &mut self.nodes {
            node.component.start();
        }
        if let Err(error) = self.send_initials() {
            self.fail(&status, &mut tasks, error);
            return;
        }

        loop {
            if !stopping {
                while let Some((socket, event)) = self.sockets.next_ready() {
                    if let Err(error) = self.deliver(socket, event, &mut tasks, &mut in_flight) {
                        self.fail(&status, &mut tasks, error);
                        return;
                    }
                }
            }

            if stopping && tasks.is_empty() {
                self.teardown();
                info!(network = %self.name, uptime = ?started.elapsed(), "network stopped");
                status.send_modify(|cell| cell.status = NetworkStatus::Stopped);
                self.emit(NetworkEvent::Stopped {
                    network: self.name.clone(),
                    uptime: started.elapsed(),
                });
                return;
            }

            let idle = in_flight == 0 && tasks.is_empty() && !self.sockets.has_pending();
            if idle && running {
                running = false;
                info!(network = %self.name, uptime = ?started.elapsed(), "network complete");
                status.send_modify(|cell| cell.status = NetworkStatus::Complete);
                self.emit(NetworkEvent::Complete {
                    network: self.name.clone(),
                    uptime: started.elapsed(),
                });
            }
            if idle && closed {
                debug!(network = %self.name, "all handles dropped, scheduler exiting");
                return;
            }

            tokio::select! {
                command = commands.recv(), if !closed => {
                    let Some(command) = command else {
                        closed = true;
                        continue;
                    };
                    processed += 1;
                    match command {
                        Command::Boundary { port, op } => {
                            if stopping {
                                warn!(
                                    network = %self.name,
                                    %port,
                                    "network is stopping, dropping boundary input"
                                );
                            } else {
                                if !running {
                                    running = true;
                                    self.emit(NetworkEvent::Started {
                                        network: self.name.clone(),
                                        at: Utc::now(),
                                    });
                                }
                                if let Err(error) = self.apply_boundary(&port, op) {
                                    self.fail(&status, &mut tasks, error);
                                    return;
                                }
                            }
                        }
                        Command::Stop => {
                            info!(network = %self.name, in_flight, "stopping network");
                            stopping = true;
                            for node in &mut self.nodes {
                                node.component.stop();
                            }
                        }
                    }
                    status.send_modify(|cell| {
                        if running && !stopping {
                            cell.status = NetworkStatus::Running;
                        }
                        cell.processed = processed;
                    });
                }
                joined = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Some(Ok(outcome)) => {
                            if let Err(error) = self.complete(outcome, &mut tasks, &mut in_flight) {
                                self.fail(&status, &mut tasks, error);
                                return;
                            }
                        }
                        Some(Err(join_error)) => {
                            error!(
                                network = %self.name,
                                error = %join_error,
                                "activation task was lost"
                            );
                        }
                        None => {}
                    }
                }
                else => {
                    debug!(network = %self.name, "nothing left to wait on, scheduler exiting");
                    return;
                }
            }
        }
    }

    fn send_initials(&mut self) -> Result<(), NetworkError> {
        for (socket, ip) in std::mem::take(&mut self.initials) {
            let node = self.route_node(socket);
            self.sockets
                .post(socket, ip)
                .and_then(|_| self.sockets.disconnect(socket))
                .map_err(|error| NetworkError::from_process(&node, error))?;
        }
        Ok(())
    }

    fn route_node(&self, socket: SocketId) -> String {
        match self.routes.get(&socket) {
            Some(Route::Node { node, .. }) => self.nodes[*node].id.clone(),
            _ => self.name.clone(),
        }
    }

    fn apply_boundary(&mut self, port: &str, op: BoundaryOp) -> Result<(), NetworkError> {
        let socket = *self
            .inports
            .get(port)
            .ok_or_else(|| ValidationError::UnknownBoundaryPort(port.to_string()))?;
        let outcome = match op {
            BoundaryOp::Connect => self.sockets.connect(socket),
            BoundaryOp::Post(ip) => self.sockets.post(socket, ip),
            BoundaryOp::EndGroup => self.sockets.end_group(socket),
            BoundaryOp::Disconnect => self.sockets.disconnect(socket),
        };
        outcome.map_err(|error| NetworkError::from_process(&self.route_node(socket), error))
    }

    fn deliver(
        &mut self,
        socket: SocketId,
        event: SocketEvent,
        tasks: &mut JoinSet<TaskOutcome>,
        in_flight: &mut usize,
    ) -> Result<(), NetworkError> {
        if self.debug {
            let (from, to) = self
                .sockets
                .get(socket)
                .map(|s| (s.from().cloned(), s.to().cloned()))
                .unwrap_or_default();
            self.emit(NetworkEvent::Packet {
                socket,
                from,
                to,
                event: event.clone(),
            });
        }

        let (node, port, index) = match self.routes.get(&socket) {
            Some(Route::External(tx)) => {
                // receiver gone means nobody is listening anymore
                let _ = tx.send(event);
                return Ok(());
            }
            Some(Route::Node { node, port, index }) => (*node, port.clone(), *index),
            None => return Ok(()),
        };
        let SocketEvent::Ip(ip) = event else {
            return Ok(());
        };

        let mut turn = Turn {
            node,
            sockets: &mut self.sockets,
            tasks,
            in_flight,
            events: &self.events,
        };
        self.nodes[node].component.receive(&mut turn, &port, index, ip)
    }

    fn complete(
        &mut self,
        outcome: TaskOutcome,
        tasks: &mut JoinSet<TaskOutcome>,
        in_flight: &mut usize,
    ) -> Result<(), NetworkError> {
        let TaskOutcome { node, seq, result } = outcome;
        let mut turn = Turn {
            node,
            sockets: &mut self.sockets,
            tasks,
            in_flight,
            events: &self.events,
        };
        self.nodes[node].component.complete(&mut turn, seq, result)
    }

    fn fail(
        &mut self,
        status: &watch::Sender<StatusCell>,
        tasks: &mut JoinSet<TaskOutcome>,
        error: NetworkError,
    ) {
        error!(network = %self.name, node = ?error.node(), error = %error, "network failed");
        for node in &mut self.nodes {
            node.component.stop();
        }
        // running activations finish on their own, their results are dropped
        tasks.detach_all();
        self.emit(NetworkEvent::Error {
            node: error.node().map(str::to_string),
            error: error.clone(),
        });
        status.send_modify(|cell| cell.status = NetworkStatus::Failed(error));
    }

    /// Detach every socket from its ports and drop it.
    fn teardown(&mut self) {
        let edges = std::mem::take(&mut self.edges);
        for (edge, socket) in edges {
            self.detach(&edge.source, socket, false);
            self.detach(&edge.target, socket, true);
            self.sockets.remove(socket);
            self.routes.remove(&socket);
        }
    }

    fn detach(&mut self, port: &PortRef, socket: SocketId, inbound: bool) {
        let Ok(node) = self.node_index(&port.node) else {
            return;
        };
        let component = &mut self.nodes[node].component;
        let detached = if inbound {
            component.inports.get_mut(&port.port).map(|p| p.detach(socket))
        } else {
            component.outports.get_mut(&port.port).map(|p| p.detach(socket))
        };
        if let Some(Ok(detached)) = detached {
            self.emit(NetworkEvent::PortDetached {
                node: port.node.clone(),
                port: port.port.clone(),
                socket: detached.socket,
                index: detached.index,
            });
        }
    }
}

/// Build, open the named boundary outports and start in one go.
pub fn launch(
    graph: Graph,
    config: &RuntimeConfig,
    outports: &[&str],
) -> Result<(NetworkHandle, BTreeMap<String, mpsc::UnboundedReceiver<SocketEvent>>), NetworkError> {
    let mut network = Network::new(graph, config)?;
    let mut receivers = BTreeMap::new();
    for name in outports {
        receivers.insert(name.to_string(), network.outport(name)?);
    }
    Ok((network.start(), receivers))
}

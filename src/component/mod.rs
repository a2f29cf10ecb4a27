// src/component/mod.rs

pub(crate) mod brackets;
pub(crate) mod queue;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    panic::{self, AssertUnwindSafe},
    str::FromStr,
    sync::Arc,
};

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use self::{
    brackets::{BracketState, FrameId, StackKey},
    queue::{Activation, OutputQueue},
};
use crate::{
    context::{ProcessContext, ProcessInput, ProcessOutput, resolve_output, stamp_scope},
    error::{NetworkError, ProcessError, StructuralError, ValidationError},
    ip::{Ip, IpType, Scope},
    network::{
        events::{ActivationEvent, ActivationKind, NetworkEvent},
        turn::Turn,
    },
    port::{InPort, OutPort, PortKey, Ports},
};

/// Inport name to the outports its brackets are re-emitted on.
pub type ForwardMap = BTreeMap<String, Vec<String>>;

/// When a component's results may leave it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputOrder {
    /// Results leave in activation order.
    #[default]
    Ordered,
    Unordered,
    /// Unordered until the first open bracket arrives, ordered after.
    Auto,
}

impl FromStr for OutputOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(OutputOrder::Auto),
            "ordered" => Ok(OutputOrder::Ordered),
            "unordered" => Ok(OutputOrder::Unordered),
            other => Err(format!("unknown output order `{other}`")),
        }
    }
}

/// The routine run for every activation of a component.
///
/// Returning without calling `done` or `defer` completes the activation.
/// Returning an error completes it with that error.
pub trait Process: Send + Sync + 'static {
    fn activate(&self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError>;
}

struct FnProcess<F>(F);

impl<F> Process for FnProcess<F>
where
    F: Fn(&mut ProcessContext<'_>) -> Result<(), ProcessError> + Send + Sync + 'static,
{
    fn activate(&self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        (self.0)(ctx)
    }
}

/// A component: ports, process routine and the per-instance state that
/// drives activations.
pub struct Component {
    description: String,
    pub(crate) inports: Ports<InPort>,
    pub(crate) outports: Ports<OutPort>,
    forward: Option<ForwardMap>,
    ordering: Option<OutputOrder>,
    process: Arc<dyn Process>,

    node: String,
    started: bool,
    forward_map: ForwardMap,
    order: OutputOrder,
    auto_ordered: bool,
    load: usize,
    next_seq: u64,
    queue: OutputQueue,
    brackets: BracketState,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("node", &self.node)
            .field("inports", &self.inports.names())
            .field("outports", &self.outports.names())
            .field("load", &self.load)
            .field("ordered", &self.is_ordered())
            .finish()
    }
}

impl Component {
    pub fn new(process: impl Process) -> Self {
        Self {
            description: String::new(),
            inports: Ports::new(),
            outports: Ports::new(),
            forward: None,
            ordering: None,
            process: Arc::new(process),
            node: String::new(),
            started: false,
            forward_map: ForwardMap::new(),
            order: OutputOrder::Ordered,
            auto_ordered: false,
            load: 0,
            next_seq: 0,
            queue: OutputQueue::default(),
            brackets: BracketState::default(),
        }
    }

    pub fn from_fn<F>(process: F) -> Self
    where
        F: Fn(&mut ProcessContext<'_>) -> Result<(), ProcessError> + Send + Sync + 'static,
    {
        Self::new(FnProcess(process))
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn inport(mut self, port: InPort) -> Self {
        self.inports.add(port);
        self
    }

    pub fn outport(mut self, port: OutPort) -> Self {
        self.outports.add(port);
        self
    }

    /// Re-emit brackets read on `inport` around data sent on `outports`.
    /// The first call replaces the default of `in` to `out` and `error`.
    pub fn forward(mut self, inport: &str, outports: &[&str]) -> Self {
        self.forward.get_or_insert_with(ForwardMap::new).insert(
            inport.to_string(),
            outports.iter().map(|port| port.to_string()).collect(),
        );
        self
    }

    pub fn no_forwarding(mut self) -> Self {
        self.forward = Some(ForwardMap::new());
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordering = Some(if ordered { OutputOrder::Ordered } else { OutputOrder::Unordered });
        self
    }

    pub fn ordering(mut self, ordering: OutputOrder) -> Self {
        self.ordering = Some(ordering);
        self
    }

    pub fn get_description(&self) -> &str {
        &self.description
    }

    pub fn inports(&self) -> &Ports<InPort> {
        &self.inports
    }

    pub fn outports(&self) -> &Ports<OutPort> {
        &self.outports
    }

    pub fn node_id(&self) -> &str {
        &self.node
    }

    /// Activations started but not yet done.
    pub fn load(&self) -> usize {
        self.load
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_ordered(&self) -> bool {
        match self.order {
            OutputOrder::Ordered => true,
            OutputOrder::Unordered => false,
            OutputOrder::Auto => self.auto_ordered,
        }
    }

    fn is_forwarding(&self, inport: &str) -> bool {
        self.forward_map.get(inport).is_some_and(|outs| !outs.is_empty())
    }

    /// Bind the component to a node and settle its defaults.
    pub(crate) fn prepare(&mut self, node: &str, default_order: OutputOrder) {
        self.node = node.to_string();
        self.order = self.ordering.unwrap_or(default_order);
        self.forward_map = match &self.forward {
            Some(map) => map.clone(),
            None if self.inports.contains("in") => {
                let outs: Vec<String> = ["out", "error"]
                    .into_iter()
                    .filter(|port| self.outports.contains(port))
                    .map(str::to_string)
                    .collect();
                ForwardMap::from([("in".to_string(), outs)])
            }
            None => ForwardMap::new(),
        };
    }

    pub(crate) fn start(&mut self) {
        self.started = true;
        debug!(node = %self.node, "component started");
    }

    pub(crate) fn stop(&mut self) {
        self.started = false;
        debug!(node = %self.node, load = self.load, "component stopped");
    }

    fn escalate(&self, error: ProcessError) -> NetworkError {
        NetworkError::from_process(&self.node, error)
    }

    fn trace(&self, turn: &Turn<'_>, kind: ActivationKind, seq: u64, scope: Option<&Scope>) {
        info!(
            target: "activation",
            node = %self.node,
            kind = %kind,
            seq,
            scope = ?scope,
            load = self.load,
            "{kind}"
        );
        turn.emit(NetworkEvent::Activation(ActivationEvent {
            node: self.node.clone(),
            kind,
            seq,
            scope: scope.cloned(),
            load: self.load,
            at: Utc::now(),
        }));
    }

    /// Deliver a packet from a socket and run the process routine if it
    /// should fire.
    pub(crate) fn receive(
        &mut self,
        turn: &mut Turn<'_>,
        port: &str,
        index: Option<usize>,
        ip: Ip,
    ) -> Result<(), NetworkError> {
        let inport = self.inports.get_mut(port).ok_or_else(|| {
            NetworkError::from_process(
                &self.node,
                ValidationError::UnknownPort { port: port.to_string() }.into(),
            )
        })?;
        let triggering = inport.is_triggering();
        let scoped = inport.is_scoped();
        let scope = if scoped { ip.scope().cloned() } else { None };
        let index = if inport.is_addressable() { index } else { None };
        let kind = ip.kind();
        inport
            .handle_ip(ip, index)
            .map_err(|error| NetworkError::from_process(&self.node, error.into()))?;

        if !triggering || !self.started {
            return Ok(());
        }
        if kind == IpType::OpenBracket && self.order == OutputOrder::Auto && !self.auto_ordered {
            debug!(node = %self.node, "open bracket seen, switching to ordered output");
            self.auto_ordered = true;
        }

        if self.is_forwarding(port) {
            match kind {
                IpType::OpenBracket => return Ok(()),
                IpType::CloseBracket => {
                    let has_data = self
                        .inports
                        .get(port)
                        .and_then(|inport| inport.peek(scope.as_ref(), index))
                        .is_some_and(|buffer| buffer.iter().any(Ip::is_data));
                    if !has_data {
                        return self.close_brackets(turn, port, index, scope);
                    }
                }
                IpType::Data => {}
            }
        }

        if !scoped {
            // unscoped packets can complete an activation waiting in any scope
            let waiting: BTreeSet<Scope> = self
                .inports
                .iter()
                .filter(|inport| inport.is_scoped())
                .flat_map(InPort::buffered_scopes)
                .cloned()
                .collect();
            for scope in waiting {
                self.run_process(turn, port, index, Some(scope))?;
            }
        }
        self.run_process(turn, port, index, scope)
    }

    /// A forwarding inport received closes with no data left to read: queue
    /// them behind whatever is still in flight.
    fn close_brackets(
        &mut self,
        turn: &mut Turn<'_>,
        port: &str,
        index: Option<usize>,
        scope: Option<Scope>,
    ) -> Result<(), NetworkError> {
        let key = StackKey {
            port: port.to_string(),
            index,
            scope: scope.clone(),
        };
        let frames = take_leading_closes(&mut self.inports, &mut self.brackets, &key)
            .map_err(|error| self.escalate(error.into()))?;
        if frames.is_empty() {
            return Ok(());
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert(Activation::brackets_only(seq, scope, frames));
        self.flush(turn)
    }

    fn required_present(&self, scope: Option<&Scope>) -> bool {
        self.inports
            .iter()
            .filter(|port| port.is_required())
            .all(|port| port.has_any(scope, |_| true))
    }

    fn run_process(
        &mut self,
        turn: &mut Turn<'_>,
        port: &str,
        index: Option<usize>,
        scope: Option<Scope>,
    ) -> Result<(), NetworkError> {
        if !self.required_present(scope.as_ref()) {
            return Ok(());
        }

        let seq = self.next_seq;
        let mut ctx = ProcessContext::new(
            &self.node,
            ProcessInput::new(
                &mut self.inports,
                &mut self.brackets,
                &self.forward_map,
                PortKey::new(port, index),
                scope.clone(),
            ),
            ProcessOutput::new(&self.outports, scope.clone()),
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process.activate(&mut ctx)))
            .unwrap_or_else(|_| Err(ProcessError::runtime("activation panicked")));
        let activated = ctx.activated() || outcome.is_err();
        let (capture, output) = ctx.into_parts();
        if !activated {
            return Ok(());
        }

        self.next_seq += 1;
        self.load += 1;
        *turn.in_flight += 1;
        self.trace(turn, ActivationKind::Activate, seq, scope.as_ref());

        let mut activation = Activation::new(seq, scope);
        activation.capture = capture;
        activation.packets = output.packets;
        activation.errors = output.errors;

        let deferred = match outcome {
            Err(error) => {
                activation.errors.push(error);
                None
            }
            Ok(()) if output.done => {
                if output.deferred.is_some() {
                    warn!(
                        node = %self.node,
                        seq,
                        "activation both finished and deferred, dropping deferred work"
                    );
                }
                None
            }
            Ok(()) => output.deferred,
        };
        self.queue.insert(activation);

        match deferred {
            Some(future) => {
                turn.spawn(seq, future);
                Ok(())
            }
            None => self.finish(turn, seq),
        }
    }

    /// A deferred activation resolved.
    pub(crate) fn complete(
        &mut self,
        turn: &mut Turn<'_>,
        seq: u64,
        result: Result<crate::context::Outputs, ProcessError>,
    ) -> Result<(), NetworkError> {
        let Some(activation) = self.queue.get_mut(seq) else {
            warn!(node = %self.node, seq, "completion for unknown activation");
            return Ok(());
        };
        match result {
            Ok(outputs) => {
                for (port, mut ip) in outputs {
                    match resolve_output(&self.outports, &port, ip.index()) {
                        Ok(index) => {
                            ip.set_index(index);
                            let ip = stamp_scope(ip, activation.scope.as_ref());
                            activation.packets.push((PortKey::new(port, index), ip));
                        }
                        Err(error) => activation.errors.push(error.into()),
                    }
                }
            }
            Err(error) => activation.errors.push(error),
        }
        self.finish(turn, seq)
    }

    /// Mark an activation done: route its errors, collect brackets that
    /// close right after it, and flush whatever is ready.
    fn finish(&mut self, turn: &mut Turn<'_>, seq: u64) -> Result<(), NetworkError> {
        let ordered = self.is_ordered();
        let last = self.queue.last_activation() == Some(seq);
        let error_port = self
            .outports
            .get("error")
            .is_some_and(|port| !port.is_addressable());

        let Some(activation) = self.queue.get_mut(seq) else {
            return Ok(());
        };
        activation.resolved = true;
        let scope = activation.scope.clone();

        let mut fatal = None;
        for error in std::mem::take(&mut activation.errors) {
            match error {
                ProcessError::Runtime(message) if error_port => {
                    warn!(
                        node = %self.node,
                        seq,
                        error = %message,
                        "activation failed, sending to error port"
                    );
                    let ip = stamp_scope(Ip::data(json!({ "error": message })), scope.as_ref());
                    activation.packets.push((PortKey::new("error", None), ip));
                }
                error => {
                    fatal.get_or_insert(error);
                }
            }
        }

        if ordered && last && fatal.is_none() {
            let dangling = collect_dangling(
                &mut self.inports,
                &mut self.brackets,
                &self.forward_map,
                scope.as_ref(),
            );
            match dangling {
                Ok(frames) => activation.capture.closing_after.extend(frames),
                Err(error) => fatal = Some(error.into()),
            }
        }

        self.load = self.load.saturating_sub(1);
        self.trace(turn, ActivationKind::Deactivate, seq, scope.as_ref());
        if let Some(error) = fatal {
            return Err(self.escalate(error));
        }
        self.flush(turn)
    }

    /// Send every result allowed out by the current ordering mode.
    fn flush(&mut self, turn: &mut Turn<'_>) -> Result<(), NetworkError> {
        let ordered = self.is_ordered();
        while let Some(mut activation) = self.queue.pop_ready(ordered) {
            let forwarded =
                self.brackets.forward(&mut activation, &self.forward_map, &self.outports);
            let packets = match forwarded {
                Ok(packets) => packets,
                Err(error) => return Err(self.escalate(error.into())),
            };
            for (key, ip) in packets {
                let Some(outport) = self.outports.get_mut(&key.port) else {
                    continue;
                };
                if !outport.is_addressable() && !outport.is_attached(None) {
                    continue;
                }
                if let Err(error) = outport.send_ip(&mut *turn.sockets, ip, key.index) {
                    return Err(self.escalate(error));
                }
            }
            if !activation.brackets_only {
                *turn.in_flight = turn.in_flight.saturating_sub(1);
            }
        }
        Ok(())
    }
}

/// Pull closing brackets off the head of one forwarding buffer, popping
/// the matching open frames.
fn take_leading_closes(
    inports: &mut Ports<InPort>,
    brackets: &mut BracketState,
    key: &StackKey,
) -> Result<Vec<FrameId>, StructuralError> {
    let mut frames = Vec::new();
    let Some(inport) = inports.get_mut(&key.port) else {
        return Ok(frames);
    };
    while inport
        .peek(key.scope.as_ref(), key.index)
        .and_then(|buffer| buffer.front())
        .is_some_and(Ip::is_close)
    {
        let Some(close) = inport.take_front(key.scope.as_ref(), key.index) else {
            break;
        };
        let frame = brackets
            .pop_inbound(key)
            .ok_or_else(|| StructuralError::UnbalancedForward { port: key.port.clone() })?;
        brackets.close_frame(frame, close);
        frames.push(frame);
    }
    Ok(frames)
}

/// Closing brackets still buffered on any forwarding inport for `scope`
/// once the last activation is done.
fn collect_dangling(
    inports: &mut Ports<InPort>,
    brackets: &mut BracketState,
    forward: &ForwardMap,
    scope: Option<&Scope>,
) -> Result<Vec<FrameId>, StructuralError> {
    let mut frames = Vec::new();
    for key in brackets.inbound_keys() {
        if !forward.get(&key.port).is_some_and(|outs| !outs.is_empty()) {
            continue;
        }
        let scoped = inports.get(&key.port).is_some_and(InPort::is_scoped);
        let expected = if scoped { scope } else { None };
        if key.scope.as_ref() != expected {
            continue;
        }
        frames.extend(take_leading_closes(inports, brackets, &key)?);
    }
    Ok(frames)
}

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ipflow::{
    Component, ComponentLoader, Graph, GraphDefinition, InPort, Ip, Network, NetworkError,
    NetworkEvent, NetworkHandle, NetworkStatus, OutPort, OutputOrder, Outputs, ProcessError,
    RuntimeConfig, SocketEvent, StructuralError, ValidationError, graph::PortRef, launch,
    network::ActivationKind,
};
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

fn drain(rx: &mut UnboundedReceiver<SocketEvent>) -> Vec<SocketEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn lines(rx: &mut UnboundedReceiver<SocketEvent>) -> Vec<String> {
    drain(rx).iter().map(ToString::to_string).collect()
}

fn data(rx: &mut UnboundedReceiver<SocketEvent>) -> Vec<Value> {
    drain(rx)
        .into_iter()
        .filter_map(|event| match event {
            SocketEvent::Ip(ip) if ip.is_data() => Some(ip.into_value()),
            _ => None,
        })
        .collect()
}

async fn settle(handle: &NetworkHandle) -> Result<(), NetworkError> {
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("network did not settle in time")
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Appends its node id, prefixed by the activation scope.
fn append() -> Component {
    Component::from_fn(|ctx| {
        let Some(value) = ctx.input.get_data("in")? else {
            return Ok(());
        };
        let scope = ctx.scope().map(ToString::to_string).unwrap_or_default();
        let result = format!("{scope}{}{}", text(&value), ctx.node());
        ctx.output.send("out", result)
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out"))
}

fn merge() -> Component {
    Component::from_fn(|ctx| {
        if !ctx.input.has_data(["in1", "in2"])? {
            return Ok(());
        }
        let first = ctx.input.get_data("in1")?.unwrap_or_default();
        let second = ctx.input.get_data("in2")?.unwrap_or_default();
        let result = format!("{}:{}:{}", text(&first), text(&second), ctx.node());
        ctx.output.send("out", result)
    })
    .inport(InPort::new("in1"))
    .inport(InPort::new("in2").unscoped())
    .outport(OutPort::new("out"))
    .forward("in1", &["out"])
}

fn upper() -> Component {
    Component::from_fn(|ctx| {
        if let Some(value) = ctx.input.get_data("in")? {
            ctx.output.send("out", text(&value).to_uppercase())?;
        }
        Ok(())
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out"))
}

fn merge_graph() -> Graph {
    Graph::new("merge")
        .node("P1", append())
        .node("P2", append())
        .node("Merge", merge())
        .connect("P1", "out", "Merge", "in1")
        .connect("P2", "out", "Merge", "in2")
        .inport("IN1", "P1", "in")
        .inport("IN2", "P2", "in")
        .outport("OUT", "Merge", "out")
}

fn send_scoped_stream(handle: &NetworkHandle) -> Result<(), NetworkError> {
    handle.send_ip("IN1", Ip::open_bracket(1).with_scope(1u64))?;
    handle.send_ip("IN1", Ip::open_bracket("a").with_scope(1u64))?;
    handle.send_ip("IN1", Ip::data("baz").with_scope(1u64))?;
    handle.send_ip("IN1", Ip::close_bracket("a").with_scope(1u64))?;
    handle.send_ip("IN1", Ip::close_bracket(1).with_scope(1u64))
}

const MERGED: [&str; 7] = ["CONN", "< 1", "< a", "DATA 1bazP1:2fooP2:Merge", ">", ">", "DISC"];

#[tokio::test]
async fn merge_forwards_brackets_when_stream_arrives_first() {
    let (handle, mut outs) = launch(merge_graph(), &RuntimeConfig::default(), &["OUT"]).unwrap();
    let mut out = outs.remove("OUT").unwrap();

    send_scoped_stream(&handle).unwrap();
    handle.send_ip("IN2", Ip::data("foo").with_scope(2u64)).unwrap();
    settle(&handle).await.unwrap();

    assert_eq!(lines(&mut out), MERGED);
}

#[tokio::test]
async fn merge_forwards_brackets_when_unscoped_input_arrives_first() {
    let (handle, mut outs) = launch(merge_graph(), &RuntimeConfig::default(), &["OUT"]).unwrap();
    let mut out = outs.remove("OUT").unwrap();

    handle.send_ip("IN2", Ip::data("foo").with_scope(2u64)).unwrap();
    send_scoped_stream(&handle).unwrap();
    settle(&handle).await.unwrap();

    assert_eq!(lines(&mut out), MERGED);
}

#[tokio::test]
async fn required_inputs_in_different_scopes_never_fire() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let pair = Component::from_fn(move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        let values = ctx.input.get_data_many(["in1", "in2"])?;
        ctx.output.send("out", json!(values))
    })
    .inport(InPort::new("in1").required())
    .inport(InPort::new("in2").required())
    .outport(OutPort::new("out"));

    let graph = Graph::new("scopes")
        .node("Pair", pair)
        .inport("IN1", "Pair", "in1")
        .inport("IN2", "Pair", "in2")
        .outport("OUT", "Pair", "out");
    let (handle, mut outs) = launch(graph, &RuntimeConfig::default(), &["OUT"]).unwrap();
    let mut out = outs.remove("OUT").unwrap();

    handle.send_ip("IN1", Ip::data("x").with_scope(1u64)).unwrap();
    handle.send_ip("IN2", Ip::data("y").with_scope(2u64)).unwrap();
    settle(&handle).await.unwrap();

    assert_eq!(handle.status(), NetworkStatus::Complete);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(drain(&mut out).is_empty());
}

fn delayed_echo(order: Option<OutputOrder>) -> Component {
    let echo = Component::from_fn(|ctx| {
        let Some(value) = ctx.input.get_data("in")? else {
            return Ok(());
        };
        let delay = rand::rng().random_range(0..10u64);
        ctx.output.defer(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(Outputs::new().send("out", value))
        });
        Ok(())
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out"));
    match order {
        Some(order) => echo.ordering(order),
        None => echo,
    }
}

async fn run_echoes(order: Option<OutputOrder>) -> Vec<u64> {
    let graph = Graph::new("echo")
        .node("Echo", delayed_echo(order))
        .inport("IN", "Echo", "in")
        .outport("OUT", "Echo", "out");
    let (handle, mut outs) = launch(graph, &RuntimeConfig::default(), &["OUT"]).unwrap();
    let mut out = outs.remove("OUT").unwrap();

    for i in 0..=100u64 {
        handle.send("IN", i).unwrap();
    }
    settle(&handle).await.unwrap();

    data(&mut out).iter().filter_map(Value::as_u64).collect()
}

#[tokio::test]
async fn unordered_async_echoes_each_return_their_own_input() {
    let echoed = run_echoes(Some(OutputOrder::Unordered)).await;
    assert_eq!(echoed.len(), 101);
    assert_eq!(echoed.into_iter().collect::<BTreeSet<_>>(), (0..=100).collect());
}

#[tokio::test]
async fn ordered_async_echoes_keep_arrival_order() {
    let echoed = run_echoes(Some(OutputOrder::Ordered)).await;
    assert_eq!(echoed, (0..=100).collect::<Vec<_>>());
}

#[tokio::test]
async fn async_echoes_keep_arrival_order_by_default() {
    let echoed = run_echoes(None).await;
    assert_eq!(echoed, (0..=100).collect::<Vec<_>>());
}

fn failing(with_error_port: bool) -> Component {
    let component = Component::from_fn(|ctx| {
        if ctx.input.get_data("in")?.is_some() {
            return Err("boom".into());
        }
        Ok(())
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out"));
    if with_error_port {
        component.outport(OutPort::new("error"))
    } else {
        component
    }
}

#[tokio::test]
async fn runtime_errors_go_to_the_error_port() {
    let graph = Graph::new("errors")
        .node("Fail", failing(true))
        .inport("IN", "Fail", "in")
        .outport("OUT", "Fail", "out")
        .outport("ERR", "Fail", "error");
    let (handle, mut outs) = launch(graph, &RuntimeConfig::default(), &["OUT", "ERR"]).unwrap();

    handle.send("IN", 1).unwrap();
    settle(&handle).await.unwrap();

    assert_eq!(data(outs.get_mut("ERR").unwrap()), vec![json!({ "error": "boom" })]);
    assert!(drain(outs.get_mut("OUT").unwrap()).is_empty());
    assert_eq!(handle.status(), NetworkStatus::Complete);
}

#[tokio::test]
async fn runtime_errors_without_error_port_fail_the_network() {
    let graph = Graph::new("errors").node("Fail", failing(false)).inport("IN", "Fail", "in");
    let (handle, _) = launch(graph, &RuntimeConfig::default(), &[]).unwrap();
    let mut events = handle.subscribe();

    handle.send("IN", 1).unwrap();
    let err = settle(&handle).await.unwrap_err();

    assert_eq!(
        err,
        NetworkError::Component {
            node: "Fail".into(),
            error: ProcessError::Runtime("boom".into()),
        }
    );
    assert!(matches!(handle.status(), NetworkStatus::Failed(_)));

    let mut reported = None;
    while let Ok(event) = events.try_recv() {
        if let NetworkEvent::Error { node, .. } = event {
            reported = node;
        }
    }
    assert_eq!(reported.as_deref(), Some("Fail"));
}

fn panicking(with_error_port: bool) -> Component {
    let component = Component::from_fn(|ctx| {
        if ctx.input.get_data("in")?.is_some() {
            panic!("cannot handle this");
        }
        Ok(())
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out"));
    if with_error_port {
        component.outport(OutPort::new("error"))
    } else {
        component
    }
}

#[tokio::test]
async fn panicking_routine_reports_to_the_error_port() {
    let graph = Graph::new("panics")
        .node("Panic", panicking(true))
        .inport("IN", "Panic", "in")
        .outport("ERR", "Panic", "error");
    let (handle, mut outs) = launch(graph, &RuntimeConfig::default(), &["ERR"]).unwrap();

    handle.send("IN", 1).unwrap();
    settle(&handle).await.unwrap();

    assert_eq!(
        data(outs.get_mut("ERR").unwrap()),
        vec![json!({ "error": "activation panicked" })]
    );
    assert_eq!(handle.status(), NetworkStatus::Complete);
}

#[tokio::test]
async fn panicking_routine_without_error_port_fails_the_network() {
    let graph = Graph::new("panics").node("Panic", panicking(false)).inport("IN", "Panic", "in");
    let (handle, _) = launch(graph, &RuntimeConfig::default(), &[]).unwrap();

    handle.send("IN", 1).unwrap();
    assert_eq!(
        settle(&handle).await.unwrap_err(),
        NetworkError::Component {
            node: "Panic".into(),
            error: ProcessError::Runtime("activation panicked".into()),
        }
    );
}

#[tokio::test]
async fn unmatched_close_from_a_component_fails_naming_it() {
    let bad = Component::from_fn(|ctx| {
        if ctx.input.get_data("in")?.is_some() {
            ctx.output.send_ip("out", Ip::close_bracket("x"))?;
        }
        Ok(())
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out"));

    let graph = Graph::new("structural")
        .node("Bad", bad)
        .node("Up", upper())
        .connect("Bad", "out", "Up", "in")
        .inport("IN", "Bad", "in");
    let (handle, _) = launch(graph, &RuntimeConfig::default(), &[]).unwrap();

    handle.send("IN", 1).unwrap();
    let err = settle(&handle).await.unwrap_err();
    assert_eq!(
        err,
        NetworkError::Structural {
            node: "Bad".into(),
            error: StructuralError::UnmatchedCloseBracket { scope: None },
        }
    );
    assert_eq!(err.node(), Some("Bad"));
}

#[tokio::test]
async fn initial_packets_feed_components_and_control_ports_keep_their_value() {
    let repeat = Component::from_fn(|ctx| {
        let Some(value) = ctx.input.get_data("in")? else {
            return Ok(());
        };
        let times = ctx.input.get_data("times")?.and_then(|v| v.as_u64()).unwrap_or(1);
        for _ in 0..times {
            ctx.output.send("out", value.clone())?;
        }
        Ok(())
    })
    .inport(InPort::new("in"))
    .inport(InPort::new("times").control())
    .outport(OutPort::new("out"));

    let graph = Graph::new("repeat")
        .node("Repeat", repeat)
        .initial("Repeat", "times", 2)
        .inport("IN", "Repeat", "in")
        .outport("OUT", "Repeat", "out");
    let (handle, mut outs) = launch(graph, &RuntimeConfig::default(), &["OUT"]).unwrap();
    let mut out = outs.remove("OUT").unwrap();

    handle.send("IN", "a").unwrap();
    handle.send("IN", "b").unwrap();
    settle(&handle).await.unwrap();

    assert_eq!(data(&mut out), vec![json!("a"), json!("a"), json!("b"), json!("b")]);
}

#[tokio::test]
async fn initial_packets_alone_run_the_network_to_completion() {
    let graph = Graph::new("hello")
        .node("Up", upper())
        .initial("Up", "in", "hello")
        .outport("OUT", "Up", "out");
    let (handle, mut outs) = launch(graph, &RuntimeConfig::default(), &["OUT"]).unwrap();
    settle(&handle).await.unwrap();

    assert_eq!(lines(outs.get_mut("OUT").unwrap()), ["CONN", "DATA HELLO"]);
}

#[tokio::test]
async fn addressable_outport_routes_by_index() {
    let split = Component::from_fn(|ctx| {
        if let Some(value) = ctx.input.get_data("in")? {
            let index = (value.as_u64().unwrap_or_default() % 2) as usize;
            ctx.output.send_to("out", index, value)?;
        }
        Ok(())
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out").addressable());

    let mut graph = Graph::new("split").node("Split", split).inport("IN", "Split", "in");
    graph.outports.insert("EVEN".into(), PortRef::new("Split", "out").at(0));
    graph.outports.insert("ODD".into(), PortRef::new("Split", "out").at(1));
    let (handle, mut outs) =
        launch(graph, &RuntimeConfig::default(), &["EVEN", "ODD"]).unwrap();

    for i in 0..5 {
        handle.send("IN", i).unwrap();
    }
    settle(&handle).await.unwrap();

    assert_eq!(data(outs.get_mut("EVEN").unwrap()), vec![json!(0), json!(2), json!(4)]);
    assert_eq!(data(outs.get_mut("ODD").unwrap()), vec![json!(1), json!(3)]);
}

#[tokio::test]
async fn sending_to_addressable_port_without_index_is_fatal() {
    let bad = Component::from_fn(|ctx| {
        if let Some(value) = ctx.input.get_data("in")? {
            ctx.output.send("out", value)?;
        }
        Ok(())
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out").addressable());

    let graph = Graph::new("bad").node("Bad", bad).inport("IN", "Bad", "in");
    let (handle, _) = launch(graph, &RuntimeConfig::default(), &[]).unwrap();

    handle.send("IN", 1).unwrap();
    assert_eq!(
        settle(&handle).await.unwrap_err(),
        NetworkError::Validation {
            node: "Bad".into(),
            error: ValidationError::MissingIndex { port: "out".into() },
        }
    );
}

#[tokio::test]
async fn sending_to_an_unwired_index_is_fatal() {
    let stray = Component::from_fn(|ctx| {
        if let Some(value) = ctx.input.get_data("in")? {
            ctx.output.send_to("out", 5, value)?;
        }
        Ok(())
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out").addressable());

    let mut graph = Graph::new("stray").node("Stray", stray).inport("IN", "Stray", "in");
    graph.outports.insert("A".into(), PortRef::new("Stray", "out").at(0));
    let (handle, mut outs) = launch(graph, &RuntimeConfig::default(), &["A"]).unwrap();

    handle.send("IN", 1).unwrap();
    assert_eq!(
        settle(&handle).await.unwrap_err(),
        NetworkError::Validation {
            node: "Stray".into(),
            error: ValidationError::UnknownIndex { port: "out".into(), index: 5 },
        }
    );
    assert!(data(outs.get_mut("A").unwrap()).is_empty());
}

fn fan_out(clonable: bool) -> Graph {
    let source = Component::from_fn(move |ctx| {
        if let Some(value) = ctx.input.get_data("in")? {
            ctx.output.send_ip("out", Ip::data(json!({ "value": value })).clonable(clonable))?;
        }
        Ok(())
    })
    .inport(InPort::new("in"))
    .outport(OutPort::new("out"));

    Graph::new("fan")
        .node("Source", source)
        .inport("IN", "Source", "in")
        .outport("A", "Source", "out")
        .outport("B", "Source", "out")
}

async fn fan_out_packets(clonable: bool) -> (Ip, Ip) {
    let (handle, mut outs) =
        launch(fan_out(clonable), &RuntimeConfig::default(), &["A", "B"]).unwrap();
    handle.send("IN", 7).unwrap();
    settle(&handle).await.unwrap();

    let first = |rx: &mut UnboundedReceiver<SocketEvent>| {
        drain(rx)
            .into_iter()
            .find_map(|event| event.ip().filter(|ip| ip.is_data()).cloned())
            .unwrap()
    };
    let a = first(outs.get_mut("A").unwrap());
    let b = first(outs.get_mut("B").unwrap());
    (a, b)
}

#[tokio::test]
async fn fan_out_shares_payload_unless_clonable() {
    let (a, b) = fan_out_packets(false).await;
    assert_eq!(a.value(), &json!({ "value": 7 }));
    assert!(a.same_payload(&b));

    let (a, b) = fan_out_packets(true).await;
    assert_eq!(a.value(), b.value());
    assert!(!a.same_payload(&b));
}

#[tokio::test]
async fn brackets_from_two_forwarding_inputs_are_emitted_once() {
    let join = Component::from_fn(|ctx| {
        if !ctx.input.has_data(["in1", "in2"])? {
            return Ok(());
        }
        let a = ctx.input.get_data("in1")?.and_then(|v| v.as_i64()).unwrap_or_default();
        let b = ctx.input.get_data("in2")?.and_then(|v| v.as_i64()).unwrap_or_default();
        ctx.output.send("out", a + b)
    })
    .inport(InPort::new("in1"))
    .inport(InPort::new("in2"))
    .outport(OutPort::new("out"))
    .forward("in1", &["out"])
    .forward("in2", &["out"]);

    let graph = Graph::new("join")
        .node("Join", join)
        .inport("IN1", "Join", "in1")
        .inport("IN2", "Join", "in2")
        .outport("OUT", "Join", "out");
    let (handle, mut outs) = launch(graph, &RuntimeConfig::default(), &["OUT"]).unwrap();
    let mut out = outs.remove("OUT").unwrap();

    for (port, value) in [("IN1", 1), ("IN2", 2)] {
        handle.send_ip(port, Ip::open_bracket("g").with_scope("s")).unwrap();
        handle.send_ip(port, Ip::data(value).with_scope("s")).unwrap();
        handle.send_ip(port, Ip::close_bracket("g").with_scope("s")).unwrap();
    }
    settle(&handle).await.unwrap();

    assert_eq!(lines(&mut out), ["CONN", "< g", "DATA 3", ">", "DISC"]);
}

#[tokio::test]
async fn stop_waits_for_running_activations_and_reports_stopped() {
    let graph = Graph::new("slow")
        .node("Echo", delayed_echo(None))
        .inport("IN", "Echo", "in");
    let (handle, _) = launch(graph, &RuntimeConfig::default(), &[]).unwrap();
    let mut events = handle.subscribe();

    handle.send("IN", 1).unwrap();
    handle.stop().unwrap();
    settle(&handle).await.unwrap();

    assert_eq!(handle.status(), NetworkStatus::Stopped);
    assert!(!handle.is_running());

    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        stopped |= matches!(event, NetworkEvent::Stopped { .. });
    }
    assert!(stopped);
}

#[tokio::test]
async fn stopping_detaches_every_edge() {
    let graph = Graph::new("chain")
        .node("A", upper())
        .node("B", upper())
        .connect("A", "out", "B", "in")
        .inport("IN", "A", "in");
    let (handle, _) = launch(graph, &RuntimeConfig::default(), &[]).unwrap();
    let mut events = handle.subscribe();

    handle.stop().unwrap();
    settle(&handle).await.unwrap();
    assert_eq!(handle.status(), NetworkStatus::Stopped);

    let mut detached = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let NetworkEvent::PortDetached { node, port, socket, index } = event {
            detached.push((node, port, socket, index));
        }
    }
    assert_eq!(detached.len(), 2);
    assert_eq!((detached[0].0.as_str(), detached[0].1.as_str()), ("A", "out"));
    assert_eq!((detached[1].0.as_str(), detached[1].1.as_str()), ("B", "in"));
    assert_eq!(detached[0].2, detached[1].2);
    assert!(detached.iter().all(|(.., index)| *index == 0));
}

#[tokio::test]
async fn unknown_boundary_port_is_rejected_synchronously() {
    let graph = Graph::new("hello").node("Up", upper()).inport("IN", "Up", "in");
    let (handle, _) = launch(graph, &RuntimeConfig::default(), &[]).unwrap();

    assert_eq!(
        handle.send("NOPE", 1).unwrap_err(),
        NetworkError::Graph(ValidationError::UnknownBoundaryPort("NOPE".into()))
    );
    settle(&handle).await.unwrap();
}

#[tokio::test]
async fn unattached_required_port_refuses_to_build() {
    let graph = Graph::new("broken").node(
        "A",
        Component::from_fn(|_ctx| Ok(()))
            .inport(InPort::new("in").required())
            .outport(OutPort::new("out")),
    );
    let err = Network::new(graph, &RuntimeConfig::default()).unwrap_err();
    assert_eq!(
        err,
        NetworkError::Graph(ValidationError::RequiredNotAttached { port: "A.in".into() })
    );
}

#[tokio::test]
async fn activations_are_traced_as_events() {
    let graph = Graph::new("trace")
        .node("Up", upper())
        .inport("IN", "Up", "in")
        .outport("OUT", "Up", "out");
    let (handle, _outs) = launch(graph, &RuntimeConfig::default(), &["OUT"]).unwrap();
    let mut events = handle.subscribe();

    for word in ["a", "b", "c"] {
        handle.send("IN", word).unwrap();
    }
    settle(&handle).await.unwrap();

    let mut activate = 0;
    let mut deactivate = 0;
    while let Ok(event) = events.try_recv() {
        if let NetworkEvent::Activation(activation) = event {
            assert_eq!(activation.node, "Up");
            match activation.kind {
                ActivationKind::Activate => activate += 1,
                ActivationKind::Deactivate => deactivate += 1,
            }
        }
    }
    assert_eq!((activate, deactivate), (3, 3));
}

#[tokio::test]
async fn definitions_resolve_through_the_loader() {
    let loader = ComponentLoader::new();
    loader.register("text/Upper", upper);

    let definition = GraphDefinition::from_json(
        r#"{
            "name": "from-json",
            "nodes": { "Up": { "component": "text/Upper" } },
            "initials": [ { "target": { "node": "Up", "port": "in" }, "value": "json" } ],
            "outports": { "OUT": { "node": "Up", "port": "out" } }
        }"#,
    )
    .unwrap();

    let mut network =
        Network::from_definition(&definition, &loader, &RuntimeConfig::default()).unwrap();
    assert_eq!(network.name(), "from-json");
    let mut out = network.outport("OUT").unwrap();
    let handle = network.start();
    settle(&handle).await.unwrap();

    assert_eq!(data(&mut out), vec![json!("JSON")]);
}

//! Two endpoints negotiating a call through a real relay over WebSockets.

use std::time::Duration;

use beach_switchboard::{config::RelayConfig, serve};
use switchboard_client::{
    CallCommand, ControllerEvent, NegotiationController, RecordingEngine, SignalingConnection,
    TransportEngine,
};
use switchboard_core::{
    CallEndReason, ClientMessage, EndpointId, NetworkCandidate, ServerMessage, SignalDescription,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let config = RelayConfig {
        listen_addr: addr,
        offer_timeout: Some(Duration::from_secs(30)),
        idle_timeout: Duration::from_secs(120),
        sweep_interval: Duration::from_secs(30),
        shutdown_grace: Duration::from_secs(1),
    };
    tokio::spawn(serve(listener, config, None, std::future::pending()));
    addr
}

async fn connect(addr: std::net::SocketAddr) -> SignalingConnection {
    SignalingConnection::connect(&format!("ws://{addr}/ws"), WAIT)
        .await
        .expect("connect to relay")
}

async fn recv(inbound: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
    timeout(WAIT, inbound.recv())
        .await
        .expect("relay frame in time")
        .expect("relay still connected")
}

async fn recv_until<F>(
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
    mut wanted: F,
) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    loop {
        let message = recv(inbound).await;
        if wanted(&message) {
            return message;
        }
    }
}

/// Feeds relay frames into a hand-driven controller until one matches.
async fn pump_until<E, F>(
    controller: &mut NegotiationController<E>,
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
    mut wanted: F,
) -> ServerMessage
where
    E: TransportEngine,
    F: FnMut(&ServerMessage) -> bool,
{
    loop {
        let message = recv(inbound).await;
        controller
            .handle_server_message(message.clone())
            .await
            .expect("controller accepts relay frame");
        if wanted(&message) {
            return message;
        }
    }
}

async fn next_event<F>(
    events: &mut mpsc::UnboundedReceiver<ControllerEvent>,
    mut wanted: F,
) -> ControllerEvent
where
    F: FnMut(&ControllerEvent) -> bool,
{
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("controller event in time")
            .expect("controller running");
        if wanted(&event) {
            return event;
        }
    }
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("http connect");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("http write");
    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .expect("http response in time")
        .expect("http read");
    String::from_utf8_lossy(&response).into_owned()
}

fn candidate(n: u16) -> NetworkCandidate {
    NetworkCandidate::new(format!(
        "candidate:{n} 1 udp 2122260223 192.0.2.{n} 544{n:02} typ host"
    ))
    .with_mid("0", 0)
}

#[test_timeout::tokio_timeout_test(30)]
async fn call_setup_buffers_early_candidate_until_answer() {
    let addr = start_relay().await;
    let alice = EndpointId::from("alice");
    let bob = EndpointId::from("bob");

    // Alice runs the full controller loop.
    let (alice_out, alice_in) = connect(addr).await.into_parts();
    let (alice_engine, alice_engine_events) = RecordingEngine::new("alice");
    let (alice_controller, mut alice_events) =
        NegotiationController::new(alice_engine.clone(), alice_out);
    alice_controller.register(Some(alice.clone())).unwrap();
    let (alice_commands, alice_commands_rx) = mpsc::unbounded_channel();
    let (alice_stop, alice_stop_rx) = oneshot::channel();
    let alice_task = tokio::spawn(alice_controller.run(
        alice_in,
        alice_engine_events,
        alice_commands_rx,
        alice_stop_rx,
    ));
    next_event(&mut alice_events, |event| {
        matches!(event, ControllerEvent::Registered(id) if id == &alice)
    })
    .await;

    // Bob is driven by hand so the test decides when he answers.
    let (bob_out, mut bob_in) = connect(addr).await.into_parts();
    let (bob_engine, _bob_engine_events) = RecordingEngine::new("bob");
    let (mut bob_controller, _bob_events) = NegotiationController::new(bob_engine.clone(), bob_out);
    bob_controller.register(Some(bob.clone())).unwrap();
    pump_until(&mut bob_controller, &mut bob_in, |message| {
        matches!(message, ServerMessage::UserList { users } if users.len() == 2)
    })
    .await;
    assert_eq!(bob_controller.local_id(), Some(&bob));
    assert_eq!(bob_controller.peers(), &[alice.clone()]);

    next_event(&mut alice_events, |event| {
        matches!(event, ControllerEvent::PeersChanged(peers) if peers == &vec![bob.clone()])
    })
    .await;

    alice_commands.send(CallCommand::Call(bob.clone())).unwrap();
    let incoming = pump_until(&mut bob_controller, &mut bob_in, |message| {
        matches!(message, ServerMessage::CallIncoming { .. })
    })
    .await;
    let ServerMessage::CallIncoming { from, signal } = incoming else {
        unreachable!()
    };
    assert_eq!(from, alice);
    assert!(signal.is_offer());
    assert_eq!(Some(signal), alice_engine.local_description());
    assert_eq!(bob_controller.pending_caller(), Some(&alice));

    // Alice discovers a candidate before Bob has answered.
    alice_engine.discover_candidate(candidate(1));
    pump_until(&mut bob_controller, &mut bob_in, |message| {
        matches!(message, ServerMessage::NewIceCandidate { .. })
    })
    .await;
    assert_eq!(bob_controller.buffered_candidates(&alice), 1);
    assert!(bob_engine.applied_candidates().is_empty());

    bob_controller.answer_call().await.unwrap();
    assert_eq!(bob_engine.applied_candidates(), vec![candidate(1)]);
    assert_eq!(bob_controller.buffered_candidates(&alice), 0);

    next_event(&mut alice_events, |event| {
        matches!(event, ControllerEvent::CallConnected { peer } if peer == &bob)
    })
    .await;
    let answer: Option<SignalDescription> = bob_engine.local_description();
    assert!(answer.as_ref().is_some_and(SignalDescription::is_answer));
    assert_eq!(alice_engine.remote_description(), answer);

    // Later candidates go straight through, after the buffered one.
    alice_engine.discover_candidate(candidate(2));
    pump_until(&mut bob_controller, &mut bob_in, |message| {
        matches!(message, ServerMessage::NewIceCandidate { .. })
    })
    .await;
    assert_eq!(bob_engine.applied_candidates(), vec![candidate(1), candidate(2)]);

    let stats = http_get(addr, "/debug/stats").await;
    assert!(stats.contains("\"established\""), "stats: {stats}");
    let health = http_get(addr, "/healthz").await;
    assert!(health.starts_with("HTTP/1.1 200"), "health: {health}");

    // Alice leaving hangs up; Bob hears about it.
    alice_stop.send(()).unwrap();
    alice_task.await.unwrap();
    let ended = pump_until(&mut bob_controller, &mut bob_in, |message| {
        matches!(message, ServerMessage::CallEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        ServerMessage::CallEnded {
            peer: alice.clone(),
            reason: CallEndReason::HungUp,
        }
    );
    assert_eq!(bob_controller.active_peer(), None);
    assert_eq!(bob_engine.sessions_closed(), 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn dropped_caller_aborts_pending_offer_once() {
    let addr = start_relay().await;
    let carol = EndpointId::from("carol");
    let dave = EndpointId::from("dave");

    let caller = connect(addr).await;
    caller
        .outbound
        .send(ClientMessage::Register {
            id: Some(carol.clone()),
        })
        .unwrap();
    let (dave_out, mut dave_in) = connect(addr).await.into_parts();
    dave_out
        .send(ClientMessage::Register {
            id: Some(dave.clone()),
        })
        .unwrap();
    recv_until(&mut dave_in, |message| {
        matches!(message, ServerMessage::UserList { users } if users.len() == 2)
    })
    .await;

    caller
        .outbound
        .send(ClientMessage::CallUser {
            target: dave.clone(),
            signal: SignalDescription::offer("v=0\r\no=carol 1 1 IN IP4 127.0.0.1\r\n"),
        })
        .unwrap();
    let incoming = recv_until(&mut dave_in, |message| {
        matches!(message, ServerMessage::CallIncoming { .. })
    })
    .await;
    assert!(matches!(incoming, ServerMessage::CallIncoming { from, .. } if from == carol));

    caller.abort();

    let mut ended = Vec::new();
    let mut roster = None;
    while roster.is_none() || ended.is_empty() {
        match recv(&mut dave_in).await {
            ServerMessage::UserList { users } => roster = Some(users),
            message @ ServerMessage::CallEnded { .. } => ended.push(message),
            _ => {}
        }
    }
    assert_eq!(roster, Some(vec![dave.clone()]));

    // nothing else trickles in afterwards
    dave_out.send(ClientMessage::Ping).unwrap();
    loop {
        match recv(&mut dave_in).await {
            ServerMessage::Pong => break,
            message @ ServerMessage::CallEnded { .. } => ended.push(message),
            _ => {}
        }
    }
    assert_eq!(
        ended,
        vec![ServerMessage::CallEnded {
            peer: carol,
            reason: CallEndReason::PeerDisconnected,
        }]
    );
}

#[test_timeout::tokio_timeout_test(30)]
async fn relay_refuses_duplicates_and_unregistered_signaling() {
    let addr = start_relay().await;
    let erin = EndpointId::from("erin");

    let (first_out, mut first_in) = connect(addr).await.into_parts();
    first_out
        .send(ClientMessage::Register {
            id: Some(erin.clone()),
        })
        .unwrap();
    assert_eq!(
        recv(&mut first_in).await,
        ServerMessage::Registered { id: erin.clone() }
    );

    let (second_out, mut second_in) = connect(addr).await.into_parts();
    second_out
        .send(ClientMessage::CallUser {
            target: erin.clone(),
            signal: SignalDescription::offer("v=0\r\n"),
        })
        .unwrap();
    assert!(matches!(
        recv(&mut second_in).await,
        ServerMessage::Error { message } if message.contains("register")
    ));

    second_out
        .send(ClientMessage::Register {
            id: Some(erin.clone()),
        })
        .unwrap();
    assert!(matches!(
        recv(&mut second_in).await,
        ServerMessage::Error { message } if message.contains("already registered")
    ));

    // without a requested id the relay assigns one
    second_out.send(ClientMessage::Register { id: None }).unwrap();
    let assigned = recv_until(&mut second_in, |message| {
        matches!(message, ServerMessage::Registered { .. })
    })
    .await;
    let ServerMessage::Registered { id } = assigned else {
        unreachable!()
    };
    assert_ne!(id, erin);
    assert_eq!(
        recv(&mut second_in).await,
        ServerMessage::UserList {
            users: vec![erin, id],
        }
    );
}

#[test_timeout::tokio_timeout_test(30)]
async fn taken_identity_reaches_the_controller_as_a_relay_error() {
    let addr = start_relay().await;
    let frank = EndpointId::from("frank");

    let (holder_out, mut holder_in) = connect(addr).await.into_parts();
    holder_out
        .send(ClientMessage::Register {
            id: Some(frank.clone()),
        })
        .unwrap();
    assert_eq!(
        recv(&mut holder_in).await,
        ServerMessage::Registered { id: frank.clone() }
    );

    let (outbound, inbound) = connect(addr).await.into_parts();
    let (engine, engine_events) = RecordingEngine::new("second");
    let (controller, mut events) = NegotiationController::new(engine, outbound);
    controller.register(Some(frank.clone())).unwrap();
    let (_commands, commands_rx) = mpsc::unbounded_channel();
    let (stop, stop_rx) = oneshot::channel();
    let task = tokio::spawn(controller.run(inbound, engine_events, commands_rx, stop_rx));

    // well inside any client deadline, the refusal is visible
    let refused = next_event(&mut events, |event| {
        matches!(event, ControllerEvent::RelayError(_))
    })
    .await;
    assert!(matches!(
        refused,
        ControllerEvent::RelayError(message) if message.contains("already registered")
    ));

    stop.send(()).unwrap();
    task.await.unwrap();
}

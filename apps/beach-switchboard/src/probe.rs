use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use switchboard_client::{
    CallCommand, ControllerEvent, NegotiationController, RecordingEngine, SignalingConnection,
};
use switchboard_core::EndpointId;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::config::ProbeArgs;

/// How a probe call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Registered {
        id: EndpointId,
        peers: Vec<EndpointId>,
    },
    Connected {
        id: EndpointId,
        peer: EndpointId,
    },
}

/// Connects to a relay, registers, and optionally places a call with a
/// synthetic engine. Prints what happened.
pub async fn run_probe(args: ProbeArgs) -> Result<()> {
    match probe(&args).await? {
        ProbeOutcome::Registered { id, peers } => {
            println!("registered as {id}");
            if peers.is_empty() {
                println!("no other endpoints online");
            } else {
                println!("online:");
                for peer in peers {
                    println!("  {peer}");
                }
            }
        }
        ProbeOutcome::Connected { id, peer } => {
            println!("registered as {id}");
            println!("call to {peer} accepted");
        }
    }
    Ok(())
}

pub async fn probe(args: &ProbeArgs) -> Result<ProbeOutcome> {
    let wait = Duration::from_secs(args.wait_secs);
    let deadline = Instant::now() + wait;
    let connection = SignalingConnection::connect(&args.url, wait)
        .await
        .with_context(|| format!("failed to reach relay at {}", args.url))?;
    let (outbound, inbound) = connection.into_parts();

    let (engine, engine_events) = RecordingEngine::new("probe");
    let (controller, mut events) = NegotiationController::new(engine, outbound);
    controller.register(args.id.clone().map(EndpointId::from))?;

    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = oneshot::channel();
    let driver = tokio::spawn(controller.run(inbound, engine_events, commands_rx, shutdown_rx));

    let outcome = drive(args, deadline, &commands, &mut events).await;

    let _ = shutdown.send(());
    let _ = driver.await;
    outcome
}

async fn drive(
    args: &ProbeArgs,
    deadline: Instant,
    commands: &mpsc::UnboundedSender<CallCommand>,
    events: &mut mpsc::UnboundedReceiver<ControllerEvent>,
) -> Result<ProbeOutcome> {
    let id = loop {
        match next_event(deadline, events, "registration").await? {
            ControllerEvent::Registered(id) => break id,
            other => debug!(?other, "event before registration"),
        }
    };
    let peers = loop {
        if let ControllerEvent::PeersChanged(peers) =
            next_event(deadline, events, "user list").await?
        {
            break peers;
        }
    };

    let Some(target) = args.call.clone().map(EndpointId::from) else {
        return Ok(ProbeOutcome::Registered { id, peers });
    };

    commands
        .send(CallCommand::Call(target.clone()))
        .map_err(|_| anyhow!("controller stopped before the call was placed"))?;
    loop {
        match next_event(deadline, events, "call outcome").await? {
            ControllerEvent::CallConnected { peer } if peer == target => {
                let _ = commands.send(CallCommand::HangUp);
                return Ok(ProbeOutcome::Connected { id, peer });
            }
            ControllerEvent::CallFailed { peer, error } if peer == target => {
                bail!("call to {peer} failed: {error}");
            }
            ControllerEvent::CallEnded { peer, reason } if peer == target => {
                bail!("call to {peer} ended before connecting ({reason:?})");
            }
            other => debug!(?other, "ignoring event while calling"),
        }
    }
}

async fn next_event(
    deadline: Instant,
    events: &mut mpsc::UnboundedReceiver<ControllerEvent>,
    waiting_for: &str,
) -> Result<ControllerEvent> {
    match timeout_at(deadline, events.recv()).await {
        Ok(Some(ControllerEvent::RelayError(message))) => {
            bail!("relay refused us while waiting for {waiting_for}: {message}")
        }
        Ok(Some(event)) => Ok(event),
        Ok(None) => bail!("relay connection closed while waiting for {waiting_for}"),
        Err(_) => bail!("timed out waiting for {waiting_for}"),
    }
}

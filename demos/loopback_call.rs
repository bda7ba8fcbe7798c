//! Loopback Call Example
//!
//! Runs two call sessions ("alice" and "bob") in one process, paired by the
//! in-process relay and connected through real webrtc-rs peer connections.
//!
//! Usage:
//!   cargo run --example loopback_call            # alice calls bob
//!   cargo run --example loopback_call -- --glare # both call at once
//!
//! Set RUST_LOG=debug to watch the negotiation (glare resolution, stale
//! messages being discarded).

use std::error::Error;
use std::sync::Arc;

use peer_call::{
    CallConfig, LoopbackRelay, RtcEngineFactory, SessionController, SessionEvent,
    SyntheticMediaSource,
};
use tokio::sync::mpsc;

fn session_config(client_id: &str) -> CallConfig {
    CallConfig {
        client_id: client_id.to_string(),
        // Host candidates are enough inside one process
        ice_servers: Vec::new(),
        ..CallConfig::default()
    }
}

fn print_event(who: &str, event: &SessionEvent) {
    match event {
        SessionEvent::Waiting => println!("[{}] waiting for a partner", who),
        SessionEvent::Matched { partner, role } => {
            println!("[{}] matched with {} ({})", who, partner, role)
        }
        SessionEvent::PartnerLeft { partner } => println!("[{}] {} left", who, partner),
        SessionEvent::IncomingCall { from } => println!("[{}] incoming call from {}", who, from),
        SessionEvent::StateChanged { partner, state } => {
            println!("[{}] negotiation with {}: {}", who, partner, state)
        }
        SessionEvent::RemoteTrack { partner, track } => {
            println!("[{}] receiving {} track {} from {}", who, track.kind, track.id, partner)
        }
        SessionEvent::CallFailed { error, .. } => println!("[{}] call failed: {}", who, error),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let glare = std::env::args().any(|a| a == "--glare");

    println!("peer-call loopback");
    println!("==================");
    println!();
    println!("Press Ctrl+C to stop.");
    println!();

    // Setup Ctrl+C handler
    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        println!("\nStopping...");
        let _ = stop_tx.send(());
    })?;

    let relay = LoopbackRelay::new();
    let engines = Arc::new(RtcEngineFactory::new(Vec::new())?);

    let alice_transport = Arc::new(relay.connect("alice"));
    let bob_transport = Arc::new(relay.connect("bob"));

    let (alice, mut alice_events) = SessionController::new(
        session_config("alice"),
        alice_transport.clone(),
        Arc::new(SyntheticMediaSource::new("alice")),
        engines.clone(),
    )?;
    let (bob, mut bob_events) = SessionController::new(
        session_config("bob"),
        bob_transport.clone(),
        Arc::new(SyntheticMediaSource::new("bob")),
        engines,
    )?;

    let alice_handle = alice.handle();
    let bob_handle = bob.handle();
    let alice_task = tokio::spawn(alice.run());
    let bob_task = tokio::spawn(bob.run());

    alice_transport.join();
    bob_transport.join();

    loop {
        tokio::select! {
            Some(event) = alice_events.recv() => {
                print_event("alice", &event);
                if let SessionEvent::Matched { .. } = event {
                    alice_handle.initiate_call()?;
                }
            }
            Some(event) = bob_events.recv() => {
                print_event("bob", &event);
                if let (SessionEvent::Matched { .. }, true) = (&event, glare) {
                    bob_handle.initiate_call()?;
                }
            }
            _ = stop_rx.recv() => break,
        }
    }

    relay.leave("alice");
    let _ = alice_handle.shutdown();
    let _ = bob_handle.shutdown();
    let _ = alice_task.await;
    let _ = bob_task.await;

    println!("Done.");
    Ok(())
}

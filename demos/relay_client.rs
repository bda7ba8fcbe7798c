//! Relay Client Example
//!
//! Connects to a matchmaking relay over WebSocket and takes part in a call
//! with whoever the relay pairs us with.
//!
//! Usage:
//!   PEER_CALL_RELAY_URL=ws://localhost:8000/ws cargo run --example relay_client -- --call
//!
//! Options:
//!   --call      Call the partner as soon as the relay matches us
//!   --manual    Do not answer incoming calls automatically; accept with Enter
//!
//! Type `s` and Enter during a call to send another set of streams.
//!
//! Other settings come from PEER_CALL_* environment variables (see CallConfig).

use std::error::Error;
use std::sync::Arc;

use peer_call::{
    CallConfig, RtcEngineFactory, SessionController, SessionEvent, SyntheticMediaSource,
    WsSignalingTransport,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let call_on_match = args.iter().any(|a| a == "--call");
    let manual = args.iter().any(|a| a == "--manual");

    let mut config = CallConfig::from_env()?;
    if manual {
        config.auto_accept = false;
    }

    println!("peer-call relay client");
    println!("  relay:     {}", config.relay_url);
    println!("  client id: {}", config.client_id);
    println!();

    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        println!("\nStopping...");
        let _ = stop_tx.send(());
    })?;

    let transport = Arc::new(WsSignalingTransport::connect(&config.relay_url).await?);
    let engines = Arc::new(RtcEngineFactory::new(config.ice_servers.clone())?);
    let media = Arc::new(SyntheticMediaSource::new(&config.client_id));

    let (session, mut events) = SessionController::new(config, transport.clone(), media, engines)?;
    let handle = session.handle();
    let session_task = tokio::spawn(session.run());

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    SessionEvent::Matched { partner, role } => {
                        println!("Matched with {} ({})", partner, role);
                        if call_on_match {
                            handle.initiate_call()?;
                        }
                    }
                    SessionEvent::IncomingCall { from } => {
                        println!("Incoming call from {}, press Enter to accept", from);
                    }
                    other => println!("{:?}", other),
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim() == "s" => handle.send_streams()?,
                    Ok(Some(_)) if manual => handle.accept_incoming_call()?,
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            _ = stop_rx.recv() => break,
        }
    }

    let _ = handle.shutdown();
    transport.close();
    let _ = session_task.await;
    Ok(())
}

//! Line-oriented phone console and the two-party demo.
//!
//! Commands are read from stdin on the same task that prints the call
//! event stream, so output appears in the order things happen.

mod command;
pub mod demo;

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::calling::{
    CallEvent, CallHandle, CallSnapshot, Collaborators, LogNotifier, Orchestrator,
    StaticPermission, SyntheticMediaEngine,
};
use crate::config::{Config, StoreBackend};
use crate::models::CallStatus;
use crate::store::firestore::FirestoreStore;
use crate::store::{DocumentStore, MemoryStore};

pub use command::{ParseError, PhoneCommand, HELP};

const MEDIA_PORT: u16 = 40000;

/// Build the configured document store.
pub fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store: only this process can be reached");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Firestore => {
            let firestore = config.firestore()?;
            tracing::info!(
                "Signaling via Firestore project {} ({})",
                firestore.project_id,
                firestore.database
            );
            Ok(Arc::new(FirestoreStore::new(firestore)))
        }
    }
}

/// Interactive phone for the configured identity.
pub async fn run_phone(config: &Config) -> Result<()> {
    let identity = config.require_identity()?;
    let store = open_store(config)?;

    let orchestrator = Orchestrator::new(
        identity,
        Collaborators {
            store,
            media: Arc::new(SyntheticMediaEngine::new(identity, MEDIA_PORT)),
            permission: Arc::new(StaticPermission::new(config.calls.auto_grant_microphone)),
            notifier: Arc::new(LogNotifier),
        },
        config.call_options(),
    );
    let mut events = BroadcastStream::new(orchestrator.subscribe());
    let (handle, task) = orchestrator.spawn();

    println!("peercall: signed in as {}", identity);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match PhoneCommand::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(PhoneCommand::Quit)) => break,
                    Ok(Some(cmd)) => execute(&handle, cmd).await,
                    Err(e) => println!("! {}", e),
                }
            }
            event = events.next() => match event {
                Some(Ok(event)) => println!("{}", render_event(&event)),
                Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                    tracing::warn!("Skipped {} call events", n);
                }
                None => break,
            },
        }
    }

    handle.shutdown();
    if let Err(e) = task.await {
        tracing::error!("Call task failed: {}", e);
    }
    Ok(())
}

async fn execute(handle: &CallHandle, cmd: PhoneCommand) {
    // Refusals also arrive as notices on the event stream.
    let result = match cmd {
        PhoneCommand::Call(peer) => handle.start_call(&peer).await.map(|id| {
            tracing::debug!("Placed call {}", id);
        }),
        PhoneCommand::Accept => handle.accept_call().await,
        PhoneCommand::Reject => handle.reject_call().await,
        PhoneCommand::Hangup => handle.end_call().await,
        PhoneCommand::Mute => handle.set_muted(true).await,
        PhoneCommand::Unmute => handle.set_muted(false).await,
        PhoneCommand::Speaker(Some(on)) => handle.set_speaker(on).await,
        PhoneCommand::Speaker(None) => match handle.snapshot().await {
            Ok(snap) => handle.set_speaker(!snap.speaker).await,
            Err(e) => Err(e),
        },
        PhoneCommand::Status => handle.snapshot().await.map(|snap| {
            println!("{}", render_snapshot(&snap));
        }),
        PhoneCommand::Help => {
            println!("{}", HELP);
            Ok(())
        }
        PhoneCommand::Quit => Ok(()),
    };
    if let Err(e) = result {
        tracing::debug!("Command failed: {}", e);
    }
}

pub fn render_event(event: &CallEvent) -> String {
    match event {
        CallEvent::State(snap) => render_snapshot(snap),
        CallEvent::Notice(e) => format!("! {}", e),
        CallEvent::TransportError(msg) => format!("! signaling: {}", msg),
    }
}

pub fn render_snapshot(snap: &CallSnapshot) -> String {
    let mut line = format!("[{}]", snap.status);
    if let Some(ref session) = snap.session {
        let verb = match snap.status {
            CallStatus::Ringing => "from",
            _ => "with",
        };
        line.push_str(&format!(" {} {} ({})", verb, session.peer_id(), session.call_id));
    }
    if snap.muted {
        line.push_str(" muted");
    }
    if snap.speaker {
        line.push_str(" speaker");
    }
    line
}

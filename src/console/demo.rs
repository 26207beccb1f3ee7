//! Two parties on one in-process store placing a call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;

use crate::calling::signaling::call_path;
use crate::calling::{
    CallEvent, CallHandle, CallOptions, Collaborators, LogNotifier, Orchestrator,
    StaticPermission, SyntheticMediaEngine,
};
use crate::models::{CallId, CallStatus, SignalingMessage};
use crate::store::{DocumentStore, MemoryStore};

const CALLER: &str = "alice";
const CALLEE: &str = "bob";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default)]
pub struct DemoOptions {
    /// Replay the offer while ringing and again after the call.
    pub redeliver: bool,
    /// The caller hangs up while the callee is still ringing.
    pub caller_hangs_up: bool,
}

#[derive(Debug, Clone)]
pub struct DemoReport {
    pub call_id: CallId,
    pub caller: Vec<CallStatus>,
    pub callee: Vec<CallStatus>,
    /// Ringing snapshots the callee produced.
    pub rings: usize,
}

struct Party {
    name: &'static str,
    handle: CallHandle,
    events: broadcast::Receiver<CallEvent>,
    seen: Vec<CallStatus>,
}

impl Party {
    fn start(store: &Arc<MemoryStore>, name: &'static str, port: u16) -> Self {
        let store: Arc<dyn DocumentStore> = store.clone();
        let orchestrator = Orchestrator::new(
            name,
            Collaborators {
                store,
                media: Arc::new(SyntheticMediaEngine::new(name, port)),
                permission: Arc::new(StaticPermission::new(true)),
                notifier: Arc::new(LogNotifier),
            },
            CallOptions::default(),
        );
        let events = orchestrator.subscribe();
        let (handle, _task) = orchestrator.spawn();
        Self {
            name,
            handle,
            events,
            seen: Vec::new(),
        }
    }

    fn record(&mut self, event: CallEvent) -> Option<CallStatus> {
        match event {
            CallEvent::State(snap) => {
                tracing::info!("{}: {}", self.name, snap.status);
                self.seen.push(snap.status);
                Some(snap.status)
            }
            CallEvent::Notice(e) => {
                tracing::warn!("{}: {}", self.name, e);
                None
            }
            CallEvent::TransportError(e) => {
                tracing::warn!("{}: signaling error: {}", self.name, e);
                None
            }
        }
    }

    async fn wait_for(&mut self, status: CallStatus) -> Result<()> {
        let name = self.name;
        timeout(STEP_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        if self.record(event) == Some(status) {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Lagged(n)) => tracing::warn!("{}: skipped {} events", name, n),
                    Err(RecvError::Closed) => bail!("{} stopped", name),
                }
            }
        })
        .await
        .with_context(|| format!("{} never reached {}", name, status))?
    }

    /// Record whatever arrives within a short window.
    async fn settle(&mut self) {
        let _ = timeout(SETTLE, async {
            while let Ok(event) = self.events.recv().await {
                self.record(event);
            }
        })
        .await;
    }

    fn count(&self, status: CallStatus) -> usize {
        self.seen.iter().filter(|s| **s == status).count()
    }
}

pub async fn run_demo(options: DemoOptions) -> Result<DemoReport> {
    let store = Arc::new(MemoryStore::new());
    let mut caller = Party::start(&store, CALLER, 40000);
    let mut callee = Party::start(&store, CALLEE, 40002);

    let call_id = caller.handle.start_call(CALLEE).await?;
    tracing::info!("{} dialed {} ({})", CALLER, CALLEE, call_id);
    callee.wait_for(CallStatus::Ringing).await?;

    if options.redeliver {
        store.redeliver(&call_path(&call_id));
        store.redeliver(&call_path(&call_id));
        callee.settle().await;
    }

    if options.caller_hangs_up {
        // Give up before the callee answers.
        caller.handle.end_call().await?;
        callee.wait_for(CallStatus::Ended).await?;
    } else {
        callee.handle.accept_call().await?;
        caller.wait_for(CallStatus::Connected).await?;
        callee.wait_for(CallStatus::Connected).await?;
        callee.handle.end_call().await?;
        caller.wait_for(CallStatus::Ended).await?;
    }
    caller.wait_for(CallStatus::Idle).await?;
    callee.wait_for(CallStatus::Idle).await?;

    if options.redeliver {
        let stale = SignalingMessage::offer(CALLER, CALLEE, "v=0", 0);
        store.set(&call_path(&call_id), stale.to_map()).await?;
        callee.settle().await;
        if !callee.handle.was_processed(&call_id) {
            bail!("{} forgot call {}", CALLEE, call_id);
        }
    }

    caller.handle.shutdown();
    callee.handle.shutdown();

    let rings = callee.count(CallStatus::Ringing);
    Ok(DemoReport {
        call_id,
        caller: caller.seen,
        callee: callee.seen,
        rings,
    })
}

mod admission;
mod availability;
mod busy;
mod error;
mod hierarchy;
mod lifecycle;
mod mutations;
mod queries;
mod series;
mod slots;
mod store;

pub use availability::{free_windows, merge, merge_spans, subtract_intervals};
pub use error::EngineError;
pub use slots::{Slots, slots};
pub use store::{InMemoryStore, Link, SharedNode};

use std::path::Path;
use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard};
use tracing::{info, warn};

use crate::calendar::now_ms;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Wal, WalError};

const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<Result<(), String>>,
    },
    Compact {
        response: oneshot::Sender<Result<usize, String>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, mut batch: Vec<(Event, oneshot::Sender<Result<(), String>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // The batch commits as a whole or not at all.
    let result = match appended.and_then(|()| wal.flush_sync()) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("journal flush failed: {e}");
            if let Err(discard) = wal.discard_pending() {
                warn!("could not roll back failed batch: {discard}");
            }
            Err(e.to_string())
        }
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let _ = tx.send(result.clone());
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let result = compact(wal).map_err(|e| e.to_string());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Rebuild state from the journal itself and rewrite it as a snapshot. Runs on
/// the writer task, so no append can slip between reading and swapping.
fn compact(wal: &mut Wal) -> Result<usize, EngineError> {
    wal.flush_sync()?;
    let replay = Wal::replay(wal.path())?;
    let before = replay.events.len();
    let scratch = InMemoryStore::new();
    for event in &replay.events {
        scratch.replay_event(event)?;
    }
    let events = scratch.snapshot_events()?;
    Wal::write_compact_file(wal.path(), &events)?;
    wal.swap_compact_file()?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!(before, after = events.len(), "journal compacted");
    Ok(events.len())
}

impl From<WalError> for EngineError {
    fn from(e: WalError) -> Self {
        EngineError::Journal(e.to_string())
    }
}

/// Journals an event, then applies it to memory and publishes it.
///
/// Every commit runs on its own task that owns the node guards, so a caller
/// dropping its future mid-commit cannot leave the journal and memory apart.
#[derive(Clone)]
pub(super) struct Committer {
    store: Arc<InMemoryStore>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
}

impl Committer {
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(EngineError::Journal)
    }

    async fn detached<F>(&self, commit: F) -> Result<(), EngineError>
    where
        F: std::future::Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        tokio::spawn(commit)
            .await
            .map_err(|e| EngineError::Journal(format!("commit task failed: {e}")))?
    }

    /// Journal + apply to one write-locked node. `held` (ancestor guards)
    /// is released only after the apply.
    pub(super) async fn apply<H: Send + 'static>(
        &self,
        mut node: OwnedRwLockWriteGuard<NodeState>,
        event: Event,
        held: H,
    ) -> Result<(), EngineError> {
        let this = self.clone();
        self.detached(async move {
            this.wal_append(&event).await?;
            this.store.apply_event(&mut node, &event);
            drop(node);
            drop(held);
            this.notify.send(&event, now_ms());
            Ok(())
        })
        .await
    }

    /// Journal + insert a new node while `held` (the parent guard) pins the parent.
    pub(super) async fn insert<H: Send + 'static>(
        &self,
        node: NodeState,
        event: Event,
        held: H,
    ) -> Result<(), EngineError> {
        let this = self.clone();
        self.detached(async move {
            this.wal_append(&event).await?;
            this.store.insert_node(node);
            drop(held);
            metrics::gauge!(crate::observability::NODES_ACTIVE).set(this.store.node_count() as f64);
            this.notify.send(&event, now_ms());
            Ok(())
        })
        .await
    }

    /// Journal + remove a whole subtree whose nodes are all write-locked.
    pub(super) async fn remove(
        &self,
        nodes: Vec<OwnedRwLockWriteGuard<NodeState>>,
        event: Event,
    ) -> Result<(), EngineError> {
        let this = self.clone();
        self.detached(async move {
            this.wal_append(&event).await?;
            for node in &nodes {
                this.store.remove_node(node);
                this.notify.remove(&node.id);
            }
            drop(nodes);
            metrics::gauge!(crate::observability::NODES_ACTIVE).set(this.store.node_count() as f64);
            this.notify.send(&event, now_ms());
            Ok(())
        })
        .await
    }
}

pub struct Engine {
    pub(super) store: Arc<InMemoryStore>,
    pub(super) committer: Committer,
    pub notify: Arc<NotifyHub>,
    pub(super) tz: Tz,
    /// Serializes node creation so id uniqueness and the node limit hold.
    pub(super) creation: Arc<Mutex<()>>,
}

impl Engine {
    /// Open the journal at `journal_path`, replay it, and start the writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(journal_path: &Path, tz: Tz, notify: Arc<NotifyHub>) -> Result<Self, EngineError> {
        Self::with_channel_capacity(journal_path, tz, notify, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(
        journal_path: &Path,
        tz: Tz,
        notify: Arc<NotifyHub>,
        channel_capacity: usize,
    ) -> Result<Self, EngineError> {
        let replay = Wal::replay(journal_path)?;
        let wal = Wal::open(journal_path)?;

        // Nothing else can see the store yet, so replay's try_write never waits.
        let store = Arc::new(InMemoryStore::new());
        for event in &replay.events {
            if let Err(e) = store.replay_event(event) {
                warn!(event = event.label(), "journal replay failed: {e}");
                return Err(e);
            }
        }
        info!(
            path = %journal_path.display(),
            events = replay.events.len(),
            nodes = store.node_count(),
            "journal replayed"
        );
        metrics::gauge!(crate::observability::NODES_ACTIVE).set(store.node_count() as f64);

        let (wal_tx, wal_rx) = mpsc::channel(channel_capacity.max(1));
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            committer: Committer {
                store: store.clone(),
                wal_tx,
                notify: notify.clone(),
            },
            store,
            notify,
            tz,
            creation: Arc::new(Mutex::new(())),
        })
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    pub fn node(&self, id: &ulid::Ulid) -> Option<SharedNode> {
        self.store.node(id)
    }

    /// Rewrite the journal as a snapshot of the current state. Returns the
    /// number of events in the new journal.
    pub async fn compact_journal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.committer
            .wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(EngineError::Journal)
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .committer
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

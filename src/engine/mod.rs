mod error;
mod mutations;
mod queries;
mod rules;
mod store;

pub use error::{EngineError, ErrorKind};
pub use rules::{
    TransitionPolicy, approve, check_comment_eligibility, classify, last_and_next, order_bookings,
    page_window, paginate, parse_bucket, validate_creation,
};
pub use store::{InMemoryStore, RowLock, Scope};

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::{Generator, Ulid};

use crate::clock::Clock;
use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then fsyncs once and answers every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

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

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak
    // into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One marketplace: its store, its WAL writer, and the rules it enforces.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: TransitionPolicy,
    /// Mutations hold it shared across append + apply; compaction holds it
    /// exclusively so its snapshot never misses an appended event.
    pub(super) commit_gate: RwLock<()>,
    /// Held across the exists-check and write of a user or item id.
    pub(super) registry: tokio::sync::Mutex<()>,
    ids: Mutex<Generator>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        clock: Arc<dyn Clock>,
        policy: TransitionPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for event in &events {
            store.apply_event(event);
        }
        tracing::debug!(
            "replayed {} events from {}",
            events.len(),
            wal_path.display()
        );

        Ok(Self {
            store,
            wal_tx,
            clock,
            policy,
            commit_gate: RwLock::new(()),
            registry: tokio::sync::Mutex::new(()),
            ids: Mutex::new(Generator::new()),
        })
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Fresh id, strictly greater than every id this engine handed out before.
    pub(super) fn next_id(&self) -> Result<Ulid, EngineError> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.generate().map_err(|_| EngineError::IdExhausted)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_request(|response| WalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?
        .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. Nothing reaches memory unless the append succeeded.
    pub(super) async fn persist_and_apply(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_event(event);
        Ok(())
    }

    pub(super) async fn wal_request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }
}

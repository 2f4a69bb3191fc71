mod conflict;
mod eligibility;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod store;

pub use conflict::{conflicting_reservations, free_unit, has_conflict};
pub(crate) use conflict::now_ms;
pub use eligibility::{can_review, DenialReason, Eligibility};
pub use error::EngineError;
pub use lifecycle::{apply_transition, check_transition};
pub use queries::IntervalCheck;
pub use store::{InMemoryStore, SharedEquipmentState};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::catalog::EquipmentCatalog;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: Ack },
    Control(WalControl),
}

pub(super) enum WalControl {
    Compact {
        events: Vec<Event>,
        response: Ack,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while a batch is being written are
/// committed together with a single fsync; control commands run between batches.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<(Event, Ack)> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut control = match cmd {
            WalCommand::Append { event, response } => {
                batch.push((event, response));
                None
            }
            WalCommand::Control(c) => Some(c),
        };

        while control.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(WalCommand::Control(c)) => control = Some(c),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            commit_batch(&mut wal, &mut batch);
        }
        if let Some(c) = control {
            handle_control(&mut wal, c);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, Ack)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    // Encode everything up front: an event that fails to encode is rejected on its
    // own and never reaches the file.
    let mut frames = Vec::new();
    let mut accepted = Vec::with_capacity(batch.len());
    for (event, response) in batch.drain(..) {
        match Wal::encode_frame(&mut frames, &event) {
            Ok(()) => accepted.push(response),
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    let result = if accepted.is_empty() {
        Ok(())
    } else {
        wal.write_frames(&frames, accepted.len() as u64)
    };
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for response in accepted {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(r);
    }
}

fn handle_control(wal: &mut Wal, control: WalControl) {
    match control {
        WalControl::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) catalog: Arc<dyn EquipmentCatalog>,
    /// Mutations hold this shared for their whole critical section; compaction takes
    /// it exclusively so its snapshot and the WAL swap see no interleaved appends.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        catalog: Arc<dyn EquipmentCatalog>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();

        // Rebuild states privately, then publish them; nothing else can see the
        // store yet, so no locking is involved.
        let mut states: HashMap<Ulid, EquipmentState> = HashMap::new();
        for event in &events {
            let equipment_id = event.equipment_id();
            let es = states
                .entry(equipment_id)
                .or_insert_with(|| EquipmentState::new(equipment_id));
            store.apply_event(es, event);
        }
        for (_, es) in states {
            store.insert_equipment(es);
        }
        tracing::info!(
            events = events.len(),
            reservations = store.reservation_count(),
            "replayed WAL {}",
            wal_path.display()
        );

        Ok(Self {
            store,
            wal_tx,
            notify,
            catalog,
            commit_gate: RwLock::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn wal_control<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WalControl,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(build(tx)))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// WAL-append, then apply, then notify. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        es: &mut EquipmentState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(es, event);
        self.notify.send(event);
        Ok(())
    }

    /// Lookup reservation → equipment and take the equipment's write lock.
    pub(super) async fn lock_reservation(
        &self,
        id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<EquipmentState>), EngineError> {
        let equipment_id = self
            .store
            .equipment_for_reservation(id)
            .ok_or(EngineError::NotFound(*id))?;
        let shared = self
            .store
            .get_equipment(&equipment_id)
            .ok_or(EngineError::NotFound(*id))?;
        let guard = shared.write_owned().await;
        // Deleted while we waited for the lock.
        if guard.get(*id).is_none() {
            return Err(EngineError::NotFound(*id));
        }
        Ok((equipment_id, guard))
    }

    pub(super) async fn read_reservation_state(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<EquipmentState>, EngineError> {
        let equipment_id = self
            .store
            .equipment_for_reservation(id)
            .ok_or(EngineError::NotFound(*id))?;
        let shared = self
            .store
            .get_equipment(&equipment_id)
            .ok_or(EngineError::NotFound(*id))?;
        let guard = shared.read_owned().await;
        if guard.get(*id).is_none() {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }
}

mod availability;
mod conflict;
mod error;
mod intake;
mod queries;
mod snapshot;
mod transitions;
mod waitlist;

pub use availability::{available_quantity, oversubscribed_spans};
pub use conflict::{conflicting_booking, has_conflict};
pub use error::{EngineError, ErrorClass};
pub use intake::{NewResourceRequest, NewRoomBooking};
pub use queries::{BookingFilter, LogFilter, LogPage, RequestFilter};
pub use snapshot::fold_snapshot;
pub use transitions::next_status;
pub use waitlist::{next_queue_position, promotion_candidate};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notice, NoticeKind, Notifier};
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Fold the log on disk into a snapshot and swap it in. Runs inside the
    /// writer so no append can land between the read and the swap.
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders, then run whatever non-append command ended
///    the window.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let next = match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut trailing = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            trailing = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, batch);
                trailing
            }
            other => Some(other),
        };
        if let Some(cmd) = next
            && !handle_control(&mut wal, cmd)
        {
            break;
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(batch = batch.len(), "WAL flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

/// Returns false once the writer should stop.
fn handle_control(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Append { event, response } => {
            commit_batch(wal, vec![(event, response)]);
            true
        }
        WalCommand::Compact { response } => {
            let _ = response.send(compact_in_place(wal));
            true
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            true
        }
        WalCommand::Shutdown { response } => {
            if let Err(e) = wal.flush_sync() {
                tracing::error!("final WAL flush failed: {e}");
            }
            let _ = response.send(());
            false
        }
    }
}

fn compact_in_place(wal: &mut Wal) -> io::Result<usize> {
    wal.flush_sync()?;
    let history = Wal::replay(wal.path())?;
    let snapshot = fold_snapshot(&history);
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()?;
    Ok(snapshot.len())
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Re-run the availability check when a resource request is approved.
    pub revalidate_on_approve: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            revalidate_on_approve: true,
        }
    }
}

/// The allocation store: directory, inventory timelines, audit log and the
/// WAL writer that makes them durable.
pub struct Engine {
    pub(super) users: DashMap<Ulid, User>,
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    /// booking id → room id
    pub(super) booking_rooms: DashMap<Ulid, Ulid>,
    /// request id → resource id
    pub(super) request_resources: DashMap<Ulid, Ulid>,
    pub(super) logs: RwLock<Vec<LogEntry>>,
    /// Serializes user, room and resource creation so an id or email check
    /// and the insert that follows it cannot interleave with another one.
    pub(super) directory: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) options: EngineOptions,
}

fn apply_to_room(rs: &mut RoomState, event: &Event) {
    match event {
        Event::BookingSubmitted { booking } => rs.bookings.insert(booking.clone()),
        Event::BookingStatusChanged {
            id,
            status,
            queue_position,
            ..
        } => {
            if let Some(b) = rs.bookings.get_mut(*id) {
                b.status = *status;
                b.queue_position = *queue_position;
            }
        }
        Event::BookingReleased {
            id, status, promoted, ..
        } => {
            if let Some(b) = rs.bookings.get_mut(*id) {
                b.status = *status;
                b.queue_position = None;
            }
            if let Some(b) = rs.bookings.get_mut(*promoted) {
                b.status = Status::Approved;
                b.queue_position = None;
            }
        }
        _ => {}
    }
}

fn apply_to_resource(rs: &mut ResourceState, event: &Event) {
    match event {
        Event::RequestSubmitted { request } => rs.requests.insert(request.clone()),
        Event::RequestStatusChanged { id, status, .. } => {
            if let Some(r) = rs.requests.get_mut(*id) {
                r.status = *status;
            }
        }
        Event::ResourceRemoved { .. } => rs.retired = true,
        _ => {}
    }
}

/// Plain-value state rebuilt from the log before anything is shared.
#[derive(Default)]
struct Replayed {
    users: Vec<User>,
    rooms: HashMap<Ulid, RoomState>,
    resources: HashMap<Ulid, ResourceState>,
    logs: Vec<LogEntry>,
}

impl Replayed {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::UserRegistered { user } => self.users.push(user.clone()),
            Event::RoomCreated { room } => {
                self.rooms.insert(room.id, RoomState::new(room.clone()));
            }
            Event::ResourceCreated { resource, .. } => {
                self.resources.insert(resource.id, ResourceState::new(resource.clone()));
            }
            Event::ResourceRestored { resource, retired } => {
                let mut rs = ResourceState::new(resource.clone());
                rs.retired = *retired;
                self.resources.insert(resource.id, rs);
            }
            Event::ResourceRemoved { id, .. } => {
                if let Some(rs) = self.resources.get_mut(id) {
                    apply_to_resource(rs, event);
                }
            }
            Event::RequestSubmitted { request } => {
                if let Some(rs) = self.resources.get_mut(&request.resource_id) {
                    apply_to_resource(rs, event);
                }
            }
            Event::RequestStatusChanged { resource_id, .. } => {
                if let Some(rs) = self.resources.get_mut(resource_id) {
                    apply_to_resource(rs, event);
                }
            }
            Event::BookingSubmitted { booking } => {
                if let Some(rs) = self.rooms.get_mut(&booking.room_id) {
                    apply_to_room(rs, event);
                }
            }
            Event::BookingStatusChanged { room_id, .. } | Event::BookingReleased { room_id, .. } => {
                if let Some(rs) = self.rooms.get_mut(room_id) {
                    apply_to_room(rs, event);
                }
            }
            Event::LogAppended { .. } => {}
        }
        self.logs.extend(event.log_entries().cloned());
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task. Must be called
    /// from within a tokio runtime.
    pub fn open(
        wal_path: PathBuf,
        notifier: Arc<dyn Notifier>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let mut replayed = Replayed::default();
        for event in &events {
            replayed.apply(event);
        }

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        let writer = tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            users: DashMap::new(),
            rooms: DashMap::new(),
            resources: DashMap::new(),
            booking_rooms: DashMap::new(),
            request_resources: DashMap::new(),
            logs: RwLock::new(replayed.logs),
            directory: Mutex::new(()),
            wal_tx,
            writer: Mutex::new(Some(writer)),
            notifier,
            options,
        };
        for user in replayed.users {
            engine.users.insert(user.id, user);
        }
        for (id, rs) in replayed.rooms {
            for b in &rs.bookings.entries {
                engine.booking_rooms.insert(b.id, id);
            }
            engine.rooms.insert(id, Arc::new(RwLock::new(rs)));
        }
        for (id, rs) in replayed.resources {
            for r in &rs.requests.entries {
                engine.request_resources.insert(r.id, id);
            }
            engine.resources.insert(id, Arc::new(RwLock::new(rs)));
        }

        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            users = engine.users.len(),
            rooms = engine.rooms.len(),
            resources = engine.resources.len(),
            "engine opened"
        );
        Ok(engine)
    }

    /// Flush the WAL and stop the writer. Later mutations fail with a WAL error.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.wal_tx.send(WalCommand::Shutdown { response: tx }).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.writer.lock().await.take()
            && let Err(e) = handle.await
        {
            tracing::error!("WAL writer task failed: {e}");
        }
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

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as a minimal snapshot. Returns the number of records kept.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// WAL-append, apply to the locked room, record the audit entry.
    pub(super) async fn persist_room(
        &self,
        rs: &mut RoomState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        apply_to_room(rs, &event);
        if let Event::BookingSubmitted { booking } = &event {
            self.booking_rooms.insert(booking.id, booking.room_id);
        }
        self.record_log(&event).await;
        Ok(())
    }

    /// WAL-append, apply to the locked resource, record the audit entry.
    pub(super) async fn persist_resource(
        &self,
        rs: &mut ResourceState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        apply_to_resource(rs, &event);
        if let Event::RequestSubmitted { request } = &event {
            self.request_resources.insert(request.id, request.resource_id);
        }
        self.record_log(&event).await;
        Ok(())
    }

    pub(super) async fn record_log(&self, event: &Event) {
        let mut entries = event.log_entries().peekable();
        if entries.peek().is_some() {
            self.logs.write().await.extend(entries.cloned());
        }
    }

    /// Lookup booking → room, acquire the room's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let room_id = self
            .booking_rooms
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        Ok(rs.write_owned().await)
    }

    /// Lookup request → resource, acquire the resource's write lock.
    pub(super) async fn resolve_request_write(
        &self,
        request_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let resource_id = self
            .request_resources
            .get(request_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*request_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        Ok(rs.write_owned().await)
    }

    /// Send a notice to a user's email. Delivery failures never fail the
    /// transition that caused them.
    pub(super) fn notify_user(&self, user_id: Ulid, kind: NoticeKind, entity_label: String) {
        let Some(recipient) = self.users.get(&user_id).map(|u| u.email.clone()) else {
            tracing::warn!(%user_id, kind = kind.as_str(), "no email on file, notice skipped");
            return;
        };
        let notice = Notice {
            kind,
            recipient,
            entity_label,
        };
        if let Err(e) = self.notifier.notify(&notice) {
            metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL, "kind" => kind.as_str())
                .increment(1);
            tracing::warn!(%user_id, kind = kind.as_str(), "{e}");
        }
    }
}

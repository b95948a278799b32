mod availability;
mod error;
mod lifecycle;
mod listing;
mod mutations;
mod queries;
mod users;
mod validate;

pub use availability::{merge_fusible, AvailabilitySet};
pub use error::EngineError;
pub use lifecycle::{transition, Transition};
pub use listing::ListingState;
pub use users::{UserDirectory, UserState};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::error;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedListingState = Arc<RwLock<ListingState>>;

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

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued, then
/// fsyncs once for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Flush what we have before compacting or reporting.
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    respond_batch(batch, &result);
}

/// All or nothing: on any error the log is cut back to where the batch began,
/// so no event whose sender sees `Err` survives into replay.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mark = wal.mark()?;
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        if let Err(e) = wal.rollback(mark) {
            error!(error = %e, "WAL rollback failed; log may hold events from a failed batch");
        }
    }
    result
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One marketplace: users, listings, and the bookings made against them.
pub struct Engine {
    pub state: DashMap<Ulid, SharedListingState>,
    pub(super) users: RwLock<UserDirectory>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → listing id
    pub(super) booking_to_listing: DashMap<Ulid, Ulid>,
    /// Mutations hold the read half from validation to commit; compaction
    /// takes the write half so its snapshot never misses an appended event.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply a listing-scoped event to a ListingState (caller holds the lock).
/// Create/Delete and user events are handled at the map level.
fn apply_to_listing(ls: &mut ListingState, event: &Event) -> Result<(), EngineError> {
    match event {
        Event::AvailabilityAdded { range, .. } => ls.add_available_range(*range),
        Event::BookingRequested { id, user_id, range, .. } => ls.request_booking(*id, *user_id, *range).map(|_| ()),
        Event::BookingTransitioned { id, event, .. } => ls.transition_booking(*id, *event).map(|_| ()),
        Event::ListingCreated { .. }
        | Event::ListingDeleted { .. }
        | Event::UserRegistered { .. }
        | Event::UserDeleted { .. }
        | Event::UserUpdated { .. }
        | Event::FavoriteToggled { .. } => Ok(()),
    }
}

/// Build a listing, adding the initial ranges in order through `add`.
fn build_listing(
    id: Ulid,
    host_id: Ulid,
    title: String,
    location: Option<String>,
    description: Option<String>,
    capacity: u32,
    available: &[DateRange],
) -> Result<ListingState, EngineError> {
    let mut ls = ListingState::new(id, host_id, title, location, capacity);
    ls.description = description;
    for range in available {
        ls.add_available_range(*range)?;
    }
    Ok(ls)
}

/// Extract the listing id from a listing-scoped event.
fn event_listing_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AvailabilityAdded { listing_id, .. }
        | Event::BookingRequested { listing_id, .. }
        | Event::BookingTransitioned { listing_id, .. } => Some(*listing_id),
        Event::ListingCreated { id, .. } | Event::ListingDeleted { id } => Some(*id),
        Event::UserRegistered { .. }
        | Event::UserDeleted { .. }
        | Event::UserUpdated { .. }
        | Event::FavoriteToggled { .. } => None,
    }
}

fn replay_error(event: &Event, e: EngineError) -> io::Error {
    error!(?event, error = %e, "WAL replay produced an inconsistent state");
    io::Error::new(io::ErrorKind::InvalidData, format!("replay failed: {e}"))
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);

        // Replay into plain maps; nothing else can see them yet.
        let mut listings: HashMap<Ulid, ListingState> = HashMap::new();
        let mut users = UserDirectory::default();
        let booking_to_listing = DashMap::new();

        for event in &events {
            match event {
                Event::UserRegistered { id, username, email, phone } => {
                    users
                        .check_register(id, username, email, phone)
                        .map_err(|e| replay_error(event, e))?;
                    users.register(*id, username.clone(), email.clone(), phone.clone());
                }
                Event::UserDeleted { id } => {
                    users.remove(id);
                }
                Event::UserUpdated { id, username, email, phone } => {
                    users
                        .check_update(id, username, email, phone)
                        .map_err(|e| replay_error(event, e))?;
                    users.update(id, username.clone(), email.clone(), phone.clone());
                }
                Event::FavoriteToggled { user_id, listing_id } => {
                    users.toggle_favorite(user_id, *listing_id);
                }
                Event::ListingCreated { id, host_id, title, location, description, capacity, available } => {
                    let ls = build_listing(
                        *id,
                        *host_id,
                        title.clone(),
                        location.clone(),
                        description.clone(),
                        *capacity,
                        available,
                    )
                    .map_err(|e| replay_error(event, e))?;
                    listings.insert(*id, ls);
                }
                Event::ListingDeleted { id } => {
                    if let Some(ls) = listings.remove(id) {
                        for b in ls.bookings() {
                            booking_to_listing.remove(&b.id);
                        }
                    }
                    users.forget_listing(id);
                }
                other => {
                    let Some(listing_id) = event_listing_id(other) else { continue };
                    let Some(ls) = listings.get_mut(&listing_id) else { continue };
                    apply_to_listing(ls, other).map_err(|e| replay_error(other, e))?;
                    if let Event::BookingRequested { id, .. } = other {
                        booking_to_listing.insert(*id, listing_id);
                    }
                }
            }
        }

        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let state = DashMap::with_capacity(listings.len());
        for (id, ls) in listings {
            state.insert(id, Arc::new(RwLock::new(ls)));
        }

        Ok(Self {
            state,
            users: RwLock::new(users),
            wal_tx,
            booking_to_listing,
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

    pub fn get_listing(&self, id: &Ulid) -> Option<SharedListingState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_listing_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_listing.get(booking_id).map(|e| *e.value())
    }

    /// Stage `event` on a copy of the listing, make it durable, then swap the
    /// copy in. On any error (or if the future is dropped) the listing is
    /// left exactly as it was.
    pub(super) async fn commit_listing_event(&self, ls: &mut ListingState, event: &Event) -> Result<(), EngineError> {
        let mut staged = ls.clone();
        if let Err(e) = apply_to_listing(&mut staged, event) {
            if let EngineError::FatalConsistency { .. } = e {
                error!(listing = %ls.id, ?event, error = %e, "availability bookkeeping is inconsistent");
                metrics::counter!(crate::observability::CONSISTENCY_ERRORS_TOTAL).increment(1);
            }
            return Err(e);
        }
        self.wal_append(event).await?;
        *ls = staged;
        Ok(())
    }

    /// Acquire the listing's write lock. Fails with NotFound if the listing
    /// was deleted while we waited.
    pub(super) async fn lock_listing(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<ListingState>, EngineError> {
        let ls = self.get_listing(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ls.clone().write_owned().await;
        let current = self.state.get(&id).is_some_and(|e| Arc::ptr_eq(e.value(), &ls));
        if !current {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Lookup booking → listing, acquire the listing's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ListingState>), EngineError> {
        let listing_id = self
            .get_listing_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = self.lock_listing(listing_id).await?;
        Ok((listing_id, guard))
    }
}

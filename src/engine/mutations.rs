use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::{validate_range, validate_text};
use super::{build_listing, Engine, EngineError, ListingState, UserDirectory, WalCommand};

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(&self, id: Ulid, username: String, email: String, phone: String) -> Result<(), EngineError> {
        validate_text(&username, MAX_NAME_LEN, "username")?;
        validate_text(&email, MAX_NAME_LEN, "email")?;
        validate_text(&phone, MAX_NAME_LEN, "phone")?;
        if !email.contains('@') {
            return Err(EngineError::InvalidInput("email"));
        }

        let _gate = self.commit_gate.read().await;
        let mut users = self.users.write().await;
        if users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        users.check_register(&id, &username, &email, &phone)?;

        let event = Event::UserRegistered {
            id,
            username: username.clone(),
            email: email.clone(),
            phone: phone.clone(),
        };
        self.wal_append(&event).await?;
        users.register(id, username, email, phone);
        Ok(())
    }

    /// Change any of the user's unique fields. `None` keeps the current value.
    pub async fn update_user(
        &self,
        id: Ulid,
        username: Option<String>,
        email: Option<String>,
        phone: Option<String>,
    ) -> Result<UserInfo, EngineError> {
        if let Some(ref u) = username {
            validate_text(u, MAX_NAME_LEN, "username")?;
        }
        if let Some(ref e) = email {
            validate_text(e, MAX_NAME_LEN, "email")?;
            if !e.contains('@') {
                return Err(EngineError::InvalidInput("email"));
            }
        }
        if let Some(ref p) = phone {
            validate_text(p, MAX_NAME_LEN, "phone")?;
        }

        let _gate = self.commit_gate.read().await;
        let mut users = self.users.write().await;
        let current = users.get(&id).ok_or(EngineError::NotFound(id))?;
        let username = username.unwrap_or_else(|| current.username.clone());
        let email = email.unwrap_or_else(|| current.email.clone());
        let phone = phone.unwrap_or_else(|| current.phone.clone());
        users.check_update(&id, &username, &email, &phone)?;

        let event = Event::UserUpdated {
            id,
            username: username.clone(),
            email: email.clone(),
            phone: phone.clone(),
        };
        self.wal_append(&event).await?;
        users.update(&id, username, email, phone);
        debug!(user = %id, "user updated");
        users.get(&id).map(|u| u.info()).ok_or(EngineError::NotFound(id))
    }

    /// Cancel the user's live bookings elsewhere, delete the listings they
    /// host, then remove the user. Steps already committed stay committed if
    /// a later one fails.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        // Held throughout so no booking or listing for this user slips in.
        let mut users = self.users.write().await;
        if !users.contains(&id) {
            return Err(EngineError::NotFound(id));
        }

        let listing_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0usize;
        let mut removed = 0usize;
        for listing_id in listing_ids {
            let mut guard = match self.lock_listing(listing_id).await {
                Ok(g) => g,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if guard.host_id == id {
                self.remove_locked_listing(&guard, &mut users).await?;
                removed += 1;
                continue;
            }
            let held: Vec<Ulid> = guard
                .live_bookings()
                .filter(|b| b.user_id == id)
                .map(|b| b.id)
                .collect();
            for booking_id in held {
                let event = Event::BookingTransitioned {
                    id: booking_id,
                    listing_id,
                    event: BookingEvent::Cancel,
                };
                self.commit_listing_event(&mut guard, &event).await?;
                cancelled += 1;
            }
        }

        self.wal_append(&Event::UserDeleted { id }).await?;
        users.remove(&id);
        debug!(user = %id, cancelled, removed, "user deleted");
        Ok(())
    }

    pub async fn toggle_favorite(&self, user_id: Ulid, listing_id: Ulid) -> Result<FavoriteToggle, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut users = self.users.write().await;
        let outcome = users.check_toggle_favorite(&user_id, &listing_id)?;
        if outcome == FavoriteToggle::Added && !self.state.contains_key(&listing_id) {
            return Err(EngineError::NotFound(listing_id));
        }
        self.wal_append(&Event::FavoriteToggled { user_id, listing_id }).await?;
        users.toggle_favorite(&user_id, listing_id);
        Ok(outcome)
    }

    // ── Listings ─────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_listing(
        &self,
        id: Ulid,
        host_id: Ulid,
        title: String,
        location: Option<String>,
        description: Option<String>,
        capacity: u32,
        initial_ranges: Vec<DateRange>,
    ) -> Result<(), EngineError> {
        validate_text(&title, MAX_TITLE_LEN, "title")?;
        if let Some(ref loc) = location
            && loc.len() > MAX_LOCATION_LEN {
                return Err(EngineError::LimitExceeded("location too long"));
            }
        if let Some(ref text) = description
            && text.len() > MAX_DESCRIPTION_LEN {
                return Err(EngineError::LimitExceeded("description too long"));
            }
        if capacity == 0 {
            return Err(EngineError::InvalidInput("capacity must be positive"));
        }
        if capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        if initial_ranges.len() > MAX_INITIAL_RANGES {
            return Err(EngineError::LimitExceeded("too many initial ranges"));
        }
        for range in &initial_ranges {
            validate_range(range)?;
        }

        let _gate = self.commit_gate.read().await;
        // Exclusive so the id check and the insert below are one step.
        let users = self.users.write().await;
        if !users.contains(&host_id) {
            return Err(EngineError::NotFound(host_id));
        }
        if self.state.len() >= MAX_LISTINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many listings"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        // Overlapping initial ranges fail here, before anything is written.
        let ls = build_listing(
            id,
            host_id,
            title.clone(),
            location.clone(),
            description.clone(),
            capacity,
            &initial_ranges,
        )?;
        let event = Event::ListingCreated {
            id,
            host_id,
            title,
            location,
            description,
            capacity,
            available: initial_ranges,
        };
        self.wal_append(&event).await?;
        self.state.insert(id, Arc::new(RwLock::new(ls)));
        drop(users);
        debug!(listing = %id, host = %host_id, "listing created");
        Ok(())
    }

    pub async fn delete_listing(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut users = self.users.write().await;
        let guard = self.lock_listing(id).await?;
        self.remove_locked_listing(&guard, &mut users).await
    }

    /// Caller holds the listing's write lock until this returns. The listing
    /// also leaves every user's favorites.
    async fn remove_locked_listing(&self, ls: &ListingState, users: &mut UserDirectory) -> Result<(), EngineError> {
        self.wal_append(&Event::ListingDeleted { id: ls.id }).await?;
        self.state.remove(&ls.id);
        for b in ls.bookings() {
            self.booking_to_listing.remove(&b.id);
        }
        users.forget_listing(&ls.id);
        Ok(())
    }

    pub async fn add_availability(&self, listing_id: Ulid, range: DateRange) -> Result<(), EngineError> {
        validate_range(&range)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_listing(listing_id).await?;
        if guard.availability().len() >= MAX_RANGES_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many ranges on listing"));
        }
        let event = Event::AvailabilityAdded { listing_id, range };
        self.commit_listing_event(&mut guard, &event).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Carve `range` out of the listing and record a PENDING booking.
    pub async fn request_booking(
        &self,
        id: Ulid,
        listing_id: Ulid,
        user_id: Ulid,
        range: DateRange,
    ) -> Result<Booking, EngineError> {
        validate_range(&range)?;
        let _gate = self.commit_gate.read().await;
        let users = self.users.read().await;
        if !users.contains(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        if self.booking_to_listing.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let mut guard = self.lock_listing(listing_id).await?;
        if guard.bookings().len() >= MAX_BOOKINGS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many bookings on listing"));
        }
        // Only a carve from the middle of a free range adds a range.
        let splits = guard
            .availability()
            .find_containing(&range)
            .map(|i| guard.availability().ranges()[i])
            .is_some_and(|free| free.start() < range.start() && range.end() < free.end());
        if splits && guard.availability().len() >= MAX_RANGES_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many ranges on listing"));
        }

        let event = Event::BookingRequested { id, listing_id, user_id, range };
        self.commit_listing_event(&mut guard, &event).await?;
        self.booking_to_listing.insert(id, listing_id);
        drop(users);

        metrics::counter!(crate::observability::BOOKINGS_REQUESTED_TOTAL).increment(1);
        debug!(booking = %id, listing = %listing_id, %range, "booking requested");
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<BookingStatus, EngineError> {
        self.transition_booking(id, BookingEvent::Confirm).await
    }

    pub async fn reject_booking(&self, id: Ulid) -> Result<BookingStatus, EngineError> {
        self.transition_booking(id, BookingEvent::Reject).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<BookingStatus, EngineError> {
        self.transition_booking(id, BookingEvent::Cancel).await
    }

    pub async fn transition_booking(&self, id: Ulid, event: BookingEvent) -> Result<BookingStatus, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (listing_id, mut guard) = self.resolve_booking_write(&id).await?;
        let wal_event = Event::BookingTransitioned { id, listing_id, event };
        self.commit_listing_event(&mut guard, &wal_event).await?;

        let status = guard
            .booking(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "event" => event.as_str()).increment(1);
        debug!(booking = %id, %event, %status, "booking transitioned");
        Ok(status)
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Bookings are re-requested in their original order, each terminal one
    /// immediately followed by its final transition, so every replayed carve
    /// finds its range free.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let users = self.users.read().await;
        let mut events = Vec::new();

        for user in users.iter() {
            events.push(Event::UserRegistered {
                id: user.id,
                username: user.username.clone(),
                email: user.email.clone(),
                phone: user.phone.clone(),
            });
        }

        let listings: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for ls in listings {
            let guard = ls.read().await;
            events.push(Event::ListingCreated {
                id: guard.id,
                host_id: guard.host_id,
                title: guard.title.clone(),
                location: guard.location.clone(),
                description: guard.description.clone(),
                capacity: guard.capacity,
                available: guard.horizon().ranges().to_vec(),
            });
            for b in guard.bookings() {
                events.push(Event::BookingRequested {
                    id: b.id,
                    listing_id: guard.id,
                    user_id: b.user_id,
                    range: b.range,
                });
                let last = match b.status {
                    BookingStatus::Pending => None,
                    BookingStatus::Confirmed => Some(BookingEvent::Confirm),
                    BookingStatus::Rejected => Some(BookingEvent::Reject),
                    BookingStatus::Cancelled => Some(BookingEvent::Cancel),
                };
                if let Some(event) = last {
                    events.push(Event::BookingTransitioned {
                        id: b.id,
                        listing_id: guard.id,
                        event,
                    });
                }
            }
        }

        for user in users.iter() {
            for listing_id in &user.favorites {
                events.push(Event::FavoriteToggled {
                    user_id: user.id,
                    listing_id: *listing_id,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
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
}

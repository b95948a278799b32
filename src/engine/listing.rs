use ulid::Ulid;

use crate::model::*;

use super::availability::AvailabilitySet;
use super::lifecycle::transition;
use super::EngineError;

/// A listing and everything booked against it. The per-listing lock in the
/// engine wraps this struct, so every method here runs as one atomic unit.
#[derive(Debug, Clone)]
pub struct ListingState {
    pub id: Ulid,
    pub host_id: Ulid,
    pub title: String,
    pub location: Option<String>,
    pub description: Option<String>,
    /// Max guests.
    pub capacity: u32,
    availability: AvailabilitySet,
    /// All bookings ever requested here, in request order.
    bookings: Vec<Booking>,
}

impl ListingState {
    pub fn new(id: Ulid, host_id: Ulid, title: String, location: Option<String>, capacity: u32) -> Self {
        Self {
            id,
            host_id,
            title,
            location,
            description: None,
            capacity,
            availability: AvailabilitySet::new(),
            bookings: Vec::new(),
        }
    }

    pub fn availability(&self) -> &AvailabilitySet {
        &self.availability
    }

    /// Snapshot of the free ranges, ordered by start.
    pub fn available_ranges(&self) -> Vec<DateRange> {
        self.availability.ranges().to_vec()
    }

    pub fn add_available_range(&mut self, range: DateRange) -> Result<(), EngineError> {
        self.availability.add(range)
    }

    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Bookings whose range is currently carved out of availability.
    pub fn live_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.status.holds_range())
    }

    /// Carve `range` and record a pending booking for it.
    pub fn request_booking(&mut self, id: Ulid, user_id: Ulid, range: DateRange) -> Result<Booking, EngineError> {
        if self.booking(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        self.availability.carve(range)?;
        let booking = Booking {
            id,
            listing_id: self.id,
            user_id,
            range,
            status: BookingStatus::Pending,
        };
        self.bookings.push(booking.clone());
        Ok(booking)
    }

    /// Apply a lifecycle event. The status only changes if the availability
    /// side effect succeeded.
    pub fn transition_booking(&mut self, id: Ulid, event: BookingEvent) -> Result<Booking, EngineError> {
        let idx = self
            .bookings
            .iter()
            .position(|b| b.id == id)
            .ok_or(EngineError::NotFound(id))?;
        let (status, range) = (self.bookings[idx].status, self.bookings[idx].range);

        let step = transition(status, event).ok_or(EngineError::InvalidTransition {
            booking: id,
            status,
            event,
        })?;
        if step.restores_range {
            self.availability.restore(range)?;
        }
        self.bookings[idx].status = step.to;
        Ok(self.bookings[idx].clone())
    }

    /// Free ranges together with the ranges held by live bookings.
    pub fn horizon(&self) -> AvailabilitySet {
        AvailabilitySet::from_ranges(
            self.availability
                .ranges()
                .iter()
                .copied()
                .chain(self.live_bookings().map(|b| b.range)),
        )
    }
}

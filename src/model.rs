use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Closed interval of calendar days `[start, end]`. Never empty, never inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Returns `None` when `end` is before `start`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of days covered, both endpoints included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start.max(other.start) <= self.end.min(other.end)
    }

    pub fn is_identical(&self, other: &DateRange) -> bool {
        self.start == other.start && self.end == other.end
    }

    /// True if one range ends the day before the other starts.
    /// Ranges sharing an endpoint overlap and are not adjacent.
    pub fn is_adjacent_to(&self, other: &DateRange) -> bool {
        self.end.succ_opt() == Some(other.start) || other.end.succ_opt() == Some(self.start)
    }

    /// Overlapping or adjacent: the union is a single range.
    pub fn is_fusible_with(&self, other: &DateRange) -> bool {
        self.overlaps(other) || self.is_adjacent_to(other)
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &DateRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Widen `self` to the union with `other`. Caller guarantees the two are
    /// fusible and discards `other` afterwards.
    pub fn fuse_with(&mut self, other: &DateRange) {
        debug_assert!(self.is_fusible_with(other), "fusing disjoint ranges {self} and {other}");
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    /// Whether a booking in this status keeps its range carved out of availability.
    pub fn holds_range(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move a booking through its lifecycle after the initial request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingEvent {
    Confirm,
    Reject,
    Cancel,
}

impl BookingEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingEvent::Confirm => "confirm",
            BookingEvent::Reject => "reject",
            BookingEvent::Cancel => "cancel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "confirm" => Some(BookingEvent::Confirm),
            "reject" => Some(BookingEvent::Reject),
            "cancel" => Some(BookingEvent::Cancel),
            _ => None,
        }
    }
}

impl fmt::Display for BookingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub user_id: Ulid,
    pub range: DateRange,
    pub status: BookingStatus,
}

/// One committed state change. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        username: String,
        email: String,
        phone: String,
    },
    UserDeleted {
        id: Ulid,
    },
    /// Carries every field's new value, changed or not.
    UserUpdated {
        id: Ulid,
        username: String,
        email: String,
        phone: String,
    },
    ListingCreated {
        id: Ulid,
        host_id: Ulid,
        title: String,
        location: Option<String>,
        description: Option<String>,
        capacity: u32,
        /// Initial free ranges, added in order.
        available: Vec<DateRange>,
    },
    ListingDeleted {
        id: Ulid,
    },
    AvailabilityAdded {
        listing_id: Ulid,
        range: DateRange,
    },
    BookingRequested {
        id: Ulid,
        listing_id: Ulid,
        user_id: Ulid,
        range: DateRange,
    },
    BookingTransitioned {
        id: Ulid,
        listing_id: Ulid,
        event: BookingEvent,
    },
    FavoriteToggled {
        user_id: Ulid,
        listing_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingInfo {
    pub id: Ulid,
    pub host_id: Ulid,
    pub title: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub capacity: u32,
    pub available: Vec<DateRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub username: String,
    pub email: String,
    pub phone: String,
    pub favorites: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FavoriteToggle {
    Added,
    Removed,
}

#[cfg(test)]
pub(crate) fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

#[cfg(test)]
pub(crate) fn range(start: &str, end: &str) -> DateRange {
    DateRange::new(day(start), day(end)).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_range_refused() {
        assert!(DateRange::new(day("2025-01-05"), day("2025-01-04")).is_none());
        let single = DateRange::new(day("2025-01-05"), day("2025-01-05")).unwrap();
        assert_eq!(single.days(), 1);
    }

    #[test]
    fn overlap_is_inclusive() {
        let a = range("2025-01-01", "2025-01-05");
        let b = range("2025-01-05", "2025-01-08");
        let c = range("2025-01-06", "2025-01-08");
        assert!(a.overlaps(&b)); // shared endpoint day
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn adjacency_means_next_day() {
        let a = range("2025-01-01", "2025-01-05");
        let next = range("2025-01-06", "2025-01-09");
        let gap = range("2025-01-07", "2025-01-09");
        let shared = range("2025-01-05", "2025-01-09");
        assert!(a.is_adjacent_to(&next));
        assert!(next.is_adjacent_to(&a));
        assert!(!a.is_adjacent_to(&gap));
        assert!(!a.is_adjacent_to(&shared));
        assert!(a.is_fusible_with(&shared));
    }

    #[test]
    fn adjacency_across_month_boundary() {
        let jan = range("2025-01-20", "2025-01-31");
        let feb = range("2025-02-01", "2025-02-03");
        assert!(jan.is_adjacent_to(&feb));
    }

    #[test]
    fn identical_and_contains() {
        let a = range("2025-01-01", "2025-01-10");
        assert!(a.is_identical(&range("2025-01-01", "2025-01-10")));
        assert!(!a.is_identical(&range("2025-01-01", "2025-01-09")));
        assert!(a.contains(&range("2025-01-03", "2025-01-05")));
        assert!(a.contains(&a));
        assert!(!a.contains(&range("2024-12-31", "2025-01-05")));
    }

    #[test]
    fn fuse_widens_both_ends() {
        let mut a = range("2025-01-05", "2025-01-10");
        a.fuse_with(&range("2025-01-01", "2025-01-04"));
        assert_eq!(a, range("2025-01-01", "2025-01-10"));
        a.fuse_with(&range("2025-01-08", "2025-01-20"));
        assert_eq!(a, range("2025-01-01", "2025-01-20"));
    }

    #[test]
    fn booking_event_parse() {
        assert_eq!(BookingEvent::parse("Confirm"), Some(BookingEvent::Confirm));
        assert_eq!(BookingEvent::parse("cancel"), Some(BookingEvent::Cancel));
        assert_eq!(BookingEvent::parse("approve"), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingRequested {
            id: Ulid::new(),
            listing_id: Ulid::new(),
            user_id: Ulid::new(),
            range: range("2025-03-01", "2025-03-04"),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

use crate::model::{BookingEvent, BookingStatus};

/// Outcome of a legal lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: BookingStatus,
    /// The booking's range goes back into the listing's availability.
    pub restores_range: bool,
}

/// The booking transition table. `None` means the event is not allowed from
/// `from`.
pub fn transition(from: BookingStatus, event: BookingEvent) -> Option<Transition> {
    use BookingEvent::*;
    use BookingStatus::*;

    let (to, restores_range) = match (from, event) {
        (Pending, Confirm) => (Confirmed, false),
        (Pending, Reject) => (Rejected, true),
        (Pending | Confirmed, Cancel) => (Cancelled, true),
        _ => return None,
    };
    Some(Transition { to, restores_range })
}

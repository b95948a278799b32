use ulid::Ulid;

use crate::model::{BookingEvent, BookingStatus, DateRange};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A unique user attribute (field, value) is already registered.
    NameTaken(&'static str, String),
    Overlap {
        requested: DateRange,
        existing: DateRange,
    },
    DuplicateRange(DateRange),
    UnavailableRange(DateRange),
    InvalidTransition {
        booking: Ulid,
        status: BookingStatus,
        event: BookingEvent,
    },
    /// Restoring a range that is already free. The listing's bookkeeping is
    /// corrupt; never retried.
    FatalConsistency {
        restored: DateRange,
        existing: DateRange,
    },
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to pgwire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_)
            | EngineError::NameTaken(..)
            | EngineError::DuplicateRange(_) => "23505",
            EngineError::Overlap { .. } | EngineError::UnavailableRange(_) => "23P01",
            EngineError::InvalidTransition { .. } => "55000",
            EngineError::FatalConsistency { .. } => "XX000",
            EngineError::InvalidInput(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NameTaken(field, value) => write!(f, "{field} already registered: {value}"),
            EngineError::Overlap { requested, existing } => write!(
                f,
                "dates {requested} could not be added, they overlap existing availability {existing}"
            ),
            EngineError::DuplicateRange(range) => {
                write!(f, "dates {range} are already available for this listing")
            }
            EngineError::UnavailableRange(range) => {
                write!(f, "dates {range} are not available for booking")
            }
            EngineError::InvalidTransition { booking, status, event } => {
                write!(f, "booking {booking} is {status}; cannot {event}")
            }
            EngineError::FatalConsistency { restored, existing } => write!(
                f,
                "consistency violation: restored range {restored} overlaps free range {existing}"
            ),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

use chrono::Datelike;

use crate::limits::*;
use crate::model::DateRange;

use super::EngineError;

pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if range.start().year() < MIN_VALID_YEAR || range.end().year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if range.days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("range too wide"));
    }
    Ok(())
}

/// Non-empty after trimming and at most `max` bytes.
pub(crate) fn validate_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(what));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

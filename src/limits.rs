//! Hard caps that keep a single tenant's memory and per-request work bounded.

pub const MAX_USERS_PER_TENANT: usize = 1_000_000;
pub const MAX_LISTINGS_PER_TENANT: usize = 100_000;

/// Free ranges on one listing after normalization.
pub const MAX_RANGES_PER_LISTING: usize = 512;
/// Ranges accepted in a single create_listing call.
pub const MAX_INITIAL_RANGES: usize = 64;
pub const MAX_BOOKINGS_PER_LISTING: usize = 10_000;
pub const MAX_FAVORITES: usize = 20;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 512;
pub const MAX_LOCATION_LEN: usize = 512;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_CAPACITY: u32 = 1_000;

/// Widest single range, about ten years.
pub const MAX_RANGE_DAYS: i64 = 3_660;
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2199;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SQL_LEN: usize = 64 * 1024;

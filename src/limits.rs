/// Upper bound on occurrences a single request may expand into.
pub const MAX_OCCURRENCES: u32 = 12;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_ATTENDEES: usize = 50;
pub const MAX_IDENTITY_LEN: usize = 64;
pub const MAX_TEAM_LEN: usize = 64;

/// Default cap on a single occurrence's duration, in minutes.
pub const DEFAULT_MAX_DURATION_MINUTES: i64 = 12 * 60;

/// Widest listing window a `query` request may ask for, in days.
pub const MAX_QUERY_DAYS: i64 = 31;

/// Days covered by the `weekly` listing.
pub const WEEKLY_QUERY_DAYS: i64 = 7;

/// Longest accepted request line on the wire (bytes).
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Page size requested from paginated record stores.
pub const STORE_PAGE_SIZE: usize = 100;

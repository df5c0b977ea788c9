//! Hard input limits. Every externally supplied collection or string is
//! bounded by one of these before it reaches the ledger.

// ── Inspectors ───────────────────────────────────────────

pub const MAX_INSPECTORS: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEMPLATE_RANGES: usize = 64;
pub const MAX_OVERRIDE_RANGES: usize = 32;
pub const MAX_OVERRIDES_PER_INSPECTOR: usize = 10_000;
pub const MAX_ALLOCATIONS_PER_INSPECTOR: usize = 100_000;

pub const DEFAULT_SLOT_MINUTES: u32 = 60;
pub const MIN_SLOT_MINUTES: u32 = 5;
pub const MAX_SLOT_MINUTES: u32 = 720;

// ── Slots & queries ──────────────────────────────────────

/// Widest `list_slots` window, in days (inclusive).
pub const MAX_QUERY_DAYS: i64 = 366;

/// Widest `list_appointments` window, in days (inclusive).
pub const MAX_REPORT_DAYS: i64 = 3_660;

pub const MAX_REASON_LEN: usize = 1024;

/// Dates outside `[MIN_YEAR, MAX_YEAR]` are rejected. Slot ids carry the
/// start instant in the 48-bit ULID timestamp, so pre-epoch dates can't be
/// encoded.
pub const MIN_YEAR: i32 = 1970;
pub const MAX_YEAR: i32 = 2199;

// ── Reference records ────────────────────────────────────

pub const MAX_RECORDS: usize = 1_000_000;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_ADDRESS_LEN: usize = 512;
pub const MAX_CODE_LEN: usize = 64;
pub const MAX_SIZE_M2: f64 = 100_000.0;
pub const MAX_RATE_CENTS: i64 = 10_000_000;
pub const MAX_CHARGES: usize = 1_000_000;
pub const MAX_CHARGE_CENTS: i64 = 100_000_000;

// ── Server ───────────────────────────────────────────────

pub const MAX_CONNECTIONS: usize = 256;
pub const MAX_INSERT_ROWS: usize = MAX_OVERRIDE_RANGES;

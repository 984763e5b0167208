//! Pipeline-wide constants.

/// Default number of dequeue attempts before a job is given up on.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Upper bound on the persisted scan report, in characters.
pub const MAX_SCAN_REPORT_LEN: usize = 4096;

/// Upper bound on the persisted job failure reason, in characters.
pub const MAX_LAST_ERROR_LEN: usize = 4096;

/// Key prefix for objects that have not been scanned yet.
pub const DEFAULT_TEMP_KEY_PREFIX: &str = "uploads/temp";

/// Key prefix for objects that went through the scanner.
pub const DEFAULT_SCANNED_KEY_PREFIX: &str = "uploads/scanned";

/// Minimum time a job lease must outlast the job timeout, so a timed-out job
/// is failed by its own worker before anyone else can reclaim it.
pub const MIN_LEASE_MARGIN_SECS: u64 = 60;

/// Channel used with LISTEN/NOTIFY when a job is enqueued.
pub const JOB_NOTIFY_CHANNEL: &str = "clearance_new_job";

/// Truncate `text` to at most `max_chars` characters, never splitting a char.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Strip NUL bytes (Postgres text cannot hold them) and bound the length.
pub fn sanitize_db_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\0', "");
    truncate_chars(&cleaned, max_chars).to_string()
}

//! CLI command implementations.

pub mod lease;
pub mod reset;
pub mod status;

use std::path::Path;

/// Fails unless `path` is an existing sync state directory.
///
/// The file backends create their directory on open; the tools only ever
/// look at state a device already wrote.
pub(crate) fn ensure_state_dir(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No sync state found at {:?}", path).into());
    }
    Ok(())
}

/// Formats Unix milliseconds relative to `now_ms`.
pub(crate) fn format_relative(at_ms: u64, now_ms: u64) -> String {
    if at_ms >= now_ms {
        format!("in {}s", (at_ms - now_ms) / 1000)
    } else {
        format!("{}s ago", (now_ms - at_ms) / 1000)
    }
}

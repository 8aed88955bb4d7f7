//! Lease command implementation.

use super::{ensure_state_dir, format_relative};
use fhirsync_engine::{Clock, FileLease, LeaseBackend, SystemClock};
use std::path::Path;
use tracing::info;

/// Runs the lease command.
pub fn run(path: &Path, break_lease: bool) -> Result<(), Box<dyn std::error::Error>> {
    ensure_state_dir(path)?;
    let lease = FileLease::open(path)?;
    let now_ms = SystemClock.now_ms();

    if break_lease {
        info!("Breaking sync lease in {:?}", path);
        match lease.break_lease()? {
            Some(info) => println!("✓ Removed lease held by {}", info.holder),
            None => println!("No lease to break"),
        }
        return Ok(());
    }

    match lease.current()? {
        None => println!("Lease: free"),
        Some(info) => {
            let state = if info.is_expired(now_ms) {
                "expired"
            } else {
                "held"
            };
            println!("Lease: {} by {}", state, info.holder);
            println!("  Acquired: {}", format_relative(info.acquired_at_ms, now_ms));
            println!("  Expires:  {}", format_relative(info.expires_at_ms, now_ms));
        }
    }
    Ok(())
}

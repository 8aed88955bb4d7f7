//! Status command implementation.

use super::{ensure_state_dir, format_relative};
use fhirsync_engine::{
    Clock, FileLease, FileTokenStore, LeaseBackend, LeaseInfo, SystemClock, TokenStore,
};
use serde::Serialize;
use std::path::Path;

/// Sync state of one device.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// State directory.
    pub path: String,
    /// Watermark of every type downloaded so far.
    pub watermarks: Vec<WatermarkEntry>,
    /// The sync lease, if one is recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseStatus>,
}

/// Watermark of one resource type.
#[derive(Debug, Serialize)]
pub struct WatermarkEntry {
    /// Resource type.
    pub resource_type: String,
    /// Watermark in milliseconds.
    pub watermark: u64,
}

/// The recorded sync lease.
#[derive(Debug, Serialize)]
pub struct LeaseStatus {
    /// The lease.
    #[serde(flatten)]
    pub info: LeaseInfo,
    /// Whether another pass may reclaim it.
    pub expired: bool,
}

/// Collects the status report of a state directory.
pub fn collect(path: &Path, now_ms: u64) -> Result<StatusReport, Box<dyn std::error::Error>> {
    ensure_state_dir(path)?;
    let tokens = FileTokenStore::open(path)?;
    let lease = FileLease::open(path)?;

    let watermarks = tokens
        .watermarks()?
        .into_iter()
        .map(|(resource_type, watermark)| WatermarkEntry {
            resource_type: resource_type.to_string(),
            watermark: watermark.as_millis(),
        })
        .collect();
    let lease = lease.current()?.map(|info| LeaseStatus {
        expired: info.is_expired(now_ms),
        info,
    });

    Ok(StatusReport {
        path: path.display().to_string(),
        watermarks,
        lease,
    })
}

/// Runs the status command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let now_ms = SystemClock.now_ms();
    let report = collect(path, now_ms)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report, now_ms);
        }
    }

    Ok(())
}

fn print_text_output(report: &StatusReport, now_ms: u64) {
    println!("fhirsync Sync State");
    println!("===================");
    println!();
    println!("Path: {}", report.path);
    println!();
    println!("Watermarks:");
    if report.watermarks.is_empty() {
        println!("  (none, next pass downloads everything)");
    }
    for entry in &report.watermarks {
        println!("  {:<20} {}", entry.resource_type, entry.watermark);
    }
    println!();
    match &report.lease {
        None => println!("Lease: free"),
        Some(lease) => {
            println!("Lease:");
            println!("  Holder:   {}", lease.info.holder);
            println!(
                "  Acquired: {}",
                format_relative(lease.info.acquired_at_ms, now_ms)
            );
            println!(
                "  Expires:  {}{}",
                format_relative(lease.info.expires_at_ms, now_ms),
                if lease.expired { " (expired)" } else { "" }
            );
        }
    }
}

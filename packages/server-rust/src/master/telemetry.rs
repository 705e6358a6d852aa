//! Global cache telemetry owned by the master directory.
//!
//! Workers report `[hits, misses, disk reads, disk writes]` deltas through
//! `ReportCacheHit`; the bundle folds them into atomic counters and a
//! summary is appended to `result.txt` on shutdown.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use tracing::info;

/// Atomic counter bundle for app-wide cache statistics.
#[derive(Debug, Default)]
pub struct TelemetryBundle {
    hits: AtomicU64,
    misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub hits: u64,
    pub misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}

impl TelemetryBundle {
    /// Folds one worker report into the global counters.
    pub fn record(&self, deltas: [u64; 4]) {
        self.hits.fetch_add(deltas[0], Ordering::Relaxed);
        self.misses.fetch_add(deltas[1], Ordering::Relaxed);
        self.disk_reads.fetch_add(deltas[2], Ordering::Relaxed);
        self.disk_writes.fetch_add(deltas[3], Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
        }
    }
}

/// Appends the shutdown summary to `result.txt` in `dir`.
pub fn append_summary(
    dir: &Path,
    app_name: &str,
    runtime: Duration,
    snapshot: TelemetrySnapshot,
) -> anyhow::Result<()> {
    let path = dir.join("result.txt");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;

    writeln!(file, "AppName: {app_name}, Runtime: {}", runtime.as_millis())
        .and_then(|()| {
            writeln!(
                file,
                "RDD Hit\t{}\tRDD Miss\t{}",
                snapshot.hits, snapshot.misses
            )
        })
        .with_context(|| format!("appending summary to {}", path.display()))?;

    info!(
        app_name,
        hits = snapshot.hits,
        misses = snapshot.misses,
        "wrote telemetry summary"
    );
    Ok(())
}

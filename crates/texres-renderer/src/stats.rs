//! Observability counters, one set per physical format.

use std::fmt;
use std::time::Duration;

use crate::format::{PixelFormatId, PixelFormatKind};

/// Cumulative eviction-pressure numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrashStats {
    /// Every eviction, LRU and round-robin alike.
    pub evictions: u64,
    /// Time spent filling slots taken from an evicted texture.
    pub upload_time: Duration,
    /// Largest slot involved in an eviction.
    pub max_width: u32,
    pub max_height: u32,
}

impl ThrashStats {
    pub fn record(&mut self, width: u32, height: u32, upload_time: Duration) {
        self.evictions += 1;
        self.upload_time += upload_time;
        self.max_width = self.max_width.max(width);
        self.max_height = self.max_height.max(height);
    }

    pub fn merge(&mut self, other: &ThrashStats) {
        self.evictions += other.evictions;
        self.upload_time += other.upload_time;
        self.max_width = self.max_width.max(other.max_width);
        self.max_height = self.max_height.max(other.max_height);
    }
}

/// Counters cleared by `on_frame_begin`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    pub binds: u64,
    pub uploads: u64,
    pub upload_bytes: u64,
    pub upload_time: Duration,
    pub evictions: u64,
    pub fallbacks: u64,
}

/// Snapshot for one format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatStats {
    pub format: PixelFormatId,
    pub kind: PixelFormatKind,
    pub tag: &'static str,
    pub pools: usize,
    pub slots: usize,
    pub capacity: usize,
    pub resident_bytes: u64,
    pub degraded: bool,
    pub frame: FrameCounters,
    pub thrash: ThrashStats,
}

impl fmt::Display for FormatStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<9} {:>3} pools {:>4}/{:<4} slots {:>8}k | {:>4} binds {:>3} uploads {:>7.2}ms",
            self.tag,
            self.pools,
            self.slots,
            self.capacity,
            self.resident_bytes / 1024,
            self.frame.binds,
            self.frame.uploads,
            self.frame.upload_time.as_secs_f64() * 1000.0,
        )?;
        if self.thrash.evictions > 0 {
            write!(
                f,
                " | thrash {} ({:.2}ms, up to {}x{})",
                self.thrash.evictions,
                self.thrash.upload_time.as_secs_f64() * 1000.0,
                self.thrash.max_width,
                self.thrash.max_height,
            )?;
        }
        if self.degraded {
            write!(f, " [degraded]")?;
        }
        Ok(())
    }
}

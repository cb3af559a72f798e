//! Bounded caches used for sessions, file assemblers and IP fragments.
//!
//! Every long-lived, per-flow structure in the engine lives in a
//! [`PopularityCache`]. Capacity is the only bound on staleness: there are
//! no timers, so an idle entry is reclaimed only when newer entries push it
//! out. The eviction hook lets the owner close whatever the entry represents
//! instead of dropping it on the floor.

mod popularity;

pub use popularity::{EvictionHook, PopularityCache};

/// Cache statistics for monitoring.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of lookups that found an entry.
    pub hits: u64,
    /// Number of lookups that found nothing.
    pub misses: u64,
    /// Current number of cached entries.
    pub entries: usize,
    /// Maximum number of entries allowed.
    pub capacity: usize,
    /// Entries pushed out by capacity pressure.
    pub evictions: u64,
    /// Peak number of entries ever held (high watermark).
    pub peak_entries: usize,
}

impl CacheStats {
    /// Calculate the hit ratio (hits / total accesses).
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate cache utilization (entries / capacity).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.entries as f64 / self.capacity as f64
        }
    }

    /// Format statistics as a human-readable string.
    pub fn format_summary(&self, name: &str) -> String {
        format!(
            "{name}: {}/{} entries ({:.1}%), peak {}, {} evictions, hit ratio {:.1}%",
            self.entries,
            self.capacity,
            self.utilization() * 100.0,
            self.peak_entries,
            self.evictions,
            self.hit_ratio() * 100.0,
        )
    }
}

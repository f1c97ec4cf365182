//! Session-wide counters and the end-of-session summary.

use std::fmt;
use std::ops::AddAssign;

use crate::dataset::DatasetCounters;
use crate::sync::ring::RingStats;

/// Totals for one ingestion session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionStats {
    /// Sum over every output the session wrote.
    pub frames: DatasetCounters,
    /// Number of outputs opened.
    pub outputs: usize,
    /// Frames no output could take (unreadable header, output creation failed).
    pub unrouted: u64,
    /// Ring counters; all zero for file ingestion.
    pub ring: RingStats,
}

impl IngestionStats {
    /// Folds one closed output's counters into the totals.
    pub fn absorb(&mut self, counters: DatasetCounters) {
        self.frames += counters;
        self.outputs += 1;
    }
}

impl AddAssign for IngestionStats {
    fn add_assign(&mut self, rhs: Self) {
        self.frames += rhs.frames;
        self.outputs += rhs.outputs;
        self.unrouted += rhs.unrouted;
        self.ring.stored += rhs.ring.stored;
        self.ring.dropped += rhs.ring.dropped;
        self.ring.max_backlog = self.ring.max_backlog.max(rhs.ring.max_backlog);
        self.ring.max_occupancy = self.ring.max_occupancy.max(rhs.ring.max_occupancy);
    }
}

impl fmt::Display for IngestionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Ingestion summary")?;
        writeln!(f, "-- outputs written ............ : {}", self.outputs)?;
        writeln!(f, "-- frames processed ........... : {}", self.frames.processed)?;
        writeln!(f, "-- frames with broken header .. : {}", self.frames.bad_crc)?;
        writeln!(f, "-- frames rejected (other) .... : {}", self.frames.rejected)?;
        writeln!(f, "-- frames before channel start  : {}", self.frames.before_origin)?;
        writeln!(f, "-- frames written ............. : {}", self.frames.written)?;
        writeln!(f, "-- frames without output ...... : {}", self.unrouted)?;
        writeln!(f, "-- max frames in buffer ....... : {}", self.ring.max_occupancy)?;
        writeln!(f, "-- max socket backlog ......... : {}", self.ring.max_backlog)?;
        write!(f, "-- frames dropped (overflow) .. : {}", self.ring.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_and_merge() {
        let mut stats = IngestionStats::default();
        stats.absorb(DatasetCounters {
            processed: 10,
            written: 9,
            bad_crc: 1,
            ..DatasetCounters::default()
        });
        stats.absorb(DatasetCounters {
            processed: 2,
            written: 2,
            ..DatasetCounters::default()
        });
        assert_eq!(stats.outputs, 2);
        assert_eq!(stats.frames.processed, 12);

        let mut total = IngestionStats::default();
        total += stats;
        total += IngestionStats {
            ring: RingStats {
                dropped: 3,
                max_occupancy: 40,
                ..RingStats::default()
            },
            ..IngestionStats::default()
        };
        assert_eq!(total.frames.written, 11);
        assert_eq!(total.ring.dropped, 3);
        assert_eq!(total.ring.max_occupancy, 40);
    }

    #[test]
    fn summary_mentions_every_counter() {
        let stats = IngestionStats {
            ring: RingStats {
                dropped: 7,
                max_backlog: 5,
                ..RingStats::default()
            },
            ..IngestionStats::default()
        };
        let text = stats.to_string();
        assert!(text.starts_with("Ingestion summary"));
        assert!(text.contains("frames dropped (overflow) .. : 7"));
        assert!(text.contains("max socket backlog ......... : 5"));
        assert_eq!(text.lines().count(), 11);
    }
}

use chrono::{DateTime, Duration, FixedOffset};

/// Event-age filter backing `--last-hours`. A `None` cutoff admits
/// everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeFilter {
    pub cutoff: Option<DateTime<FixedOffset>>,
}

impl TimeFilter {
    pub fn last_hours(hours: f64, now: DateTime<FixedOffset>) -> Self {
        if hours <= 0.0 {
            return Self::default();
        }
        let cutoff = now - Duration::milliseconds((hours * 3_600_000.0) as i64);
        Self {
            cutoff: Some(cutoff),
        }
    }

    pub fn allow(&self, ts: DateTime<FixedOffset>) -> bool {
        match self.cutoff {
            None => true,
            Some(cutoff) => ts >= cutoff,
        }
    }
}

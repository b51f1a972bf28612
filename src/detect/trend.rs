//! Window arithmetic: observed values, trend confirmation, recovery.
//!
//! Trend confirmation is the anti-flap gate: a rule only opens an incident
//! when its condition held across most of the window, not on a single spike.

use crate::ingest::event::EventStatus;
use crate::rules::{MetricType, Operator};

/// A rule needs at least this many trafficked sub-windows before a trend can
/// be called persistent; a condition seen only in the most recent minute is
/// ignored.
pub const MIN_TRAFFICKED_SUBWINDOWS: usize = 3;

/// Share of trafficked sub-windows that must satisfy the rule.
pub const TREND_RATIO: f64 = 0.6;

/// Status counts for one minute bucket of one dimension.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinuteCounts {
    pub bucket: i64,
    pub created: u64,
    pub succeeded: u64,
    pub declined: u64,
    pub error: u64,
    pub rejected: u64,
}

impl MinuteCounts {
    pub fn add_status(&mut self, status: EventStatus, count: u64) {
        match status {
            EventStatus::Created => self.created += count,
            EventStatus::Succeeded => self.succeeded += count,
            EventStatus::Declined => self.declined += count,
            EventStatus::Error => self.error += count,
            EventStatus::Rejected => self.rejected += count,
        }
    }

    /// Terminal outcomes only -- the rate denominator. CREATED is not yet an
    /// outcome and REJECTED never reached the provider, so neither says
    /// anything about provider health.
    pub fn terminal_total(&self) -> u64 {
        self.succeeded + self.declined + self.error
    }

    /// Every status, for TOTAL_VOLUME.
    pub fn volume_total(&self) -> u64 {
        self.created + self.succeeded + self.declined + self.error + self.rejected
    }

    pub fn adverse(&self, metric: MetricType) -> u64 {
        match metric {
            MetricType::ErrorRate => self.error,
            MetricType::DeclineRate => self.declined,
            MetricType::ApprovalRate => self.declined + self.error,
            MetricType::TotalVolume => 0,
        }
    }

    /// Observed value of the metric within this minute; None when the
    /// denominator is empty.
    pub fn observed(&self, metric: MetricType) -> Option<f64> {
        match metric {
            MetricType::TotalVolume => Some(self.volume_total() as f64),
            rate => {
                let total = self.terminal_total();
                if total == 0 {
                    return None;
                }
                let numerator = match rate {
                    MetricType::ApprovalRate => self.succeeded,
                    MetricType::ErrorRate => self.error,
                    MetricType::DeclineRate => self.declined,
                    MetricType::TotalVolume => unreachable!(),
                };
                Some(numerator as f64 / total as f64)
            }
        }
    }
}

/// Per-minute counts over a rule's evaluation window, oldest first.
#[derive(Debug, Clone, Default)]
pub struct WindowCounts {
    pub minutes: Vec<MinuteCounts>,
}

impl WindowCounts {
    pub fn totals(&self) -> MinuteCounts {
        let mut acc = MinuteCounts::default();
        for m in &self.minutes {
            acc.created += m.created;
            acc.succeeded += m.succeeded;
            acc.declined += m.declined;
            acc.error += m.error;
            acc.rejected += m.rejected;
        }
        acc
    }

    /// The sample size the min_transactions guard applies to.
    pub fn sample_size(&self, metric: MetricType) -> u64 {
        let totals = self.totals();
        if metric.is_rate() {
            totals.terminal_total()
        } else {
            totals.volume_total()
        }
    }

    pub fn adverse_total(&self, metric: MetricType) -> u64 {
        self.totals().adverse(metric)
    }

    pub fn observed(&self, metric: MetricType) -> Option<f64> {
        self.totals().observed(metric)
    }
}

/// Persistence test gating incident creation.
///
/// Rate metrics: at least `MIN_TRAFFICKED_SUBWINDOWS` minutes carried
/// traffic, the rule held in >= 60% of them, and the window's adverse count
/// reaches `min_adverse`. TOTAL_VOLUME's window is already a single minute,
/// so the test degenerates to the threshold breach itself.
pub fn confirm_trend(
    window: &WindowCounts,
    metric: MetricType,
    operator: Operator,
    threshold: f64,
    min_adverse: u64,
) -> bool {
    if metric == MetricType::TotalVolume {
        return true;
    }

    let trafficked: Vec<&MinuteCounts> = window
        .minutes
        .iter()
        .filter(|m| m.terminal_total() > 0)
        .collect();
    if trafficked.len() < MIN_TRAFFICKED_SUBWINDOWS {
        return false;
    }

    let firing = trafficked
        .iter()
        .filter(|m| {
            m.observed(metric)
                .map_or(false, |v| operator.compare(v, threshold))
        })
        .count();
    if (firing as f64) < (trafficked.len() as f64) * TREND_RATIO {
        return false;
    }

    window.adverse_total(metric) >= min_adverse
}

/// Recovery test for rate rules: the newest `needed` events in the dimension
/// are all SUCCEEDED.
pub fn recovered_rates(tail_newest_first: &[EventStatus], needed: usize) -> bool {
    tail_newest_first.len() >= needed
        && tail_newest_first[..needed]
            .iter()
            .all(|s| *s == EventStatus::Succeeded)
}

/// Recovery test for volume rules: the last minute saw traffic and no longer
/// satisfies the firing direction.
pub fn recovered_volume(operator: Operator, threshold: f64, last_minute_total: u64) -> bool {
    last_minute_total > 0 && !operator.compare(last_minute_total as f64, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute(bucket: i64, succeeded: u64, error: u64) -> MinuteCounts {
        MinuteCounts {
            bucket,
            succeeded,
            error,
            ..Default::default()
        }
    }

    #[test]
    fn test_observed_rates() {
        let m = minute(0, 7, 3);
        assert_eq!(m.observed(MetricType::ErrorRate), Some(0.3));
        assert_eq!(m.observed(MetricType::ApprovalRate), Some(0.7));
        let empty = MinuteCounts::default();
        assert_eq!(empty.observed(MetricType::ErrorRate), None);
    }

    #[test]
    fn test_rejected_excluded_from_rate_denominator() {
        let mut m = minute(0, 8, 2);
        m.rejected = 90;
        // 2 errors over 10 terminal outcomes, not over 100 events.
        assert_eq!(m.observed(MetricType::ErrorRate), Some(0.2));
        assert_eq!(m.observed(MetricType::TotalVolume), Some(100.0));
    }

    #[test]
    fn test_persistent_trend_confirms() {
        // Errors spread evenly across ten minutes: 7 good + 3 bad per minute.
        let window = WindowCounts {
            minutes: (0..10).map(|b| minute(b, 7, 3)).collect(),
        };
        assert!(confirm_trend(
            &window,
            MetricType::ErrorRate,
            Operator::Gt,
            0.10,
            8
        ));
    }

    #[test]
    fn test_single_spike_is_ignored() {
        // All 30 errors land in the final minute.
        let mut minutes: Vec<MinuteCounts> = (0..9).map(|b| minute(b, 10, 0)).collect();
        minutes.push(minute(9, 0, 30));
        let window = WindowCounts { minutes };

        // Window-level rate fires (30/120 = 0.25) but only one sub-window does.
        assert!(window.observed(MetricType::ErrorRate).unwrap() > 0.10);
        assert!(!confirm_trend(
            &window,
            MetricType::ErrorRate,
            Operator::Gt,
            0.10,
            8
        ));
    }

    #[test]
    fn test_too_few_trafficked_subwindows() {
        let window = WindowCounts {
            minutes: vec![minute(0, 5, 5), minute(1, 5, 5)],
        };
        assert!(!confirm_trend(
            &window,
            MetricType::ErrorRate,
            Operator::Gt,
            0.10,
            8
        ));
    }

    #[test]
    fn test_adverse_floor_blocks_thin_trends() {
        // Consistently bad, but only 5 errors total (< floor of 8).
        let window = WindowCounts {
            minutes: (0..5).map(|b| minute(b, 2, 1)).collect(),
        };
        assert!(!confirm_trend(
            &window,
            MetricType::ErrorRate,
            Operator::Gt,
            0.10,
            8
        ));
        // Lowering the floor lets it through.
        assert!(confirm_trend(
            &window,
            MetricType::ErrorRate,
            Operator::Gt,
            0.10,
            5
        ));
    }

    #[test]
    fn test_volume_trend_degenerates() {
        let window = WindowCounts {
            minutes: vec![minute(0, 2, 0)],
        };
        assert!(confirm_trend(
            &window,
            MetricType::TotalVolume,
            Operator::Lt,
            100.0,
            8
        ));
    }

    #[test]
    fn test_recovery_tail() {
        use EventStatus::*;
        assert!(recovered_rates(
            &[Succeeded, Succeeded, Succeeded, Succeeded, Succeeded, Error],
            5
        ));
        assert!(!recovered_rates(
            &[Succeeded, Succeeded, Error, Succeeded, Succeeded, Succeeded],
            5
        ));
        assert!(!recovered_rates(&[Succeeded, Succeeded], 5));
    }

    #[test]
    fn test_recovery_volume() {
        // Rule fires on volume < 100; recovery needs traffic back above it.
        assert!(recovered_volume(Operator::Lt, 100.0, 150));
        assert!(!recovered_volume(Operator::Lt, 100.0, 50));
        assert!(!recovered_volume(Operator::Lt, 100.0, 0));
    }
}

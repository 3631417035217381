/// Reception counters, kept across frames for the lifetime of a protocol instance
#[derive(Debug, Clone, Default)]
pub struct ReceptionStatistics {
    dropped_receptions: u64,
    completed_receptions: u64,
    /// running mean over all completed receptions of (bytes requested for resend) / (frame size)
    lost_segment_rate: f64,
}

impl ReceptionStatistics {
    pub fn dropped_receptions(&self) -> u64 {
        self.dropped_receptions
    }

    pub fn completed_receptions(&self) -> u64 {
        self.completed_receptions
    }

    pub fn lost_segment_rate(&self) -> f64 {
        self.lost_segment_rate
    }

    pub fn on_dropped(&mut self) {
        self.dropped_receptions += 1;
    }

    pub fn on_completed(&mut self, lost_bytes: usize, total_bytes: usize) {
        self.completed_receptions += 1;

        let ratio = if total_bytes == 0 {
            0.0
        }
        else {
            lost_bytes as f64 / total_bytes as f64
        };
        let n = self.completed_receptions as f64;
        self.lost_segment_rate = (self.lost_segment_rate * (n - 1.0) + ratio) / n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_segment_rate_is_running_mean() {
        let mut stats = ReceptionStatistics::default();
        stats.on_completed(0, 1000);
        assert_eq!(stats.lost_segment_rate(), 0.0);

        stats.on_completed(500, 1000);
        assert_eq!(stats.lost_segment_rate(), 0.25);

        stats.on_completed(1000, 1000);
        assert_eq!(stats.lost_segment_rate(), 0.5);
        assert_eq!(stats.completed_receptions(), 3);
        assert_eq!(stats.dropped_receptions(), 0);

        stats.on_dropped();
        assert_eq!(stats.dropped_receptions(), 1);
    }
}

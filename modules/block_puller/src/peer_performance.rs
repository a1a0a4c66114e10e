//! Per-peer download statistics used to rank peers for new assignments

use std::time::Duration;

/// Weight of the newest latency sample in the moving average
const LATENCY_SMOOTHING: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct PeerPerformance {
    /// Best height the peer has advertised
    pub best_height: u64,
    /// Exponentially weighted request-to-delivery latency
    pub avg_latency: Option<Duration>,
    /// Stall penalties accumulated so far
    pub penalties: u32,
    /// Bodies currently assigned to this peer
    pub in_flight: usize,
    /// False once the peer has been penalised out of the rotation
    pub eligible: bool,
}

impl PeerPerformance {
    pub fn new(best_height: u64) -> Self {
        Self {
            best_height,
            avg_latency: None,
            penalties: 0,
            in_flight: 0,
            eligible: true,
        }
    }

    pub fn record_delivery(&mut self, latency: Duration) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.avg_latency = Some(match self.avg_latency {
            None => latency,
            Some(avg) => avg.mul_f64(1.0 - LATENCY_SMOOTHING) + latency.mul_f64(LATENCY_SMOOTHING),
        });
    }

    /// Count a stall against the peer. Returns true if it just lost eligibility.
    pub fn penalise(&mut self, penalty_limit: u32) -> bool {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.penalties += 1;
        if self.eligible && self.penalties >= penalty_limit {
            self.eligible = false;
            return true;
        }
        false
    }

    /// Quality independent of current load: faster and less penalised is better
    pub fn quality(&self) -> f64 {
        let latency = self.avg_latency.map_or(0.0, |l| l.as_secs_f64());
        1.0 / (1.0 + latency) / (1.0 + self.penalties as f64)
    }

    /// Ranking for the next assignment; load spreads work across peers
    pub fn score(&self) -> f64 {
        self.quality() / (1.0 + self.in_flight as f64)
    }

    pub fn can_serve(&self, height: u64, max_in_flight: usize) -> bool {
        self.eligible && self.best_height >= height && self.in_flight < max_in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_is_smoothed() {
        let mut perf = PeerPerformance::new(10);
        perf.in_flight = 2;
        perf.record_delivery(Duration::from_secs(1));
        assert_eq!(perf.avg_latency, Some(Duration::from_secs(1)));
        perf.record_delivery(Duration::from_secs(2));
        let avg = perf.avg_latency.unwrap().as_secs_f64();
        assert!((avg - 1.3).abs() < 1e-6);
        assert_eq!(perf.in_flight, 0);
    }

    #[test]
    fn penalties_reduce_quality_and_eventually_eligibility() {
        let mut perf = PeerPerformance::new(10);
        let fresh = perf.quality();
        assert!(!perf.penalise(2));
        assert!(perf.quality() < fresh);
        assert!(perf.penalise(2));
        assert!(!perf.eligible);
        assert!(!perf.can_serve(1, 16));
    }

    #[test]
    fn load_lowers_score() {
        let mut perf = PeerPerformance::new(10);
        let idle = perf.score();
        perf.in_flight = 3;
        assert!(perf.score() < idle);
        assert!(perf.can_serve(10, 4));
        assert!(!perf.can_serve(11, 4));
        assert!(!perf.can_serve(5, 3));
    }
}

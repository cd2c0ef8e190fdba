//! Retransmission timeout estimation.
//!
//! Reliable delivery requires that unacknowledged messages are re-sent if no
//! ACK arrives within a bounded time.  Each destination peer owns one
//! [`RttEstimator`]; the link's ack checker compares the time since a
//! packet's last send attempt against that peer's [`RttEstimator::rto`].
//!
//! RTO is computed with Jacobson/Karels smoothing:
//!   `SRTT   = 7/8·SRTT + 1/8·R`
//!   `RTTVAR = 3/4·RTTVAR + 1/4·|R − SRTT|`
//!   `RTO    = SRTT + 4·RTTVAR`
//! clamped to `[min_rto, max_rto]`.  A timeout leaves the estimate as it was;
//! the congestion window takes the penalty instead.

use std::time::Duration;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Floor applied to every computed RTO.
    pub min_rto: Duration,
    /// Ceiling applied to every computed RTO.
    pub max_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(1000),
            min_rto: Duration::from_millis(1),
            max_rto: Duration::from_secs(60),
        }
    }
}

/// Smoothed RTT state for one destination peer.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    config: TimerConfig,
    /// Smoothed RTT estimate (SRTT).
    srtt: Option<Duration>,
    /// RTT deviation estimate (RTTVAR).
    rttvar: Duration,
    current_rto: Duration,
}

impl RttEstimator {
    pub fn new(config: TimerConfig) -> Self {
        let current_rto = clamp(config.initial_rto, &config);
        Self {
            config,
            srtt: None,
            rttvar: Duration::ZERO,
            current_rto,
        }
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO.
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples update SRTT first, then measure the deviation
    /// against the updated SRTT.
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                // First measurement.
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let srtt = srtt * 7 / 8 + sample / 8;
                let diff = sample.abs_diff(srtt);
                self.srtt = Some(srtt);
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
            }
        }
        let srtt = self.srtt.unwrap_or(sample);
        self.current_rto = clamp(srtt + self.rttvar * 4, &self.config);
    }

    /// Current retransmission timeout; always within `[min_rto, max_rto]`.
    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }
}

fn clamp(rto: Duration, config: &TimerConfig) -> Duration {
    // `Duration::clamp` panics when min > max; a misconfigured floor wins.
    rto.min(config.max_rto).max(config.min_rto)
}

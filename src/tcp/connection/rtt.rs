use super::timers::{TCPTV_MIN, TCPTV_REXMTMAX, TCPTV_SRTTBASE, TCPTV_SRTTDFLT, TCP_BACKOFF, TCP_MAXRXTSHIFT};
use crate::tcp::clock::PR_SLOWHZ;

/// `srtt` is kept as fixed point with 3 fractional bits.
pub const TCP_RTT_SHIFT: u32 = 3;
/// `rttvar` is kept as fixed point with 2 fractional bits.
pub const TCP_RTTVAR_SHIFT: u32 = 2;

/// Round-trip estimation and retransmission timeout state (Jacobson/Karels).
///
/// All values are in slow ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttEstimator {
    /// Smoothed RTT, scaled by 8. Zero until the first sample.
    pub srtt: i32,
    /// Smoothed mean deviation, scaled by 4.
    pub rttvar: i32,
    pub rttmin: u32,
    /// Current retransmission timeout.
    pub rxtcur: u32,
    /// Number of consecutive retransmission backoffs.
    pub shift: usize,
    /// Ticks since the timed segment went out, zero if nothing is timed.
    pub rtt: u32,
    /// Sequence number of the timed segment.
    pub rtseq: u32,
}

impl RttEstimator {
    /// `rtt_default` is the initial RTT guess in seconds.
    pub fn new(rtt_default: u32) -> Self {
        let rttvar = (rtt_default * PR_SLOWHZ) << TCP_RTTVAR_SHIFT;
        let srtt = TCPTV_SRTTBASE as i32;
        Self {
            srtt,
            rttvar: rttvar as i32,
            rttmin: TCPTV_MIN,
            rxtcur: ((((srtt >> 2) as u32) + (TCPTV_SRTTDFLT << 2)) >> 1)
                .clamp(TCPTV_MIN, TCPTV_REXMTMAX),
            shift: 0,
            rtt: 0,
            rtseq: 0,
        }
    }

    /// Starts timing the segment starting at `seq`, unless another one is
    /// already being timed.
    pub fn start_timing(&mut self, seq: u32) {
        if self.rtt == 0 {
            self.rtt = 1;
            self.rtseq = seq;
        }
    }

    pub fn is_timing(&self) -> bool {
        self.rtt != 0
    }

    /// Folds a new measurement into the estimate and recomputes the timeout.
    pub fn sample(&mut self, rtt: u32) {
        let rtt = rtt.min(i32::MAX as u32 >> TCP_RTT_SHIFT) as i32;
        if self.srtt != 0 {
            // Gains of 1/8 and 1/4, in fixed point. The sample is moved to
            // origin 0.
            let mut delta = rtt - 1 - (self.srtt >> TCP_RTT_SHIFT);
            self.srtt += delta;
            if self.srtt <= 0 {
                self.srtt = 1;
            }

            delta = delta.abs() - (self.rttvar >> TCP_RTTVAR_SHIFT);
            self.rttvar += delta;
            if self.rttvar <= 0 {
                self.rttvar = 1;
            }
        } else {
            // First sample, deviation starts at half the RTT.
            self.srtt = rtt << TCP_RTT_SHIFT;
            self.rttvar = rtt << (TCP_RTTVAR_SHIFT - 1);
        }

        self.rtt = 0;
        self.shift = 0;
        self.rxtcur = self.rexmt_val().clamp(self.rttmin, TCPTV_REXMTMAX);
    }

    /// `srtt + 4 * rttvar` in ticks.
    pub fn rexmt_val(&self) -> u32 {
        ((self.srtt >> TCP_RTT_SHIFT) + self.rttvar).max(0) as u32
    }

    /// Advances the backoff for a retransmission timeout and returns the new
    /// timeout, or `None` once the backoff limit is exceeded.
    pub fn backoff(&mut self) -> Option<u32> {
        self.shift += 1;
        if self.shift > TCP_MAXRXTSHIFT {
            self.shift = TCP_MAXRXTSHIFT;
            return None;
        }

        self.rxtcur = self
            .rexmt_val()
            .saturating_mul(TCP_BACKOFF[self.shift])
            .clamp(self.rttmin, TCPTV_REXMTMAX);

        // After several backoffs the estimate is probably wrong. Fold the
        // smoothed RTT into the deviation and forget it, so the next sample
        // starts fresh.
        if self.shift > TCP_MAXRXTSHIFT / 4 {
            self.rttvar += self.srtt >> TCP_RTT_SHIFT;
            self.srtt = 0;
        }
        self.rtt = 0;
        Some(self.rxtcur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_timeout_is_six_seconds() {
        let rtt = RttEstimator::new(3);
        assert_eq!(rtt.srtt, 0);
        assert_eq!(rtt.rttvar, 24);
        assert_eq!(rtt.rxtcur, 12);
    }

    #[test]
    fn first_sample_seeds_mean_and_deviation() {
        let mut rtt = RttEstimator::new(3);
        rtt.start_timing(100);
        rtt.sample(4);
        assert_eq!(rtt.srtt, 32);
        assert_eq!(rtt.rttvar, 8);
        assert_eq!(rtt.rxtcur, 12);
        assert!(!rtt.is_timing());
    }

    #[test]
    fn samples_converge() {
        let mut rtt = RttEstimator::new(3);
        for _ in 0..64 {
            rtt.sample(9);
        }
        // srtt approaches rtt - 1 in ticks, rttvar decays to its floor.
        assert_eq!(rtt.srtt >> TCP_RTT_SHIFT, 8);
        assert!(rtt.rttvar <= 4);
        assert!((8..=12).contains(&rtt.rxtcur));
    }

    #[test]
    fn timeout_is_clamped() {
        let mut rtt = RttEstimator::new(3);
        rtt.sample(1);
        assert_eq!(rtt.rxtcur, 3);
        rtt.rttvar = 0;
        rtt.srtt = 0;
        rtt.sample(0);
        assert_eq!(rtt.rxtcur, TCPTV_MIN);
        rtt.sample(10_000);
        assert_eq!(rtt.rxtcur, TCPTV_REXMTMAX);
    }

    #[test]
    fn backoff_saturates_on_a_huge_estimate() {
        let mut rtt = RttEstimator::new(3);
        rtt.sample(u32::MAX);
        for _ in 0..TCP_MAXRXTSHIFT {
            assert_eq!(rtt.backoff(), Some(TCPTV_REXMTMAX));
        }
    }

    #[test]
    fn backoff_gives_up_after_max_shift() {
        let mut rtt = RttEstimator::new(3);
        let mut last = 0;
        for _ in 0..TCP_MAXRXTSHIFT {
            let next = rtt.backoff().expect("within backoff limit");
            assert!(next >= last);
            last = next;
        }
        assert_eq!(last, TCPTV_REXMTMAX);
        assert_eq!(rtt.backoff(), None);
    }
}

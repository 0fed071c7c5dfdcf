use super::{Connection, TCP_MAXWIN};

/// Number of duplicate ACKs that trigger a fast retransmit.
pub const TCP_REXMT_THRESH: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionControl {
    /// Effective segment size for this connection.
    pub mss: u16,

    // Congestion control variables
    pub wnd: u32,
    pub ssthresh: u32,
    pub dup_acks: u32,
}

impl CongestionControl {
    pub fn new(mss: u16) -> Self {
        Self {
            mss,
            wnd: u32::from(mss),
            ssthresh: TCP_MAXWIN << 14,
            dup_acks: 0,
        }
    }

    /// Adopts a negotiated segment size and restarts from one segment.
    pub fn set_mss(&mut self, mss: u16) {
        self.mss = mss;
        self.wnd = u32::from(mss);
    }

    /// Opens the window for an ACK of new data: one segment per ACK in slow
    /// start, roughly one segment per window in congestion avoidance.
    pub fn on_ack(&mut self, snd_scale: u8) {
        let mss = u32::from(self.mss);
        let incr = if self.wnd > self.ssthresh {
            (mss * mss / self.wnd).max(1)
        } else {
            mss
        };
        self.wnd = self.wnd.saturating_add(incr).min(TCP_MAXWIN << snd_scale);
    }

    /// Halves the flight estimate into `ssthresh` (at least two segments)
    /// and collapses the window to one segment. Used by both retransmission
    /// timeout and fast retransmit.
    pub fn on_loss(&mut self, snd_wnd: u32) {
        let mss = u32::from(self.mss);
        let flight = (snd_wnd.min(self.wnd) / 2 / mss).max(2);
        self.ssthresh = flight * mss;
        self.wnd = mss;
    }

    /// Counts a duplicate ACK. Returns true when the fast retransmit
    /// threshold has just been reached.
    pub fn on_dup_ack(&mut self) -> bool {
        self.dup_acks += 1;
        if self.dup_acks > TCP_REXMT_THRESH {
            // Every further duplicate means a segment left the network.
            self.wnd = self.wnd.saturating_add(u32::from(self.mss));
        }
        self.dup_acks == TCP_REXMT_THRESH
    }

    /// Leaves recovery once new data is acknowledged.
    pub fn on_new_ack(&mut self) {
        if self.dup_acks > TCP_REXMT_THRESH && self.wnd > self.ssthresh {
            self.wnd = self.ssthresh;
        }
        self.dup_acks = 0;
    }

    pub fn in_recovery(&self) -> bool {
        self.dup_acks > TCP_REXMT_THRESH
    }
}

impl Connection {
    /// Usable send window: the smaller of the peer's offer and `cwnd`.
    pub fn window(&self) -> u32 {
        self.send.wnd.min(self.cong.wnd)
    }
}

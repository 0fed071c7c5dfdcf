use tcp_types::tcp::TcpOption;

use super::{ConnFlags, Connection, TCP_MAX_WINSHIFT, TCP_MIN_MSS};

/// The TCP options of one inbound segment that the engine acts upon.
///
/// Parsing is side-effect free. SYN-only options are applied by
/// [`Connection::apply_syn_options`] once the SYN has been accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentOptions {
    pub mss: Option<u16>,
    pub wscale: Option<u8>,
    pub ts: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub val: u32,
    pub ecr: u32,
}

impl SegmentOptions {
    /// Extracts the options of a segment. MSS and window scale are only
    /// meaningful on a SYN and ignored otherwise.
    pub fn parse(options: &[TcpOption], syn: bool) -> Self {
        let mut parsed = Self::default();
        for option in options {
            match *option {
                TcpOption::MaximumSegmentSize(mss) if syn => parsed.mss = Some(mss),
                TcpOption::WindowScaling(shift) if syn => {
                    parsed.wscale = Some(shift.min(TCP_MAX_WINSHIFT));
                }
                TcpOption::Timestamp(val, ecr) => parsed.ts = Some(Timestamp { val, ecr }),
                TcpOption::EndOfOptionsList() => break,
                _ => {}
            }
        }
        parsed
    }
}

impl Connection {
    /// Records what the peer offered on an accepted SYN.
    pub(super) fn apply_syn_options(&mut self, opts: &SegmentOptions) {
        if let Some(shift) = opts.wscale {
            self.flags.insert(ConnFlags::RCVD_SCALE);
            self.scale.requested_snd = shift;
        }
        if let Some(ts) = opts.ts {
            self.flags.insert(ConnFlags::RCVD_TSTMP);
            self.ts.recent = ts.val;
            self.ts.recent_age = self.now();
        }
        self.negotiate_mss(opts.mss);
    }

    /// Effective segment size is the smaller of our configured MSS and the
    /// peer's offer, but never below [`TCP_MIN_MSS`]. The congestion window
    /// restarts at one segment.
    fn negotiate_mss(&mut self, offer: Option<u16>) {
        let mss = match offer {
            Some(offer) => offer.max(TCP_MIN_MSS).min(self.cfg.mss),
            None => self.cfg.mss,
        };
        self.cong.set_mss(mss);
    }

    /// Turns on window scaling in both directions if both sides asked for it.
    pub(super) fn apply_window_scale(&mut self) {
        if self
            .flags
            .contains(ConnFlags::REQ_SCALE | ConnFlags::RCVD_SCALE)
        {
            self.scale.snd = self.scale.requested_snd;
            self.scale.rcv = self.scale.request_rcv;
        }
    }
}

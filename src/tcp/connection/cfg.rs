use std::hash::{DefaultHasher, Hash, Hasher};

use crate::tcp::{clock::PR_SLOWHZ, Quad};

bitflags::bitflags! {
    /// Per-connection socket policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SocketFlags: u32 {
        /// Probe idle connections and drop them once the peer stops answering.
        const KEEPALIVE = 1 << 0;
        /// Close our side as soon as the peer's FIN arrives.
        const FIN_AFTER_TCP_FIN = 1 << 1;
        /// Close after `idle_time` without inbound segments.
        const FIN_AFTER_TCP_IDLE = 1 << 2;
        /// Close after `idle_time` without user payload.
        const FIN_AFTER_UDP_IDLE = 1 << 3;
    }
}

/// Connection configuration. Read once at creation, immutable afterwards.
///
/// All durations are in slow ticks (see [`PR_SLOWHZ`]).
#[derive(Debug, Clone)]
pub struct Config {
    /// Segment size advertised to, and assumed for, the peer.
    pub mss: u16,
    pub recv_buffer_cap: u32,
    /// Capacity of the send buffer in payload units.
    pub send_buffer_units: usize,
    /// Capacity of the reassembly queue in segments.
    pub reass_max_segments: usize,
    pub idle_time: u32,
    /// Requested receive window shift, clamped to 14.
    pub window_scale: u8,
    pub use_timestamps: bool,
    /// Suppress all TCP options on outbound SYNs.
    pub no_options: bool,
    pub keep_idle: u32,
    pub keep_intvl: u32,
    pub max_idle: u32,
    /// Initial RTT guess in seconds, used before the first sample.
    pub rtt_default: u32,
    pub so_flags: SocketFlags,
    pub iss: Option<u32>,
}

impl Config {
    pub fn iss_for(&self, quad: &Quad, secret: u64, now: u32) -> u32 {
        self.iss.unwrap_or_else(|| {
            // RFC 9293
            // -> 3.4.1. Initial Sequence Number Selection
            // ISN = M + F(localip, localport, remoteip, remoteport, secretkey)
            //
            // M runs at 4µs per step, i.e. 125000 steps per slow tick.
            let m = now.wrapping_mul(250_000 / PR_SLOWHZ);

            let mut hasher = DefaultHasher::new();
            quad.hash(&mut hasher);
            secret.hash(&mut hasher);

            m.wrapping_add(hasher.finish() as u32)
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1420,
            recv_buffer_cap: 0x10000,
            send_buffer_units: 256,
            reass_max_segments: 1024,
            idle_time: 0,
            window_scale: 0,
            use_timestamps: false,
            no_options: false,
            keep_idle: 120,
            keep_intvl: 120,
            max_idle: 120,
            rtt_default: 3,
            so_flags: SocketFlags::empty(),
            iss: None,
        }
    }
}

use std::io::{Error, ErrorKind};

use tcp_types::tcp::TcpFlags;
use tracing::{debug, instrument, trace};

use super::{ConnFlags, Connection, SocketFlags, State};
use crate::tcp::{clock::PR_SLOWHZ, sender::TcpSender, stats::Counter};

/// Maximum segment lifetime.
pub const TCPTV_MSL: u32 = 30 * PR_SLOWHZ;
/// Smoothed RTT before the first sample.
pub const TCPTV_SRTTBASE: u32 = 0;
/// Assumed RTT before the first sample.
pub const TCPTV_SRTTDFLT: u32 = 3 * PR_SLOWHZ;
pub const TCPTV_PERSMIN: u32 = 5 * PR_SLOWHZ;
pub const TCPTV_PERSMAX: u32 = 60 * PR_SLOWHZ;
/// Connection establishment timeout.
pub const TCPTV_KEEP_INIT: u32 = 75 * PR_SLOWHZ;
pub const TCPTV_MIN: u32 = PR_SLOWHZ;
pub const TCPTV_REXMTMAX: u32 = 64 * PR_SLOWHZ;

pub const TCP_MAXRXTSHIFT: usize = 12;
pub const TCP_BACKOFF: [u32; TCP_MAXRXTSHIFT + 1] = [1, 2, 4, 8, 16, 32, 64, 64, 64, 64, 64, 64, 64];

/// Timestamps older than this are no longer trusted by PAWS.
pub const TCP_PAWS_IDLE: u32 = 24 * 24 * 60 * 60 * PR_SLOWHZ;

/// The slow timers of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retransmit,
    Persist,
    /// Keepalive, doubling as the connection establishment timer.
    Keepalive,
    /// TIME_WAIT and FIN_WAIT_2 timer.
    TwoMsl,
    Idle,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::Retransmit,
        TimerKind::Persist,
        TimerKind::Keepalive,
        TimerKind::TwoMsl,
        TimerKind::Idle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TimerKind::Retransmit => "REXMT",
            TimerKind::Persist => "PERSIST",
            TimerKind::Keepalive => "KEEP",
            TimerKind::TwoMsl => "2MSL",
            TimerKind::Idle => "IDLE",
        }
    }
}

/// Countdown cells in slow ticks. Zero means disarmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timers {
    cells: [u32; 5],
}

impl Timers {
    pub fn get(&self, kind: TimerKind) -> u32 {
        self.cells[kind as usize]
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.get(kind) != 0
    }

    pub fn set(&mut self, kind: TimerKind, ticks: u32) {
        self.cells[kind as usize] = ticks;
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.set(kind, 0);
    }

    pub fn cancel_all(&mut self) {
        self.cells = [0; 5];
    }

    /// Counts `kind` down by one tick, true if it expired on this tick.
    fn decrement(&mut self, kind: TimerKind) -> bool {
        let cell = &mut self.cells[kind as usize];
        if *cell == 0 {
            return false;
        }
        *cell -= 1;
        *cell == 0
    }
}

impl Connection {
    /// Fast timer pass (every 200 ms): flushes a pending delayed ACK.
    #[instrument(level = "trace", name = "tcp_fasttimo", skip_all, fields(quad = %self.quad))]
    pub fn fast_tick(&mut self, tx: &mut TcpSender<'_>) {
        if self.terminated || !self.flags.contains(ConnFlags::DEL_ACK) {
            return;
        }
        self.flags.remove(ConnFlags::DEL_ACK);
        self.flags.insert(ConnFlags::ACK_NOW);
        self.ctx.stats.inc(Counter::DelAck);
        self.output(tx);
    }

    /// Slow timer pass (every 500 ms): counts every timer down and handles
    /// those that expire, then ages the idle and RTT counters.
    #[instrument(level = "trace", name = "tcp_slowtimo", skip_all, fields(quad = %self.quad))]
    pub fn slow_tick(&mut self, tx: &mut TcpSender<'_>) {
        if self.terminated {
            return;
        }
        for kind in TimerKind::ALL {
            if self.timers.decrement(kind) {
                self.on_timeout(tx, kind);
            }
        }
        self.idle = self.idle.saturating_add(1);
        if self.rtt.is_timing() {
            self.rtt.rtt += 1;
        }
    }

    fn on_timeout(&mut self, tx: &mut TcpSender<'_>, kind: TimerKind) {
        if self.terminated {
            return;
        }
        trace!(timer = kind.name(), state = ?self.state, "timer expired");
        match kind {
            // Either the FIN_WAIT_2 idle guard or the end of TIME_WAIT.
            TimerKind::TwoMsl => {
                if self.state != State::TimeWait && self.idle <= self.cfg.max_idle {
                    self.timers.set(TimerKind::TwoMsl, self.cfg.keep_intvl);
                } else {
                    self.set_state(State::Closed);
                }
            }

            TimerKind::Persist => {
                self.ctx.stats.inc(Counter::PersistTimeo);
                self.set_persist();
                self.force = true;
                self.output(tx);
                self.force = false;
            }

            TimerKind::Keepalive => {
                self.ctx.stats.inc(Counter::KeepTimeo);
                if self.state < State::Estab {
                    self.ctx.stats.inc(Counter::KeepDrops);
                    self.drop_with(tx, Error::new(ErrorKind::TimedOut, "connection timed out"));
                    return;
                }

                if self.cfg.so_flags.contains(SocketFlags::KEEPALIVE)
                    && self.state <= State::CloseWait
                {
                    if self.idle >= self.cfg.keep_idle + self.cfg.max_idle {
                        self.ctx.stats.inc(Counter::KeepDrops);
                        self.drop_with(
                            tx,
                            Error::new(ErrorKind::TimedOut, "keepalive timed out"),
                        );
                        return;
                    }

                    // A segment one byte left of the window forces the peer
                    // to answer with an ACK.
                    self.ctx.stats.inc(Counter::KeepProbe);
                    self.respond(
                        tx,
                        self.send.una.wrapping_sub(1),
                        self.recv.nxt,
                        TcpFlags::new().ack(true),
                    );
                    self.timers.set(TimerKind::Keepalive, self.cfg.keep_intvl);
                } else {
                    self.timers.set(TimerKind::Keepalive, self.cfg.keep_idle);
                }
            }

            TimerKind::Retransmit => {
                let Some(rxtcur) = self.rtt.backoff() else {
                    self.ctx.stats.inc(Counter::TimeoutDrop);
                    self.drop_with(
                        tx,
                        Error::new(ErrorKind::TimedOut, "retransmission limit exceeded"),
                    );
                    return;
                };
                self.ctx.stats.inc(Counter::RexmtTimeo);
                debug!(shift = self.rtt.shift, rxtcur, "retransmission timeout");

                self.timers.set(TimerKind::Retransmit, rxtcur);
                self.send.nxt = self.send.una;
                self.cong.on_loss(self.send.wnd);
                self.cong.dup_acks = 0;
                self.output(tx);
            }

            TimerKind::Idle => {
                debug!("idle timeout, closing");
                self.user_closed(tx);
            }
        }
    }

    /// Arms the persist timer with the backed-off RTO estimate, clamped to
    /// `[PERSMIN, PERSMAX]`.
    pub(super) fn set_persist(&mut self) {
        let t = (((self.rtt.srtt >> 2) + self.rtt.rttvar) >> 1).max(0) as u32;
        let ticks = t
            .saturating_mul(TCP_BACKOFF[self.rtt.shift])
            .clamp(TCPTV_PERSMIN, TCPTV_PERSMAX);
        self.timers.set(TimerKind::Persist, ticks);
        if self.rtt.shift < TCP_MAXRXTSHIFT {
            self.rtt.shift += 1;
        }
    }
}

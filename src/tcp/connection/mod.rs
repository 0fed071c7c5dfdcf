use bytes::Bytes;
use std::{
    fmt,
    io::{self, Error, ErrorKind},
    sync::Arc,
};
use tcp_types::tcp::{TcpFlags, TcpPacket};
use tracing::{debug, instrument, warn};

use super::{
    clock::TcpClock,
    reassembly::ReassemblyQueue,
    send_buffer::SendBuffer,
    sender::TcpSender,
    seq::{seq_diff, seq_gt, seq_lt},
    stats::{Counter, TcpStats},
    Quad,
};

mod cfg;
mod cong;
mod input;
mod options;
mod output;
mod rtt;
mod timers;

pub use cfg::{Config, SocketFlags};
pub use cong::CongestionControl;
pub use rtt::RttEstimator;
pub use timers::{
    TimerKind, Timers, TCPTV_KEEP_INIT, TCPTV_MSL, TCPTV_PERSMAX, TCPTV_PERSMIN, TCPTV_REXMTMAX,
    TCP_MAXRXTSHIFT, TCP_PAWS_IDLE,
};

/// Largest window expressible without scaling.
pub const TCP_MAXWIN: u32 = 65535;
/// Largest window shift (RFC 7323).
pub const TCP_MAX_WINSHIFT: u8 = 14;
/// Smallest segment size used in either direction, room for a full option set.
pub const TCP_MIN_MSS: u16 = 64;

/// Connection states, ordered as in 4.4BSD so that range checks such as
/// "has received a SYN" are plain comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Estab,
    CloseWait,
    FinWait1,
    Closing,
    LastAck,
    FinWait2,
    TimeWait,
}

impl State {
    pub fn have_rcvd_syn(self) -> bool {
        self >= State::SynRcvd
    }

    /// States in which the peer's FIN has been consumed.
    pub fn have_rcvd_fin(self) -> bool {
        matches!(
            self,
            State::CloseWait | State::Closing | State::LastAck | State::TimeWait
        )
    }

    pub fn is_synchronized(self) -> bool {
        self >= State::Estab
    }

    /// Control flags every segment sent in this state carries.
    pub fn out_flags(self) -> TcpFlags {
        let flags = TcpFlags::new();
        match self {
            State::Closed => flags.rst(true).ack(true),
            State::Listen => flags,
            State::SynSent => flags.syn(true),
            State::SynRcvd => flags.syn(true).ack(true),
            State::Estab | State::CloseWait | State::FinWait2 | State::TimeWait => flags.ack(true),
            State::FinWait1 | State::Closing | State::LastAck => flags.fin(true).ack(true),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynRcvd => "SYN_RECEIVED",
            State::Estab => "ESTABLISHED",
            State::CloseWait => "CLOSE_WAIT",
            State::FinWait1 => "FIN_WAIT_1",
            State::Closing => "CLOSING",
            State::LastAck => "LAST_ACK",
            State::FinWait2 => "FIN_WAIT_2",
            State::TimeWait => "TIME_WAIT",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Locally initiated, a SYN is sent on creation.
    Outgoing,
    /// Remote initiated, the connection waits in LISTEN for the peer's SYN.
    Incoming,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnFlags: u16 {
        /// Acknowledge on the next output pass.
        const ACK_NOW = 1 << 0;
        /// An acknowledgement is owed, the fast timer will send it.
        const DEL_ACK = 1 << 1;
        /// Send no options on SYNs.
        const NO_OPT = 1 << 2;
        const SENT_FIN = 1 << 3;
        const REQ_SCALE = 1 << 4;
        const RCVD_SCALE = 1 << 5;
        const REQ_TSTMP = 1 << 6;
        const RCVD_TSTMP = 1 << 7;
    }
}

/// Collaborators shared by every connection of a speaker.
#[derive(Debug, Clone)]
pub struct TcpContext {
    pub clock: TcpClock,
    pub stats: Arc<TcpStats>,
    /// Key for initial sequence number generation.
    pub secret: u64,
}

impl TcpContext {
    pub fn new() -> Self {
        Self {
            clock: TcpClock::new(),
            stats: Arc::new(TcpStats::new()),
            secret: rand::random(),
        }
    }
}

impl Default for TcpContext {
    fn default() -> Self {
        Self::new()
    }
}

/// State of the Send Sequence Space (RFC 793 S3.2 F4)
///
/// ```text
///            1         2          3          4
///       ----------|----------|----------|----------
///              SND.UNA    SND.NXT    SND.UNA
///                                   +SND.WND
///
/// 1 - old sequence numbers which have been acknowledged
/// 2 - sequence numbers of unacknowledged data
/// 3 - sequence numbers allowed for new data transmission
/// 4 - future sequence numbers which are not yet allowed
/// ```
///
/// `max` tracks the highest sequence number ever sent, `nxt` may be pulled
/// back below it for retransmission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSequenceSpace {
    /// send unacknowledged
    pub una: u32,
    /// send next
    pub nxt: u32,
    /// highest sequence number sent
    pub max: u32,
    /// send window, already scaled
    pub wnd: u32,
    /// send urgent pointer
    pub up: u32,
    /// segment sequence number used for last window update
    pub wl1: u32,
    /// segment acknowledgment number used for last window update
    pub wl2: u32,
    /// initial send sequence number
    pub iss: u32,
    /// largest window the peer ever offered
    pub max_wnd: u32,
}

/// State of the Receive Sequence Space (RFC 793 S3.2 F5)
///
/// ```text
///                1          2          3
///            ----------|----------|----------
///                   RCV.NXT    RCV.NXT
///                             +RCV.WND
///
/// 1 - old sequence numbers which have been acknowledged
/// 2 - sequence numbers allowed for new reception
/// 3 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvSequenceSpace {
    /// receive next
    pub nxt: u32,
    /// receive window
    pub wnd: u32,
    /// right edge of the window advertised so far
    pub adv: u32,
    /// receive urgent pointer
    pub up: u32,
    /// initial receive sequence number
    pub irs: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowScale {
    /// shift applied to windows the peer advertises
    pub snd: u8,
    /// shift applied to windows we advertise
    pub rcv: u8,
    /// shift the peer asked for
    pub requested_snd: u8,
    /// shift we ask for
    pub request_rcv: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampState {
    /// Most recent valid timestamp from the peer, zero if none.
    pub recent: u32,
    /// Clock value when `recent` was recorded.
    pub recent_age: u32,
    /// The ACK number of the last segment we sent.
    pub last_ack_sent: u32,
}

/// A single TCP connection.
///
/// All processing happens through `&mut self`: segment input, timer ticks
/// and user requests. Outbound segments go to the [`TcpSender`] passed to
/// each call. In-order payload is handed out through [`Connection::pull`].
pub struct Connection {
    pub quad: Quad,
    pub state: State,
    pub send: SendSequenceSpace,
    pub recv: RecvSequenceSpace,
    pub cong: CongestionControl,
    pub rtt: RttEstimator,
    pub timers: Timers,
    pub flags: ConnFlags,
    pub scale: WindowScale,
    pub ts: TimestampState,
    /// Slow ticks since the last inbound segment.
    pub idle: u32,

    force: bool,
    terminated: bool,
    closed_with: Option<io::Error>,

    tx_buffer: SendBuffer,
    rx_buffer: ReassemblyQueue,

    cfg: Config,
    ctx: TcpContext,
}

impl Connection {
    pub fn new(
        tx: &mut TcpSender<'_>,
        quad: Quad,
        direction: Direction,
        cfg: Config,
        ctx: TcpContext,
    ) -> Self {
        let mut con = Self::blank(quad, cfg, ctx);
        match direction {
            Direction::Outgoing => con.open(tx),
            Direction::Incoming => con.set_state(State::Listen),
        }
        con
    }

    /// Opens a connection to `quad.dst`, emitting the initial SYN.
    pub fn connect(tx: &mut TcpSender<'_>, quad: Quad, cfg: Config, ctx: TcpContext) -> Self {
        Self::new(tx, quad, Direction::Outgoing, cfg, ctx)
    }

    /// Creates a connection that waits for a SYN from `quad.dst`.
    pub fn listen(quad: Quad, cfg: Config, ctx: TcpContext) -> Self {
        let mut con = Self::blank(quad, cfg, ctx);
        con.set_state(State::Listen);
        con
    }

    fn blank(quad: Quad, mut cfg: Config, ctx: TcpContext) -> Self {
        cfg.mss = cfg.mss.max(TCP_MIN_MSS);

        let mut flags = ConnFlags::empty();
        if cfg.no_options {
            flags |= ConnFlags::NO_OPT;
        }
        if cfg.window_scale > 0 {
            flags |= ConnFlags::REQ_SCALE;
        }
        if cfg.use_timestamps {
            flags |= ConnFlags::REQ_TSTMP;
        }

        Connection {
            quad,
            state: State::Closed,
            send: SendSequenceSpace::default(),
            recv: RecvSequenceSpace::default(),
            cong: CongestionControl::new(cfg.mss),
            rtt: RttEstimator::new(cfg.rtt_default),
            timers: Timers::default(),
            flags,
            scale: WindowScale {
                request_rcv: cfg.window_scale.min(TCP_MAX_WINSHIFT),
                ..Default::default()
            },
            ts: TimestampState::default(),
            idle: 0,
            force: false,
            terminated: false,
            closed_with: None,
            tx_buffer: SendBuffer::new(cfg.send_buffer_units),
            rx_buffer: ReassemblyQueue::new(cfg.reass_max_segments),
            cfg,
            ctx,
        }
    }

    /// Active open: pick an ISS and send a SYN.
    fn open(&mut self, tx: &mut TcpSender<'_>) {
        self.ctx.stats.inc(Counter::Connects);
        self.start_active_open();
        self.output(tx);
    }

    fn start_active_open(&mut self) {
        self.init_send_sequence();
        self.set_state(State::SynSent);
        self.timers.set(TimerKind::Keepalive, TCPTV_KEEP_INIT);
    }

    fn init_send_sequence(&mut self) {
        let iss = self.cfg.iss_for(&self.quad, self.ctx.secret, self.now());
        self.send.iss = iss;
        self.send.una = iss;
        self.send.nxt = iss;
        self.send.max = iss;
        self.send.up = iss;
    }

    fn init_recv_sequence(&mut self, irs: u32) {
        self.recv.irs = irs;
        self.recv.nxt = irs.wrapping_add(1);
        self.recv.adv = self.recv.nxt;
    }

    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(quad = %self.quad, from = %self.state, to = %state, "state transition");
        }
        self.state = state;
        if state == State::Closed && !self.terminated {
            self.terminated = true;
            self.timers.cancel_all();
            self.ctx.stats.inc(Counter::Closed);
        }
    }

    /// Aborts the connection with `err`. A synchronized connection tells the
    /// peer with a reset.
    pub(crate) fn drop_with(&mut self, tx: &mut TcpSender<'_>, err: io::Error) {
        if self.terminated {
            return;
        }
        if self.state.have_rcvd_syn() {
            self.state = State::Closed;
            self.output(tx);
        }
        self.close_with(err);
    }

    /// Tears the connection down with `err` without telling the peer.
    fn close_with(&mut self, err: io::Error) {
        warn!(quad = %self.quad, state = %self.state, "dropping connection: {err}");
        self.ctx.stats.inc(Counter::Drops);
        self.closed_with = Some(err);
        self.set_state(State::Closed);
    }

    /// Queues user payload for transmission.
    ///
    /// A connection still in LISTEN turns into an active open. Fails with
    /// [`ErrorKind::NotConnected`] once the send side is closed and with
    /// [`ErrorKind::WouldBlock`] if the send buffer is full.
    #[instrument(level = "trace", name = "tcp_usrsend", skip_all, fields(quad = %self.quad, len = payload.len()))]
    pub fn send(&mut self, tx: &mut TcpSender<'_>, payload: Bytes) -> io::Result<()> {
        if self.terminated || self.state > State::CloseWait {
            return Err(Error::new(
                ErrorKind::NotConnected,
                "connection is closed for sending",
            ));
        }

        if self.cfg.so_flags.contains(SocketFlags::FIN_AFTER_UDP_IDLE) {
            self.timers.set(TimerKind::Idle, self.cfg.idle_time);
        }
        if self.state == State::Listen {
            self.ctx.stats.inc(Counter::Connects);
            self.start_active_open();
        }

        let result = self.tx_buffer.push(payload);
        if let Err(ref e) = result {
            self.ctx.stats.inc(Counter::SndBufFull);
            warn!(quad = %self.quad, "user payload rejected: {e}");
        }
        self.output(tx);
        result
    }

    /// Graceful close of the send side.
    #[instrument(level = "trace", name = "tcp_usrclosed", skip_all, fields(quad = %self.quad))]
    pub fn close(&mut self, tx: &mut TcpSender<'_>) {
        self.user_closed(tx);
    }

    pub(crate) fn user_closed(&mut self, tx: &mut TcpSender<'_>) {
        if self.terminated {
            return;
        }
        match self.state {
            State::Closed | State::Listen | State::SynSent => {
                self.set_state(State::Closed);
                return;
            }
            State::SynRcvd | State::Estab => self.set_state(State::FinWait1),
            State::CloseWait => self.set_state(State::LastAck),
            _ => return,
        }
        self.output(tx);
    }

    /// Abortive close.
    pub fn abort(&mut self, tx: &mut TcpSender<'_>) {
        self.drop_with(
            tx,
            Error::new(ErrorKind::ConnectionAborted, "connection aborted by user"),
        );
    }

    /// Hands out the next block of in-order payload.
    ///
    /// Freeing receive buffer space may warrant a window update, which is
    /// sent right away.
    pub fn pull(&mut self, tx: &mut TcpSender<'_>) -> Option<Bytes> {
        if !self.is_pullable() {
            return None;
        }
        let payload = self.rx_buffer.pull_front()?;
        if self.state.have_rcvd_syn() && !self.terminated {
            self.output(tx);
        }
        Some(payload)
    }

    /// Whether [`Connection::pull`] would yield payload.
    ///
    /// The queue's front must lie below `rcv_nxt`, which keeps payload that
    /// arrived beyond a gap from being delivered.
    pub fn is_pullable(&self) -> bool {
        self.rx_buffer.is_pullable()
            && self
                .rx_buffer
                .first_seq()
                .is_some_and(|seq| seq_lt(seq, self.recv.nxt))
    }

    /// Whether more user payload is welcome: the send buffer has room and
    /// holds no more than the peer's current window.
    pub fn accepts_user_data(&self) -> bool {
        !self.terminated
            && self.state <= State::CloseWait
            && !self.tx_buffer.is_full()
            && self.tx_buffer.byte_len() <= self.send.wnd
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// True once the connection reached CLOSED and may be reclaimed.
    pub fn is_closed(&self) -> bool {
        self.terminated
    }

    /// Why the connection was torn down, if it was not a graceful close.
    pub fn error(&self) -> Option<&io::Error> {
        self.closed_with.as_ref()
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.closed_with.take()
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn send_buffer(&self) -> &SendBuffer {
        &self.tx_buffer
    }

    pub fn recv_queue(&self) -> &ReassemblyQueue {
        &self.rx_buffer
    }

    /// Bytes sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.send.max.wrapping_sub(self.send.una)
    }

    /// Free space in the receive buffer.
    pub fn recv_space(&self) -> u32 {
        self.cfg
            .recv_buffer_cap
            .saturating_sub(self.rx_buffer.byte_len() as u32)
    }

    fn now(&self) -> u32 {
        self.ctx.clock.now()
    }

    /// Advances `rcv_nxt` over queued payload that continues it.
    fn reass_advance(&mut self) {
        let (Some(first), Some(last_nxt)) =
            (self.rx_buffer.first_seq(), self.rx_buffer.last_nxt())
        else {
            return;
        };
        if seq_diff(first, self.recv.nxt) <= 0 && seq_gt(last_nxt, self.recv.nxt) {
            self.recv.nxt = last_nxt;
        }
    }

    /// True if the receive queue holds nothing beyond `rcv_nxt`, i.e. it is
    /// empty or ordered up to the next expected byte.
    fn rx_caught_up(&self) -> bool {
        (self.rx_buffer.is_empty() || self.rx_buffer.is_ordered())
            && self
                .rx_buffer
                .expected()
                .map_or(true, |nxt| nxt == self.recv.nxt)
    }

    /// Sends a bare control segment outside the normal output path.
    fn respond(&mut self, tx: &mut TcpSender<'_>, seq: u32, ack: u32, flags: TcpFlags) {
        let window = if flags.rst {
            0
        } else {
            (self.recv_space().min(TCP_MAXWIN << self.scale.rcv) >> self.scale.rcv) as u16
        };
        let flags = if flags.rst { flags } else { TcpFlags::new().ack(true) };
        self.ctx.stats.inc(Counter::SndTotal);
        tx.send(TcpPacket {
            src_port: self.quad.src.port(),
            dest_port: self.quad.dst.port(),
            seq_no: seq,
            ack_no: ack,
            flags,
            window,
            urgent_ptr: 0,
            options: Vec::new(),
            content: Bytes::new(),
        });
    }

    /// A snapshot of the control block for diagnostics.
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            quad: self.quad,
            state: self.state,
            snd_una: self.send.una,
            snd_nxt: self.send.nxt,
            in_flight: self.in_flight(),
            rcv_nxt: self.recv.nxt,
            rcv_adv: self.recv.adv,
            rcv_wnd: self.recv.wnd,
            snd_wnd: self.send.wnd,
            snd_cwnd: self.cong.wnd,
            ssthresh: self.cong.ssthresh,
            srtt: self.rtt.srtt,
            rttvar: self.rtt.rttvar,
            rxtcur: self.rtt.rxtcur,
            now: self.now(),
            timers: self.timers.clone(),
            send_buffered: self.tx_buffer.byte_len(),
            recv_queued: self.rx_buffer.byte_len(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("quad", &self.quad)
            .field("state", &self.state)
            .field("send", &self.send)
            .field("recv", &self.recv)
            .field("cong", &self.cong)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a connection, see [`Connection::summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub quad: Quad,
    pub state: State,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub in_flight: u32,
    pub rcv_nxt: u32,
    pub rcv_adv: u32,
    pub rcv_wnd: u32,
    pub snd_wnd: u32,
    pub snd_cwnd: u32,
    pub ssthresh: u32,
    pub srtt: i32,
    pub rttvar: i32,
    pub rxtcur: u32,
    pub now: u32,
    pub timers: Timers,
    pub send_buffered: u32,
    pub recv_queued: usize,
}

impl fmt::Display for ConnectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.quad, self.state)?;
        writeln!(
            f,
            "  snd_una {} snd_nxt {} in_flight {} snd_wnd {} buffered {}",
            self.snd_una, self.snd_nxt, self.in_flight, self.snd_wnd, self.send_buffered
        )?;
        writeln!(
            f,
            "  rcv_nxt {} rcv_adv {} rcv_wnd {} queued {}",
            self.rcv_nxt, self.rcv_adv, self.rcv_wnd, self.recv_queued
        )?;
        writeln!(
            f,
            "  snd_cwnd {} ssthresh {} srtt {} rttvar {} rxtcur {} now {}",
            self.snd_cwnd, self.ssthresh, self.srtt, self.rttvar, self.rxtcur, self.now
        )?;
        write!(f, "  timers")?;
        for kind in TimerKind::ALL {
            write!(f, " {} {}", kind.name(), self.timers.get(kind))?;
        }
        Ok(())
    }
}

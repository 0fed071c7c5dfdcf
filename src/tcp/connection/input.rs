use bytes::{Buf, Bytes};
use std::io::{Error, ErrorKind};
use tcp_types::tcp::{TcpFlags, TcpPacket};
use tracing::{debug, instrument, trace};

use super::{
    options::SegmentOptions, ConnFlags, Connection, SocketFlags, State, TimerKind, TCPTV_KEEP_INIT,
    TCPTV_MSL, TCP_PAWS_IDLE,
};
use crate::tcp::{
    sender::TcpSender,
    seq::{seq_diff, seq_gt, seq_leq, seq_lt, ts_geq, ts_lt},
    stats::Counter,
};

/// How a segment leaves input processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Done,
    /// Discard silently.
    Drop,
    /// Discard, but acknowledge to resynchronize the peer.
    DropAfterAck,
    /// Discard and answer with a reset.
    DropWithReset,
}

/// An inbound segment as it is trimmed down during processing.
#[derive(Debug)]
struct Segment {
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    /// Advertised window, already scaled.
    win: u32,
    content: Bytes,
    opts: SegmentOptions,
}

impl Segment {
    fn len(&self) -> u32 {
        self.content.len() as u32
    }

    fn trim_front(&mut self, n: u32) {
        self.content.advance(n as usize);
        self.seq = self.seq.wrapping_add(n);
    }

    fn trim_back(&mut self, n: u32) {
        self.content.truncate(self.content.len() - n as usize);
    }
}

impl Connection {
    /// Processes one inbound segment.
    #[instrument(
        level = "trace",
        name = "tcp_input",
        skip_all,
        fields(quad = %self.quad, seq = pkt.seq_no, ack = pkt.ack_no, len = pkt.content.len())
    )]
    pub fn on_packet(&mut self, tx: &mut TcpSender<'_>, pkt: TcpPacket) {
        self.ctx.stats.inc(Counter::RcvTotal);
        if self.terminated {
            if !pkt.flags.rst {
                tx.send(TcpPacket::rst_for(&pkt));
            }
            return;
        }

        let opts = SegmentOptions::parse(&pkt.options, pkt.flags.syn);
        let mut win = u32::from(pkt.window);
        if !pkt.flags.syn {
            win <<= self.scale.snd;
        }
        let mut seg = Segment {
            seq: pkt.seq_no,
            ack: pkt.ack_no,
            flags: pkt.flags,
            win,
            content: pkt.content,
            opts,
        };

        self.idle = 0;
        if self.state.is_synchronized() {
            self.timers.set(TimerKind::Keepalive, self.cfg.keep_idle);
        }
        if self.cfg.so_flags.contains(SocketFlags::FIN_AFTER_TCP_IDLE) {
            self.timers.set(TimerKind::Idle, self.cfg.idle_time);
        }

        match self.input(tx, &mut seg) {
            Exit::Done => {}
            Exit::Drop => {
                trace!("segment dropped");
                self.ctx.stats.inc(Counter::RcvDropped);
            }
            Exit::DropAfterAck => {
                if seg.flags.rst || self.terminated {
                    return;
                }
                self.flags.insert(ConnFlags::ACK_NOW);
                self.output(tx);
            }
            Exit::DropWithReset => {
                if seg.flags.rst {
                    return;
                }
                if seg.flags.ack {
                    self.respond(tx, seg.ack, 0, TcpFlags::new().rst(true));
                } else {
                    let ack = seg.seq.wrapping_add(seg.len()).wrapping_add(u32::from(seg.flags.syn));
                    self.respond(tx, 0, ack, TcpFlags::new().rst(true).ack(true));
                }
            }
        }
    }

    fn input(&mut self, tx: &mut TcpSender<'_>, seg: &mut Segment) -> Exit {
        if let Some(exit) = self.header_prediction(tx, seg) {
            return exit;
        }

        // Receive window, never shrinking below what was advertised.
        let adv = seq_diff(self.recv.adv, self.recv.nxt).max(0) as u32;
        self.recv.wnd = self.recv_space().max(adv);

        match self.state {
            State::Closed => return Exit::Drop,
            State::Listen => return self.input_listen(tx, seg),
            State::SynSent => return self.input_syn_sent(tx, seg),
            _ => {}
        }

        // PAWS: reject old duplicates by their timestamp.
        if let Some(ts) = seg.opts.ts {
            if !seg.flags.rst && self.ts.recent != 0 && ts_lt(ts.val, self.ts.recent) {
                if self.now().wrapping_sub(self.ts.recent_age) > TCP_PAWS_IDLE {
                    // The recorded timestamp is too old to compare against.
                    self.ts.recent = 0;
                } else {
                    self.ctx.stats.inc(Counter::PawsDrop);
                    self.ctx.stats.inc(Counter::RcvDupPack);
                    self.ctx.stats.add(Counter::RcvDupByte, u64::from(seg.len()));
                    return Exit::DropAfterAck;
                }
            }
        }

        self.trim_head(seg);

        if seg.len() > 0
            && matches!(self.state, State::Closing | State::LastAck | State::TimeWait)
        {
            debug!("payload after close, resetting");
            self.ctx.stats.inc(Counter::RcvAfterClose);
            self.set_state(State::Closed);
            return Exit::DropWithReset;
        }

        if let Some(exit) = self.trim_tail(seg) {
            return exit;
        }

        if let Some(ts) = seg.opts.ts {
            let seg_end = seg
                .seq
                .wrapping_add(seg.len())
                .wrapping_add(u32::from(seg.flags.syn || seg.flags.fin));
            if seq_leq(seg.seq, self.ts.last_ack_sent) && seq_lt(self.ts.last_ack_sent, seg_end) {
                self.ts.recent = ts.val;
                self.ts.recent_age = self.now();
            }
        }

        if seg.flags.rst {
            match self.state {
                State::SynRcvd => self.close_with(Error::new(
                    ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
                State::Estab | State::FinWait1 | State::FinWait2 | State::CloseWait => self
                    .close_with(Error::new(
                        ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    )),
                _ => self.set_state(State::Closed),
            }
            return Exit::Drop;
        }

        // A SYN in the window is an error.
        if seg.flags.syn {
            self.drop_with(
                tx,
                Error::new(ErrorKind::ConnectionReset, "SYN received in window"),
            );
            return Exit::DropWithReset;
        }

        if !seg.flags.ack {
            return Exit::Drop;
        }

        let mut needoutput = false;
        match self.process_ack(tx, seg, &mut needoutput) {
            Exit::Done => {}
            exit => return exit,
        }

        self.step6(tx, seg, needoutput)
    }

    /// Fast paths for the two common cases on an established connection: a
    /// pure ACK for outstanding data and the next expected in-order payload.
    fn header_prediction(&mut self, tx: &mut TcpSender<'_>, seg: &mut Segment) -> Option<Exit> {
        let f = seg.flags;
        if self.state != State::Estab
            || f.syn
            || f.fin
            || f.rst
            || f.urg
            || !f.ack
            || seg.opts.ts.is_some_and(|ts| !ts_geq(ts.val, self.ts.recent))
            || seg.seq != self.recv.nxt
            || seg.win == 0
            || seg.win != self.send.wnd
            || self.send.nxt != self.send.max
        {
            return None;
        }

        if let Some(ts) = seg.opts.ts {
            if seq_leq(seg.seq, self.ts.last_ack_sent)
                && seq_lt(self.ts.last_ack_sent, seg.seq.wrapping_add(seg.len()))
            {
                self.ts.recent = ts.val;
                self.ts.recent_age = self.now();
            }
        }

        let len = seg.len();
        if len == 0 {
            if seq_gt(seg.ack, self.send.una)
                && seq_leq(seg.ack, self.send.max)
                && self.cong.wnd >= self.send.wnd
            {
                self.ctx.stats.inc(Counter::PredAck);
                self.update_rtt(seg);

                let acked = seg.ack.wrapping_sub(self.send.una);
                self.ctx.stats.inc(Counter::RcvAckPack);
                self.ctx.stats.add(Counter::RcvAckByte, u64::from(acked));
                self.tx_buffer.drop_until(acked);
                self.send.una = seg.ack;

                if self.send.una == self.send.max {
                    self.timers.cancel(TimerKind::Retransmit);
                } else if !self.timers.is_armed(TimerKind::Persist) {
                    self.timers.set(TimerKind::Retransmit, self.rtt.rxtcur);
                }

                if !self.tx_buffer.is_empty() {
                    self.output(tx);
                }
                return Some(Exit::Done);
            }
        } else if seg.ack == self.send.una
            && self.rx_caught_up()
            && self.cfg.recv_buffer_cap as usize > self.rx_buffer.byte_len() + len as usize
        {
            self.ctx.stats.inc(Counter::PredDat);
            let content = std::mem::take(&mut seg.content);
            if let Err(e) = self.rx_buffer.push(content, seg.seq, seg.seq.wrapping_add(len)) {
                debug!("reassembly rejected in-order payload: {e}");
                self.ctx.stats.inc(Counter::ReassFail);
                self.flags.insert(ConnFlags::ACK_NOW);
            } else {
                self.ctx.stats.inc(Counter::RcvPack);
                self.ctx.stats.add(Counter::RcvByte, u64::from(len));
                self.reass_advance();
                self.flags.insert(ConnFlags::DEL_ACK);
            }
            self.output(tx);
            return Some(Exit::Done);
        }

        None
    }

    fn input_listen(&mut self, tx: &mut TcpSender<'_>, seg: &mut Segment) -> Exit {
        if seg.flags.rst {
            return Exit::Drop;
        }
        if seg.flags.ack {
            return Exit::DropWithReset;
        }
        if !seg.flags.syn {
            return Exit::Drop;
        }

        self.ctx.stats.inc(Counter::Accepts);
        let opts = seg.opts;
        self.apply_syn_options(&opts);
        self.init_send_sequence();
        self.init_recv_sequence(seg.seq);
        self.flags.insert(ConnFlags::ACK_NOW);
        self.set_state(State::SynRcvd);
        self.timers.set(TimerKind::Keepalive, TCPTV_KEEP_INIT);

        self.trim_after_syn(seg);
        self.step6(tx, seg, false)
    }

    fn input_syn_sent(&mut self, tx: &mut TcpSender<'_>, seg: &mut Segment) -> Exit {
        if seg.flags.ack
            && (seq_leq(seg.ack, self.send.iss) || seq_gt(seg.ack, self.send.max))
        {
            return Exit::DropWithReset;
        }
        if seg.flags.rst {
            if seg.flags.ack {
                self.close_with(Error::new(
                    ErrorKind::ConnectionRefused,
                    "connection refused",
                ));
            }
            return Exit::Drop;
        }
        if !seg.flags.syn {
            return Exit::Drop;
        }

        let opts = seg.opts;
        self.apply_syn_options(&opts);
        if seg.flags.ack {
            self.send.una = seg.ack;
            if seq_lt(self.send.nxt, self.send.una) {
                self.send.nxt = self.send.una;
            }
        }
        self.timers.cancel(TimerKind::Retransmit);
        self.init_recv_sequence(seg.seq);
        self.flags.insert(ConnFlags::ACK_NOW);

        if seg.flags.ack && seq_gt(self.send.una, self.send.iss) {
            self.set_state(State::Estab);
            self.apply_window_scale();
            self.reass_advance();
            if self.rtt.is_timing() {
                self.xmit_timer(self.rtt.rtt);
            }
        } else {
            // Simultaneous open.
            self.set_state(State::SynRcvd);
        }

        self.trim_after_syn(seg);
        self.step6(tx, seg, false)
    }

    /// Steps over an accepted SYN and cuts payload beyond the window.
    fn trim_after_syn(&mut self, seg: &mut Segment) {
        seg.seq = seg.seq.wrapping_add(1);
        if seg.len() > self.recv.wnd {
            let todrop = seg.len() - self.recv.wnd;
            seg.trim_back(todrop);
            seg.flags.fin = false;
            self.ctx.stats.inc(Counter::RcvPackAfterWin);
            self.ctx.stats.add(Counter::RcvByteAfterWin, u64::from(todrop));
        }
        self.send.wl1 = seg.seq.wrapping_sub(1);
        self.recv.up = seg.seq;
    }

    /// Cuts everything below `rcv_nxt`.
    fn trim_head(&mut self, seg: &mut Segment) {
        let mut todrop = seq_diff(self.recv.nxt, seg.seq);
        if todrop <= 0 {
            return;
        }
        if seg.flags.syn {
            seg.flags.syn = false;
            seg.seq = seg.seq.wrapping_add(1);
            todrop -= 1;
        }

        let mut todrop = todrop as u32;
        let len = seg.len();
        if todrop > len || (todrop == len && !seg.flags.fin) {
            // Any valid FIN lies left of the window, this one is a
            // duplicate. Resynchronize but keep processing RST and ACK.
            seg.flags.fin = false;
            self.flags.insert(ConnFlags::ACK_NOW);
            todrop = len;
            self.ctx.stats.inc(Counter::RcvDupPack);
            self.ctx.stats.add(Counter::RcvDupByte, u64::from(todrop));
        } else {
            self.ctx.stats.inc(Counter::RcvPartDupPack);
            self.ctx.stats.add(Counter::RcvPartDupByte, u64::from(todrop));
        }
        seg.trim_front(todrop);
    }

    /// Cuts everything beyond the receive window.
    fn trim_tail(&mut self, seg: &mut Segment) -> Option<Exit> {
        let wnd_end = self.recv.nxt.wrapping_add(self.recv.wnd);
        let todrop = seq_diff(seg.seq.wrapping_add(seg.len()), wnd_end);
        if todrop <= 0 {
            return None;
        }

        let todrop = todrop as u32;
        self.ctx.stats.inc(Counter::RcvPackAfterWin);
        if todrop >= seg.len() {
            self.ctx.stats.add(Counter::RcvByteAfterWin, u64::from(seg.len()));
            // A zero window probe is acknowledged, anything else beyond the
            // window is dropped.
            if self.recv.wnd == 0 && seg.seq == self.recv.nxt {
                self.flags.insert(ConnFlags::ACK_NOW);
                self.ctx.stats.inc(Counter::RcvWinProbe);
            } else {
                return Some(Exit::DropAfterAck);
            }
        } else {
            self.ctx.stats.add(Counter::RcvByteAfterWin, u64::from(todrop));
        }
        let todrop = todrop.min(seg.len());
        seg.trim_back(todrop);
        seg.flags.psh = false;
        seg.flags.fin = false;
        None
    }

    fn process_ack(
        &mut self,
        tx: &mut TcpSender<'_>,
        seg: &mut Segment,
        needoutput: &mut bool,
    ) -> Exit {
        if self.state == State::SynRcvd {
            if seq_leq(seg.ack, self.send.una) || seq_gt(seg.ack, self.send.max) {
                return Exit::DropWithReset;
            }
            self.set_state(State::Estab);
            self.apply_window_scale();
            // This segment's window was read before scaling took effect.
            seg.win <<= self.scale.snd;
            self.send.wl1 = seg.seq.wrapping_sub(1);
            self.reass_advance();
        }

        if seq_leq(seg.ack, self.send.una) {
            if seg.len() == 0 && seg.win == self.send.wnd {
                self.ctx.stats.inc(Counter::RcvDupAck);
                if !self.timers.is_armed(TimerKind::Retransmit) || seg.ack != self.send.una {
                    self.cong.dup_acks = 0;
                } else if self.cong.on_dup_ack() {
                    debug!(ack = seg.ack, "fast retransmit");
                    let onxt = self.send.nxt;
                    self.cong.on_loss(self.send.wnd);
                    self.timers.cancel(TimerKind::Retransmit);
                    self.rtt.rtt = 0;
                    self.send.nxt = seg.ack;
                    self.output(tx);
                    if seq_gt(onxt, self.send.nxt) {
                        self.send.nxt = onxt;
                    }
                    return Exit::Drop;
                } else if self.cong.in_recovery() {
                    self.output(tx);
                    return Exit::Drop;
                }
            } else {
                self.cong.dup_acks = 0;
            }
            return Exit::Done;
        }

        self.cong.on_new_ack();
        if seq_gt(seg.ack, self.send.max) {
            self.ctx.stats.inc(Counter::RcvAckTooMuch);
            return Exit::DropAfterAck;
        }

        let acked = seg.ack.wrapping_sub(self.send.una);
        self.ctx.stats.inc(Counter::RcvAckPack);
        self.ctx.stats.add(Counter::RcvAckByte, u64::from(acked));

        self.update_rtt(seg);

        if seg.ack == self.send.max {
            self.timers.cancel(TimerKind::Retransmit);
            *needoutput = true;
        } else if !self.timers.is_armed(TimerKind::Persist) {
            self.timers.set(TimerKind::Retransmit, self.rtt.rxtcur);
        }

        self.cong.on_ack(self.scale.snd);

        // The SYN occupies sequence space but not the send buffer.
        let syn_acked = u32::from(self.send.una == self.send.iss);
        let data_acked = acked - syn_acked;
        let buffered = self.tx_buffer.byte_len();
        let ourfinisacked = if data_acked > buffered {
            self.send.wnd = self.send.wnd.saturating_sub(buffered);
            self.tx_buffer.drop_until(buffered);
            true
        } else {
            self.send.wnd = self.send.wnd.saturating_sub(data_acked);
            self.tx_buffer.drop_until(data_acked);
            false
        };

        self.send.una = seg.ack;
        if seq_lt(self.send.nxt, self.send.una) {
            self.send.nxt = self.send.una;
        }

        match self.state {
            State::FinWait1 if ourfinisacked => {
                self.set_state(State::FinWait2);
                self.timers.set(TimerKind::TwoMsl, self.cfg.max_idle);
            }
            State::Closing if ourfinisacked => {
                self.enter_time_wait();
            }
            State::LastAck if ourfinisacked => {
                self.set_state(State::Closed);
                return Exit::Drop;
            }
            State::TimeWait => {
                self.timers.set(TimerKind::TwoMsl, 2 * TCPTV_MSL);
                return Exit::DropAfterAck;
            }
            _ => {}
        }
        Exit::Done
    }

    /// Window update, payload and FIN processing, then output.
    fn step6(&mut self, tx: &mut TcpSender<'_>, seg: &mut Segment, mut needoutput: bool) -> Exit {
        if seg.flags.ack
            && (seq_lt(self.send.wl1, seg.seq)
                || (self.send.wl1 == seg.seq
                    && (seq_lt(self.send.wl2, seg.ack)
                        || (self.send.wl2 == seg.ack && seg.win > self.send.wnd))))
        {
            if seg.len() == 0 && self.send.wl2 == seg.ack && seg.win > self.send.wnd {
                self.ctx.stats.inc(Counter::RcvWinUpd);
            }
            self.send.wnd = seg.win;
            self.send.wl1 = seg.seq;
            self.send.wl2 = seg.ack;
            self.send.max_wnd = self.send.max_wnd.max(seg.win);
            needoutput = true;
        }

        if (seg.len() > 0 || seg.flags.fin) && !self.state.have_rcvd_fin() {
            self.dodata(seg);
        } else {
            seg.flags.fin = false;
        }

        if seg.flags.fin {
            if !self.state.have_rcvd_fin() {
                self.flags.insert(ConnFlags::ACK_NOW);
                self.recv.nxt = self.recv.nxt.wrapping_add(1);
            }
            match self.state {
                State::SynRcvd | State::Estab => {
                    if self.cfg.so_flags.contains(SocketFlags::FIN_AFTER_TCP_FIN) {
                        self.set_state(State::LastAck);
                    } else {
                        self.set_state(State::CloseWait);
                    }
                }
                State::FinWait1 => self.set_state(State::Closing),
                State::FinWait2 => self.enter_time_wait(),
                State::TimeWait => self.timers.set(TimerKind::TwoMsl, 2 * TCPTV_MSL),
                _ => {}
            }
        }

        if needoutput || self.flags.contains(ConnFlags::ACK_NOW) {
            self.output(tx);
        }
        Exit::Done
    }

    /// Queues payload for the user. A FIN is honored only if it directly
    /// follows everything received so far.
    fn dodata(&mut self, seg: &mut Segment) {
        let len = seg.len();
        if len > 0 {
            let in_order = seg.seq == self.recv.nxt;
            let was_ordered = self.rx_caught_up();
            let content = std::mem::take(&mut seg.content);

            match self.rx_buffer.push(content, seg.seq, seg.seq.wrapping_add(len)) {
                Ok(()) => {
                    self.ctx.stats.inc(Counter::RcvPack);
                    self.ctx.stats.add(Counter::RcvByte, u64::from(len));
                    if in_order {
                        self.reass_advance();
                        if self.state == State::Estab && was_ordered {
                            self.flags.insert(ConnFlags::DEL_ACK);
                        } else {
                            self.flags.insert(ConnFlags::ACK_NOW);
                        }
                    } else {
                        trace!(seq = seg.seq, rcv_nxt = self.recv.nxt, "out of order segment");
                        self.flags.insert(ConnFlags::ACK_NOW);
                    }
                }
                Err(e) => {
                    debug!("reassembly rejected payload: {e}");
                    self.ctx.stats.inc(Counter::ReassFail);
                    self.flags.insert(ConnFlags::ACK_NOW);
                    seg.flags.fin = false;
                }
            }
        }

        if seg.flags.fin && seg.seq.wrapping_add(len) != self.recv.nxt {
            self.flags.insert(ConnFlags::ACK_NOW);
            seg.flags.fin = false;
        }
    }

    fn update_rtt(&mut self, seg: &Segment) {
        // An echo from our future is bogus, fall back to the timed segment.
        let now = self.now();
        if let Some(ts) = seg.opts.ts.filter(|ts| ts.ecr != 0 && !ts_lt(now, ts.ecr)) {
            let rtt = now.wrapping_sub(ts.ecr).wrapping_add(1);
            self.xmit_timer(rtt);
        } else if self.rtt.is_timing() && seq_gt(seg.ack, self.rtt.rtseq) {
            self.xmit_timer(self.rtt.rtt);
        }
    }

    fn xmit_timer(&mut self, rtt: u32) {
        self.ctx.stats.inc(Counter::RttUpdated);
        self.rtt.sample(rtt);
        trace!(rtt, srtt = self.rtt.srtt, rxtcur = self.rtt.rxtcur, "rtt sample");
    }

    fn enter_time_wait(&mut self) {
        self.set_state(State::TimeWait);
        self.timers.cancel_all();
        self.timers.set(TimerKind::TwoMsl, 2 * TCPTV_MSL);
    }
}

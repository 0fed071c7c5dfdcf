use bytes::Bytes;
use tcp_types::tcp::{TcpFlags, TcpOption, TcpPacket};
use tracing::{error, trace};

use super::{ConnFlags, Connection, State, TimerKind, TCP_MAXWIN};
use crate::tcp::{
    sender::TcpSender,
    seq::{seq_diff, seq_gt, seq_lt},
    stats::Counter,
};

impl Connection {
    /// Sends whatever the connection state calls for: new or retransmitted
    /// payload, control flags, acknowledgements and window updates.
    ///
    /// Emits segments until nothing more is due. If payload is waiting but
    /// the peer's window is closed, the persist timer is armed instead.
    pub(crate) fn output(&mut self, tx: &mut TcpSender<'_>) {
        if self.terminated {
            return;
        }

        // Slow start again after an idle period.
        let idle = self.send.max == self.send.una;
        if idle && self.idle >= self.rtt.rxtcur {
            trace!(idle = self.idle, "restarting from one segment after idle");
            self.cong.wnd = u32::from(self.cong.mss);
        }

        loop {
            let mut sendalot = false;

            // Buffer offset of `snd_nxt`. While our SYN is outstanding it
            // occupies the first sequence number but no buffer space.
            let syn_pending = u32::from(self.send.una == self.send.iss);
            let data_una = self.send.una.wrapping_add(syn_pending);
            let off = seq_diff(self.send.nxt, data_una).max(0) as u32;

            let buffered = self.tx_buffer.byte_len();
            let mut win = self.window();
            let mut flags = self.state.out_flags();

            if self.force {
                if win == 0 {
                    // Probe with a single byte, the FIN waits until all
                    // payload is through.
                    if !self.tx_buffer.is_empty() {
                        flags.fin = false;
                    }
                    win = 1;
                } else {
                    self.timers.cancel(TimerKind::Persist);
                    self.rtt.shift = 0;
                }
            }

            let mut len = i64::from(buffered.min(win)) - i64::from(off);
            if len < 0 {
                len = 0;
                if win == 0 {
                    self.timers.cancel(TimerKind::Retransmit);
                    self.send.nxt = self.send.una;
                }
            }
            if flags.syn || flags.rst {
                len = 0;
            }

            if len > 0 && self.tx_buffer.pkts_to_send(off, win) > 1 {
                sendalot = true;
            }
            let mss = i64::from(self.cong.mss);
            if len > mss {
                len = mss;
            }

            if flags.fin
                && seq_lt(
                    self.send.nxt.wrapping_add(len as u32),
                    data_una.wrapping_add(buffered),
                )
            {
                flags.fin = false;
            }

            let space = self.recv_space();
            if !self.should_send(len, space, flags) {
                if !self.tx_buffer.is_empty()
                    && !self.timers.is_armed(TimerKind::Retransmit)
                    && !self.timers.is_armed(TimerKind::Persist)
                {
                    self.rtt.shift = 0;
                    self.set_persist();
                }
                return;
            }

            let options = self.segment_options(flags);
            let optlen = options.iter().map(option_len).sum::<usize>() as i64;
            if len > mss - optlen {
                len = mss - optlen;
                sendalot = true;
            }

            let content = if len > 0 {
                let Some(unit) = self.tx_buffer.get(off) else {
                    error!(off, buffered, "send offset beyond buffered payload");
                    return;
                };
                if (unit.len() as i64) < len {
                    len = unit.len() as i64;
                    sendalot = true;
                }
                unit.slice(..len as usize)
            } else {
                Bytes::new()
            };
            let len = len as u32;

            if flags.syn {
                self.send.nxt = self.send.iss;
            }
            if flags.fin && self.flags.contains(ConnFlags::SENT_FIN) && self.send.nxt == self.send.max {
                // Retransmission of our FIN.
                self.send.nxt = self.send.nxt.wrapping_sub(1);
            }

            let persist_armed = self.timers.is_armed(TimerKind::Persist);
            let seq_no = if len > 0 || flags.syn || flags.fin || persist_armed {
                self.send.nxt
            } else {
                self.send.max
            };

            let rcv_scale = self.scale.rcv;
            let adv = seq_diff(self.recv.adv, self.recv.nxt).max(0) as u32;
            let win = space.min(TCP_MAXWIN << rcv_scale).max(adv);
            let window = (win >> rcv_scale).min(u32::from(u16::MAX)) as u16;

            self.count_output(len, flags);

            if !self.force || !persist_armed {
                let startseq = self.send.nxt;
                if flags.syn {
                    self.send.nxt = self.send.nxt.wrapping_add(1);
                }
                if flags.fin {
                    self.send.nxt = self.send.nxt.wrapping_add(1);
                    self.flags.insert(ConnFlags::SENT_FIN);
                }
                self.send.nxt = self.send.nxt.wrapping_add(len);
                if seq_gt(self.send.nxt, self.send.max) {
                    self.send.max = self.send.nxt;
                    self.rtt.start_timing(startseq);
                }

                if !self.timers.is_armed(TimerKind::Retransmit) && self.send.nxt != self.send.una {
                    self.timers.set(TimerKind::Retransmit, self.rtt.rxtcur);
                    if self.timers.is_armed(TimerKind::Persist) {
                        self.timers.cancel(TimerKind::Persist);
                        self.rtt.shift = 0;
                    }
                }
            } else if seq_gt(self.send.nxt.wrapping_add(len), self.send.max) {
                self.send.max = self.send.nxt.wrapping_add(len);
            }

            let pkt = TcpPacket {
                src_port: self.quad.src.port(),
                dest_port: self.quad.dst.port(),
                seq_no,
                ack_no: self.recv.nxt,
                flags,
                window,
                urgent_ptr: 0,
                options,
                content,
            };
            trace!(state = %self.state, "sending {pkt}");
            tx.send(pkt);

            if win > 0 && seq_gt(self.recv.nxt.wrapping_add(win), self.recv.adv) {
                self.recv.adv = self.recv.nxt.wrapping_add(win);
            }
            self.ts.last_ack_sent = self.recv.nxt;
            self.flags.remove(ConnFlags::ACK_NOW | ConnFlags::DEL_ACK);

            if !sendalot || len == 0 || self.state == State::Closed {
                return;
            }
        }
    }

    fn should_send(&self, len: i64, space: u32, flags: TcpFlags) -> bool {
        if len > 0 {
            return true;
        }

        // Window update once the advertisement would grow by more than a
        // segment or by half the buffer.
        if space > 0 {
            let adv = i64::from(space.min(TCP_MAXWIN << self.scale.rcv))
                - i64::from(seq_diff(self.recv.adv, self.recv.nxt));
            if adv >= i64::from(self.cong.mss) + 1 {
                return true;
            }
            if 2 * adv >= i64::from(self.cfg.recv_buffer_cap) {
                return true;
            }
        }

        self.flags.contains(ConnFlags::ACK_NOW)
            || flags.syn
            || flags.rst
            || seq_gt(self.send.up, self.send.una)
            || (flags.fin
                && (!self.flags.contains(ConnFlags::SENT_FIN) || self.send.nxt == self.send.una))
    }

    /// Options carried by a segment with `flags`.
    fn segment_options(&self, flags: TcpFlags) -> Vec<TcpOption> {
        let mut options = Vec::new();
        if self.flags.contains(ConnFlags::NO_OPT) {
            return options;
        }

        if flags.syn {
            options.push(TcpOption::MaximumSegmentSize(self.cfg.mss));
            if self.flags.contains(ConnFlags::REQ_SCALE)
                && (!flags.ack || self.flags.contains(ConnFlags::RCVD_SCALE))
            {
                options.push(TcpOption::WindowScaling(self.scale.request_rcv));
            }
        }

        if self.flags.contains(ConnFlags::REQ_TSTMP)
            && !flags.rst
            && ((flags.syn && !flags.ack) || self.flags.contains(ConnFlags::RCVD_TSTMP))
        {
            options.push(TcpOption::Timestamp(self.now(), self.ts.recent));
        }
        options
    }

    fn count_output(&self, len: u32, flags: TcpFlags) {
        let stats = &self.ctx.stats;
        stats.inc(Counter::SndTotal);
        if len > 0 {
            if self.force && len == 1 {
                stats.inc(Counter::SndProbe);
            } else if seq_lt(self.send.nxt, self.send.max) {
                stats.inc(Counter::SndRexmitPack);
                stats.add(Counter::SndRexmitByte, u64::from(len));
            } else {
                stats.inc(Counter::SndPack);
                stats.add(Counter::SndByte, u64::from(len));
            }
        } else if self.flags.contains(ConnFlags::ACK_NOW) {
            stats.inc(Counter::SndAcks);
        } else if flags.syn || flags.fin || flags.rst {
            stats.inc(Counter::SndCtrl);
        } else {
            stats.inc(Counter::SndWinUp);
        }
    }
}

/// Encoded size of an option including its NOP padding.
fn option_len(option: &TcpOption) -> usize {
    match option {
        TcpOption::MaximumSegmentSize(_) => 4,
        TcpOption::WindowScaling(_) => 4,
        TcpOption::Timestamp(..) => 12,
        TcpOption::EndOfOptionsList() => 1,
    }
}

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

counters! {
    /// Segments handed to input processing.
    RcvTotal => "rcv_total",
    /// Segments discarded for a bad header offset.
    RcvBadOff => "rcv_bad_off",
    RcvPack => "rcv_pack",
    RcvByte => "rcv_byte",
    RcvDupPack => "rcv_dup_pack",
    RcvDupByte => "rcv_dup_byte",
    RcvPartDupPack => "rcv_part_dup_pack",
    RcvPartDupByte => "rcv_part_dup_byte",
    RcvAfterClose => "rcv_after_close",
    RcvPackAfterWin => "rcv_pack_after_win",
    RcvByteAfterWin => "rcv_byte_after_win",
    RcvWinProbe => "rcv_win_probe",
    RcvDupAck => "rcv_dup_ack",
    RcvAckTooMuch => "rcv_ack_too_much",
    RcvAckPack => "rcv_ack_pack",
    RcvAckByte => "rcv_ack_byte",
    RcvWinUpd => "rcv_win_upd",
    /// Segments silently discarded.
    RcvDropped => "rcv_dropped",
    PawsDrop => "paws_drop",
    /// Header prediction hits for pure ACKs.
    PredAck => "pred_ack",
    /// Header prediction hits for in-order data.
    PredDat => "pred_dat",
    Accepts => "accepts",
    Connects => "connects",
    /// Connections torn down with an error.
    Drops => "drops",
    /// Connections that reached CLOSED.
    Closed => "closed",
    RttUpdated => "rtt_updated",
    DelAck => "del_ack",
    KeepTimeo => "keep_timeo",
    KeepProbe => "keep_probe",
    KeepDrops => "keep_drops",
    TimeoutDrop => "timeout_drop",
    RexmtTimeo => "rexmt_timeo",
    PersistTimeo => "persist_timeo",
    SndTotal => "snd_total",
    SndPack => "snd_pack",
    SndByte => "snd_byte",
    SndRexmitPack => "snd_rexmit_pack",
    SndRexmitByte => "snd_rexmit_byte",
    SndAcks => "snd_acks",
    SndProbe => "snd_probe",
    SndCtrl => "snd_ctrl",
    SndWinUp => "snd_win_up",
    SndBufFull => "snd_buf_full",
    ReassFail => "reass_fail",
}

/// Process-wide protocol counters.
///
/// A single instance is shared (behind an `Arc`) by every connection of a
/// [`Speaker`](crate::tcp::Speaker). Updates are relaxed atomics, so a
/// snapshot taken concurrently with traffic is not a consistent cut.
#[derive(Debug)]
pub struct TcpStats {
    values: Vec<AtomicU64>,
}

/// A point-in-time copy of [`TcpStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpStatsSnapshot {
    values: Vec<u64>,
}

impl TcpStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Counter::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.values[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> TcpStatsSnapshot {
        TcpStatsSnapshot {
            values: self
                .values
                .iter()
                .map(|v| v.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

impl Default for TcpStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpStatsSnapshot {
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        Counter::ALL.iter().copied().zip(self.values.iter().copied())
    }
}

impl fmt::Display for TcpStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (counter, value) in self.iter().filter(|(_, v)| *v != 0) {
            writeln!(f, "{:>20}: {}", counter.name(), value)?;
        }
        Ok(())
    }
}

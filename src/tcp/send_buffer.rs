use std::{
    collections::VecDeque,
    io::{Error, ErrorKind, Result},
};

use bytes::{Buf, Bytes};

/// Bounded FIFO of outbound payload units.
///
/// Holds everything between `snd_una` and the end of the user data queued so
/// far. Offsets are byte offsets relative to `snd_una`. Units are kept as
/// submitted; output may cut a segment out of a single unit but never merges
/// two units into one segment.
#[derive(Debug)]
pub struct SendBuffer {
    units: VecDeque<Bytes>,
    capacity: usize,
    bytes: u32,
}

impl SendBuffer {
    /// Creates a buffer holding at most `capacity` units.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            units: VecDeque::with_capacity(capacity),
            capacity,
            bytes: 0,
        }
    }

    /// Appends a payload unit.
    ///
    /// Fails with [`ErrorKind::WouldBlock`] when all units are in use. Empty
    /// payloads are accepted and ignored.
    pub fn push(&mut self, payload: Bytes) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if self.is_full() {
            return Err(Error::new(ErrorKind::WouldBlock, "send buffer full"));
        }
        self.bytes += payload.len() as u32;
        self.units.push_back(payload);
        Ok(())
    }

    /// Returns the remainder of the unit that contains byte `offset`,
    /// starting at that byte.
    #[must_use]
    pub fn get(&self, offset: u32) -> Option<Bytes> {
        let mut start = 0u32;
        for unit in &self.units {
            let len = unit.len() as u32;
            if offset < start + len {
                return Some(unit.slice((offset - start) as usize..));
            }
            start += len;
        }
        None
    }

    /// Releases the first `offset` bytes, trimming a partially covered unit.
    pub fn drop_until(&mut self, offset: u32) {
        let mut remaining = offset.min(self.bytes);
        self.bytes -= remaining;
        while remaining > 0 {
            let Some(front) = self.units.front_mut() else {
                break;
            };
            let len = front.len() as u32;
            if len <= remaining {
                remaining -= len;
                self.units.pop_front();
            } else {
                front.advance(remaining as usize);
                remaining = 0;
            }
        }
    }

    /// Number of units that may go out between `offset` and `window`,
    /// saturating at two. Output only needs to know whether more than one
    /// segment is due.
    #[must_use]
    pub fn pkts_to_send(&self, offset: u32, window: u32) -> usize {
        if self.units.is_empty() || offset >= window {
            return 0;
        }
        if self.units.len() == 1 {
            return 1;
        }

        let mut start = 0u32;
        let mut iter = self.units.iter().peekable();
        while let Some(unit) = iter.next() {
            let end = start + unit.len() as u32;
            if end <= offset {
                start = end;
                continue;
            }
            // `unit` holds `offset`, a second segment needs the next unit
            // to start inside the window.
            return match iter.peek() {
                Some(_) if end < window => 2,
                _ => 1,
            };
        }
        0
    }

    #[must_use]
    pub fn byte_len(&self) -> u32 {
        self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.units.len() >= self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

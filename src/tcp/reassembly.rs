use std::io::{Error, ErrorKind, Result};

use bytes::{Buf, Bytes};
use tracing::trace;

use super::seq::{seq_diff, seq_geq, seq_lt};

/// Ordered store of received payload, keyed by sequence range.
///
/// Entries live in an arena and are linked by index in ascending sequence
/// order. Three cursors are maintained:
///
/// - `first`: the lowest-sequence entry,
/// - `last`: the end of the contiguous run that starts at `first`,
///   unknown (`None`) right after that run was fully pulled,
/// - `tail`: the highest-sequence entry.
///
/// Entries never overlap. Overlapping bytes are trimmed from the entry being
/// inserted, bytes already queued are never modified.
#[derive(Debug)]
pub struct ReassemblyQueue {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    first: Option<usize>,
    last: Option<usize>,
    tail: Option<usize>,
    len: usize,
    bytes: usize,
    capacity: usize,
}

#[derive(Debug)]
struct Entry {
    seq: u32,
    seq_next: u32,
    payload: Bytes,
    next: Option<usize>,
}

impl ReassemblyQueue {
    /// Creates a queue that holds at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            first: None,
            last: None,
            tail: None,
            len: 0,
            bytes: 0,
            capacity,
        }
    }

    /// Inserts `payload` covering `[seq, seq_next)`.
    ///
    /// Bytes that are already queued are cut from the new entry, an entry
    /// that is entirely covered is discarded. Fails with
    /// [`ErrorKind::InvalidInput`] for an empty range or one that disagrees
    /// with the payload length, and with [`ErrorKind::OutOfMemory`] when the
    /// queue is at capacity.
    pub fn push(&mut self, mut payload: Bytes, mut seq: u32, seq_next: u32) -> Result<()> {
        let span = seq_diff(seq_next, seq);
        if span <= 0 || span as usize != payload.len() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "sequence range does not match payload",
            ));
        }

        let Some(first) = self.first else {
            let id = self.alloc(payload, seq, seq_next)?;
            self.first = Some(id);
            self.last = Some(id);
            self.tail = Some(id);
            return Ok(());
        };
        let tail = self.tail.unwrap_or(first);

        // Append behind the tail.
        if seq_geq(seq, self.entry(tail).seq_next) {
            let perfect = seq == self.entry(tail).seq_next && self.last == Some(tail);
            let id = self.alloc(payload, seq, seq_next)?;
            self.entry_mut(tail).next = Some(id);
            self.tail = Some(id);
            if perfect {
                self.last = Some(id);
            } else if self.last.is_none() {
                self.loop_last();
            }
            return Ok(());
        }

        // Prepend before the head.
        let first_seq = self.entry(first).seq;
        if seq_lt(seq, first_seq) {
            let overlap = seq_diff(seq_next, first_seq);
            let seq_next = if overlap > 0 {
                payload.truncate(payload.len() - overlap as usize);
                first_seq
            } else {
                seq_next
            };
            let id = self.alloc(payload, seq, seq_next)?;
            self.entry_mut(id).next = Some(first);
            self.first = Some(id);
            if self.last.is_none() {
                self.loop_last();
            }
            if seq_lt(seq_next, first_seq) {
                self.last = Some(id);
            }
            return Ok(());
        }

        // Fill a gap. Find the predecessor, starting at `last` when the new
        // range lies beyond the contiguous run.
        let mut prev = match self.last {
            Some(last) if seq_geq(seq, self.entry(last).seq_next) => last,
            _ => first,
        };
        while let Some(next) = self.entry(prev).next {
            if seq_lt(self.entry(next).seq, seq) {
                prev = next;
            } else {
                break;
            }
        }

        let mut seq_next = seq_next;
        let overlap = seq_diff(self.entry(prev).seq_next, seq);
        if overlap > 0 {
            if overlap as usize >= payload.len() {
                trace!(seq, seq_next, "discarding fully duplicate range");
                return Ok(());
            }
            payload.advance(overlap as usize);
            seq = self.entry(prev).seq_next;
        }

        let next = self.entry(prev).next;
        if let Some(next) = next {
            let next_seq = self.entry(next).seq;
            let overlap = seq_diff(seq_next, next_seq);
            if overlap > 0 {
                if overlap as usize >= payload.len() {
                    trace!(seq, seq_next, "discarding fully duplicate range");
                    return Ok(());
                }
                payload.truncate(payload.len() - overlap as usize);
                seq_next = next_seq;
            }
        }

        let id = self.alloc(payload, seq, seq_next)?;
        self.entry_mut(id).next = next;
        self.entry_mut(prev).next = Some(id);
        if self.tail == Some(prev) {
            self.tail = Some(id);
        }
        self.loop_last();
        Ok(())
    }

    /// Removes the lowest-sequence entry, as long as it belongs to the
    /// contiguous run.
    pub fn pull_front(&mut self) -> Option<Bytes> {
        self.last?;
        let id = self.first?;
        let entry = self.slots[id].take()?;
        self.free.push(id);
        self.len -= 1;
        self.bytes -= entry.payload.len();

        if self.last == Some(id) {
            self.last = None;
        }
        self.first = entry.next;
        if self.first.is_none() {
            self.tail = None;
            self.last = None;
        }
        Some(entry.payload)
    }

    /// Extends `last` over every entry that directly continues it.
    fn loop_last(&mut self) {
        let Some(mut cur) = self.last.or(self.first) else {
            return;
        };
        while let Some(next) = self.entry(cur).next {
            if self.entry(next).seq == self.entry(cur).seq_next {
                cur = next;
            } else {
                break;
            }
        }
        self.last = Some(cur);
    }

    fn alloc(&mut self, payload: Bytes, seq: u32, seq_next: u32) -> Result<usize> {
        if self.len >= self.capacity {
            return Err(Error::new(
                ErrorKind::OutOfMemory,
                "reassembly queue capacity exhausted",
            ));
        }
        self.len += 1;
        self.bytes += payload.len();

        let entry = Entry {
            seq,
            seq_next,
            payload,
            next: None,
        };
        Ok(match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(entry);
                id
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        })
    }

    fn entry(&self, id: usize) -> &Entry {
        self.slots[id]
            .as_ref()
            .expect("reassembly link points to a free slot")
    }

    fn entry_mut(&mut self, id: usize) -> &mut Entry {
        self.slots[id]
            .as_mut()
            .expect("reassembly link points to a free slot")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Whether the front entry may be pulled.
    #[must_use]
    pub fn is_pullable(&self) -> bool {
        self.last.is_some()
    }

    /// Whether every queued byte belongs to the contiguous run.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.last.is_some() && self.last == self.tail
    }

    /// Sequence number of the lowest queued byte.
    #[must_use]
    pub fn first_seq(&self) -> Option<u32> {
        self.first.map(|id| self.entry(id).seq)
    }

    /// Sequence number following the contiguous run.
    #[must_use]
    pub fn last_nxt(&self) -> Option<u32> {
        self.last.map(|id| self.entry(id).seq_next)
    }

    /// Sequence number following the highest queued byte.
    #[must_use]
    pub fn expected(&self) -> Option<u32> {
        self.tail.map(|id| self.entry(id).seq_next)
    }

    /// Number of queued bytes, in order or not.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    /// Number of bytes in the contiguous run.
    #[must_use]
    pub fn ordered_len(&self) -> usize {
        match (self.first_seq(), self.last_nxt()) {
            (Some(first), Some(last)) => seq_diff(last, first) as usize,
            _ => 0,
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Queued ranges in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mut cur = self.first;
        std::iter::from_fn(move || {
            let id = cur?;
            let entry = self.entry(id);
            cur = entry.next;
            Some((entry.seq, entry.seq_next))
        })
    }
}

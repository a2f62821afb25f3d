use ferry_api::*;
use std::collections::VecDeque;

/// A forward-moving window of previously produced bytes over a one-shot
/// sequential origin stream, supporting limited random-access re-reads
/// so retried or late chunk requests can be served without re-opening
/// the origin.
///
/// Buffered chunks form a chain of strictly increasing, contiguous
/// offsets. The chain is bounded by an explicit byte budget; when the
/// budget is exceeded the oldest chunks are evicted first and the
/// window "closes" behind them. Requests for offsets older than the
/// oldest retained chunk fail with a window-closed error.
pub struct RecoveryWindow {
    origin: Box<dyn std::io::Read + Send>,
    nodes: VecDeque<Node>,
    buffered: usize,
    budget: usize,
    max_read_chunk: usize,
    /// Offset one past the newest byte ever read from the origin.
    read_offset: u64,
    /// Offset of the oldest byte still retained (moves forward as the
    /// window closes).
    oldest_offset: u64,
    eof: bool,
}

#[derive(Debug)]
struct Node {
    offset: u64,
    data: bytes::Bytes,
}

impl std::fmt::Debug for RecoveryWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryWindow")
            .field("buffered", &self.buffered)
            .field("budget", &self.budget)
            .field("read_offset", &self.read_offset)
            .field("oldest_offset", &self.oldest_offset)
            .field("eof", &self.eof)
            .finish()
    }
}

impl RecoveryWindow {
    /// Wrap a one-shot origin stream. `budget` bounds the bytes of
    /// history retained; `max_read_chunk` caps each read against the
    /// origin.
    pub fn new(
        origin: Box<dyn std::io::Read + Send>,
        budget: usize,
        max_read_chunk: usize,
    ) -> Self {
        Self {
            origin,
            nodes: VecDeque::new(),
            buffered: 0,
            budget: budget.max(1),
            max_read_chunk: max_read_chunk.max(1),
            read_offset: 0,
            oldest_offset: 0,
            eof: false,
        }
    }

    /// Satisfy a byte range request, from buffered history first, then
    /// by reading the origin forward.
    ///
    /// Returns the number of bytes appended to `out`. The count is
    /// **negated** when the origin reached end-of-data while satisfying
    /// the request, so callers can distinguish a short read at the end
    /// of the stream from a fully satisfied request.
    ///
    /// Errors if `offset` precedes the oldest byte still retained: the
    /// window has closed over the requested range.
    pub fn get_data(
        &mut self,
        offset: u64,
        length: usize,
        out: &mut Vec<u8>,
    ) -> FerryResult<i64> {
        if offset < self.oldest_offset {
            return Err(FerryError::other(format!(
                "recovery window closed: requested offset {offset} is older than retained offset {}",
                self.oldest_offset,
            )));
        }

        let end = offset + length as u64;
        let mut wrote: usize = 0;

        // Copy any overlap already buffered.
        for node in self.nodes.iter() {
            let cur = offset + wrote as u64;
            if cur >= end {
                break;
            }
            let node_end = node.offset + node.data.len() as u64;
            if node_end <= cur {
                continue;
            }
            let from = (cur - node.offset) as usize;
            let to = ((end.min(node_end)) - node.offset) as usize;
            out.extend_from_slice(&node.data[from..to]);
            wrote += to - from;
        }

        // Read the origin forward for the rest of the range, buffering
        // each new chunk before copying its overlap.
        while offset + (wrote as u64) < end && !self.eof {
            let want = self
                .max_read_chunk
                .min((end - self.read_offset).max(1) as usize);
            let mut buf = vec![0_u8; want];
            let n = self.origin.read(&mut buf).map_err(|err| {
                FerryError::other_src("could not read origin stream", err)
            })?;
            if n == 0 {
                self.eof = true;
                break;
            }
            buf.truncate(n);
            let node = Node {
                offset: self.read_offset,
                data: bytes::Bytes::from(buf),
            };
            self.read_offset += n as u64;
            self.buffered += n;

            let cur = offset + wrote as u64;
            let node_end = node.offset + node.data.len() as u64;
            if node_end > cur && node.offset < end {
                let from = cur.max(node.offset) - node.offset;
                let to = end.min(node_end) - node.offset;
                out.extend_from_slice(
                    &node.data[from as usize..to as usize],
                );
                wrote += (to - from) as usize;
            }

            self.nodes.push_back(node);
            self.evict();
        }

        if self.eof && offset + (wrote as u64) < end {
            Ok(-(wrote as i64))
        } else {
            Ok(wrote as i64)
        }
    }

    /// True once the origin stream has reached end-of-data.
    pub fn reached_eof(&self) -> bool {
        self.eof
    }

    /// Offset one past the newest byte ever read from the origin.
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Drop history from the old end until the budget holds, always
    /// retaining the newest chunk.
    fn evict(&mut self) {
        while self.buffered > self.budget && self.nodes.len() > 1 {
            if let Some(node) = self.nodes.pop_front() {
                self.buffered -= node.data.len();
                self.oldest_offset = node.offset + node.data.len() as u64;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn make_window(
        data: &'static [u8],
        budget: usize,
        max_read_chunk: usize,
    ) -> RecoveryWindow {
        RecoveryWindow::new(
            Box::new(Cursor::new(data)),
            budget,
            max_read_chunk,
        )
    }

    #[test]
    fn sequential_read() {
        let mut w = make_window(b"0123456789", 1024, 4);
        let mut out = Vec::new();
        assert_eq!(10, w.get_data(0, 10, &mut out).unwrap());
        assert_eq!(b"0123456789", out.as_slice());
    }

    #[test]
    fn re_read_from_buffered_history() {
        let mut w = make_window(b"0123456789", 1024, 4);
        let mut out = Vec::new();
        assert_eq!(10, w.get_data(0, 10, &mut out).unwrap());

        // The origin is one-shot; this range can only come from the
        // buffered chain.
        let mut out = Vec::new();
        assert_eq!(4, w.get_data(3, 4, &mut out).unwrap());
        assert_eq!(b"3456", out.as_slice());
    }

    #[test]
    fn any_sub_range_round_trips() {
        const DATA: &[u8] = b"the quick brown fox jumps over the lazy dog";
        let mut w = make_window(DATA, 1024, 5);
        let mut out = Vec::new();
        assert_eq!(
            DATA.len() as i64,
            w.get_data(0, DATA.len(), &mut out).unwrap()
        );

        for (o, n) in [(0, 1), (5, 10), (20, 23), (42, 1)] {
            let mut out = Vec::new();
            assert_eq!(n as i64, w.get_data(o, n, &mut out).unwrap());
            assert_eq!(&DATA[o as usize..o as usize + n], out.as_slice());
        }
    }

    #[test]
    fn read_ahead_skips_to_requested_offset() {
        let mut w = make_window(b"0123456789", 1024, 3);
        // Request a range past anything read so far; the window reads
        // the origin forward and buffers the skipped prefix too.
        let mut out = Vec::new();
        assert_eq!(3, w.get_data(6, 3, &mut out).unwrap());
        assert_eq!(b"678", out.as_slice());

        // The skipped prefix is re-servable.
        let mut out = Vec::new();
        assert_eq!(3, w.get_data(1, 3, &mut out).unwrap());
        assert_eq!(b"123", out.as_slice());
    }

    #[test]
    fn eof_returns_negated_count() {
        let mut w = make_window(b"0123456789", 1024, 4);
        let mut out = Vec::new();
        // Request past the end: only 4 bytes exist at offset 6.
        assert_eq!(-4, w.get_data(6, 10, &mut out).unwrap());
        assert_eq!(b"6789", out.as_slice());
        assert!(w.reached_eof());
    }

    #[test]
    fn eof_with_no_bytes_available() {
        let mut w = make_window(b"01234", 1024, 4);
        let mut out = Vec::new();
        assert_eq!(5, w.get_data(0, 5, &mut out).unwrap());
        let mut out = Vec::new();
        assert_eq!(0, w.get_data(5, 3, &mut out).unwrap());
        assert!(out.is_empty());
        assert!(w.reached_eof());
    }

    #[test]
    fn exact_boundary_read_is_positive() {
        let mut w = make_window(b"01234", 1024, 4);
        let mut out = Vec::new();
        // The full range exists, even though the stream ends exactly at
        // the boundary.
        assert_eq!(5, w.get_data(0, 5, &mut out).unwrap());
        assert_eq!(b"01234", out.as_slice());
    }

    #[test]
    fn closed_window_errors() {
        let mut w = make_window(b"0123456789abcdef", 4, 2);
        let mut out = Vec::new();
        assert_eq!(16, w.get_data(0, 16, &mut out).unwrap());

        // The budget of 4 bytes has long since evicted offset 0.
        let mut out = Vec::new();
        w.get_data(0, 2, &mut out).unwrap_err();

        // The newest bytes are still retained.
        let mut out = Vec::new();
        assert_eq!(2, w.get_data(14, 2, &mut out).unwrap());
        assert_eq!(b"ef", out.as_slice());
    }

    #[test]
    fn newest_chunk_survives_tiny_budget() {
        let mut w = make_window(b"0123456789", 1, 4);
        let mut out = Vec::new();
        assert_eq!(10, w.get_data(0, 10, &mut out).unwrap());
        // Even with a 1-byte budget the newest chunk is never evicted.
        let mut out = Vec::new();
        assert_eq!(2, w.get_data(8, 2, &mut out).unwrap());
        assert_eq!(b"89", out.as_slice());
    }
}

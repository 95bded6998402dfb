//! SSE frame buffering.
//!
//! The engine, not the per-protocol parsers, is responsible for turning a
//! stream of arbitrarily-chunked upstream bytes into complete SSE frames:
//! a frame is delimited by a blank line (`\n\n` or `\r\n\r\n`).
//! This is the stateful half of stream parsing; `protocol::StreamParser`
//! implementations are pure functions over one already-complete frame.

/// Incrementally splits a byte stream into complete SSE frames.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buffer: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-arrived upstream bytes and drain every complete frame now
    /// available. Each returned frame includes its trailing blank line.
    /// Any trailing partial frame remains buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let boundary = find_blank_line(&self.buffer);
            match boundary {
                Some(end) => {
                    let frame: Vec<u8> = self.buffer.drain(..end).collect();
                    frames.push(frame);
                }
                None => break,
            }
        }

        frames
    }

    /// Flush any buffered partial frame at stream end. Returns it only if
    /// non-empty — a clean close with no trailing partial data yields
    /// nothing.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Find the end (exclusive) of the first frame in `buf`, i.e. the index
/// just past the first blank-line delimiter, if one is fully present.
fn find_blank_line(buf: &[u8]) -> Option<usize> {
    let double_lf = find_subslice(buf, b"\n\n").map(|i| i + 2);
    let double_crlf = find_subslice(buf, b"\r\n\r\n").map(|i| i + 4);
    match (double_lf, double_crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

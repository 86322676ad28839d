//! Line framing for raw pipe output.
//!
//! Buffers byte chunks as they arrive from the worker and yields complete logical
//! lines. `\r\n`, `\r` and `\n` all terminate a line, and a terminator split across
//! two reads resolves on the next [`LineFramer::feed`].

/// Accumulates raw bytes and extracts complete lines in arrival order.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Bytes that do not yet form a complete line.
    buffer: Vec<u8>,
    /// Total bytes ever fed.
    fed: usize,
    /// Bytes consumed into completed lines, terminators included.
    consumed: usize,
    /// Prefix of `buffer` already known to hold no terminator.
    scanned: usize,
}

impl LineFramer {
    /// Creates an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them.
    ///
    /// Terminators are stripped. A trailing `\r` is held back until the next byte
    /// shows whether it starts a `\r\n` pair.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.fed += bytes.len();
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = self.scanned;
        while i < self.buffer.len() {
            let terminator_len = match self.buffer[i] {
                b'\n' => 1,
                b'\r' => match self.buffer.get(i + 1) {
                    Some(b'\n') => 2,
                    Some(_) => 1,
                    // Undecided until more bytes arrive.
                    None => break,
                },
                _ => {
                    i += 1;
                    continue;
                }
            };
            lines.push(String::from_utf8_lossy(&self.buffer[start..i]).into_owned());
            i += terminator_len;
            start = i;
        }

        if start > 0 {
            self.buffer.drain(..start);
            self.consumed += start;
        }
        self.scanned = i - start;
        lines
    }

    /// Removes and returns the trailing partial line, if any.
    ///
    /// Used at end of stream, where no further terminator will arrive. A held-back
    /// `\r` is treated as a terminator and dropped.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let taken = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        self.consumed += taken.len();
        let text = String::from_utf8_lossy(&taken);
        Some(text.trim_end_matches('\r').to_string())
    }

    /// Returns the bytes still waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Total bytes fed so far.
    pub fn fed(&self) -> usize {
        self.fed
    }

    /// Bytes consumed into completed lines.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

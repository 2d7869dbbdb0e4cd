/// Bytes captured while sniffing, replayed front-to-back once sniffing ends.
///
/// The buffer is append-only until the first byte is consumed. `buffered_pos`
/// tracks how much of `buffered` was already handed back to the reader.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReplayBuffer {
    buffered_pos: usize,
    buffered: Vec<u8>,
}

impl ReplayBuffer {
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.buffered.extend_from_slice(bytes);
    }

    pub(crate) fn has_remaining(&self) -> bool {
        self.buffered_pos < self.buffered.len()
    }

    pub(crate) fn buffered_remaining(&self) -> usize {
        self.buffered.len().saturating_sub(self.buffered_pos)
    }

    pub(crate) fn remaining_slice(&self) -> &[u8] {
        let start = self.buffered_pos.min(self.buffered.len());
        &self.buffered[start..]
    }

    /// Copies as many remaining bytes as fit into `buf` and advances the cursor.
    pub(crate) fn copy_into(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() || !self.has_remaining() {
            return 0;
        }

        let available = self.remaining_slice();
        let to_copy = available.len().min(buf.len());
        buf[..to_copy].copy_from_slice(&available[..to_copy]);
        self.buffered_pos += to_copy;
        to_copy
    }

    /// Marks up to `amt` remaining bytes as consumed and returns how many were.
    pub(crate) fn consume(&mut self, amt: usize) -> usize {
        let consumed = amt.min(self.buffered_remaining());
        self.buffered_pos += consumed;
        consumed
    }

    /// Drops the backing allocation. Only valid once nothing remains to replay.
    pub(crate) fn release(&mut self) {
        debug_assert!(!self.has_remaining());
        self.buffered = Vec::new();
        self.buffered_pos = 0;
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffered.capacity()
    }

    pub(crate) fn into_remaining(mut self) -> Vec<u8> {
        if self.buffered_pos == 0 {
            return self.buffered;
        }
        self.buffered.drain(..self.buffered_pos.min(self.buffered.len()));
        self.buffered
    }
}

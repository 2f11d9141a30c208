//! Server-sent event line handling.

/// Reassembles arbitrary byte chunks into complete SSE lines.
///
/// Bytes are buffered until a newline arrives so multi-byte UTF-8 sequences
/// and JSON payloads split across network reads are never cut in half.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line completed by them (without the
    /// trailing `\n` / `\r\n`)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush a trailing line that never got its newline
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest).trim_end().to_string();
        (!line.is_empty()).then_some(line)
    }

    /// Number of buffered bytes not yet forming a line
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Extract the payloads of every `data:` line in a chunk.
///
/// A chunk that carries no SSE framing but looks like a bare JSON object is
/// returned as a single payload. `event:`, `id:` and comment lines are ignored.
pub fn data_payloads(chunk: &str) -> Vec<&str> {
    let trimmed = chunk.trim();
    if trimmed.starts_with('{') {
        return vec![trimmed];
    }
    trimmed
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("data:"))
        .map(str::trim)
        .filter(|payload| !payload.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_lines_are_buffered() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(b"data: {\"a\":").is_empty());
        assert_eq!(buffer.pending(), 11);

        let lines = buffer.push(b"1}\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]"]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_crlf_and_split_utf8() {
        let mut buffer = SseLineBuffer::new();
        let text = "data: héllo\r\n".as_bytes();
        // split inside the two-byte 'é'
        assert!(buffer.push(&text[..8]).is_empty());
        let lines = buffer.push(&text[8..]);
        assert_eq!(lines, vec!["data: héllo"]);
    }

    #[test]
    fn test_finish_flushes_tail() {
        let mut buffer = SseLineBuffer::new();
        buffer.push(b"data: tail");
        assert_eq!(buffer.finish(), Some("data: tail".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_data_payloads() {
        let chunk = "event: message_start\ndata: {\"type\":\"x\"}\n: keep-alive\ndata:[DONE]";
        assert_eq!(data_payloads(chunk), vec!["{\"type\":\"x\"}", "[DONE]"]);
        assert_eq!(data_payloads("  {\"raw\":true} "), vec!["{\"raw\":true}"]);
        assert!(data_payloads("event: ping").is_empty());
    }
}

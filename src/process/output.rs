//! Character-budgeted capture of a child's output stream.

/// Appended once when a stream exceeds its budget.
pub const TRUNCATION_MARKER: &str = "[output truncated]";

/// Accumulates one output stream up to a fixed character budget.
///
/// Early output is kept and later output dropped: the first diagnostics a
/// tool prints are usually the ones that explain a failure.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    kept_chars: usize,
    max_chars: usize,
    total_chars: usize,
    dropped_lines: usize,
    truncated: bool,
}

impl OutputBuffer {
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            kept_chars: 0,
            max_chars,
            total_chars: 0,
            dropped_lines: 0,
            truncated: false,
        }
    }

    /// Append one line (or line fragment) of output.
    ///
    /// A chunk that would overflow the budget is dropped whole, the marker is
    /// written, and every later chunk is discarded.
    pub fn push(&mut self, chunk: &str) {
        let chars = chunk.chars().count();
        self.total_chars = self.total_chars.saturating_add(chars);

        if self.truncated {
            self.dropped_lines += 1;
            return;
        }

        if self.kept_chars.saturating_add(chars) > self.max_chars {
            self.truncated = true;
            self.dropped_lines += 1;
            if !self.text.is_empty() && !self.text.ends_with('\n') {
                self.text.push('\n');
            }
            self.text.push_str(TRUNCATION_MARKER);
            return;
        }

        self.text.push_str(chunk);
        self.kept_chars += chars;
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Characters observed on the stream, kept or not.
    #[must_use]
    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    #[must_use]
    pub fn dropped_lines(&self) -> usize {
        self.dropped_lines
    }

    #[must_use]
    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }
}

/// Length of the longest prefix of `bytes` that does not end inside a
/// multi-byte UTF-8 sequence.
pub(crate) fn utf8_safe_split(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_output_within_budget() {
        let mut buffer = OutputBuffer::new(20);
        buffer.push("hello\n");
        buffer.push("world\n");
        assert_eq!(buffer.as_str(), "hello\nworld\n");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.total_chars(), 12);
    }

    #[test]
    fn marker_is_written_exactly_once() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push("12345\n");
        buffer.push("67890\n");
        buffer.push("abcde\n");
        buffer.push("fghij\n");

        assert_eq!(buffer.as_str(), "12345\n[output truncated]");
        assert_eq!(buffer.as_str().matches(TRUNCATION_MARKER).count(), 1);
        assert_eq!(buffer.dropped_lines(), 3);
        assert_eq!(buffer.total_chars(), 24);
    }

    #[test]
    fn budget_counts_characters_not_bytes() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push("ééé\n");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.as_str(), "ééé\n");
    }

    #[test]
    fn marker_starts_on_its_own_line() {
        let mut buffer = OutputBuffer::new(6);
        buffer.push("abc");
        buffer.push("defghij");
        assert_eq!(buffer.into_string(), "abc\n[output truncated]");
    }

    #[test]
    fn utf8_split_stops_before_partial_sequence() {
        let bytes = "aé".as_bytes();
        assert_eq!(utf8_safe_split(bytes), 3);
        assert_eq!(utf8_safe_split(&bytes[..2]), 1);
        assert_eq!(utf8_safe_split(&[0xff, b'a']), 2);
    }
}

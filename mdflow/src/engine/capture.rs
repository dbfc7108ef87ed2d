//! Bounded head+tail capture of engine output.
//!
//! MD engines can print megabytes of progress lines. The first bytes carry
//! the command banner and the last bytes carry the error, so both ends are
//! retained and the middle is replaced by an omission marker.

use std::collections::VecDeque;

/// Default number of bytes retained from the start of the output.
pub const DEFAULT_HEAD_BYTES: usize = 64 * 1024;
/// Default number of bytes retained from the end of the output.
pub const DEFAULT_TAIL_BYTES: usize = 256 * 1024;
/// Longest run of bytes without a line break handed to the capture as one line.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Byte limits for a [`LogCapture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    /// Bytes kept from the start.
    pub head_bytes: usize,
    /// Bytes kept from the end.
    pub tail_bytes: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            head_bytes: DEFAULT_HEAD_BYTES,
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }
}

/// Line-oriented capture buffer.
#[derive(Debug, Default)]
pub struct LogCapture {
    limits: CaptureLimits,
    head: Vec<String>,
    head_len: usize,
    head_full: bool,
    tail: VecDeque<String>,
    tail_len: usize,
    omitted_lines: usize,
    omitted_bytes: usize,
    total_lines: usize,
}

impl LogCapture {
    /// Creates an empty capture with the given limits.
    #[must_use]
    pub fn new(limits: CaptureLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Appends one line. A trailing newline is stripped.
    pub fn push_line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\n', '\r']).to_string();
        self.total_lines += 1;

        if !self.head_full {
            if self.head_len + line.len() <= self.limits.head_bytes {
                self.head_len += line.len() + 1;
                self.head.push(line);
                return;
            }
            self.head_full = true;
        }

        let line = self.clip_to_tail(line);
        self.tail_len += line.len() + 1;
        self.tail.push_back(line);
        while self.tail_len > self.limits.tail_bytes {
            match self.tail.pop_front() {
                Some(dropped) => {
                    self.tail_len -= dropped.len() + 1;
                    self.omitted_lines += 1;
                    self.omitted_bytes += dropped.len() + 1;
                }
                None => break,
            }
        }
    }

    /// Keeps only the end of a line that would not fit in the tail on its own.
    fn clip_to_tail(&mut self, line: String) -> String {
        let keep = self.limits.tail_bytes.saturating_sub(1);
        if line.len() <= keep {
            return line;
        }
        let mut start = line.len() - keep;
        while !line.is_char_boundary(start) {
            start += 1;
        }
        self.omitted_bytes += start;
        line[start..].to_string()
    }

    /// Returns the number of lines seen so far.
    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.total_lines
    }

    /// Freezes the capture.
    #[must_use]
    pub fn finish(self) -> CapturedLog {
        let mut lines = self.head;
        if self.omitted_bytes > 0 {
            lines.push(format!(
                "[... {} lines ({} bytes) omitted ...]",
                self.omitted_lines, self.omitted_bytes
            ));
        }
        lines.extend(self.tail);
        CapturedLog {
            lines,
            omitted_lines: self.omitted_lines,
            total_lines: self.total_lines,
        }
    }
}

/// Splits a raw output stream into lines for a [`LogCapture`].
///
/// Both `\n` and `\r` end a line, so carriage-return progress meters are
/// captured as separate lines. A run of bytes longer than the line cap is
/// flushed in pieces, which keeps memory bounded whatever the engine prints.
#[derive(Debug)]
pub struct LineSplitter {
    pending: Vec<u8>,
    max_line: usize,
    after_cr: bool,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl LineSplitter {
    /// Creates a splitter that flushes lines longer than `max_line` bytes.
    #[must_use]
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line: max_line.max(1),
            after_cr: false,
        }
    }

    /// Feeds a chunk of raw output.
    pub fn feed(&mut self, bytes: &[u8], capture: &mut LogCapture) {
        for &byte in bytes {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    self.after_cr = byte == b'\r';
                    self.emit(capture);
                }
                _ => {
                    self.after_cr = false;
                    self.pending.push(byte);
                    if self.pending.len() >= self.max_line {
                        self.emit(capture);
                    }
                }
            }
        }
    }

    /// Flushes an unterminated final line.
    pub fn finish(&mut self, capture: &mut LogCapture) {
        if !self.pending.is_empty() {
            self.emit(capture);
        }
    }

    fn emit(&mut self, capture: &mut LogCapture) {
        capture.push_line(&String::from_utf8_lossy(&self.pending));
        self.pending.clear();
    }
}

/// Retained output of one engine call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedLog {
    lines: Vec<String>,
    omitted_lines: usize,
    total_lines: usize,
}

impl CapturedLog {
    /// Builds a log from already-retained text.
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let total_lines = lines.len();
        Self {
            lines,
            omitted_lines: 0,
            total_lines,
        }
    }

    /// Retained lines, including the omission marker.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Retained text joined by newlines.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// The last `max_lines` retained lines.
    #[must_use]
    pub fn excerpt(&self, max_lines: usize) -> String {
        let start = self.lines.len().saturating_sub(max_lines);
        self.lines[start..].join("\n")
    }

    /// Lines dropped from the middle.
    #[must_use]
    pub fn omitted_lines(&self) -> usize {
        self.omitted_lines
    }

    /// Total lines the engine printed.
    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.total_lines
    }

    /// Returns true if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn small() -> CaptureLimits {
        CaptureLimits {
            head_bytes: 14,
            tail_bytes: 14,
        }
    }

    #[test]
    fn test_short_output_kept_verbatim() {
        let mut capture = LogCapture::new(CaptureLimits::default());
        capture.push_line("GROMACS version 2023\n");
        capture.push_line("Writing output\r\n");
        let log = capture.finish();

        assert_eq!(log.text(), "GROMACS version 2023\nWriting output");
        assert_eq!(log.omitted_lines(), 0);
    }

    #[test]
    fn test_long_output_keeps_head_and_tail() {
        let mut capture = LogCapture::new(small());
        for i in 0..20 {
            capture.push_line(&format!("line{i:02}"));
        }
        assert_eq!(capture.total_lines(), 20);
        let log = capture.finish();

        assert_eq!(log.lines()[0], "line00");
        assert_eq!(log.lines()[1], "line01");
        assert!(log.lines()[2].contains("omitted"));
        assert_eq!(log.lines().last().map(String::as_str), Some("line19"));
        assert_eq!(log.lines()[3], "line18");
        assert_eq!(log.omitted_lines(), 16);
        assert_eq!(log.total_lines(), 20);
    }

    #[test]
    fn test_line_longer_than_tail_keeps_its_end() {
        let mut capture = LogCapture::new(small());
        capture.push_line("banner");
        capture.push_line("Fatal error: something went badly wrong");
        let log = capture.finish();

        assert_eq!(log.lines()[0], "banner");
        assert!(log.lines()[1].contains("bytes) omitted"));
        assert_eq!(log.lines()[2], "t badly wrong");
        assert!(log.text().ends_with("badly wrong"));
    }

    #[test]
    fn test_splitter_breaks_on_carriage_returns() {
        let mut capture = LogCapture::new(CaptureLimits::default());
        let mut splitter = LineSplitter::default();
        splitter.feed(b"step 1\rstep 2\rstep 3\r\nFatal error:", &mut capture);
        splitter.feed(b" bad input\n", &mut capture);
        splitter.finish(&mut capture);
        let log = capture.finish();

        assert_eq!(
            log.lines(),
            &["step 1", "step 2", "step 3", "Fatal error: bad input"]
        );
    }

    #[test]
    fn test_splitter_caps_unterminated_runs() {
        let mut capture = LogCapture::new(CaptureLimits::default());
        let mut splitter = LineSplitter::new(4);
        splitter.feed(b"abcdefghij", &mut capture);
        splitter.finish(&mut capture);
        let log = capture.finish();

        assert_eq!(log.lines(), &["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_excerpt_takes_tail() {
        let log = CapturedLog::from_text("a\nb\nc\nFatal error:\nbad mdp");
        assert_eq!(log.excerpt(2), "Fatal error:\nbad mdp");
        assert_eq!(log.excerpt(100), log.text());
    }
}

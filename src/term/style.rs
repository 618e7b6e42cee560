// Streaming colorizer for LLM answers.
//
// Prose and fenced code blocks get different foreground colors. Input
// arrives token-by-token, so a fence marker (a line starting with three
// backticks) can be split across writes; partially-seen backticks at a
// line start are held until disambiguated, then flushed. Bytes are never
// dropped.

use std::io::{self, Write};

/// Rewrites `\n` to `\r\n` on the way to a raw-mode terminal.
pub struct CarriageReturnWriter<W: Write> {
    inner: W,
}

impl<W: Write> CarriageReturnWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for CarriageReturnWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            if b == b'\n' {
                self.inner.write_all(b"\r\n")?;
            } else {
                self.inner.write_all(&[b])?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Prose,
    Code,
}

/// Stream writer that classifies runs of UTF-8 text into prose vs fenced
/// code blocks and colors them differently on the way out.
pub struct StyleCodeblocksWriter<W: Write> {
    inner: W,
    mode: Mode,
    /// At the start of a line (fences are only recognized here).
    line_start: bool,
    /// Backticks seen so far at the current line start.
    pending_ticks: usize,
    /// Color last written to the terminal, to avoid repeating it.
    active_color: Option<String>,
    normal_color: String,
    highlight_color: String,
    terminal_width: usize,
}

impl<W: Write> StyleCodeblocksWriter<W> {
    pub fn new(inner: W, terminal_width: usize, normal_color: &str, highlight_color: &str) -> Self {
        Self {
            inner,
            mode: Mode::Prose,
            line_start: true,
            pending_ticks: 0,
            active_color: None,
            normal_color: normal_color.to_string(),
            highlight_color: highlight_color.to_string(),
            terminal_width,
        }
    }

    pub fn set_terminal_width(&mut self, width: usize) {
        self.terminal_width = width;
    }

    /// Back to prose mode with no pending classification; called between
    /// completions. Held backticks are flushed first so no bytes are lost.
    pub fn reset(&mut self) -> io::Result<()> {
        self.flush_pending()?;
        self.mode = Mode::Prose;
        self.line_start = true;
        self.active_color = None;
        self.inner.flush()
    }

    fn current_color(&self) -> &str {
        match self.mode {
            Mode::Prose => &self.normal_color,
            Mode::Code => &self.highlight_color,
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        let color = self.current_color().to_string();
        if self.active_color.as_deref() != Some(color.as_str()) {
            self.inner.write_all(color.as_bytes())?;
            self.active_color = Some(color);
        }
        self.inner.write_all(bytes)
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        if self.pending_ticks > 0 {
            let ticks = vec![b'`'; self.pending_ticks];
            self.pending_ticks = 0;
            self.line_start = false;
            self.emit(&ticks)?;
        }
        Ok(())
    }
}

impl<W: Write> Write for StyleCodeblocksWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            if self.line_start && b == b'`' {
                self.pending_ticks += 1;
                if self.pending_ticks == 3 {
                    // Fence: toggle mode, then emit the marker in the new
                    // block's color.
                    self.mode = match self.mode {
                        Mode::Prose => Mode::Code,
                        Mode::Code => Mode::Prose,
                    };
                    self.pending_ticks = 0;
                    self.line_start = false;
                    self.emit(b"```")?;
                }
                continue;
            }

            self.flush_pending()?;
            if b == b'\n' {
                self.emit(b"\n")?;
                self.line_start = true;
            } else {
                self.emit(&[b])?;
                self.line_start = false;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

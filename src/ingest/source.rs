use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::time::Duration;

/// Result of one attempt to read a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    /// Read timed out; nothing complete yet. Lets the caller check for shutdown.
    Idle,
    /// The source is gone (end of file, or the device stopped answering).
    Closed,
}

pub trait LineSource {
    fn next_line(&mut self) -> io::Result<ReadOutcome>;
}

/// Newline framing over any byte stream.
///
/// Partial lines survive read timeouts: bytes stay in `pending` until the
/// terminating `\n` arrives.
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    /// Emit an unterminated last line at end of stream (files do this, serial
    /// ports drop it since the device went away mid-line).
    keep_tail: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R, keep_tail: bool) -> Self {
        Self {
            inner: BufReader::new(inner),
            pending: Vec::new(),
            keep_tail,
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.pending.clear();
        line
    }
}

impl<R: Read> LineSource for LineReader<R> {
    fn next_line(&mut self) -> io::Result<ReadOutcome> {
        match self.inner.read_until(b'\n', &mut self.pending) {
            Ok(0) => {
                if self.keep_tail && !self.pending.is_empty() {
                    return Ok(ReadOutcome::Line(self.take_line()));
                }
                self.pending.clear();
                Ok(ReadOutcome::Closed)
            }
            Ok(_) if self.pending.ends_with(b"\n") => Ok(ReadOutcome::Line(self.take_line())),
            // Stream ended mid-line.
            Ok(_) if self.keep_tail => Ok(ReadOutcome::Line(self.take_line())),
            Ok(_) => Ok(ReadOutcome::Idle),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadOutcome::Idle)
            }
            Err(e) => Err(e),
        }
    }
}

pub type SerialSource = LineReader<Box<dyn serialport::SerialPort>>;

/// Open a serial port with a read timeout so the read loop can observe shutdown.
pub fn open_serial(port: &str, baud: u32, timeout: Duration) -> serialport::Result<SerialSource> {
    let port = serialport::new(port, baud).timeout(timeout).open()?;
    Ok(LineReader::new(port, false))
}

/// Replay a captured log file.
pub fn open_file(path: &Path) -> io::Result<LineReader<std::fs::File>> {
    Ok(LineReader::new(std::fs::File::open(path)?, true))
}

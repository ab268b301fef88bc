//! Child-process helpers shared across the workspace.
//!
//! - Command construction that never pops a console window on Windows and never
//!   leaves an orphaned child behind when its handle is dropped.
//! - A bounded tail buffer for capturing the end of a noisy output stream.

use std::collections::VecDeque;
use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Marker appended to captured output that lost its head.
pub const TRUNCATION_MARKER: &str = "[...truncated...]";

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a supervised child.
///
/// The child gets a null stdin, `CREATE_NO_WINDOW` on Windows, and is killed if
/// its handle is dropped before it has been waited on.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

/// Keeps the last `capacity` bytes of line-oriented output.
///
/// Lines are stored whole; when the budget is exceeded the oldest lines are
/// dropped first. A single line longer than the budget keeps only its tail.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    capacity: usize,
    lines: VecDeque<String>,
    len: usize,
    truncated: bool,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::new(),
            len: 0,
            truncated: false,
        }
    }

    /// Append a line (without its terminator).
    pub fn push_line(&mut self, line: &str) {
        if self.capacity == 0 {
            self.truncated = true;
            return;
        }

        let line = if line.len() > self.capacity {
            self.truncated = true;
            let mut start = line.len() - self.capacity;
            while !line.is_char_boundary(start) {
                start += 1;
            }
            &line[start..]
        } else {
            line
        };

        self.len += line.len();
        self.lines.push_back(line.to_string());

        while self.len > self.capacity {
            match self.lines.pop_front() {
                Some(dropped) => {
                    self.len -= dropped.len();
                    self.truncated = true;
                }
                None => break,
            }
        }
    }

    /// Whether any output has been discarded.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Last non-empty line, if any.
    pub fn last_line(&self) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
    }

    /// Join the retained lines, prefixed with [`TRUNCATION_MARKER`] if the head was cut.
    pub fn into_string(self) -> String {
        let body = Vec::from(self.lines).join("\n");
        if self.truncated {
            format!("{}\n{}", TRUNCATION_MARKER, body)
        } else {
            body
        }
    }
}

/// Read size used by [`read_tail`].
#[cfg(feature = "tokio")]
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Drain a reader into a [`TailBuffer`] of the given capacity.
///
/// Both `\n` and `\r` end a line, so carriage-return progress output is
/// split like any other. A line that has not ended yet is cut to `capacity`
/// while it grows; memory stays within `capacity` plus one read chunk.
/// Invalid UTF-8 is replaced lossily. Read errors end the capture early.
#[cfg(feature = "tokio")]
pub async fn read_tail<R>(mut reader: R, capacity: usize) -> TailBuffer
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut tail = TailBuffer::new(capacity);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut partial: Vec<u8> = Vec::new();
    let mut after_cr = false;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for &byte in &chunk[..n] {
            match byte {
                b'\n' if after_cr => after_cr = false,
                b'\n' | b'\r' => {
                    tail.push_line(&String::from_utf8_lossy(&partial));
                    partial.clear();
                    after_cr = byte == b'\r';
                }
                _ => {
                    partial.push(byte);
                    after_cr = false;
                }
            }
        }

        if partial.len() > capacity {
            partial.drain(..partial.len() - capacity);
            tail.truncated = true;
        }
    }

    if !partial.is_empty() {
        tail.push_line(&String::from_utf8_lossy(&partial));
    }

    tail
}

//! Minimal line discipline for a remote pty in raw mode.
//!
//! The client does no local echo or line editing, so this module translates
//! newlines on output and assembles input lines itself without echoing them.

use crate::transport::{PtySize, PtyRequest};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use zeroize::{Zeroize, Zeroizing};

pub const GREEN: &str = "\x1b[32m";
pub const RED: &str = "\x1b[31m";
pub const RESET: &str = "\x1b[0m";

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const CTRL_U: u8 = 0x15;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

/// Longest line kept; further input is dropped until the line ends.
pub const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Start,
    Csi,
    Ss3,
}

enum Input {
    Data(usize),
    Resize(Option<PtySize>),
}

/// Raw-mode terminal over a duplex byte stream.
pub struct Terminal<S> {
    stream: S,
    size: PtySize,
    resizes: Option<mpsc::UnboundedReceiver<PtySize>>,
    pending: Zeroizing<Vec<u8>>,
    escape: Escape,
    skip_lf: bool,
}

impl<S> Terminal<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, pty: PtyRequest) -> Self {
        Self {
            stream,
            size: pty.size,
            resizes: pty.resizes,
            pending: Zeroizing::new(Vec::new()),
            escape: Escape::None,
            skip_lf: false,
        }
    }

    pub fn size(&self) -> PtySize {
        self.size
    }

    /// Write text, turning `\n` into `\r\n` as a raw-mode pty expects.
    pub async fn write_str(&mut self, text: &str) -> io::Result<()> {
        let mut out = Vec::with_capacity(text.len() + 8);
        for byte in text.bytes() {
            if byte == b'\n' {
                out.push(b'\r');
            }
            out.push(byte);
        }
        self.stream.write_all(&out).await?;
        self.stream.flush().await
    }

    /// Print `prompt` and read one line without echo.
    ///
    /// The bytes are returned exactly as typed, capped at [`MAX_LINE`].
    /// Returns `None` when the client hangs up, presses Ctrl-C, or presses
    /// Ctrl-D on an empty line.
    pub async fn read_password(&mut self, prompt: &str) -> io::Result<Option<Zeroizing<Vec<u8>>>> {
        self.write_str(prompt).await?;
        // Never grows past this, so no stale copies are left behind by reallocation.
        let mut line = Zeroizing::new(Vec::with_capacity(MAX_LINE));

        loop {
            if self.pending.is_empty() && self.fill().await? == 0 {
                return Ok(None);
            }

            let byte = self.pending.remove(0);

            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }

            if self.escape != Escape::None {
                if byte == b'\r' || byte == b'\n' {
                    // A line end always ends the line, even inside a sequence.
                    self.escape = Escape::None;
                } else {
                    self.escape = match (self.escape, byte) {
                        (Escape::Start, b'[') => Escape::Csi,
                        (Escape::Start, b'O') => Escape::Ss3,
                        (Escape::Csi, 0x40..=0x7e) => Escape::None,
                        (Escape::Csi, _) => Escape::Csi,
                        _ => Escape::None,
                    };
                    continue;
                }
            }

            match byte {
                b'\r' | b'\n' => {
                    self.skip_lf = byte == b'\r';
                    self.write_str("\n").await?;
                    return Ok(Some(line));
                }
                CTRL_C => {
                    self.write_str("^C\n").await?;
                    return Ok(None);
                }
                CTRL_D if line.is_empty() => {
                    self.write_str("\n").await?;
                    return Ok(None);
                }
                BACKSPACE | DEL => pop_char(&mut line),
                CTRL_U => line.zeroize(),
                ESC => self.escape = Escape::Start,
                b if b < 0x20 => {}
                b => {
                    if line.len() < MAX_LINE {
                        line.push(b);
                    }
                }
            }
        }
    }

    /// Read more input into `pending`, applying resizes that arrive meanwhile.
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 256];
        loop {
            let input = match self.resizes.as_mut() {
                Some(resizes) => tokio::select! {
                    read = self.stream.read(&mut chunk) => Input::Data(read?),
                    size = resizes.recv() => Input::Resize(size),
                },
                None => Input::Data(self.stream.read(&mut chunk).await?),
            };

            match input {
                Input::Data(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    chunk.zeroize();
                    return Ok(n);
                }
                Input::Resize(Some(size)) => self.size = size,
                Input::Resize(None) => self.resizes = None,
            }
        }
    }
}

/// Remove the last UTF-8 character from `line`.
fn pop_char(line: &mut Vec<u8>) {
    while let Some(byte) = line.pop() {
        if byte & 0b1100_0000 != 0b1000_0000 {
            break;
        }
    }
}

/// Shorten `text` to at most `width` characters, marking the cut with `…`.
pub fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(width - 1).collect();
    out.push('…');
    out
}

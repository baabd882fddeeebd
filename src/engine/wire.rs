//! Length-prefixed framing of the controller link
//!
//! Every message is a 4-byte big-endian length followed by that many bytes
//! of text.

use std::io::{self, ErrorKind, Read, Write};

use super::request::{Command, ProtocolError, Reply};

/// Largest frame accepted from the controller.
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// Reads one frame.
///
/// `Ok(None)` means the peer closed the channel cleanly between frames.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<String>, ProtocolError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtocolError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    })?;
    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| ProtocolError::NotUtf8)
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &str) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame too long"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload.as_bytes())?;
    writer.flush()
}

/// Controller end of the link: sends commands, reads replies.
pub struct ControllerLink<R, W> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> ControllerLink<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn send(&mut self, command: &Command) -> io::Result<()> {
        write_frame(&mut self.writer, &command.to_string())
    }

    /// Sends raw text, bypassing [`Command`] formatting.
    pub fn send_raw(&mut self, payload: &str) -> io::Result<()> {
        write_frame(&mut self.writer, payload)
    }

    pub fn recv(&mut self) -> Result<Reply, ProtocolError> {
        let line = read_frame(&mut self.reader)?.ok_or(ProtocolError::Closed)?;
        line.parse()
    }

    /// Reads replies until one matches, returning it with everything skipped.
    pub fn recv_until(
        &mut self,
        mut done: impl FnMut(&Reply) -> bool,
    ) -> Result<(Reply, Vec<Reply>), ProtocolError> {
        let mut skipped = Vec::new();
        loop {
            let reply = self.recv()?;
            if done(&reply) {
                return Ok((reply, skipped));
            }
            skipped.push(reply);
        }
    }
}

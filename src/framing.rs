//! Wire framing for pipe streams.
//!
//! Every message travels as one frame:
//!
//! ```text
//! [u32 LE: payload length] [payload bytes]
//! ```
//!
//! Frame boundaries are authoritative. A read that finds zero header
//! bytes is end-of-stream; a read that finds one to three header bytes
//! is a torn frame and a protocol error, as is a payload shorter than
//! its header promised. Zero-length frames are never written.

use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Write one frame: length header, payload, flush.
///
/// The flush is part of the contract. The write loop relies on each
/// frame being fully handed to the OS before the next message is
/// dequeued, so a subsequent close cannot truncate it.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for an empty or oversized payload and
/// [`Error::Transport`] if the stream write fails.
pub fn write_frame<S: Write>(stream: &mut S, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(Error::Protocol("refusing to write a zero-length frame".into()));
    }
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::Protocol(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end-of-stream.
///
/// End-of-stream is only clean between frames: zero bytes where a
/// header was expected. A partial header or a payload cut short is a
/// [`Error::Protocol`].
pub fn read_frame<S: Read>(stream: &mut S) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match stream.read(&mut header[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::Protocol(format!(
                    "torn frame header: {filled} of 4 bytes before end of stream"
                )));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Transport(e)),
        }
    }

    let len = u32::from_le_bytes(header);
    if len == 0 {
        return Err(Error::Protocol("zero-length frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Protocol(format!("frame payload truncated: expected {len} bytes"))
        } else {
            Error::Transport(e)
        }
    })?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        let mut cursor = Cursor::new(buf);
        let payload = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        // Stream is exhausted, next read is a clean EOF.
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"one").unwrap();
        write_frame(&mut buf, b"two").unwrap();
        write_frame(&mut buf, b"three").unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"one");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"two");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"three");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn empty_stream_is_eof() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn torn_header_is_protocol_error() {
        // Two header bytes, then the stream ends.
        let mut cursor = Cursor::new(vec![5u8, 0]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got: {err}");
    }

    #[test]
    fn truncated_payload_is_protocol_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"full payload").unwrap();
        buf.truncate(buf.len() - 4);
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got: {err}");
    }

    #[test]
    fn zero_length_write_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(write_frame(&mut buf, b""), Err(Error::Protocol(_))));
        assert!(buf.is_empty(), "nothing should reach the stream");
    }

    #[test]
    fn zero_length_read_rejected() {
        let mut cursor = Cursor::new(vec![0u8; 4]);
        assert!(matches!(read_frame(&mut cursor), Err(Error::Protocol(_))));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());
        let mut cursor = Cursor::new(header);
        assert!(matches!(read_frame(&mut cursor), Err(Error::Protocol(_))));

        let big = vec![0u8; MAX_FRAME_SIZE as usize + 1];
        let mut buf = Vec::new();
        assert!(matches!(write_frame(&mut buf, &big), Err(Error::Protocol(_))));
    }

    #[test]
    fn large_payload_round_trip() {
        let data = vec![0x42u8; 256 * 1024];
        let mut buf = Vec::new();
        write_frame(&mut buf, &data).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), data);
    }
}

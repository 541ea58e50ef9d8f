//! Frame codec.
//!
//! ```text
//! | len (u32 LE) | opcode (u16) | flags (u16) | request-id (u64) | payload-len (u32) | payload |
//! ```
//!
//! `len` counts everything after itself: the 16-byte header plus the
//! payload. An oversized frame is consumed (its payload drained and
//! discarded) so the connection can answer `FrameTooLarge` and keep
//! serving.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{self, Read, Write};

use loam_core::{Error, Result};

/// Header bytes after the length prefix.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Default cap on one frame (16 MiB).
pub const MAX_FRAME_SIZE_DEFAULT: usize = 16 * 1024 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    pub flags: u16,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u16, request_id: u64, payload: Vec<u8>) -> Frame {
        Frame {
            opcode,
            flags: 0,
            request_id,
            payload,
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Frame {
        self.flags = flags;
        self
    }
}

/// Outcome of one read attempt.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// The peer closed the connection between frames.
    Eof,
    /// Frame over the size cap; header parsed, payload discarded.
    TooLarge { request_id: u64, size: usize },
}

/// Write one frame.
pub fn write_frame(w: &mut impl Write, frame: &Frame) -> Result<()> {
    let len = FRAME_HEADER_SIZE + frame.payload.len();
    w.write_u32::<LittleEndian>(len as u32)?;
    w.write_u16::<LittleEndian>(frame.opcode)?;
    w.write_u16::<LittleEndian>(frame.flags)?;
    w.write_u64::<LittleEndian>(frame.request_id)?;
    w.write_u32::<LittleEndian>(frame.payload.len() as u32)?;
    w.write_all(&frame.payload)?;
    w.flush()?;
    Ok(())
}

/// Read one frame, enforcing `max_frame`.
pub fn read_frame(r: &mut impl Read, max_frame: usize) -> Result<FrameRead> {
    let mut len_bytes = [0u8; 4];
    match read_exact_or_eof(r, &mut len_bytes)? {
        false => return Ok(FrameRead::Eof),
        true => {}
    }
    let len = LittleEndian::read_u32(&len_bytes) as usize;
    if len < FRAME_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "frame length {} shorter than the header",
            len
        )));
    }

    let mut header = [0u8; FRAME_HEADER_SIZE];
    r.read_exact(&mut header)?;
    let opcode = LittleEndian::read_u16(&header[0..2]);
    let flags = LittleEndian::read_u16(&header[2..4]);
    let request_id = LittleEndian::read_u64(&header[4..12]);
    let payload_len = LittleEndian::read_u32(&header[12..16]) as usize;

    if payload_len != len - FRAME_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "payload length {} disagrees with frame length {}",
            payload_len, len
        )));
    }

    if len > max_frame {
        // Drain the payload so the stream stays aligned
        io::copy(&mut r.take(payload_len as u64), &mut io::sink())?;
        return Ok(FrameRead::TooLarge {
            request_id,
            size: len,
        });
    }

    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)?;
    Ok(FrameRead::Frame(Frame {
        opcode,
        flags,
        request_id,
        payload,
    }))
}

fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::Protocol("connection closed mid-frame".into()));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip() {
        let frame = Frame::new(3, 42, b"hello".to_vec()).with_flags(7);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        // len = 16 + 5
        assert_eq!(LittleEndian::read_u32(&buf[0..4]), 21);

        let mut cursor = Cursor::new(buf);
        match read_frame(&mut cursor, MAX_FRAME_SIZE_DEFAULT).unwrap() {
            FrameRead::Frame(decoded) => assert_eq!(decoded, frame),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn eof_between_frames() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(
            read_frame(&mut cursor, MAX_FRAME_SIZE_DEFAULT).unwrap(),
            FrameRead::Eof
        ));
    }

    #[test]
    fn mid_frame_eof_is_a_protocol_error() {
        let frame = Frame::new(1, 1, b"payload".to_vec());
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor, MAX_FRAME_SIZE_DEFAULT).is_err());
    }

    #[test]
    fn oversized_frame_is_drained_and_flagged() {
        let frame = Frame::new(1, 99, vec![0u8; 64]);
        let second = Frame::new(2, 100, b"next".to_vec());
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        write_frame(&mut buf, &second).unwrap();

        let mut cursor = Cursor::new(buf);
        match read_frame(&mut cursor, 32).unwrap() {
            FrameRead::TooLarge { request_id, size } => {
                assert_eq!(request_id, 99);
                assert_eq!(size, 80);
            }
            other => panic!("expected TooLarge, got {:?}", other),
        }
        // The stream is still aligned on the next frame
        match read_frame(&mut cursor, 32).unwrap() {
            FrameRead::Frame(decoded) => assert_eq!(decoded.request_id, 100),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn inconsistent_lengths_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&20u32.to_le_bytes()); // len
        buf.extend_from_slice(&1u16.to_le_bytes()); // opcode
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags
        buf.extend_from_slice(&1u64.to_le_bytes()); // request id
        buf.extend_from_slice(&99u32.to_le_bytes()); // bogus payload len
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor, MAX_FRAME_SIZE_DEFAULT).is_err());
    }
}

//! Connection framing
//!
//! The request envelope has a fixed encoded size, so a frame is simply the
//! next `REQUEST_FRAME_LEN` bytes of the stream. The framer accumulates
//! partial reads into an exactly-sized buffer, so it can never consume
//! bytes past the end of the message and never hands a short buffer to
//! the decoder.

use std::io::{ErrorKind, Read, Write};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Peer closed after {received} of {expected} bytes")]
    Incomplete { received: usize, expected: usize },

    #[error("Timed out after {received} bytes")]
    TimedOut { received: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn is_timeout(kind: ErrorKind) -> bool {
    // Socket read/write timeouts surface as WouldBlock on Unix and
    // TimedOut on Windows.
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Read exactly `expected` bytes from `stream`.
///
/// Short reads are retried until the buffer is full. EOF before that point
/// is `FrameError::Incomplete`; the caller treats it as an aborted
/// connection, never as something to retry.
pub fn read_frame<R: Read>(stream: &mut R, expected: usize) -> Result<Vec<u8>, FrameError> {
    let mut buf = vec![0u8; expected];
    let mut filled = 0;

    while filled < expected {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(FrameError::Incomplete { received: filled, expected });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(e.kind()) => {
                return Err(FrameError::TimedOut { received: filled });
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }

    Ok(buf)
}

/// Write all of `data`, retrying partial writes, then flush.
pub fn write_frame<W: Write>(stream: &mut W, data: &[u8]) -> Result<(), FrameError> {
    let mut written = 0;

    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => {
                return Err(FrameError::Io(std::io::Error::new(
                    ErrorKind::WriteZero,
                    format!("peer stopped accepting after {} of {} bytes", written, data.len()),
                )));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(e.kind()) => {
                return Err(FrameError::TimedOut { received: written });
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }

    stream.flush()?;
    Ok(())
}

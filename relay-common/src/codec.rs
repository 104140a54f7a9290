//! Length-prefixed framed-TCP codec (§4.1).
//!
//! Wire format: `length:u32-be || payload[length]`. Reads are performed against whatever
//! `Read` the reactor hands the codec — for a non-blocking `mio` socket, `WouldBlock` is
//! retried until a per-read deadline elapses; for a blocking stream (tests, the in-process
//! RPC seam) the loop simply never sees `WouldBlock`.

use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::CodecError;

/// A short pause between non-blocking retries, to avoid busy-spinning while waiting for more
/// bytes to arrive on an otherwise-idle socket.
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Reads exactly `buf.len()` bytes, retrying `WouldBlock`/`Interrupted` until `deadline`
/// elapses.
fn read_exact_with_deadline<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), CodecError> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => return Err(CodecError::Closed),
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                if Instant::now() >= deadline {
                    return Err(CodecError::Timeout);
                }
                thread::sleep(RETRY_BACKOFF);
            }
            Err(e) => return Err(CodecError::Io(e)),
        }
    }
    Ok(())
}

/// Reads one complete frame from `reader`, bounded by `read_deadline` and rejecting frames
/// whose declared length is zero or exceeds `max_frame_len`.
pub fn read_frame<R: Read>(
    reader: &mut R,
    max_frame_len: u32,
    read_deadline: Duration,
) -> Result<Vec<u8>, CodecError> {
    let deadline = Instant::now() + read_deadline;

    let mut len_buf = [0u8; 4];
    read_exact_with_deadline(reader, &mut len_buf, deadline)?;
    let len = u32::from_be_bytes(len_buf);

    if len == 0 || len > max_frame_len {
        return Err(CodecError::Protocol(len));
    }

    let mut payload = vec![0u8; len as usize];
    read_exact_with_deadline(reader, &mut payload, deadline)?;
    Ok(payload)
}

/// Writes one complete frame to `writer`, looping over partial writes until everything is
/// flushed.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::Protocol(u32::MAX))?;
    let mut written = 0usize;
    let header = len.to_be_bytes();

    while written < header.len() {
        match writer.write(&header[written..]) {
            Ok(0) => return Err(CodecError::Closed),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::Io(e)),
        }
    }

    written = 0;
    while written < payload.len() {
        match writer.write(&payload[written..]) {
            Ok(0) => return Err(CodecError::Closed),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::Io(e)),
        }
    }

    writer.flush().map_err(CodecError::Io)
}

/// Encodes a frame into a freshly allocated buffer — convenient for handing a payload to a
/// channel without an intermediate `Write` target.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(4 + payload.len());
    write_frame(&mut out, payload)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_arbitrary_payloads() {
        for len in [1usize, 2, 17, 4096, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let encoded = encode_frame(&payload).unwrap();
            let mut cursor = Cursor::new(encoded);
            let decoded =
                read_frame(&mut cursor, u32::MAX, Duration::from_secs(1)).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn rejects_zero_length_frame() {
        let mut cursor = Cursor::new(0u32.to_be_bytes().to_vec());
        let err = read_frame(&mut cursor, u32::MAX, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CodecError::Protocol(0)));
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut cursor = Cursor::new(100u32.to_be_bytes().to_vec());
        let err = read_frame(&mut cursor, 10, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CodecError::Protocol(100)));
    }

    #[test]
    fn reports_closed_on_eof_mid_frame() {
        // Declares a 10-byte payload but supplies none.
        let mut cursor = Cursor::new(10u32.to_be_bytes().to_vec());
        let err = read_frame(&mut cursor, u32::MAX, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CodecError::Closed));
    }

    struct AlwaysWouldBlock;
    impl Read for AlwaysWouldBlock {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(ErrorKind::WouldBlock))
        }
    }

    #[test]
    fn times_out_on_idle_socket() {
        let mut reader = AlwaysWouldBlock;
        let err = read_frame(&mut reader, u32::MAX, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, CodecError::Timeout));
    }
}

//! Byte-level line framing for the reader thread.

use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};

/// Read one line, up to and including `\n`, capped at `max_bytes`.
///
/// A line that hits the cap is returned as-is without a terminator. Port read timeouts are
/// retried for as long as `running` is set; once it is cleared the partial line is
/// discarded and `Ok(None)` is returned. End of stream is an error: a serial port never
/// legitimately reports it.
pub fn read_line<R: Read + ?Sized>(
    reader: &mut R,
    max_bytes: usize,
    running: &AtomicBool,
) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::with_capacity(max_bytes.min(256));
    let mut byte = [0u8; 1];

    while line.len() < max_bytes {
        if !running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match reader.read(&mut byte) {
            Ok(1) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Ok(_) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "Serial port closed",
                ))
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(Some(line))
}

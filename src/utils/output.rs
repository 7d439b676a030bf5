/// Bounded stdout/stderr capture.
///
/// A stream is read to EOF even after the cap is reached; excess bytes are
/// discarded so a chatty payload never blocks on a full pipe.
use crate::config::types::OutputIntegrity;
use crossbeam_channel::{bounded, Receiver};
use std::io::{ErrorKind, Read};
use std::thread;

const CHUNK: usize = 8192;

/// One captured stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    /// Bytes the payload wrote, including discarded ones
    pub total_bytes: u64,
    pub integrity: OutputIntegrity,
}

impl CapturedStream {
    /// Lossy UTF-8 text, with a marker when the stream was cut.
    pub fn into_text(self, limit: usize) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.integrity == OutputIntegrity::TruncatedByLimit {
            text.push_str(&truncation_marker(limit));
        }
        text
    }
}

pub fn truncation_marker(limit: usize) -> String {
    format!("\n[output truncated at {} bytes]", limit)
}

/// Read `reader` to EOF keeping at most `limit` bytes.
pub fn read_bounded<R: Read>(mut reader: R, limit: usize) -> CapturedStream {
    let mut captured = CapturedStream::default();
    let mut buf = [0u8; CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                captured.total_bytes += n as u64;
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.bytes.extend_from_slice(&buf[..room]);
                    captured.integrity = OutputIntegrity::TruncatedByLimit;
                } else {
                    captured.bytes.extend_from_slice(&buf[..n]);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => {
                if captured.integrity == OutputIntegrity::Complete {
                    captured.integrity = OutputIntegrity::ReadError;
                }
                break;
            }
        }
    }
    captured
}

/// Capture `reader` on its own thread; the result arrives on the channel
/// once the writer side is closed.
pub fn spawn_reader<R>(name: &str, reader: R, limit: usize) -> std::io::Result<Receiver<CapturedStream>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name(format!("capture-{}", name))
        .spawn(move || {
            let _ = tx.send(read_bounded(reader, limit));
        })?;
    Ok(rx)
}

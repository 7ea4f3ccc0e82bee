//! Test data generators.

use crate::error::NfsResult;
use crate::reader::{NfsFileReader, ReaderEvent};
use bytes::{Bytes, BytesMut};

/// Deterministic content of `size` bytes.
///
/// The pattern repeats every 251 bytes (a prime), so a read at the wrong
/// offset is detected even across power-of-two boundaries.
pub fn patterned_content(size: usize) -> Bytes {
    #[allow(clippy::cast_possible_truncation)]
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Reads an opened reader to end of file in `chunk`-sized reads.
///
/// The reader must be `Idle`.
pub async fn read_all(reader: &mut NfsFileReader, chunk: u32) -> NfsResult<Bytes> {
    let mut out = BytesMut::new();
    loop {
        reader.read(out.len() as u64, chunk)?;
        match reader.next_event().await {
            Some(ReaderEvent::Data(data)) if data.is_empty() => return Ok(out.freeze()),
            Some(ReaderEvent::Data(data)) => out.extend_from_slice(&data),
            Some(ReaderEvent::Error(e)) => return Err(e),
            Some(ReaderEvent::Opened { .. }) | None => {
                return Err(crate::error::NfsError::InvalidState("reader not reading"));
            }
        }
    }
}

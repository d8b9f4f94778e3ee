//! Length plus checksum framing shared by the transaction catalog, wal
//! segments, and table row storage.
//!
//! A frame is `[payload len: u32 LE][crc32 of payload: u32 LE][payload]`
//! with a bincode payload. Decoding stops at the first torn or corrupt
//! frame and reports how far the file is still whole, so callers can cut
//! or ignore the tail.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use heron_common::error::EngineResult;

const FRAME_HEADER: usize = 8;

pub fn encode_frame<T: Serialize>(value: &T) -> EngineResult<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes consecutive frames from `data[start..]`. Returns the decoded
/// values and the offset just past the last whole frame, measured from
/// the start of `data`. `what` names the record kind in log lines.
pub fn decode_frames<T: DeserializeOwned>(
    data: &[u8],
    start: usize,
    origin: &Path,
    what: &str,
) -> (Vec<T>, u64) {
    let mut out = Vec::new();
    let mut pos = start;
    while pos < data.len() {
        if pos + FRAME_HEADER > data.len() {
            tracing::warn!(path = %origin.display(), "truncated {} record, stopping", what);
            break;
        }
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
        if pos + FRAME_HEADER + len > data.len() {
            tracing::warn!(path = %origin.display(), "truncated {} record, stopping", what);
            break;
        }
        let payload = &data[pos + FRAME_HEADER..pos + FRAME_HEADER + len];
        if crc32fast::hash(payload) != crc {
            tracing::warn!(path = %origin.display(), "{} record checksum mismatch, stopping", what);
            break;
        }
        match bincode::deserialize::<T>(payload) {
            Ok(value) => out.push(value),
            Err(e) => {
                tracing::warn!(
                    path = %origin.display(),
                    error = %e,
                    "undecodable {} record, stopping", what
                );
                break;
            }
        }
        pos += FRAME_HEADER + len;
    }
    (out, pos as u64)
}

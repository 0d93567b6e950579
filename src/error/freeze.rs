//! Freezing a frame sequence to a file descriptor and thawing it back.
//!
//! The wire format is raw pointers into the call site's string literals:
//! valid only between processes that share the same binary image
//! (parent/child across a `fork()`). Rust's `&'static str` is a fat
//! pointer (data address + length), so each string field is written
//! here as an (address, length) pair instead of a single scalar — this
//! only needs to round-trip within one process image, never across a
//! wire.

use std::io::{self, Read, Write};

use super::frame::{ErrorFrame, FrameSeqId};

const MAGIC_FIELD_COUNT: usize = 8;
const FIELD_WIDTH: usize = 8;
const RECORD_LEN: usize = MAGIC_FIELD_COUNT * FIELD_WIDTH;

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn encode_frame(frame: &ErrorFrame) -> [u8; RECORD_LEN] {
    let mut buf = Vec::with_capacity(RECORD_LEN);
    write_u64(&mut buf, frame.file.as_ptr() as u64);
    write_u64(&mut buf, frame.file.len() as u64);
    write_u64(&mut buf, frame.line as u64);
    write_u64(&mut buf, frame.func.as_ptr() as u64);
    write_u64(&mut buf, frame.func.len() as u64);
    write_u64(&mut buf, frame.description.as_ptr() as u64);
    write_u64(&mut buf, frame.description.len() as u64);
    write_u64(&mut buf, frame.errno as u64);
    // tid/seq_index packed into the spare slot below.
    buf.try_into().unwrap()
}

/// `ErrorFrame` doesn't fit in `MAGIC_FIELD_COUNT` 8-byte fields once the
/// sequence id is included, so the id is appended as a second fixed-size
/// record component rather than crammed in above.
fn encode_seq_id(seq: FrameSeqId) -> [u8; 8] {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&seq.tid.to_ne_bytes());
    buf.extend_from_slice(&seq.seq_index.to_ne_bytes());
    buf.try_into().unwrap()
}

fn decode_seq_id(buf: &[u8]) -> FrameSeqId {
    FrameSeqId {
        tid: i32::from_ne_bytes(buf[0..4].try_into().unwrap()),
        seq_index: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
    }
}

/// # Safety
///
/// The caller must guarantee that `buf` was produced by [`freeze`] in
/// this same binary image (same process, or a descendant sharing the
/// mapping via `fork()`).
unsafe fn decode_frame(buf: &[u8]) -> ErrorFrame {
    let file_ptr = read_u64(buf, 0) as *const u8;
    let file_len = read_u64(buf, 8) as usize;
    let line = read_u64(buf, 16) as u32;
    let func_ptr = read_u64(buf, 24) as *const u8;
    let func_len = read_u64(buf, 32) as usize;
    let desc_ptr = read_u64(buf, 40) as *const u8;
    let desc_len = read_u64(buf, 48) as usize;
    let errno = read_u64(buf, 56) as i32;
    let sequence = decode_seq_id(&buf[RECORD_LEN..RECORD_LEN + 8]);

    ErrorFrame {
        file: std::str::from_utf8_unchecked(std::slice::from_raw_parts(file_ptr, file_len)),
        line,
        func: std::str::from_utf8_unchecked(std::slice::from_raw_parts(func_ptr, func_len)),
        description: std::str::from_utf8_unchecked(std::slice::from_raw_parts(desc_ptr, desc_len)),
        errno,
        sequence,
    }
}

/// Writes a 4-byte length followed by `length` frame records to `writer`,
/// returning the number of frames written.
pub fn freeze<W: Write>(mut writer: W, frames: &[ErrorFrame]) -> io::Result<usize> {
    writer.write_all(&(frames.len() as u32).to_ne_bytes())?;

    for frame in frames {
        writer.write_all(&encode_frame(frame))?;
        writer.write_all(&encode_seq_id(frame.sequence))?;
    }

    Ok(frames.len())
}

/// Reads a length-prefixed frame sequence back from `reader`.
///
/// # Safety
///
/// See [`decode_frame`]: the data must have been produced by [`freeze`]
/// in this same binary image.
pub unsafe fn thaw<R: Read>(mut reader: R) -> io::Result<Vec<ErrorFrame>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_ne_bytes(len_buf) as usize;

    let mut frames = Vec::with_capacity(len);
    let mut record = [0u8; RECORD_LEN + 8];
    for _ in 0..len {
        reader.read_exact(&mut record)?;
        frames.push(decode_frame(&record));
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_process() {
        let frames = vec![ErrorFrame {
            file: "freeze.rs",
            line: 42,
            func: "round_trips_within_process",
            description: "synthetic",
            errno: -2,
            sequence: FrameSeqId {
                tid: 7,
                seq_index: 3,
            },
        }];

        let mut buf = Vec::new();
        let written = freeze(&mut buf, &frames).unwrap();
        assert_eq!(written, 1);

        let thawed = unsafe { thaw(&buf[..]).unwrap() };
        assert_eq!(thawed.len(), 1);
        assert_eq!(thawed[0].errno, -2);
        assert_eq!(thawed[0].line, 42);
        assert_eq!(thawed[0].file, "freeze.rs");
        assert_eq!(thawed[0].sequence.seq_index, 3);
    }
}

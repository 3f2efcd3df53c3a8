//! Streaming XZ extraction
//!
//! Feeds fixed-size input blocks into an xz2 stream decoder and flushes
//! fixed-size output blocks, so memory use does not depend on image size.
//! Concatenated XZ streams are accepted; the input must end exactly at the
//! container's end marker.

use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
};

use log::{debug, warn};
use xz2::stream::{Action, CONCATENATED, Status, Stream};

use crate::error::{AcquireError, DecompressError};
use crate::progress::CancelToken;

pub const BLOCK_SIZE: usize = 64 * 1024;

/// Decompress `input` into `output`, calling `progress` with the running
/// output size after every flushed block. Returns the decompressed size.
///
/// On any failure the partial `output` is removed.
pub fn extract_xz(
    input: &Path,
    output: &Path,
    cancel: &CancelToken,
    progress: impl FnMut(u64),
) -> Result<u64, AcquireError> {
    let reader =
        File::open(input).map_err(AcquireError::io("Failed to open", input))?;
    let writer = File::create(output)
        .map_err(AcquireError::io("Failed to create", output))?;

    let result = decode(reader, writer, input, output, cancel, progress);
    if result.is_err() {
        if let Err(e) = fs::remove_file(output) {
            warn!("Cannot remove partial {}: {e}", output.display());
        }
    }
    result
}

fn decode<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    input: &Path,
    output: &Path,
    cancel: &CancelToken,
    mut progress: impl FnMut(u64),
) -> Result<u64, AcquireError> {
    let mut stream = Stream::new_stream_decoder(u64::MAX, CONCATENATED)
        .map_err(DecompressError::from)?;

    let mut inbuf = vec![0u8; BLOCK_SIZE];
    let mut outbuf = vec![0u8; BLOCK_SIZE];
    let (mut in_pos, mut in_len) = (0usize, 0usize);
    let mut out_len = 0usize;
    let mut at_eof = false;
    let mut stalled = false;
    let mut total_written: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        if in_pos == in_len && !at_eof {
            in_len = reader
                .read(&mut inbuf)
                .map_err(AcquireError::io("Error reading", input))?;
            in_pos = 0;
            at_eof = in_len == 0;
        }
        let action = if at_eof { Action::Finish } else { Action::Run };

        let (before_in, before_out) = (stream.total_in(), stream.total_out());
        let status = stream
            .process(&inbuf[in_pos..in_len], &mut outbuf[out_len..], action)
            .map_err(DecompressError::from)?;
        let consumed = (stream.total_in() - before_in) as usize;
        let produced = (stream.total_out() - before_out) as usize;
        in_pos += consumed;
        out_len += produced;

        let finished = matches!(status, Status::StreamEnd);
        if out_len == outbuf.len() || (finished && out_len > 0) {
            writer
                .write_all(&outbuf[..out_len])
                .map_err(AcquireError::io("Error writing", output))?;
            total_written += out_len as u64;
            out_len = 0;
            progress(total_written);
        }
        if finished {
            break;
        }

        // liblzma reports a truncated stream as "no progress possible"
        if matches!(status, Status::MemNeeded) {
            return Err(DecompressError::Truncated.into());
        }
        if at_eof && consumed == 0 && produced == 0 {
            if stalled {
                return Err(DecompressError::Truncated.into());
            }
            stalled = true;
        } else {
            stalled = false;
        }
    }

    writer
        .flush()
        .map_err(AcquireError::io("Error writing", output))?;
    debug!("Extracted {total_written} bytes successfully");
    Ok(total_written)
}

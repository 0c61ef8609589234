//! Byte-stream compression for stored artifacts.
//!
//! No framing beyond the zstd frame itself; the entry descriptor's
//! `compression_mode` tells readers whether to decompress.

use crate::error::CacheError;
use std::io::Read;

/// Hard upper bound for a single decompressed artifact held in memory.
///
/// Cache corruption should degrade to a cache miss, not an out-of-memory
/// crash; a corrupted frame must not be able to request an enormous
/// allocation.
const MAX_DECOMPRESSED_LEN: u64 = 1024 * 1024 * 1024;

/// Compress `data` at the given zstd level (0 = the codec's default).
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, CacheError> {
    zstd::bulk::compress(data, level).map_err(|err| CacheError::Compression {
        message: err.to_string(),
    })
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    let decoder = zstd::stream::read::Decoder::new(data).map_err(|err| {
        CacheError::Compression {
            message: err.to_string(),
        }
    })?;

    let mut out = Vec::new();
    decoder
        .take(MAX_DECOMPRESSED_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|err| CacheError::Compression {
            message: err.to_string(),
        })?;
    if out.len() as u64 > MAX_DECOMPRESSED_LEN {
        return Err(CacheError::Compression {
            message: format!("decompressed payload exceeds {MAX_DECOMPRESSED_LEN} bytes"),
        });
    }
    Ok(out)
}

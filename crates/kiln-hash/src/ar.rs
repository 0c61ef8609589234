//! Deterministic hashing of Unix `ar`-family archives.
//!
//! Static archives embed a per-member modification time, owner uid/gid and
//! file mode in every member header. Those fields change between otherwise
//! identical builds, so hashing an archive raw would defeat caching for any
//! invocation that takes a `.a` file as input. Only the member name, its size
//! field and its body contribute to the digest.

use crate::{DigestBuilder, HashError};

const GLOBAL_MAGIC: &[u8; 8] = b"!<arch>\n";
const MEMBER_HEADER_LEN: usize = 60;
const MEMBER_END_MAGIC: &[u8; 2] = b"`\n";

// Member header layout (all fields ASCII, space padded):
//   0..16  name
//  16..28  mtime      (excluded from the digest)
//  28..34  uid        (excluded)
//  34..40  gid        (excluded)
//  40..48  mode       (excluded)
//  48..58  size
//  58..60  end marker "`\n"
const NAME_RANGE: std::ops::Range<usize> = 0..16;
const SIZE_RANGE: std::ops::Range<usize> = 48..58;

pub(crate) fn is_ar_archive(data: &[u8]) -> bool {
    data.len() >= GLOBAL_MAGIC.len() && &data[..GLOBAL_MAGIC.len()] == GLOBAL_MAGIC
}

pub(crate) fn update_from_ar_data(
    builder: &mut DigestBuilder,
    data: &[u8],
) -> Result<(), HashError> {
    debug_assert!(is_ar_archive(data));
    builder.update(GLOBAL_MAGIC);

    let mut pos = GLOBAL_MAGIC.len();
    while pos < data.len() {
        let remaining = &data[pos..];
        if remaining.len() < MEMBER_HEADER_LEN {
            return Err(HashError::MalformedArchive("truncated member header"));
        }
        let header = &remaining[..MEMBER_HEADER_LEN];
        if &header[58..60] != MEMBER_END_MAGIC {
            return Err(HashError::MalformedArchive("bad member end marker"));
        }

        let size = parse_decimal_field(&header[SIZE_RANGE])
            .ok_or(HashError::MalformedArchive("bad member size field"))?;
        let body_start = pos + MEMBER_HEADER_LEN;
        let body_end = body_start + size;
        if body_end > data.len() {
            return Err(HashError::MalformedArchive("truncated member body"));
        }

        builder.update(&header[NAME_RANGE]);
        builder.update(&header[SIZE_RANGE]);
        builder.update(&data[body_start..body_end]);

        // Bodies are padded to even offsets with a single newline.
        pos = body_end + (size & 1);
    }

    Ok(())
}

fn parse_decimal_field(field: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(field).ok()?.trim_end_matches(' ');
    text.parse().ok()
}

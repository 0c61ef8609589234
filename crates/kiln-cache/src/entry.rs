use crate::error::CacheError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Name of the serialized descriptor file inside an entry directory, and the
/// trailing component of the descriptor's remote key.
pub const ENTRY_FILE_NAME: &str = ".entry";

const MAGIC: [u8; 8] = *b"KILNENT\x01";
const FORMAT_VERSION: u16 = 1;

/// How the files referenced by an entry are stored.
///
/// These values are part of the on-disk format; do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionMode {
    #[default]
    None = 0,
    All = 1,
}

impl CompressionMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::All),
            _ => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, Self::All)
    }
}

/// The value stored per fingerprint: which artifacts were captured, how they
/// are stored, and the run's observable side effects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheEntry {
    /// Identifiers actually captured — a subset of the wrapper's declared
    /// expected files (missing optional files are omitted).
    pub file_ids: Vec<String>,
    pub compression_mode: CompressionMode,
    pub std_out: Vec<u8>,
    pub std_err: Vec<u8>,
    pub return_code: i32,
}

impl CacheEntry {
    pub fn has_file(&self, file_id: &str) -> bool {
        self.file_ids.iter().any(|id| id == file_id)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            MAGIC.len() + 64 + self.std_out.len() + self.std_err.len(),
        );

        out.write_all(&MAGIC).expect("in-memory write");
        out.write_u16::<LittleEndian>(FORMAT_VERSION)
            .expect("in-memory write");

        out.write_u32::<LittleEndian>(self.file_ids.len() as u32)
            .expect("in-memory write");
        for file_id in &self.file_ids {
            write_bytes(&mut out, file_id.as_bytes());
        }

        out.write_u8(self.compression_mode as u8)
            .expect("in-memory write");
        write_bytes(&mut out, &self.std_out);
        write_bytes(&mut out, &self.std_err);
        out.write_i32::<LittleEndian>(self.return_code)
            .expect("in-memory write");

        out
    }

    /// Decode a descriptor, rejecting unknown versions and malformed input.
    ///
    /// Callers treat every decode failure as a cache miss, never a crash.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CacheError> {
        let mut r = Cursor::new(bytes);

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)
            .map_err(|_| CacheError::Codec("truncated descriptor"))?;
        if magic != MAGIC {
            return Err(CacheError::Codec("bad magic"));
        }

        let version = read_u16(&mut r)?;
        if version != FORMAT_VERSION {
            return Err(CacheError::Codec("unsupported format version"));
        }

        let file_id_count = read_u32(&mut r)? as usize;
        if file_id_count > bytes.len() {
            return Err(CacheError::Codec("implausible file id count"));
        }
        let mut file_ids = Vec::with_capacity(file_id_count);
        for _ in 0..file_id_count {
            let raw = read_bytes(&mut r, bytes.len())?;
            let file_id = String::from_utf8(raw)
                .map_err(|_| CacheError::Codec("file id is not valid UTF-8"))?;
            file_ids.push(file_id);
        }

        let compression_mode = CompressionMode::from_u8(read_u8(&mut r)?)
            .ok_or(CacheError::Codec("unknown compression mode"))?;
        let std_out = read_bytes(&mut r, bytes.len())?;
        let std_err = read_bytes(&mut r, bytes.len())?;
        let return_code = r
            .read_i32::<LittleEndian>()
            .map_err(|_| CacheError::Codec("truncated descriptor"))?;

        Ok(Self {
            file_ids,
            compression_mode,
            std_out,
            std_err,
            return_code,
        })
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.write_u32::<LittleEndian>(bytes.len() as u32)
        .expect("in-memory write");
    out.write_all(bytes).expect("in-memory write");
}

fn read_u8(r: &mut Cursor<&[u8]>) -> Result<u8, CacheError> {
    r.read_u8().map_err(|_| CacheError::Codec("truncated descriptor"))
}

fn read_u16(r: &mut Cursor<&[u8]>) -> Result<u16, CacheError> {
    r.read_u16::<LittleEndian>()
        .map_err(|_| CacheError::Codec("truncated descriptor"))
}

fn read_u32(r: &mut Cursor<&[u8]>) -> Result<u32, CacheError> {
    r.read_u32::<LittleEndian>()
        .map_err(|_| CacheError::Codec("truncated descriptor"))
}

fn read_bytes(r: &mut Cursor<&[u8]>, input_len: usize) -> Result<Vec<u8>, CacheError> {
    let len = read_u32(r)? as usize;
    // A corrupt length prefix must degrade to a miss, not an allocation of
    // attacker-controlled size.
    if len > input_len {
        return Err(CacheError::Codec("implausible length prefix"));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|_| CacheError::Codec("truncated descriptor"))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> CacheEntry {
        CacheEntry {
            file_ids: vec!["object".to_string(), "coverage".to_string()],
            compression_mode: CompressionMode::All,
            std_out: b"warning: something\n".to_vec(),
            std_err: Vec::new(),
            return_code: 0,
        }
    }

    #[test]
    fn roundtrip() {
        let entry = sample_entry();
        let decoded = CacheEntry::deserialize(&entry.serialize()).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn roundtrip_empty_entry() {
        let entry = CacheEntry::default();
        let decoded = CacheEntry::deserialize(&entry.serialize()).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_entry().serialize();
        bytes[0] ^= 0xff;
        assert!(matches!(
            CacheEntry::deserialize(&bytes),
            Err(CacheError::Codec("bad magic"))
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = sample_entry().serialize();
        bytes[8] = 0xfe;
        bytes[9] = 0xff;
        assert!(matches!(
            CacheEntry::deserialize(&bytes),
            Err(CacheError::Codec("unsupported format version"))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = sample_entry().serialize();
        for len in [0, 4, 10, bytes.len() - 1] {
            assert!(
                CacheEntry::deserialize(&bytes[..len]).is_err(),
                "length {len} should fail to decode"
            );
        }
    }

    #[test]
    fn rejects_implausible_length_prefix() {
        let entry = CacheEntry {
            file_ids: vec!["object".to_string()],
            ..CacheEntry::default()
        };
        let mut bytes = entry.serialize();
        // Corrupt the file id length prefix (right after magic + version +
        // count) to claim far more data than the buffer holds.
        bytes[14] = 0xff;
        bytes[15] = 0xff;
        bytes[16] = 0xff;
        bytes[17] = 0x7f;
        assert!(CacheEntry::deserialize(&bytes).is_err());
    }

    #[test]
    fn nonzero_return_code_roundtrips() {
        let entry = CacheEntry {
            return_code: -42,
            ..sample_entry()
        };
        let decoded = CacheEntry::deserialize(&entry.serialize()).unwrap();
        assert_eq!(decoded.return_code, -42);
    }
}

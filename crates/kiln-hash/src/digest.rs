use crate::ar;
use crate::HashError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use xxhash_rust::xxh3::Xxh3;

/// A 128-bit content fingerprint.
///
/// Two invocations with the same `Digest` are assumed to produce identical
/// build outputs. Equality is bytewise; the canonical rendering is 32
/// lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 16]);

impl Digest {
    pub const SIZE: usize = 16;

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The lowercase hex rendering used for shard paths and remote keys.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Streaming accumulator producing a [`Digest`].
///
/// `finish` consumes the builder, so finalizing twice is a compile error
/// rather than a runtime one.
pub struct DigestBuilder {
    state: Xxh3,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self { state: Xxh3::new() }
    }

    /// Append raw bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    /// Append a UTF-8 text value.
    pub fn update_str(&mut self, text: &str) {
        self.state.update(text.as_bytes());
    }

    /// Append an ordered string map.
    ///
    /// Each key and value is terminated by a NUL byte so that shifting bytes
    /// between a key and the following value cannot produce the same stream
    /// (`{"a":"b","c":""}` vs `{"a":"bc","":""}`).
    pub fn update_map(&mut self, data: &BTreeMap<String, String>) {
        for (key, value) in data {
            self.state.update(key.as_bytes());
            self.state.update(&[0u8]);
            self.state.update(value.as_bytes());
            self.state.update(&[0u8]);
        }
    }

    /// Stream a file's bytes into the hash.
    pub fn update_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), HashError> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            self.state.update(&buf[..n]);
        }
    }

    /// Stream a file's bytes, excluding volatile metadata for known formats.
    ///
    /// Files in the Unix `ar` family (static archives) embed per-member
    /// modification times, owner ids and modes that change without affecting
    /// the archive's contents; those fields are skipped so rebuilt archives
    /// hash identically. Every other format is hashed raw.
    pub fn update_from_file_deterministic(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<(), HashError> {
        let data = std::fs::read(path)?;
        if ar::is_ar_archive(&data) {
            ar::update_from_ar_data(self, &data)
        } else {
            self.update(&data);
            Ok(())
        }
    }

    /// Finalize the hash calculation.
    pub fn finish(self) -> Digest {
        Digest(self.state.digest128().to_le_bytes())
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(parts: &[&[u8]]) -> Digest {
        let mut builder = DigestBuilder::new();
        for part in parts {
            builder.update(part);
        }
        builder.finish()
    }

    #[test]
    fn deterministic() {
        assert_eq!(digest_of(&[b"hello world"]), digest_of(&[b"hello world"]));
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(digest_of(&[b"hello"]), digest_of(&[b"world"]));
    }

    #[test]
    fn streaming_matches_one_shot() {
        assert_eq!(digest_of(&[b"hello ", b"world"]), digest_of(&[b"hello world"]));
    }

    #[test]
    fn empty_input_hashes_consistently() {
        assert_eq!(digest_of(&[]), digest_of(&[]));
        assert_eq!(digest_of(&[]), DigestBuilder::new().finish());
    }

    #[test]
    fn display_is_32_lowercase_hex_digits() {
        let s = digest_of(&[b"test"]).to_string();
        assert_eq!(s.len(), 32);
        assert!(s
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn map_keys_and_values_cannot_shift() {
        let mut a = BTreeMap::new();
        a.insert("a".to_string(), "b".to_string());
        a.insert("c".to_string(), String::new());

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), "bc".to_string());
        b.insert(String::new(), String::new());

        let mut ha = DigestBuilder::new();
        ha.update_map(&a);
        let mut hb = DigestBuilder::new();
        hb.update_map(&b);
        assert_ne!(ha.finish(), hb.finish());
    }

    #[test]
    fn empty_map_adds_nothing() {
        let mut with_map = DigestBuilder::new();
        with_map.update(b"x");
        with_map.update_map(&BTreeMap::new());
        let mut without = DigestBuilder::new();
        without.update(b"x");
        assert_eq!(with_map.finish(), without.finish());
    }

    #[test]
    fn file_hash_matches_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        std::fs::write(&path, b"some file contents").unwrap();

        let mut from_file = DigestBuilder::new();
        from_file.update_from_file(&path).unwrap();
        assert_eq!(from_file.finish(), digest_of(&[b"some file contents"]));
    }

    #[test]
    fn serde_roundtrip() {
        let digest = digest_of(&[b"serde"]);
        let json = serde_json::to_string(&digest).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, back);
    }
}

use std::{
    fmt,
    io::{self, Read},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const DIGEST_HEX_LEN: usize = 64;
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Lowercase hex SHA-256 of an artifact's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("digest must be {} hex characters, got '{}'", DIGEST_HEX_LEN, .0)]
pub struct DigestParseError(pub String);

impl ContentDigest {
    pub fn parse(raw: &str) -> Result<Self, DigestParseError> {
        let raw = raw.trim();
        if raw.len() != DIGEST_HEX_LEN || !raw.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(DigestParseError(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = DigestParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentDigest> for String {
    fn from(value: ContentDigest) -> Self {
        value.0
    }
}

pub fn digest_bytes(bytes: &[u8]) -> ContentDigest {
    ContentDigest(hex::encode(Sha256::digest(bytes)))
}

/// Streams `reader` to EOF; used for on-demand integrity checks of stored files.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<ContentDigest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..read]);
    }
    Ok(ContentDigest(hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_sha256() {
        assert_eq!(
            digest_bytes(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn streaming_digest_equals_buffered_digest() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let streamed = digest_reader(payload.as_slice()).unwrap();
        assert_eq!(streamed, digest_bytes(&payload));
    }

    #[test]
    fn parse_normalizes_case_and_rejects_garbage() {
        let upper = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";
        assert_eq!(ContentDigest::parse(upper).unwrap(), digest_bytes(b"abc"));
        assert!(ContentDigest::parse("abc").is_err());
        assert!(ContentDigest::parse(&"g".repeat(64)).is_err());
    }
}

//! Subresource-integrity style digests (`sha512-<base64>`, `sha256-<hex>`).

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("malformed integrity string {value:?}: {reason}")]
    Malformed { value: String, reason: String },

    #[error("unsupported integrity algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Hash algorithms accepted in integrity strings, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            Algorithm::Sha1 => 20,
            Algorithm::Sha256 => 32,
            Algorithm::Sha512 => 64,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Algorithm::Sha1),
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(IntegrityError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// An expected digest.
///
/// Accepts hex (crates.io, PyPI, legacy npm shasum) and standard base64
/// (npm SRI) digests. A space-separated SRI list resolves to its strongest
/// supported entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integrity {
    algorithm: Algorithm,
    digest: Vec<u8>,
}

impl Integrity {
    pub fn parse(value: &str) -> Result<Self, IntegrityError> {
        let mut best: Option<Integrity> = None;
        let mut first_err = None;

        for entry in value.split_whitespace() {
            match Self::parse_one(entry) {
                Ok(parsed) => {
                    if best.as_ref().is_none_or(|b| parsed.algorithm > b.algorithm) {
                        best = Some(parsed);
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        best.ok_or_else(|| {
            first_err.unwrap_or_else(|| IntegrityError::Malformed {
                value: value.to_string(),
                reason: "empty".into(),
            })
        })
    }

    fn parse_one(entry: &str) -> Result<Self, IntegrityError> {
        let malformed = |reason: &str| IntegrityError::Malformed {
            value: entry.to_string(),
            reason: reason.to_string(),
        };

        let (algorithm, digest) = entry
            .split_once('-')
            .ok_or_else(|| malformed("expected <algorithm>-<digest>"))?;
        let algorithm: Algorithm = algorithm.parse()?;

        // SRI options follow a `?`.
        let digest = digest.split('?').next().unwrap_or(digest);
        let expected_len = algorithm.digest_len();

        let bytes = if digest.len() == expected_len * 2
            && digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            hex::decode(digest).map_err(|_| malformed("invalid hex digest"))?
        } else {
            STANDARD
                .decode(digest)
                .map_err(|_| malformed("digest is neither hex nor base64"))?
        };

        if bytes.len() != expected_len {
            return Err(malformed("digest has the wrong length"));
        }

        Ok(Self {
            algorithm,
            digest: bytes,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Start an incremental check against this digest.
    pub fn verifier(&self) -> Verifier {
        Verifier {
            expected: self.clone(),
            hasher: Hasher::new(self.algorithm),
            bytes: 0,
        }
    }

    /// Check a complete buffer.
    pub fn verify(&self, data: &[u8]) -> Result<(), IntegrityError> {
        let mut verifier = self.verifier();
        verifier.update(data);
        verifier.finish().map(|_| ())
    }
}

impl FromStr for Integrity {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Canonical SRI form: `<algorithm>-<base64>`.
impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm, STANDARD.encode(&self.digest))
    }
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Hashes a body chunk by chunk as it streams past.
pub struct Verifier {
    expected: Integrity,
    hasher: Hasher,
    bytes: u64,
}

impl Verifier {
    pub fn update(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
        self.hasher.update(chunk);
    }

    /// Bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Compare the accumulated digest. Returns the computed integrity.
    pub fn finish(self) -> Result<Integrity, IntegrityError> {
        let actual = Integrity {
            algorithm: self.expected.algorithm,
            digest: self.hasher.finalize(),
        };
        if actual.digest != self.expected.digest {
            return Err(IntegrityError::Mismatch {
                expected: self.expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(actual)
    }
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("expected", &self.expected.to_string())
            .field("bytes", &self.bytes)
            .finish()
    }
}

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use crate::errors::{DigestError, Result};
use crate::hasher::IntegrityHasher;

/// Hash algorithms understood by the store.
///
/// Variants are declared weakest first, so `Ord` doubles as the preference
/// order: the maximum algorithm of a set is the strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
    #[default]
    Blake3,
}

impl Algorithm {
    /// All supported algorithms, strongest first.
    pub const PREFERENCE: [Algorithm; 4] = [
        Algorithm::Blake3,
        Algorithm::Sha512,
        Algorithm::Sha384,
        Algorithm::Sha256,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
            Algorithm::Blake3 => "blake3",
        }
    }

    /// Digest size in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 32,
            Algorithm::Sha384 => 48,
            Algorithm::Sha512 => 64,
            Algorithm::Blake3 => 32,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            "blake3" => Ok(Algorithm::Blake3),
            _ => Err(DigestError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl Serialize for Algorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Textual encoding of a digest inside an integrity string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Base64,
    Hex,
}

/// A single `(algorithm, digest)` pair.
///
/// Equality ignores the encoding the hash was parsed from, so a hex and a
/// base64 spelling of the same digest compare equal.
#[derive(Clone)]
pub struct Hash {
    algorithm: Algorithm,
    digest: Vec<u8>,
    encoding: Encoding,
}

impl Hash {
    /// Build a hash from raw digest bytes, checking the length.
    pub fn new(algorithm: Algorithm, digest: Vec<u8>) -> Result<Self> {
        if digest.len() != algorithm.output_len() {
            return Err(DigestError::BadLength {
                algorithm,
                expected: algorithm.output_len(),
                actual: digest.len(),
            });
        }
        Ok(Self {
            algorithm,
            digest,
            encoding: Encoding::Base64,
        })
    }

    /// Parse a hex digest for the given algorithm.
    pub fn from_hex(algorithm: Algorithm, hex_digest: &str) -> Result<Self> {
        let digest = hex::decode(hex_digest)
            .map_err(|e| DigestError::Malformed(format!("{}: {}", hex_digest, e)))?;
        Ok(Self::new(algorithm, digest)?.with_encoding(Encoding::Hex))
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Lowercase hex of the digest bytes; used to derive on-disk paths.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    fn encoded(&self) -> String {
        match self.encoding {
            Encoding::Base64 => STANDARD.encode(&self.digest),
            Encoding::Hex => self.to_hex(),
        }
    }

    fn decode(algorithm: Algorithm, encoded: &str) -> Result<Self> {
        let expected = algorithm.output_len();

        if let Ok(bytes) = STANDARD.decode(encoded) {
            if bytes.len() == expected {
                return Ok(Self {
                    algorithm,
                    digest: bytes,
                    encoding: Encoding::Base64,
                });
            }
        }

        if encoded.len() == expected * 2 {
            if let Ok(bytes) = hex::decode(encoded) {
                return Ok(Self {
                    algorithm,
                    digest: bytes,
                    encoding: Encoding::Hex,
                });
            }
        }

        Err(DigestError::Malformed(format!(
            "{}-{}: not a {} byte base64 or hex digest",
            algorithm, encoded, expected
        )))
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.digest == other.digest
    }
}

impl Eq for Hash {}

impl std::hash::Hash for Hash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::hash::Hash::hash(&self.algorithm, state);
        std::hash::Hash::hash(&self.digest, state);
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Hash({}-{}...)", self.algorithm, &hex[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm, self.encoded())
    }
}

impl FromStr for Hash {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, encoded) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| DigestError::Malformed(s.to_string()))?;
        let algorithm: Algorithm = algorithm.parse()?;
        Self::decode(algorithm, encoded)
    }
}

/// One or more hashes of the same payload.
///
/// The hash list is kept in the order it was built or parsed. A parsed
/// integrity also remembers the separator text around each hash, so the
/// string form round-trips unchanged. Equality only looks at the hashes.
#[derive(Clone)]
pub struct Integrity {
    hashes: Vec<Hash>,
    /// `hashes.len() + 1` runs of separator text: before, between, after.
    /// Empty for built integrities, which join with a single space.
    separators: Vec<String>,
}

impl PartialEq for Integrity {
    fn eq(&self, other: &Self) -> bool {
        self.hashes == other.hashes
    }
}

impl Eq for Integrity {}

impl std::hash::Hash for Integrity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::hash::Hash::hash(&self.hashes, state);
    }
}

impl Integrity {
    pub fn from_hash(hash: Hash) -> Self {
        Self {
            hashes: vec![hash],
            separators: Vec::new(),
        }
    }

    pub fn from_hashes(hashes: Vec<Hash>) -> Result<Self> {
        if hashes.is_empty() {
            return Err(DigestError::Empty);
        }
        Ok(Self {
            hashes,
            separators: Vec::new(),
        })
    }

    /// Hash `data` with every algorithm in `algorithms`.
    pub fn from_data(algorithms: &[Algorithm], data: &[u8]) -> Self {
        let mut hasher = IntegrityHasher::new(algorithms);
        hasher.update(data);
        hasher.finish()
    }

    pub fn hashes(&self) -> &[Hash] {
        &self.hashes
    }

    /// The hash used for addressing: the strongest algorithm present.
    /// Ties keep the first hash in list order.
    pub fn strongest(&self) -> &Hash {
        let mut best = &self.hashes[0];
        for hash in &self.hashes[1..] {
            if hash.algorithm > best.algorithm {
                best = hash;
            }
        }
        best
    }

    pub fn pick_algorithm(&self) -> Algorithm {
        self.strongest().algorithm
    }

    /// Hashes ordered strongest first; ties keep list order.
    pub fn by_preference(&self) -> Vec<&Hash> {
        let mut sorted: Vec<&Hash> = self.hashes.iter().collect();
        sorted.sort_by_key(|h| Reverse(h.algorithm));
        sorted
    }

    pub fn algorithms(&self) -> Vec<Algorithm> {
        let mut algorithms = Vec::new();
        for hash in &self.hashes {
            if !algorithms.contains(&hash.algorithm) {
                algorithms.push(hash.algorithm);
            }
        }
        algorithms
    }

    pub fn hash_for(&self, algorithm: Algorithm) -> Option<&Hash> {
        self.hashes.iter().find(|h| h.algorithm == algorithm)
    }

    /// Compare against `other` at the strongest algorithm both carry.
    ///
    /// Returns the algorithm that matched, or `None` when there is no common
    /// algorithm or the digests differ.
    pub fn matches(&self, other: &Integrity) -> Option<Algorithm> {
        let common = self
            .hashes
            .iter()
            .map(|h| h.algorithm)
            .filter(|a| other.hash_for(*a).is_some())
            .max()?;

        let matched = self
            .hashes
            .iter()
            .filter(|h| h.algorithm == common)
            .any(|h| other.hashes.iter().any(|t| t == h));
        if matched {
            Some(common)
        } else {
            None
        }
    }

    /// Recompute the strongest hash over `data` and compare.
    pub fn check(&self, data: &[u8]) -> Option<Algorithm> {
        let expected = self.strongest();
        let actual = Integrity::from_data(&[expected.algorithm], data);
        if actual.strongest() == expected {
            Some(expected.algorithm)
        } else {
            None
        }
    }

    /// Merge another integrity into this one, skipping hashes already present.
    ///
    /// The result uses the canonical single-space form.
    pub fn concat(mut self, other: &Integrity) -> Self {
        for hash in &other.hashes {
            if !self.hashes.contains(hash) {
                self.hashes.push(hash.clone());
            }
        }
        self.separators.clear();
        self
    }
}

impl From<Hash> for Integrity {
    fn from(hash: Hash) -> Self {
        Self::from_hash(hash)
    }
}

impl fmt::Debug for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Integrity({})", self)
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.separators.len() == self.hashes.len() + 1 {
            f.write_str(&self.separators[0])?;
            for (hash, after) in self.hashes.iter().zip(&self.separators[1..]) {
                write!(f, "{}{}", hash, after)?;
            }
            return Ok(());
        }

        for (i, hash) in self.hashes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", hash)?;
        }
        Ok(())
    }
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ','
}

impl FromStr for Integrity {
    type Err = DigestError;

    /// Accepts hashes separated by any mix of whitespace and commas.
    fn from_str(s: &str) -> Result<Self> {
        let mut hashes = Vec::new();
        let mut separators = Vec::new();
        let mut rest = s;

        loop {
            let token_start = rest.find(|c: char| !is_separator(c)).unwrap_or(rest.len());
            separators.push(rest[..token_start].to_string());
            rest = &rest[token_start..];
            if rest.is_empty() {
                break;
            }

            let token_end = rest.find(is_separator).unwrap_or(rest.len());
            hashes.push(rest[..token_end].parse::<Hash>()?);
            rest = &rest[token_end..];
        }

        let mut integrity = Self::from_hashes(hashes)?;
        integrity.separators = separators;
        Ok(integrity)
    }
}

impl Serialize for Integrity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Integrity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//! Known hash algorithms and their fixed digest lengths.
//!
//! The length table is shared by the packed hash codec (which needs the
//! length to split a message body) and by the hash workers.

use std::fmt;

/// Which worker computes an algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    /// Cryptographic digest over the raw source bytes
    Digest,
    /// Similarity hash over the normalized analysis image
    Perceptual,
}

/// A supported hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Blake3,
    /// 64-bit DCT perceptual hash
    PHash,
    /// 64-bit gradient (difference) hash
    DHash,
}

impl Algorithm {
    pub const ALL: [Algorithm; 7] = [
        Algorithm::Sha224,
        Algorithm::Sha256,
        Algorithm::Sha384,
        Algorithm::Sha512,
        Algorithm::Blake3,
        Algorithm::PHash,
        Algorithm::DHash,
    ];

    /// Canonical name, used as the key in `ImageRecord::hashes` and on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha224 => "SHA-224",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha384 => "SHA-384",
            Algorithm::Sha512 => "SHA-512",
            Algorithm::Blake3 => "BLAKE3",
            Algorithm::PHash => "phash",
            Algorithm::DHash => "dhash",
        }
    }

    /// Look up an algorithm by name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Fixed digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            Algorithm::Sha224 => 28,
            Algorithm::Sha256 | Algorithm::Blake3 => 32,
            Algorithm::Sha384 => 48,
            Algorithm::Sha512 => 64,
            Algorithm::PHash | Algorithm::DHash => 8,
        }
    }

    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Algorithm::PHash | Algorithm::DHash => AlgorithmKind::Perceptual,
            _ => AlgorithmKind::Digest,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Expected digest length for an algorithm name, if the name is known.
pub fn expected_length(name: &str) -> Option<usize> {
    Algorithm::from_name(name).map(|alg| alg.digest_len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for alg in Algorithm::ALL {
            assert_eq!(Algorithm::from_name(alg.name()), Some(alg));
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(Algorithm::from_name("sha-256"), Some(Algorithm::Sha256));
        assert_eq!(Algorithm::from_name("PHASH"), Some(Algorithm::PHash));
        assert_eq!(Algorithm::from_name("md5"), None);
    }

    #[test]
    fn test_expected_lengths() {
        assert_eq!(expected_length("SHA-256"), Some(32));
        assert_eq!(expected_length("SHA-512"), Some(64));
        assert_eq!(expected_length("phash"), Some(8));
        assert_eq!(expected_length("CRC32"), None);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Algorithm::Blake3.kind(), AlgorithmKind::Digest);
        assert_eq!(Algorithm::DHash.kind(), AlgorithmKind::Perceptual);
    }
}

//! Content digests and perceptual hashes.
//!
//! Digests run over the raw source bytes. Perceptual hashes run over the
//! grayscale analysis image and are compared by Hamming distance.

use image::imageops::FilterType;
use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::algorithm::Algorithm;

/// Side of the reduced image the DCT runs over.
const DCT_INPUT: usize = 32;
/// Side of the low-frequency block kept from the DCT.
const DCT_KEEP: usize = 8;

/// Computes every supported algorithm.
///
/// The gradient hasher is pre-configured and cached to avoid re-allocating
/// the same `HasherConfig` for every image.
pub struct Hasher {
    dhash_hasher: image_hasher::Hasher,
    cosines: [[f64; DCT_INPUT]; DCT_KEEP],
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    pub fn new() -> Self {
        let dhash_hasher = HasherConfig::new()
            .hash_alg(HashAlg::Gradient)
            .hash_size(8, 8)
            .to_hasher();

        let mut cosines = [[0.0; DCT_INPUT]; DCT_KEEP];
        for (k, row) in cosines.iter_mut().enumerate() {
            for (n, value) in row.iter_mut().enumerate() {
                *value = (std::f64::consts::PI * (2 * n + 1) as f64 * k as f64
                    / (2 * DCT_INPUT) as f64)
                    .cos();
            }
        }
        Self {
            dhash_hasher,
            cosines,
        }
    }

    /// Message digest of raw bytes. `None` for perceptual algorithms.
    pub fn digest(algorithm: Algorithm, data: &[u8]) -> Option<Vec<u8>> {
        let digest = match algorithm {
            Algorithm::Sha224 => Sha224::digest(data).to_vec(),
            Algorithm::Sha256 => Sha256::digest(data).to_vec(),
            Algorithm::Sha384 => Sha384::digest(data).to_vec(),
            Algorithm::Sha512 => Sha512::digest(data).to_vec(),
            Algorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
            Algorithm::PHash | Algorithm::DHash => return None,
        };
        Some(digest)
    }

    /// Perceptual hash of a decoded image. `None` for digest algorithms.
    pub fn perceptual(&self, algorithm: Algorithm, image: &DynamicImage) -> Option<Vec<u8>> {
        match algorithm {
            Algorithm::PHash => Some(self.phash(image).to_be_bytes().to_vec()),
            Algorithm::DHash => Some(self.dhash(image)),
            _ => None,
        }
    }

    /// DCT hash: 32x32 grayscale, 2D DCT-II, top-left 8x8 block, one bit per
    /// coefficient against the block mean (DC excluded), row-major.
    pub fn phash(&self, image: &DynamicImage) -> u64 {
        let reduced = image
            .resize_exact(DCT_INPUT as u32, DCT_INPUT as u32, FilterType::Triangle)
            .to_luma8();
        let pixels: Vec<f64> = reduced.pixels().map(|p| f64::from(p.0[0])).collect();

        // Separable transform: rows first, then the kept columns.
        let mut rows = [[0.0f64; DCT_KEEP]; DCT_INPUT];
        for (y, row) in rows.iter_mut().enumerate() {
            let line = &pixels[y * DCT_INPUT..(y + 1) * DCT_INPUT];
            for (v, out) in row.iter_mut().enumerate() {
                *out = scale(v) * dot(line, &self.cosines[v]);
            }
        }
        let mut block = [[0.0f64; DCT_KEEP]; DCT_KEEP];
        for (u, block_row) in block.iter_mut().enumerate() {
            for (v, out) in block_row.iter_mut().enumerate() {
                let column: f64 = (0..DCT_INPUT)
                    .map(|y| rows[y][v] * self.cosines[u][y])
                    .sum();
                *out = scale(u) * column;
            }
        }

        let total: f64 = block.iter().flatten().sum();
        let mean = (total - block[0][0]) / (DCT_KEEP * DCT_KEEP - 1) as f64;

        let mut hash = 0u64;
        for coefficient in block.iter().flatten() {
            hash = hash.rotate_left(1);
            if *coefficient > mean {
                hash |= 1;
            }
        }
        hash
    }

    /// Gradient hash, 64 bits.
    pub fn dhash(&self, image: &DynamicImage) -> Vec<u8> {
        self.dhash_hasher.hash_image(image).as_bytes().to_vec()
    }

    /// Number of differing bits. `None` when the lengths differ.
    pub fn hamming(a: &[u8], b: &[u8]) -> Option<u32> {
        if a.len() != b.len() {
            return None;
        }
        Some(a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum())
    }
}

/// Orthonormal DCT-II scale factor.
fn scale(k: usize) -> f64 {
    if k == 0 {
        (1.0 / DCT_INPUT as f64).sqrt()
    } else {
        (2.0 / DCT_INPUT as f64).sqrt()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn to_hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn gradient_image() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |x, y| {
            Luma([((x * 3 + y * 2) % 256) as u8])
        }))
    }

    #[test]
    fn test_digest_lengths_match_table() {
        for algorithm in Algorithm::ALL {
            if let Some(digest) = Hasher::digest(algorithm, b"abc") {
                assert_eq!(digest.len(), algorithm.digest_len(), "{algorithm}");
            }
        }
    }

    #[test]
    fn test_known_sha256() {
        let digest = Hasher::digest(Algorithm::Sha256, b"abc").unwrap();
        assert_eq!(
            to_hex(&digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_perceptual_algorithms_have_no_digest() {
        assert!(Hasher::digest(Algorithm::PHash, b"abc").is_none());
        let hasher = Hasher::new();
        assert!(hasher
            .perceptual(Algorithm::Sha256, &gradient_image())
            .is_none());
    }

    #[test]
    fn test_phash_is_deterministic() {
        let hasher = Hasher::new();
        let image = gradient_image();
        assert_eq!(hasher.phash(&image), hasher.phash(&image));
        let bytes = hasher.perceptual(Algorithm::PHash, &image).unwrap();
        assert_eq!(bytes, hasher.phash(&image).to_be_bytes().to_vec());
    }

    #[test]
    fn test_phash_dc_bit_comes_first() {
        // The DC term dwarfs the AC mean; it is the first bit in, so the highest out.
        let hasher = Hasher::new();
        let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(50, 50, Luma([128])));
        assert_eq!(hasher.phash(&flat) >> 63, 1);
    }

    #[test]
    fn test_phash_separates_different_images() {
        let pattern = |x: u32, y: u32| {
            let (x, y) = (f64::from(x), f64::from(y));
            let value = 128.0 + 90.0 * (x / 6.0).sin() * (y / 9.0).cos()
                + 30.0 * ((x + 2.0 * y) / 5.0).sin();
            Luma([value.clamp(0.0, 255.0) as u8])
        };
        let hasher = Hasher::new();
        let a = hasher.phash(&DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, pattern)));
        let transposed = GrayImage::from_fn(64, 64, |x, y| pattern(y, x));
        let b = hasher.phash(&DynamicImage::ImageLuma8(transposed));
        assert!((a ^ b).count_ones() > 10);
    }

    #[test]
    fn test_dhash_length() {
        let hasher = Hasher::new();
        let hash = hasher.dhash(&gradient_image());
        assert_eq!(hash.len(), Algorithm::DHash.digest_len());
    }

    #[test]
    fn test_hamming() {
        assert_eq!(Hasher::hamming(&[0b1010], &[0b0101]), Some(4));
        assert_eq!(Hasher::hamming(&[1, 2], &[1, 2]), Some(0));
        assert_eq!(Hasher::hamming(&[1], &[1, 2]), None);
    }
}

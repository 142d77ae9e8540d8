//! Compact 16-byte identifier encoding (most significant 64 bits first).

use uuid::Uuid;

use crate::error::CodecError;

/// Encode a 128-bit identifier as 16 bytes, high 64 bits first.
pub fn encode_id(id: Uuid) -> [u8; 16] {
    let value = id.as_u128();
    let high = (value >> 64) as u64;
    let low = value as u64;

    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&high.to_be_bytes());
    out[8..].copy_from_slice(&low.to_be_bytes());
    out
}

/// Inverse of [`encode_id`].
pub fn decode_id(bytes: &[u8]) -> Result<Uuid, CodecError> {
    let bytes: &[u8; 16] = bytes
        .try_into()
        .map_err(|_| CodecError::InvalidIdentifier(bytes.len()))?;

    let mut high = [0u8; 8];
    let mut low = [0u8; 8];
    high.copy_from_slice(&bytes[..8]);
    low.copy_from_slice(&bytes[8..]);

    let value = (u128::from(u64::from_be_bytes(high)) << 64) | u128::from(u64::from_be_bytes(low));
    Ok(Uuid::from_u128(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_random() {
        let id = Uuid::new_v4();
        assert_eq!(decode_id(&encode_id(id)).unwrap(), id);
    }

    #[test]
    fn test_round_trip_boundaries() {
        for id in [Uuid::nil(), Uuid::from_u128(u128::MAX)] {
            assert_eq!(decode_id(&encode_id(id)).unwrap(), id);
        }
        assert_eq!(encode_id(Uuid::nil()), [0u8; 16]);
        assert_eq!(encode_id(Uuid::from_u128(u128::MAX)), [0xFF; 16]);
    }

    #[test]
    fn test_high_bits_come_first() {
        let id = Uuid::from_u128(0x0102030405060708_090A0B0C0D0E0F10);
        assert_eq!(
            encode_id(id),
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]
        );
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(matches!(
            decode_id(&[0u8; 15]),
            Err(CodecError::InvalidIdentifier(15))
        ));
    }
}

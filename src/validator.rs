//! Stateless proof checks.
use crate::error::ProofError;
use crate::hash::HashAlgorithm;

/// Count leading zero bits of a big-endian hash.
pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut count = 0u32;
    for byte in hash {
        if *byte == 0 {
            count += 8;
            continue;
        }
        count += (*byte).leading_zeros();
        break;
    }
    count
}

pub fn meets_difficulty(hash: &[u8], bits: u32) -> bool {
    leading_zero_bits(hash) >= bits
}

/// Threshold of `len` bytes whose first `bits` bits are zero and the rest one.
///
/// A hash of the same length satisfies `bits` iff it compares `<=` to the
/// template lexicographically.
pub fn target_template(bits: u32, len: usize) -> Vec<u8> {
    let mut target = vec![0xffu8; len];
    let full_bytes = (bits / 8) as usize;
    for byte in target.iter_mut().take(full_bytes) {
        *byte = 0;
    }
    let rem = bits % 8;
    if rem != 0 && full_bytes < len {
        target[full_bytes] = 0xff >> rem;
    }
    target
}

/// Recompute the hash of `(data, nonce)` and check it against the claim and `difficulty`.
pub fn verify(
    algorithm: &HashAlgorithm,
    data: &[u8],
    nonce: u64,
    claimed_hash: &[u8],
    difficulty: u32,
) -> Result<(), ProofError> {
    let hash = algorithm
        .calculate(data, nonce)
        .map_err(|e| ProofError::Hash(e.to_string()))?;
    if hash != claimed_hash {
        return Err(ProofError::HashMismatch);
    }
    let actual = leading_zero_bits(&hash);
    if actual < difficulty {
        return Err(ProofError::InsufficientDifficulty {
            actual,
            required: difficulty,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_nonce(data: &[u8], pred: impl Fn(u32) -> bool) -> (u64, Vec<u8>) {
        (0u64..)
            .map(|n| (n, HashAlgorithm::calculate_sha2_256(data, n)))
            .find(|(_, h)| pred(leading_zero_bits(h)))
            .unwrap()
    }

    #[test]
    fn counts_bits_across_bytes() {
        assert_eq!(leading_zero_bits(&[0xff]), 0);
        assert_eq!(leading_zero_bits(&[0x0f, 0x00]), 4);
        assert_eq!(leading_zero_bits(&[0x00, 0x01]), 15);
        assert_eq!(leading_zero_bits(&[0x00, 0x00]), 16);
        assert_eq!(leading_zero_bits(&[]), 0);
    }

    #[test]
    fn template_agrees_with_bit_count() {
        assert_eq!(target_template(0, 2), vec![0xff, 0xff]);
        assert_eq!(target_template(12, 3), vec![0x00, 0x0f, 0xff]);
        assert_eq!(target_template(16, 2), vec![0x00, 0x00]);

        let template = target_template(10, 4);
        for hash in [[0x00, 0x3f, 0xff, 0xff], [0x00, 0x40, 0x00, 0x00]] {
            assert_eq!(hash.as_slice() <= template.as_slice(), meets_difficulty(&hash, 10));
        }
    }

    #[test]
    fn accepts_valid_proof() {
        let (nonce, hash) = find_nonce(b"abc", |bits| bits >= 8);
        verify(&HashAlgorithm::Sha2_256, b"abc", nonce, &hash, 8).expect("valid proof");
    }

    #[test]
    fn rejects_weak_hash_even_when_claim_matches() {
        let (nonce, hash) = find_nonce(b"abc", |bits| (4..8).contains(&bits));
        let err = verify(&HashAlgorithm::Sha2_256, b"abc", nonce, &hash, 8).unwrap_err();
        assert!(matches!(
            err,
            ProofError::InsufficientDifficulty { required: 8, .. }
        ));
    }

    #[test]
    fn rejects_claim_for_other_nonce() {
        let (nonce, hash) = find_nonce(b"abc", |bits| bits >= 8);
        let err = verify(&HashAlgorithm::Sha2_256, b"abc", nonce + 1, &hash, 8).unwrap_err();
        assert_eq!(err, ProofError::HashMismatch);
    }
}

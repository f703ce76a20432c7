//! Hash primitives used to compute and check proofs.
//!
//! Every algorithm is a pure function of `(data, nonce)`. Digest algorithms
//! hash `data || nonce.to_le_bytes()`; the KDF algorithms use `data` as the
//! password and the nonce bytes as the salt.
use argon2::{Algorithm, Argon2, Version};
use ripemd::Ripemd320;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::Error;

pub use argon2::Params as Argon2Params;
pub use scrypt::Params as ScryptParams;

const KDF_OUTPUT_LEN: usize = 32;

/// Hash algorithm a pool validates proofs with.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha2_256,
    Sha2_512,
    Blake3,
    Ripemd320,
    Scrypt(ScryptParams),
    Argon2id(Argon2Params),
}

impl HashAlgorithm {
    pub fn calculate_sha2_256(data: &[u8], nonce: u64) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.update(nonce.to_le_bytes());
        hasher.finalize().to_vec()
    }

    pub fn calculate_sha2_512(data: &[u8], nonce: u64) -> Vec<u8> {
        let mut hasher = Sha512::new();
        hasher.update(data);
        hasher.update(nonce.to_le_bytes());
        hasher.finalize().to_vec()
    }

    pub fn calculate_blake3(data: &[u8], nonce: u64) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        hasher.update(&nonce.to_le_bytes());
        hasher.finalize().as_bytes().to_vec()
    }

    pub fn calculate_ripemd_320(data: &[u8], nonce: u64) -> Vec<u8> {
        let mut hasher = Ripemd320::new();
        hasher.update(data);
        hasher.update(nonce.to_le_bytes());
        hasher.finalize().to_vec()
    }

    pub fn calculate_scrypt(
        data: &[u8],
        nonce: u64,
        params: &ScryptParams,
    ) -> Result<Vec<u8>, Error> {
        let mut output = vec![0; KDF_OUTPUT_LEN];
        scrypt::scrypt(data, &nonce.to_le_bytes(), params, &mut output)
            .map_err(|e| Error::Hash(e.to_string()))?;
        Ok(output)
    }

    pub fn calculate_argon2id(
        data: &[u8],
        nonce: u64,
        params: &Argon2Params,
    ) -> Result<Vec<u8>, Error> {
        let mut output = vec![0; KDF_OUTPUT_LEN];
        let a2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone());
        a2.hash_password_into(data, &nonce.to_le_bytes(), &mut output)
            .map_err(|e| Error::Hash(e.to_string()))?;
        Ok(output)
    }

    /// Hash `data` with `nonce` using the selected algorithm.
    pub fn calculate(&self, data: &[u8], nonce: u64) -> Result<Vec<u8>, Error> {
        match self {
            Self::Sha2_256 => Ok(Self::calculate_sha2_256(data, nonce)),
            Self::Sha2_512 => Ok(Self::calculate_sha2_512(data, nonce)),
            Self::Blake3 => Ok(Self::calculate_blake3(data, nonce)),
            Self::Ripemd320 => Ok(Self::calculate_ripemd_320(data, nonce)),
            Self::Scrypt(params) => Self::calculate_scrypt(data, nonce, params),
            Self::Argon2id(params) => Self::calculate_argon2id(data, nonce, params),
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Self::Sha2_256 | Self::Blake3 => 32,
            Self::Sha2_512 => 64,
            Self::Ripemd320 => 40,
            Self::Scrypt(_) | Self::Argon2id(_) => KDF_OUTPUT_LEN,
        }
    }

    /// Upper bound on any difficulty this algorithm can satisfy.
    pub fn output_bits(&self) -> u32 {
        (self.output_len() * 8) as u32
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha2_256 => "sha2_256",
            Self::Sha2_512 => "sha2_512",
            Self::Blake3 => "blake3",
            Self::Ripemd320 => "ripemd320",
            Self::Scrypt(_) => "scrypt",
            Self::Argon2id(_) => "argon2id",
        }
    }
}

// KDF params are expanded by hand; neither params type implements serde.
#[allow(non_camel_case_types)]
#[derive(Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
enum AlgorithmRepr {
    #[serde(rename = "sha2_256")]
    Sha2_256,
    #[serde(rename = "sha2_512")]
    Sha2_512,
    Blake3,
    Ripemd320,
    Scrypt { log_n: u8, r: u32, p: u32 },
    Argon2id { m_kib: u32, t_cost: u32, p_cost: u32 },
}

impl Serialize for HashAlgorithm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let repr = match self {
            Self::Sha2_256 => AlgorithmRepr::Sha2_256,
            Self::Sha2_512 => AlgorithmRepr::Sha2_512,
            Self::Blake3 => AlgorithmRepr::Blake3,
            Self::Ripemd320 => AlgorithmRepr::Ripemd320,
            Self::Scrypt(params) => AlgorithmRepr::Scrypt {
                log_n: params.log_n(),
                r: params.r(),
                p: params.p(),
            },
            Self::Argon2id(params) => AlgorithmRepr::Argon2id {
                m_kib: params.m_cost(),
                t_cost: params.t_cost(),
                p_cost: params.p_cost(),
            },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HashAlgorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let algorithm = match AlgorithmRepr::deserialize(deserializer)? {
            AlgorithmRepr::Sha2_256 => Self::Sha2_256,
            AlgorithmRepr::Sha2_512 => Self::Sha2_512,
            AlgorithmRepr::Blake3 => Self::Blake3,
            AlgorithmRepr::Ripemd320 => Self::Ripemd320,
            AlgorithmRepr::Scrypt { log_n, r, p } => {
                let params = ScryptParams::new(log_n, r, p, KDF_OUTPUT_LEN)
                    .map_err(|e| serde::de::Error::custom(e.to_string()))?;
                Self::Scrypt(params)
            }
            AlgorithmRepr::Argon2id {
                m_kib,
                t_cost,
                p_cost,
            } => {
                let params = Argon2Params::new(m_kib, t_cost, p_cost, None)
                    .map_err(|e| serde::de::Error::custom(e.to_string()))?;
                Self::Argon2id(params)
            }
        };
        Ok(algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha2_256_known_vector() {
        let data = b"hello world";
        let nonce = 12345;
        let expected_hash = [
            113, 212, 92, 254, 42, 99, 0, 112, 60, 9, 31, 138, 105, 191, 234, 231, 122, 30, 73, 12,
            3, 10, 182, 230, 134, 80, 94, 32, 162, 164, 204, 9,
        ];
        let hash = HashAlgorithm::calculate_sha2_256(data, nonce);

        assert_eq!(hash, expected_hash);
    }

    #[test]
    fn test_argon2id_known_vector() {
        let data = b"hello world";
        let nonce = 12345;
        let params = Argon2Params::new(16, 2, 2, None).unwrap();
        let expected_hash = [
            243, 150, 29, 238, 126, 244, 47, 122, 69, 22, 69, 20, 102, 5, 218, 124, 251, 140, 204,
            53, 133, 2, 147, 207, 66, 17, 241, 177, 20, 249, 251, 155,
        ];

        let hash = HashAlgorithm::calculate_argon2id(data, nonce, &params).unwrap();

        assert_eq!(hash, expected_hash);
    }

    #[test]
    fn test_blake3_frames_nonce_after_data() {
        let mut framed = b"abc".to_vec();
        framed.extend_from_slice(&9u64.to_le_bytes());
        let direct = blake3::hash(&framed);

        let hash = HashAlgorithm::Blake3.calculate(b"abc", 9).unwrap();
        assert_eq!(hash, direct.as_bytes().to_vec());
    }

    #[test]
    fn test_output_len_matches_digest() {
        let params = ScryptParams::new(4, 2, 1, 32).unwrap();
        for algorithm in [
            HashAlgorithm::Sha2_256,
            HashAlgorithm::Sha2_512,
            HashAlgorithm::Blake3,
            HashAlgorithm::Ripemd320,
            HashAlgorithm::Scrypt(params),
        ] {
            let hash = algorithm.calculate(b"data", 1).unwrap();
            assert_eq!(hash.len(), algorithm.output_len(), "{}", algorithm.name());
        }
    }

    #[test]
    fn test_serde_expands_kdf_params() {
        let params = Argon2Params::new(16, 2, 2, None).unwrap();
        let json = serde_json::to_value(HashAlgorithm::Argon2id(params)).unwrap();
        assert_eq!(json["name"], "argon2id");
        assert_eq!(json["m_kib"], 16);

        let back: HashAlgorithm = serde_json::from_value(json).unwrap();
        match back {
            HashAlgorithm::Argon2id(p) => assert_eq!(p.t_cost(), 2),
            other => panic!("unexpected algorithm {other:?}"),
        }

        let sha: HashAlgorithm = serde_json::from_str(r#"{"name":"sha2_256"}"#).unwrap();
        assert!(matches!(sha, HashAlgorithm::Sha2_256));
    }
}

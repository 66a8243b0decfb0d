//! AES-CFB envelope for application payloads.
//!
//! Only the payload bytes inside a packet are enveloped; frame headers and
//! packet field prefixes travel in the clear. A fresh random 16-byte IV is
//! prepended to every ciphertext.

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use rand::RngCore;
use sha2::{Digest, Sha224, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const IV_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("ciphertext shorter than the {IV_LEN}-byte IV: {0} bytes")]
    CiphertextTooShort(usize),
    #[error("unknown secret algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// Supported payload encryption algorithms.
///
/// `None` (or an empty config value) disables both key hashing and
/// encryption; payloads pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretAlgorithm {
    #[default]
    None,
    Aes128,
    Aes192,
    Aes256,
}

impl SecretAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretAlgorithm::None => "NONE",
            SecretAlgorithm::Aes128 => "AES-128",
            SecretAlgorithm::Aes192 => "AES-192",
            SecretAlgorithm::Aes256 => "AES-256",
        }
    }
}

impl fmt::Display for SecretAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SecretAlgorithm {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "" | "NONE" => Ok(SecretAlgorithm::None),
            "AES-128" => Ok(SecretAlgorithm::Aes128),
            "AES-192" => Ok(SecretAlgorithm::Aes192),
            "AES-256" => Ok(SecretAlgorithm::Aes256),
            other => Err(EnvelopeError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Symmetric envelope derived from the pre-shared intranet secret.
///
/// The key is a per-algorithm hash of the raw secret: MD5 for AES-128,
/// SHA-224 truncated to 24 bytes for AES-192, SHA-256 for AES-256.
#[derive(Clone)]
pub struct Envelope {
    algorithm: SecretAlgorithm,
    key: Vec<u8>,
}

impl Envelope {
    pub fn new(algorithm: SecretAlgorithm, secret: &str) -> Self {
        let key = match algorithm {
            SecretAlgorithm::None => Vec::new(),
            SecretAlgorithm::Aes128 => md5::compute(secret.as_bytes()).0.to_vec(),
            SecretAlgorithm::Aes192 => Sha224::digest(secret.as_bytes())[..24].to_vec(),
            SecretAlgorithm::Aes256 => Sha256::digest(secret.as_bytes()).to_vec(),
        };
        Self { algorithm, key }
    }

    pub fn algorithm(&self) -> SecretAlgorithm {
        self.algorithm
    }

    /// Encrypt a payload, prepending a fresh IV. Pass-through when disabled.
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        if self.algorithm == SecretAlgorithm::None {
            return plain.to_vec();
        }

        let mut out = vec![0u8; IV_LEN + plain.len()];
        rand::thread_rng().fill_bytes(&mut out[..IV_LEN]);
        out[IV_LEN..].copy_from_slice(plain);

        let (iv, buf) = out.split_at_mut(IV_LEN);
        // Key and IV lengths are fixed by construction, so init cannot fail.
        match self.algorithm {
            SecretAlgorithm::None => unreachable!(),
            SecretAlgorithm::Aes128 => {
                if let Ok(enc) = Aes128CfbEnc::new_from_slices(&self.key, iv) {
                    enc.encrypt(buf);
                }
            }
            SecretAlgorithm::Aes192 => {
                if let Ok(enc) = Aes192CfbEnc::new_from_slices(&self.key, iv) {
                    enc.encrypt(buf);
                }
            }
            SecretAlgorithm::Aes256 => {
                if let Ok(enc) = Aes256CfbEnc::new_from_slices(&self.key, iv) {
                    enc.encrypt(buf);
                }
            }
        }
        out
    }

    /// Decrypt an IV-prefixed ciphertext. Pass-through when disabled.
    ///
    /// Anything shorter than the IV is a protocol fault.
    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        if self.algorithm == SecretAlgorithm::None {
            return Ok(cipher.to_vec());
        }
        if cipher.len() < IV_LEN {
            return Err(EnvelopeError::CiphertextTooShort(cipher.len()));
        }

        let (iv, data) = cipher.split_at(IV_LEN);
        let mut buf = data.to_vec();
        match self.algorithm {
            SecretAlgorithm::None => unreachable!(),
            SecretAlgorithm::Aes128 => {
                if let Ok(dec) = Aes128CfbDec::new_from_slices(&self.key, iv) {
                    dec.decrypt(&mut buf);
                }
            }
            SecretAlgorithm::Aes192 => {
                if let Ok(dec) = Aes192CfbDec::new_from_slices(&self.key, iv) {
                    dec.decrypt(&mut buf);
                }
            }
            SecretAlgorithm::Aes256 => {
                if let Ok(dec) = Aes256CfbDec::new_from_slices(&self.key, iv) {
                    dec.decrypt(&mut buf);
                }
            }
        }
        Ok(buf)
    }
}

type Aes128CfbEnc = Encryptor<Aes128>;
type Aes192CfbEnc = Encryptor<Aes192>;
type Aes256CfbEnc = Encryptor<Aes256>;
type Aes128CfbDec = Decryptor<Aes128>;
type Aes192CfbDec = Decryptor<Aes192>;
type Aes256CfbDec = Decryptor<Aes256>;

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("Envelope")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

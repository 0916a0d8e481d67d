// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! The key shared between the resource server and its AS, and the COSE_Encrypt0 operations done
//! with it

use aead::generic_array::typenum::{U13, U16, U8};
use aead::generic_array::{ArrayLength, GenericArray};
use aes::cipher::{Block, BlockCipher, BlockEncrypt};
use ccm::{NonceSize, TagSize};
use coset::{iana, Algorithm, CoseEncrypt0, CoseEncrypt0Builder, Header};
use dcaf::token::CoseCipherCommon;
use dcaf::CoseEncrypt0Cipher;
use thiserror::Error;

use crate::aesccm::RustCryptoCcmCoseCipher;

/// Nonce length of all AES-CCM-16-* algorithms
pub const CCM_NONCE_LEN: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(i64),
    #[error("key has {actual} bytes, algorithm needs {expected}")]
    KeyLength { expected: usize, actual: usize },
    #[error("algorithm in message does not match the configured one")]
    AlgorithmMismatch,
    #[error("IV missing or of wrong length")]
    BadIv,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("COSE header setup failed")]
    Header,
}

/// COSE algorithms usable between RS and AS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcmAlgorithm {
    AesCcm16_64_128,
    AesCcm16_128_128,
    AesCcm16_128_256,
}

impl CcmAlgorithm {
    pub fn from_label(label: i64) -> Result<Self, CryptoError> {
        Ok(match label {
            10 => CcmAlgorithm::AesCcm16_64_128,
            30 => CcmAlgorithm::AesCcm16_128_128,
            31 => CcmAlgorithm::AesCcm16_128_256,
            other => return Err(CryptoError::UnsupportedAlgorithm(other)),
        })
    }

    pub fn iana(self) -> iana::Algorithm {
        match self {
            CcmAlgorithm::AesCcm16_64_128 => iana::Algorithm::AES_CCM_16_64_128,
            CcmAlgorithm::AesCcm16_128_128 => iana::Algorithm::AES_CCM_16_128_128,
            CcmAlgorithm::AesCcm16_128_256 => iana::Algorithm::AES_CCM_16_128_256,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CcmAlgorithm::AesCcm16_128_256 => 32,
            _ => 16,
        }
    }
}

/// Key material and algorithm for tokens (and encrypted `cnf` keys) the AS protects for this RS
#[derive(Clone)]
pub struct CwtCryptoContext {
    key: Vec<u8>,
    alg: CcmAlgorithm,
}

impl core::fmt::Debug for CwtCryptoContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CwtCryptoContext")
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

fn cipher<C, M>(
    key: &[u8],
    iv: &[u8],
    alg: iana::Algorithm,
) -> RustCryptoCcmCoseCipher<C, M, U13>
where
    C: BlockCipher<BlockSize = U16> + BlockEncrypt + aead::KeyInit,
    C::BlockSize: ArrayLength<Block<C>>,
    M: ArrayLength<u8> + TagSize,
    U13: NonceSize,
{
    RustCryptoCcmCoseCipher::new(
        GenericArray::clone_from_slice(key),
        GenericArray::clone_from_slice(iv),
        alg,
    )
}

impl CwtCryptoContext {
    pub fn new(key: Vec<u8>, alg: CcmAlgorithm) -> Result<Self, CryptoError> {
        if key.len() != alg.key_len() {
            return Err(CryptoError::KeyLength {
                expected: alg.key_len(),
                actual: key.len(),
            });
        }
        Ok(Self { key, alg })
    }

    pub fn algorithm(&self) -> CcmAlgorithm {
        self.alg
    }

    fn with_cipher<R>(
        &self,
        iv: &[u8],
        f: impl FnOnce(&mut dyn CcmCipher) -> R,
    ) -> Result<R, CryptoError> {
        if iv.len() != CCM_NONCE_LEN {
            return Err(CryptoError::BadIv);
        }
        let alg = self.alg.iana();
        Ok(match self.alg {
            CcmAlgorithm::AesCcm16_64_128 => {
                f(&mut cipher::<aes::Aes128, U8>(&self.key, iv, alg))
            }
            CcmAlgorithm::AesCcm16_128_128 => {
                f(&mut cipher::<aes::Aes128, U16>(&self.key, iv, alg))
            }
            CcmAlgorithm::AesCcm16_128_256 => {
                f(&mut cipher::<aes::Aes256, U16>(&self.key, iv, alg))
            }
        })
    }

    /// Decrypt a COSE_Encrypt0 object
    ///
    /// The IV is taken from the unprotected header, or from the protected one if the sender put it
    /// there. An algorithm announced in the protected header must be the configured one.
    pub fn open(
        &self,
        envelope: &CoseEncrypt0,
        external_aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        match &envelope.protected.header.alg {
            None => (),
            Some(Algorithm::Assigned(a)) if *a == self.alg.iana() => (),
            Some(_) => return Err(CryptoError::AlgorithmMismatch),
        }
        let iv = if envelope.unprotected.iv.is_empty() {
            &envelope.protected.header.iv
        } else {
            &envelope.unprotected.iv
        };
        self.with_cipher(iv, |cipher| -> Result<Vec<u8>, CryptoError> {
            envelope.decrypt(external_aad, |ciphertext, aad| {
                cipher
                    .decrypt_dyn(ciphertext, aad)
                    .ok_or(CryptoError::DecryptionFailed)
            })
        })?
    }

    /// Encrypt into a COSE_Encrypt0 object
    pub fn seal(
        &self,
        plaintext: &[u8],
        external_aad: &[u8],
        iv: &[u8; CCM_NONCE_LEN],
    ) -> Result<CoseEncrypt0, CryptoError> {
        self.with_cipher(iv, |cipher| -> Result<CoseEncrypt0, CryptoError> {
            let mut unprotected = Header::default();
            let mut protected = Header::default();
            cipher.header_dyn(&mut unprotected, &mut protected)?;
            Ok(CoseEncrypt0Builder::new()
                .protected(protected)
                .unprotected(unprotected)
                .create_ciphertext(plaintext, external_aad, |plain, aad| {
                    cipher.encrypt_dyn(plain, aad)
                })
                .build())
        })?
    }
}

/// Object safe view of the differently typed CCM ciphers
trait CcmCipher {
    fn header_dyn(
        &self,
        unprotected: &mut Header,
        protected: &mut Header,
    ) -> Result<(), CryptoError>;
    fn encrypt_dyn(&mut self, plaintext: &[u8], aad: &[u8]) -> Vec<u8>;
    fn decrypt_dyn(&mut self, ciphertext: &[u8], aad: &[u8]) -> Option<Vec<u8>>;
}

impl<C, M> CcmCipher for RustCryptoCcmCoseCipher<C, M, U13>
where
    C: BlockCipher<BlockSize = U16> + BlockEncrypt + aead::KeyInit,
    C::BlockSize: ArrayLength<Block<C>>,
    M: ArrayLength<u8> + TagSize,
{
    fn header_dyn(
        &self,
        unprotected: &mut Header,
        protected: &mut Header,
    ) -> Result<(), CryptoError> {
        self.header(unprotected, protected)
            .map_err(|_| CryptoError::Header)
    }

    fn encrypt_dyn(&mut self, plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        self.encrypt(plaintext, aad)
    }

    fn decrypt_dyn(&mut self, ciphertext: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
        self.decrypt(ciphertext, aad).ok()
    }
}

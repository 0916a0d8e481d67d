// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! AES-CCM ciphers for the COSE_Encrypt0 structures that carry access tokens and encrypted `cnf`
//! keys
//!
//! Derived from <https://gist.github.com/falko17/3639876b57744c6dd2a166b5bc9cc126>
//! (SPDX-License-Identifier: MIT OR Apache-2.0, Copyright (c) 2022 The NAMIB Project Developers),
//! generalized over the COSE algorithm label and the CCM tag length.

use aead::generic_array::{ArrayLength, GenericArray};
use aead::{Aead, Key, KeyInit, Payload};
use aes::cipher::{Block, BlockCipher, BlockEncrypt};
use ccm::consts::U16;
use ccm::{Ccm, NonceSize, TagSize};
use coset::{iana, Algorithm, Header};
use dcaf::error::CoseCipherError;
use dcaf::token::CoseCipherCommon;
use dcaf::CoseEncrypt0Cipher;

pub struct RustCryptoCcmCoseCipher<C, M, N>
where
    C: BlockCipher<BlockSize = U16> + BlockEncrypt + KeyInit,
    C::BlockSize: ArrayLength<Block<C>>,
    M: ArrayLength<u8> + TagSize,
    N: ArrayLength<u8> + NonceSize,
{
    key: Key<Ccm<C, M, N>>,
    nonce: GenericArray<u8, N>,
    alg: iana::Algorithm,
}

impl<C, M, N> RustCryptoCcmCoseCipher<C, M, N>
where
    C: BlockCipher<BlockSize = U16> + BlockEncrypt + KeyInit,
    C::BlockSize: ArrayLength<Block<C>>,
    M: ArrayLength<u8> + TagSize,
    N: ArrayLength<u8> + NonceSize,
{
    /// Create a cipher for one message
    ///
    /// `alg` is only announced in headers; it is up to the caller to pick the `C`, `M` and `N`
    /// that match it.
    pub fn new(
        key: Key<Ccm<C, M, N>>,
        nonce: GenericArray<u8, N>,
        alg: iana::Algorithm,
    ) -> RustCryptoCcmCoseCipher<C, M, N> {
        RustCryptoCcmCoseCipher { key, nonce, alg }
    }
}

impl<C, M, N> CoseCipherCommon for RustCryptoCcmCoseCipher<C, M, N>
where
    C: BlockCipher<BlockSize = U16> + BlockEncrypt + KeyInit,
    C::BlockSize: ArrayLength<Block<C>>,
    M: ArrayLength<u8> + TagSize,
    N: ArrayLength<u8> + NonceSize,
{
    type Error = aead::Error;

    /// Announce the algorithm in the protected and the IV in the unprotected header, which is
    /// where peers look for them (RFC9052 Section 5.3)
    fn header(
        &self,
        unprotected_header: &mut Header,
        protected_header: &mut Header,
    ) -> Result<(), CoseCipherError<Self::Error>> {
        if !protected_header.iv.is_empty() || !unprotected_header.iv.is_empty() {
            return Err(CoseCipherError::existing_header("iv"));
        }
        if protected_header.alg.is_some() || unprotected_header.alg.is_some() {
            return Err(CoseCipherError::existing_header("alg"));
        }
        protected_header.alg = Some(Algorithm::Assigned(self.alg));
        unprotected_header.iv = self.nonce.to_vec();
        Ok(())
    }
}

impl<C, M, N> CoseEncrypt0Cipher for RustCryptoCcmCoseCipher<C, M, N>
where
    C: BlockCipher<BlockSize = U16> + BlockEncrypt + KeyInit,
    C::BlockSize: ArrayLength<Block<C>>,
    M: ArrayLength<u8> + TagSize,
    N: ArrayLength<u8> + NonceSize,
{
    fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        let ccm_instance = Ccm::<C, M, N>::new(&self.key);
        ccm_instance
            .encrypt(
                &self.nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .expect("error during encryption")
    }

    fn decrypt(
        &mut self,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CoseCipherError<<Self as CoseCipherCommon>::Error>> {
        let ccm_instance = Ccm::<C, M, N>::new(&self.key);
        ccm_instance
            .decrypt(
                &self.nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_e| CoseCipherError::DecryptionFailure)
    }
}

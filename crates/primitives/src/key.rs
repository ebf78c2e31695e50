// Copyright 2024 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alloy_primitives::{keccak256, Address, B256};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use thiserror::Error as ThisError;
use zeroize::Zeroizing;

/// Error returned by [Key] construction and signing.
#[derive(Debug, ThisError)]
pub enum KeyError {
    /// The secret scalar was zero or out of range.
    #[error("invalid secret key")]
    InvalidSecret,
    /// The public key bytes were not a valid SEC1 point.
    #[error("invalid public key")]
    InvalidPublic,
    /// A signing operation was requested on a public-only key.
    #[error("key holds no secret")]
    MissingSecret,
    /// The curve rejected the signing request.
    #[error("signing failed")]
    SigningFailed,
}

/// A secp256k1 key pair that may hold only the public half.
///
/// Public-only keys support address derivation and serialization; signing
/// requires the secret and fails with [KeyError::MissingSecret] otherwise.
#[derive(Clone)]
pub struct Key {
    secret: Option<SigningKey>,
    public: VerifyingKey,
}

impl Key {
    /// Creates a full key pair from a 32-byte secret scalar.
    pub fn from_secret(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let secret = SigningKey::from_bytes(bytes.into()).map_err(|_| KeyError::InvalidSecret)?;
        let public = *secret.verifying_key();
        Ok(Self {
            secret: Some(secret),
            public,
        })
    }

    /// Creates a public-only key from 33-byte compressed or 65-byte
    /// uncompressed SEC1 bytes.
    pub fn from_public(bytes: &[u8]) -> Result<Self, KeyError> {
        let public = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| KeyError::InvalidPublic)?;
        Ok(Self {
            secret: None,
            public,
        })
    }

    /// Whether this key can sign.
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// The raw secret scalar, zeroized on drop.
    pub fn secret_bytes(&self) -> Option<Zeroizing<[u8; 32]>> {
        self.secret
            .as_ref()
            .map(|sk| Zeroizing::new(sk.to_bytes().into()))
    }

    /// 33-byte compressed SEC1 serialization.
    pub fn public_compressed(&self) -> [u8; 33] {
        let point = self.public.to_encoded_point(true);
        point.as_bytes().try_into().expect("compressed point is 33 bytes")
    }

    /// 65-byte uncompressed SEC1 serialization (leading 0x04).
    pub fn public_uncompressed(&self) -> [u8; 65] {
        let point = self.public.to_encoded_point(false);
        point.as_bytes().try_into().expect("uncompressed point is 65 bytes")
    }

    /// Derives the Ethereum address: the low 20 bytes of the Keccak-256 of the
    /// uncompressed public key without its 0x04 prefix.
    pub fn ethereum_address(&self) -> Address {
        let uncompressed = self.public_uncompressed();
        let hash = keccak256(&uncompressed[1..]);
        Address::from_slice(&hash[12..])
    }

    /// Signs a 32-byte prehash, returning `(recovery_id, r, s)` with a
    /// low-`s` normalized signature.
    pub fn sign_prehash(&self, digest: &B256) -> Result<(u8, [u8; 32], [u8; 32]), KeyError> {
        let secret = self.secret.as_ref().ok_or(KeyError::MissingSecret)?;
        let (signature, recid): (EcdsaSignature, RecoveryId) = secret
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|_| KeyError::SigningFailed)?;
        let r: [u8; 32] = signature.r().to_bytes().into();
        let s: [u8; 32] = signature.s().to_bytes().into();
        Ok((recid.to_byte(), r, s))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for Key {}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("public", &alloy_primitives::hex::encode(self.public_compressed()))
            .field("has_secret", &self.has_secret())
            .finish()
    }
}

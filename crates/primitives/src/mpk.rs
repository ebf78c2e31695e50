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

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::Network;
use thiserror::Error as ThisError;

/// Exact length of a serialized master public key.
pub const MPK_SERIALIZED_LEN: usize = 78;

/// Error returned by [MasterPublicKey] operations.
#[derive(Debug, ThisError)]
pub enum MpkError {
    /// The seed could not seed a master key.
    #[error("invalid seed")]
    InvalidSeed,
    /// Fewer than [MPK_SERIALIZED_LEN] bytes remained in the buffer.
    #[error("truncated master public key: {0} bytes remain")]
    Truncated(usize),
    /// The serialized bytes did not decode as an extended public key.
    #[error("invalid master public key encoding")]
    InvalidEncoding,
    /// A child index was out of range for non-hardened derivation.
    #[error("invalid derivation index {0}")]
    InvalidIndex(u32),
}

/// A BIP-32 master public key: the account-level extended public key
/// (chain `m/0'`), from which receive (`0/i`) and change (`1/i`) addresses
/// derive without private material.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MasterPublicKey {
    xpub: Xpub,
}

impl MasterPublicKey {
    /// Derives the master public key from a 512-bit seed: master key, then the
    /// hardened account child `0'`, then the public half.
    pub fn from_seed(seed: &[u8; 64], network: Network) -> Result<Self, MpkError> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed).map_err(|_| MpkError::InvalidSeed)?;
        let account = master
            .derive_priv(&secp, &[ChildNumber::Hardened { index: 0 }])
            .map_err(|_| MpkError::InvalidSeed)?;
        Ok(Self {
            xpub: Xpub::from_priv(&secp, &account),
        })
    }

    pub fn from_xpub(xpub: Xpub) -> Self {
        Self { xpub }
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    /// Fingerprint of this key (first four bytes of its hash160).
    pub fn fingerprint(&self) -> [u8; 4] {
        self.xpub.fingerprint().to_bytes()
    }

    /// The fixed 78-byte BIP-32 serialization.
    pub fn serialize(&self) -> [u8; MPK_SERIALIZED_LEN] {
        self.xpub.encode()
    }

    /// Parses a master public key from the head of `buf`, returning the key
    /// and the number of bytes consumed. Never reads past `buf`.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), MpkError> {
        if buf.len() < MPK_SERIALIZED_LEN {
            return Err(MpkError::Truncated(buf.len()));
        }
        let xpub = Xpub::decode(&buf[..MPK_SERIALIZED_LEN]).map_err(|_| MpkError::InvalidEncoding)?;
        Ok((Self { xpub }, MPK_SERIALIZED_LEN))
    }

    /// Public key at the non-hardened path `chain/index` below this key.
    /// `chain` 0 is the receive chain, 1 the change chain.
    pub fn pubkey_at(&self, chain: u32, index: u32) -> Result<CompressedPublicKey, MpkError> {
        let secp = Secp256k1::verification_only();
        let path = [
            ChildNumber::from_normal_idx(chain).map_err(|_| MpkError::InvalidIndex(chain))?,
            ChildNumber::from_normal_idx(index).map_err(|_| MpkError::InvalidIndex(index))?,
        ];
        let child = self
            .xpub
            .derive_pub(&secp, &path)
            .map_err(|_| MpkError::InvalidIndex(index))?;
        Ok(child.to_pub())
    }

    /// First 32 hex characters of the double-SHA-256 of the serialization;
    /// stable across processes, used as an on-disk folder name.
    pub fn identifier(&self) -> String {
        let digest = crate::sha256_double(self.serialize());
        let mut hex = alloy_primitives::hex::encode(digest);
        hex.truncate(32);
        hex
    }
}

/// Derives the account-level signing key (`m/0'`) matching
/// [MasterPublicKey::from_seed]. Callers must wipe `seed` when done.
pub fn account_signing_key(seed: &[u8; 64], network: Network) -> Result<Xpriv, MpkError> {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(network, seed).map_err(|_| MpkError::InvalidSeed)?;
    master
        .derive_priv(&secp, &[ChildNumber::Hardened { index: 0 }])
        .map_err(|_| MpkError::InvalidSeed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phrase;

    fn test_mpk() -> MasterPublicKey {
        let seed = phrase::derive_seed(
            "ginger settle marine tissue robot crane night number ramp coast roast critic",
        )
        .unwrap();
        MasterPublicKey::from_seed(seed.as_bytes(), Network::Testnet).unwrap()
    }

    #[test]
    fn serialize_roundtrip() {
        let mpk = test_mpk();
        let bytes = mpk.serialize();
        let (parsed, used) = MasterPublicKey::parse(&bytes).unwrap();
        assert_eq!(used, MPK_SERIALIZED_LEN);
        assert_eq!(parsed, mpk);
    }

    #[test]
    fn parse_respects_buffer_length() {
        let mpk = test_mpk();
        let bytes = mpk.serialize();
        assert!(matches!(
            MasterPublicKey::parse(&bytes[..40]),
            Err(MpkError::Truncated(40))
        ));
    }

    #[test]
    fn derivation_is_deterministic() {
        let mpk = test_mpk();
        assert_eq!(
            mpk.pubkey_at(0, 0).unwrap(),
            test_mpk().pubkey_at(0, 0).unwrap()
        );
        assert_ne!(
            mpk.pubkey_at(0, 0).unwrap(),
            mpk.pubkey_at(1, 0).unwrap()
        );
    }

    #[test]
    fn identifier_is_32_hex_chars() {
        let id = test_mpk().identifier();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}

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

//! The Ethereum chain family: the account with its nonce counter, ERC-20
//! token records, and legacy (EIP-155) transaction construction and signing.

use alloy_primitives::{keccak256, Address as EthAddress, U256};
use alloy_rlp::{Encodable, Header};
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::secp256k1::Secp256k1;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error as ThisError;
use walletkit_primitives::key::Key;
use walletkit_primitives::phrase::Seed;
use walletkit_primitives::TxHash;

/// `transfer(address,uint256)`.
pub const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Error returned by Ethereum account and transaction operations.
#[derive(Debug, ThisError)]
pub enum EthError {
    #[error("account derivation failed")]
    Derivation,
    #[error("signing requires private material")]
    MissingSecret,
    #[error("transaction is not signed")]
    NotSigned,
}

/// The single Ethereum account of a wallet core instance: key pair (possibly
/// public-only), its primary address, and the outgoing nonce counter.
#[derive(Debug)]
pub struct EthAccount {
    key: Key,
    address: EthAddress,
    nonce: AtomicU64,
}

impl EthAccount {
    /// Derives the account key at `m/44'/60'/0'/0/0`.
    pub fn from_seed(seed: &Seed) -> Result<Self, EthError> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(bitcoin::NetworkKind::Main, seed.as_bytes())
            .map_err(|_| EthError::Derivation)?;
        let path = [
            ChildNumber::Hardened { index: 44 },
            ChildNumber::Hardened { index: 60 },
            ChildNumber::Hardened { index: 0 },
            ChildNumber::Normal { index: 0 },
            ChildNumber::Normal { index: 0 },
        ];
        let child = master
            .derive_priv(&secp, &path)
            .map_err(|_| EthError::Derivation)?;
        let key = Key::from_secret(&child.private_key.secret_bytes())
            .map_err(|_| EthError::Derivation)?;
        Ok(Self::from_key(key))
    }

    /// Wraps an existing key; used when rebuilding from a serialized public
    /// key, in which case signing is unavailable.
    pub fn from_key(key: Key) -> Self {
        let address = key.ethereum_address();
        Self {
            key,
            address,
            nonce: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> EthAddress {
        self.address
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// 65-byte uncompressed public key, the account-serialization form.
    pub fn public_uncompressed(&self) -> [u8; 65] {
        self.key.public_uncompressed()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce.load(Ordering::Acquire)
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.nonce.store(nonce, Ordering::Release);
    }

    pub fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::AcqRel)
    }
}

/// An installed ERC-20 token: the issuing contract plus display metadata and
/// default gas settings.
#[derive(Clone, Debug)]
pub struct EthToken {
    pub contract: EthAddress,
    pub code: String,
    pub name: String,
    pub decimals: u8,
    pub gas_limit: u64,
    pub gas_price_wei: U256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthSignature {
    /// EIP-155: `35 + 2 * chain_id + recovery_id`.
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

/// A legacy Ethereum transaction under construction inside a transfer.
#[derive(Clone, Debug)]
pub struct EthTransferPayload {
    pub nonce: u64,
    pub gas_price_wei: U256,
    pub gas_limit: u64,
    pub to: EthAddress,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: u64,
    pub signature: Option<EthSignature>,
}

impl EthTransferPayload {
    fn rlp_encode(&self, signature: Option<&EthSignature>) -> Vec<u8> {
        let mut payload = Vec::new();
        self.nonce.encode(&mut payload);
        self.gas_price_wei.encode(&mut payload);
        self.gas_limit.encode(&mut payload);
        self.to.encode(&mut payload);
        self.value.encode(&mut payload);
        self.data.as_slice().encode(&mut payload);
        match signature {
            // EIP-155 pre-signing tail: (chain_id, 0, 0)
            None => {
                self.chain_id.encode(&mut payload);
                0u8.encode(&mut payload);
                0u8.encode(&mut payload);
            }
            Some(sig) => {
                sig.v.encode(&mut payload);
                sig.r.encode(&mut payload);
                sig.s.encode(&mut payload);
            }
        }
        let mut out = Vec::with_capacity(payload.len() + 4);
        Header {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// Keccak of the EIP-155 pre-image.
    pub fn signing_hash(&self) -> TxHash {
        keccak256(self.rlp_encode(None))
    }

    /// Signs in place and returns the transaction hash (keccak of the signed
    /// RLP form).
    pub fn sign(&mut self, key: &Key) -> Result<TxHash, EthError> {
        let digest = self.signing_hash();
        let (recid, r, s) = key.sign_prehash(&digest).map_err(|_| EthError::MissingSecret)?;
        self.signature = Some(EthSignature {
            v: 35 + 2 * self.chain_id + u64::from(recid),
            r: U256::from_be_bytes(r),
            s: U256::from_be_bytes(s),
        });
        Ok(keccak256(self.raw_signed()?))
    }

    /// The signed wire bytes for submission.
    pub fn raw_signed(&self) -> Result<Vec<u8>, EthError> {
        match &self.signature {
            Some(sig) => Ok(self.rlp_encode(Some(sig))),
            None => Err(EthError::NotSigned),
        }
    }

    pub fn hash(&self) -> Result<TxHash, EthError> {
        Ok(keccak256(self.raw_signed()?))
    }
}

/// ABI-encodes an ERC-20 `transfer(to, amount)` call.
pub fn erc20_transfer_data(to: EthAddress, amount: U256) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 + 32);
    data.extend_from_slice(&ERC20_TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(to.as_slice());
    data.extend_from_slice(&amount.to_be_bytes::<32>());
    data
}

/// The Ethereum sub-wallet: either the ether wallet or one token wallet of
/// the shared account.
#[derive(Debug)]
pub struct EthWallet {
    pub account: std::sync::Arc<EthAccount>,
    pub token: Option<EthToken>,
    pub chain_id: u64,
    balance: Mutex<U256>,
}

impl EthWallet {
    pub fn new(account: std::sync::Arc<EthAccount>, token: Option<EthToken>, chain_id: u64) -> Self {
        Self {
            account,
            token,
            chain_id,
            balance: Mutex::new(U256::ZERO),
        }
    }

    /// Ether balance in wei, or the token quantity for a token wallet.
    pub fn balance(&self) -> U256 {
        *self.balance.lock().unwrap()
    }

    pub fn set_balance(&self, balance: U256) {
        *self.balance.lock().unwrap() = balance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use walletkit_primitives::phrase;

    const PAPER_KEY: &str =
        "ginger settle marine tissue robot crane night number ramp coast roast critic";

    fn account() -> EthAccount {
        EthAccount::from_seed(&phrase::derive_seed(PAPER_KEY).unwrap()).unwrap()
    }

    #[test]
    fn account_from_public_key_matches_primary_address() {
        let full = account();
        let public = EthAccount::from_key(Key::from_public(&full.public_uncompressed()).unwrap());
        assert_eq!(full.address(), public.address());
        assert!(!public.key().has_secret());
    }

    #[test]
    fn erc20_transfer_call_data() {
        let to = address!("932a27e1bc84f5b74c29af3d888926b1307f4a5c");
        // 5968.77 tokens at 18 decimals, exactly.
        let amount = U256::from_str_radix("5968770000000000000000", 10).unwrap();
        let data = erc20_transfer_data(to, amount);
        assert_eq!(data.len(), 68);
        assert_eq!(&data[..4], &ERC20_TRANSFER_SELECTOR);
        assert_eq!(&data[4..16], &[0u8; 12]);
        assert_eq!(&data[16..36], to.as_slice());
        assert_eq!(U256::from_be_slice(&data[36..]), amount);
    }

    #[test]
    fn token_transfer_signs_and_recovers() {
        let account = account();
        let contract = address!("558ec3152e2eb2174905cd19aea4e34a23de9ad6");
        let target = address!("932a27e1bc84f5b74c29af3d888926b1307f4a5c");
        let amount = U256::from_str_radix("5968770000000000000000", 10).unwrap();

        let mut payload = EthTransferPayload {
            nonce: 0,
            gas_price_wei: U256::from(50_000_000_000u64),
            gas_limit: 74858,
            to: contract,
            value: U256::ZERO,
            data: erc20_transfer_data(target, amount),
            chain_id: 1,
            signature: None,
        };
        let digest = payload.signing_hash();
        let hash = payload.sign(account.key()).unwrap();
        assert_eq!(payload.hash().unwrap(), hash);

        // EIP-155 v for mainnet, and the signature recovers the account.
        let sig = payload.signature.unwrap();
        assert!(sig.v == 37 || sig.v == 38);
        let recid = RecoveryId::try_from((sig.v - 37) as u8).unwrap();
        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(&sig.r.to_be_bytes::<32>());
        compact[32..].copy_from_slice(&sig.s.to_be_bytes::<32>());
        let signature = EcdsaSignature::from_slice(&compact).unwrap();
        let recovered =
            VerifyingKey::recover_from_prehash(digest.as_slice(), &signature, recid).unwrap();
        let recovered_key = Key::from_public(recovered.to_encoded_point(false).as_bytes()).unwrap();
        assert_eq!(recovered_key.ethereum_address(), account.address());
    }

    #[test]
    fn unsigned_raw_is_an_error() {
        let payload = EthTransferPayload {
            nonce: 0,
            gas_price_wei: U256::ZERO,
            gas_limit: 21000,
            to: EthAddress::ZERO,
            value: U256::from(1),
            data: vec![],
            chain_id: 1,
            signature: None,
        };
        assert!(matches!(payload.raw_signed(), Err(EthError::NotSigned)));
    }

    #[test]
    fn nonce_counter_advances() {
        let account = account();
        account.set_nonce(5);
        assert_eq!(account.next_nonce(), 5);
        assert_eq!(account.nonce(), 6);
    }
}

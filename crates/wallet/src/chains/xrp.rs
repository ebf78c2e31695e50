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

//! The built-in generic-chain handler: XRP.
//!
//! Accounts derive at `m/44'/144'/0'/0/0`; classic addresses are the
//! base58-check of `0x00 || hash160(pubkey)` under the Ripple alphabet. The
//! on-wire transaction codec is intentionally opaque here: transfers carry a
//! canonical JSON envelope whose double-SHA-256 is the transfer hash.

use crate::address::{Address, GenericAddress};
use crate::amount::Amount;
use crate::chains::gen::{GenAccount, GenTransferPayload};
use crate::feebasis::FeeBasis;
use crate::handlers::{ChainHandler, HandlerError};
use alloy_primitives::U256;
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::Secp256k1;
use walletkit_primitives::key::Key;
use walletkit_primitives::phrase::Seed;
use walletkit_primitives::{sha256_double, TxHash, B256};

pub const CHAIN_TYPE_XRP: &str = "xrp";

/// Ten drops, the well-known base transaction cost.
const DEFAULT_FEE_DROPS: u64 = 10;

const BTC_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const XRP_ALPHABET: &[u8; 58] = b"rpshnaf39wBUDNEGHJKLM4PQRST7VWXYZ2bcdeCg65jkm8oFqi1tuvAxyz";

/// Base58-check is positional, so re-alphabeting is a per-character map.
fn to_ripple_alphabet(text: &str) -> String {
    text.bytes()
        .map(|b| {
            let index = BTC_ALPHABET.iter().position(|c| *c == b).expect("base58 digit");
            XRP_ALPHABET[index] as char
        })
        .collect()
}

fn from_ripple_alphabet(text: &str) -> Option<String> {
    text.bytes()
        .map(|b| {
            XRP_ALPHABET
                .iter()
                .position(|c| *c == b)
                .map(|index| BTC_ALPHABET[index] as char)
        })
        .collect()
}

fn classic_address(key: &Key) -> GenericAddress {
    let digest = hash160::Hash::hash(&key.public_compressed());
    let mut payload = vec![0u8];
    payload.extend_from_slice(digest.as_byte_array());
    let display = to_ripple_alphabet(&bitcoin::base58::encode_check(&payload));
    GenericAddress {
        chain: CHAIN_TYPE_XRP.to_string(),
        bytes: digest.as_byte_array().to_vec(),
        display,
    }
}

fn signing_key(seed: &Seed) -> Result<Key, HandlerError> {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(bitcoin::NetworkKind::Main, seed.as_bytes())
        .map_err(|_| HandlerError::InvalidAccount)?;
    let path = [
        ChildNumber::Hardened { index: 44 },
        ChildNumber::Hardened { index: 144 },
        ChildNumber::Hardened { index: 0 },
        ChildNumber::Normal { index: 0 },
        ChildNumber::Normal { index: 0 },
    ];
    let child = master
        .derive_priv(&secp, &path)
        .map_err(|_| HandlerError::InvalidAccount)?;
    Key::from_secret(&child.private_key.secret_bytes()).map_err(|_| HandlerError::InvalidAccount)
}

pub struct XrpHandler;

impl ChainHandler for XrpHandler {
    fn chain_type(&self) -> &'static str {
        CHAIN_TYPE_XRP
    }

    fn account_create(&self, seed: &Seed) -> Result<GenAccount, HandlerError> {
        let key = signing_key(seed)?;
        let address = classic_address(&key);
        Ok(GenAccount {
            chain: CHAIN_TYPE_XRP,
            key,
            address,
        })
    }

    fn account_create_with_public_key(&self, key: Key) -> Result<GenAccount, HandlerError> {
        let address = classic_address(&key);
        Ok(GenAccount {
            chain: CHAIN_TYPE_XRP,
            key,
            address,
        })
    }

    fn account_create_with_serialization(&self, bytes: &[u8]) -> Result<GenAccount, HandlerError> {
        if bytes.len() != 33 {
            return Err(HandlerError::InvalidAccount);
        }
        let key = Key::from_public(bytes).map_err(|_| HandlerError::InvalidAccount)?;
        self.account_create_with_public_key(key)
    }

    fn account_address(&self, account: &GenAccount) -> Address {
        Address::Generic(account.address.clone())
    }

    fn account_serialize(&self, account: &GenAccount) -> Vec<u8> {
        account.key.public_compressed().to_vec()
    }

    fn address_parse(&self, text: &str) -> Result<Address, HandlerError> {
        let translated = from_ripple_alphabet(text)
            .ok_or_else(|| HandlerError::InvalidAddress(text.to_string()))?;
        let payload = bitcoin::base58::decode_check(&translated)
            .map_err(|_| HandlerError::InvalidAddress(text.to_string()))?;
        match payload.split_first() {
            Some((&0u8, bytes)) if bytes.len() == 20 => Ok(Address::Generic(GenericAddress {
                chain: CHAIN_TYPE_XRP.to_string(),
                bytes: bytes.to_vec(),
                display: text.to_string(),
            })),
            _ => Err(HandlerError::InvalidAddress(text.to_string())),
        }
    }

    fn transfer_create(
        &self,
        account: &GenAccount,
        target: &Address,
        amount: &Amount,
        fee_basis: &FeeBasis,
    ) -> Result<GenTransferPayload, HandlerError> {
        let target = match target {
            Address::Generic(inner) if inner.chain == CHAIN_TYPE_XRP => inner.clone(),
            other => return Err(HandlerError::InvalidAddress(other.to_string())),
        };
        let fee = match fee_basis {
            FeeBasis::Generic { .. } => fee_basis.fee(),
            _ => Some(U256::from(DEFAULT_FEE_DROPS)),
        };
        Ok(GenTransferPayload {
            chain: CHAIN_TYPE_XRP,
            uids: format!("{}:{}", account.address.display, target.display),
            source: account.address.clone(),
            target,
            amount: amount.base_value(),
            fee,
            hash: None,
            raw: None,
        })
    }

    fn transfer_sign(
        &self,
        payload: &mut GenTransferPayload,
        seed: &Seed,
    ) -> Result<TxHash, HandlerError> {
        let key = signing_key(seed)?;
        let envelope = serde_json::json!({
            "account": payload.source.display,
            "destination": payload.target.display,
            "amount": payload.amount.to_string(),
            "fee": payload.fee.unwrap_or(U256::from(DEFAULT_FEE_DROPS)).to_string(),
            "signingPubKey": alloy_primitives::hex::encode(key.public_compressed()),
        });
        let body = serde_json::to_vec(&envelope).expect("envelope serializes");
        let digest = B256::from(sha256_double(&body));
        let (_, r, s) = key.sign_prehash(&digest).map_err(|_| HandlerError::MissingSecret)?;

        let mut raw = body;
        raw.extend_from_slice(&r);
        raw.extend_from_slice(&s);
        let hash = B256::from(sha256_double(&raw));
        payload.raw = Some(raw);
        payload.hash = Some(hash);
        Ok(hash)
    }

    fn transfer_serialize(&self, payload: &GenTransferPayload) -> Vec<u8> {
        payload.raw.clone().unwrap_or_default()
    }

    fn default_fee_basis(&self) -> FeeBasis {
        FeeBasis::Generic {
            price_per_cost_factor: U256::from(DEFAULT_FEE_DROPS),
            cost_factor: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walletkit_primitives::phrase;

    const PAPER_KEY: &str =
        "ginger settle marine tissue robot crane night number ramp coast roast critic";

    fn account() -> GenAccount {
        let seed = phrase::derive_seed(PAPER_KEY).unwrap();
        XrpHandler.account_create(&seed).unwrap()
    }

    #[test]
    fn address_is_classic_form() {
        let account = account();
        let display = &account.address.display;
        assert!(display.starts_with('r'), "got {display}");
        assert_eq!(account.address.bytes.len(), 20);
    }

    #[test]
    fn address_parse_roundtrip() {
        let account = account();
        let parsed = XrpHandler.address_parse(&account.address.display).unwrap();
        match parsed {
            Address::Generic(inner) => assert_eq!(inner.bytes, account.address.bytes),
            other => panic!("unexpected address {other:?}"),
        }
    }

    #[test]
    fn public_only_account_matches() {
        let account = account();
        let serialized = XrpHandler.account_serialize(&account);
        let recreated = XrpHandler
            .account_create_with_serialization(&serialized)
            .unwrap();
        assert_eq!(recreated.address.display, account.address.display);
        assert!(!recreated.key.has_secret());
    }

    #[test]
    fn sign_sets_hash_and_raw() {
        let seed = phrase::derive_seed(PAPER_KEY).unwrap();
        let account = account();
        let target = XrpHandler.address_parse(&account.address.display).unwrap();
        let amount_unit = crate::unit::Unit::base(
            crate::currency::Currency::new("xrp:xrp", "XRP", "XRP", "native", None),
            "xrp-drop",
            "Drop",
            "DROP",
        );
        let amount = crate::amount::Amount::from_integer(25, amount_unit).unwrap();
        let mut payload = XrpHandler
            .transfer_create(&account, &target, &amount, &XrpHandler.default_fee_basis())
            .unwrap();
        let hash = XrpHandler.transfer_sign(&mut payload, &seed).unwrap();
        assert_eq!(payload.hash, Some(hash));
        assert!(!XrpHandler.transfer_serialize(&payload).is_empty());
    }
}

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

//! The multi-chain account: key custody for every supported chain family,
//! derived deterministically from one paper key, with a versioned checksummed
//! serialization.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! [0..2)   checksum16   Fletcher-16 over bytes[2..]
//! [2..6)   size32       total byte count
//! [6..8)   version16    currently 2
//! [8..16)  timestamp64
//! then per chain section: size32 + bytes for
//!   the BTC master public key, the uncompressed ETH public key (65),
//!   and the generic-chain account bytes
//! ```

use crate::chains::eth::EthAccount;
use crate::chains::gen::GenAccount;
use crate::chains::xrp::CHAIN_TYPE_XRP;
use crate::handlers;
use std::sync::Arc;
use thiserror::Error as ThisError;
use walletkit_primitives::key::Key;
use walletkit_primitives::mpk::MasterPublicKey;
use walletkit_primitives::phrase::{self, Language, Seed};
use walletkit_primitives::fletcher::fletcher16;

/// Current serialization version. Version 1 carried BTC and ETH; version 2
/// added the generic chain section.
pub const ACCOUNT_SERIALIZE_VERSION: u16 = 2;

/// Error returned by account construction and (de)serialization.
#[derive(Debug, ThisError)]
pub enum AccountError {
    /// The paper key failed BIP-39 validation.
    #[error("invalid paper key")]
    InvalidPhrase,
    /// Key derivation failed for one of the chain families.
    #[error("derivation failed")]
    Derivation,
    /// The OS entropy source was unavailable.
    #[error("entropy source unavailable")]
    Entropy,
    /// The serialization's checksum did not match its content.
    #[error("checksum mismatch")]
    BadChecksum,
    /// The declared size disagreed with the byte count.
    #[error("size mismatch")]
    BadSize,
    /// The serialization is from another version. Not a corruption: the
    /// embedder recovers by re-creating the account from its paper key.
    #[error("version {found} is not {ACCOUNT_SERIALIZE_VERSION}")]
    VersionMismatch { found: u16 },
    /// A section length would overrun the buffer.
    #[error("truncated serialization")]
    Truncated,
    /// A section's bytes did not parse.
    #[error("invalid section")]
    InvalidSection,
}

/// One user's keys across every supported chain, immutable once built.
pub struct Account {
    timestamp: u64,
    uids: String,
    btc: MasterPublicKey,
    eth: Arc<EthAccount>,
    gen: Vec<GenAccount>,
}

pub type AccountRef = Arc<Account>;

/// Reads a `size32`-prefixed section, returning the section bytes and the
/// remainder. Every length is validated against what actually remains.
fn read_section(buf: &[u8]) -> Result<(&[u8], &[u8]), AccountError> {
    if buf.len() < 4 {
        return Err(AccountError::Truncated);
    }
    let size = u32::from_be_bytes(buf[..4].try_into().expect("4 bytes")) as usize;
    let rest = &buf[4..];
    if rest.len() < size {
        return Err(AccountError::Truncated);
    }
    Ok((&rest[..size], &rest[size..]))
}

fn write_section(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

impl Account {
    /// Draws 128 bits of OS entropy and encodes a 12-word paper key.
    pub fn generate_paper_key() -> Result<String, AccountError> {
        phrase::generate(Language::English).map_err(|_| AccountError::Entropy)
    }

    /// Checks words and checksum against the wordlist.
    pub fn validate_paper_key(paper_key: &str) -> bool {
        phrase::validate(Language::English, paper_key)
    }

    /// The 512-bit seed behind `paper_key`.
    pub fn derive_seed(paper_key: &str) -> Result<Seed, AccountError> {
        phrase::derive_seed(paper_key).map_err(|_| AccountError::InvalidPhrase)
    }

    /// Creates the account from a paper key. Installs the built-in chain
    /// handlers on first use.
    pub fn create(
        paper_key: &str,
        timestamp: u64,
        uids: impl Into<String>,
    ) -> Result<AccountRef, AccountError> {
        let seed = Self::derive_seed(paper_key)?;
        Self::from_seed(&seed, timestamp, uids)
    }

    pub fn from_seed(
        seed: &Seed,
        timestamp: u64,
        uids: impl Into<String>,
    ) -> Result<AccountRef, AccountError> {
        handlers::install_builtin();

        let btc = MasterPublicKey::from_seed(seed.as_bytes(), bitcoin::Network::Bitcoin)
            .map_err(|_| AccountError::Derivation)?;
        let eth = EthAccount::from_seed(seed).map_err(|_| AccountError::Derivation)?;
        let gen = handlers::installed()
            .iter()
            .map(|handler| handler.account_create(seed))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| AccountError::Derivation)?;

        Ok(Arc::new(Self {
            timestamp,
            uids: uids.into(),
            btc,
            eth: Arc::new(eth),
            gen,
        }))
    }

    /// Rebuilds an account from [Account::serialize] output.
    ///
    /// Any checksum, size, or section failure yields an error and no account.
    /// A non-current version is reported distinctly; the caller then rebuilds
    /// from the paper key and re-serializes.
    pub fn from_serialization(bytes: &[u8], uids: impl Into<String>) -> Result<AccountRef, AccountError> {
        handlers::install_builtin();

        if bytes.len() < 8 {
            return Err(AccountError::Truncated);
        }
        let checksum = u16::from_be_bytes(bytes[0..2].try_into().expect("2 bytes"));
        if checksum != fletcher16(&bytes[2..]) {
            return Err(AccountError::BadChecksum);
        }
        let size = u32::from_be_bytes(bytes[2..6].try_into().expect("4 bytes")) as usize;
        if size != bytes.len() {
            return Err(AccountError::BadSize);
        }
        let version = u16::from_be_bytes(bytes[6..8].try_into().expect("2 bytes"));
        if version != ACCOUNT_SERIALIZE_VERSION {
            return Err(AccountError::VersionMismatch { found: version });
        }

        let rest = &bytes[8..];
        if rest.len() < 8 {
            return Err(AccountError::Truncated);
        }
        let timestamp = u64::from_be_bytes(rest[..8].try_into().expect("8 bytes"));
        let rest = &rest[8..];

        let (btc_bytes, rest) = read_section(rest)?;
        let (btc, used) =
            MasterPublicKey::parse(btc_bytes).map_err(|_| AccountError::InvalidSection)?;
        if used != btc_bytes.len() {
            return Err(AccountError::InvalidSection);
        }

        let (eth_bytes, rest) = read_section(rest)?;
        if eth_bytes.len() != 65 {
            return Err(AccountError::InvalidSection);
        }
        let eth_key = Key::from_public(eth_bytes).map_err(|_| AccountError::InvalidSection)?;
        let eth = EthAccount::from_key(eth_key);

        let (gen_bytes, rest) = read_section(rest)?;
        if !rest.is_empty() {
            return Err(AccountError::BadSize);
        }
        let handler = handlers::lookup(CHAIN_TYPE_XRP).map_err(|_| AccountError::InvalidSection)?;
        let gen = handler
            .account_create_with_serialization(gen_bytes)
            .map_err(|_| AccountError::InvalidSection)?;

        Ok(Arc::new(Self {
            timestamp,
            uids: uids.into(),
            btc,
            eth: Arc::new(eth),
            gen: vec![gen],
        }))
    }

    /// Serializes per the current version's layout.
    pub fn serialize(&self) -> Vec<u8> {
        let btc = self.btc.serialize();
        let eth = self.eth.public_uncompressed();
        let gen = self
            .gen
            .iter()
            .find(|account| account.has_type(CHAIN_TYPE_XRP))
            .map(|account| {
                handlers::lookup(CHAIN_TYPE_XRP)
                    .map(|handler| handler.account_serialize(account))
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        let total = 2 + 4 + 2 + 8 + (4 + btc.len()) + (4 + eth.len()) + (4 + gen.len());
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&[0u8; 2]); // checksum, backfilled below
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&ACCOUNT_SERIALIZE_VERSION.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        write_section(&mut out, &btc);
        write_section(&mut out, &eth);
        write_section(&mut out, &gen);

        let checksum = fletcher16(&out[2..]);
        out[0..2].copy_from_slice(&checksum.to_be_bytes());
        out
    }

    /// Checks that a serialization belongs to this account by comparing its
    /// BTC master-public-key section.
    pub fn validate_serialization(&self, bytes: &[u8]) -> bool {
        // checksum + size + version + timestamp
        let Some(rest) = bytes.get(16..) else {
            return false;
        };
        match read_section(rest) {
            Ok((section, _)) => section == self.btc.serialize(),
            Err(_) => false,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    /// Stable on-disk identifier: the first 32 hex characters of the double
    /// SHA-256 of the BTC master public key's serialization.
    pub fn identifier(&self) -> String {
        self.btc.identifier()
    }

    pub fn btc(&self) -> &MasterPublicKey {
        &self.btc
    }

    pub fn eth(&self) -> &Arc<EthAccount> {
        &self.eth
    }

    pub fn gen(&self, chain: &str) -> Option<&GenAccount> {
        self.gen.iter().find(|account| account.has_type(chain))
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("uids", &self.uids)
            .field("timestamp", &self.timestamp)
            .field("identifier", &self.identifier())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAPER_KEY: &str =
        "ginger settle marine tissue robot crane night number ramp coast roast critic";

    fn account() -> AccountRef {
        Account::create(PAPER_KEY, 1_514_764_800, "test-uids").unwrap()
    }

    #[test]
    fn serialize_roundtrip() {
        let original = account();
        let bytes = original.serialize();
        let rebuilt = Account::from_serialization(&bytes, "test-uids").unwrap();

        assert_eq!(rebuilt.timestamp(), original.timestamp());
        assert_eq!(rebuilt.identifier(), original.identifier());
        assert_eq!(rebuilt.eth().address(), original.eth().address());
        assert_eq!(
            rebuilt.gen("xrp").unwrap().address.display,
            original.gen("xrp").unwrap().address.display
        );
        assert_eq!(rebuilt.serialize(), bytes);
    }

    #[test]
    fn checksum_catches_any_flipped_bit() {
        let bytes = account().serialize();
        for index in 2..bytes.len() {
            for bit in 0..8 {
                let mut corrupt = bytes.clone();
                corrupt[index] ^= 1 << bit;
                assert!(
                    Account::from_serialization(&corrupt, "uids").is_err(),
                    "byte {index} bit {bit} accepted"
                );
            }
        }
    }

    #[test]
    fn version_bump_is_refused_distinctly() {
        let mut bytes = account().serialize();
        bytes[7] = 3;
        // Re-checksum so only the version differs.
        let checksum = fletcher16(&bytes[2..]);
        bytes[0..2].copy_from_slice(&checksum.to_be_bytes());
        assert!(matches!(
            Account::from_serialization(&bytes, "uids"),
            Err(AccountError::VersionMismatch { found: 3 })
        ));
    }

    #[test]
    fn truncation_is_rejected() {
        let bytes = account().serialize();
        for len in [0, 1, 7, 15, 19, bytes.len() - 1] {
            assert!(Account::from_serialization(&bytes[..len], "uids").is_err());
        }
    }

    #[test]
    fn declared_size_must_match() {
        let mut bytes = account().serialize();
        let wrong = (bytes.len() as u32 + 1).to_be_bytes();
        bytes[2..6].copy_from_slice(&wrong);
        let checksum = fletcher16(&bytes[2..]);
        bytes[0..2].copy_from_slice(&checksum.to_be_bytes());
        assert!(matches!(
            Account::from_serialization(&bytes, "uids"),
            Err(AccountError::BadSize)
        ));
    }

    #[test]
    fn validate_serialization_is_account_bound() {
        let ours = account();
        let bytes = ours.serialize();
        assert!(ours.validate_serialization(&bytes));

        let theirs = Account::create(
            "legal winner thank year wave sausage worth useful legal winner thank yellow",
            0,
            "other",
        )
        .unwrap();
        assert!(!theirs.validate_serialization(&bytes));
    }

    #[test]
    fn paper_key_generation_validates() {
        let paper_key = Account::generate_paper_key().unwrap();
        assert!(Account::validate_paper_key(&paper_key));
        assert!(!Account::validate_paper_key("not a valid phrase at all"));
    }

    #[test]
    fn public_rebuild_signs_nothing() {
        let original = account();
        let rebuilt = Account::from_serialization(&original.serialize(), "uids").unwrap();
        assert!(!rebuilt.eth().key().has_secret());
        assert!(!rebuilt.gen("xrp").unwrap().key.has_secret());
    }
}

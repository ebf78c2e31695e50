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

//! Value-level primitives shared by every chain family: hashes, elliptic-curve
//! keys, BIP-32 master public keys, BIP-39 paper keys, and the checksums used
//! by the account wire format.

pub mod fletcher;
pub mod key;
pub mod mpk;
pub mod phrase;

pub use alloy_primitives::{B256, U256};

/// 256-bit transaction identifier.
pub type TxHash = B256;
/// 256-bit block identifier.
pub type BlockHash = B256;

/// Computes SHA-256 twice, the identifier digest used for on-disk names.
pub fn sha256_double(data: impl AsRef<[u8]>) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(Sha256::digest(data)).into()
}

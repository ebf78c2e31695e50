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

//! Chain-neutral records for generic account chains. The handler for the
//! chain interprets them; the core only moves them around.

use crate::address::GenericAddress;
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use walletkit_primitives::key::Key;
use walletkit_primitives::TxHash;

/// A generic chain's account: a key (possibly public-only) and the primary
/// address the handler derived from it.
#[derive(Clone, Debug)]
pub struct GenAccount {
    pub chain: &'static str,
    pub key: Key,
    pub address: GenericAddress,
}

impl GenAccount {
    pub fn has_type(&self, chain: &str) -> bool {
        self.chain == chain
    }
}

/// The handler-defined transaction record inside a generic transfer.
///
/// `raw` holds the signed submission bytes once signing has happened.
#[derive(Clone, Debug)]
pub struct GenTransferPayload {
    pub chain: &'static str,
    pub uids: String,
    pub source: GenericAddress,
    pub target: GenericAddress,
    /// Amount in the chain's base unit.
    pub amount: U256,
    /// Fee in the chain's base unit, when known.
    pub fee: Option<U256>,
    pub hash: Option<TxHash>,
    pub raw: Option<Vec<u8>>,
}

/// The generic sub-wallet: the chain's account plus the balance reported by
/// the chain handler or recovered transfers.
#[derive(Debug)]
pub struct GenWallet {
    pub account: GenAccount,
    balance: std::sync::Mutex<U256>,
}

impl GenWallet {
    pub fn new(account: GenAccount) -> Self {
        Self {
            account,
            balance: std::sync::Mutex::new(U256::ZERO),
        }
    }

    /// Balance in the chain's base unit.
    pub fn balance(&self) -> U256 {
        *self.balance.lock().unwrap()
    }

    pub fn set_balance(&self, balance: U256) {
        *self.balance.lock().unwrap() = balance;
    }
}

/// The JSON-shaped blob a generic transfer persists as; keyed by hash in the
/// file service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenTransferBlob {
    pub uids: String,
    pub hash: String,
    pub source: String,
    pub target: String,
    pub amount: String,
    pub currency: String,
    pub fee: String,
    pub timestamp: u64,
    pub block_height: u64,
    pub errored: bool,
}

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

//! Block records and their data-completion status.

use alloy_primitives::{Address as EthAddress, Bloom, U256};
use serde::{Deserialize, Serialize};
use walletkit_primitives::{BlockHash, TxHash};

/// The header fields the sync core needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub number: u64,
    pub timestamp: u64,
    pub total_difficulty: U256,
    pub logs_bloom: Bloom,
}

impl BlockHeader {
    /// Bloom pre-screen: can this header's logs involve `address`?
    pub fn may_contain_address(&self, address: &EthAddress) -> bool {
        self.logs_bloom.contains_input(alloy_primitives::BloomInput::Raw(address.as_slice()))
    }
}

/// Snapshot of one account at one block; inequality between two block
/// boundaries is what drives the N-ary sync recursion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: U256,
}

/// Status a peer reports for a submitted or pending transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Unknown,
    Queued,
    Pending,
    Included {
        block_hash: BlockHash,
        block_number: u64,
        transaction_index: u64,
        block_timestamp: u64,
    },
    Errored(String),
}

impl TransactionStatus {
    pub fn is_included(&self) -> bool {
        matches!(self, TransactionStatus::Included { .. })
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, TransactionStatus::Errored(_))
    }

    /// Same kind, ignoring payloads; two consecutive same-kind reports of
    /// Included or Errored un-pend a transaction.
    pub fn same_kind(&self, other: &TransactionStatus) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// A transaction of interest for the managed address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BcsTransaction {
    pub hash: TxHash,
    pub source: EthAddress,
    pub target: Option<EthAddress>,
    pub amount: U256,
    pub gas_used: Option<u64>,
    pub status: TransactionStatus,
}

/// A log of interest: identified by its transaction hash and index within
/// that transaction's receipt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BcsLog {
    pub transaction_hash: TxHash,
    pub transaction_index: u64,
    pub address: EthAddress,
    pub topics: Vec<TxHash>,
    pub data: Vec<u8>,
    pub status: TransactionStatus,
}

/// Identity of a log inside the log set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LogKey {
    pub transaction_hash: TxHash,
    pub transaction_index: u64,
}

impl BcsLog {
    pub fn key(&self) -> LogKey {
        LogKey {
            transaction_hash: self.transaction_hash,
            transaction_index: self.transaction_index,
        }
    }
}

/// Completion state of one per-block datum.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DataState<T> {
    /// Not needed for this block.
    #[default]
    Irrelevant,
    Needed,
    Pending,
    Complete(T),
}

impl<T> DataState<T> {
    pub fn is_complete_or_irrelevant(&self) -> bool {
        matches!(self, DataState::Irrelevant | DataState::Complete(_))
    }
}

/// Per-block record: header plus the data gathered for it.
#[derive(Clone, Debug)]
pub struct Block {
    pub header: BlockHeader,
    /// Transactions from the block body that touch the managed address.
    pub transactions: DataState<Vec<BcsTransaction>>,
    /// Logs from the block receipts that touch the managed address.
    pub logs: DataState<Vec<BcsLog>>,
    /// Account state at this block, when requested by a sync.
    pub account: DataState<AccountState>,
    /// Header proof (CHT), when requested. `None` inside Complete means the
    /// proof failed.
    pub proof: DataState<Option<U256>>,
    /// Link toward the head for chained blocks.
    pub next: Option<BlockHash>,
}

impl Block {
    pub fn new(header: BlockHeader) -> Self {
        Self {
            header,
            transactions: DataState::Irrelevant,
            logs: DataState::Irrelevant,
            account: DataState::Irrelevant,
            proof: DataState::Irrelevant,
            next: None,
        }
    }

    /// A block is complete once every needed datum has arrived.
    pub fn is_complete(&self) -> bool {
        self.transactions.is_complete_or_irrelevant()
            && self.logs.is_complete_or_irrelevant()
            && self.account.is_complete_or_irrelevant()
            && self.proof.is_complete_or_irrelevant()
    }
}
